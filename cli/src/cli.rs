use clap::{Parser, Subcommand, ValueEnum};
use directories::ProjectDirs;
use sb01_tuning::{DEFAULT_END_NOTE, DEFAULT_START_NOTE};
use sb01_usb::session::StreamMode;
use std::path::PathBuf;
use std::str::FromStr;

#[derive(Parser, Debug)]
#[command(about, version, author)]
pub struct Cli {
    /// Minimum log level to print out
    #[arg(long, value_enum, default_value = "info")]
    pub log_level: LevelFilter,

    /// Location of the configuration file on disk
    #[arg(long, default_value_os_t = default_config_location())]
    pub config: PathBuf,

    /// USB vendor id of the device (decimal or 0x prefixed hex)
    #[arg(long, value_parser = parse_u16)]
    pub vendor_id: Option<u16>,

    /// USB product id of the device (decimal or 0x prefixed hex)
    #[arg(long, value_parser = parse_u16)]
    pub product_id: Option<u16>,

    /// Select the device by its bus and address, as BUS:ADDRESS
    #[arg(long, value_parser = parse_location)]
    pub location: Option<(u8, u8)>,

    /// Streaming personality: disabled, auto, vendor or class-compliant
    #[arg(long, value_parser = parse_stream_mode)]
    pub stream: Option<StreamMode>,

    #[command(subcommand)]
    pub command: SubCommands,
}

#[derive(Subcommand, Debug)]
pub enum SubCommands {
    /// List attached devices matching the configured ids (or all devices without ids)
    List,

    /// Read a configuration register
    Read {
        /// Register address, 0 to 127
        #[arg(value_parser = parse_integer, allow_negative_numbers = true)]
        address: i64,
    },

    /// Write a configuration register
    Write {
        /// Register address, 0 to 127
        #[arg(value_parser = parse_integer, allow_negative_numbers = true)]
        address: i64,

        /// Value to store, 0 to 65535
        #[arg(value_parser = parse_number, allow_negative_numbers = true)]
        value: f64,
    },

    /// Print inbound stream packets until Ctrl+C or a read error
    Monitor {
        /// Stop after this many packets
        #[arg(long)]
        count: Option<usize>,
    },

    /// Send a payload over the stream's outbound endpoint
    Send {
        /// Hex encoded bytes, eg. f07e7f0601f7
        #[arg(value_parser = parse_payload)]
        payload: Payload,
    },

    /// Convert the [Exact Tuning] section of a .tun file into cent offsets
    Tuning {
        file: PathBuf,

        #[arg(long, default_value_t = DEFAULT_START_NOTE)]
        start_note: u8,

        #[arg(long, default_value_t = DEFAULT_END_NOTE)]
        end_note: u8,

        /// Print the table as a JSON array
        #[arg(long)]
        json: bool,
    },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Payload(pub Vec<u8>);

fn default_config_location() -> PathBuf {
    match ProjectDirs::from("com", "Superlative", "SB01-Control") {
        Some(proj_dirs) => proj_dirs.config_dir().join("settings.json"),
        None => PathBuf::from("settings.json"),
    }
}

pub fn parse_integer(value: &str) -> Result<i64, String> {
    let (negative, digits) = match value.strip_prefix('-') {
        Some(digits) => (true, digits),
        None => (false, value),
    };

    let parsed = match digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
    {
        Some(hex) => i64::from_str_radix(hex, 16),
        None => digits.parse::<i64>(),
    }
    .map_err(|e| format!("{}: {}", value, e))?;

    Ok(if negative { -parsed } else { parsed })
}

// Values may be fractional on the way in, the register layer decides whether they're usable.
pub fn parse_number(value: &str) -> Result<f64, String> {
    if let Ok(integer) = parse_integer(value) {
        return Ok(integer as f64);
    }
    value.parse::<f64>().map_err(|e| format!("{}: {}", value, e))
}

fn parse_u16(value: &str) -> Result<u16, String> {
    let parsed = parse_integer(value)?;
    u16::try_from(parsed).map_err(|_| format!("{} does not fit in 16 bits", value))
}

fn parse_location(value: &str) -> Result<(u8, u8), String> {
    let (bus, address) = value
        .split_once(':')
        .ok_or_else(|| format!("Expected BUS:ADDRESS, got {}", value))?;
    let bus = bus.parse::<u8>().map_err(|e| format!("Bus {}: {}", bus, e))?;
    let address = address
        .parse::<u8>()
        .map_err(|e| format!("Address {}: {}", address, e))?;
    Ok((bus, address))
}

fn parse_stream_mode(value: &str) -> Result<StreamMode, String> {
    StreamMode::from_str(value).map_err(|_| {
        format!(
            "Unknown stream mode {}, expected disabled, auto, vendor or class-compliant",
            value
        )
    })
}

pub fn parse_payload(value: &str) -> Result<Payload, String> {
    let nibbles = value
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .map(|c| {
            c.to_digit(16)
                .map(|digit| digit as u8)
                .ok_or_else(|| format!("{:?} in {} is not a hex digit", c, value))
        })
        .collect::<Result<Vec<u8>, String>>()?;
    if nibbles.is_empty() || nibbles.len() % 2 != 0 {
        return Err(format!("{} is not a whole number of hex bytes", value));
    }

    let bytes = nibbles.chunks(2).map(|pair| pair[0] << 4 | pair[1]).collect();
    Ok(Payload(bytes))
}

#[repr(usize)]
#[derive(ValueEnum, Copy, Clone, Eq, PartialEq, Debug)]
pub enum LevelFilter {
    /// A level lower than all log levels.
    Off,
    /// Corresponds to the `Error` log level.
    Error,
    /// Corresponds to the `Warn` log level.
    Warn,
    /// Corresponds to the `Info` log level.
    Info,
    /// Corresponds to the `Debug` log level.
    Debug,
    /// Corresponds to the `Trace` log level.
    Trace,
}

impl From<LevelFilter> for log::LevelFilter {
    fn from(level: LevelFilter) -> Self {
        match level {
            LevelFilter::Off => log::LevelFilter::Off,
            LevelFilter::Error => log::LevelFilter::Error,
            LevelFilter::Warn => log::LevelFilter::Warn,
            LevelFilter::Info => log::LevelFilter::Info,
            LevelFilter::Debug => log::LevelFilter::Debug,
            LevelFilter::Trace => log::LevelFilter::Trace,
        }
    }
}
