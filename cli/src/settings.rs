use anyhow::{Context, Result};
use sb01_usb::devices::TransferTimeouts;
use sb01_usb::events::DEFAULT_EVENT_CAPACITY;
use sb01_usb::session::{SessionOptions, StreamMode};
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::ErrorKind;
use std::path::Path;
use std::time::Duration;

use crate::cli::Cli;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub vendor_id: Option<u16>,
    pub product_id: Option<u16>,
    pub register: bool,
    pub stream: StreamMode,
    pub control_timeout_ms: u64,
    pub bulk_out_timeout_ms: u64,
    pub bulk_in_poll_ms: u64,
    pub event_capacity: usize,
}

impl Default for Settings {
    fn default() -> Self {
        let timeouts = TransferTimeouts::default();
        Self {
            vendor_id: None,
            product_id: None,
            register: true,
            stream: StreamMode::default(),
            control_timeout_ms: timeouts.control.as_millis() as u64,
            bulk_out_timeout_ms: timeouts.bulk_out.as_millis() as u64,
            bulk_in_poll_ms: timeouts.bulk_in_poll.as_millis() as u64,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Settings {
    pub fn read(path: &Path) -> Result<Settings> {
        match File::open(path) {
            Ok(reader) => serde_json::from_reader(reader).context(format!(
                "Could not parse settings file at {}",
                path.to_string_lossy()
            )),
            Err(error) if error.kind() == ErrorKind::NotFound => Ok(Settings::default()),
            Err(error) => Err(error).context(format!(
                "Could not open settings file for reading at {}",
                path.to_string_lossy()
            )),
        }
    }

    pub fn apply_overrides(&mut self, args: &Cli) {
        if args.vendor_id.is_some() {
            self.vendor_id = args.vendor_id;
        }
        if args.product_id.is_some() {
            self.product_id = args.product_id;
        }
        if let Some(stream) = args.stream {
            self.stream = stream;
        }
    }

    /// The id pair to filter devices by, only when both halves are known.
    pub fn device_filter(&self) -> Option<(u16, u16)> {
        self.vendor_id.zip(self.product_id)
    }

    pub fn timeouts(&self) -> TransferTimeouts {
        // Zero would mean 'wait forever' to libusb.
        let millis = |value: u64| Duration::from_millis(value.max(1));
        TransferTimeouts {
            control: millis(self.control_timeout_ms),
            bulk_out: millis(self.bulk_out_timeout_ms),
            bulk_in_poll: millis(self.bulk_in_poll_ms),
        }
    }

    pub fn session_options(&self) -> SessionOptions {
        SessionOptions {
            register: self.register,
            stream: self.stream,
        }
    }
}
