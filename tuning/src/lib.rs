//! Reads the `[Exact Tuning]` section of AnaMark `.tun` files and turns it into the per-note cent
//! offsets the SB01 expects, relative to 12 tone equal temperament.

pub mod error;
pub mod tun;

pub use error::TuningError;
pub use tun::{
    ideal_cents, offsets_from_tun, parse, read_tun_file, TuningRange, DEFAULT_END_NOTE,
    DEFAULT_START_NOTE,
};
