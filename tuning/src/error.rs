#[derive(thiserror::Error, Debug)]
pub enum TuningError {
    #[error("Invalid note range {start}..={end}, notes must ascend within 0..=127")]
    InvalidRange { start: u8, end: u8 },

    #[error("IO error: {0}")]
    IOError(#[from] std::io::Error),
}
