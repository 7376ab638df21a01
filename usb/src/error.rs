use crate::device::base::Direction;
use crate::events::ChannelRole;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TransferError {
    #[error("Transfer timed out")]
    Timeout,

    #[error("Device has been disconnected")]
    NoDevice,

    #[error("Endpoint stalled")]
    Stall,

    #[error("Device is not open")]
    NotOpen,

    #[error("Resource busy")]
    Busy,

    #[error("USB error: {0}")]
    Usb(String),
}

impl From<rusb::Error> for TransferError {
    fn from(error: rusb::Error) -> Self {
        match error {
            rusb::Error::Timeout => TransferError::Timeout,
            rusb::Error::NoDevice => TransferError::NoDevice,
            rusb::Error::Pipe => TransferError::Stall,
            rusb::Error::Busy => TransferError::Busy,
            other => TransferError::Usb(other.to_string()),
        }
    }
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConnectError {
    #[error("No SB01 device was found")]
    DeviceNotFound,

    #[error("No compatible {role} interface (wanted class {class:#04x}, match #{position})")]
    NoCompatibleInterface {
        role: ChannelRole,
        class: u8,
        position: usize,
    },

    #[error("Stream interface {interface} has no {direction} endpoint")]
    MissingEndpoint { interface: u8, direction: Direction },

    #[error("Device has no active configuration")]
    Unconfigured,

    #[error("Unable to detect a streaming personality for this device")]
    UnknownPersonality,

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),
}

#[derive(thiserror::Error, Debug, Clone, PartialEq)]
pub enum CommandError {
    #[error("Register address {0} is outside 0..=127")]
    AddressOutOfRange(i64),

    #[error("Register value {0} is outside 0..=65535")]
    ValueOutOfRange(f64),

    #[error("Register value {0} is not an integer")]
    FractionalValue(f64),

    #[error("Malformed response, expected 2 bytes, received {0}")]
    ShortResponse(usize),

    #[error("Channel is not connected")]
    NotConnected,

    #[error("Transfer failed: {0}")]
    Transfer(#[from] TransferError),
}
