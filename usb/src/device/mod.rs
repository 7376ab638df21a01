pub mod base;

// libusb provides the host transport on every platform we build for.
mod libusb;
pub use crate::device::libusb::device::{find_devices, LibUsbLink, TransferTimeouts};

#[cfg(test)]
pub(crate) mod scripted;
