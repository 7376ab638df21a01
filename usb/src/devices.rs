// Public face of the device layer. Sessions and callers work with these types and the DeviceLink
// trait, and shouldn't need to know which USB stack sits underneath.

pub use crate::device::base::{
    AlternateSetting, ConfigurationDescriptor, ControlSetup, DeviceLink, Direction,
    EndpointDescriptor, InterfaceDescriptor, Recipient, RequestType, UsbData, CLASS_CDC_DATA,
    CLASS_VENDOR_SPECIFIC, DEFAULT_CONFIGURATION,
};
pub use crate::device::{find_devices, LibUsbLink, TransferTimeouts};
