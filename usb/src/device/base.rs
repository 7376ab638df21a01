use crate::error::{ConnectError, TransferError};
use crate::events::ChannelRole;
use async_trait::async_trait;
use log::debug;
use std::fmt::{Display, Formatter};

/// USB class code carried by the vendor specific interfaces.
pub const CLASS_VENDOR_SPECIFIC: u8 = 0xff;

/// USB class code of the CDC data interface used by the class compliant firmware.
pub const CLASS_CDC_DATA: u8 = 0x0a;

/// The only configuration the SB01 exposes.
pub const DEFAULT_CONFIGURATION: u8 = 1;

// The transport a channel talks through. Implemented by the host's USB stack (libusb here), and
// by the scripted link under test. Every method may be called concurrently from the read loop
// and from user initiated operations, so implementations must take &self.
#[async_trait]
pub trait DeviceLink: Send + Sync {
    /// Opens the device. Opening an already open device is not an error.
    async fn open(&self) -> Result<(), TransferError>;

    /// Closes the device, implicitly releasing any claimed interfaces.
    async fn close(&self) -> Result<(), TransferError>;

    /// Describes the active configuration, if the device has one.
    async fn configuration(&self) -> Result<Option<ConfigurationDescriptor>, TransferError>;

    async fn select_configuration(&self, value: u8) -> Result<(), TransferError>;
    async fn claim_interface(&self, interface: u8) -> Result<(), TransferError>;
    async fn release_interface(&self, interface: u8) -> Result<(), TransferError>;

    async fn control_transfer_in(
        &self,
        setup: ControlSetup,
        length: usize,
    ) -> Result<Vec<u8>, TransferError>;

    async fn control_transfer_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransferError>;

    /// Reads up to `length` bytes from the IN endpoint with the given number.
    async fn transfer_in(&self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransferError>;

    /// Writes `data` to the OUT endpoint with the given number.
    async fn transfer_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransferError>;
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RequestType {
    Standard,
    Class,
    Vendor,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Recipient {
    Device,
    Interface,
    Endpoint,
    Other,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Direction {
    In,
    Out,
}

impl Display for Direction {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            Direction::In => write!(f, "IN"),
            Direction::Out => write!(f, "OUT"),
        }
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ControlSetup {
    pub request_type: RequestType,
    pub recipient: Recipient,
    pub request: u8,
    pub value: u16,
    pub index: u16,
}

impl ControlSetup {
    /// A request addressed to one of the device's interfaces.
    pub fn interface(request_type: RequestType, interface: u8, request: u8, value: u16) -> Self {
        Self {
            request_type,
            recipient: Recipient::Interface,
            request,
            value,
            index: interface as u16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigurationDescriptor {
    pub value: u8,
    pub interfaces: Vec<InterfaceDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InterfaceDescriptor {
    pub number: u8,
    pub alternates: Vec<AlternateSetting>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlternateSetting {
    pub setting: u8,
    pub class_code: u8,
    pub endpoints: Vec<EndpointDescriptor>,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EndpointDescriptor {
    pub number: u8,
    pub direction: Direction,
}

impl EndpointDescriptor {
    /// The bEndpointAddress this endpoint is reached through.
    pub fn address(&self) -> u8 {
        match self.direction {
            Direction::In => self.number | 0x80,
            Direction::Out => self.number,
        }
    }
}

impl InterfaceDescriptor {
    pub fn has_class(&self, class_code: u8) -> bool {
        self.alternates.iter().any(|alt| alt.class_code == class_code)
    }
}

impl AlternateSetting {
    pub fn endpoint(&self, direction: Direction) -> Option<EndpointDescriptor> {
        self.endpoints
            .iter()
            .find(|endpoint| endpoint.direction == direction)
            .copied()
    }
}

impl ConfigurationDescriptor {
    /// Interfaces with at least one alternate carrying `class_code`, in descriptor order.
    pub fn interfaces_with_class(&self, class_code: u8) -> Vec<&InterfaceDescriptor> {
        self.interfaces
            .iter()
            .filter(|interface| interface.has_class(class_code))
            .collect()
    }
}

// Opens the device and makes sure configuration 1 is active, returning its descriptor.
pub(crate) async fn activate(link: &dyn DeviceLink) -> Result<ConfigurationDescriptor, ConnectError> {
    link.open().await?;

    let current = link.configuration().await?;
    if let Some(config) = current {
        if config.value == DEFAULT_CONFIGURATION {
            return Ok(config);
        }
    }

    debug!("Device not in configuration {}, selecting it", DEFAULT_CONFIGURATION);
    link.select_configuration(DEFAULT_CONFIGURATION).await?;
    link.configuration().await?.ok_or(ConnectError::Unconfigured)
}

// Picks the interface at `position` among those carrying `class_code`.
pub(crate) fn nth_interface_with_class(
    config: &ConfigurationDescriptor,
    class_code: u8,
    position: usize,
    role: ChannelRole,
) -> Result<&InterfaceDescriptor, ConnectError> {
    config
        .interfaces_with_class(class_code)
        .get(position)
        .copied()
        .ok_or(ConnectError::NoCompatibleInterface {
            role,
            class: class_code,
            position,
        })
}

// Some general information about the device, pulled from its device descriptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UsbData {
    pub(crate) bus_number: u8,
    pub(crate) address: u8,
    pub(crate) vendor_id: u16,
    pub(crate) product_id: u16,
    pub(crate) device_version: (u8, u8, u8),
    pub(crate) product_name: Option<String>,
}

impl UsbData {
    pub fn bus_number(&self) -> u8 {
        self.bus_number
    }
    pub fn address(&self) -> u8 {
        self.address
    }
    pub fn vendor_id(&self) -> u16 {
        self.vendor_id
    }
    pub fn product_id(&self) -> u16 {
        self.product_id
    }
    pub fn device_version(&self) -> (u8, u8, u8) {
        self.device_version
    }
    pub fn product_name(&self) -> Option<&str> {
        self.product_name.as_deref()
    }
}
