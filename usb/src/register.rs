use crate::device::base::{
    activate, nth_interface_with_class, ControlSetup, DeviceLink, RequestType,
    CLASS_VENDOR_SPECIFIC,
};
use crate::error::{CommandError, ConnectError};
use crate::events::{ChannelRole, DeviceEvent, EventHub};
use byteorder::{ByteOrder, LittleEndian};
use log::{debug, info};
use std::sync::Arc;

pub const MAX_REGISTER_ADDRESS: u8 = 0x7f;

// Writes share the read address space, flagged by the high bit of the request.
const WRITE_FLAG: u8 = 0x80;
const RESPONSE_LENGTH: usize = 64;

/// A validated register address, `0..=127`.
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct RegisterAddress(u8);

impl RegisterAddress {
    pub fn new(address: u8) -> Result<Self, CommandError> {
        if address > MAX_REGISTER_ADDRESS {
            return Err(CommandError::AddressOutOfRange(address as i64));
        }
        Ok(Self(address))
    }

    pub fn get(&self) -> u8 {
        self.0
    }

    fn read_request(&self) -> u8 {
        self.0
    }

    fn write_request(&self) -> u8 {
        self.0 | WRITE_FLAG
    }
}

impl TryFrom<i64> for RegisterAddress {
    type Error = CommandError;

    fn try_from(address: i64) -> Result<Self, Self::Error> {
        match u8::try_from(address) {
            Ok(address) => RegisterAddress::new(address),
            Err(_) => Err(CommandError::AddressOutOfRange(address)),
        }
    }
}

/// A validated register value, for callers holding numbers that may not fit in a u16.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct RegisterValue(u16);

impl RegisterValue {
    pub fn get(&self) -> u16 {
        self.0
    }
}

impl From<u16> for RegisterValue {
    fn from(value: u16) -> Self {
        Self(value)
    }
}

impl TryFrom<i64> for RegisterValue {
    type Error = CommandError;

    fn try_from(value: i64) -> Result<Self, Self::Error> {
        u16::try_from(value)
            .map(Self)
            .map_err(|_| CommandError::ValueOutOfRange(value as f64))
    }
}

impl TryFrom<f64> for RegisterValue {
    type Error = CommandError;

    fn try_from(value: f64) -> Result<Self, Self::Error> {
        if !value.is_finite() || value.fract() != 0.0 {
            return Err(CommandError::FractionalValue(value));
        }
        if !(0.0..=u16::MAX as f64).contains(&value) {
            return Err(CommandError::ValueOutOfRange(value));
        }
        Ok(Self(value as u16))
    }
}

pub struct RegisterChannel {
    link: Arc<dyn DeviceLink>,
    events: EventHub,
    interface: Option<u8>,
}

impl RegisterChannel {
    pub fn new(link: Arc<dyn DeviceLink>, events: EventHub) -> Self {
        Self {
            link,
            events,
            interface: None,
        }
    }

    /// The claimed interface number, once connected.
    pub fn interface(&self) -> Option<u8> {
        self.interface
    }

    pub fn is_connected(&self) -> bool {
        self.interface.is_some()
    }

    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        let config = activate(self.link.as_ref()).await?;

        // The first vendor interface is always the register port.
        let interface =
            nth_interface_with_class(&config, CLASS_VENDOR_SPECIFIC, 0, ChannelRole::Register)?
                .number;

        self.link.claim_interface(interface).await?;
        self.interface = Some(interface);

        info!("Register channel connected on interface {}", interface);
        self.events.emit(DeviceEvent::Connected {
            role: ChannelRole::Register,
        });
        Ok(())
    }

    pub async fn read(&self, address: u8) -> Result<u16, CommandError> {
        self.read_at(RegisterAddress::new(address)?).await
    }

    pub async fn read_at(&self, address: RegisterAddress) -> Result<u16, CommandError> {
        let interface = self.interface.ok_or(CommandError::NotConnected)?;

        // The OUT selects the register, the following IN returns its contents.
        let setup =
            ControlSetup::interface(RequestType::Vendor, interface, address.read_request(), 0);
        self.link.control_transfer_out(setup, &[]).await?;
        let response = self.link.control_transfer_in(setup, RESPONSE_LENGTH).await?;

        if response.len() < 2 {
            return Err(CommandError::ShortResponse(response.len()));
        }

        let value = LittleEndian::read_u16(&response[0..2]);
        debug!("Register {:#04x} read {:#06x}", address.get(), value);
        Ok(value)
    }

    pub async fn write(&self, address: u8, value: u16) -> Result<(), CommandError> {
        self.write_at(RegisterAddress::new(address)?, value).await
    }

    pub async fn write_at(&self, address: RegisterAddress, value: u16) -> Result<(), CommandError> {
        let interface = self.interface.ok_or(CommandError::NotConnected)?;

        let setup =
            ControlSetup::interface(RequestType::Vendor, interface, address.write_request(), value);
        self.link.control_transfer_out(setup, &[]).await?;

        debug!("Register {:#04x} written {:#06x}", address.get(), value);
        Ok(())
    }

    // Closing the device drops the claim on our interface, so it isn't released explicitly.
    pub async fn disconnect(&mut self) -> Result<(), ConnectError> {
        self.interface = None;
        self.link.close().await?;
        info!("Register channel disconnected");
        Ok(())
    }
}
