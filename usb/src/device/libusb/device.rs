use crate::device::base::{
    AlternateSetting, ConfigurationDescriptor, ControlSetup, DeviceLink, Direction,
    EndpointDescriptor, InterfaceDescriptor, Recipient, RequestType, UsbData,
};
use crate::error::{ConnectError, TransferError};
use async_trait::async_trait;
use log::{debug, info, warn};
use rusb::{Device, DeviceHandle, GlobalContext};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::task;

// libusb treats a zero timeout as 'wait forever'.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct TransferTimeouts {
    pub control: Duration,
    pub bulk_out: Duration,

    // Bulk reads are polled, an expiry here only means no data arrived in time.
    pub bulk_in_poll: Duration,
}

impl Default for TransferTimeouts {
    fn default() -> Self {
        Self {
            control: Duration::from_secs(1),
            bulk_out: Duration::from_secs(1),
            bulk_in_poll: Duration::from_millis(250),
        }
    }
}

type SharedHandle = Arc<RwLock<Option<DeviceHandle<GlobalContext>>>>;

pub struct LibUsbLink {
    device: Device<GlobalContext>,
    handle: SharedHandle,
    timeouts: TransferTimeouts,
}

impl LibUsbLink {
    pub fn new(device: Device<GlobalContext>, timeouts: TransferTimeouts) -> Self {
        Self {
            device,
            handle: Arc::new(RwLock::new(None)),
            timeouts,
        }
    }

    /// Locates a device by its position on the bus.
    pub fn from_location(
        bus_number: u8,
        address: u8,
        timeouts: TransferTimeouts,
    ) -> Result<Self, ConnectError> {
        let devices = rusb::devices().map_err(TransferError::from)?;
        for device in devices.iter() {
            if device.bus_number() == bus_number && device.address() == address {
                return Ok(Self::new(device, timeouts));
            }
        }
        Err(ConnectError::DeviceNotFound)
    }

    /// Locates the first device carrying the given vendor and product ids.
    pub fn first_matching(
        vendor_id: u16,
        product_id: u16,
        timeouts: TransferTimeouts,
    ) -> Result<Self, ConnectError> {
        let devices = rusb::devices().map_err(TransferError::from)?;
        for device in devices.iter() {
            if let Ok(descriptor) = device.device_descriptor() {
                if descriptor.vendor_id() == vendor_id && descriptor.product_id() == product_id {
                    return Ok(Self::new(device, timeouts));
                }
            }
        }
        Err(ConnectError::DeviceNotFound)
    }

    async fn with_handle<T, F>(&self, f: F) -> Result<T, TransferError>
    where
        T: Send + 'static,
        F: FnOnce(&DeviceHandle<GlobalContext>) -> rusb::Result<T> + Send + 'static,
    {
        let handle = self.handle.clone();
        task::spawn_blocking(move || {
            let guard = handle.read().map_err(|_| lock_poisoned())?;
            let handle = guard.as_ref().ok_or(TransferError::NotOpen)?;
            f(handle).map_err(TransferError::from)
        })
        .await
        .map_err(|e| TransferError::Usb(e.to_string()))?
    }

    async fn with_handle_mut<T, F>(&self, f: F) -> Result<T, TransferError>
    where
        T: Send + 'static,
        F: FnOnce(&mut DeviceHandle<GlobalContext>) -> rusb::Result<T> + Send + 'static,
    {
        let handle = self.handle.clone();
        task::spawn_blocking(move || {
            let mut guard = handle.write().map_err(|_| lock_poisoned())?;
            let handle = guard.as_mut().ok_or(TransferError::NotOpen)?;
            f(handle).map_err(TransferError::from)
        })
        .await
        .map_err(|e| TransferError::Usb(e.to_string()))?
    }
}

#[async_trait]
impl DeviceLink for LibUsbLink {
    async fn open(&self) -> Result<(), TransferError> {
        let device = self.device.clone();
        let handle = self.handle.clone();
        task::spawn_blocking(move || {
            let mut guard = handle.write().map_err(|_| lock_poisoned())?;
            if guard.is_some() {
                return Ok(());
            }

            #[allow(unused_mut)]
            let mut opened = device.open()?;
            cfg_if::cfg_if! {
                if #[cfg(target_os = "linux")] {
                    // The class compliant interface is normally bound to cdc_acm.
                    if let Err(error) = opened.set_auto_detach_kernel_driver(true) {
                        warn!("Unable to enable kernel driver auto-detach: {}", error);
                    }
                }
            }

            info!("Opened USB device at {:?}", device);
            *guard = Some(opened);
            Ok(())
        })
        .await
        .map_err(|e| TransferError::Usb(e.to_string()))?
    }

    async fn close(&self) -> Result<(), TransferError> {
        let handle = self.handle.clone();
        task::spawn_blocking(move || {
            let mut guard = handle.write().map_err(|_| lock_poisoned())?;

            // Dropping the handle releases claimed interfaces and closes the device.
            if guard.take().is_some() {
                debug!("Closed USB device");
            }
            Ok(())
        })
        .await
        .map_err(|e| TransferError::Usb(e.to_string()))?
    }

    async fn configuration(&self) -> Result<Option<ConfigurationDescriptor>, TransferError> {
        let active = self.with_handle(|handle| handle.active_configuration()).await?;
        if active == 0 {
            return Ok(None);
        }

        let device = self.device.clone();
        task::spawn_blocking(move || {
            let config = device.active_config_descriptor()?;
            Ok(Some(describe(&config)))
        })
        .await
        .map_err(|e| TransferError::Usb(e.to_string()))?
    }

    async fn select_configuration(&self, value: u8) -> Result<(), TransferError> {
        debug!("Selecting configuration {}", value);
        self.with_handle_mut(move |handle| handle.set_active_configuration(value))
            .await
    }

    async fn claim_interface(&self, interface: u8) -> Result<(), TransferError> {
        debug!("Claiming interface {}", interface);
        self.with_handle_mut(move |handle| handle.claim_interface(interface))
            .await
    }

    async fn release_interface(&self, interface: u8) -> Result<(), TransferError> {
        debug!("Releasing interface {}", interface);
        self.with_handle_mut(move |handle| handle.release_interface(interface))
            .await
    }

    async fn control_transfer_in(
        &self,
        setup: ControlSetup,
        length: usize,
    ) -> Result<Vec<u8>, TransferError> {
        let timeout = self.timeouts.control;
        self.with_handle(move |handle| {
            let mut buf = vec![0; length];
            let response_length = handle.read_control(
                request_type(rusb::Direction::In, &setup),
                setup.request,
                setup.value,
                setup.index,
                &mut buf,
                timeout,
            )?;
            buf.truncate(response_length);
            Ok(buf)
        })
        .await
    }

    async fn control_transfer_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransferError> {
        let timeout = self.timeouts.control;
        let data = data.to_vec();
        self.with_handle(move |handle| {
            handle.write_control(
                request_type(rusb::Direction::Out, &setup),
                setup.request,
                setup.value,
                setup.index,
                &data,
                timeout,
            )
        })
        .await
    }

    async fn transfer_in(&self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransferError> {
        let timeout = self.timeouts.bulk_in_poll;
        let address = EndpointDescriptor {
            number: endpoint,
            direction: Direction::In,
        }
        .address();

        self.with_handle(move |handle| {
            let mut buf = vec![0; length];
            let read = handle.read_bulk(address, &mut buf, timeout)?;
            buf.truncate(read);
            Ok(buf)
        })
        .await
    }

    async fn transfer_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransferError> {
        let timeout = self.timeouts.bulk_out;
        let address = EndpointDescriptor {
            number: endpoint,
            direction: Direction::Out,
        }
        .address();

        let data = data.to_vec();
        self.with_handle(move |handle| handle.write_bulk(address, &data, timeout))
            .await
    }
}

fn lock_poisoned() -> TransferError {
    TransferError::Usb(String::from("Device handle lock poisoned"))
}

fn request_type(direction: rusb::Direction, setup: &ControlSetup) -> u8 {
    let kind = match setup.request_type {
        RequestType::Standard => rusb::RequestType::Standard,
        RequestType::Class => rusb::RequestType::Class,
        RequestType::Vendor => rusb::RequestType::Vendor,
    };
    let recipient = match setup.recipient {
        Recipient::Device => rusb::Recipient::Device,
        Recipient::Interface => rusb::Recipient::Interface,
        Recipient::Endpoint => rusb::Recipient::Endpoint,
        Recipient::Other => rusb::Recipient::Other,
    };
    rusb::request_type(direction, kind, recipient)
}

fn describe(config: &rusb::ConfigDescriptor) -> ConfigurationDescriptor {
    ConfigurationDescriptor {
        value: config.number(),
        interfaces: config
            .interfaces()
            .map(|interface| InterfaceDescriptor {
                number: interface.number(),
                alternates: interface
                    .descriptors()
                    .map(|alternate| AlternateSetting {
                        setting: alternate.setting_number(),
                        class_code: alternate.class_code(),
                        endpoints: alternate
                            .endpoint_descriptors()
                            .map(|endpoint| EndpointDescriptor {
                                number: endpoint.number(),
                                direction: match endpoint.direction() {
                                    rusb::Direction::In => Direction::In,
                                    rusb::Direction::Out => Direction::Out,
                                },
                            })
                            .collect(),
                    })
                    .collect(),
            })
            .collect(),
    }
}

/// Lists attached devices, optionally restricted to a vendor / product id pair.
pub fn find_devices(filter: Option<(u16, u16)>) -> Vec<UsbData> {
    let mut found_devices: Vec<UsbData> = Vec::new();

    if let Ok(devices) = rusb::devices() {
        for device in devices.iter() {
            if let Ok(descriptor) = device.device_descriptor() {
                if let Some((vendor_id, product_id)) = filter {
                    if descriptor.vendor_id() != vendor_id
                        || descriptor.product_id() != product_id
                    {
                        continue;
                    }
                }

                // Without permissions we can't open the device, the name is optional anyway.
                let product_name = device
                    .open()
                    .ok()
                    .and_then(|handle| handle.read_product_string_ascii(&descriptor).ok());

                let version = descriptor.device_version();
                found_devices.push(UsbData {
                    bus_number: device.bus_number(),
                    address: device.address(),
                    vendor_id: descriptor.vendor_id(),
                    product_id: descriptor.product_id(),
                    device_version: (version.0, version.1, version.2),
                    product_name,
                });
            }
        }
    }

    found_devices
}
