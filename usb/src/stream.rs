use crate::device::base::{
    activate, nth_interface_with_class, AlternateSetting, ConfigurationDescriptor, ControlSetup,
    DeviceLink, Direction, RequestType, CLASS_CDC_DATA, CLASS_VENDOR_SPECIFIC,
};
use crate::error::{CommandError, ConnectError, TransferError};
use crate::events::{ChannelRole, DeviceEvent, EventHub};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Request toggling the device's stream output, value 1 enables and 0 disables.
pub const STREAM_CONTROL_REQUEST: u8 = 0x22;
const STREAM_ENABLE: u16 = 0x01;
const STREAM_DISABLE: u16 = 0x00;

/// Size of a single inbound bulk read.
pub const STREAM_PACKET_SIZE: usize = 64;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display, EnumString, Serialize, Deserialize)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StreamPersonality {
    /// Streams over the second vendor specific interface.
    Vendor,

    /// Streams over a CDC data interface, using class requests.
    ClassCompliant,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct StreamEndpoints {
    pub interface: u8,
    pub endpoint_in: u8,
    pub endpoint_out: u8,
}

impl StreamPersonality {
    /// Works out which personality a device is running from its descriptors.
    pub fn detect(config: &ConfigurationDescriptor) -> Option<Self> {
        if config.interfaces_with_class(CLASS_VENDOR_SPECIFIC).len() >= 2 {
            return Some(StreamPersonality::Vendor);
        }
        if !config.interfaces_with_class(CLASS_CDC_DATA).is_empty() {
            return Some(StreamPersonality::ClassCompliant);
        }
        None
    }

    /// Request type of the enable request. Disabling is always a class request.
    pub fn request_type(&self) -> RequestType {
        match self {
            StreamPersonality::Vendor => RequestType::Vendor,
            StreamPersonality::ClassCompliant => RequestType::Class,
        }
    }

    pub fn locate(&self, config: &ConfigurationDescriptor) -> Result<StreamEndpoints, ConnectError> {
        let (interface, alternate) = match self {
            StreamPersonality::Vendor => {
                // The first vendor interface belongs to the register channel.
                let interface =
                    nth_interface_with_class(config, CLASS_VENDOR_SPECIFIC, 1, ChannelRole::Stream)?;
                let alternate = interface.alternates.first().ok_or(
                    ConnectError::NoCompatibleInterface {
                        role: ChannelRole::Stream,
                        class: CLASS_VENDOR_SPECIFIC,
                        position: 1,
                    },
                )?;
                (interface.number, alternate)
            }
            StreamPersonality::ClassCompliant => config
                .interfaces
                .iter()
                .find_map(|interface| {
                    interface
                        .alternates
                        .iter()
                        .find(|alternate| alternate.class_code == CLASS_CDC_DATA)
                        .map(|alternate| (interface.number, alternate))
                })
                .ok_or(ConnectError::NoCompatibleInterface {
                    role: ChannelRole::Stream,
                    class: CLASS_CDC_DATA,
                    position: 0,
                })?,
        };

        Ok(StreamEndpoints {
            interface,
            endpoint_in: endpoint_number(interface, alternate, Direction::In)?,
            endpoint_out: endpoint_number(interface, alternate, Direction::Out)?,
        })
    }
}

fn endpoint_number(
    interface: u8,
    alternate: &AlternateSetting,
    direction: Direction,
) -> Result<u8, ConnectError> {
    alternate
        .endpoint(direction)
        .map(|endpoint| endpoint.number)
        .ok_or(ConnectError::MissingEndpoint {
            interface,
            direction,
        })
}

struct ReadLoop {
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

pub struct StreamChannel {
    link: Arc<dyn DeviceLink>,
    events: EventHub,
    personality: StreamPersonality,
    endpoints: Option<StreamEndpoints>,
    reader: Option<ReadLoop>,
}

impl StreamChannel {
    pub fn new(link: Arc<dyn DeviceLink>, events: EventHub, personality: StreamPersonality) -> Self {
        Self {
            link,
            events,
            personality,
            endpoints: None,
            reader: None,
        }
    }

    pub fn personality(&self) -> StreamPersonality {
        self.personality
    }

    pub fn endpoints(&self) -> Option<StreamEndpoints> {
        self.endpoints
    }

    /// Whether the read loop is still running.
    pub fn is_streaming(&self) -> bool {
        self.reader
            .as_ref()
            .map(|reader| !reader.handle.is_finished())
            .unwrap_or(false)
    }

    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.is_streaming() {
            debug!("Stream channel already connected");
            return Ok(());
        }

        // A loop that stopped on a read error has already released its interface.
        self.reader = None;

        let config = activate(self.link.as_ref()).await?;
        let endpoints = self.personality.locate(&config)?;
        debug!(
            "Stream ({}) using interface {}, IN {} OUT {}",
            self.personality, endpoints.interface, endpoints.endpoint_in, endpoints.endpoint_out
        );

        self.link.claim_interface(endpoints.interface).await?;
        self.link
            .control_transfer_out(
                self.stream_control(self.personality.request_type(), endpoints.interface, STREAM_ENABLE),
                &[],
            )
            .await?;
        self.endpoints = Some(endpoints);

        info!(
            "Stream channel connected on interface {}",
            endpoints.interface
        );
        self.events.emit(DeviceEvent::Connected {
            role: ChannelRole::Stream,
        });

        let cancel = CancellationToken::new();
        let handle = tokio::spawn(read_loop(
            self.link.clone(),
            self.events.clone(),
            endpoints,
            cancel.clone(),
        ));
        self.reader = Some(ReadLoop { cancel, handle });
        Ok(())
    }

    /// Writes `data` to the outbound endpoint as a single bulk transfer.
    pub async fn send(&self, data: &[u8]) -> Result<usize, CommandError> {
        let endpoints = self.endpoints.ok_or(CommandError::NotConnected)?;
        let written = self.link.transfer_out(endpoints.endpoint_out, data).await?;
        debug!("Sent {} of {} bytes", written, data.len());
        Ok(written)
    }

    pub async fn disconnect(&mut self) -> Result<(), ConnectError> {
        if let Some(reader) = self.reader.take() {
            reader.cancel.cancel();
            if let Err(error) = reader.handle.await {
                warn!("Read loop ended abnormally: {}", error);
            }
        }

        // The device is closed even when it refuses the disable request.
        let mut disabled = Ok(0);
        if let Some(endpoints) = self.endpoints.take() {
            disabled = self
                .link
                .control_transfer_out(
                    self.stream_control(RequestType::Class, endpoints.interface, STREAM_DISABLE),
                    &[],
                )
                .await;
        }
        let closed = self.link.close().await;

        disabled?;
        closed?;
        info!("Stream channel disconnected");
        Ok(())
    }

    fn stream_control(&self, request_type: RequestType, interface: u8, value: u16) -> ControlSetup {
        ControlSetup::interface(
            request_type,
            interface,
            STREAM_CONTROL_REQUEST,
            value,
        )
    }
}

async fn read_loop(
    link: Arc<dyn DeviceLink>,
    events: EventHub,
    endpoints: StreamEndpoints,
    cancel: CancellationToken,
) {
    debug!("Read loop started on endpoint {}", endpoints.endpoint_in);
    loop {
        let result = tokio::select! {
            biased;

            _ = cancel.cancelled() => {
                debug!("Read loop cancelled");
                return;
            }
            result = link.transfer_in(endpoints.endpoint_in, STREAM_PACKET_SIZE) => result,
        };

        match result {
            Ok(data) => events.emit(DeviceEvent::Data(data)),

            // Nothing arrived within the poll interval.
            Err(TransferError::Timeout) => continue,

            Err(error) => {
                warn!("Stream read failed, stopping read loop: {}", error);
                if let Err(release) = link.release_interface(endpoints.interface).await {
                    warn!(
                        "Unable to release interface {}: {}",
                        endpoints.interface, release
                    );
                }
                events.emit(DeviceEvent::ReadError { error });
                return;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::base::Recipient;
    use crate::device::scripted::{interface, Call, ScriptedLink};
    use std::str::FromStr;
    use std::time::Duration;
    use tokio::sync::broadcast::Receiver;
    use tokio::time::timeout;

    fn stream_setup(request_type: RequestType, interface: u8, value: u16) -> ControlSetup {
        ControlSetup {
            request_type,
            recipient: Recipient::Interface,
            request: STREAM_CONTROL_REQUEST,
            value,
            index: interface as u16,
        }
    }

    async fn next_event(receiver: &mut Receiver<DeviceEvent>) -> DeviceEvent {
        timeout(Duration::from_secs(1), receiver.recv())
            .await
            .expect("no event arrived")
            .unwrap()
    }

    async fn assert_quiet(receiver: &mut Receiver<DeviceEvent>) {
        assert!(timeout(Duration::from_millis(50), receiver.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn vendor_connect_uses_the_second_vendor_interface() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let events = EventHub::default();
        let mut receiver = events.subscribe();

        let mut channel = StreamChannel::new(link.clone(), events, StreamPersonality::Vendor);
        channel.connect().await.unwrap();

        assert_eq!(
            channel.endpoints(),
            Some(StreamEndpoints {
                interface: 1,
                endpoint_in: 1,
                endpoint_out: 1
            })
        );
        assert_eq!(
            link.calls_without_reads(),
            vec![
                Call::Open,
                Call::SelectConfiguration(1),
                Call::Claim(1),
                Call::ControlOut(stream_setup(RequestType::Vendor, 1, 1), vec![]),
            ]
        );
        assert_eq!(
            next_event(&mut receiver).await,
            DeviceEvent::Connected {
                role: ChannelRole::Stream
            }
        );
        assert!(channel.is_streaming());
    }

    #[tokio::test]
    async fn class_compliant_connect_uses_the_cdc_data_interface() {
        let link = Arc::new(ScriptedLink::class_compliant_device());
        let mut channel =
            StreamChannel::new(link.clone(), EventHub::default(), StreamPersonality::ClassCompliant);
        channel.connect().await.unwrap();

        assert_eq!(
            channel.endpoints(),
            Some(StreamEndpoints {
                interface: 2,
                endpoint_in: 2,
                endpoint_out: 2
            })
        );
        assert!(link
            .calls()
            .contains(&Call::ControlOut(stream_setup(RequestType::Class, 2, 1), vec![])));
    }

    #[tokio::test]
    async fn vendor_connect_needs_two_vendor_interfaces() {
        let link = Arc::new(ScriptedLink::new(ConfigurationDescriptor {
            value: 1,
            interfaces: vec![interface(0, CLASS_VENDOR_SPECIFIC, &[])],
        }));
        let mut channel = StreamChannel::new(link.clone(), EventHub::default(), StreamPersonality::Vendor);

        assert_eq!(
            channel.connect().await,
            Err(ConnectError::NoCompatibleInterface {
                role: ChannelRole::Stream,
                class: CLASS_VENDOR_SPECIFIC,
                position: 1
            })
        );
        assert!(!channel.is_streaming());
    }

    #[tokio::test]
    async fn connect_requires_both_endpoints() {
        let link = Arc::new(ScriptedLink::new(ConfigurationDescriptor {
            value: 1,
            interfaces: vec![
                interface(0, CLASS_VENDOR_SPECIFIC, &[]),
                interface(1, CLASS_VENDOR_SPECIFIC, &[(1, Direction::In)]),
            ],
        }));
        let mut channel = StreamChannel::new(link.clone(), EventHub::default(), StreamPersonality::Vendor);

        assert_eq!(
            channel.connect().await,
            Err(ConnectError::MissingEndpoint {
                interface: 1,
                direction: Direction::Out
            })
        );
    }

    #[tokio::test]
    async fn inbound_packets_become_data_events_in_order() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let events = EventHub::default();
        let mut channel = StreamChannel::new(link.clone(), events.clone(), StreamPersonality::Vendor);
        channel.connect().await.unwrap();
        let mut receiver = events.subscribe();

        link.push_bulk_in(Ok(vec![0x90, 0x3c, 0x7f]));
        link.push_bulk_in(Err(TransferError::Timeout));
        link.push_bulk_in(Ok(vec![0x80, 0x3c, 0x00]));

        assert_eq!(next_event(&mut receiver).await, DeviceEvent::Data(vec![0x90, 0x3c, 0x7f]));
        assert_eq!(next_event(&mut receiver).await, DeviceEvent::Data(vec![0x80, 0x3c, 0x00]));
        assert!(channel.is_streaming());
        assert!(link.calls().contains(&Call::TransferIn(1, STREAM_PACKET_SIZE)));
    }

    #[tokio::test]
    async fn a_failed_read_releases_and_reports_once() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let events = EventHub::default();
        let mut channel = StreamChannel::new(link.clone(), events.clone(), StreamPersonality::Vendor);
        channel.connect().await.unwrap();
        let mut receiver = events.subscribe();

        link.push_bulk_in(Ok(vec![1]));
        link.push_bulk_in(Err(TransferError::Stall));
        link.push_bulk_in(Ok(vec![2]));

        assert_eq!(next_event(&mut receiver).await, DeviceEvent::Data(vec![1]));
        assert_eq!(
            next_event(&mut receiver).await,
            DeviceEvent::ReadError {
                error: TransferError::Stall
            }
        );
        assert_quiet(&mut receiver).await;

        assert!(!channel.is_streaming());
        assert!(link.calls().contains(&Call::Release(1)));
        assert_eq!(link.claimed(), Vec::<u8>::new());
    }

    #[tokio::test]
    async fn closing_the_device_under_the_loop_ends_it() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let events = EventHub::default();
        let mut channel = StreamChannel::new(link.clone(), events.clone(), StreamPersonality::Vendor);
        channel.connect().await.unwrap();
        let mut receiver = events.subscribe();

        // Let the loop park on its first read.
        tokio::task::yield_now().await;
        link.close().await.unwrap();

        assert!(matches!(
            next_event(&mut receiver).await,
            DeviceEvent::ReadError { .. }
        ));
        assert_quiet(&mut receiver).await;
    }

    #[tokio::test]
    async fn send_writes_one_bulk_transfer() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let mut channel = StreamChannel::new(link.clone(), EventHub::default(), StreamPersonality::Vendor);
        channel.connect().await.unwrap();

        let payload: Vec<u8> = (0..200).map(|i| i as u8).collect();
        assert_eq!(channel.send(&payload).await, Ok(200));
        assert!(link.calls().contains(&Call::TransferOut(1, payload)));

        link.fail_bulk_out(TransferError::NoDevice);
        assert_eq!(
            channel.send(&[1]).await,
            Err(CommandError::Transfer(TransferError::NoDevice))
        );
    }

    #[tokio::test]
    async fn send_before_connect_is_rejected() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let channel = StreamChannel::new(link.clone(), EventHub::default(), StreamPersonality::Vendor);
        assert_eq!(channel.send(&[1]).await, Err(CommandError::NotConnected));
        assert!(link.calls().is_empty());
    }

    #[tokio::test]
    async fn disconnect_cancels_the_loop_then_disables_and_closes() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let events = EventHub::default();
        let mut channel = StreamChannel::new(link.clone(), events.clone(), StreamPersonality::Vendor);
        channel.connect().await.unwrap();
        let mut receiver = events.subscribe();
        link.clear_calls();

        channel.disconnect().await.unwrap();

        assert_eq!(
            link.calls_without_reads(),
            vec![
                Call::ControlOut(stream_setup(RequestType::Class, 1, 0), vec![]),
                Call::Close,
            ]
        );
        assert!(!channel.is_streaming());
        assert!(channel.endpoints().is_none());

        // Cancellation is silent, no read error is reported.
        assert_quiet(&mut receiver).await;
    }

    #[tokio::test]
    async fn connecting_twice_keeps_a_single_read_loop() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let events = EventHub::default();
        let mut channel = StreamChannel::new(link.clone(), events.clone(), StreamPersonality::Vendor);
        channel.connect().await.unwrap();
        link.clear_calls();

        channel.connect().await.unwrap();
        assert!(link.calls_without_reads().is_empty());

        let mut receiver = events.subscribe();
        channel.disconnect().await.unwrap();

        // Nothing outlives the disconnect to report a read error.
        assert!(timeout(Duration::from_millis(200), receiver.recv())
            .await
            .is_err());
    }

    #[tokio::test]
    async fn reconnecting_after_a_read_error_starts_a_new_loop() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let events = EventHub::default();
        let mut receiver = events.subscribe();
        let mut channel = StreamChannel::new(link.clone(), events, StreamPersonality::Vendor);
        channel.connect().await.unwrap();
        assert!(matches!(next_event(&mut receiver).await, DeviceEvent::Connected { .. }));

        link.push_bulk_in(Err(TransferError::Stall));
        assert!(matches!(next_event(&mut receiver).await, DeviceEvent::ReadError { .. }));
        timeout(Duration::from_secs(1), async {
            while channel.is_streaming() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .expect("read loop kept running");
        link.clear_calls();

        channel.connect().await.unwrap();
        assert!(link.calls_without_reads().contains(&Call::Claim(1)));
        assert!(channel.is_streaming());
    }

    #[tokio::test]
    async fn disconnect_still_closes_when_disable_fails() {
        let link = Arc::new(ScriptedLink::vendor_device());
        let mut channel = StreamChannel::new(link.clone(), EventHub::default(), StreamPersonality::Vendor);
        channel.connect().await.unwrap();
        link.fail_control(TransferError::NoDevice);

        assert_eq!(
            channel.disconnect().await,
            Err(ConnectError::Transfer(TransferError::NoDevice))
        );
        assert!(!link.is_open());
    }

    #[test]
    fn personality_detection_prefers_vendor_streaming() {
        let vendor = ConfigurationDescriptor {
            value: 1,
            interfaces: vec![
                interface(0, CLASS_VENDOR_SPECIFIC, &[]),
                interface(1, CLASS_VENDOR_SPECIFIC, &[]),
                interface(2, CLASS_CDC_DATA, &[]),
            ],
        };
        let class = ConfigurationDescriptor {
            value: 1,
            interfaces: vec![
                interface(0, CLASS_VENDOR_SPECIFIC, &[]),
                interface(1, CLASS_CDC_DATA, &[]),
            ],
        };
        let neither = ConfigurationDescriptor {
            value: 1,
            interfaces: vec![interface(0, CLASS_VENDOR_SPECIFIC, &[])],
        };

        assert_eq!(StreamPersonality::detect(&vendor), Some(StreamPersonality::Vendor));
        assert_eq!(
            StreamPersonality::detect(&class),
            Some(StreamPersonality::ClassCompliant)
        );
        assert_eq!(StreamPersonality::detect(&neither), None);
    }

    #[test]
    fn personalities_parse_from_kebab_case() {
        assert_eq!(
            StreamPersonality::from_str("class-compliant").unwrap(),
            StreamPersonality::ClassCompliant
        );
        assert_eq!(StreamPersonality::Vendor.to_string(), "vendor");
    }
}
