// Events raised by the channels of a session. Delivery is a broadcast: every subscriber sees every
// event sent after it subscribed, independent of any other subscriber.

use crate::error::TransferError;
use log::trace;
use strum::Display;
use tokio::sync::broadcast;

pub const DEFAULT_EVENT_CAPACITY: usize = 256;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
#[strum(serialize_all = "lowercase")]
pub enum ChannelRole {
    Register,
    Stream,
}

#[derive(Debug, Clone, PartialEq)]
pub enum DeviceEvent {
    Connected { role: ChannelRole },
    Data(Vec<u8>),
    ReadError { error: TransferError },
    Disconnected,
}

#[derive(Debug, Clone)]
pub struct EventHub {
    sender: broadcast::Sender<DeviceEvent>,
}

impl EventHub {
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.sender.subscribe()
    }

    pub(crate) fn emit(&self, event: DeviceEvent) {
        // Nobody listening is fine, the event is simply dropped.
        if self.sender.send(event).is_err() {
            trace!("Event emitted with no subscribers");
        }
    }
}

impl Default for EventHub {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}
