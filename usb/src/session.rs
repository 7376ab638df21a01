use crate::device::base::{activate, DeviceLink};
use crate::error::{CommandError, ConnectError};
use crate::events::{DeviceEvent, EventHub};
use crate::register::{RegisterAddress, RegisterChannel};
use crate::stream::{StreamChannel, StreamPersonality};
use log::{debug, info, warn};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use strum::{Display, EnumString};
use tokio::sync::broadcast;

#[derive(Debug, Copy, Clone, PartialEq, Eq, Display)]
pub enum SessionState {
    Disconnected,
    Connecting,
    Connected,
    Disconnecting,
}

#[derive(
    Debug, Default, Copy, Clone, PartialEq, Eq, Display, EnumString, Serialize, Deserialize,
)]
#[strum(serialize_all = "kebab-case")]
#[serde(rename_all = "kebab-case")]
pub enum StreamMode {
    /// Don't stream at all, registers only.
    Disabled,

    /// Pick the personality from the device's descriptors, skipping the stream if there is none.
    #[default]
    Auto,

    Vendor,
    ClassCompliant,
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct SessionOptions {
    pub register: bool,
    pub stream: StreamMode,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            register: true,
            stream: StreamMode::Auto,
        }
    }
}

// Owns one physical device for as long as it's connected, and the channels talking to it.
pub struct ConnectionSession {
    link: Arc<dyn DeviceLink>,
    events: EventHub,
    options: SessionOptions,
    state: SessionState,

    register: Option<RegisterChannel>,
    stream: Option<StreamChannel>,
}

impl ConnectionSession {
    pub fn new(link: Arc<dyn DeviceLink>, options: SessionOptions) -> Self {
        Self::with_events(link, options, EventHub::default())
    }

    pub fn with_events(link: Arc<dyn DeviceLink>, options: SessionOptions, events: EventHub) -> Self {
        Self {
            link,
            events,
            options,
            state: SessionState::Disconnected,
            register: None,
            stream: None,
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DeviceEvent> {
        self.events.subscribe()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn options(&self) -> SessionOptions {
        self.options
    }

    /// The personality the stream channel runs in, if one is connected.
    pub fn stream_personality(&self) -> Option<StreamPersonality> {
        self.stream.as_ref().map(|stream| stream.personality())
    }

    pub fn is_streaming(&self) -> bool {
        self.stream
            .as_ref()
            .map(|stream| stream.is_streaming())
            .unwrap_or(false)
    }

    pub async fn connect(&mut self) -> Result<(), ConnectError> {
        if self.state == SessionState::Connected {
            return Ok(());
        }

        self.set_state(SessionState::Connecting);
        match self.connect_channels().await {
            Ok(()) => {
                self.set_state(SessionState::Connected);
                Ok(())
            }
            Err(error) => {
                warn!("Connection failed: {}", error);
                if let Err(teardown) = self.teardown().await {
                    debug!("Error during connection teardown: {}", teardown);
                }
                self.set_state(SessionState::Disconnected);
                Err(error)
            }
        }
    }

    pub async fn disconnect(&mut self) -> Result<(), ConnectError> {
        if self.state == SessionState::Disconnected {
            return Ok(());
        }

        self.set_state(SessionState::Disconnecting);
        let result = self.teardown().await;
        self.set_state(SessionState::Disconnected);

        info!("Session disconnected");
        self.events.emit(DeviceEvent::Disconnected);
        result
    }

    // A bad address is reported ahead of the connection state, even on an offline session.
    pub async fn read_register(&self, address: u8) -> Result<u16, CommandError> {
        let address = RegisterAddress::new(address)?;
        self.register_channel()?.read_at(address).await
    }

    pub async fn write_register(&self, address: u8, value: u16) -> Result<(), CommandError> {
        let address = RegisterAddress::new(address)?;
        self.register_channel()?.write_at(address, value).await
    }

    pub async fn send(&self, data: &[u8]) -> Result<usize, CommandError> {
        if self.state != SessionState::Connected {
            return Err(CommandError::NotConnected);
        }
        let stream = self.stream.as_ref().ok_or(CommandError::NotConnected)?;
        stream.send(data).await
    }

    fn register_channel(&self) -> Result<&RegisterChannel, CommandError> {
        if self.state != SessionState::Connected {
            return Err(CommandError::NotConnected);
        }
        self.register.as_ref().ok_or(CommandError::NotConnected)
    }

    async fn connect_channels(&mut self) -> Result<(), ConnectError> {
        // By convention the register channel comes up first.
        if self.options.register {
            let mut register = RegisterChannel::new(self.link.clone(), self.events.clone());
            register.connect().await?;
            self.register = Some(register);
        }

        if let Some(personality) = self.resolve_personality().await? {
            let mut stream = StreamChannel::new(self.link.clone(), self.events.clone(), personality);
            let result = stream.connect().await;
            self.stream = Some(stream);
            result?;
        }
        Ok(())
    }

    async fn resolve_personality(&self) -> Result<Option<StreamPersonality>, ConnectError> {
        match self.options.stream {
            StreamMode::Disabled => Ok(None),
            StreamMode::Vendor => Ok(Some(StreamPersonality::Vendor)),
            StreamMode::ClassCompliant => Ok(Some(StreamPersonality::ClassCompliant)),
            StreamMode::Auto => {
                let config = activate(self.link.as_ref()).await?;
                match StreamPersonality::detect(&config) {
                    Some(personality) => {
                        debug!("Detected {} streaming personality", personality);
                        Ok(Some(personality))
                    }
                    None if self.options.register => {
                        info!("Device has no streaming interface, continuing with registers only");
                        Ok(None)
                    }
                    None => Err(ConnectError::UnknownPersonality),
                }
            }
        }
    }

    // The stream goes first, its disable request needs the device still open.
    async fn teardown(&mut self) -> Result<(), ConnectError> {
        let mut first_error = None;

        if let Some(mut stream) = self.stream.take() {
            if let Err(error) = stream.disconnect().await {
                first_error.get_or_insert(error);
            }
        }
        if let Some(mut register) = self.register.take() {
            if let Err(error) = register.disconnect().await {
                first_error.get_or_insert(error);
            }
        }

        // Covers a channel that opened the device but failed before it was kept.
        if let Err(error) = self.link.close().await {
            first_error.get_or_insert(error.into());
        }

        match first_error {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }

    fn set_state(&mut self, state: SessionState) {
        debug!("Session state {} -> {}", self.state, state);
        self.state = state;
    }
}
