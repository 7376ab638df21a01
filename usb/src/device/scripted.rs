// An in-memory DeviceLink used by the unit tests. It records every call made against it, answers
// register reads from a register map, and serves bulk reads from a queue the test feeds.

use crate::device::base::{
    AlternateSetting, ConfigurationDescriptor, ControlSetup, DeviceLink, Direction,
    EndpointDescriptor, InterfaceDescriptor, RequestType, CLASS_CDC_DATA, CLASS_VENDOR_SPECIFIC,
};
use crate::error::TransferError;
use async_trait::async_trait;
use byteorder::{ByteOrder, LittleEndian};
use std::collections::{BTreeSet, HashMap};
use std::sync::Mutex;
use tokio::sync::{mpsc, Notify};

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Open,
    Close,
    SelectConfiguration(u8),
    Claim(u8),
    Release(u8),
    ControlIn(ControlSetup, usize),
    ControlOut(ControlSetup, Vec<u8>),
    TransferIn(u8, usize),
    TransferOut(u8, Vec<u8>),
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    open: bool,
    active: Option<u8>,
    claimed: BTreeSet<u8>,
    registers: HashMap<u8, u16>,
    response_length: Option<usize>,
    control_failure: Option<TransferError>,
    bulk_out_failure: Option<TransferError>,
    claim_failure: Option<TransferError>,
}

pub struct ScriptedLink {
    descriptor: ConfigurationDescriptor,
    state: Mutex<State>,
    closed: Notify,
    bulk_in_tx: mpsc::UnboundedSender<Result<Vec<u8>, TransferError>>,
    bulk_in_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<Result<Vec<u8>, TransferError>>>,
}

impl ScriptedLink {
    pub fn new(descriptor: ConfigurationDescriptor) -> Self {
        let (bulk_in_tx, bulk_in_rx) = mpsc::unbounded_channel();
        Self {
            descriptor,
            state: Mutex::new(State::default()),
            closed: Notify::new(),
            bulk_in_tx,
            bulk_in_rx: tokio::sync::Mutex::new(bulk_in_rx),
        }
    }

    /// Two vendor interfaces: 0 for registers, 1 for streaming on endpoint 1.
    pub fn vendor_device() -> Self {
        Self::new(ConfigurationDescriptor {
            value: 1,
            interfaces: vec![
                interface(0, CLASS_VENDOR_SPECIFIC, &[]),
                interface(1, CLASS_VENDOR_SPECIFIC, &[(1, Direction::In), (1, Direction::Out)]),
            ],
        })
    }

    /// A register interface plus a CDC pair, data on interface 2 endpoint 2.
    pub fn class_compliant_device() -> Self {
        Self::new(ConfigurationDescriptor {
            value: 1,
            interfaces: vec![
                interface(0, CLASS_VENDOR_SPECIFIC, &[]),
                interface(1, 0x02, &[(3, Direction::In)]),
                interface(2, CLASS_CDC_DATA, &[(2, Direction::Out), (2, Direction::In)]),
            ],
        })
    }

    pub fn with_active_configuration(self, value: u8) -> Self {
        self.state.lock().unwrap().active = Some(value);
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().unwrap().calls.clone()
    }

    /// Calls other than the bulk reads issued by a running read loop.
    pub fn calls_without_reads(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::TransferIn(..)))
            .collect()
    }

    pub fn clear_calls(&self) {
        self.state.lock().unwrap().calls.clear();
    }

    pub fn is_open(&self) -> bool {
        self.state.lock().unwrap().open
    }

    pub fn claimed(&self) -> Vec<u8> {
        self.state.lock().unwrap().claimed.iter().copied().collect()
    }

    pub fn set_register(&self, address: u8, value: u16) {
        self.state.lock().unwrap().registers.insert(address, value);
    }

    pub fn register(&self, address: u8) -> Option<u16> {
        self.state.lock().unwrap().registers.get(&address).copied()
    }

    pub fn truncate_responses(&self, length: usize) {
        self.state.lock().unwrap().response_length = Some(length);
    }

    pub fn fail_control(&self, error: TransferError) {
        self.state.lock().unwrap().control_failure = Some(error);
    }

    pub fn fail_bulk_out(&self, error: TransferError) {
        self.state.lock().unwrap().bulk_out_failure = Some(error);
    }

    pub fn fail_claim(&self, error: TransferError) {
        self.state.lock().unwrap().claim_failure = Some(error);
    }

    pub fn push_bulk_in(&self, result: Result<Vec<u8>, TransferError>) {
        let _ = self.bulk_in_tx.send(result);
    }

    fn record(&self, call: Call) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(call);
        if !state.open {
            return Err(TransferError::NotOpen);
        }
        Ok(())
    }
}

#[async_trait]
impl DeviceLink for ScriptedLink {
    async fn open(&self) -> Result<(), TransferError> {
        let mut state = self.state.lock().unwrap();
        state.calls.push(Call::Open);
        state.open = true;
        Ok(())
    }

    async fn close(&self) -> Result<(), TransferError> {
        {
            let mut state = self.state.lock().unwrap();
            state.calls.push(Call::Close);
            state.open = false;
            state.claimed.clear();
        }
        self.closed.notify_waiters();
        Ok(())
    }

    async fn configuration(&self) -> Result<Option<ConfigurationDescriptor>, TransferError> {
        let state = self.state.lock().unwrap();
        if !state.open {
            return Err(TransferError::NotOpen);
        }
        Ok(state.active.map(|value| ConfigurationDescriptor {
            value,
            ..self.descriptor.clone()
        }))
    }

    async fn select_configuration(&self, value: u8) -> Result<(), TransferError> {
        self.record(Call::SelectConfiguration(value))?;
        self.state.lock().unwrap().active = Some(value);
        Ok(())
    }

    async fn claim_interface(&self, number: u8) -> Result<(), TransferError> {
        self.record(Call::Claim(number))?;
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.claim_failure.clone() {
            return Err(error);
        }
        state.claimed.insert(number);
        Ok(())
    }

    async fn release_interface(&self, number: u8) -> Result<(), TransferError> {
        self.record(Call::Release(number))?;
        self.state.lock().unwrap().claimed.remove(&number);
        Ok(())
    }

    async fn control_transfer_in(
        &self,
        setup: ControlSetup,
        length: usize,
    ) -> Result<Vec<u8>, TransferError> {
        self.record(Call::ControlIn(setup, length))?;
        let state = self.state.lock().unwrap();
        if let Some(error) = state.control_failure.clone() {
            return Err(error);
        }

        let mut response = vec![0; length];
        let value = state.registers.get(&setup.request).copied().unwrap_or(0);
        if length >= 2 {
            LittleEndian::write_u16(&mut response[0..2], value);
        }
        if let Some(truncated) = state.response_length {
            response.truncate(truncated);
        }
        Ok(response)
    }

    async fn control_transfer_out(
        &self,
        setup: ControlSetup,
        data: &[u8],
    ) -> Result<usize, TransferError> {
        self.record(Call::ControlOut(setup, data.to_vec()))?;
        let mut state = self.state.lock().unwrap();
        if let Some(error) = state.control_failure.clone() {
            return Err(error);
        }

        if setup.request_type == RequestType::Vendor && setup.request & 0x80 != 0 {
            state.registers.insert(setup.request & 0x7f, setup.value);
        }
        Ok(data.len())
    }

    async fn transfer_in(&self, endpoint: u8, length: usize) -> Result<Vec<u8>, TransferError> {
        self.record(Call::TransferIn(endpoint, length))?;

        let closed = self.closed.notified();
        let mut queue = self.bulk_in_rx.lock().await;
        tokio::select! {
            result = queue.recv() => result.unwrap_or(Err(TransferError::NoDevice)),
            _ = closed => Err(TransferError::NoDevice),
        }
    }

    async fn transfer_out(&self, endpoint: u8, data: &[u8]) -> Result<usize, TransferError> {
        self.record(Call::TransferOut(endpoint, data.to_vec()))?;
        if let Some(error) = self.state.lock().unwrap().bulk_out_failure.clone() {
            return Err(error);
        }
        Ok(data.len())
    }
}

pub fn interface(number: u8, class_code: u8, endpoints: &[(u8, Direction)]) -> InterfaceDescriptor {
    InterfaceDescriptor {
        number,
        alternates: vec![AlternateSetting {
            setting: 0,
            class_code,
            endpoints: endpoints
                .iter()
                .map(|(number, direction)| EndpointDescriptor {
                    number: *number,
                    direction: *direction,
                })
                .collect(),
        }],
    }
}
