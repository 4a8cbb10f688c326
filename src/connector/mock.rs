//! Scriptable connector double
//!
//! Stands in for a real link in scheduler tests: records every call,
//! serves scripted scan results and responses, and lets the test body
//! force failures and link drops through its handle.

use super::{Channel, Connector, ConnectorContext, Criteria, NodeDescriptor};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

#[derive(Default)]
struct State {
    nodes: Vec<NodeDescriptor>,
    selected: Option<NodeDescriptor>,
    connected: bool,
    deliveries: Vec<(Channel, Vec<u8>)>,
    transmissions: Vec<(Channel, Vec<u8>)>,
    responses: VecDeque<Vec<u8>>,
    clock: u64,
    firmware_sizes: Vec<usize>,
    fail_connects: usize,
    fail_delivers: usize,
    destroyed: usize,
    packet_budget: usize,
    deliver_delay: Duration,
}

/// Test-side handle into a [`MockConnector`]
#[derive(Clone)]
pub struct MockConnectorHandle {
    state: Arc<Mutex<State>>,
    ctx: ConnectorContext,
}

impl MockConnectorHandle {
    /// Nodes future scans will return
    pub fn set_nodes(&self, nodes: Vec<NodeDescriptor>) {
        self.state.lock().nodes = nodes;
    }

    /// Queue a response for the next `request` call
    pub fn push_response(&self, payload: &[u8]) {
        self.state.lock().responses.push_back(payload.to_vec());
    }

    /// Value future `get_clock` calls return
    pub fn set_clock_value(&self, millis: u64) {
        self.state.lock().clock = millis;
    }

    /// Fail the next `n` connect calls
    pub fn fail_connects(&self, n: usize) {
        self.state.lock().fail_connects = n;
    }

    /// Fail the next `n` deliver calls
    pub fn fail_delivers(&self, n: usize) {
        self.state.lock().fail_delivers = n;
    }

    /// Largest merged message the connector reports accepting
    pub fn set_packet_budget(&self, budget: usize) {
        self.state.lock().packet_budget = budget;
    }

    /// Make each deliver take this long (holds the worker busy)
    pub fn set_deliver_delay(&self, delay: Duration) {
        self.state.lock().deliver_delay = delay;
    }

    /// Simulate the physical link dropping out from under the connector
    pub fn drop_link(&self) {
        self.state.lock().connected = false;
        self.ctx.notices.notify_disconnected();
    }

    /// Everything delivered so far
    pub fn deliveries(&self) -> Vec<(Channel, Vec<u8>)> {
        self.state.lock().deliveries.clone()
    }

    /// Everything transmitted so far
    pub fn transmissions(&self) -> Vec<(Channel, Vec<u8>)> {
        self.state.lock().transmissions.clone()
    }

    /// Last value written through `set_clock`
    pub fn clock_value(&self) -> u64 {
        self.state.lock().clock
    }

    /// Firmware sizes passed to `update_firmware`
    pub fn firmware_sizes(&self) -> Vec<usize> {
        self.state.lock().firmware_sizes.clone()
    }

    /// Number of `destroy` calls observed
    pub fn destroy_count(&self) -> usize {
        self.state.lock().destroyed
    }

    /// Whether the connector currently reports a live link
    pub fn is_connected(&self) -> bool {
        self.state.lock().connected
    }
}

/// Recording [`Connector`] double
pub struct MockConnector {
    state: Arc<Mutex<State>>,
    ctx: ConnectorContext,
}

impl MockConnector {
    /// Build a mock and its handle; scans default to one node
    pub fn new(ctx: ConnectorContext) -> (Self, MockConnectorHandle) {
        let state = Arc::new(Mutex::new(State {
            nodes: vec![NodeDescriptor {
                mac: "AA:BB:CC:DD:EE:FF".to_string(),
                name: "mock-lamp".to_string(),
                rssi: -42,
            }],
            packet_budget: 1024,
            ..State::default()
        }));
        let handle = MockConnectorHandle {
            state: Arc::clone(&state),
            ctx: ctx.clone(),
        };
        (Self { state, ctx }, handle)
    }
}

impl Connector for MockConnector {
    fn user_select(&mut self, criteria: &Criteria, _timeout: Duration) -> Result<NodeDescriptor> {
        let mut state = self.state.lock();
        let node = state
            .nodes
            .iter()
            .find(|n| criteria.matches(n))
            .cloned()
            .ok_or_else(|| Error::SelectionFailed("no scripted node matches".to_string()))?;
        state.selected = Some(node.clone());
        Ok(node)
    }

    fn auto_select(
        &mut self,
        criteria: &Criteria,
        _scan_window: Duration,
        timeout: Duration,
    ) -> Result<NodeDescriptor> {
        self.user_select(criteria, timeout)
    }

    fn scan(&mut self, criteria: &Criteria, _scan_window: Duration) -> Result<Vec<NodeDescriptor>> {
        Ok(self
            .state
            .lock()
            .nodes
            .iter()
            .filter(|n| criteria.matches(n))
            .cloned()
            .collect())
    }

    fn selected(&self) -> Option<NodeDescriptor> {
        self.state.lock().selected.clone()
    }

    fn unselect(&mut self) -> Result<()> {
        self.state.lock().selected = None;
        Ok(())
    }

    fn connect(&mut self, _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if state.selected.is_none() {
            return Err(Error::ConnectionFailed("no node selected".to_string()));
        }
        if state.fail_connects > 0 {
            state.fail_connects -= 1;
            return Err(Error::ConnectionFailed("scripted failure".to_string()));
        }
        state.connected = true;
        drop(state);
        self.ctx.notices.notify_connected();
        Ok(())
    }

    fn connected(&self) -> bool {
        self.state.lock().connected
    }

    fn disconnect(&mut self) -> Result<()> {
        self.state.lock().connected = false;
        self.ctx.notices.notify_disconnected();
        Ok(())
    }

    fn deliver(&mut self, channel: Channel, payload: &[u8], _timeout: Duration) -> Result<()> {
        let delay = self.state.lock().deliver_delay;
        if !delay.is_zero() {
            std::thread::sleep(delay);
        }
        let mut state = self.state.lock();
        if !state.connected {
            return Err(Error::DeviceDisconnected);
        }
        if state.fail_delivers > 0 {
            state.fail_delivers -= 1;
            return Err(Error::DeliverFailed("scripted failure".to_string()));
        }
        state.deliveries.push((channel, payload.to_vec()));
        Ok(())
    }

    fn transmit(&mut self, channel: Channel, payload: &[u8], _timeout: Duration) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(Error::DeviceDisconnected);
        }
        state.transmissions.push((channel, payload.to_vec()));
        Ok(())
    }

    fn request(
        &mut self,
        channel: Channel,
        payload: &[u8],
        expect_response: bool,
        _timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(Error::DeviceDisconnected);
        }
        state.deliveries.push((channel, payload.to_vec()));
        if !expect_response {
            return Ok(None);
        }
        state
            .responses
            .pop_front()
            .map(Some)
            .ok_or(Error::ResponseTimeout)
    }

    fn set_clock(&mut self, millis: u64) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(Error::DeviceDisconnected);
        }
        state.clock = millis;
        Ok(())
    }

    fn get_clock(&mut self) -> Result<u64> {
        let state = self.state.lock();
        if !state.connected {
            return Err(Error::DeviceDisconnected);
        }
        Ok(state.clock)
    }

    fn update_firmware(&mut self, firmware: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        if !state.connected {
            return Err(Error::DeviceDisconnected);
        }
        state.firmware_sizes.push(firmware.len());
        Ok(())
    }

    fn destroy(&mut self) {
        let mut state = self.state.lock();
        state.connected = false;
        state.selected = None;
        state.destroyed += 1;
        drop(state);
        self.ctx.notices.notify_disconnected();
    }

    fn packet_budget(&self) -> usize {
        self.state.lock().packet_budget
    }
}
