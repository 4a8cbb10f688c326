//! Serialized command scheduler
//!
//! All connector traffic funnels through one pending queue drained by a
//! single worker thread, so exactly one transport operation is in flight
//! at any time. Callers block on a bounded(1) outcome channel; the
//! reconnection controller enqueues detached commands nobody waits for.
//!
//! Queue rules:
//! - strictly FIFO dispatch
//! - at enqueue, a labeled Execute supersedes an older queued Execute
//!   with the same label; GetClock and FirmwareUpdate are single-flight
//! - at dispatch, consecutive queued Executes merge into one delivery
//!   while the combined payload stays within the connector's budget

pub mod command;
mod reconnect;

pub use command::{Command, CommandKind, Reply};
pub use reconnect::ReconnectOptions;

use crate::clock::DeviceClock;
use crate::connector::{
    Channel, Connector, ConnectorContext, Criteria, LinkNotice, NodeDescriptor, NoticeSender,
    MIN_CONNECT_TIMEOUT, MIN_IO_TIMEOUT, MIN_SCAN_WINDOW,
};
use crate::error::{Error, Result};
use crate::events::{Event, EventBus};
use crossbeam_channel::{bounded, unbounded, Receiver, Sender};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

/// Logical connection lifecycle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// No link
    Disconnected,
    /// Link being established
    Connecting,
    /// Link up
    Connected,
    /// Link being torn down
    Disconnecting,
}

pub(crate) enum WorkerMsg {
    /// Queue contents changed
    Wake,
    /// Replace the worker-owned connector; acked once swapped in
    Attach(Box<dyn Connector>, Sender<()>),
}

/// State shared between the public handle, the worker, and the
/// reconnection controller
pub(crate) struct Shared {
    pub(crate) queue: Mutex<VecDeque<Command>>,
    pub(crate) wake_tx: Sender<WorkerMsg>,
    state: Mutex<ConnectionState>,
    pub(crate) selecting: AtomicBool,
    pub(crate) connecting: AtomicBool,
    pub(crate) clock: Mutex<DeviceClock>,
    pub(crate) events: EventBus,
    pub(crate) last_criteria: Mutex<Option<Criteria>>,
    pub(crate) shutdown: AtomicBool,
}

impl Shared {
    pub(crate) fn enqueue(&self, cmd: Command) {
        self.queue.lock().push_back(cmd);
        let _ = self.wake_tx.send(WorkerMsg::Wake);
    }

    pub(crate) fn connection_state(&self) -> ConnectionState {
        *self.state.lock()
    }

    /// Change state and publish the matching upward event
    pub(crate) fn set_state(&self, new: ConnectionState) {
        {
            let mut state = self.state.lock();
            if *state == new {
                return;
            }
            *state = new;
        }
        log::debug!("Connection state: {:?}", new);
        self.events.publish(match new {
            ConnectionState::Disconnected => Event::Disconnected,
            ConnectionState::Connecting => Event::Connecting,
            ConnectionState::Connected => Event::Connected,
            ConnectionState::Disconnecting => Event::Disconnecting,
        });
    }
}

/// Public handle: validates, enqueues, and blocks for outcomes
pub struct Scheduler {
    shared: Arc<Shared>,
    notice_tx: Sender<LinkNotice>,
    worker: Option<JoinHandle<()>>,
    supervisor: Option<JoinHandle<()>>,
}

impl Scheduler {
    /// Start the worker and the reconnection controller
    pub fn new(options: ReconnectOptions) -> Self {
        let (wake_tx, wake_rx) = unbounded();
        let (notice_tx, notice_rx) = unbounded();

        let shared = Arc::new(Shared {
            queue: Mutex::new(VecDeque::new()),
            wake_tx,
            state: Mutex::new(ConnectionState::Disconnected),
            selecting: AtomicBool::new(false),
            connecting: AtomicBool::new(false),
            clock: Mutex::new(DeviceClock::zero()),
            events: EventBus::new(),
            last_criteria: Mutex::new(None),
            shutdown: AtomicBool::new(false),
        });

        let worker_shared = Arc::clone(&shared);
        let worker = thread::Builder::new()
            .name("dipa-sched".to_string())
            .spawn(move || worker_loop(worker_shared, wake_rx))
            .ok();

        let supervisor_shared = Arc::clone(&shared);
        let supervisor = thread::Builder::new()
            .name("dipa-reconn".to_string())
            .spawn(move || reconnect::supervise(supervisor_shared, notice_rx, options))
            .ok();

        Self {
            shared,
            notice_tx,
            worker,
            supervisor,
        }
    }

    /// Context to build connectors with: this scheduler's event bus and
    /// link-notice channel
    pub fn context(&self) -> ConnectorContext {
        ConnectorContext {
            events: self.shared.events.clone(),
            notices: NoticeSender::new(self.notice_tx.clone()),
        }
    }

    /// Hand a connector to the worker; any previous one is destroyed
    pub fn attach(&self, connector: Box<dyn Connector>) -> Result<()> {
        let (ack_tx, ack_rx) = bounded(1);
        self.shared
            .wake_tx
            .send(WorkerMsg::Attach(connector, ack_tx))
            .map_err(|_| Error::ShutDown)?;
        ack_rx.recv().map_err(|_| Error::ShutDown)
    }

    /// The scheduler's upward event bus
    pub fn events(&self) -> EventBus {
        self.shared.events.clone()
    }

    /// Current logical connection state
    pub fn connection_state(&self) -> ConnectionState {
        self.shared.connection_state()
    }

    /// Estimated current value of the node's clock
    pub fn clock_millis(&self) -> u64 {
        self.shared.clock.lock().millis()
    }

    fn submit(&self, kind: CommandKind) -> Result<Reply> {
        let (cmd, rx) = Command::new(kind);
        self.shared.enqueue(cmd);
        rx.recv().map_err(|_| Error::ShutDown)?
    }

    /// Interactive selection. One selection may run at a time.
    pub fn user_select(&self, criteria: &Criteria, timeout: Duration) -> Result<NodeDescriptor> {
        if timeout < MIN_CONNECT_TIMEOUT {
            return Err(Error::InvalidTimeout(timeout));
        }
        if self.shared.selecting.swap(true, Ordering::SeqCst) {
            return Err(Error::SelectingInProgress);
        }
        *self.shared.last_criteria.lock() = Some(criteria.clone());
        match self.submit(CommandKind::UserSelect {
            criteria: criteria.clone(),
            timeout,
        })? {
            Reply::Node(node) => Ok(node),
            _ => Err(Error::Other("unexpected reply".to_string())),
        }
    }

    /// Non-interactive selection of the strongest match
    pub fn auto_select(
        &self,
        criteria: &Criteria,
        scan_window: Duration,
        timeout: Duration,
    ) -> Result<NodeDescriptor> {
        if scan_window < MIN_SCAN_WINDOW {
            return Err(Error::InvalidScanPeriod(scan_window));
        }
        if timeout < MIN_CONNECT_TIMEOUT {
            return Err(Error::InvalidTimeout(timeout));
        }
        if self.shared.selecting.swap(true, Ordering::SeqCst) {
            return Err(Error::SelectingInProgress);
        }
        *self.shared.last_criteria.lock() = Some(criteria.clone());
        match self.submit(CommandKind::AutoSelect {
            criteria: criteria.clone(),
            scan_window,
            timeout,
        })? {
            Reply::Node(node) => Ok(node),
            _ => Err(Error::Other("unexpected reply".to_string())),
        }
    }

    /// Enumerate matching nodes
    pub fn scan(&self, criteria: &Criteria, scan_window: Duration) -> Result<Vec<NodeDescriptor>> {
        if scan_window < MIN_SCAN_WINDOW {
            return Err(Error::InvalidScanPeriod(scan_window));
        }
        match self.submit(CommandKind::Scan {
            criteria: criteria.clone(),
            scan_window,
        })? {
            Reply::Nodes(nodes) => Ok(nodes),
            _ => Err(Error::Other("unexpected reply".to_string())),
        }
    }

    /// Currently selected node, if any
    pub fn selected(&self) -> Result<Option<NodeDescriptor>> {
        match self.submit(CommandKind::Selected)? {
            Reply::MaybeNode(node) => Ok(node),
            _ => Err(Error::Other("unexpected reply".to_string())),
        }
    }

    /// Forget the current selection
    pub fn unselect(&self) -> Result<()> {
        self.submit(CommandKind::Unselect).map(|_| ())
    }

    /// Open the link to the selected node. One connect may run at a time.
    pub fn connect(&self, timeout: Duration) -> Result<()> {
        if timeout < MIN_CONNECT_TIMEOUT {
            return Err(Error::InvalidTimeout(timeout));
        }
        if self.shared.connecting.swap(true, Ordering::SeqCst) {
            return Err(Error::ConnectingInProgress);
        }
        self.submit(CommandKind::Connect { timeout }).map(|_| ())
    }

    /// True while the link is up
    pub fn connected(&self) -> Result<bool> {
        match self.submit(CommandKind::Connected)? {
            Reply::Flag(flag) => Ok(flag),
            _ => Err(Error::Other("unexpected reply".to_string())),
        }
    }

    /// Close the link
    pub fn disconnect(&self) -> Result<()> {
        self.submit(CommandKind::Disconnect).map(|_| ())
    }

    /// Reliable write of one payload.
    ///
    /// A non-empty `label` makes the command supersedable: if an older
    /// Execute with the same label is still queued, it resolves Ok without
    /// transmission and this one takes its turn.
    pub fn execute(&self, payload: &[u8], label: Option<&str>, timeout: Duration) -> Result<()> {
        if timeout < MIN_IO_TIMEOUT {
            return Err(Error::InvalidTimeout(timeout));
        }
        let (cmd, rx) = Command::new(CommandKind::Execute {
            payload: payload.to_vec(),
            label: label.map(String::from),
            timeout,
        });
        {
            let mut queue = self.shared.queue.lock();
            if let Some(label) = label {
                if let Some(pos) = queue
                    .iter()
                    .position(|c| c.execute_label() == Some(label))
                {
                    if let Some(mut old) = queue.remove(pos) {
                        log::debug!("Superseding queued execute '{}'", label);
                        old.resolve(Ok(Reply::None));
                    }
                }
            }
            queue.push_back(cmd);
        }
        let _ = self.shared.wake_tx.send(WorkerMsg::Wake);
        rx.recv().map_err(|_| Error::ShutDown)?.map(|_| ())
    }

    /// Request exchange; returns the reply payload when one was expected
    pub fn request(
        &self,
        payload: &[u8],
        expect_response: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        if timeout < MIN_IO_TIMEOUT {
            return Err(Error::InvalidTimeout(timeout));
        }
        match self.submit(CommandKind::Request {
            payload: payload.to_vec(),
            expect_response,
            timeout,
        })? {
            Reply::Bytes(bytes) => Ok(Some(bytes)),
            Reply::None => Ok(None),
            _ => Err(Error::Other("unexpected reply".to_string())),
        }
    }

    /// Push the locally tracked clock value to the node
    pub fn sync_clock(&self) -> Result<()> {
        self.submit(CommandKind::SetClock).map(|_| ())
    }

    /// Read the node's clock register, replacing the local mirror.
    /// Single-flight: a newer queued read fails the older with
    /// `Superseded`.
    pub fn fetch_clock(&self) -> Result<u64> {
        let (cmd, rx) = Command::new(CommandKind::GetClock);
        self.enqueue_single_flight(cmd, |kind| matches!(kind, CommandKind::GetClock));
        match rx.recv().map_err(|_| Error::ShutDown)?? {
            Reply::ClockMillis(millis) => Ok(millis),
            _ => Err(Error::Other("unexpected reply".to_string())),
        }
    }

    /// Run the firmware-update sequence. Single-flight like `fetch_clock`.
    pub fn update_firmware(&self, firmware: Vec<u8>) -> Result<()> {
        let (cmd, rx) = Command::new(CommandKind::FirmwareUpdate { firmware });
        self.enqueue_single_flight(cmd, |kind| matches!(kind, CommandKind::FirmwareUpdate { .. }));
        rx.recv().map_err(|_| Error::ShutDown)?.map(|_| ())
    }

    /// Tear down the attached connector; always leaves none attached
    pub fn destroy(&self) -> Result<()> {
        self.submit(CommandKind::Destroy).map(|_| ())
    }

    fn enqueue_single_flight(&self, cmd: Command, same_kind: impl Fn(&CommandKind) -> bool) {
        {
            let mut queue = self.shared.queue.lock();
            if let Some(pos) = queue.iter().position(|c| same_kind(&c.kind)) {
                if let Some(mut old) = queue.remove(pos) {
                    old.resolve(Err(Error::Superseded));
                }
            }
            queue.push_back(cmd);
        }
        let _ = self.shared.wake_tx.send(WorkerMsg::Wake);
    }
}

impl Drop for Scheduler {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::SeqCst);
        let _ = self.shared.wake_tx.send(WorkerMsg::Wake);
        if let Some(handle) = self.worker.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.supervisor.take() {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: Arc<Shared>, rx: Receiver<WorkerMsg>) {
    let mut connector: Option<Box<dyn Connector>> = None;

    while let Ok(msg) = rx.recv() {
        if shared.shutdown.load(Ordering::SeqCst) {
            break;
        }
        match msg {
            WorkerMsg::Attach(new_connector, ack) => {
                if let Some(mut old) = connector.take() {
                    log::info!("Replacing attached connector");
                    old.destroy();
                }
                connector = Some(new_connector);
                let _ = ack.send(());
            }
            WorkerMsg::Wake => loop {
                let cmd = shared.queue.lock().pop_front();
                match cmd {
                    Some(cmd) => dispatch(&shared, &mut connector, cmd),
                    None => break,
                }
            },
        }
    }

    if let Some(mut conn) = connector.take() {
        conn.destroy();
    }
    // Dropping queued commands resolves their callers with ShutDown
    shared.queue.lock().clear();
}

fn dispatch(shared: &Shared, connector: &mut Option<Box<dyn Connector>>, mut cmd: Command) {
    // Execute commands merge with queued followers before dispatch
    if let CommandKind::Execute {
        payload, timeout, ..
    } = &cmd.kind
    {
        let budget = connector.as_ref().map(|c| c.packet_budget()).unwrap_or(0);
        let mut merged = payload.clone();
        let timeout = *timeout;

        let mut members: Vec<Command> = Vec::new();
        {
            let mut queue = shared.queue.lock();
            while let Some(front) = queue.front() {
                let fits = match &front.kind {
                    CommandKind::Execute { payload: next, .. } => {
                        merged.len() + next.len() <= budget
                    }
                    _ => false,
                };
                if !fits {
                    break;
                }
                if let Some(follower) = queue.pop_front() {
                    if let CommandKind::Execute { payload: next, .. } = &follower.kind {
                        merged.extend_from_slice(next);
                    }
                    members.push(follower);
                }
            }
        }
        if !members.is_empty() {
            log::debug!(
                "Merged {} executes into one {}-byte delivery",
                members.len() + 1,
                merged.len()
            );
        }

        let result = match connector.as_deref_mut() {
            Some(conn) => conn.deliver(Channel::Network, &merged, timeout),
            None => Err(Error::NoConnectorAttached),
        };
        for mut member in members {
            member.resolve(result.clone().map(|()| Reply::None));
        }
        cmd.resolve(result.map(|()| Reply::None));
        return;
    }

    let result: Result<Reply> = match &cmd.kind {
        CommandKind::Selected => Ok(Reply::MaybeNode(
            connector.as_ref().and_then(|c| c.selected()),
        )),
        CommandKind::Connected => Ok(Reply::Flag(
            connector.as_ref().map(|c| c.connected()).unwrap_or(false),
        )),
        CommandKind::Destroy => {
            if let Some(mut conn) = connector.take() {
                conn.destroy();
            }
            shared.set_state(ConnectionState::Disconnected);
            Ok(Reply::None)
        }
        kind => match connector.as_deref_mut() {
            None => Err(Error::NoConnectorAttached),
            Some(conn) => run_on_connector(shared, conn, kind),
        },
    };

    cmd.resolve(result);

    // In-flight guards lift once the command has run
    match &cmd.kind {
        CommandKind::UserSelect { .. } | CommandKind::AutoSelect { .. } => {
            shared.selecting.store(false, Ordering::SeqCst);
        }
        CommandKind::Connect { .. } => {
            shared.connecting.store(false, Ordering::SeqCst);
        }
        _ => {}
    }
}

fn run_on_connector(
    shared: &Shared,
    conn: &mut dyn Connector,
    kind: &CommandKind,
) -> Result<Reply> {
    match kind {
        CommandKind::UserSelect { criteria, timeout } => {
            conn.user_select(criteria, *timeout).map(Reply::Node)
        }
        CommandKind::AutoSelect {
            criteria,
            scan_window,
            timeout,
        } => conn
            .auto_select(criteria, *scan_window, *timeout)
            .map(Reply::Node),
        CommandKind::Scan {
            criteria,
            scan_window,
        } => conn.scan(criteria, *scan_window).map(Reply::Nodes),
        CommandKind::Unselect => conn.unselect().map(|()| Reply::None),
        CommandKind::Connect { timeout } => {
            shared.set_state(ConnectionState::Connecting);
            match conn.connect(*timeout) {
                Ok(()) => {
                    shared.set_state(ConnectionState::Connected);
                    // Fresh clock reading replaces the mirror wholesale
                    match conn.get_clock() {
                        Ok(millis) => {
                            *shared.clock.lock() = DeviceClock::new(millis);
                            log::info!("Clock synchronized at {} ms", millis);
                        }
                        Err(e) => log::warn!("Clock sync after connect failed: {}", e),
                    }
                    Ok(Reply::None)
                }
                Err(e) => {
                    shared.set_state(ConnectionState::Disconnected);
                    Err(e)
                }
            }
        }
        CommandKind::Disconnect => {
            shared.set_state(ConnectionState::Disconnecting);
            let result = conn.disconnect();
            shared.set_state(ConnectionState::Disconnected);
            result.map(|()| Reply::None)
        }
        CommandKind::Request {
            payload,
            expect_response,
            timeout,
        } => conn
            .request(Channel::Network, payload, *expect_response, *timeout)
            .map(|reply| match reply {
                Some(bytes) => Reply::Bytes(bytes),
                None => Reply::None,
            }),
        CommandKind::SetClock => {
            let millis = shared.clock.lock().millis();
            conn.set_clock(millis).map(|()| Reply::None)
        }
        CommandKind::GetClock => conn.get_clock().map(|millis| {
            *shared.clock.lock() = DeviceClock::new(millis);
            Reply::ClockMillis(millis)
        }),
        CommandKind::FirmwareUpdate { firmware } => {
            conn.update_firmware(firmware).map(|()| Reply::None)
        }
        CommandKind::Execute { .. }
        | CommandKind::Selected
        | CommandKind::Connected
        | CommandKind::Destroy => unreachable!("handled before reaching the connector"),
    }
}
