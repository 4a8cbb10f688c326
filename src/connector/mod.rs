//! Transport connectors
//!
//! A [`Connector`] owns one physical link to a node and exposes the
//! capability set the scheduler drives: selection, connection lifecycle,
//! payload delivery, request/response exchange, clock access and firmware
//! update. All methods block; the scheduler worker thread is the only
//! caller.

use crate::error::Result;
use crate::events::EventBus;
use crossbeam_channel::Sender;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

pub mod ble;
pub mod mock;
pub mod serial;

pub use ble::{BleConnector, BleLink, BleProfile, NotificationAssembler};
pub use mock::{MockConnector, MockConnectorHandle};
pub use serial::{SerialConnector, SerialProfile};

/// Minimum timeout for select and connect operations
pub const MIN_CONNECT_TIMEOUT: Duration = Duration::from_secs(1);

/// Minimum scan window
pub const MIN_SCAN_WINDOW: Duration = Duration::from_secs(1);

/// Minimum timeout for execute and request operations
pub const MIN_IO_TIMEOUT: Duration = Duration::from_millis(100);

/// Fixed retry budget for clock register access
pub const CLOCK_TRIES: u32 = 3;

/// Delay between clock register retries
pub const CLOCK_RETRY_BACKOFF: Duration = Duration::from_secs(1);

/// Logical channel multiplexed over one link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Channel {
    /// Network-level traffic (commands, requests)
    Network = 0,
    /// Device-local traffic (config reads/writes)
    Device = 1,
    /// Clock register access
    Clock = 2,
}

/// Selection criteria matched against scan results
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Criteria {
    /// Advertised name, exact match; `None` matches any
    pub name: Option<String>,
    /// MAC address / port path, exact match; `None` matches any
    pub mac: Option<String>,
}

impl Criteria {
    /// Match any node
    pub fn any() -> Self {
        Self::default()
    }

    /// True when the descriptor satisfies every populated field
    pub fn matches(&self, node: &NodeDescriptor) -> bool {
        if let Some(name) = &self.name {
            if &node.name != name {
                return false;
            }
        }
        if let Some(mac) = &self.mac {
            if &node.mac != mac {
                return false;
            }
        }
        true
    }
}

/// One node found during scanning
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeDescriptor {
    /// MAC address, or serial port path for wired nodes
    pub mac: String,
    /// Advertised name
    pub name: String,
    /// Signal strength in dBm; 0 for wired links
    pub rssi: i16,
}

/// Physical link transitions reported upward to the reconnection controller
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkNotice {
    /// Physical link established
    Connected,
    /// Physical link lost
    Disconnected,
}

/// Exactly-once link notice reporter.
///
/// Connectors can observe the same drop from several code paths (a failed
/// write and a failed read racing); the guard makes sure the controller
/// sees each physical transition once.
#[derive(Clone)]
pub struct NoticeSender {
    tx: Sender<LinkNotice>,
    link_up: Arc<AtomicBool>,
}

impl NoticeSender {
    /// Wrap a raw channel sender
    pub fn new(tx: Sender<LinkNotice>) -> Self {
        Self {
            tx,
            link_up: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Report the link as up; no-op if already reported
    pub fn notify_connected(&self) {
        if !self.link_up.swap(true, Ordering::SeqCst) {
            let _ = self.tx.send(LinkNotice::Connected);
        }
    }

    /// Report the link as down; no-op if already reported
    pub fn notify_disconnected(&self) {
        if self.link_up.swap(false, Ordering::SeqCst) {
            let _ = self.tx.send(LinkNotice::Disconnected);
        }
    }

    /// Current guard state
    pub fn is_link_up(&self) -> bool {
        self.link_up.load(Ordering::SeqCst)
    }
}

/// Capability set the scheduler drives.
///
/// Methods block until the operation completes or its timeout expires.
/// Implementations report physical link transitions through their
/// [`NoticeSender`] and publish upward events through their [`EventBus`].
pub trait Connector: Send {
    /// Scan and pick the first node matching `criteria`, interactively
    /// where the medium supports it
    fn user_select(&mut self, criteria: &Criteria, timeout: Duration) -> Result<NodeDescriptor>;

    /// Scan and pick the strongest node matching `criteria` without
    /// interaction
    fn auto_select(
        &mut self,
        criteria: &Criteria,
        scan_window: Duration,
        timeout: Duration,
    ) -> Result<NodeDescriptor>;

    /// Enumerate all matching nodes visible within the scan window,
    /// strongest signal first
    fn scan(&mut self, criteria: &Criteria, scan_window: Duration) -> Result<Vec<NodeDescriptor>>;

    /// Currently selected node, if any
    fn selected(&self) -> Option<NodeDescriptor>;

    /// Forget the current selection
    fn unselect(&mut self) -> Result<()>;

    /// Open the physical link to the selected node
    fn connect(&mut self, timeout: Duration) -> Result<()>;

    /// True while the physical link is up
    fn connected(&self) -> bool;

    /// Close the physical link
    fn disconnect(&mut self) -> Result<()>;

    /// Reliable delivery of one message (may span several link frames)
    fn deliver(&mut self, channel: Channel, payload: &[u8], timeout: Duration) -> Result<()>;

    /// Best-effort single-frame send, no acknowledgement
    fn transmit(&mut self, channel: Channel, payload: &[u8], timeout: Duration) -> Result<()>;

    /// Deliver a request and, when a response is expected, block for the
    /// correlated response payload
    fn request(
        &mut self,
        channel: Channel,
        payload: &[u8],
        expect_response: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>>;

    /// Write the node's millisecond clock register
    fn set_clock(&mut self, millis: u64) -> Result<()>;

    /// Read the node's millisecond clock register
    fn get_clock(&mut self) -> Result<u64>;

    /// Run the full firmware-update sequence
    fn update_firmware(&mut self, firmware: &[u8]) -> Result<()>;

    /// Best-effort teardown; secondary errors are logged, not returned
    fn destroy(&mut self);

    /// Largest single message `deliver` accepts without splitting at the
    /// scheduler level; the merge pass folds queued writes up to this
    fn packet_budget(&self) -> usize;
}

/// Everything a connector needs from its owner at construction time
#[derive(Clone)]
pub struct ConnectorContext {
    /// Upward event fan-out
    pub events: EventBus,
    /// Exactly-once link transition reporter
    pub notices: NoticeSender,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn criteria_match_rules() {
        let node = NodeDescriptor {
            mac: "AA:BB:CC:DD:EE:FF".to_string(),
            name: "lamp-12".to_string(),
            rssi: -60,
        };

        assert!(Criteria::any().matches(&node));
        assert!(Criteria {
            name: Some("lamp-12".to_string()),
            mac: None,
        }
        .matches(&node));
        assert!(!Criteria {
            name: Some("lamp-13".to_string()),
            mac: None,
        }
        .matches(&node));
        assert!(!Criteria {
            name: Some("lamp-12".to_string()),
            mac: Some("00:00:00:00:00:00".to_string()),
        }
        .matches(&node));
    }

    #[test]
    fn notice_sender_fires_once_per_transition() {
        let (tx, rx) = crossbeam_channel::unbounded();
        let notices = NoticeSender::new(tx);

        notices.notify_connected();
        notices.notify_connected();
        notices.notify_disconnected();
        notices.notify_disconnected();
        notices.notify_connected();

        let seen: Vec<_> = rx.try_iter().collect();
        assert_eq!(
            seen,
            vec![
                LinkNotice::Connected,
                LinkNotice::Disconnected,
                LinkNotice::Connected
            ]
        );
    }
}
