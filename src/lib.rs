//! dipa-link
//!
//! Client runtime for networks of lighting-controller nodes. One
//! [`Scheduler`](scheduler::Scheduler) serializes every transport
//! operation through a pending queue with merge and supersede rules, and
//! drives a pluggable [`Connector`](connector::Connector): BLE-style
//! chunked GATT links or framed serial byte streams, both built on a
//! little-endian cursor codec and CRC-protected frames.

pub mod clock;
pub mod codec;
pub mod config;
pub mod connector;
pub mod error;
pub mod events;
pub mod frame;
pub mod scheduler;
pub mod transport;

pub use clock::DeviceClock;
pub use config::AppConfig;
pub use connector::{
    BleConnector, BleProfile, Channel, Connector, Criteria, LinkNotice, MockConnector,
    NodeDescriptor, NoticeSender, SerialConnector, SerialProfile,
};
pub use error::{Error, Result};
pub use events::{Event, EventBus, OtaStatus};
pub use scheduler::{ConnectionState, ReconnectOptions, Scheduler};
