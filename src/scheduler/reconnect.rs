//! Reconnection controller
//!
//! A supervisor thread watches the connector's link notices and a periodic
//! tick. An unexpected drop while logically connected triggers a delayed
//! auto-select + connect with the last-used criteria (`on_drop`); the tick
//! retries from a disconnected idle state (`autonomous`). Both paths stand
//! down while a manual selection or connect is in flight.

use super::{Command, CommandKind, ConnectionState, Shared};
use crate::connector::LinkNotice;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

/// Notice-poll granularity; bounds shutdown latency
const POLL: Duration = Duration::from_millis(100);

/// Reconnection policy
#[derive(Debug, Clone)]
pub struct ReconnectOptions {
    /// Reconnect after an unexpected link drop
    pub on_drop: bool,
    /// Keep trying to reach a node while disconnected
    pub autonomous: bool,
    /// Wait before the first attempt after a drop
    pub delay: Duration,
    /// Autonomous retry period
    pub tick: Duration,
    /// Budget for each reconnect select and connect
    pub connect_timeout: Duration,
    /// Scan window for the reconnect selection
    pub scan_window: Duration,
}

impl Default for ReconnectOptions {
    fn default() -> Self {
        Self {
            on_drop: false,
            autonomous: false,
            delay: Duration::from_secs(2),
            tick: Duration::from_secs(5),
            connect_timeout: Duration::from_secs(10),
            scan_window: Duration::from_secs(2),
        }
    }
}

pub(crate) fn supervise(
    shared: Arc<Shared>,
    notice_rx: Receiver<LinkNotice>,
    options: ReconnectOptions,
) {
    let mut next_tick = Instant::now() + options.tick;

    loop {
        if shared.shutdown.load(Ordering::SeqCst) {
            return;
        }

        match notice_rx.recv_timeout(POLL) {
            Ok(LinkNotice::Connected) => {
                // The worker already walked the state machine
            }
            Ok(LinkNotice::Disconnected) => {
                // Intentional disconnects move the state off Connected
                // before the notice lands; only a drop still shows Connected
                if shared.connection_state() == ConnectionState::Connected {
                    log::warn!("Link dropped");
                    if options.on_drop {
                        shared.set_state(ConnectionState::Connecting);
                        log::info!("Reconnecting in {:?}", options.delay);
                        thread::sleep(options.delay);
                        if !try_reconnect(&shared, &options) {
                            shared.set_state(ConnectionState::Disconnected);
                        }
                    } else {
                        shared.set_state(ConnectionState::Disconnected);
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {
                if Instant::now() >= next_tick {
                    next_tick = Instant::now() + options.tick;
                    if options.autonomous
                        && shared.connection_state() == ConnectionState::Disconnected
                    {
                        try_reconnect(&shared, &options);
                    }
                }
            }
            Err(RecvTimeoutError::Disconnected) => return,
        }
    }
}

/// Enqueue a detached auto-select + connect with the last-used criteria.
/// Returns false when a manual selection/connect is in flight.
fn try_reconnect(shared: &Shared, options: &ReconnectOptions) -> bool {
    if shared.selecting.load(Ordering::SeqCst) || shared.connecting.load(Ordering::SeqCst) {
        log::debug!("Manual selection/connect in flight, skipping reconnect");
        return false;
    }

    let criteria = shared.last_criteria.lock().clone().unwrap_or_default();
    shared.enqueue(Command::detached(CommandKind::AutoSelect {
        criteria,
        scan_window: options.scan_window,
        timeout: options.connect_timeout,
    }));
    shared.enqueue(Command::detached(CommandKind::Connect {
        timeout: options.connect_timeout,
    }));
    true
}
