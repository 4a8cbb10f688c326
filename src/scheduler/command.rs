//! Queued commands and their single-resolution outcomes

use crate::connector::{Criteria, NodeDescriptor};
use crate::error::{Error, Result};
use crossbeam_channel::{bounded, Receiver, Sender};
use std::time::Duration;

/// What a queued command asks the worker to do
#[derive(Debug, Clone)]
pub enum CommandKind {
    /// Scan and select interactively
    UserSelect {
        /// Match filter
        criteria: Criteria,
        /// Overall budget
        timeout: Duration,
    },
    /// Scan and select the strongest match
    AutoSelect {
        /// Match filter
        criteria: Criteria,
        /// Advertisement listening window
        scan_window: Duration,
        /// Overall budget
        timeout: Duration,
    },
    /// Enumerate matching nodes
    Scan {
        /// Match filter
        criteria: Criteria,
        /// Advertisement listening window
        scan_window: Duration,
    },
    /// Report the current selection
    Selected,
    /// Forget the current selection
    Unselect,
    /// Open the link to the selected node
    Connect {
        /// Overall budget
        timeout: Duration,
    },
    /// Report whether the link is up
    Connected,
    /// Close the link
    Disconnect,
    /// Reliable write of one payload; mergeable and supersedable
    Execute {
        /// Message bytes
        payload: Vec<u8>,
        /// Supersede key; a newer queued Execute with the same label
        /// replaces this one
        label: Option<String>,
        /// Overall budget
        timeout: Duration,
    },
    /// Request exchange; reads a reply only when one is expected
    Request {
        /// Request bytes
        payload: Vec<u8>,
        /// Whether to block for a correlated response
        expect_response: bool,
        /// Overall budget
        timeout: Duration,
    },
    /// Push the locally tracked clock value to the node
    SetClock,
    /// Read the node's clock register; single-flight
    GetClock,
    /// Run the firmware-update sequence; single-flight
    FirmwareUpdate {
        /// Firmware image
        firmware: Vec<u8>,
    },
    /// Tear down the attached connector
    Destroy,
}

/// Successful outcome payload
#[derive(Debug, Clone)]
pub enum Reply {
    /// Nothing to report
    None,
    /// Raw response bytes
    Bytes(Vec<u8>),
    /// The node a selection settled on
    Node(NodeDescriptor),
    /// Current selection, possibly empty
    MaybeNode(Option<NodeDescriptor>),
    /// Scan results
    Nodes(Vec<NodeDescriptor>),
    /// Clock register value
    ClockMillis(u64),
    /// Boolean status
    Flag(bool),
}

enum Outcome {
    /// A caller is blocked on this channel
    Pending(Sender<Result<Reply>>),
    /// Fire-and-forget; failures only get logged
    Detached,
    /// Already resolved
    Resolved,
}

/// One unit of work in the pending queue.
///
/// Resolves exactly once; a second resolution is a programming error and
/// is dropped with a log.
pub struct Command {
    /// The requested operation
    pub kind: CommandKind,
    outcome: Outcome,
}

impl Command {
    /// Command paired with the receiver its caller blocks on
    pub fn new(kind: CommandKind) -> (Self, Receiver<Result<Reply>>) {
        let (tx, rx) = bounded(1);
        (
            Self {
                kind,
                outcome: Outcome::Pending(tx),
            },
            rx,
        )
    }

    /// Command nobody waits for (reconnection controller enqueues these)
    pub fn detached(kind: CommandKind) -> Self {
        Self {
            kind,
            outcome: Outcome::Detached,
        }
    }

    /// Supersede label, if this is a labeled Execute
    pub fn execute_label(&self) -> Option<&str> {
        match &self.kind {
            CommandKind::Execute {
                label: Some(label), ..
            } => Some(label),
            _ => None,
        }
    }

    /// Settle the outcome
    pub fn resolve(&mut self, result: Result<Reply>) {
        match std::mem::replace(&mut self.outcome, Outcome::Resolved) {
            Outcome::Pending(tx) => {
                // The caller may have stopped waiting; that is fine
                let _ = tx.send(result);
            }
            Outcome::Detached => {
                if let Err(e) = result {
                    log::warn!("Detached command failed: {}", e);
                }
            }
            Outcome::Resolved => {
                debug_assert!(false, "command resolved twice");
                log::error!("Command resolved twice, dropping outcome");
            }
        }
    }
}

impl Drop for Command {
    fn drop(&mut self) {
        // Commands still queued at shutdown fail their callers cleanly
        if matches!(self.outcome, Outcome::Pending(_)) {
            self.resolve(Err(Error::ShutDown));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolve_delivers_once() {
        let (mut cmd, rx) = Command::new(CommandKind::Connected);
        cmd.resolve(Ok(Reply::Flag(true)));
        assert!(matches!(rx.recv().unwrap(), Ok(Reply::Flag(true))));
    }

    #[test]
    fn dropping_unresolved_command_fails_the_caller() {
        let (cmd, rx) = Command::new(CommandKind::Disconnect);
        drop(cmd);
        assert!(matches!(rx.recv().unwrap(), Err(Error::ShutDown)));
    }

    #[test]
    fn execute_label_extraction() {
        let cmd = Command::detached(CommandKind::Execute {
            payload: vec![1],
            label: Some("fade".to_string()),
            timeout: Duration::from_millis(200),
        });
        assert_eq!(cmd.execute_label(), Some("fade"));

        let cmd = Command::detached(CommandKind::Execute {
            payload: vec![1],
            label: None,
            timeout: Duration::from_millis(200),
        });
        assert_eq!(cmd.execute_label(), None);
    }
}
