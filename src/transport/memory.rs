//! In-memory transport for hardware-free tests
//!
//! Scripted double for [`Transport`]: tests push bytes the connector will
//! read, and can script per-flush responses (the remote side's control
//! frames) so retry loops can be exercised deterministically.

use super::Transport;
use crate::error::Result;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;

#[derive(Default)]
struct Inner {
    /// Bytes the connector will read next
    input: VecDeque<u8>,
    /// Everything the connector wrote
    written: Vec<u8>,
    /// Number of completed flush calls
    flushes: usize,
    /// Responses queued into `input`, one per flush
    on_flush: VecDeque<Vec<u8>>,
}

/// Handle shared between a [`MemoryTransport`] and the test body
#[derive(Clone, Default)]
pub struct MemoryTransportHandle {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransportHandle {
    /// Queue bytes for the connector to read
    pub fn push_input(&self, bytes: &[u8]) {
        self.inner.lock().input.extend(bytes.iter().copied());
    }

    /// Queue a response that is injected into the input after the next
    /// unconsumed flush
    pub fn respond_on_flush(&self, bytes: &[u8]) {
        self.inner.lock().on_flush.push_back(bytes.to_vec());
    }

    /// All bytes written by the connector so far
    pub fn written(&self) -> Vec<u8> {
        self.inner.lock().written.clone()
    }

    /// Number of flush calls observed (one per completed frame)
    pub fn flush_count(&self) -> usize {
        self.inner.lock().flushes
    }

    /// Drop everything written so far
    pub fn clear_written(&self) {
        self.inner.lock().written.clear();
    }
}

/// In-memory [`Transport`] implementation
#[derive(Default)]
pub struct MemoryTransport {
    inner: Arc<Mutex<Inner>>,
}

impl MemoryTransport {
    /// Create a transport and its test handle
    pub fn new() -> (Self, MemoryTransportHandle) {
        let inner: Arc<Mutex<Inner>> = Arc::default();
        (
            Self {
                inner: Arc::clone(&inner),
            },
            MemoryTransportHandle { inner },
        )
    }
}

impl Transport for MemoryTransport {
    fn read(&mut self, buffer: &mut [u8]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let mut n = 0;
        while n < buffer.len() {
            match inner.input.pop_front() {
                Some(b) => {
                    buffer[n] = b;
                    n += 1;
                }
                None => break,
            }
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize> {
        self.inner.lock().written.extend_from_slice(data);
        Ok(data.len())
    }

    fn flush(&mut self) -> Result<()> {
        let mut inner = self.inner.lock();
        inner.flushes += 1;
        if let Some(response) = inner.on_flush.pop_front() {
            inner.input.extend(response.iter().copied());
        }
        Ok(())
    }

    fn available(&mut self) -> Result<usize> {
        Ok(self.inner.lock().input.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scripted_flush_responses_arrive_in_order() {
        let (mut transport, handle) = MemoryTransport::new();
        handle.respond_on_flush(b"one");
        handle.respond_on_flush(b"two");

        transport.write_all(b"frame-a").unwrap();
        transport.flush().unwrap();
        let mut buf = [0u8; 16];
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"one");

        transport.flush().unwrap();
        let n = transport.read(&mut buf).unwrap();
        assert_eq!(&buf[..n], b"two");

        assert_eq!(handle.written(), b"frame-a");
        assert_eq!(handle.flush_count(), 2);
    }
}
