//! BLE-style chunked connector
//!
//! Outbound messages are split into link frames of `packet_size` bytes,
//! each carrying a 12-byte header:
//!
//! ```text
//! [write_id:u32 LE] [offset:u32 LE] [total:u32 LE] [payload…]
//! ```
//!
//! Inbound notifications arrive as raw chunks with no header; the remote
//! side signals "more follows" by padding every non-final chunk to exactly
//! the sentinel length. [`NotificationAssembler`] turns the chunk stream
//! back into whole messages.

use super::{
    Channel, Connector, ConnectorContext, Criteria, NodeDescriptor, CLOCK_RETRY_BACKOFF,
    CLOCK_TRIES,
};
use crate::codec::{BytesReader, BytesWriter};
use crate::error::{Error, Result};
use crate::events::{Event, OtaStatus};
use crate::frame::{self, ota, IdAllocator, Notification};
use std::thread;
use std::time::{Duration, Instant};

/// Header bytes prepended to every outbound link frame
pub const WRITE_HEADER_SIZE: usize = 12;

/// Radio-side operations the connector drives.
///
/// Implementations wrap an actual GATT stack; tests substitute a scripted
/// fake. All methods block up to their timeout.
pub trait BleLink: Send {
    /// Advertisements visible within the window
    fn scan(&mut self, window: Duration) -> Result<Vec<NodeDescriptor>>;

    /// Open the GATT connection to `mac`
    fn open(&mut self, mac: &str, timeout: Duration) -> Result<()>;

    /// Close the GATT connection
    fn close(&mut self) -> Result<()>;

    /// Write one link frame to the channel's characteristic; when
    /// `with_response` the call blocks for the link-level acknowledgement
    fn write_chunk(
        &mut self,
        channel: Channel,
        frame: &[u8],
        with_response: bool,
        timeout: Duration,
    ) -> Result<()>;

    /// Read one chunk from the channel's characteristic
    fn read_chunk(&mut self, channel: Channel, timeout: Duration) -> Result<Vec<u8>>;

    /// Wait for the next notification chunk; `None` on timeout
    fn poll_notification(&mut self, timeout: Duration) -> Result<Option<Vec<u8>>>;
}

/// Tunables of the chunked protocol
#[derive(Debug, Clone)]
pub struct BleProfile {
    /// Link frame size including the 12-byte header
    pub packet_size: usize,
    /// Chunk length the remote pads to when a notification continues
    pub notification_sentinel: usize,
    /// Firmware bytes per OTA write frame
    pub ota_chunk_size: usize,
    /// Wait after the updater reset frame
    pub reset_settle: Duration,
    /// Wait after the begin frame while the node erases flash
    pub erase_settle: Duration,
    /// Wait after the end frame before the node reboots into new firmware
    pub end_settle: Duration,
}

impl Default for BleProfile {
    fn default() -> Self {
        Self {
            packet_size: 512,
            notification_sentinel: 208,
            ota_chunk_size: 4096,
            reset_settle: Duration::from_millis(2500),
            erase_settle: Duration::from_millis(5000),
            end_settle: Duration::from_millis(2000),
        }
    }
}

/// Reassembles notification chunks into whole messages.
///
/// A chunk of exactly the sentinel length means the message continues;
/// any other length (shorter or longer) completes it. Messages that
/// complete empty are discarded.
pub struct NotificationAssembler {
    sentinel: usize,
    buffer: Vec<u8>,
}

impl NotificationAssembler {
    /// Assembler for a given sentinel length
    pub fn new(sentinel: usize) -> Self {
        Self {
            sentinel,
            buffer: Vec::new(),
        }
    }

    /// Feed one chunk; returns the completed message, if any
    pub fn feed(&mut self, chunk: &[u8]) -> Option<Vec<u8>> {
        self.buffer.extend_from_slice(chunk);
        if chunk.len() == self.sentinel {
            return None;
        }
        let message = std::mem::take(&mut self.buffer);
        if message.is_empty() {
            None
        } else {
            Some(message)
        }
    }

    /// Drop any partial accumulation
    pub fn reset(&mut self) {
        self.buffer.clear();
    }
}

/// Chunked-protocol connector over a [`BleLink`]
pub struct BleConnector<L: BleLink> {
    link: L,
    profile: BleProfile,
    ctx: ConnectorContext,
    ids: IdAllocator,
    assembler: NotificationAssembler,
    selected: Option<NodeDescriptor>,
    is_connected: bool,
}

impl<L: BleLink> BleConnector<L> {
    /// Wrap a link with the given profile
    pub fn new(link: L, profile: BleProfile, ctx: ConnectorContext) -> Self {
        let assembler = NotificationAssembler::new(profile.notification_sentinel);
        Self {
            link,
            profile,
            ctx,
            ids: IdAllocator::new(),
            assembler,
            selected: None,
            is_connected: false,
        }
    }

    fn chunk_capacity(&self) -> usize {
        self.profile.packet_size - WRITE_HEADER_SIZE
    }

    fn require_connected(&self) -> Result<()> {
        if self.is_connected {
            Ok(())
        } else {
            Err(Error::DeviceDisconnected)
        }
    }

    fn mark_disconnected(&mut self) {
        if self.is_connected {
            self.is_connected = false;
            self.assembler.reset();
            self.ctx.notices.notify_disconnected();
        }
    }

    /// Split `payload` into headered frames and write them sequentially
    fn write_message(
        &mut self,
        channel: Channel,
        payload: &[u8],
        with_response: bool,
        deadline: Instant,
    ) -> Result<()> {
        let write_id = self.ids.next_id();
        let capacity = self.chunk_capacity();
        let total = payload.len() as u32;

        let mut offset = 0usize;
        loop {
            let end = (offset + capacity).min(payload.len());
            let mut w = BytesWriter::with_capacity(WRITE_HEADER_SIZE + (end - offset));
            w.write_u32(write_id);
            w.write_u32(offset as u32);
            w.write_u32(total);
            w.write_bytes(&payload[offset..end]);

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ResponseTimeout);
            }
            if let Err(e) = self
                .link
                .write_chunk(channel, w.as_bytes(), with_response, remaining)
            {
                self.mark_disconnected();
                return Err(e);
            }

            offset = end;
            if offset >= payload.len() {
                return Ok(());
            }
        }
    }

    /// Poll `read_chunk` until a short chunk marks the end of the value
    fn read_message(&mut self, channel: Channel, deadline: Instant) -> Result<Vec<u8>> {
        let mut message = Vec::new();
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(Error::ResponseTimeout);
            }
            let chunk = self.link.read_chunk(channel, remaining)?;
            let done = chunk.len() < self.profile.packet_size;
            message.extend_from_slice(&chunk);
            if done {
                return Ok(message);
            }
        }
    }
}

impl<L: BleLink> Connector for BleConnector<L> {
    fn user_select(&mut self, criteria: &Criteria, timeout: Duration) -> Result<NodeDescriptor> {
        let found = self.link.scan(timeout)?;
        let node = found
            .into_iter()
            .find(|n| criteria.matches(n))
            .ok_or_else(|| Error::SelectionFailed("no matching advertisement".to_string()))?;
        log::info!("Selected node {} ({})", node.name, node.mac);
        self.selected = Some(node.clone());
        Ok(node)
    }

    fn auto_select(
        &mut self,
        criteria: &Criteria,
        scan_window: Duration,
        timeout: Duration,
    ) -> Result<NodeDescriptor> {
        let window = scan_window.min(timeout);
        let found = self.link.scan(window)?;
        let node = found
            .into_iter()
            .filter(|n| criteria.matches(n))
            .max_by_key(|n| n.rssi)
            .ok_or_else(|| Error::SelectionFailed("no matching advertisement".to_string()))?;
        log::info!(
            "Auto-selected node {} ({}) at {} dBm",
            node.name,
            node.mac,
            node.rssi
        );
        self.selected = Some(node.clone());
        Ok(node)
    }

    fn scan(&mut self, criteria: &Criteria, scan_window: Duration) -> Result<Vec<NodeDescriptor>> {
        let mut found: Vec<NodeDescriptor> = self
            .link
            .scan(scan_window)?
            .into_iter()
            .filter(|n| criteria.matches(n))
            .collect();
        found.sort_by_key(|n| std::cmp::Reverse(n.rssi));
        Ok(found)
    }

    fn selected(&self) -> Option<NodeDescriptor> {
        self.selected.clone()
    }

    fn unselect(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }

    fn connect(&mut self, timeout: Duration) -> Result<()> {
        let node = self
            .selected
            .clone()
            .ok_or_else(|| Error::ConnectionFailed("no node selected".to_string()))?;
        self.link.open(&node.mac, timeout)?;
        self.is_connected = true;
        self.assembler.reset();
        self.ctx.notices.notify_connected();
        log::info!("Connected to {} ({})", node.name, node.mac);
        Ok(())
    }

    fn connected(&self) -> bool {
        self.is_connected
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.is_connected {
            self.link.close()?;
            self.mark_disconnected();
        }
        Ok(())
    }

    fn deliver(&mut self, channel: Channel, payload: &[u8], timeout: Duration) -> Result<()> {
        self.require_connected()?;
        let deadline = Instant::now() + timeout;
        self.write_message(channel, payload, true, deadline)
    }

    fn transmit(&mut self, channel: Channel, payload: &[u8], timeout: Duration) -> Result<()> {
        self.require_connected()?;
        if payload.len() > self.chunk_capacity() {
            return Err(Error::TransmitFailed(format!(
                "{}-byte message does not fit one {}-byte frame",
                payload.len(),
                self.profile.packet_size
            )));
        }
        let deadline = Instant::now() + timeout;
        self.write_message(channel, payload, false, deadline)
    }

    fn request(
        &mut self,
        channel: Channel,
        payload: &[u8],
        expect_response: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        self.require_connected()?;
        let deadline = Instant::now() + timeout;
        self.write_message(channel, payload, true, deadline)?;
        if !expect_response {
            return Ok(None);
        }

        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                // Partial reassembly must not leak into the next response
                self.assembler.reset();
                return Err(Error::ResponseTimeout);
            }
            match self.link.poll_notification(remaining) {
                Ok(Some(chunk)) => {
                    if let Some(message) = self.assembler.feed(&chunk) {
                        match frame::decode_notification(&message) {
                            Some(Notification::PeerJoined { mac }) => {
                                self.ctx.events.publish(Event::PeerConnected { mac });
                            }
                            Some(Notification::PeerLeft { mac }) => {
                                self.ctx.events.publish(Event::PeerDisconnected { mac });
                            }
                            None => return Ok(Some(message)),
                        }
                    }
                }
                Ok(None) => {
                    self.assembler.reset();
                    return Err(Error::ResponseTimeout);
                }
                Err(e) => {
                    self.assembler.reset();
                    return Err(e);
                }
            }
        }
    }

    fn set_clock(&mut self, millis: u64) -> Result<()> {
        self.require_connected()?;
        let mut w = BytesWriter::with_capacity(8);
        w.write_u64(millis);
        let payload = w.into_bytes();

        for attempt in 1..=CLOCK_TRIES {
            let deadline = Instant::now() + Duration::from_secs(1);
            match self.write_message(Channel::Clock, &payload, true, deadline) {
                Ok(()) => return Ok(()),
                Err(e) => {
                    log::warn!("Clock write attempt {}/{} failed: {}", attempt, CLOCK_TRIES, e);
                    if attempt < CLOCK_TRIES {
                        thread::sleep(CLOCK_RETRY_BACKOFF);
                    }
                }
            }
        }
        Err(Error::ClockWriteFailed)
    }

    fn get_clock(&mut self) -> Result<u64> {
        self.require_connected()?;

        for attempt in 1..=CLOCK_TRIES {
            let deadline = Instant::now() + Duration::from_secs(1);
            match self.read_message(Channel::Clock, deadline) {
                Ok(bytes) => {
                    let mut r = BytesReader::new(&bytes);
                    return r.read_u64();
                }
                Err(e) => {
                    log::warn!("Clock read attempt {}/{} failed: {}", attempt, CLOCK_TRIES, e);
                    if attempt < CLOCK_TRIES {
                        thread::sleep(CLOCK_RETRY_BACKOFF);
                    }
                }
            }
        }
        Err(Error::ClockReadFailed)
    }

    fn update_firmware(&mut self, firmware: &[u8]) -> Result<()> {
        self.require_connected()?;
        self.ctx.events.publish(Event::OtaStatus(OtaStatus::Begin));

        let result = (|| -> Result<()> {
            let frame_timeout = Duration::from_secs(10);

            self.write_message(
                Channel::Device,
                &ota::encode_reset(),
                true,
                Instant::now() + frame_timeout,
            )?;
            thread::sleep(self.profile.reset_settle);

            self.write_message(
                Channel::Device,
                &ota::encode_begin(firmware.len() as u32),
                true,
                Instant::now() + frame_timeout,
            )?;
            thread::sleep(self.profile.erase_settle);

            let mut written = 0usize;
            for chunk in firmware.chunks(self.profile.ota_chunk_size) {
                self.write_message(
                    Channel::Device,
                    &ota::encode_write(written as u32, chunk),
                    true,
                    Instant::now() + frame_timeout,
                )?;
                written += chunk.len();
                let percent = (written * 100 / firmware.len()) as u8;
                self.ctx.events.publish(Event::OtaProgress(percent));
                log::debug!("Firmware update {}% ({}/{} bytes)", percent, written, firmware.len());
            }

            self.write_message(
                Channel::Device,
                &ota::encode_end(written as u32),
                true,
                Instant::now() + frame_timeout,
            )?;
            thread::sleep(self.profile.end_settle);
            Ok(())
        })();

        match &result {
            Ok(()) => self.ctx.events.publish(Event::OtaStatus(OtaStatus::Success)),
            Err(e) => {
                log::error!("Firmware update failed: {}", e);
                self.ctx.events.publish(Event::OtaStatus(OtaStatus::Fail));
            }
        }
        result
    }

    fn destroy(&mut self) {
        if self.is_connected {
            if let Err(e) = self.link.close() {
                log::warn!("Error closing link during destroy: {}", e);
            }
            self.mark_disconnected();
        }
        self.selected = None;
    }

    fn packet_budget(&self) -> usize {
        self.profile.packet_size
    }
}
