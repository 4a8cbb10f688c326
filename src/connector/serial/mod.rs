//! Framed serial connector
//!
//! Drives the node's UART protocol: ASCII control tokens in both
//! directions, framed binary payloads with CRC32 protection, and a
//! bounded-retry send loop. The session starts with an
//! `>>>ENABLE_SERIAL<<<` handshake the node answers with `>>>BEGIN<<<`.

mod framing;
mod tokenizer;

pub use framing::{crc32, encode_frame, packet_timeout, parse_header, verify_payload, Header};
pub use tokenizer::{ControlFrame, StreamTokenizer, Token};

use super::{
    Channel, Connector, ConnectorContext, Criteria, NodeDescriptor, CLOCK_RETRY_BACKOFF,
    CLOCK_TRIES,
};
use crate::codec::{BytesReader, BytesWriter};
use crate::error::{Error, Result};
use crate::events::{Event, OtaStatus};
use crate::frame::{self, ota, Notification};
use crate::transport::{SerialTransport, Transport};
use std::collections::VecDeque;
use std::thread;
use std::time::{Duration, Instant};

/// Session-open token written to the node
const ENABLE_SERIAL: &[u8] = b">>>ENABLE_SERIAL<<<";

/// Send attempts per frame before giving up
const INITIATE_TRIES: u32 = 3;

/// Idle wait between receive polls
const POLL_INTERVAL: Duration = Duration::from_millis(2);

/// Tunables of the framed serial protocol
#[derive(Debug, Clone)]
pub struct SerialProfile {
    /// Line speed, also used for transfer-time budgeting
    pub baud_rate: u32,
    /// Largest message the scheduler may merge into one frame
    pub packet_budget: usize,
    /// Wait after the updater reset frame
    pub reset_settle: Duration,
    /// Wait after the begin frame while the node erases flash
    pub erase_settle: Duration,
    /// Wait after the end frame before the node reboots
    pub end_settle: Duration,
}

impl Default for SerialProfile {
    fn default() -> Self {
        Self {
            baud_rate: 115_200,
            packet_budget: 4096,
            reset_settle: Duration::from_millis(2500),
            erase_settle: Duration::from_millis(5000),
            end_settle: Duration::from_millis(2000),
        }
    }
}

/// Framed-protocol connector over any byte-stream [`Transport`]
pub struct SerialConnector {
    profile: SerialProfile,
    ctx: ConnectorContext,
    selected: Option<NodeDescriptor>,
    /// Open transport while a session is active
    transport: Option<Box<dyn Transport>>,
    /// Pre-opened transport used instead of the serial port on connect
    injected: Option<Box<dyn Transport>>,
    tokenizer: StreamTokenizer,
    /// Control tokens received but not yet consumed
    controls: VecDeque<ControlFrame>,
    /// Framed binary payloads received but not yet consumed
    inbox: VecDeque<Vec<u8>>,
    is_connected: bool,
}

impl SerialConnector {
    /// Connector that opens the selected serial port on connect
    pub fn new(profile: SerialProfile, ctx: ConnectorContext) -> Self {
        Self {
            profile,
            ctx,
            selected: None,
            transport: None,
            injected: None,
            tokenizer: StreamTokenizer::new(),
            controls: VecDeque::new(),
            inbox: VecDeque::new(),
            is_connected: false,
        }
    }

    /// Connector over a pre-opened transport (hardware-free tests)
    pub fn with_transport(
        transport: Box<dyn Transport>,
        profile: SerialProfile,
        ctx: ConnectorContext,
    ) -> Self {
        let mut c = Self::new(profile, ctx);
        c.injected = Some(transport);
        c
    }

    fn mark_disconnected(&mut self) {
        self.transport = None;
        self.is_connected = false;
        self.tokenizer.reset();
        self.controls.clear();
        self.inbox.clear();
        self.ctx.notices.notify_disconnected();
    }

    /// Read once and advance the tokenizer; fills `controls` and `inbox`
    fn pump(&mut self) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::DeviceDisconnected)?;

        let mut buf = [0u8; 256];
        let n = match transport.read(&mut buf) {
            Ok(n) => n,
            Err(e) => {
                self.mark_disconnected();
                return Err(e);
            }
        };
        if n == 0 {
            return Ok(());
        }

        for token in self.tokenizer.feed(&buf[..n]) {
            match token {
                Token::Control(control) => self.controls.push_back(control),
                Token::Data(payload) => match frame::decode_notification(&payload) {
                    Some(Notification::PeerJoined { mac }) => {
                        self.ctx.events.publish(Event::PeerConnected { mac });
                    }
                    Some(Notification::PeerLeft { mac }) => {
                        self.ctx.events.publish(Event::PeerDisconnected { mac });
                    }
                    None => self.inbox.push_back(payload),
                },
                Token::Line(text) => log::debug!("node: {}", text),
            }
        }
        Ok(())
    }

    /// Next control token, pumping the stream until `deadline`
    fn wait_for_control(&mut self, deadline: Instant) -> Result<ControlFrame> {
        loop {
            self.pump()?;
            if let Some(control) = self.controls.pop_front() {
                return Ok(control);
            }
            if Instant::now() >= deadline {
                return Err(Error::ResponseTimeout);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    /// Next framed payload, pumping the stream until `deadline`
    fn wait_for_data(&mut self, deadline: Instant) -> Result<Vec<u8>> {
        loop {
            self.pump()?;
            if let Some(payload) = self.inbox.pop_front() {
                return Ok(payload);
            }
            if Instant::now() >= deadline {
                return Err(Error::ResponseTimeout);
            }
            thread::sleep(POLL_INTERVAL);
        }
    }

    fn write_raw(&mut self, bytes: &[u8]) -> Result<()> {
        let transport = self
            .transport
            .as_mut()
            .ok_or(Error::DeviceDisconnected)?;
        let result = transport.write_all(bytes).and_then(|()| transport.flush());
        if result.is_err() {
            self.mark_disconnected();
        }
        result
    }

    /// Write a frame and await its acknowledgement, resending on FAIL.
    ///
    /// The try counter and the overall deadline both bound the loop; FAIL
    /// consumes a try, a quiet line consumes the whole ack budget.
    fn initiate(&mut self, frame: &[u8], deadline: Instant) -> Result<()> {
        let ack_budget = packet_timeout(frame.len(), self.profile.baud_rate) + framing::ACK_MARGIN;

        let mut tries = INITIATE_TRIES;
        while tries > 0 {
            if Instant::now() >= deadline {
                return Err(Error::ResponseTimeout);
            }
            self.write_raw(frame)?;

            let ack_deadline = (Instant::now() + ack_budget).min(deadline);
            let outcome = loop {
                match self.wait_for_control(ack_deadline) {
                    Ok(ControlFrame::Success) => break Ok(true),
                    Ok(ControlFrame::Fail) => break Ok(false),
                    Ok(ControlFrame::End) | Ok(ControlFrame::Ready) => {
                        self.mark_disconnected();
                        return Err(Error::DeviceDisconnected);
                    }
                    // Spurious token, keep waiting out the ack budget
                    Ok(_) => continue,
                    Err(e) => break Err(e),
                }
            };

            match outcome {
                Ok(true) => return Ok(()),
                Ok(false) => {
                    tries -= 1;
                    log::warn!("Frame rejected, {} tries left", tries);
                }
                Err(e) => return Err(e),
            }
        }
        Err(Error::WriteFailed("send retries exhausted".to_string()))
    }

    /// Frame with its header timeout field set to the derived transfer
    /// budget; the caller's timeout only bounds the overall exchange
    fn encode_with_budget(&self, opcode: u32, payload: &[u8]) -> Vec<u8> {
        let budget = packet_timeout(
            framing::HEADER_SIZE + payload.len(),
            self.profile.baud_rate,
        );
        encode_frame(opcode, budget.as_millis() as u32, payload)
    }

    fn send_frame(
        &mut self,
        opcode: u32,
        payload: &[u8],
        timeout: Duration,
    ) -> Result<()> {
        let frame = self.encode_with_budget(opcode, payload);
        self.initiate(&frame, Instant::now() + timeout)
    }
}

impl Connector for SerialConnector {
    fn user_select(&mut self, criteria: &Criteria, timeout: Duration) -> Result<NodeDescriptor> {
        let found = self.scan(criteria, timeout)?;
        let node = found
            .into_iter()
            .next()
            .ok_or_else(|| Error::SelectionFailed("no matching serial port".to_string()))?;
        log::info!("Selected serial port {}", node.mac);
        self.selected = Some(node.clone());
        Ok(node)
    }

    fn auto_select(
        &mut self,
        criteria: &Criteria,
        scan_window: Duration,
        timeout: Duration,
    ) -> Result<NodeDescriptor> {
        self.user_select(criteria, scan_window.min(timeout))
    }

    fn scan(&mut self, criteria: &Criteria, _scan_window: Duration) -> Result<Vec<NodeDescriptor>> {
        let ports = serialport::available_ports()?;
        Ok(ports
            .into_iter()
            .map(|port| {
                let name = match &port.port_type {
                    serialport::SerialPortType::UsbPort(usb) => usb
                        .product
                        .clone()
                        .unwrap_or_else(|| port.port_name.clone()),
                    _ => port.port_name.clone(),
                };
                NodeDescriptor {
                    mac: port.port_name,
                    name,
                    rssi: 0,
                }
            })
            .filter(|node| criteria.matches(node))
            .collect())
    }

    fn selected(&self) -> Option<NodeDescriptor> {
        self.selected.clone()
    }

    fn unselect(&mut self) -> Result<()> {
        self.selected = None;
        Ok(())
    }

    fn connect(&mut self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;

        self.transport = match self.injected.take() {
            Some(transport) => Some(transport),
            None => {
                let node = self.selected.clone().ok_or_else(|| {
                    Error::ConnectionFailed("no serial port selected".to_string())
                })?;
                Some(Box::new(SerialTransport::open(
                    &node.mac,
                    self.profile.baud_rate,
                )?))
            }
        };

        self.write_raw(ENABLE_SERIAL)?;

        loop {
            match self.wait_for_control(deadline) {
                Ok(ControlFrame::Begin) => {
                    self.is_connected = true;
                    self.ctx.notices.notify_connected();
                    log::info!("Serial session established");
                    return Ok(());
                }
                Ok(ControlFrame::End) | Ok(ControlFrame::Ready) => {
                    self.transport = None;
                    return Err(Error::ConnectionFailed(
                        "node refused the serial session".to_string(),
                    ));
                }
                // Stale token from a previous session, keep waiting
                Ok(_) => continue,
                Err(Error::ResponseTimeout) => {
                    self.transport = None;
                    return Err(Error::ConnectTimeout);
                }
                Err(e) => return Err(e),
            }
        }
    }

    fn connected(&self) -> bool {
        self.is_connected
    }

    fn disconnect(&mut self) -> Result<()> {
        if self.is_connected {
            self.mark_disconnected();
        }
        Ok(())
    }

    fn deliver(&mut self, channel: Channel, payload: &[u8], timeout: Duration) -> Result<()> {
        self.send_frame(framing::write_opcode(channel), payload, timeout)
    }

    fn transmit(&mut self, channel: Channel, payload: &[u8], _timeout: Duration) -> Result<()> {
        // Best-effort: one write, no acknowledgement wait
        let frame = self.encode_with_budget(framing::write_opcode(channel), payload);
        self.write_raw(&frame)
            .map_err(|e| Error::TransmitFailed(e.to_string()))
    }

    fn request(
        &mut self,
        channel: Channel,
        payload: &[u8],
        expect_response: bool,
        timeout: Duration,
    ) -> Result<Option<Vec<u8>>> {
        let deadline = Instant::now() + timeout;
        self.send_frame(framing::write_opcode(channel), payload, timeout)?;
        if !expect_response {
            return Ok(None);
        }
        self.wait_for_data(deadline).map(Some)
    }

    fn set_clock(&mut self, millis: u64) -> Result<()> {
        let mut w = BytesWriter::with_capacity(8);
        w.write_u64(millis);
        let payload = w.into_bytes();

        for attempt in 1..=CLOCK_TRIES {
            match self.send_frame(
                framing::write_opcode(Channel::Clock),
                &payload,
                Duration::from_secs(1),
            ) {
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
        for attempt in 1..=CLOCK_TRIES {
            let result = (|| {
                let deadline = Instant::now() + Duration::from_secs(1);
                self.send_frame(
                    framing::read_opcode(Channel::Clock),
                    &[],
                    Duration::from_secs(1),
                )?;
                self.wait_for_data(deadline)
            })();

            match result {
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
        self.ctx.events.publish(Event::OtaStatus(OtaStatus::Begin));

        let reset_settle = self.profile.reset_settle;
        let erase_settle = self.profile.erase_settle;
        let end_settle = self.profile.end_settle;
        let frame_timeout = Duration::from_secs(10);

        let result = (|| -> Result<()> {
            self.deliver(Channel::Device, &ota::encode_reset(), frame_timeout)?;
            thread::sleep(reset_settle);

            self.deliver(
                Channel::Device,
                &ota::encode_begin(firmware.len() as u32),
                frame_timeout,
            )?;
            thread::sleep(erase_settle);

            let mut written = 0usize;
            for chunk in firmware.chunks(4096) {
                self.deliver(
                    Channel::Device,
                    &ota::encode_write(written as u32, chunk),
                    frame_timeout,
                )?;
                written += chunk.len();
                let percent = (written * 100 / firmware.len()) as u8;
                self.ctx.events.publish(Event::OtaProgress(percent));
                log::debug!("Firmware update {}% ({}/{} bytes)", percent, written, firmware.len());
            }

            self.deliver(Channel::Device, &ota::encode_end(written as u32), frame_timeout)?;
            thread::sleep(end_settle);
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
            self.mark_disconnected();
        }
        self.transport = None;
        self.selected = None;
    }

    fn packet_budget(&self) -> usize {
        self.profile.packet_budget
    }
}
