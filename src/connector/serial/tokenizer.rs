//! Inbound serial stream tokenizer
//!
//! The node multiplexes three things onto its TX line: ASCII control
//! tokens, free-form diagnostic text, and framed binary payloads announced
//! by the `>>>DATA=` switch token. [`StreamTokenizer::feed`] is a pure
//! state machine over raw read chunks, so the receive logic is testable
//! without a transport.
//!
//! Control tokens:
//!
//! ```text
//! >>>BEGIN<<<  >>>END<<<  >>>READY<<<  >>>SUCCESS<<<  >>>FAIL<<<  >>>DATA<<<
//! ```
//!
//! Binary mode starts right after `>>>DATA=`: a 20-byte frame header, then
//! exactly `payload_len` payload bytes. A CRC failure in either part drops
//! the frame and resynchronizes to ASCII mode.

use super::framing::{self, Header, HEADER_SIZE};

/// Session-control token sent by the node
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlFrame {
    /// Serial session accepted
    Begin,
    /// Serial session refused or torn down
    End,
    /// Node rebooted into its prompt
    Ready,
    /// Last frame accepted
    Success,
    /// Last frame rejected, resend
    Fail,
    /// Node announces framed data will follow in a later write
    Data,
}

/// One parsed unit of the inbound stream
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Token {
    /// Session-control token
    Control(ControlFrame),
    /// Free-form diagnostic line
    Line(String),
    /// Framed binary payload, CRC-validated
    Data(Vec<u8>),
}

const CONTROL_TOKENS: &[(&[u8], ControlFrame)] = &[
    (b">>>BEGIN<<<", ControlFrame::Begin),
    (b">>>END<<<", ControlFrame::End),
    (b">>>READY<<<", ControlFrame::Ready),
    (b">>>SUCCESS<<<", ControlFrame::Success),
    (b">>>FAIL<<<", ControlFrame::Fail),
    (b">>>DATA<<<", ControlFrame::Data),
];

const DATA_SWITCH: &[u8] = b">>>DATA=";

/// Cap on ASCII accumulation; newline-free streams flush in slices
const MAX_LINE_LEN: usize = 512;

/// Bytes retained across a cap flush so a straddling token still matches
/// (one short of the longest control token)
const TOKEN_TAIL: usize = 12;

enum ReceiveMode {
    /// Accumulating ASCII bytes, scanning for tokens and newlines
    Ascii { line: Vec<u8> },
    /// Collecting a binary frame; header is parsed once 20 bytes are in
    Binary {
        header: Option<Header>,
        collected: Vec<u8>,
    },
}

/// Incremental tokenizer over the node's TX byte stream
pub struct StreamTokenizer {
    mode: ReceiveMode,
}

impl Default for StreamTokenizer {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamTokenizer {
    /// Start in ASCII mode
    pub fn new() -> Self {
        Self {
            mode: ReceiveMode::Ascii { line: Vec::new() },
        }
    }

    /// Drop any partial state and return to ASCII mode
    pub fn reset(&mut self) {
        self.mode = ReceiveMode::Ascii { line: Vec::new() };
    }

    /// Advance the state machine over one read chunk
    pub fn feed(&mut self, chunk: &[u8]) -> Vec<Token> {
        let mut tokens = Vec::new();
        for &byte in chunk {
            self.step(byte, &mut tokens);
        }
        tokens
    }

    fn step(&mut self, byte: u8, tokens: &mut Vec<Token>) {
        let ascii = || ReceiveMode::Ascii { line: Vec::new() };
        let mode = std::mem::replace(&mut self.mode, ascii());

        self.mode = match mode {
            ReceiveMode::Ascii { mut line } => {
                if byte == b'\n' || byte == b'\r' {
                    if !line.is_empty() {
                        tokens.push(Token::Line(String::from_utf8_lossy(&line).into_owned()));
                        line.clear();
                    }
                    self.mode = ReceiveMode::Ascii { line };
                    return;
                }

                line.push(byte);

                let matched = CONTROL_TOKENS
                    .iter()
                    .find(|(pattern, _)| line.ends_with(pattern));
                if let Some((pattern, control)) = matched {
                    Self::flush_prefix(&line, pattern.len(), tokens);
                    tokens.push(Token::Control(*control));
                    ascii()
                } else if line.ends_with(DATA_SWITCH) {
                    Self::flush_prefix(&line, DATA_SWITCH.len(), tokens);
                    ReceiveMode::Binary {
                        header: None,
                        collected: Vec::with_capacity(HEADER_SIZE),
                    }
                } else if line.len() >= MAX_LINE_LEN {
                    let tail = line.split_off(line.len() - TOKEN_TAIL);
                    tokens.push(Token::Line(String::from_utf8_lossy(&line).into_owned()));
                    ReceiveMode::Ascii { line: tail }
                } else {
                    ReceiveMode::Ascii { line }
                }
            }
            ReceiveMode::Binary {
                header,
                mut collected,
            } => {
                collected.push(byte);
                match header {
                    None if collected.len() == HEADER_SIZE => {
                        match framing::parse_header(&collected) {
                            Ok(parsed) => {
                                collected.clear();
                                if parsed.payload_len == 0 {
                                    Self::emit_frame(&parsed, &collected, tokens);
                                    ascii()
                                } else {
                                    ReceiveMode::Binary {
                                        header: Some(parsed),
                                        collected,
                                    }
                                }
                            }
                            Err(e) => {
                                log::warn!("Dropping frame with bad header: {}", e);
                                ascii()
                            }
                        }
                    }
                    Some(parsed) if collected.len() == parsed.payload_len as usize => {
                        Self::emit_frame(&parsed, &collected, tokens);
                        ascii()
                    }
                    _ => ReceiveMode::Binary { header, collected },
                }
            }
        };
    }

    /// Text preceding an embedded token surfaces as a diagnostic line
    fn flush_prefix(line: &[u8], token_len: usize, tokens: &mut Vec<Token>) {
        let prefix_len = line.len() - token_len;
        if prefix_len > 0 {
            tokens.push(Token::Line(
                String::from_utf8_lossy(&line[..prefix_len]).into_owned(),
            ));
        }
    }

    fn emit_frame(header: &Header, payload: &[u8], tokens: &mut Vec<Token>) {
        match framing::verify_payload(header, payload) {
            Ok(()) => tokens.push(Token::Data(payload.to_vec())),
            Err(e) => log::warn!("Dropping frame with bad payload: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::connector::Channel;

    #[test]
    fn control_tokens_are_recognized_without_newline() {
        let mut t = StreamTokenizer::new();
        let tokens = t.feed(b">>>BEGIN<<<>>>SUCCESS<<<");
        assert_eq!(
            tokens,
            vec![
                Token::Control(ControlFrame::Begin),
                Token::Control(ControlFrame::Success)
            ]
        );
    }

    #[test]
    fn diagnostic_lines_surface_separately() {
        let mut t = StreamTokenizer::new();
        let tokens = t.feed(b"boot ok\nlamp ready>>>READY<<<");
        assert_eq!(
            tokens,
            vec![
                Token::Line("boot ok".to_string()),
                Token::Line("lamp ready".to_string()),
                Token::Control(ControlFrame::Ready),
            ]
        );
    }

    #[test]
    fn data_switch_collects_framed_payload() {
        let payload = [0xDE, 0xAD, 0xBE, 0xEF];
        let frame = framing::encode_frame(framing::read_opcode(Channel::Clock), 0, &payload);

        let mut stream = Vec::from(&b">>>DATA="[..]);
        stream.extend_from_slice(&frame);
        stream.extend_from_slice(b">>>SUCCESS<<<");

        let mut t = StreamTokenizer::new();
        let tokens = t.feed(&stream);
        assert_eq!(
            tokens,
            vec![
                Token::Data(payload.to_vec()),
                Token::Control(ControlFrame::Success),
            ]
        );
    }

    #[test]
    fn split_feeds_reassemble() {
        let payload = [1u8, 2, 3, 4, 5, 6, 7];
        let frame = framing::encode_frame(framing::read_opcode(Channel::Network), 0, &payload);
        let mut stream = Vec::from(&b">>>DATA="[..]);
        stream.extend_from_slice(&frame);

        let mut t = StreamTokenizer::new();
        let mut tokens = Vec::new();
        // One byte at a time, as a slow UART would deliver it
        for byte in stream {
            tokens.extend(t.feed(&[byte]));
        }
        assert_eq!(tokens, vec![Token::Data(payload.to_vec())]);
    }

    #[test]
    fn bad_header_crc_resyncs_to_ascii() {
        let payload = [9u8; 3];
        let mut frame = framing::encode_frame(framing::read_opcode(Channel::Device), 0, &payload);
        frame[2] ^= 0xFF;

        let mut stream = Vec::from(&b">>>DATA="[..]);
        stream.extend_from_slice(&frame[..HEADER_SIZE]);
        stream.extend_from_slice(b">>>FAIL<<<");

        let mut t = StreamTokenizer::new();
        let tokens = t.feed(&stream);
        // The corrupted frame vanishes; the following control token parses
        assert_eq!(tokens, vec![Token::Control(ControlFrame::Fail)]);
    }

    #[test]
    fn bad_payload_crc_drops_frame() {
        let payload = [7u8; 4];
        let mut frame = framing::encode_frame(framing::read_opcode(Channel::Device), 0, &payload);
        let last = frame.len() - 1;
        frame[last] ^= 0x01;

        let mut stream = Vec::from(&b">>>DATA="[..]);
        stream.extend_from_slice(&frame);

        let mut t = StreamTokenizer::new();
        assert!(t.feed(&stream).is_empty());
    }

    #[test]
    fn unterminated_text_flushes_in_bounded_slices() {
        let mut t = StreamTokenizer::new();
        let mut tokens = t.feed(&[b'a'; 1300]);
        tokens.extend(t.feed(b">>>READY<<<"));
        assert_eq!(
            tokens,
            vec![
                Token::Line("a".repeat(500)),
                Token::Line("a".repeat(500)),
                Token::Line("a".repeat(300)),
                Token::Control(ControlFrame::Ready),
            ]
        );
    }

    #[test]
    fn token_straddling_a_cap_flush_still_matches() {
        let mut t = StreamTokenizer::new();
        let mut stream = vec![b'a'; MAX_LINE_LEN - 5];
        stream.extend_from_slice(b">>>SUCCESS<<<");

        let tokens = t.feed(&stream);
        assert_eq!(tokens.last(), Some(&Token::Control(ControlFrame::Success)));
        let text: usize = tokens
            .iter()
            .filter_map(|t| match t {
                Token::Line(s) => Some(s.len()),
                _ => None,
            })
            .sum();
        assert_eq!(text, MAX_LINE_LEN - 5);
    }

    #[test]
    fn text_before_embedded_token_is_kept() {
        let mut t = StreamTokenizer::new();
        let tokens = t.feed(b"uploading>>>DATA<<<");
        assert_eq!(
            tokens,
            vec![
                Token::Line("uploading".to_string()),
                Token::Control(ControlFrame::Data),
            ]
        );
    }
}
