//! Line-buffered ASCII parser for ELM327 responses
//!
//! The adapter answers every command with zero or more CR/LF-terminated
//! lines followed by a `>` prompt. Bytes are pushed into a bounded ring
//! buffer as they arrive; when the prompt shows up the buffered lines are
//! walked and classified against the phase of the in-flight exchange.

use super::driver::TxPhase;

/// Receive ring buffer size.
const RX_BUF_LEN: usize = 1024;

/// Room for "MM.mm" of the adapter version.
const MAX_VERSION_LEN: usize = 5;

/// Result of parsing one exchange (everything up to a `>` prompt).
#[derive(Debug, Default)]
pub(crate) struct Exchange {
    /// Whether the adapter acknowledged the command / returned data.
    pub success: bool,
    /// One entry per hex data line, parsed into bytes.
    pub frames: Vec<Vec<u8>>,
    /// Version digits captured from an `ELM327 vX.Y` banner line.
    pub version: Option<String>,
}

pub(crate) struct LineParser {
    buf: [u8; RX_BUF_LEN],
    push: usize,
    pop: usize,
    version: VersionParser,
}

impl LineParser {
    pub(crate) fn new() -> Self {
        Self {
            buf: [0; RX_BUF_LEN],
            push: 0,
            pop: 0,
            version: VersionParser::new(),
        }
    }

    /// Append one received byte. Returns true when the prompt arrived and
    /// the buffered exchange should be processed.
    pub(crate) fn push(&mut self, byte: u8) -> bool {
        self.buf[self.push] = byte;
        self.push = (self.push + 1) % RX_BUF_LEN;
        byte == b'>'
    }

    /// Walk buffered lines up to the prompt and classify the exchange.
    pub(crate) fn process(&mut self, phase: TxPhase) -> Exchange {
        let mut exchange = Exchange::default();
        let mut first_char = true;
        let mut high_nibble = true;
        let mut in_banner = false;
        let mut saw_banner = false;
        let mut saw_data = false;
        let mut n = 0usize;
        let mut data = [0u8; 8];

        loop {
            let c = self.buf[self.pop];
            if c == b'>' {
                break;
            }
            self.pop = (self.pop + 1) % RX_BUF_LEN;

            if c == b'\r' || c == b'\n' {
                // A terminator closes any pending data line.
                if saw_data {
                    saw_data = false;
                    exchange.frames.push(data[..n].to_vec());
                }
                first_char = true;
                in_banner = false;
                high_nibble = true;
                n = 0;
                continue;
            }

            match phase {
                TxPhase::AtCmd => {
                    if first_char {
                        if c == b'O' || c == b'E' {
                            // "OK", or "ELM327 vX.Y" from ATZ.
                            exchange.success = true;
                            if c == b'E' {
                                in_banner = true;
                                saw_banner = true;
                                self.version.reset();
                            }
                        } else if c == b'?' {
                            tracing::error!("adapter rejected command");
                            exchange.success = false;
                        }
                    } else if in_banner {
                        self.version.feed(c);
                    }
                }
                TxPhase::ReqPkt => {
                    if is_hex(c) {
                        if first_char {
                            saw_data = true;
                            exchange.success = true;
                        }
                        // Two hex characters per byte, space separated.
                        if n < 8 {
                            if high_nibble {
                                data[n] = hex_value(c);
                                high_nibble = false;
                            } else {
                                data[n] = (data[n] << 4) | hex_value(c);
                                n += 1;
                                high_nibble = true;
                            }
                        }
                    } else if c == b' ' {
                        // A lone nibble before a space still counts as a byte.
                        if !high_nibble {
                            n += 1;
                            high_nibble = true;
                        }
                    } else if first_char {
                        if c == b'N' {
                            // "NO DATA"
                            tracing::error!("no data for request");
                        } else if c == b'?' {
                            tracing::error!("request rejected by adapter");
                        }
                        exchange.success = false;
                    }
                }
                _ => {}
            }

            first_char = false;
        }

        // Step past the prompt for the next exchange.
        self.pop = (self.pop + 1) % RX_BUF_LEN;

        if saw_banner {
            exchange.version = Some(self.version.current().to_string());
        }
        exchange
    }
}

/// Extracts the numeric version around the `v` marker of the reset banner.
struct VersionParser {
    state: VersionState,
    digits: String,
}

#[derive(PartialEq)]
enum VersionState {
    SeekMarker,
    Major,
    Minor,
}

impl VersionParser {
    fn new() -> Self {
        Self {
            state: VersionState::SeekMarker,
            digits: String::new(),
        }
    }

    fn reset(&mut self) {
        self.state = VersionState::SeekMarker;
        self.digits.clear();
    }

    fn feed(&mut self, c: u8) {
        match self.state {
            VersionState::SeekMarker => {
                if c == b'v' {
                    self.state = VersionState::Major;
                }
            }
            VersionState::Major => {
                if c.is_ascii_digit() {
                    self.push_char(c);
                } else if c == b'.' {
                    self.push_char(c);
                    self.state = VersionState::Minor;
                }
            }
            VersionState::Minor => {
                if c.is_ascii_digit() {
                    self.push_char(c);
                }
            }
        }
    }

    fn push_char(&mut self, c: u8) {
        if self.digits.len() < MAX_VERSION_LEN {
            self.digits.push(char::from(c));
        }
    }

    fn current(&self) -> &str {
        &self.digits
    }
}

pub(crate) fn is_hex(c: u8) -> bool {
    c.is_ascii_hexdigit()
}

pub(crate) fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => 10 + (c - b'a'),
        b'A'..=b'F' => 10 + (c - b'A'),
        _ => 0,
    }
}

pub(crate) fn nibble_char(nibble: u8) -> u8 {
    let nibble = nibble & 0x0F;
    if nibble <= 9 {
        b'0' + nibble
    } else {
        b'A' + (nibble - 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(parser: &mut LineParser, bytes: &[u8]) -> bool {
        let mut prompt = false;
        for &b in bytes {
            prompt |= parser.push(b);
        }
        prompt
    }

    #[test]
    fn ok_line_acknowledges_at_command() {
        let mut p = LineParser::new();
        assert!(feed(&mut p, b"OK\r>"));
        let ex = p.process(TxPhase::AtCmd);
        assert!(ex.success);
        assert!(ex.frames.is_empty());
        assert!(ex.version.is_none());
    }

    #[test]
    fn question_mark_fails_at_command() {
        let mut p = LineParser::new();
        feed(&mut p, b"?\r>");
        assert!(!p.process(TxPhase::AtCmd).success);
    }

    #[test]
    fn reset_banner_yields_version() {
        let mut p = LineParser::new();
        feed(&mut p, b"ELM327 v1.5\r\r>");
        let ex = p.process(TxPhase::AtCmd);
        assert!(ex.success);
        assert_eq!(ex.version.as_deref(), Some("1.5"));
    }

    #[test]
    fn version_with_two_digit_minor() {
        let mut p = LineParser::new();
        feed(&mut p, b"ELM327 v2.31\r\r>");
        assert_eq!(p.process(TxPhase::AtCmd).version.as_deref(), Some("2.31"));
    }

    #[test]
    fn hex_line_parses_into_bytes() {
        let mut p = LineParser::new();
        feed(&mut p, b"04 62 11 03 B4\r\r>");
        let ex = p.process(TxPhase::ReqPkt);
        assert!(ex.success);
        assert_eq!(ex.frames, vec![vec![0x04, 0x62, 0x11, 0x03, 0xB4]]);
    }

    #[test]
    fn multiple_lines_become_multiple_frames() {
        let mut p = LineParser::new();
        feed(&mut p, b"10 35 61 01 00 00 00 00\r21 00 00 04 00 00 00 00\r>");
        let ex = p.process(TxPhase::ReqPkt);
        assert_eq!(ex.frames.len(), 2);
        assert_eq!(ex.frames[0][0], 0x10);
        assert_eq!(ex.frames[1][0], 0x21);
    }

    #[test]
    fn no_data_fails_request() {
        let mut p = LineParser::new();
        feed(&mut p, b"NO DATA\r\r>");
        let ex = p.process(TxPhase::ReqPkt);
        assert!(!ex.success);
        assert!(ex.frames.is_empty());
    }

    #[test]
    fn lone_nibble_before_space_commits_a_byte() {
        let mut p = LineParser::new();
        feed(&mut p, b"4 62\r\r>");
        let ex = p.process(TxPhase::ReqPkt);
        assert_eq!(ex.frames, vec![vec![0x04, 0x62]]);
    }

    #[test]
    fn consecutive_exchanges_share_the_ring() {
        let mut p = LineParser::new();
        feed(&mut p, b"OK\r>");
        assert!(p.process(TxPhase::AtCmd).success);
        feed(&mut p, b"04 62 11 03 B4\r>");
        let ex = p.process(TxPhase::ReqPkt);
        assert_eq!(ex.frames.len(), 1);
    }

    #[test]
    fn data_beyond_eight_bytes_is_ignored() {
        let mut p = LineParser::new();
        feed(&mut p, b"00 01 02 03 04 05 06 07 08 09\r\r>");
        let ex = p.process(TxPhase::ReqPkt);
        assert_eq!(ex.frames[0].len(), 8);
    }
}
