//! Length-prefixed packet framing and reassembly.
//!
//! Byte-stream links carry `[len][cmd/pid][payload..][checksum?]`, frame links carry
//! `[len][cmd/pid][payload..]` in a single frame.

use std::collections::VecDeque;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::hal::{Deadline, Link, Unit};

/// How packets are delimited on a link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Framing {
    /// One byte at a time. With `checksum`, every packet is followed by the modulo-256
    /// sum of the length byte and the packet bytes.
    Stream { checksum: bool },
    /// One packet per frame.
    Frame,
}

impl Default for Framing {
    fn default() -> Self {
        Framing::Stream { checksum: false }
    }
}

impl Framing {
    /// Wraps a packet for transmission.
    pub fn encode(&self, packet: &[u8]) -> Vec<u8> {
        let mut raw = Vec::with_capacity(packet.len() + 2);
        raw.push(packet.len() as u8);
        raw.extend_from_slice(packet);
        if let Framing::Stream { checksum: true } = self {
            raw.push(checksum_byte(&raw));
        }
        raw
    }
}

/// Modulo-256 sum of all bytes.
pub fn checksum_byte(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, &b| acc.wrapping_add(b))
}

/// A complete command or response packet, without the length byte.
#[derive(Clone, PartialEq, Eq, Default)]
pub struct Packet(Vec<u8>);

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Packet[{}]", hex::encode(&self.0))
    }
}

impl Packet {
    pub fn new(data: Vec<u8>) -> Self {
        Packet(data)
    }

    /// Command code or packet identifier.
    pub fn first(&self) -> Option<u8> {
        self.0.first().copied()
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.0
    }
}

impl From<Vec<u8>> for Packet {
    fn from(data: Vec<u8>) -> Self {
        Packet(data)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RxState {
    Idle,
    Payload { remaining: usize, started: Deadline },
    Checksum { started: Deadline },
}

/// Turns link units into complete packets.
#[derive(Debug)]
pub struct Reassembler {
    framing: Framing,
    max_len: usize,
    timeout_ms: u32,
    state: RxState,
    len_byte: u8,
    buf: Vec<u8>,
    /// Bytes of a chunked unit not consumed yet
    pending: VecDeque<u8>,
}

impl Reassembler {
    pub fn new(framing: Framing, max_len: usize, timeout_ms: u32) -> Self {
        Reassembler {
            framing,
            max_len,
            timeout_ms,
            state: RxState::Idle,
            len_byte: 0,
            buf: Vec::with_capacity(max_len),
            pending: VecDeque::new(),
        }
    }

    pub fn framing(&self) -> Framing {
        self.framing
    }

    /// True while a packet has been started but not completed.
    pub fn is_receiving(&self) -> bool {
        self.state != RxState::Idle
    }

    /// True if received bytes still wait to be reassembled.
    pub fn has_pending(&self) -> bool {
        !self.pending.is_empty()
    }

    /// Drops a partially received packet when its reception timed out.
    pub fn check_timeout(&mut self, now: u32) {
        let started = match self.state {
            RxState::Idle => return,
            RxState::Payload { started, .. } | RxState::Checksum { started } => started,
        };
        if started.expired(now) {
            log::debug!(
                "packet reception timed out after {} of {} bytes",
                self.buf.len(),
                self.len_byte
            );
            self.reset();
        }
    }

    /// Checks the timeout, then returns a packet still pending from an earlier unit or
    /// pulls at most one unit from the link.
    pub fn service(&mut self, link: &mut dyn Link) -> Option<Packet> {
        let now = link.now_ms();
        self.check_timeout(now);
        if let Some(packet) = self.drain_pending(now) {
            return Some(packet);
        }
        let unit = link.try_receive()?;
        self.push(unit, now)
    }

    /// Feeds one received unit. On byte-stream links a unit may carry several packets:
    /// reassembly stops at the first complete one, the remaining bytes are kept for the
    /// next call of [`push`](Self::push) or [`service`](Self::service).
    pub fn push(&mut self, unit: Unit, now: u32) -> Option<Packet> {
        match unit {
            Unit::Byte(b) if self.pending.is_empty() => self.push_byte(b, now),
            Unit::Byte(b) => {
                self.pending.push_back(b);
                self.drain_pending(now)
            }
            Unit::Frame(frame) => match self.framing {
                Framing::Frame => self.push_frame(&frame),
                Framing::Stream { .. } => {
                    self.pending.extend(frame);
                    self.drain_pending(now)
                }
            },
        }
    }

    fn drain_pending(&mut self, now: u32) -> Option<Packet> {
        while let Some(b) = self.pending.pop_front() {
            if let Some(packet) = self.push_byte(b, now) {
                return Some(packet);
            }
        }
        None
    }

    fn push_byte(&mut self, b: u8, now: u32) -> Option<Packet> {
        match self.state {
            RxState::Idle => {
                if self.framing == Framing::Frame {
                    log::warn!("single byte received on a frame link, ignored");
                    return None;
                }
                if b == 0 {
                    return None;
                }
                if b as usize > self.max_len {
                    log::debug!("declared length {} exceeds {}, ignored", b, self.max_len);
                    return None;
                }
                self.len_byte = b;
                self.buf.clear();
                self.state = RxState::Payload {
                    remaining: b as usize,
                    started: Deadline::after(now, self.timeout_ms),
                };
                None
            }
            RxState::Payload { remaining, started } => {
                self.buf.push(b);
                let remaining = remaining - 1;
                if remaining > 0 {
                    self.state = RxState::Payload { remaining, started };
                    return None;
                }
                match self.framing {
                    Framing::Stream { checksum: true } => {
                        self.state = RxState::Checksum { started };
                        None
                    }
                    _ => self.complete(),
                }
            }
            RxState::Checksum { .. } => {
                let expected = self.len_byte.wrapping_add(checksum_byte(&self.buf));
                if b == expected {
                    self.complete()
                } else {
                    log::debug!("checksum mismatch: got {:02x}, expected {:02x}", b, expected);
                    self.reset();
                    None
                }
            }
        }
    }

    fn push_frame(&mut self, frame: &[u8]) -> Option<Packet> {
        self.reset();
        let (&len, rest) = frame.split_first()?;
        let len = len as usize;
        if len == 0 || len > rest.len() || len > self.max_len {
            log::debug!("malformed frame {} discarded", hex::encode(frame));
            return None;
        }
        Some(Packet(rest[..len].to_vec()))
    }

    fn complete(&mut self) -> Option<Packet> {
        self.state = RxState::Idle;
        let packet = Packet(std::mem::take(&mut self.buf));
        self.buf.reserve(self.max_len);
        Some(packet)
    }

    fn reset(&mut self) {
        self.state = RxState::Idle;
        self.buf.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn feed(r: &mut Reassembler, bytes: &[u8], now: u32) -> Vec<Packet> {
        bytes
            .iter()
            .filter_map(|&b| r.push(Unit::Byte(b), now))
            .collect()
    }

    #[test]
    fn two_back_to_back_packets() {
        let mut r = Reassembler::new(Framing::default(), 64, 100);
        let packets = feed(&mut r, &[0x02, 0xff, 0x00, 0x03, 0xf6, 0x01, 0x02], 0);
        assert_eq!(
            packets,
            vec![
                Packet::new(vec![0xff, 0x00]),
                Packet::new(vec![0xf6, 0x01, 0x02])
            ]
        );
        assert!(!r.is_receiving());
    }

    #[test]
    fn stray_zero_is_skipped() {
        let mut r = Reassembler::new(Framing::default(), 64, 100);
        let packets = feed(&mut r, &[0x00, 0x00, 0x01, 0xfe], 0);
        assert_eq!(packets, vec![Packet::new(vec![0xfe])]);
    }

    #[test]
    fn timeout_restarts_at_length_byte() {
        let mut r = Reassembler::new(Framing::default(), 64, 100);
        assert!(feed(&mut r, &[0x04, 0xaa, 0xbb], 10).is_empty());
        r.check_timeout(111);
        assert!(!r.is_receiving());
        // 0x01 is now a length byte, not the third payload byte
        let packets = feed(&mut r, &[0x01, 0xfd], 111);
        assert_eq!(packets, vec![Packet::new(vec![0xfd])]);
    }

    #[test]
    fn timeout_not_yet_elapsed_keeps_partial_packet() {
        let mut r = Reassembler::new(Framing::default(), 64, 100);
        feed(&mut r, &[0x02, 0xff], 0);
        r.check_timeout(100);
        assert_eq!(feed(&mut r, &[0x00], 100), vec![Packet::new(vec![0xff, 0x00])]);
    }

    #[test]
    fn oversize_length_is_ignored() {
        let mut r = Reassembler::new(Framing::default(), 8, 100);
        assert!(feed(&mut r, &[0x09], 0).is_empty());
        assert!(!r.is_receiving());
        assert_eq!(feed(&mut r, &[0x01, 0xfe], 0), vec![Packet::new(vec![0xfe])]);
    }

    #[test]
    fn checksum_byte_is_verified() {
        let framing = Framing::Stream { checksum: true };
        let mut r = Reassembler::new(framing, 64, 100);
        let good = framing.encode(&[0xff, 0x00]);
        assert_eq!(good, vec![0x02, 0xff, 0x00, 0x01]);
        assert_eq!(feed(&mut r, &good, 0), vec![Packet::new(vec![0xff, 0x00])]);

        assert!(feed(&mut r, &[0x02, 0xff, 0x00, 0x02], 0).is_empty());
        assert!(!r.is_receiving());
    }

    #[test]
    fn frame_overwrites_partial_state() {
        let mut r = Reassembler::new(Framing::Frame, 8, 100);
        assert_eq!(
            r.push(Unit::Frame(vec![0x02, 0xff, 0x00, 0x00, 0x00]), 0),
            Some(Packet::new(vec![0xff, 0x00]))
        );
        assert_eq!(r.push(Unit::Frame(vec![0x05, 0xff]), 0), None);
        assert_eq!(r.push(Unit::Frame(vec![]), 0), None);
    }

    #[test]
    fn stream_accepts_chunked_units() {
        let mut r = Reassembler::new(Framing::default(), 64, 100);
        assert_eq!(r.push(Unit::Frame(vec![0x02, 0xff]), 0), None);
        assert_eq!(
            r.push(Unit::Frame(vec![0x00]), 1),
            Some(Packet::new(vec![0xff, 0x00]))
        );
    }

    struct Silent;

    impl Link for Silent {
        fn try_receive(&mut self) -> Option<Unit> {
            None
        }

        fn send_blocking(&mut self, _: &[u8], _: u32, _: &mut dyn crate::hal::Watchdog) -> bool {
            true
        }

        fn now_ms(&self) -> u32 {
            0
        }
    }

    #[test]
    fn unit_with_two_packets_keeps_the_second() {
        let mut r = Reassembler::new(Framing::default(), 64, 100);
        assert_eq!(
            r.push(Unit::Frame(vec![0x02, 0xff, 0x00, 0x01, 0xfd]), 0),
            Some(Packet::new(vec![0xff, 0x00]))
        );
        assert!(r.has_pending());
        assert_eq!(r.service(&mut Silent), Some(Packet::new(vec![0xfd])));
        assert!(!r.has_pending());
        assert_eq!(r.service(&mut Silent), None);
    }

    #[test]
    fn bytes_queue_behind_pending_ones() {
        let mut r = Reassembler::new(Framing::default(), 64, 100);
        let first = r.push(Unit::Frame(vec![0x01, 0xfd, 0x02, 0xfa]), 0);
        assert_eq!(first, Some(Packet::new(vec![0xfd])));
        assert_eq!(
            r.push(Unit::Byte(0x00), 0),
            Some(Packet::new(vec![0xfa, 0x00]))
        );
        assert!(!r.has_pending());
    }
}
