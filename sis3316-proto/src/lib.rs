//! Wire framing for the SIS3316 UDP request/response protocol.
//!
//! This crate only knows how to build request datagrams and pull apart
//! response datagrams; it owns no socket and makes no I/O decisions. See
//! `sis3316-transport` for the request/response/retry state machine built
//! on top of it.

use byteorder::{ByteOrder, LittleEndian};
use std::fmt;

/// Link-space addresses are `< LINK_SPACE_LIMIT` and can only be accessed
/// one word at a time, without retry-on-write.
pub const LINK_SPACE_LIMIT: u32 = 0x20;
/// VME-space addresses are `< VME_SPACE_LIMIT`; bulk memory starts there.
pub const VME_SPACE_LIMIT: u32 = 0x0010_0000;
/// Maximum number of address/data pairs per `0x20`/`0x21` packet.
pub const VME_CHUNK_LEN: usize = 64;
/// Upper bound on the word count of a single `0x30` burst request
/// (`0x40000` bytes worth of words).
pub const FIFO_READ_LIMIT_WORDS: u32 = 0x40000 / 4;
/// Conservative default MTU assumption, in bytes.
pub const DEFAULT_MTU_BYTES: usize = 1440;

pub const OP_READ_LINK: u8 = 0x10;
pub const OP_WRITE_LINK: u8 = 0x11;
pub const OP_READ_VME: u8 = 0x20;
pub const OP_WRITE_VME: u8 = 0x21;
pub const OP_READ_FIFO: u8 = 0x30;
pub const OP_WRITE_FIFO: u8 = 0x31;

const STATUS_NO_GRANT: u8 = 1 << 4;
const STATUS_FIFO_TIMEOUT: u8 = 1 << 5;
const STATUS_PROTOCOL_ERROR: u8 = 1 << 6;
const STATUS_FIFO_COUNTER_MASK: u8 = 0x0F;

/// Which of the three address ranges a register address falls in.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum AddressSpace {
    /// `addr < 0x20`: single-word only, no batching, writes never retried.
    Link,
    /// `0x20 <= addr < 0x100000`: batchable up to `VME_CHUNK_LEN` per packet.
    Vme,
    /// `addr >= 0x100000`: reached through the FIFO read cycle only.
    Bulk,
}

pub fn classify(addr: u32) -> AddressSpace {
    if addr < LINK_SPACE_LIMIT {
        AddressSpace::Link
    } else if addr < VME_SPACE_LIMIT {
        AddressSpace::Vme
    } else {
        AddressSpace::Bulk
    }
}

/// Protocol-level error conditions signaled by the device's status byte.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum StatusError {
    /// bit4: link-interface grant has been lost; fatal for the session.
    NoGrant,
    /// bit5: device-side FIFO was empty; benign on writes, retryable on reads.
    FifoTimeout,
    /// bit6: device rejected the request outright.
    ProtocolError,
}

impl fmt::Display for StatusError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StatusError::NoGrant => write!(f, "link interface grant lost"),
            StatusError::FifoTimeout => write!(f, "device FIFO empty"),
            StatusError::ProtocolError => write!(f, "device rejected request"),
        }
    }
}

impl std::error::Error for StatusError {}

/// Inspect a response status byte for protocol-level error bits.
///
/// `FifoTimeout` on a write path is benign and must be filtered out by the
/// caller *before* this check runs if the caller is issuing a write; this
/// function always reports it, since whether it's fatal is a property of
/// the request type, not of the byte itself.
pub fn status_error(status: u8) -> Result<(), StatusError> {
    if status & STATUS_NO_GRANT != 0 {
        Err(StatusError::NoGrant)
    } else if status & STATUS_FIFO_TIMEOUT != 0 {
        Err(StatusError::FifoTimeout)
    } else if status & STATUS_PROTOCOL_ERROR != 0 {
        Err(StatusError::ProtocolError)
    } else {
        Ok(())
    }
}

/// Framing/decoding errors: the response was truncated, didn't echo what the
/// request expects, or the packet identifier didn't match.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum ProtoError {
    /// Response shorter than the format it's claimed to be.
    Malformed,
    /// Opcode or echoed address does not match the request.
    WrongResponse,
    /// Packet identifier didn't match the expected sequence (non-bulk).
    PacketsLost,
    /// Bulk datagram's low-nibble packet counter skipped a value.
    UnorderedPacket,
    /// Status byte carried a protocol-level error bit.
    Status(StatusError),
}

impl fmt::Display for ProtoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProtoError::Malformed => write!(f, "truncated or malformed response"),
            ProtoError::WrongResponse => write!(f, "response opcode/address mismatch"),
            ProtoError::PacketsLost => write!(f, "packet identifier mismatch"),
            ProtoError::UnorderedPacket => write!(f, "bulk packet counter skipped"),
            ProtoError::Status(e) => write!(f, "{e}"),
        }
    }
}

impl std::error::Error for ProtoError {}

impl From<StatusError> for ProtoError {
    fn from(e: StatusError) -> Self {
        ProtoError::Status(e)
    }
}

/// Tracks the mod-256 packet identifier used by firmware 2008-and-later.
///
/// The identifier is only advanced once a response has been validated
/// against the *current* value, so a timed-out request can be retried with
/// the same identifier (mirrors the original driver's `packet_identifier`
/// bookkeeping).
#[derive(Copy, Clone, Debug, Default)]
pub struct PidSequencer {
    enabled: bool,
    current: u8,
}

impl PidSequencer {
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled,
            current: 0,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// The pid to embed in the next request, if the 2008 protocol is active.
    pub fn current(&self) -> Option<u8> {
        self.enabled.then_some(self.current)
    }

    /// Advance to the next pid after a response has matched `current()`.
    pub fn advance(&mut self) {
        self.current = self.current.wrapping_add(1);
    }
}

fn push_le_u32(buf: &mut Vec<u8>, v: u32) {
    let mut tmp = [0u8; 4];
    LittleEndian::write_u32(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

fn push_le_u16(buf: &mut Vec<u8>, v: u16) {
    let mut tmp = [0u8; 2];
    LittleEndian::write_u16(&mut tmp, v);
    buf.extend_from_slice(&tmp);
}

/// Build a `0x10` link-space read request.
pub fn encode_read_link(addr: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(5);
    buf.push(OP_READ_LINK);
    push_le_u32(&mut buf, addr);
    buf
}

/// Parse the response to a `0x10` request.
pub fn decode_read_link(resp: &[u8], addr: u32) -> Result<u32, ProtoError> {
    if resp.len() < 9 {
        return Err(ProtoError::Malformed);
    }
    if resp[0] != OP_READ_LINK {
        return Err(ProtoError::WrongResponse);
    }
    let resp_addr = LittleEndian::read_u32(&resp[1..5]);
    if resp_addr != addr {
        return Err(ProtoError::WrongResponse);
    }
    Ok(LittleEndian::read_u32(&resp[5..9]))
}

/// Build a `0x11` link-space write request. There is no response to wait for.
pub fn encode_write_link(addr: u32, data: u32) -> Vec<u8> {
    let mut buf = Vec::with_capacity(9);
    buf.push(OP_WRITE_LINK);
    push_le_u32(&mut buf, addr);
    push_le_u32(&mut buf, data);
    buf
}

/// Build a `0x20` request reading `addrs.len()` VME-space registers.
/// `addrs.len()` must be `<= VME_CHUNK_LEN`; splitting into chunks is the
/// caller's job (see `sis3316-transport`).
pub fn encode_read_vme(pid: Option<u8>, addrs: &[u32]) -> Vec<u8> {
    assert!(!addrs.is_empty() && addrs.len() <= VME_CHUNK_LEN);
    let mut buf = Vec::with_capacity(2 + addrs.len() * 4 + 1);
    buf.push(OP_READ_VME);
    if let Some(pid) = pid {
        buf.push(pid);
    }
    push_le_u16(&mut buf, (addrs.len() - 1) as u16);
    for &a in addrs {
        push_le_u32(&mut buf, a);
    }
    buf
}

/// Decode the response to a `0x20` request: `count` words follow the status
/// byte (and pid byte, if enabled).
pub fn decode_read_vme(
    resp: &[u8],
    pid: Option<u8>,
    count: usize,
) -> Result<Vec<u32>, ProtoError> {
    let mut off = 0usize;
    if resp.len() < 2 {
        return Err(ProtoError::Malformed);
    }
    if resp[off] != OP_READ_VME {
        return Err(ProtoError::WrongResponse);
    }
    off += 1;
    let status = resp[off];
    off += 1;
    if let Some(expect) = pid {
        if resp.len() < off + 1 {
            return Err(ProtoError::Malformed);
        }
        if resp[off] != expect {
            return Err(ProtoError::PacketsLost);
        }
        off += 1;
    }
    status_error(status)?;
    if resp.len() < off + count * 4 {
        return Err(ProtoError::Malformed);
    }
    Ok((0..count)
        .map(|i| LittleEndian::read_u32(&resp[off + i * 4..off + i * 4 + 4]))
        .collect())
}

/// Build a `0x21` request writing `(addr, data)` pairs, at most
/// `VME_CHUNK_LEN` of them.
pub fn encode_write_vme(pid: Option<u8>, pairs: &[(u32, u32)]) -> Vec<u8> {
    assert!(!pairs.is_empty() && pairs.len() <= VME_CHUNK_LEN);
    let mut buf = Vec::with_capacity(2 + pairs.len() * 8 + 1);
    buf.push(OP_WRITE_VME);
    if let Some(pid) = pid {
        buf.push(pid);
    }
    push_le_u16(&mut buf, (pairs.len() - 1) as u16);
    for &(a, d) in pairs {
        push_le_u32(&mut buf, a);
        push_le_u32(&mut buf, d);
    }
    buf
}

/// Decode the response to a `0x21` request. A `FifoTimeout` status is benign
/// on a write path, so the caller should swallow that one `StatusError`
/// variant rather than treating it as failure.
pub fn decode_write_vme(resp: &[u8], pid: Option<u8>) -> Result<(), ProtoError> {
    let mut off = 0usize;
    if resp.is_empty() {
        return Err(ProtoError::Malformed);
    }
    if resp[off] != OP_WRITE_VME {
        return Err(ProtoError::WrongResponse);
    }
    off += 1;
    if resp.len() < off + 1 {
        return Err(ProtoError::Malformed);
    }
    let status = resp[off];
    off += 1;
    if let Some(expect) = pid {
        if resp.len() < off + 1 {
            return Err(ProtoError::Malformed);
        }
        if resp[off] != expect {
            return Err(ProtoError::PacketsLost);
        }
    }
    status_error(status)?;
    Ok(())
}

/// Build a `0x30` bulk FIFO read request for `nwords` words starting at
/// `fifo_addr` (word-addressed, already adjusted for bank/group offsets).
pub fn encode_read_fifo(pid: Option<u8>, nwords: u32, fifo_addr: u32) -> Vec<u8> {
    assert!(nwords > 0);
    let mut buf = Vec::with_capacity(8);
    buf.push(OP_READ_FIFO);
    if let Some(pid) = pid {
        buf.push(pid);
    }
    push_le_u16(&mut buf, (nwords - 1) as u16);
    push_le_u32(&mut buf, fifo_addr);
    buf
}

/// A single `0x30` data datagram, with its header stripped.
pub struct FifoDatagram<'a> {
    /// Low nibble of the status byte: a mod-16 packet counter.
    pub packet_counter: u8,
    pub payload: &'a [u8],
}

/// Decode one datagram of a `0x30` burst response.
pub fn decode_fifo_datagram(datagram: &[u8], pid: Option<u8>) -> Result<FifoDatagram<'_>, ProtoError> {
    let mut off = 0usize;
    if datagram.is_empty() {
        return Err(ProtoError::Malformed);
    }
    if datagram[off] != OP_READ_FIFO {
        return Err(ProtoError::WrongResponse);
    }
    off += 1;
    if datagram.len() < off + 1 {
        return Err(ProtoError::Malformed);
    }
    let status = datagram[off];
    off += 1;
    if let Some(expect) = pid {
        if datagram.len() < off + 1 {
            return Err(ProtoError::Malformed);
        }
        if datagram[off] != expect {
            return Err(ProtoError::PacketsLost);
        }
        off += 1;
    }
    status_error(status)?;
    Ok(FifoDatagram {
        packet_counter: status & STATUS_FIFO_COUNTER_MASK,
        payload: &datagram[off..],
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn classify_boundaries() {
        assert_eq!(classify(0), AddressSpace::Link);
        assert_eq!(classify(0x1F), AddressSpace::Link);
        assert_eq!(classify(0x20), AddressSpace::Vme);
        assert_eq!(classify(0xFFFFF), AddressSpace::Vme);
        assert_eq!(classify(0x100000), AddressSpace::Bulk);
    }

    #[test]
    fn read_link_round_trip() {
        let req = encode_read_link(0x4);
        assert_eq!(req, vec![0x10, 0x04, 0x00, 0x00, 0x00]);

        let mut resp = vec![0x10];
        push_le_u32(&mut resp, 0x4);
        push_le_u32(&mut resp, 0xDEAD_BEEF);
        assert_eq!(decode_read_link(&resp, 0x4).unwrap(), 0xDEAD_BEEF);
        assert_eq!(decode_read_link(&resp, 0x5), Err(ProtoError::WrongResponse));
    }

    #[test]
    fn read_vme_batch_of_130_splits_into_three_chunks() {
        let addrs: Vec<u32> = (0..130).collect();
        let chunks: Vec<&[u32]> = addrs.chunks(VME_CHUNK_LEN).collect();
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].len(), 64);
        assert_eq!(chunks[1].len(), 64);
        assert_eq!(chunks[2].len(), 2);
    }

    #[test]
    fn pid_advances_only_after_match() {
        let mut pid = PidSequencer::new(true);
        assert_eq!(pid.current(), Some(0));
        // simulate a timeout: no advance
        assert_eq!(pid.current(), Some(0));
        pid.advance();
        assert_eq!(pid.current(), Some(1));
    }

    #[test]
    fn pid_disabled_is_absent() {
        let pid = PidSequencer::new(false);
        assert_eq!(pid.current(), None);
    }

    #[test]
    fn fifo_timeout_status_is_benign_but_reported() {
        assert_eq!(status_error(1 << 5), Err(StatusError::FifoTimeout));
        assert_eq!(status_error(1 << 4), Err(StatusError::NoGrant));
        assert_eq!(status_error(1 << 6), Err(StatusError::ProtocolError));
        assert_eq!(status_error(0), Ok(()));
    }

    #[test]
    fn fifo_datagram_packet_counter_is_low_nibble() {
        let mut datagram = vec![OP_READ_FIFO, 0x0A];
        datagram.extend_from_slice(&[1, 2, 3, 4]);
        let d = decode_fifo_datagram(&datagram, None).unwrap();
        assert_eq!(d.packet_counter, 0xA);
        assert_eq!(d.payload, &[1, 2, 3, 4]);
    }
}
