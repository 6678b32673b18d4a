//! Self-describing, variable-length event record codec.
//!
//! Parsing is two-phase: peek enough bytes to derive the record's shape
//! (`fmt` bits, `n_raw`, `n_avg`) without committing to having consumed
//! anything, then consume exactly that many bytes. Any structural
//! violation triggers the resync policy: the caller advances the cursor by
//! one byte and tries again, rather than unwinding an exception across
//! layers.

use byteorder::{ByteOrder, LittleEndian};
use log::trace;
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

/// Maximum bytes a header (everything before the raw sample array) can
/// occupy: 2 header words + 4 sub-blocks (7+2+3+2 words) + raw-data header
/// + averaging header.
pub const MAX_HEADER_PEEK: usize = (2 + 7 + 2 + 3 + 2 + 1 + 1) * 4;

pub const MAX_N_RAW: u32 = 65536;
pub const MAX_N_AVG: u32 = 65534;

const SUBBLOCK_WORD_COUNTS: [u32; 4] = [7, 2, 3, 2];

/// The two mandatory header words, read as a fixed-size zero-copy struct
/// and then decoded field-by-field with explicit little-endian framing
/// (the struct only buys us a single bounds-checked extraction; the 32-bit
/// values inside are still interpreted by `byteorder`, since the bitfields
/// packed into them aren't byte-aligned).
#[derive(Copy, Clone, FromBytes, IntoBytes, Immutable, KnownLayout)]
#[repr(C)]
struct HeaderWords {
    w0: [u8; 4],
    w1: [u8; 4],
}

#[derive(Copy, Clone, Debug)]
struct DecodedHeader {
    fmt: u8,
    chan: u16,
    ts: u64,
}

fn decode_header(buf: &[u8]) -> Option<DecodedHeader> {
    let words = HeaderWords::read_from_bytes(buf.get(..8)?).ok()?;
    let w0 = LittleEndian::read_u32(&words.w0);
    let w1 = LittleEndian::read_u32(&words.w1);
    let fmt = ((w0 >> 28) & 0xF) as u8;
    let chan = ((w0 >> 16) & 0xFFF) as u16;
    let ts_hi = (w0 & 0xFFFF) as u64;
    let ts_lo1 = ((w1 >> 16) & 0xFFFF) as u64;
    let ts_lo2 = (w1 & 0xFFFF) as u64;
    let ts = (ts_hi << 32) | (ts_lo1 << 16) | ts_lo2;
    Some(DecodedHeader { fmt, chan, ts })
}

/// Peak/charge accumulator sub-block (`fmt` bit 0): 7 words.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct PeakAccum {
    pub npeak: i16,
    pub peak: i16,
    pub info: i8,
    pub acc1: i32,
    pub acc2: i32,
    pub acc3: i32,
    pub acc4: i32,
    pub acc5: i32,
    pub acc6: i32,
}

/// MAW max/before/after-trigger sub-block (`fmt` bit 2): 3 words.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct MawValues {
    pub maw_max: i32,
    pub maw_after_trig: i32,
    pub maw_before_trig: i32,
}

#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
pub struct SubBlocks {
    pub peak_accum: Option<PeakAccum>,
    pub acc78: Option<(i32, i32)>,
    pub maw: Option<MawValues>,
    pub energy: Option<(i32, i32)>,
}

/// A fully decoded event record.
#[derive(Clone, Debug, PartialEq)]
pub struct ParsedEvent {
    pub chan: u16,
    pub ts: u64,
    pub sub_blocks: SubBlocks,
    pub maw_ena: bool,
    pub raw: Vec<i16>,
    pub avg: Vec<i16>,
    pub size_in_bytes: usize,
}

/// Pluggable source of the MAW trailer's length, since it is never
/// recorded on the wire. The crate refuses to parse an event with
/// `maw_ena` set unless a provider supplies a length (design note's
/// option (b); silently guessing is explicitly rejected).
pub trait MawLengthProvider {
    /// Length of the MAW trailer, in words, for the given channel. `None`
    /// means "unknown": the event cannot be parsed.
    fn maw_trailer_words(&self, chan: u16) -> Option<u32>;
}

/// The conservative default: MAW trailers are never parseable unless the
/// caller supplies a provider that knows better (e.g. one backed by the
/// device's per-group MAW-length configuration register).
pub struct NoMawSupport;

impl MawLengthProvider for NoMawSupport {
    fn maw_trailer_words(&self, _chan: u16) -> Option<u32> {
        None
    }
}

/// A provider backed by a fixed per-channel table, for deployments where
/// the MAW length is known out-of-band (e.g. read once from the device's
/// configuration at startup).
pub struct FixedMawLength(pub std::collections::HashMap<u16, u32>);

impl MawLengthProvider for FixedMawLength {
    fn maw_trailer_words(&self, chan: u16) -> Option<u32> {
        self.0.get(&chan).copied()
    }
}

#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub enum CodecError {
    /// Buffer doesn't yet hold a complete event; caller should read more
    /// and retry, not resync.
    NeedMoreData,
    /// A structural invariant failed; caller should advance one byte and
    /// retry (resync policy).
    Resync,
    /// `maw_ena` was set and no `MawLengthProvider` could resolve the
    /// trailer length.
    MawLengthUnavailable,
}

impl std::fmt::Display for CodecError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CodecError::NeedMoreData => write!(f, "buffer too short for a complete event"),
            CodecError::Resync => write!(f, "structural check failed, resync required"),
            CodecError::MawLengthUnavailable => {
                write!(f, "maw_ena set but no trailer length available")
            }
        }
    }
}

impl std::error::Error for CodecError {}

/// A successfully decoded event plus how many bytes of the input it
/// consumed.
pub struct Decoded {
    pub event: ParsedEvent,
    pub consumed: usize,
}

/// Cached shape of the most recently decoded event, invalidated whenever
/// the next event's `fmt` nibble differs (events from the same channel in
/// steady state share a shape, so this avoids recomputing sub-block
/// layout on every call).
#[derive(Copy, Clone, Debug, Default)]
struct ShapeCache {
    fmt: Option<u8>,
    subblock_words: u32,
}

impl ShapeCache {
    fn subblock_words_for(&mut self, fmt: u8) -> u32 {
        if self.fmt != Some(fmt) {
            let mut words = 0;
            for (bit, count) in SUBBLOCK_WORD_COUNTS.iter().enumerate() {
                if fmt & (1 << bit) != 0 {
                    words += count;
                }
            }
            self.fmt = Some(fmt);
            self.subblock_words = words;
        }
        self.subblock_words
    }
}

/// Stateful decoder: owns the shape cache and the MAW length provider.
pub struct EventDecoder<M: MawLengthProvider = NoMawSupport> {
    shape: ShapeCache,
    maw: M,
}

impl EventDecoder<NoMawSupport> {
    pub fn new() -> Self {
        Self {
            shape: ShapeCache::default(),
            maw: NoMawSupport,
        }
    }
}

impl Default for EventDecoder<NoMawSupport> {
    fn default() -> Self {
        Self::new()
    }
}

impl<M: MawLengthProvider> EventDecoder<M> {
    pub fn with_maw_provider(maw: M) -> Self {
        Self {
            shape: ShapeCache::default(),
            maw,
        }
    }

    /// Attempt to decode one event starting at `buf[0]`.
    pub fn decode_one(&mut self, buf: &[u8]) -> Result<Decoded, CodecError> {
        if buf.len() < 8 {
            return Err(CodecError::NeedMoreData);
        }
        let header = decode_header(buf).ok_or(CodecError::NeedMoreData)?;
        let mut off = 8usize;

        let subblock_words = self.shape.subblock_words_for(header.fmt) as usize;
        let subblock_bytes = subblock_words * 4;
        if buf.len() < off + subblock_bytes {
            return Err(CodecError::NeedMoreData);
        }
        let sub_blocks = decode_subblocks(header.fmt, &buf[off..off + subblock_bytes])?;
        off += subblock_bytes;

        if buf.len() < off + 4 {
            return Err(CodecError::NeedMoreData);
        }
        let raw_hdr = LittleEndian::read_u32(&buf[off..off + 4]);
        let tag = (raw_hdr >> 28) & 0xF;
        let maw_ena = (raw_hdr >> 27) & 0x1 != 0;
        let n_raw = (raw_hdr & 0x01FF_FFFF) * 2;
        off += 4;

        if tag != 0xE && tag != 0xA {
            return Err(CodecError::Resync);
        }
        if n_raw > MAX_N_RAW {
            return Err(CodecError::Resync);
        }

        let n_avg = if tag == 0xA {
            if buf.len() < off + 4 {
                return Err(CodecError::NeedMoreData);
            }
            let avg_hdr = LittleEndian::read_u32(&buf[off..off + 4]);
            let avg_tag = (avg_hdr >> 28) & 0xF;
            if avg_tag != 0xE {
                return Err(CodecError::Resync);
            }
            let n_avg = (avg_hdr & 0xFFFF) * 2;
            if n_avg > MAX_N_AVG {
                return Err(CodecError::Resync);
            }
            off += 4;
            n_avg
        } else {
            0
        };

        let raw_bytes = n_raw as usize * 2;
        let avg_bytes = n_avg as usize * 2;
        let samples_end = off + raw_bytes + avg_bytes;

        let trailer_bytes = if maw_ena {
            let words = self
                .maw
                .maw_trailer_words(header.chan)
                .ok_or(CodecError::MawLengthUnavailable)?;
            words as usize * 4
        } else {
            0
        };
        let total = samples_end + trailer_bytes;

        if buf.len() < total {
            return Err(CodecError::NeedMoreData);
        }

        let raw = read_i16_samples(&buf[off..off + raw_bytes]);
        let avg = read_i16_samples(&buf[off + raw_bytes..off + raw_bytes + avg_bytes]);

        trace!(
            "decoded event chan={} ts={} fmt={:#x} n_raw={} n_avg={} size={}",
            header.chan, header.ts, header.fmt, n_raw, n_avg, total
        );

        Ok(Decoded {
            event: ParsedEvent {
                chan: header.chan,
                ts: header.ts,
                sub_blocks,
                maw_ena,
                raw,
                avg,
                size_in_bytes: total,
            },
            consumed: total,
        })
    }
}

fn read_i16_samples(bytes: &[u8]) -> Vec<i16> {
    bytes
        .chunks_exact(2)
        .map(LittleEndian::read_i16)
        .collect()
}

fn word_has_clean_top_nibble(word: u32) -> bool {
    word >> 28 == 0
}

fn decode_subblocks(fmt: u8, bytes: &[u8]) -> Result<SubBlocks, CodecError> {
    let mut off = 0usize;
    let mut out = SubBlocks::default();

    if fmt & 0b0001 != 0 {
        let npeak = LittleEndian::read_i16(&bytes[off..off + 2]);
        let peak = LittleEndian::read_i16(&bytes[off + 2..off + 4]);
        off += 4;
        let info_acc1 = LittleEndian::read_u32(&bytes[off..off + 4]);
        let info = (info_acc1 >> 24) as i8;
        let acc1 = (info_acc1 & 0x00FF_FFFF) as i32;
        off += 4;
        let mut accs = [0i32; 5];
        for acc in accs.iter_mut() {
            let word = LittleEndian::read_u32(&bytes[off..off + 4]);
            if !word_has_clean_top_nibble(word) {
                return Err(CodecError::Resync);
            }
            *acc = word as i32;
            off += 4;
        }
        out.peak_accum = Some(PeakAccum {
            npeak,
            peak,
            info,
            acc1,
            acc2: accs[0],
            acc3: accs[1],
            acc4: accs[2],
            acc5: accs[3],
            acc6: accs[4],
        });
    }

    if fmt & 0b0010 != 0 {
        let acc7 = LittleEndian::read_u32(&bytes[off..off + 4]);
        let acc8 = LittleEndian::read_u32(&bytes[off + 4..off + 8]);
        if !word_has_clean_top_nibble(acc7) || !word_has_clean_top_nibble(acc8) {
            return Err(CodecError::Resync);
        }
        out.acc78 = Some((acc7 as i32, acc8 as i32));
        off += 8;
    }

    if fmt & 0b0100 != 0 {
        let maw_max = LittleEndian::read_u32(&bytes[off..off + 4]);
        let maw_after = LittleEndian::read_u32(&bytes[off + 4..off + 8]);
        let maw_before = LittleEndian::read_u32(&bytes[off + 8..off + 12]);
        if !word_has_clean_top_nibble(maw_max)
            || !word_has_clean_top_nibble(maw_after)
            || !word_has_clean_top_nibble(maw_before)
        {
            return Err(CodecError::Resync);
        }
        out.maw = Some(MawValues {
            maw_max: maw_max as i32,
            maw_after_trig: maw_after as i32,
            maw_before_trig: maw_before as i32,
        });
        off += 12;
    }

    if fmt & 0b1000 != 0 {
        let e_start = LittleEndian::read_u32(&bytes[off..off + 4]);
        let e_max = LittleEndian::read_u32(&bytes[off + 4..off + 8]);
        if !word_has_clean_top_nibble(e_start) || !word_has_clean_top_nibble(e_max) {
            return Err(CodecError::Resync);
        }
        out.energy = Some((e_start as i32, e_max as i32));
    }

    Ok(out)
}

/// Parse every event out of `buf`, applying the resync policy (advance one
/// byte, retry) on structural failure; stops at the first `NeedMoreData`
/// (treated as EOF mid-event by the caller).
pub fn decode_stream<M: MawLengthProvider>(
    decoder: &mut EventDecoder<M>,
    buf: &[u8],
) -> Vec<ParsedEvent> {
    let mut events = Vec::new();
    let mut pos = 0usize;
    while pos < buf.len() {
        match decoder.decode_one(&buf[pos..]) {
            Ok(Decoded { event, consumed }) => {
                events.push(event);
                pos += consumed;
            }
            Err(CodecError::Resync) => {
                pos += 1;
            }
            Err(CodecError::NeedMoreData) | Err(CodecError::MawLengthUnavailable) => break,
        }
    }
    events
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header_word0(fmt: u8, chan: u16, ts_hi: u16) -> u32 {
        ((fmt as u32) << 28) | ((chan as u32 & 0xFFF) << 16) | ts_hi as u32
    }

    fn header_word1(ts_lo1: u16, ts_lo2: u16) -> u32 {
        ((ts_lo1 as u32) << 16) | ts_lo2 as u32
    }

    fn push_u32(buf: &mut Vec<u8>, v: u32) {
        let mut tmp = [0u8; 4];
        LittleEndian::write_u32(&mut tmp, v);
        buf.extend_from_slice(&tmp);
    }

    /// scenario 3: shortest fmt=0b0001 event with n_raw=0.
    #[test]
    fn event_parse_scenario_peak_accum_only() {
        let mut buf = Vec::new();
        push_u32(&mut buf, header_word0(0b0001, 1, 0));
        push_u32(&mut buf, header_word1(0, 0));
        // 7 accumulator-block words, all zero.
        for _ in 0..7 {
            push_u32(&mut buf, 0);
        }
        // raw-data header: tag=0xE, maw_ena=0, n_raw=0
        push_u32(&mut buf, 0xE000_0000);

        let mut dec = EventDecoder::new();
        let Decoded { event, consumed } = dec.decode_one(&buf).unwrap();
        assert_eq!(event.chan, 1);
        assert_eq!(event.ts, 0);
        assert_eq!(event.raw.len(), 0);
        assert_eq!(consumed, 40);
        assert_eq!(event.size_in_bytes, 40);
    }

    #[test]
    fn n_raw_zero_with_fmt_zero_is_the_shortest_valid_event() {
        let mut buf = Vec::new();
        push_u32(&mut buf, header_word0(0, 2, 7));
        push_u32(&mut buf, header_word1(0, 0));
        push_u32(&mut buf, 0xE000_0000);

        let mut dec = EventDecoder::new();
        let Decoded { event, consumed } = dec.decode_one(&buf).unwrap();
        assert_eq!(consumed, 12);
        assert_eq!(event.chan, 2);
        assert_eq!(event.raw.len(), 0);
    }

    #[test]
    fn raw_samples_round_trip() {
        let mut buf = Vec::new();
        push_u32(&mut buf, header_word0(0, 3, 0));
        push_u32(&mut buf, header_word1(0, 5));
        push_u32(&mut buf, 0xE000_0002); // n_raw = 2*2 = 4
        for v in [-1i16, 42, 1000, -2000] {
            let mut tmp = [0u8; 2];
            LittleEndian::write_i16(&mut tmp, v);
            buf.extend_from_slice(&tmp);
        }

        let mut dec = EventDecoder::new();
        let Decoded { event, .. } = dec.decode_one(&buf).unwrap();
        assert_eq!(event.raw, vec![-1, 42, 1000, -2000]);
        assert_eq!(event.ts, 5);
    }

    #[test]
    fn maw_ena_without_provider_is_refused() {
        let mut buf = Vec::new();
        push_u32(&mut buf, header_word0(0, 0, 0));
        push_u32(&mut buf, header_word1(0, 0));
        push_u32(&mut buf, 0xE800_0000); // maw_ena bit set, n_raw=0

        let mut dec = EventDecoder::new();
        assert_eq!(dec.decode_one(&buf), Err(CodecError::MawLengthUnavailable));
    }

    #[test]
    fn maw_ena_with_provider_consumes_trailer() {
        let mut buf = Vec::new();
        push_u32(&mut buf, header_word0(0, 4, 0));
        push_u32(&mut buf, header_word1(0, 0));
        push_u32(&mut buf, 0xE800_0000); // maw_ena, n_raw=0
        push_u32(&mut buf, 0x1111_1111); // pretend 1-word maw trailer
        buf.push(0xAA); // garbage after, must not be consumed

        let mut table = std::collections::HashMap::new();
        table.insert(4u16, 1u32);
        let mut dec = EventDecoder::with_maw_provider(FixedMawLength(table));
        let Decoded { consumed, .. } = dec.decode_one(&buf).unwrap();
        assert_eq!(consumed, buf.len() - 1);
    }

    #[test]
    fn garbage_prefix_resyncs_byte_by_byte() {
        let mut good = Vec::new();
        push_u32(&mut good, header_word0(0, 1, 0));
        push_u32(&mut good, header_word1(0, 0));
        push_u32(&mut good, 0xE000_0000);

        let mut buf = vec![0xFFu8, 0xAA, 0xBB];
        buf.extend_from_slice(&good);

        let mut dec = EventDecoder::new();
        let events = decode_stream(&mut dec, &buf);
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].chan, 1);
    }

    #[test]
    fn misaligned_accumulator_top_nibble_triggers_resync() {
        let mut buf = Vec::new();
        push_u32(&mut buf, header_word0(0b0001, 1, 0));
        push_u32(&mut buf, header_word1(0, 0));
        push_u32(&mut buf, 0); // npeak/peak
        push_u32(&mut buf, 0); // info/acc1
        push_u32(&mut buf, 0xF000_0000); // acc2 with dirty top nibble
        for _ in 0..4 {
            push_u32(&mut buf, 0);
        }
        push_u32(&mut buf, 0xE000_0000);

        let mut dec = EventDecoder::new();
        assert_eq!(dec.decode_one(&buf), Err(CodecError::Resync));
    }

    proptest::proptest! {
        #[test]
        fn round_trip_for_well_formed_events(
            chan in 0u16..4096,
            ts in 0u64..(1u64 << 48),
            n_raw_half in 0u32..200,
            extra_samples in proptest::collection::vec(proptest::prelude::any::<i16>(), 0..400),
        ) {
            let n_raw_half = if extra_samples.is_empty() { 0 } else { n_raw_half };
            let n_raw = n_raw_half * 2;
            let samples: Vec<i16> = extra_samples
                .into_iter()
                .cycle()
                .take(n_raw as usize)
                .collect();
            let mut buf = Vec::new();
            push_u32(&mut buf, header_word0(0, chan, ((ts >> 32) & 0xFFFF) as u16));
            push_u32(&mut buf, header_word1(((ts >> 16) & 0xFFFF) as u16, (ts & 0xFFFF) as u16));
            push_u32(&mut buf, 0xE000_0000 | n_raw_half);
            for &v in &samples {
                let mut tmp = [0u8; 2];
                LittleEndian::write_i16(&mut tmp, v);
                buf.extend_from_slice(&tmp);
            }

            let mut dec = EventDecoder::new();
            let result = dec.decode_one(&buf);
            proptest::prop_assert!(result.is_ok());
            let Decoded { event, consumed } = result.unwrap();
            proptest::prop_assert_eq!(event.chan, chan);
            proptest::prop_assert_eq!(event.ts, ts);
            proptest::prop_assert_eq!(consumed, buf.len());
        }
    }
}
