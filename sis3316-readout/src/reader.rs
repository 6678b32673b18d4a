//! Per-channel event reader: wraps the codec over a byte source, exposing a
//! lazy, finite sequence of parsed events and tracking approximate
//! progress.

use std::io::Read;

use sis3316_codec::{CodecError, Decoded, EventDecoder, MawLengthProvider, NoMawSupport, ParsedEvent};

/// Initial/refill size for the reader's internal buffer.
const READ_CHUNK: usize = 64 * 1024;

/// Reads events out of one channel's concatenated record stream.
///
/// Resync (structural failures) and short reads are both handled
/// internally per §4.E: a resync advances the cursor by one byte and
/// retries; a read that can't complete an event because the source is
/// exhausted ends the iterator.
///
/// A `next() == None` is not permanent: if `source` is a file still being
/// appended to by an in-progress bank drain, a later call may succeed once
/// more bytes land. The k-way merge's follow mode (`sis3316_readout::merge`)
/// relies on this to tail a live readout.
pub struct ChannelReader<R: Read, M: MawLengthProvider = NoMawSupport> {
    source: R,
    buf: Vec<u8>,
    pos: usize,
    decoder: EventDecoder<M>,
    bytes_consumed: u64,
    total_len: Option<u64>,
}

impl<R: Read> ChannelReader<R, NoMawSupport> {
    pub fn new(source: R) -> Self {
        Self::with_decoder(source, EventDecoder::new())
    }

    pub fn with_total_len(source: R, total_len: u64) -> Self {
        let mut r = Self::new(source);
        r.total_len = Some(total_len);
        r
    }
}

impl<R: Read, M: MawLengthProvider> ChannelReader<R, M> {
    pub fn with_decoder(source: R, decoder: EventDecoder<M>) -> Self {
        Self {
            source,
            buf: Vec::with_capacity(READ_CHUNK),
            pos: 0,
            decoder,
            bytes_consumed: 0,
            total_len: None,
        }
    }

    /// Fraction of the source consumed so far, if the total length is
    /// known.
    pub fn progress(&self) -> Option<f64> {
        self.total_len
            .filter(|&len| len > 0)
            .map(|len| self.bytes_consumed as f64 / len as f64)
    }

    fn compact(&mut self) {
        if self.pos > 0 {
            self.buf.drain(..self.pos);
            self.pos = 0;
        }
    }

    fn fill(&mut self) -> std::io::Result<usize> {
        let mut tmp = [0u8; READ_CHUNK];
        let n = self.source.read(&mut tmp)?;
        self.buf.extend_from_slice(&tmp[..n]);
        Ok(n)
    }
}

impl<R: Read, M: MawLengthProvider> Iterator for ChannelReader<R, M> {
    type Item = ParsedEvent;

    fn next(&mut self) -> Option<ParsedEvent> {
        loop {
            self.compact();
            match self.decoder.decode_one(&self.buf[self.pos..]) {
                Ok(Decoded { event, consumed }) => {
                    self.pos += consumed;
                    self.bytes_consumed += consumed as u64;
                    return Some(event);
                }
                Err(CodecError::Resync) => {
                    self.pos += 1;
                    self.bytes_consumed += 1;
                    continue;
                }
                Err(CodecError::MawLengthUnavailable) => {
                    // Cannot make progress on this record; resync past its
                    // header and let the caller see subsequent events.
                    self.pos += 1;
                    self.bytes_consumed += 1;
                    continue;
                }
                Err(CodecError::NeedMoreData) => {
                    // Not permanent: `source` may grow later (a file being
                    // actively drained into). Nothing to do right now.
                    match self.fill() {
                        Ok(0) => return None,
                        Ok(_) => continue,
                        Err(_) => return None,
                    }
                }
            }
        }
    }
}
