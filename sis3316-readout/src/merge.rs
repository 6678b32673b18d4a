//! K-way time-merge over per-channel event readers (§4.G).
//!
//! A min-heap keyed on effective timestamp holds one slot per reader; the
//! minimum is popped, emitted, and the vacated slot refilled from its
//! reader. Ties are broken by reader index so the merge is stable.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::time::Duration;

use sis3316_codec::ParsedEvent;

/// What to do when a reader runs out of events.
#[derive(Copy, Clone, Debug)]
pub enum EndBehavior {
    /// Drop the reader once it yields `None`; the merge ends once every
    /// reader has been dropped. Used for post-hoc merges over closed files.
    Finite,
    /// Park the reader and re-poll it after `poll_interval`, rather than
    /// dropping it. Used to tail readers whose backing file a concurrent
    /// bank drain is still appending to; the merge then never ends on its
    /// own (the caller decides when to stop pulling from it).
    Follow { poll_interval: Duration },
}

/// Per-channel delay compensation table: `effective_ts = ts - delay[chan]`.
pub type DelayTable = HashMap<u16, i64>;

/// Merges events from any number of per-channel readers into one
/// non-decreasing (by effective timestamp) stream.
pub struct Merger<I: Iterator<Item = ParsedEvent>> {
    readers: Vec<Option<I>>,
    pending: Vec<Option<ParsedEvent>>,
    heap: BinaryHeap<Reverse<(i64, usize)>>,
    delays: DelayTable,
    end_behavior: EndBehavior,
}

impl<I: Iterator<Item = ParsedEvent>> Merger<I> {
    pub fn new(readers: Vec<I>, delays: DelayTable, end_behavior: EndBehavior) -> Self {
        let n = readers.len();
        let mut merger = Self {
            readers: readers.into_iter().map(Some).collect(),
            pending: vec![None; n],
            heap: BinaryHeap::with_capacity(n),
            delays,
            end_behavior,
        };
        for idx in 0..n {
            merger.refill(idx);
        }
        merger
    }

    fn effective_ts(&self, event: &ParsedEvent) -> i64 {
        event.ts as i64 - self.delays.get(&event.chan).copied().unwrap_or(0)
    }

    /// Pull one event from reader `idx` and push its key onto the heap. If
    /// the reader is exhausted, either drop it (`Finite`) or leave it
    /// parked for the next retry pass (`Follow`).
    fn refill(&mut self, idx: usize) {
        let Some(reader) = self.readers[idx].as_mut() else {
            return;
        };
        match reader.next() {
            Some(event) => {
                let key = self.effective_ts(&event);
                self.pending[idx] = Some(event);
                self.heap.push(Reverse((key, idx)));
            }
            None => {
                if let EndBehavior::Finite = self.end_behavior {
                    self.readers[idx] = None;
                }
            }
        }
    }

    fn any_reader_left(&self) -> bool {
        self.readers.iter().any(Option::is_some)
    }

    /// Pop and return the event with the smallest effective timestamp,
    /// refilling its slot. Returns `None` once every reader is exhausted
    /// (`Finite`) — in `Follow` mode this blocks, sleeping and re-polling
    /// parked readers, until one yields an event.
    pub fn next_event(&mut self) -> Option<ParsedEvent> {
        loop {
            if let Some(Reverse((_, idx))) = self.heap.pop() {
                let event = self.pending[idx]
                    .take()
                    .expect("heap entry implies a pending event");
                self.refill(idx);
                return Some(event);
            }
            if !self.any_reader_left() {
                return None;
            }
            match self.end_behavior {
                EndBehavior::Finite => return None,
                EndBehavior::Follow { poll_interval } => {
                    std::thread::sleep(poll_interval);
                    for idx in 0..self.readers.len() {
                        self.refill(idx);
                    }
                }
            }
        }
    }
}

impl<I: Iterator<Item = ParsedEvent>> Iterator for Merger<I> {
    type Item = ParsedEvent;

    fn next(&mut self) -> Option<ParsedEvent> {
        self.next_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn event(chan: u16, ts: u64) -> ParsedEvent {
        ParsedEvent {
            chan,
            ts,
            sub_blocks: Default::default(),
            maw_ena: false,
            raw: Vec::new(),
            avg: Vec::new(),
            size_in_bytes: 0,
        }
    }

    #[test]
    fn merges_two_sorted_channels_by_timestamp() {
        let a = vec![event(0, 10), event(0, 30), event(0, 50)].into_iter();
        let b = vec![event(1, 20), event(1, 40)].into_iter();
        let merger = Merger::new(vec![a, b], DelayTable::new(), EndBehavior::Finite);
        let ts: Vec<u64> = merger.map(|e| e.ts).collect();
        assert_eq!(ts, vec![10, 20, 30, 40, 50]);
    }

    #[test]
    fn equal_timestamps_break_ties_by_reader_index() {
        let a = vec![event(0, 10)].into_iter();
        let b = vec![event(1, 10)].into_iter();
        let merger = Merger::new(vec![a, b], DelayTable::new(), EndBehavior::Finite);
        let chans: Vec<u16> = merger.map(|e| e.chan).collect();
        assert_eq!(chans, vec![0, 1]);
    }

    #[test]
    fn delay_compensation_reorders_effective_timestamps() {
        let a = vec![event(0, 100)].into_iter();
        let b = vec![event(1, 90)].into_iter();
        let mut delays = DelayTable::new();
        delays.insert(1, -20); // channel 1's effective ts = 90 - (-20) = 110
        let merger = Merger::new(vec![a, b], delays, EndBehavior::Finite);
        let chans: Vec<u16> = merger.map(|e| e.chan).collect();
        assert_eq!(chans, vec![0, 1]);
    }

    #[test]
    fn sorted_by_effective_timestamp_property() {
        // For any finite set of per-channel streams whose events are sorted
        // by ts, the merge output is sorted by `ts - delay[chan]`.
        let a = vec![event(0, 5), event(0, 15), event(0, 25)].into_iter();
        let b = vec![event(1, 1), event(1, 2), event(1, 40)].into_iter();
        let mut delays = DelayTable::new();
        delays.insert(0, 3);
        delays.insert(1, -1);
        let merger = Merger::new(vec![a, b], delays.clone(), EndBehavior::Finite);
        let effective: Vec<i64> = merger
            .map(|e| e.ts as i64 - delays.get(&e.chan).copied().unwrap_or(0))
            .collect();
        let mut sorted = effective.clone();
        sorted.sort();
        assert_eq!(effective, sorted);
    }

    #[test]
    fn an_empty_reader_set_yields_nothing() {
        let merger: Merger<std::vec::IntoIter<ParsedEvent>> =
            Merger::new(vec![], DelayTable::new(), EndBehavior::Finite);
        assert_eq!(merger.count(), 0);
    }

    proptest::proptest! {
        #[test]
        fn merge_of_sorted_streams_is_sorted_by_effective_ts(
            chan0_ts in proptest::collection::vec(0u64..1000, 0..20),
            chan1_ts in proptest::collection::vec(0u64..1000, 0..20),
            delay0 in -50i64..50,
            delay1 in -50i64..50,
        ) {
            let mut a: Vec<u64> = chan0_ts;
            a.sort_unstable();
            let mut b: Vec<u64> = chan1_ts;
            b.sort_unstable();

            let mut delays = DelayTable::new();
            delays.insert(0, delay0);
            delays.insert(1, delay1);

            let readers = vec![
                a.iter().map(|&ts| event(0, ts)).collect::<Vec<_>>().into_iter(),
                b.iter().map(|&ts| event(1, ts)).collect::<Vec<_>>().into_iter(),
            ];
            let merger = Merger::new(readers, delays.clone(), EndBehavior::Finite);
            let effective: Vec<i64> = merger
                .map(|e| e.ts as i64 - delays.get(&e.chan).copied().unwrap_or(0))
                .collect();
            let mut sorted = effective.clone();
            sorted.sort();
            proptest::prop_assert_eq!(effective, sorted);
        }
    }
}
