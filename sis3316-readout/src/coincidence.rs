//! Coincidence grouping over a merged event stream.
//!
//! A single greedy pass: find the first pair of events within the window,
//! grow the group while later events stay within the window of the group's
//! first event and haven't already contributed a channel, then close it.
//! The engine can be driven a group at a time or an event at a time; the
//! latter just drains a small queue the former fills.

use std::collections::{HashSet, VecDeque};

use sis3316_codec::ParsedEvent;
use sis3316_regs::Trigger;

/// Greedy coincidence grouping over `source`, keyed by `key` (so callers can
/// group on a delay-compensated effective timestamp rather than the raw
/// per-channel one — see `sis3316_readout::merge`).
pub struct CoincidenceEngine<I, F>
where
    I: Iterator<Item = ParsedEvent>,
    F: Fn(&ParsedEvent) -> i64,
{
    source: I,
    key: F,
    window: i64,
    held: Option<ParsedEvent>,
    queue: VecDeque<ParsedEvent>,
}

impl<I, F> CoincidenceEngine<I, F>
where
    I: Iterator<Item = ParsedEvent>,
    F: Fn(&ParsedEvent) -> i64,
{
    pub fn new(source: I, window: i64, key: F) -> Self {
        Self {
            source,
            key,
            window,
            held: None,
            queue: VecDeque::new(),
        }
    }

    fn take_next(&mut self) -> Option<ParsedEvent> {
        self.held.take().or_else(|| self.source.next())
    }

    /// Produce the next group, or `None` once the source and any held event
    /// are both exhausted.
    ///
    /// An event that never finds a partner is dropped silently *unless* it
    /// is the last event in the entire stream, in which case it is emitted
    /// as a singleton group (so a caller never loses the tail of the
    /// stream to truncation, per spec.md's boundary case).
    pub fn next_group(&mut self) -> Option<Vec<ParsedEvent>> {
        let mut e0 = self.take_next()?;
        loop {
            let e1 = match self.source.next() {
                Some(e) => e,
                None => return Some(vec![e0]),
            };
            if ((self.key)(&e1) - (self.key)(&e0)).abs() > self.window {
                e0 = e1;
                continue;
            }

            let anchor = (self.key)(&e0);
            let mut chans = HashSet::new();
            chans.insert(e0.chan);
            chans.insert(e1.chan);
            let mut group = vec![e0, e1];

            loop {
                match self.source.next() {
                    Some(e) => {
                        let within = ((self.key)(&e) - anchor).abs() <= self.window;
                        if within && !chans.contains(&e.chan) {
                            chans.insert(e.chan);
                            group.push(e);
                        } else {
                            self.held = Some(e);
                            break;
                        }
                    }
                    None => break,
                }
            }
            return Some(group);
        }
    }
}

impl<I, F> Iterator for CoincidenceEngine<I, F>
where
    I: Iterator<Item = ParsedEvent>,
    F: Fn(&ParsedEvent) -> i64,
{
    /// One event-at-a-time, drained from the internal queue and refilled a
    /// group at a time.
    type Item = ParsedEvent;

    fn next(&mut self) -> Option<ParsedEvent> {
        if let Some(e) = self.queue.pop_front() {
            return Some(e);
        }
        let group = self.next_group()?;
        self.queue.extend(group);
        self.queue.pop_front()
    }
}

/// Apply a trigger filter to one closed group: for each trigger whose
/// channel-set is a subset of the group's channels, emit `(trigger_name,
/// event)` for every event in the group whose channel belongs to that
/// trigger. A group matching no trigger contributes nothing.
pub fn filter_group(group: &[ParsedEvent], triggers: &[Trigger]) -> Vec<(String, ParsedEvent)> {
    let present: Vec<u8> = group.iter().map(|e| e.chan as u8).collect();
    let mut out = Vec::new();
    for t in triggers {
        if !t.is_subset_of(&present) {
            continue;
        }
        for e in group {
            if t.channels.contains(&(e.chan as u8)) {
                out.push((t.name.clone(), e.clone()));
            }
        }
    }
    out
}

/// Drives a `CoincidenceEngine` group-by-group and applies `filter_group`
/// to each, exposing the result as an iterator of `(trigger, event)` pairs.
pub struct FilteredCoincidence<I, F>
where
    I: Iterator<Item = ParsedEvent>,
    F: Fn(&ParsedEvent) -> i64,
{
    engine: CoincidenceEngine<I, F>,
    triggers: Vec<Trigger>,
    queue: VecDeque<(String, ParsedEvent)>,
}

impl<I, F> FilteredCoincidence<I, F>
where
    I: Iterator<Item = ParsedEvent>,
    F: Fn(&ParsedEvent) -> i64,
{
    pub fn new(engine: CoincidenceEngine<I, F>, triggers: Vec<Trigger>) -> Self {
        Self {
            engine,
            triggers,
            queue: VecDeque::new(),
        }
    }
}

impl<I, F> Iterator for FilteredCoincidence<I, F>
where
    I: Iterator<Item = ParsedEvent>,
    F: Fn(&ParsedEvent) -> i64,
{
    type Item = (String, ParsedEvent);

    fn next(&mut self) -> Option<(String, ParsedEvent)> {
        loop {
            if let Some(pair) = self.queue.pop_front() {
                return Some(pair);
            }
            let group = self.engine.next_group()?;
            let filtered = filter_group(&group, &self.triggers);
            if filtered.is_empty() {
                continue;
            }
            self.queue.extend(filtered);
        }
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

    fn identity_key(e: &ParsedEvent) -> i64 {
        e.ts as i64
    }

    /// Scenario 4: three channels, trigger T={5,9}, window=2.
    #[test]
    fn coincidence_with_filter_scenario() {
        let events = vec![
            event(5, 100),
            event(9, 101),
            event(3, 104),
            event(5, 200),
            event(9, 205),
        ];
        let engine = CoincidenceEngine::new(events.into_iter(), 2, identity_key);
        let t = Trigger::new("T", vec![5, 9]).unwrap();
        let out: Vec<(String, u64)> = FilteredCoincidence::new(engine, vec![t])
            .map(|(name, e)| (name, e.ts))
            .collect();
        assert_eq!(
            out,
            vec![("T".to_string(), 100), ("T".to_string(), 101)]
        );
    }

    #[test]
    fn every_group_satisfies_window_and_distinct_channel_invariants() {
        let events = vec![
            event(0, 0),
            event(1, 1),
            event(2, 2),
            event(0, 50),
            event(1, 51),
        ];
        let mut engine = CoincidenceEngine::new(events.into_iter(), 2, identity_key);
        while let Some(group) = engine.next_group() {
            let min = group.iter().map(|e| e.ts).min().unwrap();
            let max = group.iter().map(|e| e.ts).max().unwrap();
            assert!(max - min <= 2);
            let mut seen = HashSet::new();
            for e in &group {
                assert!(seen.insert(e.chan), "duplicate channel in group");
            }
        }
    }

    #[test]
    fn group_starting_at_the_last_event_is_still_emitted() {
        let events = vec![event(0, 0), event(1, 100)];
        let mut engine = CoincidenceEngine::new(events.into_iter(), 2, identity_key);
        // (0,0) and (1,100) are too far apart (diff=100 > 2): (0,0) is
        // discarded, (1,100) becomes the new e0 and is the stream's last
        // event, so it must still come out as a singleton group.
        let g1 = engine.next_group().unwrap();
        assert_eq!(g1, vec![event(1, 100)]);
        assert!(engine.next_group().is_none());
    }

    #[test]
    fn zero_window_requires_identical_timestamps() {
        let events = vec![event(0, 5), event(1, 5), event(2, 6)];
        let mut engine = CoincidenceEngine::new(events.into_iter(), 0, identity_key);
        let g1 = engine.next_group().unwrap();
        assert_eq!(g1.iter().map(|e| e.chan).collect::<Vec<_>>(), vec![0, 1]);
        let g2 = engine.next_group().unwrap();
        assert_eq!(g2, vec![event(2, 6)]);
    }

    #[test]
    fn single_event_stream_is_emitted_as_its_own_group() {
        let events = vec![event(0, 0)];
        let mut engine = CoincidenceEngine::new(events.into_iter(), 2, identity_key);
        assert_eq!(engine.next_group(), Some(vec![event(0, 0)]));
        assert_eq!(engine.next_group(), None);
    }

    #[test]
    fn empty_trigger_channel_set_is_rejected_at_construction() {
        assert!(Trigger::new("bad", vec![]).is_err());
    }
}
