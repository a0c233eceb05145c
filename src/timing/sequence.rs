use super::Clock;
use crate::codec::{decode_variable, encode_variable};
use crate::error::Result;
use crate::event::Event;
use std::ops::Index;
use std::time::Duration;

/// Pulses per quarter note used when a track does not say otherwise.
pub const DEFAULT_PPQN: u16 = 480;

/// An event at a point in logical time, in pulses from the start of the sequence.
pub type TimedEvent = (u64, Event);

/// Events ordered by timestamp.
///
/// Built once, then shared read-only (usually behind an `Arc`) between any number of readers.
/// Events with equal timestamps keep the order they were given in.
#[derive(Debug, Clone, PartialEq)]
pub struct Sequence {
    ppqn: u16,
    events: Vec<TimedEvent>,
    clock: Clock,
}

impl Sequence {
    pub fn new(ppqn: u16, mut events: Vec<TimedEvent>) -> Self {
        events.sort_by_key(|(timestamp, _)| *timestamp);
        let ppqn = ppqn.max(1);
        let clock = Clock::from_events(ppqn, &events);
        Self {
            ppqn,
            events,
            clock,
        }
    }

    pub fn empty(ppqn: u16) -> Self {
        Self::new(ppqn, Vec::new())
    }

    /// Reads a track body: pairs of varlen delta-times and stored events, with running status.
    ///
    /// Reading stops after an end-of-track meta event or at the end of input.
    pub fn read_track(ppqn: u16, mut raw: &[u8]) -> Result<Self> {
        let mut events = Vec::new();
        let mut running_status = None;
        let mut timestamp = 0u64;
        while !raw.is_empty() {
            timestamp += u64::from(decode_variable(&mut raw)?);
            let event = Event::decode(&mut raw, &mut running_status)?;
            let done = event.is_end_of_track();
            events.push((timestamp, event));
            if done {
                break;
            }
        }
        Ok(Self::new(ppqn, events))
    }

    /// Writes the events as a track body. An end-of-track event is appended if missing.
    ///
    /// Multi-channel events are written once per channel.
    pub fn write_track(&self) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        let mut running_status = None;
        let mut previous = 0u64;
        let mut ended = false;
        for (timestamp, event) in &self.events {
            let delta = u32::try_from(timestamp - previous).unwrap_or(u32::MAX);
            previous = *timestamp;
            if event.family().is_voice() && event.channels().len() > 1 {
                for (i, channel) in event.channels().iter().enumerate() {
                    out.extend(encode_variable(if i == 0 { delta } else { 0 })?);
                    event.with_channels(channel)?.encode(&mut running_status, &mut out)?;
                }
            } else {
                out.extend(encode_variable(delta)?);
                event.encode(&mut running_status, &mut out)?;
            }
            ended = event.is_end_of_track();
        }
        if !ended {
            out.push(0);
            Event::end_of_track().encode(&mut running_status, &mut out)?;
        }
        Ok(out)
    }

    #[inline]
    pub fn ppqn(&self) -> u16 {
        self.ppqn
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.events.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.events.is_empty()
    }

    #[inline]
    pub fn iter(&self) -> std::slice::Iter<'_, TimedEvent> {
        self.events.iter()
    }

    #[inline]
    pub fn get(&self, index: usize) -> Option<&TimedEvent> {
        self.events.get(index)
    }

    pub fn first_timestamp(&self) -> Option<u64> {
        self.events.first().map(|(t, _)| *t)
    }

    pub fn last_timestamp(&self) -> Option<u64> {
        self.events.last().map(|(t, _)| *t)
    }

    /// Index of the first event not before `timestamp`.
    pub fn lower_bound(&self, timestamp: u64) -> usize {
        self.events.partition_point(|(t, _)| *t < timestamp)
    }

    /// Index of the first event after `timestamp`.
    pub fn upper_bound(&self, timestamp: u64) -> usize {
        self.events.partition_point(|(t, _)| *t <= timestamp)
    }

    /// Tempo map derived from the tempo events.
    #[inline]
    pub fn clock(&self) -> &Clock {
        &self.clock
    }

    /// Wall-clock time at the last event.
    pub fn duration(&self) -> Duration {
        self.last_timestamp()
            .map(|t| self.clock.timestamp_to_time(t))
            .unwrap_or_default()
    }
}

impl Index<usize> for Sequence {
    type Output = TimedEvent;

    fn index(&self, index: usize) -> &TimedEvent {
        &self.events[index]
    }
}

impl<'a> IntoIterator for &'a Sequence {
    type Item = &'a TimedEvent;
    type IntoIter = std::slice::Iter<'a, TimedEvent>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}
