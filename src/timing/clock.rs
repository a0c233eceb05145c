use super::sequence::TimedEvent;
use std::time::Duration;

/// Tempo assumed until the first tempo event: 120 beats per minute.
pub const DEFAULT_US_PER_QUARTER: u32 = 500_000;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Breakpoint {
    timestamp: u64,
    micros: f64,
    us_per_pulse: f64,
}

/// Piecewise-linear mapping between pulses and wall-clock time.
///
/// Holds one breakpoint per tempo change, always starting with one at timestamp 0.
#[derive(Debug, Clone, PartialEq)]
pub struct Clock {
    ppqn: u16,
    breakpoints: Vec<Breakpoint>,
}

impl Clock {
    /// A clock at the default tempo.
    pub fn new(ppqn: u16) -> Self {
        Self::with_tempo(ppqn, DEFAULT_US_PER_QUARTER)
    }

    pub fn with_tempo(ppqn: u16, us_per_quarter: u32) -> Self {
        let ppqn = ppqn.max(1);
        Self {
            ppqn,
            breakpoints: vec![Breakpoint {
                timestamp: 0,
                micros: 0.0,
                us_per_pulse: f64::from(us_per_quarter) / f64::from(ppqn),
            }],
        }
    }

    /// Builds the tempo map from the tempo events in `events`, which must be sorted.
    pub fn from_events(ppqn: u16, events: &[TimedEvent]) -> Self {
        let mut clock = Self::new(ppqn);
        for (timestamp, event) in events {
            if let Some(tempo) = event.tempo_value() {
                clock.push_tempo(*timestamp, tempo);
            }
        }
        clock
    }

    /// Appends a tempo change.
    ///
    /// Changes must be pushed in timestamp order; an earlier one is ignored.
    pub fn push_tempo(&mut self, timestamp: u64, us_per_quarter: u32) {
        let us_per_pulse = f64::from(us_per_quarter.max(1)) / f64::from(self.ppqn);
        let Some(last) = self.breakpoints.last_mut() else {
            return;
        };
        if timestamp < last.timestamp {
            tracing::warn!(timestamp, "tempo change out of order ignored");
            return;
        }
        if timestamp == last.timestamp {
            last.us_per_pulse = us_per_pulse;
            return;
        }
        let micros = last.micros + (timestamp - last.timestamp) as f64 * last.us_per_pulse;
        self.breakpoints.push(Breakpoint {
            timestamp,
            micros,
            us_per_pulse,
        });
    }

    #[inline]
    pub fn ppqn(&self) -> u16 {
        self.ppqn
    }

    /// Timestamps at which the tempo changes.
    pub fn breakpoints(&self) -> impl Iterator<Item = u64> + '_ {
        self.breakpoints.iter().map(|b| b.timestamp)
    }

    /// Tempo in effect at `timestamp`, in microseconds per quarter note.
    pub fn tempo_at(&self, timestamp: u64) -> u32 {
        let b = self.at_timestamp(timestamp);
        (b.us_per_pulse * f64::from(self.ppqn)).round() as u32
    }

    fn at_timestamp(&self, timestamp: u64) -> &Breakpoint {
        let i = self.breakpoints.partition_point(|b| b.timestamp <= timestamp);
        &self.breakpoints[i.saturating_sub(1)]
    }

    fn micros(&self, timestamp: u64) -> f64 {
        let b = self.at_timestamp(timestamp);
        b.micros + (timestamp - b.timestamp) as f64 * b.us_per_pulse
    }

    /// Wall-clock time elapsed from the start to `timestamp`.
    pub fn timestamp_to_time(&self, timestamp: u64) -> Duration {
        Duration::from_nanos((self.micros(timestamp) * 1000.0).round() as u64)
    }

    /// Timestamp reached after `time` has elapsed, rounded to the nearest pulse.
    pub fn time_to_timestamp(&self, time: Duration) -> u64 {
        let micros = time.as_nanos() as f64 / 1000.0;
        let i = self.breakpoints.partition_point(|b| b.micros <= micros);
        let b = &self.breakpoints[i.saturating_sub(1)];
        let pulses = ((micros - b.micros) / b.us_per_pulse).round().max(0.0);
        b.timestamp + pulses as u64
    }
}

impl Default for Clock {
    fn default() -> Self {
        Self::new(super::DEFAULT_PPQN)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use proptest::prelude::*;

    fn tempo_map() -> Clock {
        let events = vec![
            (0, Event::tempo(500_000).unwrap()),
            (960, Event::tempo(250_000).unwrap()),
            (1920, Event::tempo(1_000_000).unwrap()),
        ];
        Clock::from_events(480, &events)
    }

    #[test]
    fn default_tempo() {
        let clock = Clock::new(480);
        assert_eq!(clock.timestamp_to_time(480), Duration::from_millis(500));
        assert_eq!(clock.time_to_timestamp(Duration::from_secs(1)), 960);
        assert_eq!(clock.tempo_at(12345), DEFAULT_US_PER_QUARTER);
    }

    #[test]
    fn integrates_piecewise() {
        let clock = tempo_map();
        assert_eq!(clock.breakpoints().collect::<Vec<_>>(), [0, 960, 1920]);
        assert_eq!(clock.timestamp_to_time(960), Duration::from_secs(1));
        assert_eq!(clock.timestamp_to_time(1440), Duration::from_millis(1250));
        assert_eq!(clock.timestamp_to_time(1920), Duration::from_millis(1500));
        assert_eq!(clock.timestamp_to_time(2400), Duration::from_millis(2500));
        assert_eq!(clock.tempo_at(1000), 250_000);
    }

    #[test]
    fn round_trips_at_breakpoints() {
        let clock = tempo_map();
        for t in clock.breakpoints().collect::<Vec<_>>() {
            assert_eq!(clock.time_to_timestamp(clock.timestamp_to_time(t)), t);
        }
    }

    #[test]
    fn same_timestamp_tempo_replaces() {
        let mut clock = Clock::new(96);
        clock.push_tempo(0, 1_000_000);
        clock.push_tempo(96, 500_000);
        clock.push_tempo(96, 250_000);
        clock.push_tempo(10, 100);
        assert_eq!(clock.breakpoints().count(), 2);
        assert_eq!(clock.timestamp_to_time(192), Duration::from_millis(1250));
    }

    proptest! {
        #[test]
        fn monotonic(a in 0u64..1_000_000, b in 0u64..1_000_000) {
            let clock = tempo_map();
            let (lo, hi) = if a <= b { (a, b) } else { (b, a) };
            prop_assert!(clock.timestamp_to_time(lo) <= clock.timestamp_to_time(hi));
        }

        #[test]
        fn inverts(t in 0u64..1_000_000) {
            let clock = tempo_map();
            prop_assert_eq!(clock.time_to_timestamp(clock.timestamp_to_time(t)), t);
        }
    }
}
