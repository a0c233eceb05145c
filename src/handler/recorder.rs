use super::{
    Handler, HandlerCore, Identity, Message, ModeBit, Outcome, Properties, State, StateBit,
};
use crate::error::{Error, Result};
use crate::event::{Event, Family, FamilySet};
use crate::timing::{Clock, Sequence};
use parking_lot::Mutex;
use std::time::{Duration, Instant};

/// Consumes events and keeps timestamped copies.
///
/// Times are measured from the moment the handler was opened.
pub struct Recorder {
    core: HandlerCore,
    families: FamilySet,
    started: Mutex<Instant>,
    events: Mutex<Vec<(Duration, Event)>>,
}

impl Recorder {
    pub const TYPE: &'static str = "recorder";

    pub fn new(identity: Identity) -> Self {
        Self {
            core: identity.core(ModeBit::In.into()),
            families: Family::every(),
            started: Mutex::new(Instant::now()),
            events: Mutex::new(Vec::new()),
        }
    }

    /// Accepts an optional `families` property: comma separated family names.
    pub fn from_properties(identity: Identity, props: &Properties) -> Result<Self> {
        let mut recorder = Self::new(identity);
        if let Some(list) = props.get("families") {
            recorder.families = parse_families(list).ok_or_else(|| Error::InvalidProperty {
                key: "families".into(),
                value: list.into(),
            })?;
        }
        Ok(recorder)
    }

    pub fn len(&self) -> usize {
        self.events.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.events.lock().is_empty()
    }

    /// Recorded events without their times.
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().iter().map(|(_, e)| e.clone()).collect()
    }

    /// Recorded events with their arrival times.
    pub fn timed_events(&self) -> Vec<(Duration, Event)> {
        self.events.lock().clone()
    }

    pub fn clear(&self) {
        self.events.lock().clear();
    }

    /// Converts the recording into a sequence at `ppqn` and the default tempo.
    pub fn to_sequence(&self, ppqn: u16) -> Sequence {
        let clock = Clock::new(ppqn);
        let events = self
            .events
            .lock()
            .iter()
            .map(|(time, event)| (clock.time_to_timestamp(*time), event.clone()))
            .collect();
        Sequence::new(ppqn, events)
    }
}

fn parse_families(list: &str) -> Option<FamilySet> {
    list.split(',')
        .map(str::trim)
        .filter(|name| !name.is_empty())
        .map(|name| Family::ALL.iter().copied().find(|f| f.name() == name))
        .collect()
}

impl Handler for Recorder {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn handled_families(&self) -> FamilySet {
        self.families
    }

    fn properties(&self) -> Properties {
        if self.families == Family::every() {
            return Properties::new();
        }
        let names: Vec<_> = self.families.iter().map(Family::name).collect();
        Properties::new().with("families", names.join(","))
    }

    fn handle_message(&self, message: &Message) -> Outcome {
        let elapsed = self.started.lock().elapsed();
        self.events.lock().push((elapsed, message.event.clone()));
        Outcome::Success
    }

    fn handle_open(&self, state: State) -> Outcome {
        if state.test(StateBit::Receive) {
            *self.started.lock() = Instant::now();
            self.core
                .activate_state(State::fuse([StateBit::Receive, StateBit::Recording]));
        }
        Outcome::Success
    }

    fn handle_close(&self, state: State) -> Outcome {
        if state.test(StateBit::Receive) {
            self.core
                .deactivate_state(State::fuse([StateBit::Receive, StateBit::Recording]));
            tracing::debug!(handler = %self.core.id(), events = self.len(), "recording stopped");
        }
        Outcome::Success
    }
}

impl Default for Recorder {
    fn default() -> Self {
        Self::new(Identity::new(super::HandlerId(0), Self::TYPE))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Channel;
    use crate::handler::HandlerId;

    fn note(n: u8) -> Event {
        Event::note_on(Channel::from_int_lossy(0), n, 100).unwrap()
    }

    #[test]
    fn records_only_while_open() {
        let rec = Recorder::new(Identity::new(HandlerId(1), "rec"));
        assert_eq!(rec.send_message(&Message::new(note(60))), Outcome::Closed);

        rec.handle_open(State::io());
        assert!(rec.state().test(StateBit::Recording));
        assert!(!rec.state().test(StateBit::Forward));
        assert_eq!(rec.send_message(&Message::new(note(61))), Outcome::Success);
        rec.handle_close(StateBit::Receive.into());
        assert_eq!(rec.send_message(&Message::new(note(62))), Outcome::Closed);

        assert_eq!(rec.events(), [note(61)]);
        assert!(rec.state().is_empty());
    }

    #[test]
    fn family_filter_from_properties() {
        let props = Properties::new().with("families", "note-on, controller");
        let rec = Recorder::from_properties(Identity::new(HandlerId(1), "rec"), &props).unwrap();
        rec.handle_open(StateBit::Receive.into());
        let cc = Event::controller(Channel::from_int_lossy(0), 7, 1).unwrap();
        let bend = Event::pitch_bend(Channel::from_int_lossy(0), 0x2000).unwrap();
        assert_eq!(rec.send_message(&Message::new(note(1))), Outcome::Success);
        assert_eq!(rec.send_message(&Message::new(cc.clone())), Outcome::Success);
        assert_eq!(rec.send_message(&Message::new(bend)), Outcome::Unhandled);
        assert_eq!(rec.events(), [note(1), cc]);
        assert_eq!(rec.properties(), props.clone().with("families", "note-on,controller"));

        let bad = Properties::new().with("families", "note-on,bogus");
        assert!(Recorder::from_properties(Identity::new(HandlerId(2), "x"), &bad).is_err());
    }

    #[test]
    fn exports_a_sorted_sequence() {
        let rec = Recorder::default();
        rec.handle_open(StateBit::Receive.into());
        for n in 0..5 {
            rec.send_message(&Message::new(note(n)));
        }
        let seq = rec.to_sequence(480);
        assert_eq!(seq.len(), 5);
        let notes: Vec<_> = seq.iter().map(|(_, e)| e.note().unwrap()).collect();
        assert_eq!(notes, [0, 1, 2, 3, 4]);
        rec.clear();
        assert!(rec.is_empty());
    }
}
