//! The handler contract: anything that produces or consumes events in the routing graph.
//!
//! A handler declares a static [`Mode`] (what it is capable of) and carries a dynamic [`State`]
//! (what it is doing right now). The graph asks handlers to open or close directions; handlers
//! flip their own state bits from inside those callbacks, or later from a background thread when
//! the underlying device confirms out of band.

mod factory;
mod filter;
mod metrics;
mod player;
mod raw;
mod recorder;

#[cfg(feature = "midir")]
mod midir_device;

pub use factory::{
    DeviceFactory, HandlerFactory, Identity, Properties, Registry, SystemInputs, SystemOutputs,
};
pub use filter::ChannelFilter;
pub use metrics::{HandlerMetrics, MetricsSnapshot};
pub use player::Player;
pub use raw::{RawInput, RawOutput};
pub use recorder::Recorder;

#[cfg(feature = "midir")]
pub use midir_device::{MidirInput, MidirOutput};

use crate::event::{Event, FamilySet};
use crate::flags::{AtomicFlags, FlagEnum, Flags};
use crate::tribool::Tribool;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Instant;

/// Identifies a handler inside a graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct HandlerId(pub u32);

impl fmt::Display for HandlerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Capabilities a handler may declare.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ModeBit {
    /// Consumes events.
    In,
    /// Produces events.
    Out,
    /// Passes consumed events on.
    Thru,
}

impl FlagEnum for ModeBit {
    type Bits = u8;

    fn index(self) -> u32 {
        self as u32
    }

    fn from_index(index: u32) -> Option<Self> {
        [ModeBit::In, ModeBit::Out, ModeBit::Thru].get(index as usize).copied()
    }
}

pub type Mode = Flags<ModeBit>;

/// Activity bits. `Forward` and `Receive` are bound to a direction; the rest are free for
/// handlers to use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StateBit {
    /// Sending events downstream.
    Forward,
    /// Accepting events.
    Receive,
    Recording,
    Playing,
}

impl StateBit {
    /// Mode bit required to hold this state, if any.
    pub fn direction(self) -> Option<ModeBit> {
        match self {
            StateBit::Forward => Some(ModeBit::Out),
            StateBit::Receive => Some(ModeBit::In),
            StateBit::Recording | StateBit::Playing => None,
        }
    }
}

impl FlagEnum for StateBit {
    type Bits = u8;

    fn index(self) -> u32 {
        self as u32
    }

    fn from_index(index: u32) -> Option<Self> {
        use StateBit::*;
        [Forward, Receive, Recording, Playing].get(index as usize).copied()
    }
}

pub type State = Flags<StateBit>;

impl Flags<ModeBit> {
    /// State bits a handler with this mode may hold.
    pub fn allowed_states(self) -> State {
        State::full()
            .iter()
            .filter(|bit| bit.direction().is_none_or(|d| self.test(d)))
            .collect()
    }
}

impl Flags<StateBit> {
    /// Both directional bits.
    pub fn io() -> State {
        State::fuse([StateBit::Forward, StateBit::Receive])
    }
}

/// Result of a dispatch. Not an error type: every variant is an ordinary answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Outcome {
    Success,
    /// Attempted and did not succeed, e.g. device I/O failed.
    Fail,
    /// This handler does not process that kind of message.
    Unhandled,
    /// The requested direction is not active.
    Closed,
}

impl Outcome {
    pub fn is_success(self) -> bool {
        self == Outcome::Success
    }

    /// Combines outcomes of a fan-out: any success wins, then failure, then the first answer.
    pub fn merge(self, other: Outcome) -> Outcome {
        use Outcome::*;
        match (self, other) {
            (Success, _) | (_, Success) => Success,
            (Fail, _) | (_, Fail) => Fail,
            (first, _) => first,
        }
    }
}

impl fmt::Display for Outcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Outcome::Success => "success",
            Outcome::Fail => "fail",
            Outcome::Unhandled => "unhandled",
            Outcome::Closed => "closed",
        })
    }
}

/// An event in flight, tagged with the handler that put it into the graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Message {
    pub event: Event,
    pub source: Option<HandlerId>,
}

impl Message {
    pub fn new(event: Event) -> Self {
        Self {
            event,
            source: None,
        }
    }

    pub fn from_source(event: Event, source: HandlerId) -> Self {
        Self {
            event,
            source: Some(source),
        }
    }
}

/// State shared by every handler implementation.
pub struct HandlerCore {
    id: HandlerId,
    name: String,
    group: String,
    mode: Mode,
    state: AtomicFlags<StateBit>,
    metrics: HandlerMetrics,
    targets: RwLock<Vec<Weak<dyn Handler>>>,
}

impl HandlerCore {
    pub fn new(id: HandlerId, name: impl Into<String>, mode: Mode) -> Self {
        Self {
            id,
            name: name.into(),
            group: String::new(),
            mode,
            state: AtomicFlags::default(),
            metrics: HandlerMetrics::new(),
            targets: RwLock::new(Vec::new()),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    #[inline]
    pub fn id(&self) -> HandlerId {
        self.id
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn group(&self) -> &str {
        &self.group
    }

    #[inline]
    pub fn mode(&self) -> Mode {
        self.mode
    }

    #[inline]
    pub fn state(&self) -> State {
        self.state.load()
    }

    #[inline]
    pub fn metrics(&self) -> &HandlerMetrics {
        &self.metrics
    }

    fn clamp(&self, mask: State, verb: &str) -> State {
        let allowed = mask & self.mode.allowed_states();
        if allowed != mask {
            tracing::warn!(
                handler = %self.id,
                name = %self.name,
                requested = ?mask,
                mode = ?self.mode,
                "cannot {verb} state outside of mode"
            );
        }
        allowed
    }

    /// Sets `mask`, restricted to what the mode allows. Returns the previous state.
    pub fn activate_state(&self, mask: impl Into<State>) -> State {
        let mask = self.clamp(mask.into(), "activate");
        let previous = self.state.fetch_or(mask);
        tracing::trace!(handler = %self.id, ?mask, "state activated");
        previous
    }

    /// Clears `mask`. Returns the previous state.
    pub fn deactivate_state(&self, mask: impl Into<State>) -> State {
        let mask = mask.into();
        let previous = self.state.fetch_and_not(mask);
        tracing::trace!(handler = %self.id, ?mask, "state deactivated");
        previous
    }

    /// Adds a downstream handler. Returns `false` if already connected.
    pub fn connect(&self, target: &Arc<dyn Handler>) -> bool {
        let mut targets = self.targets.write();
        let id = target.id();
        targets.retain(|t| t.strong_count() > 0);
        if targets.iter().any(|t| t.upgrade().is_some_and(|t| t.id() == id)) {
            return false;
        }
        targets.push(Arc::downgrade(target));
        true
    }

    /// Removes a downstream handler. Returns `false` if it was not connected.
    pub fn disconnect(&self, id: HandlerId) -> bool {
        let mut targets = self.targets.write();
        let before = targets.len();
        targets.retain(|t| t.upgrade().is_some_and(|t| t.id() != id));
        targets.len() != before
    }

    pub fn disconnect_all(&self) {
        self.targets.write().clear();
    }

    /// Ids of the connected downstream handlers still alive.
    pub fn targets(&self) -> Vec<HandlerId> {
        self.targets
            .read()
            .iter()
            .filter_map(|t| t.upgrade().map(|t| t.id()))
            .collect()
    }

    /// Delivers `message` to every downstream handler except the one it came from.
    ///
    /// Returns `Closed` while the forward state is off and `Unhandled` when nothing downstream
    /// took the message.
    pub fn forward(&self, message: &Message) -> Outcome {
        if !self.state().test(StateBit::Forward) {
            return Outcome::Closed;
        }
        let targets: Vec<_> = self.targets.read().iter().filter_map(Weak::upgrade).collect();
        targets
            .iter()
            .filter(|t| Some(t.id()) != message.source)
            .map(|t| t.send_message(message))
            .fold(Outcome::Unhandled, Outcome::merge)
    }

    /// Forwards a new event originating from this handler.
    pub fn produce(&self, event: Event) -> Outcome {
        self.forward(&Message::from_source(event, self.id))
    }
}

impl fmt::Debug for HandlerCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HandlerCore")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("group", &self.group)
            .field("mode", &self.mode)
            .field("state", &self.state())
            .field("targets", &self.targets())
            .finish()
    }
}

/// A producer and/or consumer of events.
///
/// Implementations use interior mutability: handlers are shared between the graph and their own
/// worker threads.
pub trait Handler: Send + Sync {
    fn core(&self) -> &HandlerCore;

    /// Registered type name, used to rebuild the handler from a patch.
    fn type_name(&self) -> &'static str;

    /// Families this handler can process.
    fn handled_families(&self) -> FamilySet;

    fn handle_message(&self, message: &Message) -> Outcome;

    /// Opens the directions in `state`. Called once per transition.
    fn handle_open(&self, state: State) -> Outcome;

    /// Closes the directions in `state`. Called once per transition.
    fn handle_close(&self, state: State) -> Outcome;

    /// Construction properties, as stored in a patch.
    fn properties(&self) -> Properties {
        Properties::new()
    }

    fn id(&self) -> HandlerId {
        self.core().id()
    }

    fn name(&self) -> &str {
        self.core().name()
    }

    fn mode(&self) -> Mode {
        self.core().mode()
    }

    fn state(&self) -> State {
        self.core().state()
    }

    /// Dispatches `message` to [`handle_message`](Handler::handle_message) if the handler is
    /// receiving and handles its family, recording latency and size either way.
    fn send_message(&self, message: &Message) -> Outcome {
        let start = Instant::now();
        let core = self.core();
        let outcome = if !core.state().test(StateBit::Receive) {
            Outcome::Closed
        } else if !message.event.is(self.handled_families()) {
            Outcome::Unhandled
        } else {
            self.handle_message(message)
        };
        core.metrics()
            .record(outcome, message.event.data().len(), start.elapsed());
        if outcome == Outcome::Fail {
            tracing::warn!(handler = %core.id(), event = %message.event, "message failed");
        }
        outcome
    }

    /// Whether this handler would take `event`: unknown when it could but is not receiving.
    fn accepts(&self, event: &Event) -> Tribool {
        if !self.mode().test(ModeBit::In) || !event.is(self.handled_families()) {
            Tribool::No
        } else if self.state().test(StateBit::Receive) {
            Tribool::Yes
        } else {
            Tribool::Unknown
        }
    }
}

impl fmt::Debug for dyn Handler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct(self.type_name())
            .field("core", self.core())
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::event::{Channel, Family};
    use parking_lot::Mutex;

    /// Minimal thru handler recording what it receives.
    pub(crate) struct Tap {
        core: HandlerCore,
        pub(crate) seen: Mutex<Vec<Message>>,
        families: FamilySet,
    }

    impl Tap {
        pub(crate) fn new(id: u32, mode: Mode) -> Arc<Tap> {
            Arc::new(Tap {
                core: HandlerCore::new(HandlerId(id), format!("tap {id}"), mode),
                seen: Mutex::new(Vec::new()),
                families: Family::every(),
            })
        }
    }

    impl Handler for Tap {
        fn core(&self) -> &HandlerCore {
            &self.core
        }

        fn type_name(&self) -> &'static str {
            "tap"
        }

        fn handled_families(&self) -> FamilySet {
            self.families
        }

        fn handle_message(&self, message: &Message) -> Outcome {
            self.seen.lock().push(message.clone());
            if self.mode().test(ModeBit::Thru) {
                self.core.forward(message);
            }
            Outcome::Success
        }

        fn handle_open(&self, state: State) -> Outcome {
            self.core.activate_state(state);
            Outcome::Success
        }

        fn handle_close(&self, state: State) -> Outcome {
            self.core.deactivate_state(state);
            Outcome::Success
        }
    }

    fn note() -> Event {
        Event::note_on(Channel::from_int_lossy(0), 60, 100).unwrap()
    }

    fn thru() -> Mode {
        Mode::fuse([ModeBit::In, ModeBit::Out, ModeBit::Thru])
    }

    #[test]
    fn state_never_exceeds_mode() {
        let input_only = Tap::new(1, ModeBit::In.into());
        input_only.core.activate_state(State::io());
        assert_eq!(input_only.state(), StateBit::Receive.into());

        let output_only = Tap::new(2, ModeBit::Out.into());
        output_only.core.activate_state(State::io() | StateBit::Playing);
        assert!(output_only.state().test(StateBit::Forward));
        assert!(output_only.state().test(StateBit::Playing));
        assert!(!output_only.state().test(StateBit::Receive));

        for tap in [&input_only, &output_only] {
            for bit in tap.state() {
                if let Some(direction) = bit.direction() {
                    assert!(tap.mode().test(direction));
                }
            }
        }
    }

    #[test]
    fn activate_returns_previous_state() {
        let tap = Tap::new(1, thru());
        assert!(tap.core.activate_state(StateBit::Receive).is_empty());
        let previous = tap.core.deactivate_state(StateBit::Receive);
        assert_eq!(previous, StateBit::Receive.into());
        assert!(tap.state().is_empty());
    }

    #[test]
    fn closed_and_unhandled() {
        let tap = Tap::new(1, ModeBit::In.into());
        let message = Message::new(note());
        assert_eq!(tap.send_message(&message), Outcome::Closed);
        assert_eq!(tap.accepts(&message.event), Tribool::Unknown);

        tap.core.activate_state(StateBit::Receive);
        assert_eq!(tap.send_message(&message), Outcome::Success);
        assert_eq!(tap.accepts(&message.event), Tribool::Yes);

        let narrow = Arc::new(Tap {
            core: HandlerCore::new(HandlerId(9), "narrow", ModeBit::In.into()),
            seen: Mutex::new(Vec::new()),
            families: Family::Controller.into(),
        });
        narrow.core.activate_state(StateBit::Receive);
        assert_eq!(narrow.send_message(&message), Outcome::Unhandled);
        assert_eq!(narrow.accepts(&message.event), Tribool::No);

        let snap = tap.core.metrics().snapshot();
        assert_eq!((snap.messages, snap.closed, snap.succeeded), (2, 1, 1));
        assert_eq!(snap.bytes, 6);
    }

    #[test]
    fn forward_skips_source_and_requires_forward_state() {
        let a = Tap::new(1, thru());
        let b = Tap::new(2, thru());
        let c = Tap::new(3, thru());
        let b_dyn: Arc<dyn Handler> = b.clone();
        let c_dyn: Arc<dyn Handler> = c.clone();
        let a_dyn: Arc<dyn Handler> = a.clone();
        assert!(a.core.connect(&b_dyn));
        assert!(!a.core.connect(&b_dyn));
        a.core.connect(&c_dyn);
        b.core.connect(&a_dyn);

        assert_eq!(a.core.produce(note()), Outcome::Closed);
        for p in [&a, &b, &c] {
            p.core.activate_state(State::io());
        }
        assert_eq!(a.core.produce(note()), Outcome::Success);

        // b forwards back towards a, which is the source and gets skipped.
        assert_eq!(b.seen.lock().len(), 1);
        assert_eq!(c.seen.lock().len(), 1);
        assert!(a.seen.lock().is_empty());
        assert_eq!(b.seen.lock()[0].source, Some(HandlerId(1)));

        assert!(a.core.disconnect(HandlerId(3)));
        assert_eq!(a.core.targets(), [HandlerId(2)]);
    }

    #[test]
    fn dropped_targets_are_skipped() {
        let a = Tap::new(1, thru());
        a.core.activate_state(State::io());
        {
            let gone: Arc<dyn Handler> = Tap::new(2, thru());
            a.core.connect(&gone);
        }
        assert!(a.core.targets().is_empty());
        assert_eq!(a.core.produce(note()), Outcome::Unhandled);
    }

    #[test]
    fn outcome_merge() {
        use Outcome::*;
        assert_eq!(Closed.merge(Success), Success);
        assert_eq!(Unhandled.merge(Fail), Fail);
        assert_eq!(Closed.merge(Unhandled), Closed);
    }

    #[test]
    fn allowed_states_follow_mode() {
        let mode = Mode::from(ModeBit::Out);
        assert!(mode.allowed_states().test(StateBit::Forward));
        assert!(!mode.allowed_states().test(StateBit::Receive));
        assert!(mode.allowed_states().test(StateBit::Recording));
    }
}
