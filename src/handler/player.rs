use super::{Handler, HandlerCore, Identity, Message, ModeBit, Outcome, Properties, State, StateBit};
use crate::error::Result;
use crate::event::{Family, FamilySet};
use crate::task::Priority;
use crate::timing::{DEFAULT_PPQN, Sequence, SequenceReader};
use arc_swap::ArcSwap;
use crossbeam::channel::{self, RecvTimeoutError, Sender, TryRecvError};
use parking_lot::Mutex;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};
use std::time::Instant;

struct Inner {
    core: HandlerCore,
    sequence: ArcSwap<Sequence>,
    looping: AtomicBool,
}

struct Worker {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Plays a [`Sequence`] in real time on its own thread.
///
/// Opening the forward direction starts playback from the beginning; closing it stops playback.
/// The sequence can be replaced at any time and is picked up at the next start or loop.
pub struct Player {
    inner: Arc<Inner>,
    track: Option<PathBuf>,
    priority: Priority,
    worker: Mutex<Option<Worker>>,
}

impl Player {
    pub const TYPE: &'static str = "player";

    pub fn new(identity: Identity, sequence: Arc<Sequence>) -> Self {
        Self {
            inner: Arc::new(Inner {
                core: identity.core(ModeBit::Out.into()),
                sequence: ArcSwap::new(sequence),
                looping: AtomicBool::new(false),
            }),
            track: None,
            priority: Priority::Normal,
            worker: Mutex::new(None),
        }
    }

    /// Priority of the playback thread.
    pub fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    /// Reads `track` (a track body file, optional), `ppqn`, `loop` and `priority`.
    pub fn from_properties(identity: Identity, props: &Properties) -> Result<Self> {
        let ppqn = props.parse_or("ppqn", DEFAULT_PPQN)?;
        let track = props.get("track").map(PathBuf::from);
        let sequence = match &track {
            Some(path) => Sequence::read_track(ppqn, &std::fs::read(path)?)?,
            None => Sequence::empty(ppqn),
        };
        let mut player = Self::new(identity, Arc::new(sequence))
            .with_priority(props.parse_or("priority", Priority::Normal)?);
        player.track = track;
        player.set_looping(props.flag("loop")?);
        Ok(player)
    }

    pub fn sequence(&self) -> Arc<Sequence> {
        self.inner.sequence.load_full()
    }

    pub fn set_sequence(&self, sequence: Arc<Sequence>) {
        self.inner.sequence.store(sequence);
    }

    pub fn set_looping(&self, looping: bool) {
        self.inner.looping.store(looping, Ordering::Relaxed);
    }

    pub fn is_looping(&self) -> bool {
        self.inner.looping.load(Ordering::Relaxed)
    }

    pub fn is_playing(&self) -> bool {
        self.inner.core.state().test(StateBit::Playing)
    }

    fn stop_worker(&self) {
        let Some(worker) = self.worker.lock().take() else {
            return;
        };
        drop(worker.stop);
        if worker.handle.thread().id() != thread::current().id()
            && worker.handle.join().is_err()
        {
            tracing::error!(handler = %self.inner.core.id(), "player thread panicked");
        }
    }
}

fn playing() -> State {
    State::fuse([StateBit::Forward, StateBit::Playing])
}

impl Inner {
    /// Returns `true` when asked to stop.
    fn play_once(&self, sequence: &Arc<Sequence>, stop: &channel::Receiver<()>) -> bool {
        let clock = sequence.clock();
        let mut reader = SequenceReader::new(Arc::clone(sequence));
        let start = Instant::now();
        while let Some((timestamp, event)) = reader.step() {
            let due = start + clock.timestamp_to_time(*timestamp);
            let wait = due.saturating_duration_since(Instant::now());
            let stopped = if wait.is_zero() {
                !matches!(stop.try_recv(), Err(TryRecvError::Empty))
            } else {
                !matches!(stop.recv_timeout(wait), Err(RecvTimeoutError::Timeout))
            };
            if stopped {
                return true;
            }
            if !event.is(Family::Meta) {
                self.core.produce(event.clone());
            }
        }
        false
    }

    fn run(&self, stop: channel::Receiver<()>) {
        loop {
            let sequence = self.sequence.load_full();
            if self.play_once(&sequence, &stop) {
                break;
            }
            if !self.looping.load(Ordering::Relaxed) {
                break;
            }
            if sequence.duration().is_zero() {
                tracing::warn!(
                    handler = %self.core.id(),
                    "not looping a sequence without duration"
                );
                break;
            }
        }
        self.core.deactivate_state(playing());
        tracing::debug!(handler = %self.core.id(), "playback finished");
    }
}

impl Handler for Player {
    fn core(&self) -> &HandlerCore {
        &self.inner.core
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn handled_families(&self) -> FamilySet {
        FamilySet::empty()
    }

    fn properties(&self) -> Properties {
        let mut props = Properties::new();
        if let Some(track) = &self.track {
            props.set("track", track.display());
        }
        let ppqn = self.inner.sequence.load().ppqn();
        if ppqn != DEFAULT_PPQN {
            props.set("ppqn", ppqn);
        }
        if self.is_looping() {
            props.set("loop", true);
        }
        if self.priority != Priority::Normal {
            props.set("priority", self.priority);
        }
        props
    }

    fn handle_message(&self, _message: &Message) -> Outcome {
        Outcome::Unhandled
    }

    fn handle_open(&self, state: State) -> Outcome {
        if !state.test(StateBit::Forward) {
            return Outcome::Success;
        }
        self.stop_worker();
        self.inner.core.activate_state(playing());

        let (stop, stop_rx) = channel::bounded(1);
        let inner = Arc::clone(&self.inner);
        let priority = self.priority;
        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let spawned = thread::Builder::new()
            .name(format!("player-{}", self.inner.core.id().0))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || {
                    if !priority.apply_current() {
                        tracing::warn!(?priority, "playing at default priority");
                    }
                    inner.run(stop_rx);
                })
            });
        match spawned {
            Ok(handle) => {
                *self.worker.lock() = Some(Worker { stop, handle });
                Outcome::Success
            }
            Err(e) => {
                tracing::error!(
                    handler = %self.inner.core.id(),
                    error = %e,
                    "cannot start playback"
                );
                self.inner.core.deactivate_state(playing());
                Outcome::Fail
            }
        }
    }

    fn handle_close(&self, state: State) -> Outcome {
        if state.test(StateBit::Forward) {
            self.stop_worker();
            self.inner.core.deactivate_state(playing());
        }
        Outcome::Success
    }
}

impl Drop for Player {
    fn drop(&mut self) {
        self.stop_worker();
    }
}
