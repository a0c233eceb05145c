//! Real-time MIDI message engine.
//!
//! Events are decoded from live byte streams or track data, routed through a graph of handlers
//! and written back out. Device I/O and slow consumers run on bounded worker tasks so producers
//! never wait on them.

pub mod codec;
pub mod engine;
pub mod error;
pub mod event;
pub mod flags;
pub mod graph;
pub mod handler;
pub mod logging;
pub mod patch;
pub mod task;
pub mod timing;
pub mod tribool;

pub use engine::{EngineCommand, EngineHandle, EngineUpdate, spawn_engine};
pub use error::{DecodeError, Error, Result};
pub use event::{Channel, Channels, Event, Family, FamilySet};
pub use graph::Graph;
pub use handler::{Handler, HandlerId, Message, Mode, ModeBit, Outcome, Registry, State, StateBit};
pub use logging::Logger;
pub use patch::Patch;
pub use task::{Priority, Task};
pub use timing::{Clock, Sequence, SequenceReader};
pub use tribool::Tribool;

/// Name this crate registers with the platform MIDI service.
pub const CLIENT_NAME: &str = "midilab";
