mod clock;
mod reader;
mod sequence;

pub use clock::{Clock, DEFAULT_US_PER_QUARTER};
pub use reader::SequenceReader;
pub use sequence::{DEFAULT_PPQN, Sequence, TimedEvent};
