//! Error types for the MIDI engine.

use crate::handler::HandlerId;
use thiserror::Error;

/// A malformed byte stream.
///
/// A corrupt stream cannot be resynchronised safely, so decoders report these instead of skipping
/// ahead; readers are expected to discard whatever partial data they hold.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeError {
    #[error("unexpected end of input")]
    UnexpectedEof,

    #[error("variable-length quantity longer than 4 bytes")]
    VarlenTooLong,

    #[error("unknown status byte {0:#04x}")]
    UnknownStatus(u8),

    #[error("data byte {0:#04x} without status and no running status active")]
    MissingStatus(u8),

    #[error("status byte {0:#04x} found inside message data")]
    UnexpectedStatus(u8),

    #[error("system exclusive block is not terminated by 0xf7")]
    UnterminatedSysEx,

    #[error("system exclusive payload longer than {0} bytes")]
    SysExTooLong(usize),
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    #[error("value {0} does not fit in a 28-bit variable-length quantity")]
    VarlenOverflow(u32),

    #[error("{field} out of range: {value} (max {max})")]
    OutOfRange {
        field: &'static str,
        value: u32,
        max: u32,
    },

    #[error("channel message without any channel")]
    NoChannel,

    #[error("channel message addresses {0} channels; fan it out before encoding")]
    MultipleChannels(usize),

    #[error("{0} events cannot be serialized")]
    NotSerializable(&'static str),

    #[error("unknown handler type: {0}")]
    UnknownHandlerType(String),

    #[error("missing property: {0}")]
    MissingProperty(String),

    #[error("invalid property {key}={value}")]
    InvalidProperty { key: String, value: String },

    #[error("unknown handler: {0}")]
    UnknownHandler(HandlerId),

    #[error("duplicate handler id: {0}")]
    DuplicateHandler(HandlerId),

    #[error("connecting {tail} to {head} would close a cycle")]
    Cycle { tail: HandlerId, head: HandlerId },

    #[error("no patch loaded")]
    NoPatch,

    #[error("MIDI device error: {0}")]
    Device(String),

    #[error("unknown MIDI device: {0}")]
    UnknownDevice(String),

    #[error("failed to spawn worker thread: {0}")]
    Spawn(std::io::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("patch parse error: {0}")]
    PatchParse(#[from] ron::error::SpannedError),

    #[error("patch write error: {0}")]
    PatchWrite(#[from] ron::Error),
}

impl Error {
    pub(crate) fn out_of_range(field: &'static str, value: u32, max: u32) -> Self {
        Error::OutOfRange { field, value, max }
    }
}

#[cfg(feature = "midir")]
impl From<midir::InitError> for Error {
    fn from(e: midir::InitError) -> Self {
        Error::Device(e.to_string())
    }
}

#[cfg(feature = "midir")]
impl From<midir::PortInfoError> for Error {
    fn from(e: midir::PortInfoError) -> Self {
        Error::Device(e.to_string())
    }
}

#[cfg(feature = "midir")]
impl From<midir::ConnectError<midir::MidiInput>> for Error {
    fn from(e: midir::ConnectError<midir::MidiInput>) -> Self {
        Error::Device(e.to_string())
    }
}

#[cfg(feature = "midir")]
impl From<midir::ConnectError<midir::MidiOutput>> for Error {
    fn from(e: midir::ConnectError<midir::MidiOutput>) -> Self {
        Error::Device(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
