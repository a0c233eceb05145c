//! The MIDI event value type.
//!
//! An [`Event`] is immutable: a [`Family`], the set of [`Channels`] it addresses and the payload
//! bytes in their stored encoding. Channel-voice payloads keep the channel nibble of the status
//! byte at zero; the channel is spliced in only when the event is written for a given channel.

mod codec;
mod stream;

pub use codec::WireMessage;
pub use stream::StreamDecoder;

use crate::codec::{decode_variable, split_checked, write_varlen_slice};
use crate::error::{Error, Result};
use crate::flags::{FlagEnum, Flags};
use smallvec::SmallVec;
use std::fmt;

/// Payload bytes. Short messages are stored inline.
pub type Payload = SmallVec<[u8; 8]>;

pub type FamilySet = Flags<Family>;
pub type Channels = Flags<Channel>;

pub const META_END_OF_TRACK: u8 = 0x2F;
pub const META_TEMPO: u8 = 0x51;

const SYSEX_START: u8 = 0xF0;
const SYSEX_END: u8 = 0xF7;
const META_MARKER: u8 = 0xFF;

/// The kind of an event.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub enum Family {
    NoteOff,
    NoteOn,
    /// Polyphonic key pressure.
    Aftertouch,
    Controller,
    ProgramChange,
    ChannelPressure,
    PitchBend,
    SysEx,
    /// System common and system realtime messages.
    System,
    Meta,
    /// Engine-internal "reset all state" marker. Never written to a device.
    Reset,
    Custom,
}

impl Family {
    pub const ALL: [Family; 12] = [
        Family::NoteOff,
        Family::NoteOn,
        Family::Aftertouch,
        Family::Controller,
        Family::ProgramChange,
        Family::ChannelPressure,
        Family::PitchBend,
        Family::SysEx,
        Family::System,
        Family::Meta,
        Family::Reset,
        Family::Custom,
    ];

    /// Family of a channel-voice status byte.
    pub fn from_voice_status(status: u8) -> Option<Family> {
        Some(match status >> 4 {
            0x8 => Family::NoteOff,
            0x9 => Family::NoteOn,
            0xA => Family::Aftertouch,
            0xB => Family::Controller,
            0xC => Family::ProgramChange,
            0xD => Family::ChannelPressure,
            0xE => Family::PitchBend,
            _ => return None,
        })
    }

    /// Every channel-voice family.
    pub fn voice() -> FamilySet {
        FamilySet::fuse([
            Family::NoteOff,
            Family::NoteOn,
            Family::Aftertouch,
            Family::Controller,
            Family::ProgramChange,
            Family::ChannelPressure,
            Family::PitchBend,
        ])
    }

    /// Note on and note off.
    pub fn notes() -> FamilySet {
        FamilySet::fuse([Family::NoteOff, Family::NoteOn])
    }

    /// Every family.
    pub fn every() -> FamilySet {
        FamilySet::fuse(Family::ALL)
    }

    #[inline]
    pub fn is_voice(self) -> bool {
        Family::voice().test(self)
    }

    pub fn name(self) -> &'static str {
        match self {
            Family::NoteOff => "note-off",
            Family::NoteOn => "note-on",
            Family::Aftertouch => "aftertouch",
            Family::Controller => "controller",
            Family::ProgramChange => "program-change",
            Family::ChannelPressure => "channel-pressure",
            Family::PitchBend => "pitch-bend",
            Family::SysEx => "sysex",
            Family::System => "system",
            Family::Meta => "meta",
            Family::Reset => "reset",
            Family::Custom => "custom",
        }
    }
}

impl FlagEnum for Family {
    type Bits = u16;

    fn index(self) -> u32 {
        self as u32
    }

    fn from_index(index: u32) -> Option<Self> {
        Family::ALL.get(index as usize).copied()
    }
}

impl fmt::Display for Family {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// A MIDI channel, `0..=15`.
#[derive(Copy, Clone, PartialEq, Eq, Debug, Hash, PartialOrd, Ord)]
pub struct Channel(u8);

impl Channel {
    pub const COUNT: u8 = 16;

    pub fn new(index: u8) -> Result<Channel> {
        if index < Self::COUNT {
            Ok(Channel(index))
        } else {
            Err(Error::out_of_range("channel", index.into(), 15))
        }
    }

    /// Keeps the low nibble.
    #[inline]
    pub const fn from_int_lossy(index: u8) -> Channel {
        Channel(index & 0x0F)
    }

    #[inline]
    pub fn index(self) -> u8 {
        self.0
    }

    /// All sixteen channels.
    pub fn every() -> Channels {
        Channels::from_integral(u16::MAX)
    }
}

impl FlagEnum for Channel {
    type Bits = u16;

    fn index(self) -> u32 {
        self.0.into()
    }

    fn from_index(index: u32) -> Option<Self> {
        u8::try_from(index).ok().and_then(|i| Channel::new(i).ok())
    }
}

impl fmt::Display for Channel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.0, f)
    }
}

/// An immutable MIDI event.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Event {
    family: Family,
    channels: Channels,
    data: Payload,
}

fn check(field: &'static str, value: u32, max: u32) -> Result<u8> {
    if value > max {
        Err(Error::out_of_range(field, value, max))
    } else {
        Ok(value as u8)
    }
}

fn check_data(field: &'static str, bytes: &[u8]) -> Result<()> {
    match bytes.iter().find(|&&b| b > 0x7F) {
        Some(&b) => Err(Error::out_of_range(field, b.into(), 0x7F)),
        None => Ok(()),
    }
}

/// `prefix`, then `block` preceded by its varlen length.
fn framed(prefix: &[u8], block: &[u8]) -> Result<Payload> {
    let mut data = Payload::from_slice(prefix);
    write_varlen_slice(block, &mut data)?;
    Ok(data)
}

impl Event {
    fn voice(family: Family, channels: Channels, status: u8, bytes: &[u8]) -> Result<Event> {
        if channels.is_empty() {
            return Err(Error::NoChannel);
        }
        let mut data = Payload::new();
        data.push(status);
        data.extend_from_slice(bytes);
        Ok(Event {
            family,
            channels,
            data,
        })
    }

    pub(crate) fn from_parts(family: Family, channels: Channels, data: Payload) -> Event {
        Event {
            family,
            channels,
            data,
        }
    }

    pub fn note_off(channels: impl Into<Channels>, note: u8, velocity: u8) -> Result<Event> {
        let note = check("note", note.into(), 127)?;
        let velocity = check("velocity", velocity.into(), 127)?;
        Self::voice(Family::NoteOff, channels.into(), 0x80, &[note, velocity])
    }

    pub fn note_on(channels: impl Into<Channels>, note: u8, velocity: u8) -> Result<Event> {
        let note = check("note", note.into(), 127)?;
        let velocity = check("velocity", velocity.into(), 127)?;
        Self::voice(Family::NoteOn, channels.into(), 0x90, &[note, velocity])
    }

    pub fn aftertouch(channels: impl Into<Channels>, note: u8, pressure: u8) -> Result<Event> {
        let note = check("note", note.into(), 127)?;
        let pressure = check("pressure", pressure.into(), 127)?;
        Self::voice(Family::Aftertouch, channels.into(), 0xA0, &[note, pressure])
    }

    pub fn controller(channels: impl Into<Channels>, controller: u8, value: u8) -> Result<Event> {
        let controller = check("controller", controller.into(), 127)?;
        let value = check("controller value", value.into(), 127)?;
        Self::voice(Family::Controller, channels.into(), 0xB0, &[controller, value])
    }

    pub fn program_change(channels: impl Into<Channels>, program: u8) -> Result<Event> {
        let program = check("program", program.into(), 127)?;
        Self::voice(Family::ProgramChange, channels.into(), 0xC0, &[program])
    }

    pub fn channel_pressure(channels: impl Into<Channels>, pressure: u8) -> Result<Event> {
        let pressure = check("pressure", pressure.into(), 127)?;
        Self::voice(Family::ChannelPressure, channels.into(), 0xD0, &[pressure])
    }

    /// `value` is 14 bits; 8192 is the center.
    pub fn pitch_bend(channels: impl Into<Channels>, value: u16) -> Result<Event> {
        if value > 0x3FFF {
            return Err(Error::out_of_range("pitch bend", value.into(), 0x3FFF));
        }
        let lsb = (value & 0x7F) as u8;
        let msb = (value >> 7) as u8;
        Self::voice(Family::PitchBend, channels.into(), 0xE0, &[lsb, msb])
    }

    /// System exclusive message carrying `data`, without the `F0`/`F7` framing.
    pub fn sysex(data: &[u8]) -> Result<Event> {
        check_data("sysex data", data)?;
        let mut block = Vec::with_capacity(data.len() + 1);
        block.extend_from_slice(data);
        block.push(SYSEX_END);
        Ok(Event {
            family: Family::SysEx,
            channels: Channels::empty(),
            data: framed(&[SYSEX_START], &block)?,
        })
    }

    /// Meta event of type `kind`.
    pub fn meta(kind: u8, data: &[u8]) -> Result<Event> {
        let kind = check("meta type", kind.into(), 0x7F)?;
        Ok(Event {
            family: Family::Meta,
            channels: Channels::empty(),
            data: framed(&[META_MARKER, kind], data)?,
        })
    }

    /// Tempo change, in microseconds per quarter note.
    pub fn tempo(us_per_quarter: u32) -> Result<Event> {
        if us_per_quarter == 0 || us_per_quarter > 0xFF_FFFF {
            return Err(Error::out_of_range("tempo", us_per_quarter, 0xFF_FFFF));
        }
        let [_, a, b, c] = us_per_quarter.to_be_bytes();
        Self::meta(META_TEMPO, &[a, b, c])
    }

    pub fn end_of_track() -> Event {
        Event {
            family: Family::Meta,
            channels: Channels::empty(),
            data: Payload::from_slice(&[META_MARKER, META_END_OF_TRACK, 0]),
        }
    }

    /// System common (`F1..=F6`) or realtime (`F8..=FE`) message.
    pub fn system(status: u8, data: &[u8]) -> Result<Event> {
        let expected = match (status, codec::message_len(status)) {
            (0xF1..=0xF6 | 0xF8..=0xFE, Some(len)) => len,
            _ => return Err(Error::out_of_range("system status", status.into(), 0xFE)),
        };
        if data.len() != expected {
            return Err(Error::out_of_range(
                "system data length",
                data.len() as u32,
                expected as u32,
            ));
        }
        check_data("system data", data)?;
        let mut payload = Payload::new();
        payload.push(status);
        payload.extend_from_slice(data);
        Ok(Event {
            family: Family::System,
            channels: Channels::empty(),
            data: payload,
        })
    }

    /// The engine-internal "reset all state" event.
    pub fn reset() -> Event {
        Event {
            family: Family::Reset,
            channels: Channels::empty(),
            data: Payload::new(),
        }
    }

    /// Opaque bytes, written to devices as-is.
    pub fn custom(data: &[u8]) -> Event {
        Event {
            family: Family::Custom,
            channels: Channels::empty(),
            data: Payload::from_slice(data),
        }
    }

    #[inline]
    pub fn family(&self) -> Family {
        self.family
    }

    #[inline]
    pub fn channels(&self) -> Channels {
        self.channels
    }

    /// True if the event's family is in `families`.
    #[inline]
    pub fn is(&self, families: impl Into<FamilySet>) -> bool {
        families.into().test(self.family)
    }

    /// Payload in its stored encoding.
    #[inline]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// The same event addressed to other channels. Only channel-voice events carry channels.
    pub fn with_channels(&self, channels: impl Into<Channels>) -> Result<Event> {
        if !self.family.is_voice() {
            return Ok(self.clone());
        }
        let channels = channels.into();
        if channels.is_empty() {
            return Err(Error::NoChannel);
        }
        Ok(Event {
            channels,
            ..self.clone()
        })
    }

    /// Note events shifted by `semitones`, or `None` when the result leaves `0..=127`.
    /// Other events are returned unchanged.
    pub fn transpose(&self, semitones: i8) -> Option<Event> {
        if !self.is(Family::keyed()) {
            return Some(self.clone());
        }
        let note = i16::from(self.data[1]) + i16::from(semitones);
        let note = u8::try_from(note).ok().filter(|&n| n <= 127)?;
        let mut data = self.data.clone();
        data[1] = note;
        Some(Event { data, ..self.clone() })
    }

    fn data_byte(&self, index: usize, families: FamilySet) -> Option<u8> {
        if self.is(families) {
            self.data.get(index).copied()
        } else {
            None
        }
    }

    pub fn note(&self) -> Option<u8> {
        self.data_byte(1, Family::keyed())
    }

    pub fn velocity(&self) -> Option<u8> {
        self.data_byte(2, Family::notes())
    }

    pub fn controller_number(&self) -> Option<u8> {
        self.data_byte(1, Family::Controller.into())
    }

    pub fn controller_value(&self) -> Option<u8> {
        self.data_byte(2, Family::Controller.into())
    }

    pub fn program(&self) -> Option<u8> {
        self.data_byte(1, Family::ProgramChange.into())
    }

    /// Key pressure for aftertouch, channel pressure otherwise.
    pub fn pressure(&self) -> Option<u8> {
        match self.family {
            Family::Aftertouch => self.data.get(2).copied(),
            Family::ChannelPressure => self.data.get(1).copied(),
            _ => None,
        }
    }

    pub fn pitch_bend_value(&self) -> Option<u16> {
        let lsb = self.data_byte(1, Family::PitchBend.into())?;
        let msb = self.data_byte(2, Family::PitchBend.into())?;
        Some(u16::from(msb) << 7 | u16::from(lsb))
    }

    pub fn meta_type(&self) -> Option<u8> {
        self.data_byte(1, Family::Meta.into())
    }

    /// Meta payload, without marker, type and length.
    pub fn meta_payload(&self) -> Option<&[u8]> {
        if self.family != Family::Meta {
            return None;
        }
        let mut raw = self.data.get(2..)?;
        let len = decode_variable(&mut raw).ok()?;
        split_checked(&mut raw, len as usize)
    }

    /// SysEx payload, without `F0`, length and the trailing `F7`.
    pub fn sysex_payload(&self) -> Option<&[u8]> {
        if self.family != Family::SysEx {
            return None;
        }
        let mut raw = self.data.get(1..)?;
        let len = decode_variable(&mut raw).ok()?;
        let block = split_checked(&mut raw, len as usize)?;
        block.strip_suffix(&[SYSEX_END])
    }

    /// Microseconds per quarter note, for tempo meta events.
    pub fn tempo_value(&self) -> Option<u32> {
        if self.meta_type() != Some(META_TEMPO) {
            return None;
        }
        match self.meta_payload()? {
            &[a, b, c] => Some(u32::from_be_bytes([0, a, b, c])),
            _ => None,
        }
    }

    pub fn is_end_of_track(&self) -> bool {
        self.meta_type() == Some(META_END_OF_TRACK)
    }
}

impl Family {
    fn keyed() -> FamilySet {
        Family::notes() | Family::Aftertouch
    }
}

impl fmt::Debug for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Event")
            .field("family", &self.family)
            .field("channels", &self.channels)
            .field("data", &format_args!("{:02X?}", &self.data[..]))
            .finish()
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.family)?;
        if !self.channels.is_empty() {
            let channels: Vec<String> = self.channels.iter().map(|c| c.to_string()).collect();
            write!(f, " ch[{}]", channels.join(","))?;
        }
        let data = match self.family {
            Family::SysEx => self.sysex_payload().unwrap_or_default(),
            Family::Meta => self.meta_payload().unwrap_or_default(),
            Family::Reset => &[][..],
            Family::Custom => &self.data[..],
            _ => self.data.get(1..).unwrap_or_default(),
        };
        for byte in data {
            write!(f, " {:02X}", byte)?;
        }
        Ok(())
    }
}
