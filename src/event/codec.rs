//! Stored and live encodings of [`Event`].
//!
//! The stored encoding is the one used inside track data: sysex and meta blocks are prefixed with
//! a varlen length, and channel-voice messages may use running status. The live encoding is what
//! travels over a MIDI cable: sysex is framed by `F0`/`F7` only, meta events do not exist, and
//! each message addresses exactly one channel.

use super::{Channels, Event, Family, META_MARKER, Payload, SYSEX_END, SYSEX_START};
use crate::codec::{read_varlen_slice, split_checked, take_byte};
use crate::error::{DecodeError, Error, Result};
use crate::flags::Flags;
use smallvec::SmallVec;

type DecodeResult<T> = std::result::Result<T, DecodeError>;

/// One message as written to a device.
pub type WireMessage = SmallVec<[u8; 3]>;

/// Number of data bytes following `status`, for fixed-length messages.
pub(crate) fn message_len(status: u8) -> Option<usize> {
    match status {
        0x80..=0xBF | 0xE0..=0xEF => Some(2),
        0xC0..=0xDF => Some(1),
        0xF1 | 0xF3 => Some(1),
        0xF2 => Some(2),
        0xF6 => Some(0),
        0xF8 | 0xFA..=0xFC | 0xFE => Some(0),
        _ => None,
    }
}

fn check_data(bytes: &[u8]) -> DecodeResult<()> {
    match bytes.iter().find(|&&b| b > 0x7F) {
        Some(&b) => Err(DecodeError::UnexpectedStatus(b)),
        None => Ok(()),
    }
}

fn voice_event(status: u8, data: &[u8]) -> DecodeResult<Event> {
    let family = Family::from_voice_status(status).ok_or(DecodeError::UnknownStatus(status))?;
    check_data(data)?;
    let mut payload = Payload::new();
    payload.push(status & 0xF0);
    payload.extend_from_slice(data);
    let channels = Channels::wrap(super::Channel::from_int_lossy(status));
    Ok(Event::from_parts(family, channels, payload))
}

fn system_event(status: u8, data: &[u8]) -> DecodeResult<Event> {
    check_data(data)?;
    let mut payload = Payload::new();
    payload.push(status);
    payload.extend_from_slice(data);
    Ok(Event::from_parts(Family::System, Flags::empty(), payload))
}

/// Builds a sysex event from a block that must end with `F7`.
fn sysex_event(block: &[u8]) -> DecodeResult<Event> {
    let body = block
        .strip_suffix(&[SYSEX_END])
        .ok_or(DecodeError::UnterminatedSysEx)?;
    check_data(body)?;
    let payload = super::framed(&[SYSEX_START], block).map_err(|_| DecodeError::VarlenTooLong)?;
    Ok(Event::from_parts(Family::SysEx, Flags::empty(), payload))
}

impl Event {
    /// Decodes one event in stored encoding off the front of `raw`.
    ///
    /// `running_status` is shared between consecutive calls over the same stream and should start
    /// as `None`. On failure `raw` may be left in the middle of an event.
    pub fn decode(raw: &mut &[u8], running_status: &mut Option<u8>) -> DecodeResult<Event> {
        let first = *raw.first().ok_or(DecodeError::UnexpectedEof)?;
        let status = if first < 0x80 {
            running_status.ok_or(DecodeError::MissingStatus(first))?
        } else {
            *raw = &raw[1..];
            first
        };
        match status {
            0x80..=0xEF => {
                *running_status = Some(status);
                let len = message_len(status).unwrap_or(0);
                let data = split_checked(raw, len).ok_or(DecodeError::UnexpectedEof)?;
                voice_event(status, data)
            }
            SYSEX_START => {
                *running_status = None;
                let block = read_varlen_slice(raw)?;
                sysex_event(block)
            }
            META_MARKER => {
                *running_status = None;
                let kind = take_byte(raw).ok_or(DecodeError::UnexpectedEof)?;
                if kind > 0x7F {
                    return Err(DecodeError::UnexpectedStatus(kind));
                }
                let block = read_varlen_slice(raw)?;
                let payload = super::framed(&[META_MARKER, kind], block)
                    .map_err(|_| DecodeError::VarlenTooLong)?;
                Ok(Event::from_parts(Family::Meta, Flags::empty(), payload))
            }
            0xF1..=0xFE => {
                let len = message_len(status).ok_or(DecodeError::UnknownStatus(status))?;
                if status < 0xF8 {
                    *running_status = None;
                }
                let data = split_checked(raw, len).ok_or(DecodeError::UnexpectedEof)?;
                system_event(status, data)
            }
            _ => Err(DecodeError::UnknownStatus(status)),
        }
    }

    /// Decodes a single event in stored encoding. Trailing bytes are ignored.
    pub fn from_bytes(mut raw: &[u8]) -> DecodeResult<Event> {
        Self::decode(&mut raw, &mut None)
    }

    /// Appends this event in stored encoding, omitting the status byte when `running_status`
    /// already matches it.
    ///
    /// Channel-voice events must address exactly one channel; fan them out first.
    pub fn encode(&self, running_status: &mut Option<u8>, out: &mut Vec<u8>) -> Result<()> {
        match self.family {
            Family::Reset => return Err(Error::NotSerializable("reset")),
            Family::Custom => return Err(Error::NotSerializable("custom")),
            Family::SysEx | Family::Meta => {
                *running_status = None;
                out.extend_from_slice(&self.data);
            }
            Family::System => {
                if self.data[0] < 0xF8 {
                    *running_status = None;
                }
                out.extend_from_slice(&self.data);
            }
            _ => {
                let channel = match self.channels.len() {
                    0 => return Err(Error::NoChannel),
                    1 => self.channels.first().ok_or(Error::NoChannel)?,
                    n => return Err(Error::MultipleChannels(n)),
                };
                let status = self.data[0] | channel.index();
                if *running_status != Some(status) {
                    out.push(status);
                    *running_status = Some(status);
                }
                out.extend_from_slice(&self.data[1..]);
            }
        }
        Ok(())
    }

    /// Stored encoding of this event alone.
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let mut out = Vec::with_capacity(self.data.len() + 1);
        self.encode(&mut None, &mut out)?;
        Ok(out)
    }

    /// Parses one complete live message, as delivered by a device driver.
    ///
    /// A live `FF` (system reset) becomes [`Event::reset`].
    pub fn parse_live(bytes: &[u8]) -> DecodeResult<Event> {
        let (&status, data) = bytes.split_first().ok_or(DecodeError::UnexpectedEof)?;
        match status {
            0x00..=0x7F => Err(DecodeError::MissingStatus(status)),
            SYSEX_START => {
                let end = data
                    .iter()
                    .position(|&b| b == SYSEX_END)
                    .ok_or(DecodeError::UnterminatedSysEx)?;
                sysex_event(&data[..=end])
            }
            0xFF => Ok(Event::reset()),
            _ => {
                let len = message_len(status).ok_or(DecodeError::UnknownStatus(status))?;
                let data = data.get(..len).ok_or(DecodeError::UnexpectedEof)?;
                if status < 0xF0 {
                    voice_event(status, data)
                } else {
                    system_event(status, data)
                }
            }
        }
    }

    /// Live messages for this event, one per addressed channel.
    ///
    /// Meta and reset events produce nothing; custom events are written verbatim.
    pub fn wire_messages(&self) -> Vec<WireMessage> {
        match self.family {
            Family::Meta | Family::Reset => Vec::new(),
            Family::SysEx => {
                let mut message = WireMessage::new();
                message.push(SYSEX_START);
                if let Some(body) = self.sysex_payload() {
                    message.extend_from_slice(body);
                }
                message.push(SYSEX_END);
                vec![message]
            }
            Family::System | Family::Custom => vec![WireMessage::from_slice(&self.data)],
            _ => self
                .channels
                .iter()
                .map(|channel| {
                    let mut message = WireMessage::from_slice(&self.data);
                    message[0] |= channel.index();
                    message
                })
                .collect(),
        }
    }
}
