use super::Event;
use super::codec::message_len;
use crate::codec::VARLEN_MAX;
use crate::error::DecodeError;

type Decoded = Result<Event, DecodeError>;

/// Incremental decoder for live MIDI byte streams.
///
/// Bytes may arrive in arbitrary chunks. Running status is honoured, realtime bytes may appear
/// anywhere (including inside sysex), and sysex is accumulated until its `F7`. Whenever the stream
/// turns out to be malformed, the partial message is discarded and an error is reported; decoding
/// resumes at the next status byte.
///
/// A sysex payload longer than [`sysex_limit`](Self::sysex_limit) is dropped with
/// [`DecodeError::SysExTooLong`]; the rest of it is skipped up to the next status byte.
#[derive(Debug)]
pub struct StreamDecoder {
    buffer: Vec<u8>,
    running_status: Option<u8>,
    in_sysex: bool,
    skipping_sysex: bool,
    sysex_limit: usize,
}

impl Default for StreamDecoder {
    fn default() -> Self {
        Self {
            buffer: Vec::new(),
            running_status: None,
            in_sysex: false,
            skipping_sysex: false,
            sysex_limit: VARLEN_MAX as usize,
        }
    }
}

impl StreamDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Caps sysex payloads at `limit` bytes. Defaults to the largest block a track can store.
    pub fn with_sysex_limit(mut self, limit: usize) -> Self {
        self.sysex_limit = limit;
        self
    }

    #[inline]
    pub fn sysex_limit(&self) -> usize {
        self.sysex_limit
    }

    /// Feeds `bytes`, reporting every completed message or error to `emit` in stream order.
    pub fn feed<F>(&mut self, bytes: &[u8], mut emit: F)
    where
        F: FnMut(Decoded),
    {
        for &byte in bytes {
            self.step(byte, &mut emit);
        }
    }

    /// Feeds `bytes` and collects the results.
    pub fn decode_all(&mut self, bytes: &[u8]) -> Vec<Decoded> {
        let mut out = Vec::new();
        self.feed(bytes, |result| out.push(result));
        out
    }

    /// Drops any partial message and the running status.
    pub fn reset(&mut self) {
        self.buffer.clear();
        self.running_status = None;
        self.in_sysex = false;
        self.skipping_sysex = false;
    }

    /// Bytes of the message currently being assembled.
    pub fn pending(&self) -> usize {
        self.buffer.len()
    }

    fn discard(&mut self) {
        self.buffer.clear();
        self.in_sysex = false;
    }

    fn step(&mut self, byte: u8, emit: &mut impl FnMut(Decoded)) {
        if byte >= 0xF8 {
            emit(Event::parse_live(&[byte]));
            return;
        }
        if self.skipping_sysex {
            if byte < 0x80 {
                return;
            }
            self.skipping_sysex = false;
            if byte == 0xF7 {
                return;
            }
        }
        if self.in_sysex {
            match byte {
                // The buffer holds the F0 in front of the payload.
                0x00..=0x7F if self.buffer.len() > self.sysex_limit => {
                    self.discard();
                    self.skipping_sysex = true;
                    emit(Err(DecodeError::SysExTooLong(self.sysex_limit)));
                    return;
                }
                0x00..=0x7F => {
                    self.buffer.push(byte);
                    return;
                }
                0xF7 => {
                    self.buffer.push(byte);
                    emit(Event::parse_live(&self.buffer));
                    self.discard();
                    return;
                }
                _ => {
                    self.discard();
                    emit(Err(DecodeError::UnterminatedSysEx));
                }
            }
        }
        if byte >= 0x80 {
            if !self.buffer.is_empty() {
                self.discard();
                emit(Err(DecodeError::UnexpectedStatus(byte)));
            }
            match byte {
                0xF0 => {
                    self.running_status = None;
                    self.in_sysex = true;
                }
                0xF7 => {
                    emit(Err(DecodeError::UnknownStatus(byte)));
                    return;
                }
                0x80..=0xEF => self.running_status = Some(byte),
                _ => self.running_status = None,
            }
            self.buffer.push(byte);
        } else {
            if self.buffer.is_empty() {
                match self.running_status {
                    Some(status) => self.buffer.push(status),
                    None => {
                        emit(Err(DecodeError::MissingStatus(byte)));
                        return;
                    }
                }
            }
            self.buffer.push(byte);
        }
        if self.in_sysex {
            return;
        }
        match message_len(self.buffer[0]) {
            Some(len) if self.buffer.len() == len + 1 => {
                emit(Event::parse_live(&self.buffer));
                self.discard();
            }
            Some(_) => {}
            None => {
                let status = self.buffer[0];
                self.discard();
                emit(Err(DecodeError::UnknownStatus(status)));
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Channel, Family};

    fn ch(index: u8) -> Channel {
        Channel::from_int_lossy(index)
    }

    #[test]
    fn messages_split_across_chunks() {
        let mut decoder = StreamDecoder::new();
        assert!(decoder.decode_all(&[0x90, 0x3C]).is_empty());
        assert_eq!(decoder.pending(), 2);
        let out = decoder.decode_all(&[0x64, 0x40, 0x00]);
        assert_eq!(
            out,
            [
                Ok(Event::note_on(ch(0), 0x3C, 0x64).unwrap()),
                Ok(Event::note_on(ch(0), 0x40, 0x00).unwrap()),
            ]
        );
        assert_eq!(decoder.pending(), 0);
    }

    #[test]
    fn realtime_interleaves() {
        let mut decoder = StreamDecoder::new();
        let out = decoder.decode_all(&[0xB2, 0x07, 0xF8, 0x50, 0xF0, 0x01, 0xFE, 0x02, 0xF7]);
        let families: Vec<Family> = out.iter().map(|r| r.as_ref().unwrap().family()).collect();
        assert_eq!(
            families,
            [Family::System, Family::Controller, Family::System, Family::SysEx]
        );
        assert_eq!(
            out[3].as_ref().unwrap().sysex_payload(),
            Some(&[0x01, 0x02][..])
        );
    }

    #[test]
    fn resynchronises_after_errors() {
        let mut decoder = StreamDecoder::new();
        let out = decoder.decode_all(&[0x3C, 0x90, 0x3C, 0xC1, 0x05, 0x06]);
        assert_eq!(out[0], Err(DecodeError::MissingStatus(0x3C)));
        assert_eq!(out[1], Err(DecodeError::UnexpectedStatus(0xC1)));
        assert_eq!(out[2], Ok(Event::program_change(ch(1), 5).unwrap()));
        assert_eq!(out[3], Ok(Event::program_change(ch(1), 6).unwrap()));
    }

    #[test]
    fn sysex_interrupted_by_status() {
        let mut decoder = StreamDecoder::new();
        let out = decoder.decode_all(&[0xF0, 0x01, 0x80, 0x3C, 0x00]);
        assert_eq!(
            out,
            [
                Err(DecodeError::UnterminatedSysEx),
                Ok(Event::note_off(ch(0), 0x3C, 0).unwrap()),
            ]
        );
    }

    #[test]
    fn oversized_sysex_is_dropped_and_skipped() {
        let mut decoder = StreamDecoder::new().with_sysex_limit(4);
        let mut out = decoder.decode_all(&[0xF0, 1, 2, 3, 4]);
        assert!(out.is_empty());
        assert_eq!(decoder.pending(), 5);

        out.extend(decoder.decode_all(&[5, 6, 7]));
        assert_eq!(out, [Err(DecodeError::SysExTooLong(4))]);
        assert_eq!(decoder.pending(), 0);

        // Data keeps coming without a terminator; nothing is buffered for it.
        for _ in 0..1000 {
            assert!(decoder.decode_all(&[0x11; 64]).is_empty());
        }
        assert_eq!(decoder.pending(), 0);

        let out = decoder.decode_all(&[0xF8, 0x22, 0xF7, 0xF0, 9, 0xF7, 0x90, 0x3C, 0x64]);
        assert_eq!(
            out,
            [
                Ok(Event::system(0xF8, &[]).unwrap()),
                Ok(Event::sysex(&[9]).unwrap()),
                Ok(Event::note_on(ch(0), 0x3C, 0x64).unwrap()),
            ]
        );
    }

    #[test]
    fn sysex_at_the_limit_is_kept() {
        let mut decoder = StreamDecoder::new().with_sysex_limit(2);
        assert_eq!(decoder.sysex_limit(), 2);
        let out = decoder.decode_all(&[0xF0, 1, 2, 0xF7]);
        assert_eq!(out, [Ok(Event::sysex(&[1, 2]).unwrap())]);
        assert_eq!(StreamDecoder::new().sysex_limit(), VARLEN_MAX as usize);
    }

    #[test]
    fn system_common_clears_running_status() {
        let mut decoder = StreamDecoder::new();
        let out = decoder.decode_all(&[0x90, 0x3C, 0x64, 0xF6, 0x3C]);
        assert_eq!(out[1], Ok(Event::system(0xF6, &[]).unwrap()));
        assert_eq!(out[2], Err(DecodeError::MissingStatus(0x3C)));
        decoder.reset();
        assert_eq!(decoder.pending(), 0);
    }
}
