use super::{Handler, HandlerCore, Identity, Message, Mode, ModeBit, Outcome, Properties, State};
use crate::error::{Error, Result};
use crate::event::{Channel, Channels, Family, FamilySet};

/// Thru handler passing on the part of each event that addresses its channels.
///
/// Channel-voice events are restricted to the selected channels and dropped when nothing is
/// left; other events pass unchanged. Notes may be transposed, and notes pushed out of range are
/// dropped.
pub struct ChannelFilter {
    core: HandlerCore,
    channels: Channels,
    transpose: i8,
}

impl ChannelFilter {
    pub const TYPE: &'static str = "channel-filter";

    pub fn new(identity: Identity, channels: Channels, transpose: i8) -> Self {
        Self {
            core: identity.core(Mode::fuse([ModeBit::In, ModeBit::Out, ModeBit::Thru])),
            channels,
            transpose,
        }
    }

    /// Reads `channels` (comma separated indices, or `all`, the default) and `transpose`.
    pub fn from_properties(identity: Identity, props: &Properties) -> Result<Self> {
        let channels = match props.get("channels") {
            None => Channel::every(),
            Some(list) => parse_channels(list).ok_or_else(|| Error::InvalidProperty {
                key: "channels".into(),
                value: list.into(),
            })?,
        };
        let transpose = props.parse_or("transpose", 0i8)?;
        Ok(Self::new(identity, channels, transpose))
    }

    #[inline]
    pub fn channels(&self) -> Channels {
        self.channels
    }

    #[inline]
    pub fn transpose(&self) -> i8 {
        self.transpose
    }
}

fn parse_channels(list: &str) -> Option<Channels> {
    if list.trim().eq_ignore_ascii_case("all") {
        return Some(Channel::every());
    }
    list.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(|s| s.parse::<u8>().ok().and_then(|i| Channel::new(i).ok()))
        .collect()
}

impl Handler for ChannelFilter {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn handled_families(&self) -> FamilySet {
        Family::every()
    }

    fn properties(&self) -> Properties {
        let mut props = Properties::new();
        if self.channels != Channel::every() {
            let list: Vec<_> = self.channels.iter().map(|c| c.index().to_string()).collect();
            props.set("channels", list.join(","));
        }
        if self.transpose != 0 {
            props.set("transpose", self.transpose);
        }
        props
    }

    fn handle_message(&self, message: &Message) -> Outcome {
        let mut event = message.event.clone();
        if event.family().is_voice() {
            let kept = event.channels() & self.channels;
            if kept.is_empty() {
                return Outcome::Success;
            }
            if kept != event.channels() {
                event = match event.with_channels(kept) {
                    Ok(event) => event,
                    Err(_) => return Outcome::Fail,
                };
            }
            if self.transpose != 0 {
                event = match event.transpose(self.transpose) {
                    Some(event) => event,
                    None => return Outcome::Success,
                };
            }
        }
        let outcome = self.core.forward(&Message {
            event,
            source: message.source,
        });
        match outcome {
            Outcome::Fail => Outcome::Fail,
            _ => Outcome::Success,
        }
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::Event;
    use crate::handler::tests::Tap;
    use crate::handler::{HandlerId, StateBit};
    use std::sync::Arc;

    fn ch(i: u8) -> Channel {
        Channel::new(i).unwrap()
    }

    fn wired(filter: ChannelFilter) -> (Arc<ChannelFilter>, Arc<Tap>) {
        let filter = Arc::new(filter);
        let tap = Tap::new(9, ModeBit::In.into());
        let tap_dyn: Arc<dyn Handler> = tap.clone();
        filter.core().connect(&tap_dyn);
        filter.handle_open(State::io());
        tap.handle_open(StateBit::Receive.into());
        (filter, tap)
    }

    #[test]
    fn restricts_channels() {
        let props = Properties::new().with("channels", "0, 2");
        let filter =
            ChannelFilter::from_properties(Identity::new(HandlerId(1), "f"), &props).unwrap();
        let (filter, tap) = wired(filter);

        let chord = Event::note_on(Channels::fuse([ch(0), ch(1), ch(2)]), 60, 90).unwrap();
        assert_eq!(filter.send_message(&Message::new(chord)), Outcome::Success);
        let only_one = Event::note_on(ch(1), 60, 90).unwrap();
        assert_eq!(filter.send_message(&Message::new(only_one)), Outcome::Success);
        let sysex = Event::sysex(&[1, 2]).unwrap();
        filter.send_message(&Message::new(sysex.clone()));

        let seen = tap.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event.channels(), Channels::fuse([ch(0), ch(2)]));
        assert_eq!(seen[1].event, sysex);
    }

    #[test]
    fn transposes_notes_and_drops_out_of_range() {
        let filter = ChannelFilter::new(Identity::new(HandlerId(1), "f"), Channel::every(), 12);
        let (filter, tap) = wired(filter);

        filter.send_message(&Message::new(Event::note_on(ch(0), 60, 1).unwrap()));
        filter.send_message(&Message::new(Event::note_on(ch(0), 120, 1).unwrap()));
        let cc = Event::controller(ch(0), 60, 1).unwrap();
        filter.send_message(&Message::new(cc.clone()));

        let seen = tap.seen.lock();
        assert_eq!(seen.len(), 2);
        assert_eq!(seen[0].event.note(), Some(72));
        assert_eq!(seen[1].event, cc);
    }

    #[test]
    fn keeps_the_original_source() {
        let filter = ChannelFilter::new(Identity::new(HandlerId(1), "f"), Channel::every(), 0);
        let (filter, tap) = wired(filter);
        let event = Event::note_on(ch(3), 1, 1).unwrap();
        filter.send_message(&Message::from_source(event, HandlerId(5)));
        assert_eq!(tap.seen.lock()[0].source, Some(HandlerId(5)));
    }

    #[test]
    fn properties_round_trip() {
        let props = Properties::new().with("channels", "1,9").with("transpose", "-3");
        let filter =
            ChannelFilter::from_properties(Identity::new(HandlerId(1), "f"), &props).unwrap();
        assert_eq!(filter.properties(), props);
        assert_eq!(filter.transpose(), -3);

        let all =
            ChannelFilter::from_properties(Identity::new(HandlerId(2), "g"), &Properties::new())
                .unwrap();
        assert!(all.properties().is_empty());
        assert_eq!(all.channels(), Channel::every());

        let bad = Properties::new().with("channels", "0,16");
        assert!(ChannelFilter::from_properties(Identity::new(HandlerId(3), "h"), &bad).is_err());
    }
}
