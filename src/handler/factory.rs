//! Building handlers from a type name and a flat property map.

use super::{
    ChannelFilter, Handler, HandlerCore, HandlerId, Mode, Player, RawInput, RawOutput, Recorder,
};
use crate::error::{Error, Result};
use crate::event::{Family, FamilySet};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

/// String properties a handler is constructed from.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Properties(BTreeMap<String, String>);

impl Properties {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, key: impl Into<String>, value: impl ToString) -> Self {
        self.set(key, value);
        self
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl ToString) {
        self.0.insert(key.into(), value.to_string());
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.0.get(key).map(String::as_str)
    }

    pub fn require(&self, key: &str) -> Result<&str> {
        self.get(key)
            .ok_or_else(|| Error::MissingProperty(key.to_string()))
    }

    /// Parses `key` if present.
    pub fn parse<T: FromStr>(&self, key: &str) -> Result<Option<T>> {
        self.get(key)
            .map(|value| {
                value.trim().parse().map_err(|_| Error::InvalidProperty {
                    key: key.to_string(),
                    value: value.to_string(),
                })
            })
            .transpose()
    }

    pub fn parse_or<T: FromStr>(&self, key: &str, default: T) -> Result<T> {
        Ok(self.parse(key)?.unwrap_or(default))
    }

    /// Reads a boolean, accepting `true`/`false`, `yes`/`no`, `on`/`off` and `1`/`0`.
    pub fn flag(&self, key: &str) -> Result<bool> {
        match self.get(key).map(|v| v.trim().to_ascii_lowercase()) {
            None => Ok(false),
            Some(v) => match v.as_str() {
                "true" | "yes" | "on" | "1" => Ok(true),
                "false" | "no" | "off" | "0" | "" => Ok(false),
                _ => Err(Error::InvalidProperty {
                    key: key.to_string(),
                    value: v,
                }),
            },
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl<K: Into<String>, V: ToString> FromIterator<(K, V)> for Properties {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut props = Properties::new();
        for (k, v) in iter {
            props.set(k, v);
        }
        props
    }
}

/// Who a new handler is inside its graph.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Identity {
    pub id: HandlerId,
    pub name: String,
    pub group: String,
}

impl Identity {
    pub fn new(id: HandlerId, name: impl Into<String>) -> Self {
        Self {
            id,
            name: name.into(),
            group: String::new(),
        }
    }

    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group = group.into();
        self
    }

    pub(crate) fn core(self, mode: Mode) -> HandlerCore {
        HandlerCore::new(self.id, self.name, mode).with_group(self.group)
    }
}

/// Creates handlers of one type.
pub trait HandlerFactory: Send + Sync {
    fn identifier(&self) -> &'static str;

    fn description(&self) -> &'static str;

    /// Families handlers of this type process.
    fn handled_families(&self) -> FamilySet;

    fn instantiate(&self, identity: Identity, properties: &Properties) -> Result<Arc<dyn Handler>>;
}

type Builder = fn(Identity, &Properties) -> Result<Arc<dyn Handler>>;

fn shared<H: Handler + 'static>(handler: H) -> Arc<dyn Handler> {
    Arc::new(handler)
}

struct Builtin {
    identifier: &'static str,
    description: &'static str,
    families: FamilySet,
    build: Builder,
}

impl HandlerFactory for Builtin {
    fn identifier(&self) -> &'static str {
        self.identifier
    }

    fn description(&self) -> &'static str {
        self.description
    }

    fn handled_families(&self) -> FamilySet {
        self.families
    }

    fn instantiate(&self, identity: Identity, properties: &Properties) -> Result<Arc<dyn Handler>> {
        (self.build)(identity, properties)
    }
}

fn builtins() -> Vec<Builtin> {
    let list = vec![
        Builtin {
            identifier: Recorder::TYPE,
            description: "Records every received event with its arrival time",
            families: Family::every(),
            build: |identity, props| Recorder::from_properties(identity, props).map(shared),
        },
        Builtin {
            identifier: ChannelFilter::TYPE,
            description: "Passes events addressed to selected channels, optionally transposed",
            families: Family::every(),
            build: |identity, props| ChannelFilter::from_properties(identity, props).map(shared),
        },
        Builtin {
            identifier: Player::TYPE,
            description: "Plays a track file in real time",
            families: FamilySet::empty(),
            build: |identity, props| Player::from_properties(identity, props).map(shared),
        },
        Builtin {
            identifier: RawInput::TYPE,
            description: "Reads MIDI bytes from a file, pipe or device node",
            families: FamilySet::empty(),
            build: |identity, props| RawInput::from_properties(identity, props).map(shared),
        },
        Builtin {
            identifier: RawOutput::TYPE,
            description: "Writes MIDI bytes to a file, pipe or device node",
            families: RawOutput::families(),
            build: |identity, props| RawOutput::from_properties(identity, props).map(shared),
        },
    ];
    #[cfg(feature = "midir")]
    let list = {
        let mut list = list;
        list.extend([
            Builtin {
                identifier: super::MidirInput::TYPE,
                description: "System MIDI input port",
                families: FamilySet::empty(),
                build: |identity, props| {
                    super::MidirInput::from_properties(identity, props).map(shared)
                },
            },
            Builtin {
                identifier: super::MidirOutput::TYPE,
                description: "System MIDI output port",
                families: super::MidirOutput::families(),
                build: |identity, props| {
                    super::MidirOutput::from_properties(identity, props).map(shared)
                },
            },
        ]);
        list
    };
    list
}

/// Handler factories by type name.
#[derive(Default)]
pub struct Registry {
    factories: HashMap<&'static str, Box<dyn HandlerFactory>>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every handler type shipped with the crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        for builtin in builtins() {
            registry.register(builtin);
        }
        registry
    }

    /// Adds `factory`, returning the one it replaces.
    pub fn register(
        &mut self,
        factory: impl HandlerFactory + 'static,
    ) -> Option<Box<dyn HandlerFactory>> {
        self.factories.insert(factory.identifier(), Box::new(factory))
    }

    pub fn get(&self, type_name: &str) -> Option<&dyn HandlerFactory> {
        self.factories.get(type_name).map(|f| f.as_ref())
    }

    pub fn create(
        &self,
        type_name: &str,
        identity: Identity,
        properties: &Properties,
    ) -> Result<Arc<dyn Handler>> {
        let factory = self
            .get(type_name)
            .ok_or_else(|| Error::UnknownHandlerType(type_name.to_string()))?;
        let handler = factory.instantiate(identity, properties)?;
        tracing::debug!(
            handler = %handler.id(),
            type_name,
            name = handler.name(),
            "handler created"
        );
        Ok(handler)
    }

    /// Factories sorted by identifier.
    pub fn factories(&self) -> Vec<&dyn HandlerFactory> {
        let mut list: Vec<_> = self.factories.values().map(|f| f.as_ref()).collect();
        list.sort_by_key(|f| f.identifier());
        list
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set()
            .entries(self.factories().iter().map(|f| f.identifier()))
            .finish()
    }
}

/// Physical endpoints offered by the platform.
pub trait DeviceFactory: Send + Sync {
    /// Port names. Empty when the platform has no MIDI support.
    fn available(&self) -> Vec<String>;

    fn instantiate(&self, identity: Identity, device: &str) -> Result<Arc<dyn Handler>>;
}

/// System MIDI input ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemInputs;

/// System MIDI output ports.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemOutputs;

#[cfg(feature = "midir")]
impl DeviceFactory for SystemInputs {
    fn available(&self) -> Vec<String> {
        match midir::MidiInput::new(crate::CLIENT_NAME) {
            Ok(midi_in) => midi_in
                .ports()
                .iter()
                .filter_map(|port| midi_in.port_name(port).ok())
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "MIDI input unavailable");
                Vec::new()
            }
        }
    }

    fn instantiate(&self, identity: Identity, device: &str) -> Result<Arc<dyn Handler>> {
        if !self.available().iter().any(|name| name == device) {
            return Err(Error::UnknownDevice(device.to_string()));
        }
        Ok(shared(super::MidirInput::new(identity, device)))
    }
}

#[cfg(feature = "midir")]
impl DeviceFactory for SystemOutputs {
    fn available(&self) -> Vec<String> {
        match midir::MidiOutput::new(crate::CLIENT_NAME) {
            Ok(midi_out) => midi_out
                .ports()
                .iter()
                .filter_map(|port| midi_out.port_name(port).ok())
                .collect(),
            Err(e) => {
                tracing::warn!(error = %e, "MIDI output unavailable");
                Vec::new()
            }
        }
    }

    fn instantiate(&self, identity: Identity, device: &str) -> Result<Arc<dyn Handler>> {
        if !self.available().iter().any(|name| name == device) {
            return Err(Error::UnknownDevice(device.to_string()));
        }
        Ok(shared(super::MidirOutput::new(identity, device)))
    }
}

#[cfg(not(feature = "midir"))]
impl DeviceFactory for SystemInputs {
    fn available(&self) -> Vec<String> {
        Vec::new()
    }

    fn instantiate(&self, _identity: Identity, device: &str) -> Result<Arc<dyn Handler>> {
        Err(Error::UnknownDevice(device.to_string()))
    }
}

#[cfg(not(feature = "midir"))]
impl DeviceFactory for SystemOutputs {
    fn available(&self) -> Vec<String> {
        Vec::new()
    }

    fn instantiate(&self, _identity: Identity, device: &str) -> Result<Arc<dyn Handler>> {
        Err(Error::UnknownDevice(device.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn typed_properties() {
        let props: Properties = [("channels", "0,9"), ("transpose", "-12"), ("loop", "yes")]
            .into_iter()
            .collect();
        assert_eq!(props.get("channels"), Some("0,9"));
        assert_eq!(props.parse::<i8>("transpose").unwrap(), Some(-12));
        assert_eq!(props.parse_or::<u16>("ppqn", 480).unwrap(), 480);
        assert!(props.flag("loop").unwrap());
        assert!(!props.flag("missing").unwrap());
        assert!(matches!(props.require("path"), Err(Error::MissingProperty(k)) if k == "path"));
        assert!(matches!(
            props.parse::<u8>("transpose"),
            Err(Error::InvalidProperty { key, .. }) if key == "transpose"
        ));
        assert!(Properties::new().with("loop", "maybe").flag("loop").is_err());
    }

    #[test]
    fn registry_lists_builtins() {
        let registry = Registry::with_builtins();
        let names: Vec<_> = registry.factories().iter().map(|f| f.identifier()).collect();
        for expected in ["channel-filter", "player", "raw-input", "raw-output", "recorder"] {
            assert!(names.contains(&expected), "{expected} missing");
        }
        assert!(registry.get("recorder").unwrap().handled_families().all(Family::every()));
        assert!(registry.get("player").unwrap().handled_families().is_empty());
    }

    #[test]
    fn registry_creates_handlers() {
        let registry = Registry::with_builtins();
        let identity = Identity::new(HandlerId(4), "rec").with_group("tools");
        let handler = registry.create("recorder", identity, &Properties::new()).unwrap();
        assert_eq!(handler.id(), HandlerId(4));
        assert_eq!(handler.core().group(), "tools");
        assert_eq!(handler.type_name(), "recorder");

        let err = registry.create("theremin", Identity::new(HandlerId(5), "x"), &Properties::new());
        assert!(matches!(err, Err(Error::UnknownHandlerType(t)) if t == "theremin"));
    }

    #[cfg(not(feature = "midir"))]
    #[test]
    fn no_platform_devices_without_midir() {
        assert!(SystemInputs.available().is_empty());
        assert!(SystemOutputs.available().is_empty());
        assert!(SystemInputs
            .instantiate(Identity::new(HandlerId(1), "in"), "Port 1")
            .is_err());
    }
}
