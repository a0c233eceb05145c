//! System MIDI ports through midir.

use super::raw::{output_messages, task_properties, task_settings};
use super::{Handler, HandlerCore, Identity, Message, ModeBit, Outcome, Properties, State, StateBit};
use crate::error::{Error, Result};
use crate::event::{Event, Family, FamilySet, WireMessage};
use crate::task::{DEFAULT_CAPACITY, Priority, Task};
use midir::{MidiInput, MidiInputConnection, MidiInputPort, MidiOutput, MidiOutputPort};
use parking_lot::Mutex;
use std::sync::Arc;

fn find_input(midi_in: &MidiInput, name: &str) -> Result<MidiInputPort> {
    midi_in
        .ports()
        .into_iter()
        .find(|port| midi_in.port_name(port).is_ok_and(|n| n == name))
        .ok_or_else(|| Error::UnknownDevice(name.to_string()))
}

fn find_output(midi_out: &MidiOutput, name: &str) -> Result<MidiOutputPort> {
    midi_out
        .ports()
        .into_iter()
        .find(|port| midi_out.port_name(port).is_ok_and(|n| n == name))
        .ok_or_else(|| Error::UnknownDevice(name.to_string()))
}

/// A system input port. Incoming messages are forwarded from a [`Task`] worker, never from the
/// driver callback.
pub struct MidirInput {
    core: Arc<HandlerCore>,
    port: String,
    task: Arc<Task<Message>>,
    priority: Priority,
    connection: Mutex<Option<MidiInputConnection<()>>>,
}

impl MidirInput {
    pub const TYPE: &'static str = "midir-input";

    pub fn new(identity: Identity, port: impl Into<String>) -> Self {
        Self::build(identity, port.into(), DEFAULT_CAPACITY, Priority::Normal)
    }

    /// Reads `port`, plus optional `capacity` and `priority` for the forwarding task.
    pub fn from_properties(identity: Identity, props: &Properties) -> Result<Self> {
        let port = props.require("port")?.to_string();
        let (capacity, priority) = task_settings(props)?;
        Ok(Self::build(identity, port, capacity, priority))
    }

    fn build(identity: Identity, port: String, capacity: usize, priority: Priority) -> Self {
        let task =
            Task::new(format!("{}-forward", identity.name), capacity).with_priority(priority);
        Self {
            core: Arc::new(identity.core(ModeBit::Out.into())),
            port,
            task: Arc::new(task),
            priority,
            connection: Mutex::new(None),
        }
    }

    pub fn port(&self) -> &str {
        &self.port
    }

    fn connect(&self) -> Result<MidiInputConnection<()>> {
        let midi_in = MidiInput::new(crate::CLIENT_NAME)?;
        let port = find_input(&midi_in, &self.port)?;
        let id = self.core.id();
        let task = Arc::clone(&self.task);
        let connection = midi_in.connect(
            &port,
            &format!("{}-in", crate::CLIENT_NAME),
            move |_timestamp, bytes, _| match Event::parse_live(bytes) {
                Ok(event) => {
                    task.push(Message::from_source(event, id));
                }
                Err(e) => tracing::warn!(handler = %id, error = %e, "discarding malformed input"),
            },
            (),
        )?;
        Ok(connection)
    }

    fn disconnect(&self) {
        if let Some(connection) = self.connection.lock().take() {
            connection.close();
        }
        self.task.stop(true);
    }
}

impl Handler for MidirInput {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn handled_families(&self) -> FamilySet {
        FamilySet::empty()
    }

    fn properties(&self) -> Properties {
        let mut props = Properties::new().with("port", &self.port);
        task_properties(&mut props, self.task.capacity(), self.priority);
        props
    }

    fn handle_message(&self, _message: &Message) -> Outcome {
        Outcome::Unhandled
    }

    fn handle_open(&self, state: State) -> Outcome {
        if !state.test(StateBit::Forward) || self.connection.lock().is_some() {
            return Outcome::Success;
        }
        let core = Arc::clone(&self.core);
        if let Err(e) = self.task.start(move |message: Message| {
            core.forward(&message);
        }) {
            tracing::error!(handler = %self.core.id(), error = %e, "cannot start input task");
            return Outcome::Fail;
        }
        match self.connect() {
            Ok(connection) => {
                *self.connection.lock() = Some(connection);
                self.core.activate_state(StateBit::Forward);
                tracing::info!(handler = %self.core.id(), port = %self.port, "input connected");
                Outcome::Success
            }
            Err(e) => {
                tracing::error!(
                    handler = %self.core.id(),
                    port = %self.port,
                    error = %e,
                    "cannot connect input"
                );
                self.task.stop(true);
                Outcome::Fail
            }
        }
    }

    fn handle_close(&self, state: State) -> Outcome {
        if state.test(StateBit::Forward) {
            self.core.deactivate_state(StateBit::Forward);
            self.disconnect();
        }
        Outcome::Success
    }
}

impl Drop for MidirInput {
    fn drop(&mut self) {
        self.disconnect();
    }
}

/// A system output port. Writes go through a [`Task`] that owns the connection while open.
pub struct MidirOutput {
    core: HandlerCore,
    port: String,
    task: Task<WireMessage>,
    priority: Priority,
}

impl MidirOutput {
    pub const TYPE: &'static str = "midir-output";

    pub fn new(identity: Identity, port: impl Into<String>) -> Self {
        Self::build(identity, port.into(), DEFAULT_CAPACITY, Priority::Normal)
    }

    /// Reads `port`, plus optional `capacity` and `priority` for the write task.
    pub fn from_properties(identity: Identity, props: &Properties) -> Result<Self> {
        let port = props.require("port")?.to_string();
        let (capacity, priority) = task_settings(props)?;
        Ok(Self::build(identity, port, capacity, priority))
    }

    fn build(identity: Identity, port: String, capacity: usize, priority: Priority) -> Self {
        let task = Task::new(format!("{}-write", identity.name), capacity).with_priority(priority);
        Self {
            core: identity.core(ModeBit::In.into()),
            port,
            task,
            priority,
        }
    }

    /// Everything a port can carry, plus reset.
    pub fn families() -> FamilySet {
        Family::every() & !FamilySet::from(Family::Meta)
    }

    pub fn port(&self) -> &str {
        &self.port
    }
}

impl Handler for MidirOutput {
    fn core(&self) -> &HandlerCore {
        &self.core
    }

    fn type_name(&self) -> &'static str {
        Self::TYPE
    }

    fn handled_families(&self) -> FamilySet {
        Self::families()
    }

    fn properties(&self) -> Properties {
        let mut props = Properties::new().with("port", &self.port);
        task_properties(&mut props, self.task.capacity(), self.priority);
        props
    }

    fn handle_message(&self, message: &Message) -> Outcome {
        let Ok(messages) = output_messages(&message.event) else {
            return Outcome::Fail;
        };
        for bytes in messages {
            if !self.task.push(bytes) {
                return Outcome::Closed;
            }
        }
        Outcome::Success
    }

    fn handle_open(&self, state: State) -> Outcome {
        if !state.test(StateBit::Receive) || self.task.is_running() {
            return Outcome::Success;
        }
        let connection = MidiOutput::new(crate::CLIENT_NAME)
            .map_err(Error::from)
            .and_then(|midi_out| {
                let port = find_output(&midi_out, &self.port)?;
                Ok(midi_out.connect(&port, &format!("{}-out", crate::CLIENT_NAME))?)
            });
        let mut connection = match connection {
            Ok(connection) => connection,
            Err(e) => {
                tracing::error!(
                    handler = %self.core.id(),
                    port = %self.port,
                    error = %e,
                    "cannot connect output"
                );
                return Outcome::Fail;
            }
        };
        let id = self.core.id();
        match self.task.start(move |bytes: WireMessage| {
            if let Err(e) = connection.send(&bytes) {
                tracing::warn!(handler = %id, error = %e, "send failed");
            }
        }) {
            Ok(_) => {
                self.core.activate_state(StateBit::Receive);
                tracing::info!(handler = %id, port = %self.port, "output connected");
                Outcome::Success
            }
            Err(e) => {
                tracing::error!(handler = %id, error = %e, "cannot start output task");
                Outcome::Fail
            }
        }
    }

    fn handle_close(&self, state: State) -> Outcome {
        if state.test(StateBit::Receive) {
            self.core.deactivate_state(StateBit::Receive);
            self.task.stop(false);
        }
        Outcome::Success
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::HandlerId;

    #[test]
    fn task_settings_round_trip() {
        let props = Properties::new()
            .with("port", "Synth")
            .with("capacity", 32)
            .with("priority", "high");
        let input = MidirInput::from_properties(Identity::new(HandlerId(1), "in"), &props).unwrap();
        assert_eq!(input.properties(), props);
        let output =
            MidirOutput::from_properties(Identity::new(HandlerId(2), "out"), &props).unwrap();
        assert_eq!(output.properties(), props);
        assert_eq!(output.task.capacity(), 32);

        let missing =
            MidirOutput::from_properties(Identity::new(HandlerId(3), "x"), &Properties::new());
        assert!(missing.is_err());
    }
}
