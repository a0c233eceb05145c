//! The routing graph: handlers by id and the connections between them.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::handler::{Handler, HandlerId, Identity, Outcome, Registry, State, StateBit};
use crate::patch::{ConnectionSpec, HandlerSpec, Patch, Settings};
use crate::tribool::Tribool;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

/// Owns every handler of a patch.
///
/// Handlers hold only weak references to their downstream targets, so dropping a handler from
/// the graph is enough to take it out of the routing.
pub struct Graph {
    name: String,
    settings: Settings,
    handlers: BTreeMap<HandlerId, Arc<dyn Handler>>,
    connections: Vec<ConnectionSpec>,
}

/// Bits that make a handler ready to take events; opened before anything starts producing.
fn receiving() -> State {
    State::fuse([StateBit::Receive, StateBit::Recording])
}

impl Graph {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            settings: Settings::default(),
            handlers: BTreeMap::new(),
            connections: Vec::new(),
        }
    }

    #[inline]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[inline]
    pub fn settings(&self) -> Settings {
        self.settings
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }

    pub fn handler(&self, id: HandlerId) -> Option<&Arc<dyn Handler>> {
        self.handlers.get(&id)
    }

    pub fn handlers(&self) -> impl Iterator<Item = &Arc<dyn Handler>> {
        self.handlers.values()
    }

    pub fn connections(&self) -> &[ConnectionSpec] {
        &self.connections
    }

    /// An id above every handler in the graph.
    pub fn next_id(&self) -> HandlerId {
        HandlerId(self.handlers.keys().next_back().map_or(0, |id| id.0 + 1))
    }

    fn get(&self, id: HandlerId) -> Result<&Arc<dyn Handler>> {
        self.handlers.get(&id).ok_or(Error::UnknownHandler(id))
    }

    pub fn insert(&mut self, handler: Arc<dyn Handler>) -> Result<()> {
        let id = handler.id();
        if self.handlers.contains_key(&id) {
            return Err(Error::DuplicateHandler(id));
        }
        tracing::debug!(handler = %id, name = handler.name(), "handler inserted");
        self.handlers.insert(id, handler);
        Ok(())
    }

    /// Closes `id`, unlinks it and hands it back.
    pub fn remove(&mut self, id: HandlerId) -> Result<Arc<dyn Handler>> {
        self.close(id, State::full())?;
        let handler = self.handlers.remove(&id).ok_or(Error::UnknownHandler(id))?;
        handler.core().disconnect_all();
        for other in self.handlers.values() {
            other.core().disconnect(id);
        }
        self.connections.retain(|c| c.tail != id && c.head != id);
        tracing::debug!(handler = %id, "handler removed");
        Ok(handler)
    }

    /// Routes events produced by `tail` to `head`. Returns `false` if already connected.
    pub fn connect(&mut self, tail: HandlerId, head: HandlerId) -> Result<bool> {
        self.connect_spec(ConnectionSpec::new(tail, head))
    }

    /// Like [`connect`](Self::connect), keeping the connection's `source` tag.
    ///
    /// Thru handlers forward on the calling thread, so a connection that lets events come back
    /// to `tail` is refused with [`Error::Cycle`].
    pub fn connect_spec(&mut self, spec: ConnectionSpec) -> Result<bool> {
        let head = Arc::clone(self.get(spec.head)?);
        let tail = self.get(spec.tail)?;
        if self.reaches(spec.head, spec.tail) {
            return Err(Error::Cycle {
                tail: spec.tail,
                head: spec.head,
            });
        }
        if !tail.core().connect(&head) {
            return Ok(false);
        }
        tracing::debug!(tail = %spec.tail, head = %spec.head, "connected");
        self.connections.push(spec);
        Ok(true)
    }

    fn reaches(&self, from: HandlerId, to: HandlerId) -> bool {
        let mut seen = BTreeSet::new();
        let mut stack = vec![from];
        while let Some(id) = stack.pop() {
            if id == to {
                return true;
            }
            if seen.insert(id) {
                if let Some(handler) = self.handlers.get(&id) {
                    stack.extend(handler.core().targets());
                }
            }
        }
        false
    }

    pub fn disconnect(&mut self, tail: HandlerId, head: HandlerId) -> Result<bool> {
        let removed = self.get(tail)?.core().disconnect(head);
        self.connections.retain(|c| c.tail != tail || c.head != head);
        Ok(removed)
    }

    /// Asks `id` to activate `state`.
    ///
    /// Bits outside the handler's mode are ignored and bits already active are not requested
    /// again, so each transition is delivered once.
    pub fn open(&self, id: HandlerId, state: impl Into<State>) -> Result<Outcome> {
        let handler = self.get(id)?;
        let edges = state.into() & handler.mode().allowed_states() & !handler.state();
        if edges.is_empty() {
            return Ok(Outcome::Success);
        }
        let outcome = handler.handle_open(edges);
        if outcome == Outcome::Fail {
            tracing::warn!(handler = %id, state = ?edges, "open failed");
        }
        Ok(outcome)
    }

    /// Asks `id` to deactivate the bits of `state` that are currently active.
    pub fn close(&self, id: HandlerId, state: impl Into<State>) -> Result<Outcome> {
        let handler = self.get(id)?;
        let edges = state.into() & handler.state();
        if edges.is_empty() {
            return Ok(Outcome::Success);
        }
        let outcome = handler.handle_close(edges);
        if outcome == Outcome::Fail {
            tracing::warn!(handler = %id, state = ?edges, "close failed");
        }
        Ok(outcome)
    }

    fn each(
        &self,
        state: State,
        apply: impl Fn(&Self, HandlerId, State) -> Result<Outcome>,
    ) -> Outcome {
        let mut failed = false;
        for &id in self.handlers.keys() {
            failed |= matches!(apply(self, id, state), Ok(Outcome::Fail));
        }
        if failed { Outcome::Fail } else { Outcome::Success }
    }

    /// Opens `state` on every handler, consumers first.
    pub fn open_all(&self, state: impl Into<State>) -> Outcome {
        let state = state.into();
        let first = self.each(state & receiving(), |g, id, s| g.open(id, s));
        let rest = self.each(state & !receiving(), |g, id, s| g.open(id, s));
        if first == Outcome::Fail || rest == Outcome::Fail {
            Outcome::Fail
        } else {
            Outcome::Success
        }
    }

    /// Closes `state` on every handler, producers first.
    pub fn close_all(&self, state: impl Into<State>) -> Outcome {
        let state = state.into();
        let first = self.each(state & !receiving(), |g, id, s| g.close(id, s));
        let rest = self.each(state & receiving(), |g, id, s| g.close(id, s));
        if first == Outcome::Fail || rest == Outcome::Fail {
            Outcome::Fail
        } else {
            Outcome::Success
        }
    }

    /// Sends `event` downstream as if `id` had produced it.
    pub fn inject(&self, id: HandlerId, event: Event) -> Result<Outcome> {
        Ok(self.get(id)?.core().produce(event))
    }

    /// Whether anything downstream of `id` would take `event`.
    pub fn accepts(&self, id: HandlerId, event: &Event) -> Result<Tribool> {
        let targets = self.get(id)?.core().targets();
        Ok(Tribool::any(
            targets.iter().filter_map(|t| self.handlers.get(t)).map(|h| h.accepts(event)),
        ))
    }

    /// Whether everything downstream of `id` would take `event`.
    pub fn all_accept(&self, id: HandlerId, event: &Event) -> Result<Tribool> {
        let targets = self.get(id)?.core().targets();
        Ok(Tribool::all(
            targets.iter().filter_map(|t| self.handlers.get(t)).map(|h| h.accepts(event)),
        ))
    }

    /// Builds the handlers and connections of `patch`. Nothing is opened.
    ///
    /// The patch settings fill in `capacity` and `priority` for handlers that do not set them.
    pub fn from_patch(registry: &Registry, patch: &Patch) -> Result<Self> {
        let mut graph = Graph::new(&patch.name);
        graph.settings = patch.settings;
        for spec in &patch.handlers {
            let mut properties = spec.properties.clone();
            if properties.get("capacity").is_none() {
                properties.set("capacity", patch.settings.queue_capacity);
            }
            if properties.get("priority").is_none() {
                properties.set("priority", patch.settings.priority);
            }
            let identity = Identity::new(spec.id, &spec.name).with_group(&spec.group);
            let handler = registry.create(&spec.type_name, identity, &properties)?;
            graph.insert(handler)?;
        }
        for connection in &patch.connections {
            graph.connect_spec(connection.clone())?;
        }
        tracing::info!(
            patch = %patch.name,
            handlers = graph.len(),
            connections = graph.connections.len(),
            "patch loaded"
        );
        Ok(graph)
    }

    pub fn to_patch(&self) -> Patch {
        let mut patch = Patch::new(&self.name);
        patch.settings = self.settings;
        let capacity = self.settings.queue_capacity.to_string();
        let priority = self.settings.priority.to_string();
        patch.handlers = self
            .handlers
            .values()
            .map(|handler| {
                let properties = handler
                    .properties()
                    .iter()
                    .filter(|&(key, value)| match key {
                        "capacity" => value != capacity,
                        "priority" => value != priority,
                        _ => true,
                    })
                    .collect();
                HandlerSpec {
                    type_name: handler.type_name().to_string(),
                    id: handler.id(),
                    name: handler.name().to_string(),
                    group: handler.core().group().to_string(),
                    properties,
                }
            })
            .collect();
        patch.connections = self.connections.clone();
        patch
    }
}

impl Drop for Graph {
    fn drop(&mut self) {
        self.close_all(State::full());
    }
}

impl std::fmt::Debug for Graph {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Graph")
            .field("name", &self.name)
            .field("handlers", &self.handlers.values().collect::<Vec<_>>())
            .field("connections", &self.connections)
            .finish()
    }
}
