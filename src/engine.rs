//! The engine thread: owns the graph and applies commands sent from other threads.

use crate::error::{Error, Result};
use crate::event::Event;
use crate::graph::Graph;
use crate::handler::{HandlerId, Outcome, Registry, State};
use crate::patch::Patch;
use crossbeam::channel::{Receiver, Sender};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};

#[derive(Debug, Clone)]
pub enum EngineCommand {
    LoadPatch(PathBuf),
    ApplyPatch(Patch),
    SavePatch(PathBuf),
    Open { id: HandlerId, state: State },
    Close { id: HandlerId, state: State },
    OpenAll(State),
    CloseAll(State),
    Inject { id: HandlerId, event: Event },
    Shutdown,
}

#[derive(Debug, Clone)]
pub enum EngineUpdate {
    PatchLoaded { patch: Patch },
    PatchSaved { path: PathBuf },
    StateChanged { id: HandlerId, state: State },
    Injected { id: HandlerId, outcome: Outcome },
    Error { message: String },
    Stopped,
}

pub struct EngineHandle {
    pub command_tx: Sender<EngineCommand>,
    pub update_rx: Receiver<EngineUpdate>,
    thread: Option<JoinHandle<()>>,
}

impl EngineHandle {
    /// Queues `command`. Returns `false` once the engine has stopped.
    pub fn send(&self, command: EngineCommand) -> bool {
        self.command_tx.send(command).is_ok()
    }

    /// Stops the engine, closing every handler, and waits for its thread.
    pub fn shutdown(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        let _ = self.command_tx.send(EngineCommand::Shutdown);
        if let Some(handle) = self.thread.take()
            && handle.join().is_err()
        {
            tracing::error!("engine thread panicked");
        }
    }
}

impl Drop for EngineHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Starts the engine thread. Handlers are created through `registry`.
pub fn spawn_engine(registry: Registry) -> Result<EngineHandle> {
    let (command_tx, command_rx) = crossbeam::channel::unbounded();
    let (update_tx, update_rx) = crossbeam::channel::unbounded();

    let dispatch = tracing::dispatcher::get_default(|d| d.clone());
    let thread = thread::Builder::new()
        .name("engine".into())
        .spawn(move || {
            tracing::dispatcher::with_default(&dispatch, || {
                engine_thread(registry, command_rx, update_tx);
            })
        })
        .map_err(Error::Spawn)?;

    Ok(EngineHandle {
        command_tx,
        update_rx,
        thread: Some(thread),
    })
}

struct EngineState {
    registry: Registry,
    graph: Option<Graph>,
    updates: Sender<EngineUpdate>,
}

impl EngineState {
    fn send(&self, update: EngineUpdate) {
        let _ = self.updates.send(update);
    }

    fn report(&self, context: &str, error: Error) {
        tracing::error!(error = %error, "{context}");
        self.send(EngineUpdate::Error {
            message: format!("{context}: {error}"),
        });
    }

    fn graph(&self) -> Result<&Graph> {
        self.graph.as_ref().ok_or(Error::NoPatch)
    }

    fn apply(&mut self, patch: Patch) {
        match Graph::from_patch(&self.registry, &patch) {
            Ok(graph) => {
                // The previous graph closes its handlers as it drops.
                self.graph = Some(graph);
                self.send(EngineUpdate::PatchLoaded { patch });
            }
            Err(e) => self.report("failed to apply patch", e),
        }
    }

    fn states(&self, ids: impl IntoIterator<Item = HandlerId>) {
        let Some(graph) = &self.graph else {
            return;
        };
        for id in ids {
            if let Some(handler) = graph.handler(id) {
                self.send(EngineUpdate::StateChanged {
                    id,
                    state: handler.state(),
                });
            }
        }
    }

    fn all_ids(&self) -> Vec<HandlerId> {
        self.graph
            .iter()
            .flat_map(|g| g.handlers().map(|h| h.id()))
            .collect()
    }

    fn handle(&mut self, command: EngineCommand) -> Result<()> {
        match command {
            EngineCommand::LoadPatch(path) => {
                let patch = Patch::load(&path)?;
                self.apply(patch);
            }
            EngineCommand::ApplyPatch(patch) => self.apply(patch),
            EngineCommand::SavePatch(path) => {
                self.graph()?.to_patch().save(&path)?;
                self.send(EngineUpdate::PatchSaved { path });
            }
            EngineCommand::Open { id, state } => {
                self.graph()?.open(id, state)?;
                self.states([id]);
            }
            EngineCommand::Close { id, state } => {
                self.graph()?.close(id, state)?;
                self.states([id]);
            }
            EngineCommand::OpenAll(state) => {
                self.graph()?.open_all(state);
                self.states(self.all_ids());
            }
            EngineCommand::CloseAll(state) => {
                self.graph()?.close_all(state);
                self.states(self.all_ids());
            }
            EngineCommand::Inject { id, event } => {
                let outcome = self.graph()?.inject(id, event)?;
                self.send(EngineUpdate::Injected { id, outcome });
            }
            EngineCommand::Shutdown => {}
        }
        Ok(())
    }
}

fn engine_thread(
    registry: Registry,
    command_rx: Receiver<EngineCommand>,
    update_tx: Sender<EngineUpdate>,
) {
    let mut state = EngineState {
        registry,
        graph: None,
        updates: update_tx,
    };
    tracing::debug!("engine started");

    loop {
        match command_rx.recv() {
            Ok(EngineCommand::Shutdown) | Err(crossbeam::channel::RecvError) => break,
            Ok(command) => {
                let name = command_name(&command);
                if let Err(e) = state.handle(command) {
                    state.report(&format!("{name} failed"), e);
                }
            }
        }
    }

    state.graph = None;
    state.send(EngineUpdate::Stopped);
    tracing::debug!("engine stopped");
}

fn command_name(command: &EngineCommand) -> &'static str {
    match command {
        EngineCommand::LoadPatch(_) => "load patch",
        EngineCommand::ApplyPatch(_) => "apply patch",
        EngineCommand::SavePatch(_) => "save patch",
        EngineCommand::Open { .. } => "open",
        EngineCommand::Close { .. } => "close",
        EngineCommand::OpenAll(_) => "open all",
        EngineCommand::CloseAll(_) => "close all",
        EngineCommand::Inject { .. } => "inject",
        EngineCommand::Shutdown => "shutdown",
    }
}
