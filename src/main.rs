use clap::Parser;
use midilab::handler::{DeviceFactory, HandlerFactory, SystemInputs, SystemOutputs};
use midilab::{EngineCommand, EngineUpdate, Logger, Registry, State, spawn_engine};
use std::path::PathBuf;
use std::process::ExitCode;

/// Runs a MIDI routing patch until Enter is pressed.
#[derive(Parser, Debug)]
#[command(name = "midilab", version)]
struct Args {
    /// Patch file (RON) to load and open.
    patch: Option<PathBuf>,

    /// List system MIDI ports and exit.
    #[arg(long)]
    list_devices: bool,

    /// List handler types and exit.
    #[arg(long)]
    list_types: bool,

    /// Default log filter. RUST_LOG takes precedence.
    #[arg(long, default_value = "info", env = "MIDILAB_LOG")]
    log: String,
}

fn main() -> ExitCode {
    let args = Args::parse();
    let logger = Logger::new(&args.log);
    let _guard = logger.enter();
    let registry = Registry::with_builtins();

    if args.list_devices {
        println!("Inputs:");
        for name in SystemInputs.available() {
            println!("  {name}");
        }
        println!("Outputs:");
        for name in SystemOutputs.available() {
            println!("  {name}");
        }
        return ExitCode::SUCCESS;
    }
    if args.list_types {
        for factory in registry.factories() {
            println!("{:<16} {}", factory.identifier(), factory.description());
        }
        return ExitCode::SUCCESS;
    }
    let Some(patch) = args.patch else {
        eprintln!("no patch given; see --help");
        return ExitCode::FAILURE;
    };

    let engine = match spawn_engine(registry) {
        Ok(engine) => engine,
        Err(e) => {
            tracing::error!(error = %e, "cannot start engine");
            return ExitCode::FAILURE;
        }
    };
    engine.send(EngineCommand::LoadPatch(patch));
    match engine.update_rx.recv() {
        Ok(EngineUpdate::PatchLoaded { patch }) => {
            tracing::info!(patch = %patch.name, handlers = patch.handlers.len(), "running");
        }
        Ok(EngineUpdate::Error { message }) => {
            eprintln!("{message}");
            return ExitCode::FAILURE;
        }
        _ => return ExitCode::FAILURE,
    }
    engine.send(EngineCommand::OpenAll(State::io()));

    let updates = engine.update_rx.clone();
    let dispatch = logger.dispatch().clone();
    std::thread::spawn(move || {
        tracing::dispatcher::with_default(&dispatch, || {
            for update in updates {
                match update {
                    EngineUpdate::StateChanged { id, state } => {
                        tracing::info!(handler = %id, ?state, "state");
                    }
                    EngineUpdate::Error { message } => tracing::warn!("{message}"),
                    EngineUpdate::Stopped => break,
                    _ => {}
                }
            }
        })
    });

    println!("Running. Press Enter to quit.");
    let mut line = String::new();
    let _ = std::io::stdin().read_line(&mut line);
    engine.shutdown();
    ExitCode::SUCCESS
}
