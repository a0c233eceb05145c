//! Logging setup for binaries and tests.

use tracing::Dispatch;
use tracing::dispatcher::DefaultGuard;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::fmt::MakeWriter;

/// A configured `tracing` subscriber that is installed explicitly rather than globally.
///
/// Worker threads spawned by the engine inherit whatever dispatcher was current when they were
/// started, so entering the logger on the main thread is enough.
#[derive(Clone)]
pub struct Logger {
    dispatch: Dispatch,
}

impl Logger {
    /// Logs to stderr. `RUST_LOG` overrides `directive`.
    pub fn new(directive: &str) -> Self {
        Self::with_writer(directive, std::io::stderr)
    }

    pub fn with_writer<W>(directive: &str, writer: W) -> Self
    where
        W: for<'w> MakeWriter<'w> + Send + Sync + 'static,
    {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(directive));
        let subscriber = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_writer(writer)
            .with_thread_names(true)
            .with_target(false)
            .finish();
        Self {
            dispatch: Dispatch::new(subscriber),
        }
    }

    pub fn dispatch(&self) -> &Dispatch {
        &self.dispatch
    }

    /// Makes this logger the current thread's default until the guard drops.
    #[must_use = "logging stops when the guard is dropped"]
    pub fn enter(&self) -> DefaultGuard {
        tracing::dispatcher::set_default(&self.dispatch)
    }
}

impl std::fmt::Debug for Logger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Logger").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Channel, Event};
    use crate::handler::{Handler, HandlerId, Identity, Player, StateBit};
    use crate::task::Task;
    use crate::timing::Sequence;
    use std::time::{Duration, Instant};
    use parking_lot::Mutex;
    use std::io;
    use std::sync::Arc;

    #[derive(Clone, Default)]
    struct Capture(Arc<Mutex<Vec<u8>>>);

    impl io::Write for Capture {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl<'w> MakeWriter<'w> for Capture {
        type Writer = Capture;

        fn make_writer(&'w self) -> Self::Writer {
            self.clone()
        }
    }

    impl Capture {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock()).into_owned()
        }
    }

    #[test]
    fn scoped_to_the_guard() {
        let capture = Capture::default();
        let logger = Logger::with_writer("warn", capture.clone());
        {
            let _guard = logger.enter();
            tracing::warn!("inside");
        }
        tracing::warn!("outside");
        let text = capture.text();
        assert!(text.contains("inside"));
        assert!(!text.contains("outside"));
    }

    #[test]
    fn task_workers_inherit_the_logger() {
        let capture = Capture::default();
        let logger = Logger::with_writer("warn", capture.clone());
        let _guard = logger.enter();
        let task = Task::new("logging", 4);
        task.start(|v: u8| tracing::warn!(v, "from worker")).unwrap();
        task.push(42);
        task.stop(false);
        assert!(capture.text().contains("from worker"));
    }

    #[test]
    fn player_thread_inherits_the_logger() {
        let capture = Capture::default();
        let logger = Logger::with_writer("debug", capture.clone());
        let _guard = logger.enter();
        let note = Event::note_on(Channel::from_int_lossy(0), 60, 100).unwrap();
        let player = Player::new(
            Identity::new(HandlerId(1), "player"),
            Arc::new(Sequence::new(96, vec![(0, note)])),
        );
        player.handle_open(StateBit::Forward.into());
        let deadline = Instant::now() + Duration::from_secs(5);
        while player.is_playing() {
            assert!(Instant::now() < deadline, "player never stopped");
            std::thread::sleep(Duration::from_millis(2));
        }
        player.handle_close(StateBit::Forward.into());
        assert!(capture.text().contains("playback finished"));
    }
}
