//! Byte-stream endpoints: anything readable or writable carrying live MIDI bytes.

use super::{Handler, HandlerCore, Identity, Message, ModeBit, Outcome, Properties, State, StateBit};
use crate::error::Result;
use crate::event::{Channel, Event, Family, FamilySet, StreamDecoder, WireMessage};
use crate::task::{DEFAULT_CAPACITY, Priority, Task};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::PathBuf;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

const READ_CHUNK: usize = 256;

/// All notes off, sent to every channel when a reset event reaches an output.
const ALL_NOTES_OFF: u8 = 0x7B;

pub(super) fn task_settings(props: &Properties) -> Result<(usize, Priority)> {
    Ok((
        props.parse_or("capacity", DEFAULT_CAPACITY)?,
        props.parse_or("priority", Priority::Normal)?,
    ))
}

pub(super) fn task_properties(props: &mut Properties, capacity: usize, priority: Priority) {
    if capacity != DEFAULT_CAPACITY {
        props.set("capacity", capacity);
    }
    if priority != Priority::Normal {
        props.set("priority", priority);
    }
}

enum Source {
    Path(PathBuf),
    Reader(Mutex<Option<Box<dyn Read + Send>>>),
}

/// Reads live bytes on a blocking thread and forwards the decoded events.
///
/// Decoding happens on the read thread; forwarding runs on a [`Task`] worker so a slow graph
/// never stalls the device. Malformed input is logged and skipped. At end of stream the pending
/// events are delivered and the handler closes itself.
pub struct RawInput {
    core: Arc<HandlerCore>,
    source: Source,
    task: Arc<Task<Message>>,
    priority: Priority,
    session: Arc<Mutex<u64>>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

/// What a read thread needs from the open that spawned it.
///
/// A read left blocked by a close can wake up after the handler was opened again; it then finds
/// `current` moved past `id` and leaves the new run alone.
struct Session {
    id: u64,
    current: Arc<Mutex<u64>>,
    core: Arc<HandlerCore>,
    task: Arc<Task<Message>>,
}

impl Session {
    /// Queues `message` unless this session is over.
    fn push(&self, message: Message) -> bool {
        let current = self.current.lock();
        *current == self.id && self.task.push(message)
    }

    /// End of stream: deliver what is queued and close, unless a newer open owns the handler.
    fn finish(&self) {
        let current = self.current.lock();
        if *current != self.id {
            return;
        }
        self.task.stop(false);
        self.core.deactivate_state(StateBit::Forward);
    }
}

impl RawInput {
    pub const TYPE: &'static str = "raw-input";

    fn build(identity: Identity, source: Source, capacity: usize, priority: Priority) -> Self {
        let task =
            Task::new(format!("{}-forward", identity.name), capacity).with_priority(priority);
        Self {
            core: Arc::new(identity.core(ModeBit::Out.into())),
            source,
            task: Arc::new(task),
            priority,
            session: Arc::new(Mutex::new(0)),
            reader: Mutex::new(None),
        }
    }

    /// Reads from `path` each time the handler is opened.
    pub fn open_path(identity: Identity, path: impl Into<PathBuf>) -> Self {
        Self::build(identity, Source::Path(path.into()), DEFAULT_CAPACITY, Priority::Normal)
    }

    /// Reads from `reader`. It is consumed by the first open.
    pub fn with_reader(identity: Identity, reader: Box<dyn Read + Send>) -> Self {
        Self::build(
            identity,
            Source::Reader(Mutex::new(Some(reader))),
            DEFAULT_CAPACITY,
            Priority::Normal,
        )
    }

    /// Reads `path`, plus optional `capacity` and `priority` for the forwarding task.
    pub fn from_properties(identity: Identity, props: &Properties) -> Result<Self> {
        let path = PathBuf::from(props.require("path")?);
        let (capacity, priority) = task_settings(props)?;
        Ok(Self::build(identity, Source::Path(path), capacity, priority))
    }

    /// Messages lost because the forwarding queue overflowed.
    pub fn dropped(&self) -> u64 {
        self.task.dropped()
    }

    fn open_source(&self) -> io::Result<Box<dyn Read + Send>> {
        match &self.source {
            Source::Path(path) => Ok(Box::new(File::open(path)?)),
            Source::Reader(reader) => reader.lock().take().ok_or_else(|| {
                io::Error::new(io::ErrorKind::NotFound, "reader already consumed")
            }),
        }
    }

    fn stop(&self) {
        *self.session.lock() += 1;
        self.task.stop(true);
        if let Some(handle) = self.reader.lock().take() {
            if handle.is_finished() {
                let _ = handle.join();
            } else {
                tracing::debug!(handler = %self.core.id(), "read thread left blocked in read");
            }
        }
    }
}

fn read_loop(mut source: Box<dyn Read + Send>, session: Session) {
    let id = session.core.id();
    let mut decoder = StreamDecoder::new();
    let mut buf = [0u8; READ_CHUNK];
    let mut open = true;
    while open {
        let n = match source.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::warn!(handler = %id, error = %e, "read failed");
                break;
            }
        };
        decoder.feed(&buf[..n], |decoded| match decoded {
            Ok(event) => open &= session.push(Message::from_source(event, id)),
            Err(e) => tracing::warn!(handler = %id, error = %e, "discarding malformed input"),
        });
    }
    if !open {
        return;
    }
    if decoder.pending() > 0 {
        tracing::warn!(handler = %id, bytes = decoder.pending(), "stream ended inside a message");
    }
    session.finish();
    tracing::debug!(handler = %id, "input reached end of stream");
}

impl Handler for RawInput {
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
        let mut props = Properties::new();
        if let Source::Path(path) = &self.source {
            props.set("path", path.display());
        }
        task_properties(&mut props, self.task.capacity(), self.priority);
        props
    }

    fn handle_message(&self, _message: &Message) -> Outcome {
        Outcome::Unhandled
    }

    fn handle_open(&self, state: State) -> Outcome {
        if !state.test(StateBit::Forward) {
            return Outcome::Success;
        }
        self.stop();
        let source = match self.open_source() {
            Ok(source) => source,
            Err(e) => {
                tracing::error!(handler = %self.core.id(), error = %e, "cannot open input");
                return Outcome::Fail;
            }
        };
        let mut current = self.session.lock();
        *current += 1;
        let session = Session {
            id: *current,
            current: Arc::clone(&self.session),
            core: Arc::clone(&self.core),
            task: Arc::clone(&self.task),
        };
        self.core.activate_state(StateBit::Forward);

        let core = Arc::clone(&self.core);
        if let Err(e) = self.task.start(move |message: Message| {
            core.forward(&message);
        }) {
            tracing::error!(handler = %self.core.id(), error = %e, "cannot start input task");
            self.core.deactivate_state(StateBit::Forward);
            return Outcome::Fail;
        }

        let dispatch = tracing::dispatcher::get_default(|d| d.clone());
        let spawned = thread::Builder::new()
            .name(format!("{}-read", self.core.name()))
            .spawn(move || {
                tracing::dispatcher::with_default(&dispatch, || read_loop(source, session))
            });
        drop(current);
        match spawned {
            Ok(handle) => {
                *self.reader.lock() = Some(handle);
                Outcome::Success
            }
            Err(e) => {
                tracing::error!(handler = %self.core.id(), error = %e, "cannot start read thread");
                self.task.stop(true);
                self.core.deactivate_state(StateBit::Forward);
                Outcome::Fail
            }
        }
    }

    fn handle_close(&self, state: State) -> Outcome {
        if state.test(StateBit::Forward) {
            self.core.deactivate_state(StateBit::Forward);
            self.stop();
        }
        Outcome::Success
    }
}

impl Drop for RawInput {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Bytes written to a device for `event`, with reset turned into all-notes-off.
pub(super) fn output_messages(event: &Event) -> Result<Vec<WireMessage>> {
    if event.is(Family::Reset) {
        Ok(Event::controller(Channel::every(), ALL_NOTES_OFF, 0)?.wire_messages())
    } else {
        Ok(event.wire_messages())
    }
}

type SharedWriter = Arc<Mutex<Box<dyn Write + Send>>>;

enum Sink {
    Path(PathBuf),
    Writer(SharedWriter),
}

/// Writes events as live bytes through a buffering [`Task`].
///
/// Multi-channel events are written once per channel; a reset event becomes all-notes-off on
/// every channel. Closing delivers whatever is still queued.
pub struct RawOutput {
    core: HandlerCore,
    sink: Sink,
    task: Task<WireMessage>,
    priority: Priority,
}

impl RawOutput {
    pub const TYPE: &'static str = "raw-output";

    /// Everything a live stream can carry, plus reset.
    pub fn families() -> FamilySet {
        Family::every() & !FamilySet::from(Family::Meta)
    }

    fn build(identity: Identity, sink: Sink, capacity: usize, priority: Priority) -> Self {
        let task = Task::new(format!("{}-write", identity.name), capacity).with_priority(priority);
        Self {
            core: identity.core(ModeBit::In.into()),
            sink,
            task,
            priority,
        }
    }

    /// Appends to `path`, creating it if needed, each time the handler is opened.
    pub fn open_path(identity: Identity, path: impl Into<PathBuf>) -> Self {
        Self::build(identity, Sink::Path(path.into()), DEFAULT_CAPACITY, Priority::Normal)
    }

    pub fn with_writer(identity: Identity, writer: Box<dyn Write + Send>) -> Self {
        Self::build(
            identity,
            Sink::Writer(Arc::new(Mutex::new(writer))),
            DEFAULT_CAPACITY,
            Priority::Normal,
        )
    }

    /// Reads `path`, plus optional `capacity` and `priority` for the write task.
    pub fn from_properties(identity: Identity, props: &Properties) -> Result<Self> {
        let path = PathBuf::from(props.require("path")?);
        let (capacity, priority) = task_settings(props)?;
        Ok(Self::build(identity, Sink::Path(path), capacity, priority))
    }

    /// Buffers lost because the write queue overflowed.
    pub fn dropped(&self) -> u64 {
        self.task.dropped()
    }

    fn open_sink(&self) -> io::Result<SharedWriter> {
        match &self.sink {
            Sink::Path(path) => {
                let file = OpenOptions::new().create(true).append(true).open(path)?;
                Ok(Arc::new(Mutex::new(Box::new(file))))
            }
            Sink::Writer(writer) => Ok(Arc::clone(writer)),
        }
    }
}

impl Handler for RawOutput {
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
        let mut props = Properties::new();
        if let Sink::Path(path) = &self.sink {
            props.set("path", path.display());
        }
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
        if !state.test(StateBit::Receive) {
            return Outcome::Success;
        }
        let writer = match self.open_sink() {
            Ok(writer) => writer,
            Err(e) => {
                tracing::error!(handler = %self.core.id(), error = %e, "cannot open output");
                return Outcome::Fail;
            }
        };
        let id = self.core.id();
        let started = self.task.start(move |bytes: WireMessage| {
            let mut writer = writer.lock();
            if let Err(e) = writer.write_all(&bytes).and_then(|()| writer.flush()) {
                tracing::warn!(handler = %id, error = %e, "write failed");
            }
        });
        match started {
            Ok(_) => {
                self.core.activate_state(StateBit::Receive);
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
    use crate::event::Channels;
    use crate::handler::HandlerId;
    use crate::handler::tests::Tap;
    use crossbeam::channel::{self, Receiver, Sender};
    use std::io::Cursor;
    use std::time::{Duration, Instant};

    #[derive(Clone, Default)]
    struct SharedBuf(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.lock().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    /// Blocks in `read` until a chunk arrives. The stream ends when the sender is dropped.
    struct Gated {
        chunks: Receiver<Vec<u8>>,
        done: Sender<()>,
    }

    impl Read for Gated {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            let Ok(chunk) = self.chunks.recv() else {
                return Ok(0);
            };
            let n = chunk.len().min(buf.len());
            buf[..n].copy_from_slice(&chunk[..n]);
            Ok(n)
        }
    }

    impl Drop for Gated {
        fn drop(&mut self) {
            let _ = self.done.send(());
        }
    }

    fn gated() -> (Box<dyn Read + Send>, Sender<Vec<u8>>, Receiver<()>) {
        let (chunks_tx, chunks) = channel::unbounded();
        let (done, done_rx) = channel::unbounded();
        (Box::new(Gated { chunks, done }), chunks_tx, done_rx)
    }

    fn ch(i: u8) -> Channel {
        Channel::new(i).unwrap()
    }

    fn wait_closed(input: &RawInput) {
        let deadline = Instant::now() + Duration::from_secs(5);
        while input.state().test(StateBit::Forward) {
            assert!(Instant::now() < deadline, "input never closed");
            thread::sleep(Duration::from_millis(2));
        }
    }

    #[test]
    fn input_decodes_and_closes_at_end_of_stream() {
        let bytes = vec![0x90, 0x3C, 0x64, 0x3E, 0x64, 0xF8, 0x42, 0x80, 0x3C, 0x00];
        let input = RawInput::with_reader(
            Identity::new(HandlerId(1), "in"),
            Box::new(Cursor::new(bytes)),
        );
        let tap = Tap::new(2, ModeBit::In.into());
        let tap_dyn: Arc<dyn Handler> = tap.clone();
        input.core().connect(&tap_dyn);
        tap.handle_open(StateBit::Receive.into());

        assert_eq!(input.handle_open(StateBit::Forward.into()), Outcome::Success);
        wait_closed(&input);

        let seen: Vec<_> = tap.seen.lock().iter().map(|m| m.event.clone()).collect();
        assert_eq!(
            seen,
            [
                Event::note_on(ch(0), 60, 100).unwrap(),
                Event::note_on(ch(0), 62, 100).unwrap(),
                Event::system(0xF8, &[]).unwrap(),
                Event::note_off(ch(0), 60, 0).unwrap(),
            ]
        );
        assert!(tap.seen.lock().iter().all(|m| m.source == Some(HandlerId(1))));

        // The reader was consumed by the first open.
        assert_eq!(input.handle_open(StateBit::Forward.into()), Outcome::Fail);
        assert!(input.state().is_empty());
    }

    #[test]
    fn stale_reader_leaves_the_next_open_alone() {
        let (first, first_tx, first_done) = gated();
        let input = RawInput::with_reader(Identity::new(HandlerId(1), "in"), first);
        let tap = Tap::new(2, ModeBit::In.into());
        let tap_dyn: Arc<dyn Handler> = tap.clone();
        input.core().connect(&tap_dyn);
        tap.handle_open(StateBit::Receive.into());

        assert_eq!(input.handle_open(StateBit::Forward.into()), Outcome::Success);
        assert_eq!(input.handle_close(StateBit::Forward.into()), Outcome::Success);

        let (second, second_tx, _second_done) = gated();
        if let Source::Reader(reader) = &input.source {
            *reader.lock() = Some(second);
        }
        assert_eq!(input.handle_open(StateBit::Forward.into()), Outcome::Success);

        // The first read only returns now, then its stream ends.
        first_tx.send(vec![0x90, 60, 100]).unwrap();
        drop(first_tx);
        first_done.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(input.state().test(StateBit::Forward));
        assert!(input.task.is_running());
        assert!(tap.seen.lock().is_empty());

        second_tx.send(vec![0x90, 62, 100]).unwrap();
        drop(second_tx);
        wait_closed(&input);
        let seen: Vec<_> = tap.seen.lock().iter().map(|m| m.event.clone()).collect();
        assert_eq!(seen, [Event::note_on(ch(0), 62, 100).unwrap()]);
    }

    #[test]
    fn output_fans_out_and_flushes_on_close() {
        let sink = SharedBuf::default();
        let output =
            RawOutput::with_writer(Identity::new(HandlerId(1), "out"), Box::new(sink.clone()));
        let chord = Event::note_on(Channels::fuse([ch(0), ch(3)]), 60, 100).unwrap();
        assert_eq!(output.send_message(&Message::new(chord.clone())), Outcome::Closed);

        output.handle_open(StateBit::Receive.into());
        assert_eq!(output.send_message(&Message::new(chord)), Outcome::Success);
        let sysex = Event::sysex(&[0x7E, 0x01]).unwrap();
        output.send_message(&Message::new(sysex));
        let meta = Event::tempo(500_000).unwrap();
        assert_eq!(output.send_message(&Message::new(meta)), Outcome::Unhandled);
        output.handle_close(StateBit::Receive.into());

        assert_eq!(
            *sink.0.lock(),
            [0x90, 60, 100, 0x93, 60, 100, 0xF0, 0x7E, 0x01, 0xF7]
        );
        assert_eq!(
            output.send_message(&Message::new(Event::reset())),
            Outcome::Closed
        );
    }

    #[test]
    fn reset_becomes_all_notes_off() {
        let sink = SharedBuf::default();
        let output =
            RawOutput::with_writer(Identity::new(HandlerId(1), "out"), Box::new(sink.clone()));
        output.handle_open(StateBit::Receive.into());
        output.send_message(&Message::new(Event::reset()));
        output.handle_close(StateBit::Receive.into());

        let written = sink.0.lock().clone();
        assert_eq!(written.len(), 16 * 3);
        for (i, chunk) in written.chunks(3).enumerate() {
            assert_eq!(chunk, [0xB0 | i as u8, 0x7B, 0]);
        }
    }

    #[test]
    fn file_endpoints_from_properties() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("port.mid");
        let props = Properties::new()
            .with("path", path.display())
            .with("capacity", 8)
            .with("priority", "low");
        let output =
            RawOutput::from_properties(Identity::new(HandlerId(1), "out"), &props).unwrap();
        assert_eq!(output.properties(), props);

        output.handle_open(StateBit::Receive.into());
        output.send_message(&Message::new(Event::program_change(ch(2), 5).unwrap()));
        output.handle_close(StateBit::Receive.into());
        assert_eq!(std::fs::read(&path).unwrap(), [0xC2, 5]);

        let input = RawInput::from_properties(
            Identity::new(HandlerId(2), "in"),
            &Properties::new().with("path", path.display()),
        )
        .unwrap();
        assert_eq!(input.properties().get("path"), Some(path.display().to_string().as_str()));
        let missing =
            RawInput::from_properties(Identity::new(HandlerId(3), "x"), &Properties::new());
        assert!(missing.is_err());
    }
}
