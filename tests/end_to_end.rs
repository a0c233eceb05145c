use midilab::handler::{Identity, RawInput, RawOutput, Recorder};
use midilab::{Channel, Event, Graph, Handler, HandlerId, State, StateBit, Task};
use parking_lot::Mutex;
use std::io::{self, Cursor, Write};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

#[test]
fn note_on_survives_codec_and_task() {
    let original = Event::note_on(Channel::new(0).unwrap(), 60, 100).unwrap();
    let bytes = original.to_bytes().unwrap();
    assert_eq!(bytes, [0x90, 0x3C, 0x64]);
    let decoded = Event::from_bytes(&bytes).unwrap();
    assert_eq!(decoded, original);

    let task = Task::new("end-to-end", 4);
    let (tx, rx) = crossbeam::channel::unbounded();
    task.start(move |event: Event| tx.send(event).unwrap()).unwrap();
    assert!(task.push(decoded));
    task.stop(false);
    assert!(!task.push(original.clone()));

    let received: Vec<_> = rx.try_iter().collect();
    assert_eq!(received, [original]);
}

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

#[test]
fn bytes_in_bytes_out() {
    let input_bytes = vec![
        0x90, 0x3C, 0x64, // note on
        0x3E, 0x64, // running status
        0xF0, 0x7D, 0x01, 0xF7, // sysex
        0xB1, 0x07, 0x50, // controller, channel 1
    ];
    let sink = SharedBuf::default();

    let mut graph = Graph::new("pipe");
    let input = Arc::new(RawInput::with_reader(
        Identity::new(HandlerId(1), "in"),
        Box::new(Cursor::new(input_bytes.clone())),
    ));
    let recorder = Arc::new(Recorder::new(Identity::new(HandlerId(2), "tape")));
    graph.insert(input.clone()).unwrap();
    graph.insert(recorder.clone()).unwrap();
    graph
        .insert(Arc::new(RawOutput::with_writer(
            Identity::new(HandlerId(3), "out"),
            Box::new(sink.clone()),
        )))
        .unwrap();
    graph.connect(HandlerId(1), HandlerId(2)).unwrap();
    graph.connect(HandlerId(1), HandlerId(3)).unwrap();

    graph.open_all(State::io());
    let deadline = Instant::now() + Duration::from_secs(5);
    while input.state().test(StateBit::Forward) {
        assert!(Instant::now() < deadline, "input never finished");
        thread::sleep(Duration::from_millis(2));
    }
    graph.close_all(State::full());

    assert_eq!(recorder.len(), 4);
    let mut expected = input_bytes;
    // Running status is expanded on the way out.
    expected.insert(3, 0x90);
    assert_eq!(*sink.0.lock(), expected);
}
