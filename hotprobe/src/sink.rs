//! Probe Sink: where probe events end up
//!
//! Injected calls land in [`ProbeRecorder::on_start`] / [`ProbeRecorder::on_end`],
//! which stamp the wall-clock time and hand the event to a [`ProbeSink`].

use crossbeam_channel::{bounded, unbounded, Sender};
use hotprobe_common::{Phase, ProbeEvent};
use log::warn;
use std::io::Write;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Destination for probe events. Called from arbitrary application threads.
pub trait ProbeSink: Send + Sync {
    fn record(&self, event: &ProbeEvent);

    fn flush(&self) {}
}

/// Writes one line per event, serialized by a mutex and flushed per event
pub struct LineSink<W: Write + Send> {
    out: Mutex<W>,
    warned: AtomicBool,
}

impl<W: Write + Send> LineSink<W> {
    pub fn new(out: W) -> Self {
        Self { out: Mutex::new(out), warned: AtomicBool::new(false) }
    }

    /// Give back the writer
    pub fn into_inner(self) -> W {
        self.out.into_inner().unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    fn report(&self, e: &std::io::Error) {
        // Once only, a broken output would otherwise log on every probe hit
        if !self.warned.swap(true, Ordering::Relaxed) {
            warn!("probe output failed, events are being dropped: {e}");
        }
    }
}

impl<W: Write + Send> ProbeSink for LineSink<W> {
    fn record(&self, event: &ProbeEvent) {
        if let Ok(mut out) = self.out.lock() {
            if let Err(e) = writeln!(out, "{event}").and_then(|()| out.flush()) {
                self.report(&e);
            }
        }
    }

    fn flush(&self) {
        if let Ok(mut out) = self.out.lock() {
            if let Err(e) = out.flush() {
                self.report(&e);
            }
        }
    }
}

/// Work for the writer thread
enum Message {
    Event(ProbeEvent),
    /// Flush the writer, then acknowledge
    Flush(Sender<()>),
}

/// How long [`ChannelSink::flush`] waits for the writer to catch up
const FLUSH_TIMEOUT: Duration = Duration::from_secs(5);

/// Hands events to a writer thread through an unbounded channel, so probe
/// calls never block on I/O. Events from one thread keep their order.
pub struct ChannelSink {
    tx: Option<Sender<Message>>,
    worker: Option<JoinHandle<()>>,
}

impl ChannelSink {
    pub fn new<W: Write + Send + 'static>(out: W) -> Self {
        let (tx, rx) = unbounded::<Message>();
        let worker = std::thread::Builder::new()
            .name("hotprobe-sink".to_string())
            .spawn(move || {
                let lines = LineSink::new(out);
                for message in rx {
                    match message {
                        Message::Event(event) => lines.record(&event),
                        Message::Flush(done) => {
                            lines.flush();
                            let _ = done.send(());
                        }
                    }
                }
                lines.flush();
            });

        match worker {
            Ok(worker) => Self { tx: Some(tx), worker: Some(worker) },
            Err(e) => {
                warn!("cannot start sink thread, events will be dropped: {e}");
                Self { tx: None, worker: None }
            }
        }
    }
}

impl ProbeSink for ChannelSink {
    fn record(&self, event: &ProbeEvent) {
        if let Some(ref tx) = self.tx {
            // Only fails once the worker is gone
            let _ = tx.send(Message::Event(event.clone()));
        }
    }

    /// Blocks until every event queued before the call is written
    fn flush(&self) {
        let Some(ref tx) = self.tx else {
            return;
        };
        let (done_tx, done_rx) = bounded(1);
        if tx.send(Message::Flush(done_tx)).is_err() {
            return;
        }
        if let Err(e) = done_rx.recv_timeout(FLUSH_TIMEOUT) {
            warn!("event output not drained: {e}");
        }
    }
}

impl Drop for ChannelSink {
    fn drop(&mut self) {
        // Closing the channel ends the worker loop after it drains
        self.tx.take();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Keeps events in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ProbeEvent>>>,
}

impl MemorySink {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Snapshot of everything recorded so far
    #[must_use]
    pub fn events(&self) -> Vec<ProbeEvent> {
        self.events.lock().map(|e| e.clone()).unwrap_or_default()
    }
}

impl ProbeSink for MemorySink {
    fn record(&self, event: &ProbeEvent) {
        if let Ok(mut events) = self.events.lock() {
            events.push(event.clone());
        }
    }
}

/// Milliseconds since the Unix epoch; 0 if the clock is before it
#[must_use]
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
}

/// Turns probe calls into timestamped events
pub struct ProbeRecorder {
    sink: Box<dyn ProbeSink>,
    clock: fn() -> u64,
}

impl ProbeRecorder {
    pub fn new(sink: impl ProbeSink + 'static) -> Self {
        Self::with_clock(sink, now_millis)
    }

    pub fn with_clock(sink: impl ProbeSink + 'static, clock: fn() -> u64) -> Self {
        Self { sink: Box::new(sink), clock }
    }

    pub fn on_start(&self, unit: &str, method: &str) {
        self.emit(unit, method, Phase::Start);
    }

    pub fn on_end(&self, unit: &str, method: &str) {
        self.emit(unit, method, Phase::End);
    }

    fn emit(&self, unit: &str, method: &str, phase: Phase) {
        self.sink.record(&ProbeEvent::new(unit, method, phase, (self.clock)()));
    }

    pub fn flush(&self) {
        self.sink.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_sink_format() {
        let sink = LineSink::new(Vec::new());
        sink.record(&ProbeEvent::new("Sample", "run", Phase::Start, 10));
        sink.record(&ProbeEvent::new("Sample", "run", Phase::End, 12));
        let out = String::from_utf8(sink.into_inner()).unwrap();
        assert_eq!(out, "Sample\trun\tstart\t10\nSample\trun\tend\t12\n");
    }

    #[test]
    fn test_recorder_stamps_with_clock() {
        let memory = MemorySink::new();
        let recorder = ProbeRecorder::with_clock(memory.clone(), || 7);
        recorder.on_start("a/B", "c");
        recorder.on_end("a/B", "c");
        assert_eq!(
            memory.events(),
            vec![ProbeEvent::new("a/B", "c", Phase::Start, 7), ProbeEvent::new("a/B", "c", Phase::End, 7)]
        );
    }

    #[test]
    fn test_wall_clock_is_monotonic_enough() {
        let memory = MemorySink::new();
        let recorder = ProbeRecorder::new(memory.clone());
        recorder.on_start("Sample", "run");
        recorder.on_end("Sample", "run");
        let events = memory.events();
        assert!(events[1].timestamp_millis >= events[0].timestamp_millis);
        assert!(events[0].timestamp_millis > 1_600_000_000_000);
    }

    #[test]
    fn test_channel_sink_drains_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        {
            let sink = ChannelSink::new(std::fs::File::create(&path).unwrap());
            for i in 0..100 {
                sink.record(&ProbeEvent::new("Loop", "tick", Phase::Start, i));
            }
        }
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 100);
        assert_eq!(lines[99], "Loop\ttick\tstart\t99");
    }

    #[test]
    fn test_channel_sink_flush_drains_without_drop() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let sink = ChannelSink::new(std::fs::File::create(&path).unwrap());
        for i in 0..10_000 {
            sink.record(&ProbeEvent::new("Burst", "run", Phase::Start, i));
            sink.record(&ProbeEvent::new("Burst", "run", Phase::End, i));
        }
        sink.flush();

        let text = std::fs::read_to_string(&path).unwrap();
        assert_eq!(text.lines().count(), 20_000);
        assert_eq!(text.lines().last(), Some("Burst\trun\tend\t9999"));

        // Still usable after a flush
        sink.record(&ProbeEvent::new("Burst", "run", Phase::Start, 10_000));
        sink.flush();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 20_001);
    }

    #[test]
    fn test_recorder_flush_reaches_channel_sink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("events.log");
        let recorder = ProbeRecorder::new(ChannelSink::new(std::fs::File::create(&path).unwrap()));
        for _ in 0..500 {
            recorder.on_start("app/Main", "run");
            recorder.on_end("app/Main", "run");
        }
        recorder.flush();
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1000);
        // Dropping after a flush must not block or duplicate
        drop(recorder);
        assert_eq!(std::fs::read_to_string(&path).unwrap().lines().count(), 1000);
    }
}
