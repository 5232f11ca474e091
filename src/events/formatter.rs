//! Formatters: the sinks that headless events are written to.

use std::io::{self, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use super::event::{EventRecord, HeadlessEvent};
use crate::error::Result;

/// A sink for headless events. One formatter consumes a run.
pub trait Formatter: Send {
    fn write_event(&mut self, record: &EventRecord) -> Result<()>;

    /// Flush any buffered output. Called once at run end.
    fn finalize(&mut self) -> Result<()> {
        Ok(())
    }
}

/// One JSON object per line.
pub struct JsonLinesFormatter<W: Write + Send> {
    writer: W,
}

impl<W: Write + Send> JsonLinesFormatter<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl JsonLinesFormatter<io::Stdout> {
    pub fn stdout() -> Self {
        Self::new(io::stdout())
    }
}

impl<W: Write + Send> Formatter for JsonLinesFormatter<W> {
    fn write_event(&mut self, record: &EventRecord) -> Result<()> {
        let line = serde_json::to_string(record)?;
        writeln!(self.writer, "{}", line)?;
        self.writer.flush()?;
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.writer.flush()?;
        Ok(())
    }
}

/// Forwards every event to several formatters.
///
/// All sinks are attempted; the first error is returned.
#[derive(Default)]
pub struct FanOutFormatter {
    sinks: Vec<Box<dyn Formatter>>,
}

impl FanOutFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, sink: impl Formatter + 'static) -> Self {
        self.sinks.push(Box::new(sink));
        self
    }

    pub fn push(&mut self, sink: Box<dyn Formatter>) {
        self.sinks.push(sink);
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl Formatter for FanOutFormatter {
    fn write_event(&mut self, record: &EventRecord) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.write_event(record) {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }

    fn finalize(&mut self) -> Result<()> {
        let mut first_err = None;
        for sink in &mut self.sinks {
            if let Err(e) = sink.finalize() {
                first_err.get_or_insert(e);
            }
        }
        first_err.map_or(Ok(()), Err)
    }
}

/// Collects events in memory. Clones share the same buffer.
#[derive(Clone, Default)]
pub struct MemoryFormatter {
    records: Arc<Mutex<Vec<EventRecord>>>,
    finalized: Arc<AtomicUsize>,
}

impl MemoryFormatter {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<EventRecord>> {
        self.records.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn records(&self) -> Vec<EventRecord> {
        self.lock().clone()
    }

    pub fn events(&self) -> Vec<HeadlessEvent> {
        self.lock().iter().map(|r| r.event.clone()).collect()
    }

    /// Event `type` tags in emission order.
    pub fn kinds(&self) -> Vec<&'static str> {
        self.lock().iter().map(|r| r.event.kind()).collect()
    }

    /// Number of times `finalize` was called.
    pub fn finalize_count(&self) -> usize {
        self.finalized.load(Ordering::SeqCst)
    }
}

impl Formatter for MemoryFormatter {
    fn write_event(&mut self, record: &EventRecord) -> Result<()> {
        self.lock().push(record.clone());
        Ok(())
    }

    fn finalize(&mut self) -> Result<()> {
        self.finalized.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RalphError;

    fn record(event: HeadlessEvent) -> EventRecord {
        EventRecord { event, timestamp: None }
    }

    struct FailingFormatter;

    impl Formatter for FailingFormatter {
        fn write_event(&mut self, _record: &EventRecord) -> Result<()> {
            Err(RalphError::Io(io::Error::new(io::ErrorKind::BrokenPipe, "closed")))
        }
    }

    #[test]
    fn test_json_lines_one_object_per_line() {
        let mut formatter = JsonLinesFormatter::new(Vec::new());
        formatter.write_event(&record(HeadlessEvent::Pause)).unwrap();
        formatter.write_event(&record(HeadlessEvent::Resume)).unwrap();
        formatter.finalize().unwrap();

        let out = String::from_utf8(formatter.into_inner()).unwrap();
        let lines: Vec<&str> = out.lines().collect();
        assert_eq!(lines, vec![r#"{"type":"pause"}"#, r#"{"type":"resume"}"#]);
    }

    #[test]
    fn test_memory_formatter_shares_buffer() {
        let memory = MemoryFormatter::new();
        let mut sink = memory.clone();
        sink.write_event(&record(HeadlessEvent::Idle { idle: true })).unwrap();
        sink.finalize().unwrap();

        assert_eq!(memory.kinds(), vec!["idle"]);
        assert_eq!(memory.finalize_count(), 1);
    }

    #[test]
    fn test_fan_out_reaches_all_sinks_despite_failure() {
        let a = MemoryFormatter::new();
        let b = MemoryFormatter::new();
        let mut fan_out = FanOutFormatter::new().with(a.clone()).with(FailingFormatter).with(b.clone());
        assert_eq!(fan_out.len(), 3);

        let result = fan_out.write_event(&record(HeadlessEvent::Pause));
        assert!(result.is_err());
        assert_eq!(a.kinds(), vec!["pause"]);
        assert_eq!(b.kinds(), vec!["pause"]);

        fan_out.finalize().unwrap();
        assert_eq!(a.finalize_count(), 1);
        assert_eq!(b.finalize_count(), 1);
    }
}
