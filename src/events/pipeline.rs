//! Ordered event pipeline in front of a single formatter.

use log::{debug, warn};

use super::event::{EventRecord, HeadlessEvent, StatsSnapshot};
use super::formatter::Formatter;
use crate::id::now_ms;

/// Forwards engine events to a formatter in emission order.
///
/// Formatter failures are logged and swallowed. Stats events are deduplicated
/// against the last emitted snapshot.
pub struct HeadlessPipeline {
    formatter: Box<dyn Formatter>,
    timestamps: bool,
    last_stats: Option<StatsSnapshot>,
    emitted: u64,
    finalized: bool,
}

impl HeadlessPipeline {
    pub fn new(formatter: Box<dyn Formatter>) -> Self {
        Self {
            formatter,
            timestamps: false,
            last_stats: None,
            emitted: 0,
            finalized: false,
        }
    }

    /// Stamp each event with the current Unix ms.
    pub fn with_timestamps(mut self, enabled: bool) -> Self {
        self.timestamps = enabled;
        self
    }

    /// Events successfully handed to the formatter.
    pub fn emitted(&self) -> u64 {
        self.emitted
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized
    }

    pub fn emit(&mut self, event: HeadlessEvent) {
        if self.finalized {
            debug!("Dropping {} event after finalize", event.kind());
            return;
        }
        let record = EventRecord {
            event,
            timestamp: self.timestamps.then(now_ms),
        };
        match self.formatter.write_event(&record) {
            Ok(()) => self.emitted += 1,
            Err(e) => warn!("Formatter failed on {} event: {}", record.event.kind(), e),
        }
    }

    /// Emit a stats event unless it equals the last one emitted.
    ///
    /// Returns true if an event was emitted.
    pub fn emit_stats(&mut self, stats: &StatsSnapshot) -> bool {
        if self.last_stats.as_ref() == Some(stats) {
            return false;
        }
        self.last_stats = Some(stats.clone());
        self.emit(HeadlessEvent::Stats(stats.clone()));
        true
    }

    /// Flush the formatter. Only the first call has any effect.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        if let Err(e) = self.formatter.finalize() {
            warn!("Formatter failed to finalize: {}", e);
        }
    }
}
