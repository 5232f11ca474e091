//! Headless event stream.

mod event;
mod formatter;
mod pipeline;

pub use event::{AdapterMode, EventRecord, HeadlessEvent, IterationOutcome, OutputStream, StatsSnapshot};
pub use formatter::{FanOutFormatter, Formatter, JsonLinesFormatter, MemoryFormatter};
pub use pipeline::HeadlessPipeline;
