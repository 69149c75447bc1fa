//! Trace export functionality
//!
//! Converts recorded probe event lines into formats other tools can display.
//! Currently supports Chrome Trace Event Format for visualization in
//! chrome://tracing or Perfetto.

pub mod chrome_trace;

pub use chrome_trace::ChromeTraceExporter;
