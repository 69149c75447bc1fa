use hotprobe_common::{Phase, ProbeEvent};
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::HashMap;
use std::io::{BufRead, Write};

use crate::domain::ExportError;

/// Event lines carry no process or thread, everything goes on one track
const TRACK_PID: u32 = 1;
const TRACK_TID: u32 = 1;

/// Chrome Trace Event format
/// Format reference: https://docs.google.com/document/d/1CvAClvFfyA5R-PhYUmn5OOQtYMH4h6I0nSsKchNAySU/preview
#[derive(Debug, Clone, Serialize)]
struct ChromeTraceEvent {
    /// `Class.method`
    name: String,
    /// Internal class name, for filtering
    cat: String,
    /// Phase: "B" = begin, "E" = end, "M" = metadata
    ph: String,
    /// Timestamp in microseconds
    ts: f64,
    pid: u32,
    tid: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    args: Option<HashMap<String, JsonValue>>,
}

/// Chrome Trace Format container
#[derive(Debug, Serialize)]
struct ChromeTrace {
    #[serde(rename = "traceEvents")]
    trace_events: Vec<ChromeTraceEvent>,
    #[serde(rename = "displayTimeUnit")]
    display_time_unit: String,
}

/// Chrome trace exporter for probe events
#[derive(Debug, Default)]
pub struct ChromeTraceExporter {
    events: Vec<ChromeTraceEvent>,
    /// First event's timestamp; all others are relative to it
    start_timestamp_millis: Option<u64>,
}

impl ChromeTraceExporter {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Add one probe event to the trace
    pub fn add_event(&mut self, event: &ProbeEvent) {
        let start = *self.start_timestamp_millis.get_or_insert(event.timestamp_millis);
        // Millisecond resolution, converted to the format's microseconds
        let ts = event.timestamp_millis.saturating_sub(start) as f64 * 1000.0;

        let mut args = HashMap::new();
        args.insert("class".to_string(), serde_json::json!(event.unit_name));
        args.insert("method".to_string(), serde_json::json!(event.method_name));

        self.events.push(ChromeTraceEvent {
            name: format!("{}.{}", event.unit_name.replace('/', "."), event.method_name),
            cat: event.unit_name.clone(),
            ph: match event.phase {
                Phase::Start => "B",
                Phase::End => "E",
            }
            .to_string(),
            ts,
            pid: TRACK_PID,
            tid: TRACK_TID,
            args: Some(args),
        });
    }

    /// Read event lines until EOF, skipping blank lines
    ///
    /// # Errors
    /// Returns [`ExportError::BadEventLine`] with the 1-based line number of
    /// the first malformed line, or [`ExportError::Io`].
    pub fn read_lines<R: BufRead>(&mut self, reader: R) -> Result<usize, ExportError> {
        let mut added = 0;
        for (index, line) in reader.lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            let event = ProbeEvent::parse_line(&line)
                .map_err(|source| ExportError::BadEventLine { line: index + 1, source })?;
            self.add_event(&event);
            added += 1;
        }
        Ok(added)
    }

    /// Export the trace to any writer (file, stdout, buffer, etc.)
    ///
    /// # Errors
    /// Returns [`ExportError::Json`] if writing fails.
    pub fn export<W: Write>(&self, writer: W) -> Result<(), ExportError> {
        let mut all_events = self.events.clone();

        let mut args = HashMap::new();
        args.insert("name".to_string(), serde_json::json!("hotprobe"));
        all_events.push(ChromeTraceEvent {
            name: "process_name".to_string(),
            cat: String::new(),
            ph: "M".to_string(),
            ts: 0.0,
            pid: TRACK_PID,
            tid: TRACK_TID,
            args: Some(args),
        });

        let trace = ChromeTrace {
            trace_events: all_events,
            display_time_unit: "ms".to_string(),
        };

        serde_json::to_writer_pretty(writer, &trace)?;
        Ok(())
    }

    /// Get the number of events collected
    #[must_use]
    pub fn event_count(&self) -> usize {
        self.events.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lines_to_trace() {
        let input = "app/Sample\trun\tstart\t1000\n\napp/Sample\trun\tend\t1003\n";
        let mut exporter = ChromeTraceExporter::new();
        assert_eq!(exporter.read_lines(input.as_bytes()).unwrap(), 2);

        let mut buffer = Vec::new();
        exporter.export(&mut buffer).unwrap();
        let json: JsonValue = serde_json::from_slice(&buffer).unwrap();
        let events = json["traceEvents"].as_array().unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["name"], "app.Sample.run");
        assert_eq!(events[0]["ph"], "B");
        assert_eq!(events[0]["ts"], 0.0);
        assert_eq!(events[1]["ph"], "E");
        assert_eq!(events[1]["ts"], 3000.0);
        assert_eq!(events[2]["ph"], "M");
        assert_eq!(json["displayTimeUnit"], "ms");
    }

    #[test]
    fn test_bad_line_reports_position() {
        let input = "a\tb\tstart\t1\nnot an event\n";
        let mut exporter = ChromeTraceExporter::new();
        let err = exporter.read_lines(input.as_bytes()).unwrap_err();
        assert!(matches!(err, ExportError::BadEventLine { line: 2, .. }));
    }
}
