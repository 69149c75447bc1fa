//! # Shared Data Structures (CLI ↔ Agent)
//!
//! Defines the types and well-known names shared between the `hotprobe` command
//! line tool and the `hotprobe-agent` library that runs inside the target JVM.
//!
//! ## Key Types
//!
//! - [`ProbeEvent`] - One timing event emitted by an injected probe call
//! - [`Phase`] - Whether the event marks method entry or method exit
//! - [`AgentOptions`] - The free-text argument passed through the attach channel
//!
//! ## Event Line Format
//!
//! Every event is one line of four tab-separated fields:
//!
//! ```text
//! unitName \t methodName \t start|end \t timestampMillis
//! ```

use std::fmt;
use std::str::FromStr;
use thiserror::Error;

// ============================================================================
// Well-Known Names
// ============================================================================

/// Internal name of the synthetic class that receives probe calls
///
/// Defined by the agent inside the target JVM. Rewritten methods call its
/// static `start`/`end` methods.
pub const SINK_CLASS: &str = "hotprobe/ProbeSink";

/// Name prefix identifying the instrumentation machinery itself
///
/// Classes under this prefix are never rewritten, otherwise every probe call
/// would itself be probed and recurse without bound.
pub const SELF_PREFIX: &str = "hotprobe/";

/// Probe method invoked before the first instruction of a method
pub const ENTRY_METHOD: &str = "start";

/// Probe method invoked before every return or throw
pub const EXIT_METHOD: &str = "end";

/// Descriptor shared by both probe methods: `(unitName, methodName) -> void`
pub const PROBE_DESCRIPTOR: &str = "(Ljava/lang/String;Ljava/lang/String;)V";

// ============================================================================
// Probe Events
// ============================================================================

/// Which side of a method activation an event marks
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Start,
    End,
}

impl Phase {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Phase::Start => "start",
            Phase::End => "end",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Phase {
    type Err = EventParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "start" => Ok(Phase::Start),
            "end" => Ok(Phase::End),
            other => Err(EventParseError::UnknownPhase(other.to_string())),
        }
    }
}

/// A single probe hit
///
/// Events are fire-and-forget: they are formatted and handed to a sink, never
/// stored by the instrumentation core.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProbeEvent {
    /// Internal name of the instrumented class (`pkg/Name`)
    pub unit_name: String,
    /// Name of the instrumented method
    pub method_name: String,
    pub phase: Phase,
    /// Wall-clock milliseconds since the Unix epoch
    pub timestamp_millis: u64,
}

impl ProbeEvent {
    #[must_use]
    pub fn new(unit_name: &str, method_name: &str, phase: Phase, timestamp_millis: u64) -> Self {
        Self {
            unit_name: unit_name.to_string(),
            method_name: method_name.to_string(),
            phase,
            timestamp_millis,
        }
    }

    /// Parse one event line (without the trailing newline)
    ///
    /// # Errors
    /// Returns an error if the line does not have exactly four fields, the
    /// phase is unknown or the timestamp is not an integer.
    pub fn parse_line(line: &str) -> Result<Self, EventParseError> {
        let fields: Vec<&str> = line.trim_end_matches(['\r', '\n']).split('\t').collect();
        let [unit, method, phase, ts] = fields.as_slice() else {
            return Err(EventParseError::FieldCount(fields.len()));
        };

        let timestamp_millis =
            ts.parse::<u64>().map_err(|_| EventParseError::BadTimestamp((*ts).to_string()))?;

        Ok(Self {
            unit_name: (*unit).to_string(),
            method_name: (*method).to_string(),
            phase: phase.parse()?,
            timestamp_millis,
        })
    }
}

/// Formats the event as its output line (no trailing newline)
impl fmt::Display for ProbeEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}\t{}\t{}\t{}",
            self.unit_name, self.method_name, self.phase, self.timestamp_millis
        )
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
pub enum EventParseError {
    #[error("expected 4 tab-separated fields, found {0}")]
    FieldCount(usize),

    #[error("unknown phase '{0}' (expected start or end)")]
    UnknownPhase(String),

    #[error("invalid timestamp '{0}'")]
    BadTimestamp(String),
}

// ============================================================================
// Agent Options
// ============================================================================

/// Separator between entries of the attach argument
pub const OPTION_SEPARATOR: char = ',';

#[derive(Error, Debug, PartialEq, Eq)]
pub enum OptionsError {
    #[error("{key} value '{value}' contains ',', which separates attach options")]
    SeparatorInValue { key: &'static str, value: String },
}

/// Configuration carried by the single free-text attach argument
///
/// Format: comma-separated `key=value` pairs.
///
/// | Key | Meaning |
/// |-----|---------|
/// | `output` | File the agent appends event lines to (default: stdout) |
/// | `exclude` | Extra class-name prefix to leave untouched (repeatable) |
/// | `include` | Only instrument classes under this prefix (repeatable) |
/// | `detach` | Bare flag: remove an installed hook instead of installing |
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AgentOptions {
    pub output: Option<String>,
    pub excludes: Vec<String>,
    pub includes: Vec<String>,
    pub detach: bool,
    /// Keys the agent did not recognise, kept so they can be reported
    pub unknown: Vec<String>,
}

impl AgentOptions {
    /// Parse the attach argument. Never fails: unknown keys are collected.
    #[must_use]
    pub fn parse(raw: &str) -> Self {
        let mut options = Self::default();

        for pair in raw.split(OPTION_SEPARATOR).map(str::trim).filter(|p| !p.is_empty()) {
            if pair == "detach" {
                options.detach = true;
                continue;
            }
            match pair.split_once('=') {
                Some(("output", value)) if !value.is_empty() => {
                    options.output = Some(value.to_string());
                }
                Some(("exclude", value)) if !value.is_empty() => {
                    options.excludes.push(to_internal_name(value));
                }
                Some(("include", value)) if !value.is_empty() => {
                    options.includes.push(to_internal_name(value));
                }
                _ => options.unknown.push(pair.to_string()),
            }
        }

        options
    }

    /// Check that every value survives the trip through [`Self::to_argument`]
    ///
    /// # Errors
    /// Returns [`OptionsError::SeparatorInValue`] for the first value that
    /// contains the separator and would be split into a bogus option.
    pub fn validate(&self) -> Result<(), OptionsError> {
        let values = self
            .output
            .iter()
            .map(|v| ("output", v))
            .chain(self.excludes.iter().map(|v| ("exclude", v)))
            .chain(self.includes.iter().map(|v| ("include", v)));
        for (key, value) in values {
            if value.contains(OPTION_SEPARATOR) {
                return Err(OptionsError::SeparatorInValue { key, value: value.clone() });
            }
        }
        Ok(())
    }

    /// Render back to the attach argument form
    #[must_use]
    pub fn to_argument(&self) -> String {
        let mut parts = Vec::new();
        if let Some(ref output) = self.output {
            parts.push(format!("output={output}"));
        }
        parts.extend(self.excludes.iter().map(|e| format!("exclude={e}")));
        parts.extend(self.includes.iter().map(|i| format!("include={i}")));
        if self.detach {
            parts.push("detach".to_string());
        }
        parts.join(",")
    }
}

/// Accept both `com.example.Foo` and `com/example/Foo` spellings
#[must_use]
pub fn to_internal_name(name: &str) -> String {
    name.replace('.', "/")
}
