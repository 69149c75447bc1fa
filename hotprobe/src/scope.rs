//! Scope filter: which classes the hook may rewrite
//!
//! Decided before any parsing happens. Fixed at install time.

use hotprobe_common::{AgentOptions, SELF_PREFIX};
use std::fmt;

/// JDK internals are never rewritten by default. Probing them would fire for
/// the String constants and natives the probe itself uses.
pub const DEFAULT_EXCLUDES: &[&str] = &[SELF_PREFIX, "java/", "javax/", "jdk/", "sun/", "com/sun/"];

/// Identity of the class loader that defined a class
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum LoaderId {
    /// The VM's built-in loader (a null loader reference)
    Bootstrap,
    /// The application class loader
    System,
    /// Any other loader, with a description for logs
    Other(String),
}

impl fmt::Display for LoaderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoaderId::Bootstrap => f.write_str("bootstrap"),
            LoaderId::System => f.write_str("system"),
            LoaderId::Other(name) => write!(f, "other({name})"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ScopeDecision {
    Instrument,
    /// The class has no name (hidden or anonymous classes)
    Unnamed,
    /// The class belongs to the instrumentation machinery
    SelfExcluded,
    UntrustedLoader(LoaderId),
    /// Matched an exclusion prefix
    Excluded(String),
    /// Include prefixes are configured and none matched
    NotIncluded,
}

impl ScopeDecision {
    #[must_use]
    pub fn admits(&self) -> bool {
        *self == ScopeDecision::Instrument
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScopeFilter {
    excluded_prefixes: Vec<String>,
    included_prefixes: Vec<String>,
    trusted_loader: LoaderId,
}

impl Default for ScopeFilter {
    fn default() -> Self {
        Self {
            excluded_prefixes: DEFAULT_EXCLUDES.iter().map(ToString::to_string).collect(),
            included_prefixes: Vec::new(),
            trusted_loader: LoaderId::System,
        }
    }
}

impl ScopeFilter {
    /// Only the self prefix excluded, trusting `loader`
    #[must_use]
    pub fn new(trusted_loader: LoaderId) -> Self {
        Self {
            excluded_prefixes: vec![SELF_PREFIX.to_string()],
            included_prefixes: Vec::new(),
            trusted_loader,
        }
    }

    /// Defaults plus the `exclude=` and `include=` entries of the attach argument
    #[must_use]
    pub fn from_options(options: &AgentOptions) -> Self {
        let mut filter = Self::default();
        filter.excluded_prefixes.extend(options.excludes.iter().cloned());
        filter.included_prefixes.extend(options.includes.iter().cloned());
        filter
    }

    #[must_use]
    pub fn exclude(mut self, prefix: &str) -> Self {
        self.excluded_prefixes.push(prefix.to_string());
        self
    }

    #[must_use]
    pub fn include(mut self, prefix: &str) -> Self {
        self.included_prefixes.push(prefix.to_string());
        self
    }

    #[must_use]
    pub fn trusted_loader(&self) -> &LoaderId {
        &self.trusted_loader
    }

    #[must_use]
    pub fn excluded_prefixes(&self) -> &[String] {
        &self.excluded_prefixes
    }

    #[must_use]
    pub fn included_prefixes(&self) -> &[String] {
        &self.included_prefixes
    }

    /// Decide for a class by internal name and defining loader. The self
    /// prefix wins over everything, including include prefixes.
    #[must_use]
    pub fn decide(&self, class_name: Option<&str>, loader: &LoaderId) -> ScopeDecision {
        let Some(name) = class_name else {
            return ScopeDecision::Unnamed;
        };
        if name.starts_with(SELF_PREFIX) {
            return ScopeDecision::SelfExcluded;
        }
        if *loader != self.trusted_loader {
            return ScopeDecision::UntrustedLoader(loader.clone());
        }
        if let Some(prefix) = self.excluded_prefixes.iter().find(|p| name.starts_with(p.as_str())) {
            return ScopeDecision::Excluded(prefix.clone());
        }
        if !self.included_prefixes.is_empty()
            && !self.included_prefixes.iter().any(|p| name.starts_with(p.as_str()))
        {
            return ScopeDecision::NotIncluded;
        }
        ScopeDecision::Instrument
    }
}
