//! Transformation Hook
//!
//! [`InstrumentationEngine`] owns a single hook slot. While a
//! [`ClassTransformer`] sits in the slot, every class the host loads or
//! retransforms passes through [`InstrumentationEngine::transform`].
//!
//! ```text
//! Uninstalled --install--> Installed --uninstall--> Uninstalled
//!                            |  install again
//!                            v
//!                       HookConflict (slot unchanged)
//! ```
//!
//! The host side (JVMTI in the agent) is reached through the
//! [`Instrumentation`] trait so the lifecycle can be driven without a VM.

use log::{debug, info, warn};
use std::borrow::Cow;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};

use crate::domain::{EngineError, HostError, TransformError};
use crate::rewrite::{self, Probe};
use crate::scope::{LoaderId, ScopeDecision, ScopeFilter};

/// Everything fixed at install time
#[derive(Debug, Clone, Default)]
pub struct EngineConfig {
    pub filter: ScopeFilter,
    pub probe: Probe,
}

/// One class handed to the hook
#[derive(Debug, Clone, Copy)]
pub struct TransformRequest<'a> {
    /// Internal name; `None` for hidden classes
    pub class_name: Option<&'a str>,
    pub loader: &'a LoaderId,
    pub bytes: &'a [u8],
    /// The class is already loaded and is being retransformed
    pub redefining: bool,
}

/// A class the host reports as loaded
#[derive(Debug, Clone)]
pub struct LoadedClass<C> {
    pub name: String,
    pub loader: LoaderId,
    /// Whether the host allows replacing its bytes
    pub modifiable: bool,
    pub handle: C,
}

/// Capabilities the hosting runtime grants the engine
pub trait Instrumentation {
    /// Host-side class reference
    type Class: Clone;

    /// Start or stop routing class bytes to the engine
    fn set_hook_enabled(&self, enabled: bool) -> Result<(), HostError>;

    fn loaded_classes(&self) -> Result<Vec<LoadedClass<Self::Class>>, HostError>;

    /// Ask the host to run the given classes through the hook again
    fn retransform_classes(&self, classes: &[Self::Class]) -> Result<(), HostError>;
}

/// Counters kept by an installed hook
#[derive(Debug, Default)]
struct Counters {
    instrumented: AtomicU64,
    filtered: AtomicU64,
    failed: AtomicU64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransformStats {
    pub instrumented: u64,
    pub filtered: u64,
    pub failed: u64,
}

/// The hook itself: filter, then rewrite
#[derive(Debug)]
pub struct ClassTransformer {
    config: EngineConfig,
    counters: Counters,
}

impl ClassTransformer {
    #[must_use]
    pub fn new(config: EngineConfig) -> Self {
        Self { config, counters: Counters::default() }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// New bytes for an admitted class, `Ok(None)` when the filter rejects it
    ///
    /// # Errors
    /// Returns the [`TransformError`] that made the rewrite fail.
    pub fn transform(&self, request: &TransformRequest<'_>) -> Result<Option<Vec<u8>>, TransformError> {
        let decision = self.config.filter.decide(request.class_name, request.loader);
        if decision != ScopeDecision::Instrument {
            debug!("skipping {}: {decision:?}", request.class_name.unwrap_or("<unnamed>"));
            self.counters.filtered.fetch_add(1, Ordering::Relaxed);
            return Ok(None);
        }

        let name = request.class_name.unwrap_or_default();
        debug!("Instrumenting class {name}");
        match rewrite::instrument_class(request.bytes, &self.config.probe) {
            Ok((bytes, report)) => {
                self.counters.instrumented.fetch_add(1, Ordering::Relaxed);
                debug!(
                    "Returning {}instrumented class {name} ({} probe calls)",
                    if request.redefining { "re" } else { "" },
                    report.probe_calls()
                );
                Ok(Some(bytes))
            }
            Err(e) => {
                self.counters.failed.fetch_add(1, Ordering::Relaxed);
                Err(e)
            }
        }
    }

    #[must_use]
    pub fn stats(&self) -> TransformStats {
        TransformStats {
            instrumented: self.counters.instrumented.load(Ordering::Relaxed),
            filtered: self.counters.filtered.load(Ordering::Relaxed),
            failed: self.counters.failed.load(Ordering::Relaxed),
        }
    }
}

/// Outcome of retransforming the classes loaded before installation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InstallReport {
    /// Loaded classes admitted by the filter
    pub candidates: usize,
    pub retransformed: usize,
    /// `(class, reason)` for each class the host refused to retransform
    pub failures: Vec<(String, String)>,
}

/// Explicit owner of the process-wide hook slot
#[derive(Debug)]
pub struct InstrumentationEngine {
    config: EngineConfig,
    slot: RwLock<Option<Arc<ClassTransformer>>>,
}

impl InstrumentationEngine {
    /// A new engine with nothing installed
    #[must_use]
    pub fn init(config: EngineConfig) -> Self {
        Self { config, slot: RwLock::new(None) }
    }

    #[must_use]
    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    #[must_use]
    pub fn is_installed(&self) -> bool {
        self.current().is_some()
    }

    fn current(&self) -> Option<Arc<ClassTransformer>> {
        self.slot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    /// Counters of the installed hook
    #[must_use]
    pub fn stats(&self) -> Option<TransformStats> {
        self.current().map(|t| t.stats())
    }

    /// Install the hook and retransform the matching classes already loaded.
    ///
    /// # Errors
    /// [`EngineError::HookConflict`] if a hook is already installed (it stays
    /// installed); [`EngineError::Host`] if the host refuses to route classes
    /// to the hook, in which case nothing stays installed.
    pub fn install<H: Instrumentation>(&self, host: &H) -> Result<InstallReport, EngineError> {
        {
            let mut slot = self.slot.write().unwrap_or_else(PoisonError::into_inner);
            if slot.is_some() {
                return Err(EngineError::HookConflict);
            }
            *slot = Some(Arc::new(ClassTransformer::new(self.config.clone())));
        }

        if let Err(e) = host.set_hook_enabled(true) {
            self.clear_slot();
            return Err(e.into());
        }
        info!("transformation hook installed");

        Ok(self.retransform_loaded(host))
    }

    fn retransform_loaded<H: Instrumentation>(&self, host: &H) -> InstallReport {
        let mut report = InstallReport::default();
        let loaded = match host.loaded_classes() {
            Ok(loaded) => loaded,
            Err(e) => {
                warn!("cannot list loaded classes, only new classes will be instrumented: {e}");
                return report;
            }
        };

        let candidates: Vec<LoadedClass<H::Class>> = loaded
            .into_iter()
            .filter(|c| c.modifiable && self.config.filter.decide(Some(&c.name), &c.loader).admits())
            .collect();
        report.candidates = candidates.len();

        // One at a time, a class the host rejects must not hold back the rest
        for class in candidates {
            match host.retransform_classes(std::slice::from_ref(&class.handle)) {
                Ok(()) => report.retransformed += 1,
                Err(e) => {
                    warn!("retransform of {} failed: {e}", class.name);
                    report.failures.push((class.name, e.to_string()));
                }
            }
        }
        info!(
            "retransformed {}/{} loaded classes",
            report.retransformed, report.candidates
        );
        report
    }

    fn clear_slot(&self) -> Option<Arc<ClassTransformer>> {
        self.slot.write().unwrap_or_else(PoisonError::into_inner).take()
    }

    /// Remove the hook. Classes already rewritten stay rewritten.
    ///
    /// # Errors
    /// [`EngineError::NotInstalled`] when there is nothing to remove;
    /// [`EngineError::Host`] when the host fails to stop routing classes (the
    /// slot is empty regardless, so the hook no longer rewrites anything).
    pub fn uninstall<H: Instrumentation>(&self, host: &H) -> Result<(), EngineError> {
        let Some(transformer) = self.clear_slot() else {
            return Err(EngineError::NotInstalled);
        };
        let stats = transformer.stats();
        info!(
            "transformation hook removed ({} instrumented, {} filtered, {} failed)",
            stats.instrumented, stats.filtered, stats.failed
        );
        host.set_hook_enabled(false)?;
        Ok(())
    }

    /// Uninstall if needed and drop the engine
    pub fn teardown<H: Instrumentation>(self, host: &H) {
        match self.uninstall(host) {
            Ok(()) | Err(EngineError::NotInstalled) => {}
            Err(e) => warn!("teardown: {e}"),
        }
    }

    /// Run one class through the installed hook. Never fails: without a hook,
    /// for filtered classes and on any error the input comes back unchanged.
    pub fn transform<'a>(&self, request: &TransformRequest<'a>) -> Cow<'a, [u8]> {
        let Some(transformer) = self.current() else {
            return Cow::Borrowed(request.bytes);
        };
        match transformer.transform(request) {
            Ok(Some(bytes)) => Cow::Owned(bytes),
            Ok(None) => Cow::Borrowed(request.bytes),
            Err(e) => {
                warn!(
                    "{}: keeping original bytes: {e}",
                    request.class_name.unwrap_or("<unnamed>")
                );
                Cow::Borrowed(request.bytes)
            }
        }
    }
}
