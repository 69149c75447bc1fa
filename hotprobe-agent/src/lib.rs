//! # hotprobe-agent
//!
//! JVMTI agent loaded into the target JVM by `hotprobe attach`.
//!
//! ```text
//! Agent_OnAttach
//!   ├─ JVMTI env + capabilities (retransform, all class hook events)
//!   ├─ ClassFileLoadHook callback ──> InstrumentationEngine::transform
//!   ├─ hotprobe/ProbeSink defined in the system loader, natives bound
//!   │     start/end ──> ProbeRecorder ──> output file or stdout
//!   └─ InstrumentationEngine::install (retransforms loaded classes)
//! ```
//!
//! The agent stays resident until the VM exits. Attaching again with the
//! `detach` option removes the hook; a later attach reinstalls it.

#![allow(unsafe_code)]

pub mod hook;
pub mod host;
pub mod jni;
pub mod jvmti;
pub mod sink_class;
pub mod sys;

use std::ffi::{c_char, c_void, CStr};
use std::fs::OpenOptions;
use std::panic::{self, AssertUnwindSafe};
use std::sync::OnceLock;

use anyhow::{bail, Context, Result};
use hotprobe::domain::EngineError;
use hotprobe::engine::{EngineConfig, InstrumentationEngine};
use hotprobe::rewrite::Probe;
use hotprobe::scope::ScopeFilter;
use hotprobe::sink::{ChannelSink, LineSink, ProbeRecorder};
use hotprobe_common::AgentOptions;
use log::{error, info, warn};

use crate::host::{JvmtiHost, LoaderResolver};
use crate::jni::JniEnv;
use crate::jvmti::Jvmti;
use crate::sys::{jint, jvmtiCapabilities, jvmtiEventCallbacks, JavaVM};

/// Everything the callbacks need, set once by the first successful attach
pub(crate) struct AgentState {
    pub(crate) jvmti: Jvmti,
    pub(crate) loaders: LoaderResolver,
    pub(crate) engine: InstrumentationEngine,
    pub(crate) recorder: ProbeRecorder,
}

static STATE: OnceLock<AgentState> = OnceLock::new();

pub(crate) fn state() -> Option<&'static AgentState> {
    STATE.get()
}

pub(crate) fn recorder() -> Option<&'static ProbeRecorder> {
    STATE.get().map(|s| &s.recorder)
}

/// Entry point called by the VM's attach listener for `load <lib> true <options>`
///
/// # Safety
/// Called by the VM with a live `JavaVM*` and a NUL-terminated option string
/// (or null).
#[no_mangle]
#[allow(non_snake_case)]
pub unsafe extern "system" fn Agent_OnAttach(vm: JavaVM, options: *const c_char, _reserved: *mut c_void) -> jint {
    let _ = env_logger::try_init();
    let raw = if options.is_null() {
        String::new()
    } else {
        CStr::from_ptr(options).to_string_lossy().into_owned()
    };

    match panic::catch_unwind(AssertUnwindSafe(|| on_attach(vm, &raw))) {
        Ok(Ok(())) => sys::JNI_OK,
        Ok(Err(e)) => {
            error!("hotprobe agent: {e:#}");
            sys::JNI_ERR
        }
        Err(_) => {
            error!("hotprobe agent: panic during attach");
            sys::JNI_ERR
        }
    }
}

/// Flush buffered events when the VM unloads the agent (also done on VM death)
#[no_mangle]
#[allow(non_snake_case)]
pub extern "system" fn Agent_OnUnload(_vm: JavaVM) {
    flush_events();
}

pub(crate) fn flush_events() {
    if let Some(recorder) = recorder() {
        recorder.flush();
    }
}

unsafe fn on_attach(vm: JavaVM, raw: &str) -> Result<()> {
    let options = AgentOptions::parse(raw);
    if !options.unknown.is_empty() {
        warn!("ignoring unknown agent options: {}", options.unknown.join(","));
    }

    let jni = JniEnv::from_vm(vm).context("Failed to get the JNI environment")?;

    if let Some(state) = state() {
        let host = JvmtiHost::new(state.jvmti, jni, state.loaders);
        if options.detach {
            state.engine.uninstall(&host).context("Failed to detach")?;
            return Ok(());
        }
        if options_differ(&options, state.engine.config()) {
            warn!("options of the first attach stay in effect");
        }
        return install(state, &host);
    }
    if options.detach {
        bail!(EngineError::NotInstalled);
    }

    let jvmti = Jvmti::from_vm(vm).context("Failed to get the JVMTI environment")?;
    let capabilities = jvmtiCapabilities::default()
        .with(jvmtiCapabilities::CAN_RETRANSFORM_CLASSES)
        .with(jvmtiCapabilities::CAN_GENERATE_ALL_CLASS_HOOK_EVENTS);
    jvmti.add_capabilities(&capabilities).context("Failed to add capabilities")?;
    let callbacks = jvmtiEventCallbacks {
        vm_death: Some(hook::vm_death),
        class_file_load_hook: Some(hook::class_file_load_hook),
        ..jvmtiEventCallbacks::default()
    };
    jvmti.set_event_callbacks(&callbacks).context("Failed to set event callbacks")?;
    jvmti
        .set_event_notification_mode(true, sys::JVMTI_EVENT_VM_DEATH)
        .context("Failed to enable the VM death event")?;

    let system_loader = system_class_loader(&jni)?;
    let sink = sink_class::define_sink(&jni, system_loader).context("Failed to define the probe sink")?;
    jni.delete_local_ref(sink);

    let recorder = open_recorder(&options)?;
    let config = EngineConfig { filter: ScopeFilter::from_options(&options), probe: Probe::default() };
    let loaders = LoaderResolver::new(jvmti, system_loader);

    // Retransformation re-enters the hook on this thread, so the state must
    // be visible before install
    let state = STATE.get_or_init(|| AgentState {
        jvmti,
        loaders,
        engine: InstrumentationEngine::init(config),
        recorder,
    });
    install(state, &JvmtiHost::new(jvmti, jni, loaders))
}

fn install(state: &AgentState, host: &JvmtiHost) -> Result<()> {
    let report = state.engine.install(host).context("Failed to install the transformation hook")?;
    info!(
        "hotprobe agent attached: {} of {} loaded classes retransformed",
        report.retransformed, report.candidates
    );
    Ok(())
}

fn options_differ(options: &AgentOptions, config: &EngineConfig) -> bool {
    ScopeFilter::from_options(options) != config.filter
}

/// Global reference to `ClassLoader.getSystemClassLoader()`
fn system_class_loader(jni: &JniEnv) -> Result<sys::jobject> {
    let class = jni.find_class("java/lang/ClassLoader")?;
    let loader = jni.call_static_object_method(class, "getSystemClassLoader", "()Ljava/lang/ClassLoader;");
    jni.delete_local_ref(class);
    let loader = loader.context("Failed to resolve the system class loader")?;
    let global = jni.new_global_ref(loader)?;
    jni.delete_local_ref(loader);
    Ok(global)
}

fn open_recorder(options: &AgentOptions) -> Result<ProbeRecorder> {
    match options.output {
        Some(ref path) => {
            let file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open {path}"))?;
            info!("probe events are appended to {path}");
            Ok(ProbeRecorder::new(ChannelSink::new(file)))
        }
        None => Ok(ProbeRecorder::new(LineSink::new(std::io::stdout()))),
    }
}
