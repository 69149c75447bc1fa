//! The probe sink class defined inside the target VM
//!
//! Rewritten methods call `hotprobe/ProbeSink.start` and `.end`. Both are
//! native and bound with `RegisterNatives` to functions that forward to the
//! agent's [`ProbeRecorder`](hotprobe::sink::ProbeRecorder).

use std::ffi::{c_void, CString};
use std::fmt::Display;
use std::panic::{self, AssertUnwindSafe};

use hotprobe::classfile::{serialize, ClassBuilder, ACC_NATIVE, ACC_STATIC};
use hotprobe::domain::HostError;
use hotprobe_common::{Phase, ENTRY_METHOD, EXIT_METHOD, PROBE_DESCRIPTOR, SINK_CLASS};

use crate::jni::JniEnv;
use crate::sys::{jclass, jobject, jstring, JNINativeMethod, JNIEnv};

const ACC_PUBLIC: u16 = 0x0001;

fn sink_error(e: impl Display) -> HostError {
    HostError::new("ProbeSink", e.to_string())
}

/// NUL-terminated copy of a probe name for `RegisterNatives`
fn native_name(value: &str) -> Result<CString, HostError> {
    CString::new(value).map_err(sink_error)
}

/// Class file bytes of the sink: two `public static native` probe methods
///
/// # Errors
/// Fails only if the class cannot be serialized.
pub fn sink_class_bytes() -> Result<Vec<u8>, HostError> {
    let mut builder = ClassBuilder::new(SINK_CLASS, "java/lang/Object").map_err(sink_error)?;
    for name in [ENTRY_METHOD, EXIT_METHOD] {
        builder
            .method(ACC_PUBLIC | ACC_STATIC | ACC_NATIVE, name, PROBE_DESCRIPTOR, None)
            .map_err(sink_error)?;
    }
    serialize(&builder.build()).map_err(sink_error)
}

/// Define the sink in `loader` and bind its natives. Returns the class as a
/// local reference.
///
/// # Errors
/// Fails when the VM rejects the class or the natives.
pub fn define_sink(jni: &JniEnv, loader: jobject) -> Result<jclass, HostError> {
    let bytes = sink_class_bytes()?;
    let start = native_name(ENTRY_METHOD)?;
    let end = native_name(EXIT_METHOD)?;
    let descriptor = native_name(PROBE_DESCRIPTOR)?;
    let class = jni.define_class(SINK_CLASS, loader, &bytes)?;
    let natives = [
        JNINativeMethod {
            name: start.as_ptr(),
            signature: descriptor.as_ptr(),
            fn_ptr: probe_start as *mut c_void,
        },
        JNINativeMethod {
            name: end.as_ptr(),
            signature: descriptor.as_ptr(),
            fn_ptr: probe_end as *mut c_void,
        },
    ];
    jni.register_natives(class, &natives)?;
    Ok(class)
}

unsafe extern "system" fn probe_start(env: JNIEnv, _class: jclass, unit: jstring, method: jstring) {
    record(env, Phase::Start, unit, method);
}

unsafe extern "system" fn probe_end(env: JNIEnv, _class: jclass, unit: jstring, method: jstring) {
    record(env, Phase::End, unit, method);
}

/// Never unwinds into Java frames
unsafe fn record(env: JNIEnv, phase: Phase, unit: jstring, method: jstring) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(recorder) = crate::recorder() else {
            return;
        };
        let jni = JniEnv::from_raw(env);
        let unit = jni.string(unit).unwrap_or_default();
        let method = jni.string(method).unwrap_or_default();
        match phase {
            Phase::Start => recorder.on_start(&unit, &method),
            Phase::End => recorder.on_end(&unit, &method),
        }
    }));
    if result.is_err() {
        log::error!("panic while recording a probe event");
    }
}
