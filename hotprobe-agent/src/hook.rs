//! JVMTI event callbacks: `ClassFileLoadHook` and `VMDeath`

use std::borrow::Cow;
use std::ffi::{c_char, CStr};
use std::panic::{self, AssertUnwindSafe};

use hotprobe::engine::TransformRequest;
use log::{error, warn};

use crate::jni::JniEnv;
use crate::sys::{jclass, jint, jobject, jvmtiEnv, JNIEnv};

/// Called by the VM for every class definition and retransformation while
/// the event is enabled. Leaving the out parameters untouched keeps the
/// original bytes.
pub unsafe extern "system" fn class_file_load_hook(
    _jvmti: jvmtiEnv,
    jni: JNIEnv,
    class_being_redefined: jclass,
    loader: jobject,
    name: *const c_char,
    _protection_domain: jobject,
    class_data_len: jint,
    class_data: *const u8,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut u8,
) {
    let result = panic::catch_unwind(AssertUnwindSafe(|| {
        let Some(state) = crate::state() else {
            return;
        };
        let Ok(len) = usize::try_from(class_data_len) else {
            return;
        };
        if class_data.is_null() || new_class_data.is_null() || new_class_data_len.is_null() {
            return;
        }

        let jni = JniEnv::from_raw(jni);
        let class_name = if name.is_null() {
            None
        } else {
            CStr::from_ptr(name).to_str().ok()
        };
        let loader = state.loaders.resolve(&jni, loader);
        let bytes = std::slice::from_raw_parts(class_data, len);
        let request = TransformRequest {
            class_name,
            loader: &loader,
            bytes,
            redefining: !class_being_redefined.is_null(),
        };

        let Cow::Owned(rewritten) = state.engine.transform(&request) else {
            return;
        };
        let Ok(new_len) = jint::try_from(rewritten.len()) else {
            warn!("{}: rewritten class too large, keeping original", class_name.unwrap_or("<unnamed>"));
            return;
        };
        match state.jvmti.allocate_copy(&rewritten) {
            Ok(mem) => {
                *new_class_data = mem;
                *new_class_data_len = new_len;
            }
            Err(e) => warn!("{}: {e}", class_name.unwrap_or("<unnamed>")),
        }
    }));
    if result.is_err() {
        error!("panic in class file load hook, class left unchanged");
    }
}

/// Drains queued events before the VM goes away. Runs on every
/// shutdown path, including `System.exit`, where `Agent_OnUnload` may not.
pub unsafe extern "system" fn vm_death(_jvmti: jvmtiEnv, _jni: JNIEnv) {
    if panic::catch_unwind(crate::flush_events).is_err() {
        error!("panic while flushing events");
    }
}
