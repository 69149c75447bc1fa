//! Raw JNI / JVMTI types and function table access
//!
//! Only what the agent calls is declared. Function tables are addressed by
//! index: JNI indices are 0-based positions in `JNINativeInterface_`, JVMTI
//! slots are the 1-based numbers from the JVMTI specification.

#![allow(non_camel_case_types)]

use std::ffi::{c_char, c_void};

pub type jint = i32;
pub type jlong = i64;
pub type jboolean = u8;
pub type jsize = jint;
pub type jobject = *mut c_void;
pub type jclass = jobject;
pub type jstring = jobject;
pub type jmethodID = *mut c_void;
pub type jvmtiError = jint;

/// `JNIEnv*`, `JavaVM*` and `jvmtiEnv*` all point at a pointer to a table
pub type FunctionTable = *const *const c_void;
pub type JNIEnv = *const FunctionTable;
pub type JavaVM = *const FunctionTable;
pub type jvmtiEnv = *const FunctionTable;

pub const JNI_OK: jint = 0;
pub const JNI_ERR: jint = -1;
pub const JNI_TRUE: jboolean = 1;
pub const JNI_VERSION_1_6: jint = 0x0001_0006;
pub const JVMTI_VERSION_1_2: jint = 0x3001_0200;

pub const JVMTI_ERROR_NONE: jvmtiError = 0;
pub const JVMTI_ENABLE: jint = 1;
pub const JVMTI_DISABLE: jint = 0;
pub const JVMTI_EVENT_VM_DEATH: jint = 51;
pub const JVMTI_EVENT_CLASS_FILE_LOAD_HOOK: jint = 54;

// JavaVM invoke interface
pub const VM_GET_ENV: usize = 6;

// JNI function indices
pub const JNI_DEFINE_CLASS: usize = 5;
pub const JNI_FIND_CLASS: usize = 6;
pub const JNI_EXCEPTION_CLEAR: usize = 17;
pub const JNI_NEW_GLOBAL_REF: usize = 21;
pub const JNI_DELETE_LOCAL_REF: usize = 23;
pub const JNI_IS_SAME_OBJECT: usize = 24;
pub const JNI_GET_OBJECT_CLASS: usize = 31;
pub const JNI_GET_STATIC_METHOD_ID: usize = 113;
pub const JNI_CALL_STATIC_OBJECT_METHOD_A: usize = 116;
pub const JNI_GET_STRING_UTF_CHARS: usize = 169;
pub const JNI_RELEASE_STRING_UTF_CHARS: usize = 170;
pub const JNI_REGISTER_NATIVES: usize = 215;
pub const JNI_EXCEPTION_CHECK: usize = 228;

// JVMTI function slots
pub const JVMTI_SET_EVENT_NOTIFICATION_MODE: usize = 2;
pub const JVMTI_IS_MODIFIABLE_CLASS: usize = 45;
pub const JVMTI_ALLOCATE: usize = 46;
pub const JVMTI_DEALLOCATE: usize = 47;
pub const JVMTI_GET_CLASS_SIGNATURE: usize = 48;
pub const JVMTI_GET_CLASS_LOADER: usize = 57;
pub const JVMTI_GET_LOADED_CLASSES: usize = 78;
pub const JVMTI_SET_EVENT_CALLBACKS: usize = 122;
pub const JVMTI_GET_ERROR_NAME: usize = 128;
pub const JVMTI_ADD_CAPABILITIES: usize = 142;
pub const JVMTI_RETRANSFORM_CLASSES: usize = 152;

/// `jvmtiCapabilities`: 128 bits, allocated least significant bit first
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct jvmtiCapabilities {
    words: [u32; 4],
}

impl jvmtiCapabilities {
    pub const CAN_REDEFINE_CLASSES: u32 = 9;
    pub const CAN_GENERATE_ALL_CLASS_HOOK_EVENTS: u32 = 26;
    pub const CAN_RETRANSFORM_CLASSES: u32 = 37;

    #[must_use]
    pub fn with(mut self, bit: u32) -> Self {
        self.words[(bit / 32) as usize] |= 1 << (bit % 32);
        self
    }

    #[must_use]
    pub fn has(&self, bit: u32) -> bool {
        self.words[(bit / 32) as usize] & (1 << (bit % 32)) != 0
    }
}

pub type ClassFileLoadHookFn = unsafe extern "system" fn(
    jvmti: jvmtiEnv,
    jni: JNIEnv,
    class_being_redefined: jclass,
    loader: jobject,
    name: *const c_char,
    protection_domain: jobject,
    class_data_len: jint,
    class_data: *const u8,
    new_class_data_len: *mut jint,
    new_class_data: *mut *mut u8,
);

pub type VmDeathFn = unsafe extern "system" fn(jvmti: jvmtiEnv, jni: JNIEnv);

/// Prefix of `jvmtiEventCallbacks`; the VM accepts a shorter struct when told its size
#[repr(C)]
#[derive(Default)]
pub struct jvmtiEventCallbacks {
    pub vm_init: Option<unsafe extern "system" fn()>,
    pub vm_death: Option<VmDeathFn>,
    pub thread_start: Option<unsafe extern "system" fn()>,
    pub thread_end: Option<unsafe extern "system" fn()>,
    pub class_file_load_hook: Option<ClassFileLoadHookFn>,
}

#[repr(C)]
pub struct JNINativeMethod {
    pub name: *const c_char,
    pub signature: *const c_char,
    pub fn_ptr: *mut c_void,
}

/// Fetch entry `index` of the function table behind `env`
///
/// # Safety
/// `env` must be a live JNI, JavaVM or JVMTI environment pointer and `F` the
/// exact function pointer type of that entry.
pub unsafe fn function<F: Copy>(env: *const FunctionTable, index: usize) -> F {
    debug_assert_eq!(std::mem::size_of::<F>(), std::mem::size_of::<*const c_void>());
    let table = *env;
    let entry = *table.add(index);
    std::mem::transmute_copy(&entry)
}

/// [`function`] for a 1-based JVMTI slot
///
/// # Safety
/// Same as [`function`].
pub unsafe fn jvmti_function<F: Copy>(env: jvmtiEnv, slot: usize) -> F {
    function(env, slot - 1)
}
