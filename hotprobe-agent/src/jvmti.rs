//! Safe-ish wrapper around the JVMTI environment

use std::ffi::{c_char, CStr};
use std::ptr;

use hotprobe::domain::HostError;

use crate::sys::{self, jboolean, jclass, jint, jlong, jobject, jvmtiCapabilities, jvmtiEnv, jvmtiError, JavaVM};

/// A JVMTI environment. Usable from any thread.
#[derive(Debug, Clone, Copy)]
pub struct Jvmti {
    env: jvmtiEnv,
}

// SAFETY: JVMTI environments are not thread-bound
unsafe impl Send for Jvmti {}
unsafe impl Sync for Jvmti {}

impl Jvmti {
    /// Obtain a JVMTI 1.2 environment from the VM
    ///
    /// # Safety
    /// `vm` must be the `JavaVM*` handed to the agent entry point.
    pub unsafe fn from_vm(vm: JavaVM) -> Result<Self, HostError> {
        type GetEnv = unsafe extern "system" fn(JavaVM, *mut *mut std::ffi::c_void, jint) -> jint;
        let get_env: GetEnv = sys::function(vm, sys::VM_GET_ENV);
        let mut env = ptr::null_mut();
        let rc = get_env(vm, &mut env, sys::JVMTI_VERSION_1_2);
        if rc != sys::JNI_OK || env.is_null() {
            return Err(HostError::new("GetEnv", format!("JVMTI 1.2 unavailable (rc {rc})")));
        }
        Ok(Self { env: env.cast_const().cast() })
    }

    /// Human-readable name of a JVMTI error code
    #[must_use]
    pub fn error_name(&self, error: jvmtiError) -> String {
        type GetErrorName = unsafe extern "system" fn(jvmtiEnv, jvmtiError, *mut *mut c_char) -> jvmtiError;
        let mut name = ptr::null_mut();
        unsafe {
            let f: GetErrorName = sys::jvmti_function(self.env, sys::JVMTI_GET_ERROR_NAME);
            if f(self.env, error, &mut name) != sys::JVMTI_ERROR_NONE || name.is_null() {
                return format!("JVMTI error {error}");
            }
            let text = CStr::from_ptr(name).to_string_lossy().into_owned();
            self.deallocate(name.cast());
            text
        }
    }

    fn check(&self, operation: &'static str, error: jvmtiError) -> Result<(), HostError> {
        if error == sys::JVMTI_ERROR_NONE {
            Ok(())
        } else {
            Err(HostError::new(operation, self.error_name(error)))
        }
    }

    /// # Errors
    /// Fails when the VM cannot grant one of the capabilities.
    pub fn add_capabilities(&self, capabilities: &jvmtiCapabilities) -> Result<(), HostError> {
        type AddCapabilities = unsafe extern "system" fn(jvmtiEnv, *const jvmtiCapabilities) -> jvmtiError;
        let error = unsafe {
            let f: AddCapabilities = sys::jvmti_function(self.env, sys::JVMTI_ADD_CAPABILITIES);
            f(self.env, capabilities)
        };
        self.check("AddCapabilities", error)
    }

    /// # Errors
    /// Fails on an invalid callbacks struct.
    pub fn set_event_callbacks(&self, callbacks: &sys::jvmtiEventCallbacks) -> Result<(), HostError> {
        type SetEventCallbacks =
            unsafe extern "system" fn(jvmtiEnv, *const sys::jvmtiEventCallbacks, jint) -> jvmtiError;
        let size = std::mem::size_of::<sys::jvmtiEventCallbacks>() as jint;
        let error = unsafe {
            let f: SetEventCallbacks = sys::jvmti_function(self.env, sys::JVMTI_SET_EVENT_CALLBACKS);
            f(self.env, callbacks, size)
        };
        self.check("SetEventCallbacks", error)
    }

    /// Enable or disable an event for all threads
    ///
    /// # Errors
    /// Fails when the capability backing the event is missing.
    pub fn set_event_notification_mode(&self, enabled: bool, event: jint) -> Result<(), HostError> {
        type SetEventNotificationMode = unsafe extern "C" fn(jvmtiEnv, jint, jint, jobject, ...) -> jvmtiError;
        let mode = if enabled { sys::JVMTI_ENABLE } else { sys::JVMTI_DISABLE };
        let error = unsafe {
            let f: SetEventNotificationMode =
                sys::jvmti_function(self.env, sys::JVMTI_SET_EVENT_NOTIFICATION_MODE);
            f(self.env, mode, event, ptr::null_mut())
        };
        self.check("SetEventNotificationMode", error)
    }

    /// All loaded classes, as local references of the calling thread
    ///
    /// # Errors
    /// Fails if the VM cannot enumerate classes.
    pub fn loaded_classes(&self) -> Result<Vec<jclass>, HostError> {
        type GetLoadedClasses = unsafe extern "system" fn(jvmtiEnv, *mut jint, *mut *mut jclass) -> jvmtiError;
        let mut count: jint = 0;
        let mut classes = ptr::null_mut();
        let error = unsafe {
            let f: GetLoadedClasses = sys::jvmti_function(self.env, sys::JVMTI_GET_LOADED_CLASSES);
            f(self.env, &mut count, &mut classes)
        };
        self.check("GetLoadedClasses", error)?;
        if classes.is_null() {
            return Ok(Vec::new());
        }
        let list = unsafe { std::slice::from_raw_parts(classes, usize::try_from(count).unwrap_or(0)).to_vec() };
        self.deallocate(classes.cast());
        Ok(list)
    }

    /// Type signature such as `Ljava/lang/String;`
    ///
    /// # Errors
    /// Fails for invalid class references.
    pub fn class_signature(&self, class: jclass) -> Result<String, HostError> {
        type GetClassSignature =
            unsafe extern "system" fn(jvmtiEnv, jclass, *mut *mut c_char, *mut *mut c_char) -> jvmtiError;
        let mut signature = ptr::null_mut();
        let error = unsafe {
            let f: GetClassSignature = sys::jvmti_function(self.env, sys::JVMTI_GET_CLASS_SIGNATURE);
            f(self.env, class, &mut signature, ptr::null_mut())
        };
        self.check("GetClassSignature", error)?;
        if signature.is_null() {
            return Err(HostError::new("GetClassSignature", "no signature"));
        }
        let text = unsafe { CStr::from_ptr(signature) }.to_string_lossy().into_owned();
        self.deallocate(signature.cast());
        Ok(text)
    }

    /// Defining loader of `class`, null for the bootstrap loader
    ///
    /// # Errors
    /// Fails for invalid class references.
    pub fn class_loader(&self, class: jclass) -> Result<jobject, HostError> {
        type GetClassLoader = unsafe extern "system" fn(jvmtiEnv, jclass, *mut jobject) -> jvmtiError;
        let mut loader = ptr::null_mut();
        let error = unsafe {
            let f: GetClassLoader = sys::jvmti_function(self.env, sys::JVMTI_GET_CLASS_LOADER);
            f(self.env, class, &mut loader)
        };
        self.check("GetClassLoader", error)?;
        Ok(loader)
    }

    /// Whether `class` may be retransformed (false for arrays, primitives and
    /// some VM-internal classes)
    #[must_use]
    pub fn is_modifiable(&self, class: jclass) -> bool {
        type IsModifiableClass = unsafe extern "system" fn(jvmtiEnv, jclass, *mut jboolean) -> jvmtiError;
        let mut modifiable: jboolean = 0;
        let error = unsafe {
            let f: IsModifiableClass = sys::jvmti_function(self.env, sys::JVMTI_IS_MODIFIABLE_CLASS);
            f(self.env, class, &mut modifiable)
        };
        error == sys::JVMTI_ERROR_NONE && modifiable != 0
    }

    /// Run classes through the ClassFileLoadHook again
    ///
    /// # Errors
    /// Fails with the VM's verdict, e.g. when new bytes do not verify.
    pub fn retransform_classes(&self, classes: &[jclass]) -> Result<(), HostError> {
        type RetransformClasses = unsafe extern "system" fn(jvmtiEnv, jint, *const jclass) -> jvmtiError;
        let count = jint::try_from(classes.len())
            .map_err(|_| HostError::new("RetransformClasses", "too many classes"))?;
        let error = unsafe {
            let f: RetransformClasses = sys::jvmti_function(self.env, sys::JVMTI_RETRANSFORM_CLASSES);
            f(self.env, count, classes.as_ptr())
        };
        self.check("RetransformClasses", error)
    }

    /// Copy `bytes` into JVMTI-owned memory, as required for hook results.
    /// Ownership passes to the VM once handed back from the hook.
    ///
    /// # Errors
    /// Fails when the VM is out of memory.
    pub fn allocate_copy(&self, bytes: &[u8]) -> Result<*mut u8, HostError> {
        type Allocate = unsafe extern "system" fn(jvmtiEnv, jlong, *mut *mut u8) -> jvmtiError;
        let size = jlong::try_from(bytes.len()).map_err(|_| HostError::new("Allocate", "size overflow"))?;
        let mut mem = ptr::null_mut();
        let error = unsafe {
            let f: Allocate = sys::jvmti_function(self.env, sys::JVMTI_ALLOCATE);
            f(self.env, size, &mut mem)
        };
        self.check("Allocate", error)?;
        unsafe { ptr::copy_nonoverlapping(bytes.as_ptr(), mem, bytes.len()) };
        Ok(mem)
    }

    fn deallocate(&self, mem: *mut u8) {
        type Deallocate = unsafe extern "system" fn(jvmtiEnv, *mut u8) -> jvmtiError;
        if mem.is_null() {
            return;
        }
        unsafe {
            let f: Deallocate = sys::jvmti_function(self.env, sys::JVMTI_DEALLOCATE);
            f(self.env, mem);
        }
    }
}
