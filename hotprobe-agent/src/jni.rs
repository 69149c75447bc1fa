//! Thin wrapper around a thread's `JNIEnv`

use std::ffi::{c_char, CStr, CString};
use std::ptr;

use hotprobe::domain::HostError;

use crate::sys::{self, jboolean, jclass, jint, jmethodID, jobject, jsize, jstring, JNINativeMethod, JNIEnv, JavaVM};

/// A `JNIEnv` is only valid on the thread it was obtained on, so this is
/// neither `Send` nor `Sync`.
#[derive(Debug, Clone, Copy)]
pub struct JniEnv {
    env: JNIEnv,
}

impl JniEnv {
    /// # Safety
    /// `env` must be the live `JNIEnv*` of the calling thread.
    #[must_use]
    pub unsafe fn from_raw(env: JNIEnv) -> Self {
        Self { env }
    }

    /// The calling thread's environment, which must already be attached
    ///
    /// # Safety
    /// `vm` must be a live `JavaVM*`.
    pub unsafe fn from_vm(vm: JavaVM) -> Result<Self, HostError> {
        type GetEnv = unsafe extern "system" fn(JavaVM, *mut *mut std::ffi::c_void, jint) -> jint;
        let get_env: GetEnv = sys::function(vm, sys::VM_GET_ENV);
        let mut env = ptr::null_mut();
        let rc = get_env(vm, &mut env, sys::JNI_VERSION_1_6);
        if rc != sys::JNI_OK || env.is_null() {
            return Err(HostError::new("GetEnv", format!("JNI 1.6 unavailable (rc {rc})")));
        }
        Ok(Self { env: env.cast_const().cast() })
    }

    /// Clear and report a pending Java exception
    fn take_exception(&self, operation: &'static str) -> Result<(), HostError> {
        type ExceptionCheck = unsafe extern "system" fn(JNIEnv) -> jboolean;
        type ExceptionClear = unsafe extern "system" fn(JNIEnv);
        unsafe {
            let check: ExceptionCheck = sys::function(self.env, sys::JNI_EXCEPTION_CHECK);
            if check(self.env) == 0 {
                return Ok(());
            }
            let clear: ExceptionClear = sys::function(self.env, sys::JNI_EXCEPTION_CLEAR);
            clear(self.env);
        }
        Err(HostError::new(operation, "Java exception thrown"))
    }

    fn non_null(&self, operation: &'static str, object: jobject) -> Result<jobject, HostError> {
        self.take_exception(operation)?;
        if object.is_null() {
            return Err(HostError::new(operation, "returned null"));
        }
        Ok(object)
    }

    /// # Errors
    /// Fails when the class cannot be found.
    pub fn find_class(&self, name: &str) -> Result<jclass, HostError> {
        type FindClass = unsafe extern "system" fn(JNIEnv, *const c_char) -> jclass;
        let name = c_string("FindClass", name)?;
        let class = unsafe {
            let f: FindClass = sys::function(self.env, sys::JNI_FIND_CLASS);
            f(self.env, name.as_ptr())
        };
        self.non_null("FindClass", class)
    }

    /// # Errors
    /// Fails when the class is malformed or already defined in `loader`.
    pub fn define_class(&self, name: &str, loader: jobject, bytes: &[u8]) -> Result<jclass, HostError> {
        type DefineClass = unsafe extern "system" fn(JNIEnv, *const c_char, jobject, *const i8, jsize) -> jclass;
        let name = c_string("DefineClass", name)?;
        let len = jsize::try_from(bytes.len()).map_err(|_| HostError::new("DefineClass", "class too large"))?;
        let class = unsafe {
            let f: DefineClass = sys::function(self.env, sys::JNI_DEFINE_CLASS);
            f(self.env, name.as_ptr(), loader, bytes.as_ptr().cast(), len)
        };
        self.non_null("DefineClass", class)
    }

    /// # Errors
    /// Fails when a native does not match a declared method.
    pub fn register_natives(&self, class: jclass, methods: &[JNINativeMethod]) -> Result<(), HostError> {
        type RegisterNatives = unsafe extern "system" fn(JNIEnv, jclass, *const JNINativeMethod, jint) -> jint;
        let count = jint::try_from(methods.len()).map_err(|_| HostError::new("RegisterNatives", "too many methods"))?;
        let rc = unsafe {
            let f: RegisterNatives = sys::function(self.env, sys::JNI_REGISTER_NATIVES);
            f(self.env, class, methods.as_ptr(), count)
        };
        self.take_exception("RegisterNatives")?;
        if rc != sys::JNI_OK {
            return Err(HostError::new("RegisterNatives", format!("rc {rc}")));
        }
        Ok(())
    }

    /// Call a static method taking no arguments and returning an object
    ///
    /// # Errors
    /// Fails when the method does not exist, throws or returns null.
    pub fn call_static_object_method(&self, class: jclass, name: &str, descriptor: &str) -> Result<jobject, HostError> {
        type GetStaticMethodId = unsafe extern "system" fn(JNIEnv, jclass, *const c_char, *const c_char) -> jmethodID;
        type CallStaticObjectMethodA = unsafe extern "system" fn(JNIEnv, jclass, jmethodID, *const u64) -> jobject;
        let c_name = c_string("GetStaticMethodID", name)?;
        let c_descriptor = c_string("GetStaticMethodID", descriptor)?;
        let method = unsafe {
            let f: GetStaticMethodId = sys::function(self.env, sys::JNI_GET_STATIC_METHOD_ID);
            f(self.env, class, c_name.as_ptr(), c_descriptor.as_ptr())
        };
        let method = self.non_null("GetStaticMethodID", method)?;
        let result = unsafe {
            let f: CallStaticObjectMethodA = sys::function(self.env, sys::JNI_CALL_STATIC_OBJECT_METHOD_A);
            f(self.env, class, method, ptr::null())
        };
        self.non_null("CallStaticObjectMethodA", result)
    }

    /// Promote to a global reference, valid on every thread until the VM exits
    ///
    /// # Errors
    /// Fails when the VM is out of memory.
    pub fn new_global_ref(&self, object: jobject) -> Result<jobject, HostError> {
        type NewGlobalRef = unsafe extern "system" fn(JNIEnv, jobject) -> jobject;
        let global = unsafe {
            let f: NewGlobalRef = sys::function(self.env, sys::JNI_NEW_GLOBAL_REF);
            f(self.env, object)
        };
        self.non_null("NewGlobalRef", global)
    }

    pub fn delete_local_ref(&self, object: jobject) {
        type DeleteLocalRef = unsafe extern "system" fn(JNIEnv, jobject);
        if object.is_null() {
            return;
        }
        unsafe {
            let f: DeleteLocalRef = sys::function(self.env, sys::JNI_DELETE_LOCAL_REF);
            f(self.env, object);
        }
    }

    #[must_use]
    pub fn is_same_object(&self, a: jobject, b: jobject) -> bool {
        type IsSameObject = unsafe extern "system" fn(JNIEnv, jobject, jobject) -> jboolean;
        unsafe {
            let f: IsSameObject = sys::function(self.env, sys::JNI_IS_SAME_OBJECT);
            f(self.env, a, b) != 0
        }
    }

    /// Class of an object, as a local reference
    #[must_use]
    pub fn object_class(&self, object: jobject) -> jclass {
        type GetObjectClass = unsafe extern "system" fn(JNIEnv, jobject) -> jclass;
        unsafe {
            let f: GetObjectClass = sys::function(self.env, sys::JNI_GET_OBJECT_CLASS);
            f(self.env, object)
        }
    }

    /// Copy a Java string out of the VM. `None` for null references.
    #[must_use]
    pub fn string(&self, string: jstring) -> Option<String> {
        type GetStringUtfChars = unsafe extern "system" fn(JNIEnv, jstring, *mut jboolean) -> *const c_char;
        type ReleaseStringUtfChars = unsafe extern "system" fn(JNIEnv, jstring, *const c_char);
        if string.is_null() {
            return None;
        }
        unsafe {
            let get: GetStringUtfChars = sys::function(self.env, sys::JNI_GET_STRING_UTF_CHARS);
            let chars = get(self.env, string, ptr::null_mut());
            if chars.is_null() {
                return None;
            }
            let text = CStr::from_ptr(chars).to_string_lossy().into_owned();
            let release: ReleaseStringUtfChars = sys::function(self.env, sys::JNI_RELEASE_STRING_UTF_CHARS);
            release(self.env, string, chars);
            Some(text)
        }
    }
}

fn c_string(operation: &'static str, value: &str) -> Result<CString, HostError> {
    CString::new(value).map_err(|_| HostError::new(operation, format!("interior NUL in {value:?}")))
}
