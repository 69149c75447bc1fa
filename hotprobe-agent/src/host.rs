//! [`Instrumentation`] backed by a live JVMTI environment

use hotprobe::domain::HostError;
use hotprobe::engine::{Instrumentation, LoadedClass};
use hotprobe::scope::LoaderId;
use log::debug;

use crate::jni::JniEnv;
use crate::jvmti::Jvmti;
use crate::sys::{self, jclass, jobject};

/// A class reference handed to `RetransformClasses`.
/// Local to the thread that listed the classes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClassRef(pub jclass);

/// Resolves a defining loader to the identity the scope filter reasons about
#[derive(Debug, Clone, Copy)]
pub struct LoaderResolver {
    jvmti: Jvmti,
    /// Global reference to the system class loader
    system_loader: jobject,
}

// SAFETY: `system_loader` is a global reference, valid on every thread
unsafe impl Send for LoaderResolver {}
unsafe impl Sync for LoaderResolver {}

impl LoaderResolver {
    #[must_use]
    pub fn new(jvmti: Jvmti, system_loader: jobject) -> Self {
        Self { jvmti, system_loader }
    }

    #[must_use]
    pub fn resolve(&self, jni: &JniEnv, loader: jobject) -> LoaderId {
        if loader.is_null() {
            return LoaderId::Bootstrap;
        }
        if jni.is_same_object(loader, self.system_loader) {
            return LoaderId::System;
        }
        let class = jni.object_class(loader);
        let name = self
            .jvmti
            .class_signature(class)
            .ok()
            .and_then(|s| class_name_from_signature(&s).map(str::to_string))
            .unwrap_or_else(|| "<unknown loader>".to_string());
        jni.delete_local_ref(class);
        LoaderId::Other(name)
    }
}

/// `Lpkg/Name;` to `pkg/Name`. `None` for array and primitive signatures.
#[must_use]
pub fn class_name_from_signature(signature: &str) -> Option<&str> {
    signature.strip_prefix('L')?.strip_suffix(';')
}

/// The engine's view of the VM for one install or uninstall call
pub struct JvmtiHost {
    jvmti: Jvmti,
    jni: JniEnv,
    loaders: LoaderResolver,
}

impl JvmtiHost {
    #[must_use]
    pub fn new(jvmti: Jvmti, jni: JniEnv, loaders: LoaderResolver) -> Self {
        Self { jvmti, jni, loaders }
    }
}

impl Instrumentation for JvmtiHost {
    type Class = ClassRef;

    fn set_hook_enabled(&self, enabled: bool) -> Result<(), HostError> {
        self.jvmti
            .set_event_notification_mode(enabled, sys::JVMTI_EVENT_CLASS_FILE_LOAD_HOOK)
    }

    fn loaded_classes(&self) -> Result<Vec<LoadedClass<ClassRef>>, HostError> {
        let mut loaded = Vec::new();
        for class in self.jvmti.loaded_classes()? {
            let named = self
                .jvmti
                .class_signature(class)
                .ok()
                .and_then(|s| class_name_from_signature(&s).map(str::to_string));
            let Some(name) = named else {
                continue;
            };
            let loader = match self.jvmti.class_loader(class) {
                Ok(loader) => loader,
                Err(e) => {
                    debug!("{name}: {e}");
                    continue;
                }
            };
            let loader_id = self.loaders.resolve(&self.jni, loader);
            self.jni.delete_local_ref(loader);
            loaded.push(LoadedClass {
                modifiable: self.jvmti.is_modifiable(class),
                name,
                loader: loader_id,
                handle: ClassRef(class),
            });
        }
        Ok(loaded)
    }

    fn retransform_classes(&self, classes: &[ClassRef]) -> Result<(), HostError> {
        let raw: Vec<jclass> = classes.iter().map(|c| c.0).collect();
        self.jvmti.retransform_classes(&raw)
    }
}
