//! Hook lifecycle driven through a fake host

mod support;

use std::borrow::Cow;
use std::sync::Mutex;

use hotprobe::classfile::{self, serialize, ClassBuilder};
use hotprobe::domain::{EngineError, HostError};
use hotprobe::engine::{EngineConfig, Instrumentation, InstrumentationEngine, LoadedClass, TransformRequest};
use hotprobe::scope::{LoaderId, ScopeFilter};

/// Host whose "VM" holds class bytes and reruns the hook on retransform,
/// as JVMTI does
struct FakeVm<'e> {
    engine: &'e InstrumentationEngine,
    hook_enabled: Mutex<bool>,
    classes: Mutex<Vec<(String, LoaderId, Vec<u8>)>>,
}

impl<'e> FakeVm<'e> {
    fn new(engine: &'e InstrumentationEngine) -> Self {
        Self { engine, hook_enabled: Mutex::new(false), classes: Mutex::new(Vec::new()) }
    }

    /// Define a class, passing it through the hook when enabled
    fn load(&self, name: &str, loader: LoaderId, bytes: Vec<u8>) -> Vec<u8> {
        let defined = if *self.hook_enabled.lock().unwrap() {
            let request = TransformRequest { class_name: Some(name), loader: &loader, bytes: &bytes, redefining: false };
            self.engine.transform(&request).into_owned()
        } else {
            bytes
        };
        self.classes.lock().unwrap().push((name.to_string(), loader, defined.clone()));
        defined
    }

    fn bytes_of(&self, name: &str) -> Vec<u8> {
        let classes = self.classes.lock().unwrap();
        classes.iter().find(|(n, _, _)| n == name).map(|(_, _, b)| b.clone()).unwrap()
    }
}

impl Instrumentation for FakeVm<'_> {
    type Class = String;

    fn set_hook_enabled(&self, enabled: bool) -> Result<(), HostError> {
        *self.hook_enabled.lock().unwrap() = enabled;
        Ok(())
    }

    fn loaded_classes(&self) -> Result<Vec<LoadedClass<String>>, HostError> {
        let classes = self.classes.lock().unwrap();
        Ok(classes
            .iter()
            .map(|(name, loader, _)| LoadedClass {
                name: name.clone(),
                loader: loader.clone(),
                modifiable: true,
                handle: name.clone(),
            })
            .collect())
    }

    fn retransform_classes(&self, classes: &[String]) -> Result<(), HostError> {
        let mut loaded = self.classes.lock().unwrap();
        for name in classes {
            let (_, loader, bytes) = loaded
                .iter_mut()
                .find(|(n, _, _)| n == name)
                .ok_or_else(|| HostError::new("RetransformClasses", format!("{name} not loaded")))?;
            let request =
                TransformRequest { class_name: Some(name.as_str()), loader: &*loader, bytes: &bytes[..], redefining: true };
            let rewritten = self.engine.transform(&request).into_owned();
            *bytes = rewritten;
        }
        Ok(())
    }
}

fn probe_calls(bytes: &[u8]) -> usize {
    let unit = classfile::parse(bytes).unwrap();
    unit.methods
        .iter()
        .filter_map(|m| m.body())
        .flat_map(|b| b.opcodes())
        .filter(|i| match i {
            classfile::Instruction::Member { index, .. } => {
                unit.constant_pool.member_ref(*index).is_some_and(|m| m.owner == hotprobe_common::SINK_CLASS)
            }
            _ => false,
        })
        .count()
}

#[test]
fn test_install_retransforms_classes_loaded_before() {
    let engine = InstrumentationEngine::init(EngineConfig::default());
    let vm = FakeVm::new(&engine);
    vm.load("Sample", LoaderId::System, support::sample_class());
    assert_eq!(probe_calls(&vm.bytes_of("Sample")), 0);

    let report = engine.install(&vm).unwrap();
    assert_eq!((report.candidates, report.retransformed), (1, 1));
    assert!(report.failures.is_empty());
    assert_eq!(probe_calls(&vm.bytes_of("Sample")), 2);
}

#[test]
fn test_classes_loaded_after_install_are_instrumented() {
    let engine = InstrumentationEngine::init(EngineConfig::default());
    let vm = FakeVm::new(&engine);
    engine.install(&vm).unwrap();

    let defined = vm.load("demo/Pick", LoaderId::System, support::pick_class());
    assert_eq!(probe_calls(&defined), 3);
    assert_eq!(engine.stats().unwrap().instrumented, 1);
}

#[test]
fn test_second_install_conflicts_and_keeps_the_first_hook() {
    let engine = InstrumentationEngine::init(EngineConfig::default());
    let vm = FakeVm::new(&engine);
    engine.install(&vm).unwrap();

    assert_eq!(engine.install(&vm), Err(EngineError::HookConflict));
    assert!(engine.is_installed());
    let defined = vm.load("Sample", LoaderId::System, support::sample_class());
    assert_eq!(probe_calls(&defined), 2);
}

#[test]
fn test_uninstall_stops_rewriting_new_classes() {
    let engine = InstrumentationEngine::init(EngineConfig::default());
    let vm = FakeVm::new(&engine);
    engine.install(&vm).unwrap();
    engine.uninstall(&vm).unwrap();

    let original = support::sample_class();
    assert_eq!(vm.load("Sample", LoaderId::System, original.clone()), original);
    assert_eq!(engine.uninstall(&vm), Err(EngineError::NotInstalled));

    // A fresh install works again
    engine.install(&vm).unwrap();
    assert_eq!(probe_calls(&vm.bytes_of("Sample")), 2);
}

#[test]
fn test_sink_class_is_never_rewritten() {
    let engine = InstrumentationEngine::init(EngineConfig::default());
    let vm = FakeVm::new(&engine);
    engine.install(&vm).unwrap();

    let mut builder = ClassBuilder::new(hotprobe_common::SINK_CLASS, "java/lang/Object").unwrap();
    builder
        .method(
            0x0008,
            "helper",
            "()V",
            Some(classfile::MethodCode::new(classfile::builder::labelled(vec![classfile::Instruction::Op(
                classfile::opcodes::RETURN,
            )]))),
        )
        .unwrap();
    let bytes = serialize(&builder.build()).unwrap();
    let request = TransformRequest {
        class_name: Some(hotprobe_common::SINK_CLASS),
        loader: &LoaderId::System,
        bytes: &bytes,
        redefining: false,
    };
    assert!(matches!(engine.transform(&request), Cow::Borrowed(b) if b == &bytes[..]));
}

#[test]
fn test_untrusted_loader_gets_identical_bytes() {
    let engine = InstrumentationEngine::init(EngineConfig::default());
    let vm = FakeVm::new(&engine);
    engine.install(&vm).unwrap();

    let original = support::sample_class();
    let plugin = LoaderId::Other("org/example/PluginLoader".to_string());
    assert_eq!(vm.load("Sample", plugin.clone(), original.clone()), original);
    assert_eq!(vm.load("Sample", LoaderId::Bootstrap, original.clone()), original);
}

#[test]
fn test_garbage_bytes_are_returned_unchanged() {
    let engine = InstrumentationEngine::init(EngineConfig::default());
    let vm = FakeVm::new(&engine);
    engine.install(&vm).unwrap();

    let garbage = vec![0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00];
    assert_eq!(vm.load("app/Broken", LoaderId::System, garbage.clone()), garbage);
    assert_eq!(engine.stats().unwrap().failed, 1);

    // A failure does not disturb later classes
    assert_eq!(probe_calls(&vm.load("Sample", LoaderId::System, support::sample_class())), 2);
}

#[test]
fn test_include_prefixes_restrict_scope() {
    let filter = ScopeFilter::default().include("demo/");
    let engine = InstrumentationEngine::init(EngineConfig { filter, ..EngineConfig::default() });
    let vm = FakeVm::new(&engine);
    engine.install(&vm).unwrap();

    assert_eq!(probe_calls(&vm.load("Sample", LoaderId::System, support::sample_class())), 0);
    assert_eq!(probe_calls(&vm.load("demo/Pick", LoaderId::System, support::pick_class())), 3);
}
