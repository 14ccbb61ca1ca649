use super::*;
use crate::elf::fixture::{
    FAKE_NEEDED, SLOT_ABS, SLOT_FUNC, SLOT_GLOBAL, SLOT_MISSING, SLOT_RELATIVE, SyntheticModule,
};
use crate::elf::R_GENERIC_ABS;
use crate::sync::MutexPoisonRecover;
use crate::tracer::Tracer;
use std::collections::HashMap;
use std::sync::Mutex;

const GLOBAL_TARGET: usize = 0xaaaa_0000;
const FUNC_TARGET: usize = 0xbbbb_0000;

struct MapSource(HashMap<&'static str, usize>);

impl MapSource {
    fn new(entries: &[(&'static str, usize)]) -> Self {
        Self(entries.iter().copied().collect())
    }
}

impl SymbolSource for MapSource {
    fn resolve(&self, symbol: &str) -> Option<usize> {
        self.0.get(symbol).copied()
    }
}

#[derive(Default)]
struct RecordingWriter(Mutex<Vec<(usize, usize)>>);

impl SlotWriter for RecordingWriter {
    fn write_slot(&self, addr: usize, value: usize) -> Result<usize> {
        self.0.lock_or_poison().push((addr, value));
        Ok(0)
    }
}

struct FailingWriter;

impl SlotWriter for FailingWriter {
    fn write_slot(&self, addr: usize, _value: usize) -> Result<usize> {
        Err(Error::Memory {
            addr,
            reason: "read-only for the test".into(),
        })
    }
}

fn alternate() -> MapSource {
    MapSource::new(&[("spy_global", GLOBAL_TARGET), ("spy_func", FUNC_TARGET)])
}

fn with_engine(test: impl FnOnce(&Tracer)) {
    let tracer = Tracer::spawn(|_| Ok(())).unwrap();
    test(&tracer);
}

#[test]
fn tolerant_relink_patches_resolvable_bindings() {
    let module = SyntheticModule::new(FAKE_NEEDED);
    let modules = [module.image("synthetic")];
    let alternate = alternate();
    let targets = RelinkTargets {
        alternate: &alternate,
        original: None,
    };

    with_engine(|tracer| {
        let writer = CommandSlotWriter(Arc::clone(tracer.core()));
        let report =
            relink_modules(FAKE_NEEDED, &modules, &targets, &writer, RelinkPolicy::Tolerant).unwrap();

        assert_eq!(report.modules_scanned, 1);
        assert_eq!(report.dependents, vec!["synthetic".to_string()]);
        assert_eq!(report.patched.len(), 2);
        let global = report.patched_symbol("spy_global").next().unwrap();
        assert_eq!(global.kind, BindingKind::GlobalData);
        assert_eq!(global.slot, module.slot_addr(SLOT_GLOBAL));
        assert_eq!(global.previous, 0x1000);
        assert_eq!(global.target, GLOBAL_TARGET);
        let func = report.patched_symbol("spy_func").next().unwrap();
        assert_eq!(func.kind, BindingKind::JumpSlot);

        // read back through the command channel
        let slot = module.slot_addr(SLOT_GLOBAL);
        assert_eq!(unsafe { tracer.read_word(slot) }.unwrap(), GLOBAL_TARGET);
        assert_eq!(module.slot_value(SLOT_FUNC), FUNC_TARGET);

        assert_eq!(module.slot_value(SLOT_MISSING), 0x2000);
        assert_eq!(module.slot_value(SLOT_RELATIVE), 0x3000);
        assert_eq!(module.slot_value(SLOT_ABS), 0x5000);

        let reasons: Vec<_> = report
            .skipped
            .iter()
            .map(|skipped| (skipped.symbol.as_str(), skipped.reason.clone()))
            .collect();
        assert_eq!(
            reasons,
            vec![
                ("spy_missing", SkipReason::Unresolved),
                ("spy_func", SkipReason::UnsupportedKind(R_GENERIC_ABS)),
            ]
        );
    });
}

#[test]
fn bindings_foreign_to_the_library_are_not_reported() {
    let module = SyntheticModule::new(FAKE_NEEDED);
    let modules = [module.image("synthetic")];
    let alternate = alternate();
    let original = MapSource::new(&[("spy_global", 0x1), ("spy_func", 0x2)]);
    let targets = RelinkTargets {
        alternate: &alternate,
        original: Some(&original),
    };

    let writer = RecordingWriter::default();
    let report =
        relink_modules(FAKE_NEEDED, &modules, &targets, &writer, RelinkPolicy::Tolerant).unwrap();
    assert!(report.skipped.iter().all(|skipped| skipped.symbol != "spy_missing"));
    assert_eq!(writer.0.lock_or_poison().len(), 2);
}

#[test]
fn undeclared_dependency_is_a_no_op() {
    let module = SyntheticModule::new(FAKE_NEEDED);
    let modules = [module.image("synthetic")];
    let alternate = alternate();
    let targets = RelinkTargets {
        alternate: &alternate,
        original: None,
    };

    let writer = RecordingWriter::default();
    let report =
        relink_modules("libother.so.2", &modules, &targets, &writer, RelinkPolicy::Strict).unwrap();
    assert_eq!(report.modules_scanned, 1);
    assert!(report.dependents.is_empty());
    assert!(report.patched.is_empty());
    assert!(report.is_complete());
    assert!(writer.0.lock_or_poison().is_empty());
    assert_eq!(module.slot_value(SLOT_GLOBAL), 0x1000);
}

#[test]
fn strict_relink_fails_but_keeps_writes() {
    let module = SyntheticModule::new(FAKE_NEEDED);
    let modules = [module.image("synthetic")];
    let alternate = alternate();
    let targets = RelinkTargets {
        alternate: &alternate,
        original: None,
    };

    with_engine(|tracer| {
        let writer = CommandSlotWriter(Arc::clone(tracer.core()));
        let result = relink_modules(FAKE_NEEDED, &modules, &targets, &writer, RelinkPolicy::Strict);
        match result {
            Err(Error::RelinkIncomplete { library, skipped }) => {
                assert_eq!(library, FAKE_NEEDED);
                assert_eq!(skipped, 2);
            }
            other => panic!("expected RelinkIncomplete, got {other:?}"),
        }
        assert_eq!(module.slot_value(SLOT_GLOBAL), GLOBAL_TARGET);
    });
}

#[test]
fn failed_writes_are_reported() {
    let module = SyntheticModule::new(FAKE_NEEDED);
    let modules = [module.image("synthetic")];
    let alternate = alternate();
    let targets = RelinkTargets {
        alternate: &alternate,
        original: None,
    };

    let report =
        relink_modules(FAKE_NEEDED, &modules, &targets, &FailingWriter, RelinkPolicy::Tolerant)
            .unwrap();
    assert!(report.patched.is_empty());
    let failed = report
        .skipped
        .iter()
        .filter(|skipped| matches!(skipped.reason, SkipReason::WriteFailed(_)))
        .count();
    assert_eq!(failed, 2);
    assert_eq!(module.slot_value(SLOT_FUNC), 0x4000);
}

#[test]
fn library_path_matches_its_needed_entry() {
    let module = SyntheticModule::new(FAKE_NEEDED);
    let modules = [module.image("synthetic")];
    let alternate = alternate();
    let targets = RelinkTargets {
        alternate: &alternate,
        original: None,
    };

    let writer = RecordingWriter::default();
    let path = format!("/opt/spy/{FAKE_NEEDED}");
    let report = relink_modules(&path, &modules, &targets, &writer, RelinkPolicy::Tolerant).unwrap();
    assert_eq!(report.dependents.len(), 1);
    assert_eq!(report.patched.len(), 2);
}

#[test]
fn tester_modules_bind_malloc_through_libc() {
    let base = loader::base_program().unwrap();
    let modules = loader::module_chain(base).unwrap();
    let alternate = MapSource::new(&[("malloc", 0x1234_5678)]);
    let targets = RelinkTargets {
        alternate: &alternate,
        original: Some(&alternate),
    };

    let writer = RecordingWriter::default();
    let report =
        relink_modules("libc.so.6", &modules, &targets, &writer, RelinkPolicy::Tolerant).unwrap();
    assert!(!report.dependents.is_empty());
    assert!(report.patched_symbol("malloc").count() >= 1);
    assert!(report.patched.iter().all(|binding| binding.target == 0x1234_5678));
    assert_eq!(writer.0.lock_or_poison().len(), report.patched.len());
}
