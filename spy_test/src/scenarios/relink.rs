use spytester::{BindingKind, Error, RelinkPolicy, RunState};

use crate::test_ctx::{load_fixture, settle, started_root};

const LIBM: &str = "libm.so.6";

fn assert_cube_root_of_27(value: f64) {
    // glibc's cbrt is not correctly rounded: cbrt(27.0) is one ulp above 3.0
    assert!((value - 3.0).abs() < 1e-12, "cbrt(27.0) returned {value}");
}

// cbrt as the tester's own namespace resolves it
fn base_cbrt() -> usize {
    unsafe { libc::dlsym(libc::RTLD_DEFAULT, c"cbrt".as_ptr()) as usize }
}

#[link(name = "m")]
unsafe extern "C" {
    fn cbrt(x: f64) -> f64;
}

pub fn scenario_relink_libm() {
    let program = load_fixture(&[]);
    let root = started_root(&program);

    assert!(matches!(
        program.relink("libspytester-absent.so.1"),
        Err(Error::LibraryNotLoaded(_))
    ));
    assert_cube_root_of_27(unsafe { cbrt(27.0) });
    let original = base_cbrt();
    assert!(original != 0);

    program.load_library(LIBM).expect("loading libm into the namespace failed");
    let alternate = program
        .library_symbol(LIBM, "cbrt")
        .expect("cbrt missing from the namespace copy");

    let report = program.relink(LIBM).expect("relink failed");
    assert!(!report.dependents.is_empty());
    let binding = report
        .patched_symbol("cbrt")
        .next()
        .expect("cbrt binding was not redirected");
    assert_eq!(binding.target, alternate);
    assert_ne!(alternate, original, "the namespace copy of libm is the base copy");
    assert!(matches!(binding.kind, BindingKind::GlobalData | BindingKind::JumpSlot));

    let tracer = program.tracer();
    let slot = unsafe { tracer.read_word(binding.slot) }.expect("read back failed");
    assert_eq!(slot, alternate);
    assert_ne!(slot, original);
    // calls go through the slot, so they now land in the namespace copy
    assert_cube_root_of_27(unsafe { cbrt(27.0) });
    // the tester's global scope still resolves the base copy
    assert_eq!(base_cbrt(), original);

    program.terminate().expect("terminate failed");
    settle(&root, RunState::Terminated);
}

pub fn scenario_relink_undeclared_library() {
    let program = load_fixture(&[]);
    let root = started_root(&program);

    // the fixture itself is loaded in the namespace, but no tester module depends on it
    let path = program.path().to_string();
    let report = program
        .relink_with_policy(&path, RelinkPolicy::Strict)
        .expect("relink of an undeclared library failed");
    assert!(report.modules_scanned > 0);
    assert!(report.dependents.is_empty());
    assert!(report.patched.is_empty());
    assert!(report.is_complete());

    program.terminate().expect("terminate failed");
    settle(&root, RunState::Terminated);
}
