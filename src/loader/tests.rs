use super::{LM_ID_BASE, base_program, definition, find_in_namespace, module_chain, namespace_id, symbol};

#[test]
fn base_program_is_in_base_namespace() {
    let handle = base_program().unwrap();
    assert_eq!(namespace_id(handle).unwrap(), LM_ID_BASE);
}

#[test]
fn base_chain_declares_libc() {
    let handle = base_program().unwrap();
    let modules = module_chain(handle).unwrap();
    assert!(!modules.is_empty());
    // the test executable itself is the head and is named ""
    assert_eq!(modules[0].name(), "");
    assert!(modules.iter().any(|module| module.needs("libc.so.6")));
}

#[test]
fn definition_rejects_foreign_symbols() {
    let libc_handle = find_in_namespace(LM_ID_BASE, "libc.so.6").unwrap();
    let malloc = definition(libc_handle, "malloc");
    assert!(malloc.is_some());
    assert_eq!(malloc, symbol(libc_handle, "malloc"));

    // dlsym on the main program finds malloc through its dependencies, but it is not defined there
    let program = base_program().unwrap();
    assert!(symbol(program, "malloc").is_some());
    assert!(definition(program, "malloc").is_none());
}

#[test]
fn find_in_namespace_requires_loaded_library() {
    let err = find_in_namespace(LM_ID_BASE, "libspytester-absent.so.9").unwrap_err();
    assert!(matches!(err, crate::Error::LibraryNotLoaded(_)));
}
