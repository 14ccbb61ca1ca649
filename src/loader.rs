// Dynamic-loader namespace facilities: dlmopen/dlinfo resolution, handles, link-map chains
use crate::elf::{ElfDyn, ModuleImage};
use crate::error::{Error, Result};
use crate::log;
use once_cell::sync::OnceCell;
use std::ffi::{CStr, CString, c_char, c_int, c_void};
use std::ptr;

pub type Lmid = libc::c_long;

pub(crate) const LM_ID_BASE: Lmid = 0;
pub(crate) const LM_ID_NEWLM: Lmid = -1;

const RTLD_DI_LMID: c_int = 1;
const RTLD_DI_LINKMAP: c_int = 2;
// guards against a corrupted l_prev chain
const LINK_MAP_WALK_LIMIT: usize = 4096;

// glibc struct link_map, public prefix only
#[repr(C)]
pub(crate) struct LinkMap {
    pub(crate) l_addr: usize,
    pub(crate) l_name: *const c_char,
    pub(crate) l_ld: *const ElfDyn,
    pub(crate) l_next: *mut LinkMap,
    pub(crate) l_prev: *mut LinkMap,
}

type DlmopenFn = unsafe extern "C" fn(Lmid, *const c_char, c_int) -> *mut c_void;
type DlinfoFn = unsafe extern "C" fn(*mut c_void, c_int, *mut c_void) -> c_int;

// Looked up at runtime: libc declares neither, and on older glibc they live in libdl
fn resolve_dl_fn(name: &CStr) -> *mut c_void {
    let mut symbol = unsafe { libc::dlsym(libc::RTLD_DEFAULT, name.as_ptr()) };
    if symbol.is_null() {
        let handle =
            unsafe { libc::dlopen(c"libdl.so.2".as_ptr(), libc::RTLD_NOW | libc::RTLD_NOLOAD) };
        if !handle.is_null() {
            symbol = unsafe { libc::dlsym(handle, name.as_ptr()) };
            unsafe {
                libc::dlclose(handle);
            }
        }
    }
    symbol
}

fn dlmopen_fn() -> Result<DlmopenFn> {
    static DLMOPEN_FN: OnceCell<Option<DlmopenFn>> = OnceCell::new();
    DLMOPEN_FN
        .get_or_init(|| {
            let symbol = resolve_dl_fn(c"dlmopen");
            if symbol.is_null() {
                log::error(format_args!("dlmopen symbol unavailable"));
                None
            } else {
                log::debug(format_args!("dlmopen resolved at 0x{:x}", symbol as usize));
                Some(unsafe { std::mem::transmute::<*mut c_void, DlmopenFn>(symbol) })
            }
        })
        .ok_or_else(|| Error::Loader("dlmopen is not available".into()))
}

fn dlinfo_fn() -> Result<DlinfoFn> {
    static DLINFO_FN: OnceCell<Option<DlinfoFn>> = OnceCell::new();
    DLINFO_FN
        .get_or_init(|| {
            let symbol = resolve_dl_fn(c"dlinfo");
            if symbol.is_null() {
                log::error(format_args!("dlinfo symbol unavailable"));
                None
            } else {
                Some(unsafe { std::mem::transmute::<*mut c_void, DlinfoFn>(symbol) })
            }
        })
        .ok_or_else(|| Error::Loader("dlinfo is not available".into()))
}

fn last_dl_error() -> String {
    let message = unsafe { libc::dlerror() };
    if message.is_null() {
        return "unknown dynamic loader error".into();
    }
    unsafe { CStr::from_ptr(message) }
        .to_string_lossy()
        .into_owned()
}

fn c_string(text: &str) -> Result<CString> {
    CString::new(text).map_err(|_| Error::Loader(format!("{text:?} contains a NUL byte")))
}

// Opaque dlopen-family handle, kept as an address so owners stay Send + Sync
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct LibraryHandle(usize);

impl LibraryHandle {
    fn as_ptr(self) -> *mut c_void {
        self.0 as *mut c_void
    }
}

fn open(lmid: Lmid, name: &str, flags: c_int) -> std::result::Result<LibraryHandle, String> {
    let dlmopen = dlmopen_fn().map_err(|err| err.to_string())?;
    let name = CString::new(name).map_err(|_| format!("{name:?} contains a NUL byte"))?;
    let handle = unsafe { dlmopen(lmid, name.as_ptr(), flags) };
    if handle.is_null() {
        return Err(last_dl_error());
    }
    Ok(LibraryHandle(handle as usize))
}

// Loads a program image into a fresh namespace and reports the namespace id
pub(crate) fn open_new_namespace(path: &str) -> Result<(LibraryHandle, Lmid)> {
    let handle = open(LM_ID_NEWLM, path, libc::RTLD_NOW).map_err(|reason| Error::NamespaceLoad {
        path: path.to_string(),
        reason,
    })?;
    match namespace_id(handle) {
        Ok(lmid) => {
            log::debug(format_args!("loaded {path} into namespace {lmid}"));
            Ok((handle, lmid))
        }
        Err(err) => {
            close(handle);
            Err(Error::NamespaceLoad {
                path: path.to_string(),
                reason: err.to_string(),
            })
        }
    }
}

pub(crate) fn open_in_namespace(lmid: Lmid, name: &str) -> Result<LibraryHandle> {
    open(lmid, name, libc::RTLD_NOW).map_err(Error::Loader)
}

// Handle to an already loaded library, without loading it
pub(crate) fn find_in_namespace(lmid: Lmid, name: &str) -> Result<LibraryHandle> {
    open(lmid, name, libc::RTLD_LAZY | libc::RTLD_NOLOAD).map_err(|reason| {
        log::debug(format_args!("{name} not loaded in namespace {lmid}: {reason}"));
        Error::LibraryNotLoaded(name.to_string())
    })
}

// The tester's own executable in the base namespace
pub(crate) fn base_program() -> Result<LibraryHandle> {
    let handle = unsafe { libc::dlopen(ptr::null(), libc::RTLD_LAZY) };
    if handle.is_null() {
        return Err(Error::Loader(last_dl_error()));
    }
    Ok(LibraryHandle(handle as usize))
}

pub(crate) fn close(handle: LibraryHandle) {
    if unsafe { libc::dlclose(handle.as_ptr()) } != 0 {
        log::warn(format_args!("dlclose failed: {}", last_dl_error()));
    }
}

pub(crate) fn namespace_id(handle: LibraryHandle) -> Result<Lmid> {
    let dlinfo = dlinfo_fn()?;
    let mut lmid: Lmid = 0;
    let info_ptr = (&mut lmid as *mut Lmid).cast::<c_void>();
    if unsafe { dlinfo(handle.as_ptr(), RTLD_DI_LMID, info_ptr) } != 0 {
        return Err(Error::Loader(last_dl_error()));
    }
    Ok(lmid)
}

pub(crate) fn link_map(handle: LibraryHandle) -> Result<*mut LinkMap> {
    let dlinfo = dlinfo_fn()?;
    let mut link_map_ptr: *mut LinkMap = ptr::null_mut();
    let info_ptr = (&mut link_map_ptr as *mut *mut LinkMap).cast::<c_void>();
    if unsafe { dlinfo(handle.as_ptr(), RTLD_DI_LINKMAP, info_ptr) } != 0 || link_map_ptr.is_null() {
        return Err(Error::Loader(last_dl_error()));
    }
    Ok(link_map_ptr)
}

pub(crate) fn symbol(handle: LibraryHandle, name: &str) -> Option<usize> {
    let name = c_string(name).ok()?;
    let addr = unsafe { libc::dlsym(handle.as_ptr(), name.as_ptr()) };
    (!addr.is_null()).then_some(addr as usize)
}

// Like `symbol`, but only accepts a definition living in the handle's own module.
// dlsym also searches the handle's dependencies, which would redirect to the wrong library.
pub(crate) fn definition(handle: LibraryHandle, name: &str) -> Option<usize> {
    let addr = symbol(handle, name)?;
    let owner = link_map(handle).ok()?;
    let mut info: libc::Dl_info = unsafe { std::mem::zeroed() };
    if unsafe { libc::dladdr(addr as *const c_void, &mut info) } == 0 || info.dli_fname.is_null() {
        return None;
    }
    let owner_name = unsafe { (*owner).l_name };
    if owner_name.is_null() {
        return None;
    }
    let defined_in = unsafe { CStr::from_ptr(info.dli_fname) };
    let owner_name = unsafe { CStr::from_ptr(owner_name) };
    (defined_in == owner_name).then_some(addr)
}

fn module_name(link_map: &LinkMap) -> String {
    if link_map.l_name.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(link_map.l_name) }
        .to_string_lossy()
        .into_owned()
}

// All modules of the handle's namespace, oldest first: walk l_prev to the head, then l_next
pub(crate) fn module_chain(handle: LibraryHandle) -> Result<Vec<ModuleImage>> {
    let mut head = link_map(handle)?;
    let mut steps = 0;
    unsafe {
        while !(*head).l_prev.is_null() {
            head = (*head).l_prev;
            steps += 1;
            if steps > LINK_MAP_WALK_LIMIT {
                return Err(Error::Loader("link map chain does not terminate".into()));
            }
        }
    }

    let mut modules = Vec::new();
    let mut current = head;
    while !current.is_null() && modules.len() <= LINK_MAP_WALK_LIMIT {
        let link_map = unsafe { &*current };
        let name = module_name(link_map);
        match unsafe { ModuleImage::from_dynamic(&name, link_map.l_addr, link_map.l_ld) } {
            Ok(Some(image)) => modules.push(image),
            Ok(None) => log::debug(format_args!("module {name:?} has no symbol tables, skipped")),
            Err(err) => log::warn(format_args!("module {name:?} skipped: {err}")),
        }
        current = link_map.l_next;
    }
    Ok(modules)
}

#[cfg(test)]
mod tests;
