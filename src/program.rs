// The spied program: namespace image, stacks, thread registry and breakpoints, with the
// Tracer that controls it.
use crate::breakpoint::{BreakPoint, BreakPointTable};
use crate::config::{RelinkPolicy, SpyConfig};
use crate::elf;
use crate::error::{Error, Result};
use crate::loader::{self, LM_ID_BASE, LibraryHandle, Lmid};
use crate::log;
use crate::memory::{self, StackRegion};
use crate::relink::{self, CommandSlotWriter, LibrarySymbols, RelinkReport, RelinkTargets};
use crate::sync::MutexPoisonRecover;
use crate::thread::{RunState, SpiedThread};
use crate::tracer::{EntryParams, LaunchParams, Tracer, TracerCore};
use nix::unistd::Pid;
use std::collections::BTreeMap;
use std::ffi::CString;
use std::os::unix::ffi::OsStrExt;
use std::sync::{Arc, Mutex};

#[cfg(test)]
mod tests;

pub type ThreadCallback = Arc<dyn Fn(&Arc<SpiedThread>) + Send + Sync>;

// auxv entries forwarded from our own process when nonzero
const FORWARDED_AUXV: [libc::c_ulong; 12] = [
    libc::AT_PAGESZ,
    libc::AT_CLKTCK,
    libc::AT_HWCAP,
    libc::AT_HWCAP2,
    libc::AT_RANDOM,
    libc::AT_SECURE,
    libc::AT_UID,
    libc::AT_EUID,
    libc::AT_GID,
    libc::AT_EGID,
    libc::AT_SYSINFO_EHDR,
    libc::AT_PLATFORM,
];

// State the event thread reaches through its weak back-reference
pub(crate) struct ProgramShared {
    threads: Mutex<BTreeMap<i32, Arc<SpiedThread>>>,
    breakpoints: BreakPointTable,
    on_thread_start: Mutex<Option<ThreadCallback>>,
    on_thread_exit: Mutex<Option<ThreadCallback>>,
    stack_top: usize,
}

impl ProgramShared {
    pub(crate) fn new(stack_top: usize) -> Self {
        Self {
            threads: Mutex::new(BTreeMap::new()),
            breakpoints: BreakPointTable::new(),
            on_thread_start: Mutex::new(None),
            on_thread_exit: Mutex::new(None),
            stack_top,
        }
    }

    pub(crate) fn breakpoints(&self) -> &BreakPointTable {
        &self.breakpoints
    }

    pub(crate) fn stack_top(&self) -> usize {
        self.stack_top
    }

    pub(crate) fn thread(&self, tid: Pid) -> Option<Arc<SpiedThread>> {
        self.threads.lock_or_poison().get(&tid.as_raw()).cloned()
    }

    pub(crate) fn threads(&self) -> Vec<Arc<SpiedThread>> {
        self.threads.lock_or_poison().values().cloned().collect()
    }

    // The bool tells whether the thread was registered by this call
    pub(crate) fn thread_or_insert(
        &self,
        tid: Pid,
        tracer: &Arc<TracerCore>,
        initial: RunState,
    ) -> (Arc<SpiedThread>, bool) {
        let mut threads = self.threads.lock_or_poison();
        if let Some(thread) = threads.get(&tid.as_raw()) {
            return (Arc::clone(thread), false);
        }
        let thread = Arc::new(SpiedThread::new(tid, Arc::clone(tracer), initial));
        threads.insert(tid.as_raw(), Arc::clone(&thread));
        (thread, true)
    }

    pub(crate) fn notify_thread_start(&self, thread: &Arc<SpiedThread>) {
        let callback = self.on_thread_start.lock_or_poison().clone();
        match callback {
            Some(callback) => callback(thread),
            None => log::info(format_args!("new thread {} created", thread.tid())),
        }
    }

    // Drops a thread from the registry and reports it to the exit callback
    pub(crate) fn retire_thread(&self, tid: Pid) {
        let Some(thread) = self.threads.lock_or_poison().remove(&tid.as_raw()) else {
            return;
        };
        let callback = self.on_thread_exit.lock_or_poison().clone();
        match callback {
            Some(callback) => callback(&thread),
            None => log::info(format_args!(
                "thread {tid} removed: {:?}",
                thread.exit_reason()
            )),
        }
    }
}

// Memory the starter thread reads while entering the program
struct LaunchImage {
    entry_params: EntryParams,
    _argv: Vec<CString>,
    _envp: Vec<CString>,
}

pub struct SpiedProgram {
    // declared first: dropped, and thereby joined, before anything it points into
    tracer: Tracer,
    shared: Arc<ProgramShared>,
    path: String,
    handle: LibraryHandle,
    lmid: Lmid,
    entry: usize,
    config: SpyConfig,
    libraries: Mutex<Vec<(String, LibraryHandle)>>,
    _launch: Box<LaunchImage>,
    _helper_stack: StackRegion,
    stack: StackRegion,
}

impl SpiedProgram {
    // Loads `path` with the tester's environment
    pub fn new(path: &str, argv: &[&str], config: SpyConfig) -> Result<Self> {
        let envp = std::env::vars_os()
            .map(|(key, value)| {
                let mut entry = key.as_bytes().to_vec();
                entry.push(b'=');
                entry.extend_from_slice(value.as_bytes());
                entry
            })
            .filter_map(|entry| CString::new(entry).ok())
            .collect();
        Self::load(path, c_strings(argv)?, envp, config)
    }

    pub fn with_env(path: &str, argv: &[&str], envp: &[&str], config: SpyConfig) -> Result<Self> {
        Self::load(path, c_strings(argv)?, c_strings(envp)?, config)
    }

    fn load(path: &str, argv: Vec<CString>, envp: Vec<CString>, config: SpyConfig) -> Result<Self> {
        config.validate()?;
        if config.debug {
            log::set_debug_enabled(true);
        }
        let (handle, lmid) = loader::open_new_namespace(path)?;
        match Self::launch(path, handle, lmid, argv, envp, config) {
            Ok(program) => Ok(program),
            Err(err) => {
                loader::close(handle);
                Err(err)
            }
        }
    }

    fn launch(
        path: &str,
        handle: LibraryHandle,
        lmid: Lmid,
        argv: Vec<CString>,
        envp: Vec<CString>,
        config: SpyConfig,
    ) -> Result<Self> {
        let entry = loader::symbol(handle, &config.entry_symbol)
            .ok_or_else(|| Error::EntryPointMissing(config.entry_symbol.clone()))?;
        let stack = StackRegion::map(config.stack_size)?;
        let helper_stack = StackRegion::map(config.helper_stack_size)?;

        let argv_ptrs: Vec<usize> = argv.iter().map(|arg| arg.as_ptr() as usize).collect();
        let envp_ptrs: Vec<usize> = envp.iter().map(|var| var.as_ptr() as usize).collect();
        let words = initial_stack_words(&argv_ptrs, &envp_ptrs, &forwarded_auxv());
        let stack_pointer = write_initial_stack(&stack, &words)?;

        let launch = Box::new(LaunchImage {
            entry_params: EntryParams {
                entry,
                stack_pointer,
            },
            _argv: argv,
            _envp: envp,
        });
        let shared = Arc::new(ProgramShared::new(stack.top()));
        let params = LaunchParams {
            helper_stack_top: memory::align_down(helper_stack.top(), 16),
            entry_params: &launch.entry_params as *const EntryParams as usize,
        };
        let tracer = Tracer::launch(Arc::downgrade(&shared), params)?;
        log::info(format_args!(
            "{path} loaded in namespace {lmid}, entry 0x{entry:x}, sp 0x{stack_pointer:x}"
        ));

        Ok(Self {
            tracer,
            shared,
            path: path.to_string(),
            handle,
            lmid,
            entry,
            config,
            libraries: Mutex::new(Vec::new()),
            _launch: launch,
            _helper_stack: helper_stack,
            stack,
        })
    }

    // Moves the engine to TRACING, registers the root thread and lets it run
    pub fn start(&self) -> Result<()> {
        self.tracer.start()?;
        let root = self
            .tracer
            .root_tid()
            .ok_or_else(|| Error::Bootstrap("no root thread recorded".into()))?;
        let (thread, created) =
            self.shared
                .thread_or_insert(root, self.tracer.core(), RunState::Stopped);
        if created {
            self.shared.notify_thread_start(&thread);
        }
        thread.resume()
    }

    pub fn resume(&self) -> Result<()> {
        self.for_each_thread(RunState::Stopped, |thread| thread.resume())
    }

    pub fn stop(&self) -> Result<()> {
        self.for_each_thread(RunState::Running, |thread| thread.stop())
    }

    pub fn terminate(&self) -> Result<()> {
        self.shared
            .threads()
            .iter()
            .filter(|thread| thread.state() != RunState::Terminated)
            .map(|thread| thread.terminate())
            .fold(Ok(()), |first, result| first.and(result))
    }

    // Every thread in `state` gets `op`; the first failure is reported after all were tried
    fn for_each_thread(
        &self,
        state: RunState,
        op: impl Fn(&Arc<SpiedThread>) -> Result<()>,
    ) -> Result<()> {
        let mut first_error = None;
        for thread in self.shared.threads() {
            if thread.state() != state {
                continue;
            }
            if let Err(err) = op(&thread) {
                log::warn(format_args!("thread {}: {err}", thread.tid()));
                first_error.get_or_insert(err);
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    pub fn thread(&self, tid: Pid) -> Option<Arc<SpiedThread>> {
        self.shared.thread(tid)
    }

    pub fn threads(&self) -> Vec<Arc<SpiedThread>> {
        self.shared.threads()
    }

    pub fn root_thread(&self) -> Option<Arc<SpiedThread>> {
        self.shared.thread(self.tracer.root_tid()?)
    }

    // Releases a stopped thread from trace control and forgets it
    pub fn detach_thread(&self, thread: &Arc<SpiedThread>) -> Result<()> {
        thread.detach()?;
        self.shared.retire_thread(thread.tid());
        Ok(())
    }

    pub fn set_on_thread_start(&self, callback: impl Fn(&Arc<SpiedThread>) + Send + Sync + 'static) {
        *self.shared.on_thread_start.lock_or_poison() = Some(Arc::new(callback));
    }

    pub fn set_on_thread_exit(&self, callback: impl Fn(&Arc<SpiedThread>) + Send + Sync + 'static) {
        *self.shared.on_thread_exit.lock_or_poison() = Some(Arc::new(callback));
    }

    // Registers and installs a breakpoint
    pub fn create_breakpoint(&self, addr: usize, name: &str) -> Result<Arc<BreakPoint>> {
        let breakpoints = self.shared.breakpoints();
        let breakpoint = Arc::new(BreakPoint::new(
            breakpoints.next_id(),
            name.to_string(),
            addr,
            Arc::clone(self.tracer.core()),
        ));
        breakpoint.set()?;
        breakpoints.insert(Arc::clone(&breakpoint));
        Ok(breakpoint)
    }

    pub fn create_breakpoint_at_symbol(&self, symbol: &str) -> Result<Arc<BreakPoint>> {
        let addr = self
            .symbol(symbol)
            .ok_or_else(|| Error::Loader(format!("symbol {symbol} not found in {}", self.path)))?;
        self.create_breakpoint(addr, symbol)
    }

    pub fn breakpoint_at(&self, addr: usize) -> Option<Arc<BreakPoint>> {
        self.shared.breakpoints().at(addr)
    }

    pub fn remove_breakpoint(&self, breakpoint: &Arc<BreakPoint>) -> Result<()> {
        breakpoint.unset()?;
        self.shared.breakpoints().remove(breakpoint.id());
        Ok(())
    }

    pub fn symbol(&self, name: &str) -> Option<usize> {
        loader::symbol(self.handle, name)
    }

    // Loads an alternate implementation into the program's namespace
    pub fn load_library(&self, name: &str) -> Result<()> {
        let handle = loader::open_in_namespace(self.lmid, name)?;
        log::info(format_args!("{name} loaded in namespace {}", self.lmid));
        self.libraries.lock_or_poison().push((name.to_string(), handle));
        Ok(())
    }

    pub fn library_symbol(&self, library: &str, name: &str) -> Option<usize> {
        let handle = self
            .libraries
            .lock_or_poison()
            .iter()
            .find(|(loaded, _)| {
                elf::library_matches(loaded, library) || elf::library_matches(library, loaded)
            })
            .map(|(_, handle)| *handle)?;
        loader::symbol(handle, name)
    }

    pub fn relink(&self, library: &str) -> Result<RelinkReport> {
        self.relink_with_policy(library, self.config.relink_policy)
    }

    // Points the tester's bindings to `library` at its copy in the program's namespace
    pub fn relink_with_policy(&self, library: &str, policy: RelinkPolicy) -> Result<RelinkReport> {
        let alternate = loader::find_in_namespace(self.lmid, library)?;
        let original = loader::find_in_namespace(LM_ID_BASE, library).ok();
        let result = loader::base_program().and_then(|base| {
            let modules = loader::module_chain(base);
            loader::close(base);
            let modules = modules?;

            let alternate_symbols = LibrarySymbols(alternate);
            let original_symbols = original.map(LibrarySymbols);
            let targets = RelinkTargets {
                alternate: &alternate_symbols,
                original: original_symbols
                    .as_ref()
                    .map(|symbols| symbols as &dyn relink::SymbolSource),
            };
            let writer = CommandSlotWriter(Arc::clone(self.tracer.core()));
            relink::relink_modules(library, &modules, &targets, &writer, policy)
        });
        loader::close(alternate);
        if let Some(original) = original {
            loader::close(original);
        }
        result
    }

    pub fn namespace_id(&self) -> Lmid {
        self.lmid
    }

    pub fn entry_point(&self) -> usize {
        self.entry
    }

    pub fn stack_top(&self) -> usize {
        self.shared.stack_top()
    }

    pub fn stack_size(&self) -> usize {
        self.stack.len()
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn tracer(&self) -> &Tracer {
        &self.tracer
    }
}

impl Drop for SpiedProgram {
    // The namespace image stays mapped: program threads may still be unwinding through it
    fn drop(&mut self) {
        // forked tracees live outside the group kill_tracee reaches
        for thread in self.shared.threads() {
            if thread.state() != RunState::Terminated {
                let _ = thread.terminate();
            }
        }
        self.tracer.kill_tracee();
        log::debug(format_args!("tearing down {}", self.path));
    }
}

fn c_strings(values: &[&str]) -> Result<Vec<CString>> {
    values
        .iter()
        .map(|value| {
            CString::new(*value)
                .map_err(|_| Error::InvalidConfig(format!("{value:?} contains a NUL byte")))
        })
        .collect()
}

fn forwarded_auxv() -> Vec<(usize, usize)> {
    FORWARDED_AUXV
        .iter()
        .map(|&kind| (kind as usize, unsafe { libc::getauxval(kind) } as usize))
        .filter(|&(_, value)| value != 0)
        .collect()
}

// Kernel entry layout: argc, argv..., NULL, envp..., NULL, auxv pairs, AT_NULL
pub(crate) fn initial_stack_words(argv: &[usize], envp: &[usize], auxv: &[(usize, usize)]) -> Vec<usize> {
    let mut words = Vec::with_capacity(argv.len() + envp.len() + 2 * auxv.len() + 5);
    words.push(argv.len());
    words.extend_from_slice(argv);
    words.push(0);
    words.extend_from_slice(envp);
    words.push(0);
    for &(kind, value) in auxv {
        words.push(kind);
        words.push(value);
    }
    words.push(libc::AT_NULL as usize);
    words.push(0);
    words
}

// Copies the image below the stack top and returns the 16-byte aligned entry sp
fn write_initial_stack(stack: &StackRegion, words: &[usize]) -> Result<usize> {
    let image_len = size_of_val(words);
    if image_len + 16 > stack.len() {
        return Err(Error::InvalidConfig(format!(
            "initial stack image of {image_len} bytes does not fit a {} byte stack",
            stack.len()
        )));
    }
    let stack_pointer = memory::align_down(stack.top() - image_len, 16);
    unsafe {
        std::ptr::copy_nonoverlapping(words.as_ptr(), stack_pointer as *mut usize, words.len());
    }
    Ok(stack_pointer)
}
