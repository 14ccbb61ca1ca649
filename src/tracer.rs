// Trace-control engine: one command thread owns every ptrace request, one event thread reaps
// wait statuses. Any other thread talks to the tracee through `exec`/`post`.
use crate::error::{Error, Result};
use crate::log;
use crate::memory;
use crate::program::ProgramShared;
use crate::sync::{CondvarPoisonRecover, MutexPoisonRecover, Semaphore};
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use once_cell::sync::OnceCell;
use std::cell::Cell;
use std::collections::VecDeque;
use std::ffi::c_void;
use std::sync::{Arc, Condvar, Mutex, Weak};
use std::thread::{self, JoinHandle};

// clone/TRACEME/pthread_create handoff that produces the traced program
mod bootstrap;
// queued jobs and the synchronous result slot
mod command;
// waitpid loop feeding the per-thread state machines
mod events;

#[cfg(test)]
mod tests;

pub(crate) use bootstrap::{EntryParams, LaunchParams, Tracee};
use command::{Job, ResultSlot, run_guarded};

// Lifecycle of one engine, only ever moves forward
#[derive(Clone, Copy, Debug, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum EngineState {
    NotStarted,
    Starting,
    Tracing,
    Stopping,
    Stopped,
}

impl EngineState {
    pub fn accepts_commands(self) -> bool {
        matches!(self, Self::Starting | Self::Tracing)
    }
}

thread_local! {
    // address of the TracerCore this thread drains, 0 elsewhere
    static COMMAND_CONTEXT: Cell<usize> = const { Cell::new(0) };
}

pub(crate) struct TracerCore {
    state: Mutex<EngineState>,
    state_cv: Condvar,
    queue: Mutex<VecDeque<Job>>,
    pending: Semaphore,
    tracee: OnceCell<Tracee>,
    event_thread: Mutex<Option<JoinHandle<()>>>,
    setup_error: Mutex<Option<Error>>,
}

impl TracerCore {
    fn new() -> Self {
        Self {
            state: Mutex::new(EngineState::NotStarted),
            state_cv: Condvar::new(),
            queue: Mutex::new(VecDeque::new()),
            pending: Semaphore::new(),
            tracee: OnceCell::new(),
            event_thread: Mutex::new(None),
            setup_error: Mutex::new(None),
        }
    }

    pub(crate) fn state(&self) -> EngineState {
        *self.state.lock_or_poison()
    }

    // Forward-only; attempts to go back are ignored
    fn set_state(&self, new_state: EngineState) {
        let mut state = self.state.lock_or_poison();
        if new_state <= *state {
            if new_state != *state {
                log::debug(format_args!(
                    "tracer state {:?} -> {new_state:?} ignored",
                    *state
                ));
            }
            return;
        }
        log::debug(format_args!("tracer state {:?} -> {new_state:?}", *state));
        *state = new_state;
        self.state_cv.notify_all();
    }

    fn wait_for_state(&self, target: EngineState) -> EngineState {
        let mut state = self.state.lock_or_poison();
        while *state < target {
            state = self.state_cv.wait_or_poison(state);
        }
        *state
    }

    // The capability check: is the caller the thread draining this engine's queue?
    pub(crate) fn is_command_thread(&self) -> bool {
        COMMAND_CONTEXT.with(|context| context.get() == self as *const Self as usize)
    }

    pub(crate) fn root_tid(&self) -> Option<Pid> {
        self.tracee.get().map(|tracee| tracee.root)
    }

    fn enqueue(&self, job: Job) -> Result<()> {
        {
            let mut queue = self.queue.lock_or_poison();
            let state = self.state();
            if !state.accepts_commands() {
                return Err(Error::NotAccepting(state));
            }
            queue.push_back(job);
        }
        self.pending.post();
        Ok(())
    }

    // Runs `action` on the command thread and hands back its result
    pub(crate) fn exec<R, F>(&self, action: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        if self.is_command_thread() {
            return run_guarded(action);
        }
        let slot = Arc::new(ResultSlot::new());
        let job_slot = Arc::clone(&slot);
        self.enqueue(Box::new(move || job_slot.fill(run_guarded(action))))?;
        slot.take()
    }

    // Fire and forget; a failing action is only logged
    pub(crate) fn post<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        let job = move || {
            if let Err(err) = run_guarded(action) {
                log::warn(format_args!("posted command failed: {err}"));
            }
        };
        if self.is_command_thread() {
            job();
            return Ok(());
        }
        self.enqueue(Box::new(job))
    }

    fn run<S>(self: &Arc<Self>, setup: S)
    where
        S: FnOnce(&Arc<Self>) -> Result<()>,
    {
        COMMAND_CONTEXT.with(|context| context.set(Arc::as_ptr(self) as usize));
        if let Err(err) = setup(self) {
            log::error(format_args!("tracer setup failed: {err}"));
            *self.setup_error.lock_or_poison() = Some(err);
            self.set_state(EngineState::Stopped);
            return;
        }
        self.drain_commands();
    }

    fn drain_commands(&self) {
        self.set_state(EngineState::Starting);
        loop {
            self.pending.wait();
            let mut queue = self.queue.lock_or_poison();
            while let Some(job) = queue.pop_front() {
                drop(queue);
                job();
                queue = self.queue.lock_or_poison();
            }
            if self.state() == EngineState::Stopping {
                break;
            }
        }
        self.set_state(EngineState::Stopped);
    }

    // No traced entity is left: let the drain loop finish the backlog and stop
    pub(crate) fn finish_tracing(&self) {
        self.set_state(EngineState::Stopping);
        self.pending.post();
    }

    // Both helpers below must run on the command thread. ptrace needs a stopped tracee in
    // our address space; the root thread is the only one guaranteed to share it. When it is
    // running (ESRCH) the word is accessed locally instead.
    fn peek_word(&self, addr: usize) -> Result<usize> {
        if let Some(tid) = self.root_tid() {
            match ptrace::read(tid, addr as *mut c_void) {
                Ok(value) => return Ok(value as usize),
                Err(Errno::ESRCH) => {}
                Err(source) => return Err(Error::ptrace("peekdata", tid)(source)),
            }
        }
        Ok(unsafe { memory::read_word(addr) })
    }

    fn poke_word(&self, addr: usize, value: usize) -> Result<usize> {
        if let Some(tid) = self.root_tid() {
            match ptrace::read(tid, addr as *mut c_void) {
                Ok(previous) => {
                    ptrace::write(tid, addr as *mut c_void, value as libc::c_long)
                        .map_err(Error::ptrace("pokedata", tid))?;
                    memory::flush_instruction_cache_range(addr, addr + size_of::<usize>());
                    return Ok(previous as usize);
                }
                Err(Errno::ESRCH) => {}
                Err(source) => return Err(Error::ptrace("peekdata", tid)(source)),
            }
        }
        unsafe { memory::write_word_protected(addr, value) }
    }

    pub(crate) fn read_word(self: &Arc<Self>, addr: usize) -> Result<usize> {
        let core = Arc::clone(self);
        self.exec(move || core.peek_word(addr))
    }

    // Returns the previous value of the word
    pub(crate) fn write_word(self: &Arc<Self>, addr: usize, value: usize) -> Result<usize> {
        let core = Arc::clone(self);
        self.exec(move || core.poke_word(addr, value))
    }
}

// Handle on a running engine. Dropping it blocks until the engine is STOPPED.
pub struct Tracer {
    core: Arc<TracerCore>,
    command_thread: Option<JoinHandle<()>>,
}

impl Tracer {
    // Starts the command thread, runs `setup` on it, and waits until it accepts commands
    pub(crate) fn spawn<S>(setup: S) -> Result<Self>
    where
        S: FnOnce(&Arc<TracerCore>) -> Result<()> + Send + 'static,
    {
        let core = Arc::new(TracerCore::new());
        let thread_core = Arc::clone(&core);
        let handle = thread::Builder::new()
            .name("spytester-cmd".to_string())
            .spawn(move || thread_core.run(setup))
            .map_err(|source| Error::ThreadSpawn {
                name: "command",
                source,
            })?;

        core.wait_for_state(EngineState::Starting);
        if let Some(err) = core.setup_error.lock_or_poison().take() {
            let _ = handle.join();
            return Err(err);
        }
        Ok(Self {
            core,
            command_thread: Some(handle),
        })
    }

    // Bootstraps the traced program and starts the event thread
    pub(crate) fn launch(program: Weak<ProgramShared>, params: LaunchParams) -> Result<Self> {
        Self::spawn(move |core| {
            let tracee = bootstrap::launch(&params)?;
            let _ = core.tracee.set(tracee);

            let event_core = Arc::clone(core);
            let spawned = thread::Builder::new()
                .name("spytester-evt".to_string())
                .spawn(move || events::event_loop(event_core, program, tracee));
            match spawned {
                Ok(handle) => {
                    *core.event_thread.lock_or_poison() = Some(handle);
                    Ok(())
                }
                Err(source) => {
                    bootstrap::abort(tracee.helper, Some(tracee.root));
                    Err(Error::ThreadSpawn {
                        name: "event",
                        source,
                    })
                }
            }
        })
    }

    pub fn state(&self) -> EngineState {
        self.core.state()
    }

    pub fn is_command_thread(&self) -> bool {
        self.core.is_command_thread()
    }

    // Synchronous submission: blocks until the action ran on the command thread
    pub fn exec<R, F>(&self, action: F) -> Result<R>
    where
        F: FnOnce() -> Result<R> + Send + 'static,
        R: Send + 'static,
    {
        self.core.exec(action)
    }

    // Asynchronous submission: returns once queued, the action's result is never observed
    pub fn post<F>(&self, action: F) -> Result<()>
    where
        F: FnOnce() -> Result<()> + Send + 'static,
    {
        self.core.post(action)
    }

    /// Reads one word through the command channel.
    ///
    /// # Safety
    /// `addr` must be word aligned and mapped in the shared address space.
    pub unsafe fn read_word(&self, addr: usize) -> Result<usize> {
        self.core.read_word(addr)
    }

    /// Writes one word through the command channel and returns the previous value.
    ///
    /// # Safety
    /// `addr` must be word aligned and mapped, and nothing may rely on the old contents.
    pub unsafe fn write_word(&self, addr: usize, value: usize) -> Result<usize> {
        self.core.write_word(addr, value)
    }

    pub fn root_tid(&self) -> Option<Pid> {
        self.core.root_tid()
    }

    // STARTING -> TRACING; the caller then registers the root thread
    pub(crate) fn start(&self) -> Result<()> {
        let mut state = self.core.state.lock_or_poison();
        if *state != EngineState::Starting {
            return Err(Error::NotAccepting(*state));
        }
        *state = EngineState::Tracing;
        self.core.state_cv.notify_all();
        log::debug(format_args!("tracer state Starting -> Tracing"));
        Ok(())
    }

    pub(crate) fn core(&self) -> &Arc<TracerCore> {
        &self.core
    }

    // Kills the whole traced group, so the event loop can drain to STOPPING
    pub(crate) fn kill_tracee(&self) {
        let Some(tracee) = self.core.tracee.get() else {
            return;
        };
        if self.core.state() >= EngineState::Stopping {
            return;
        }
        match signal::killpg(tracee.group(), Signal::SIGKILL) {
            Ok(()) | Err(Errno::ESRCH) => {}
            Err(err) => log::warn(format_args!("kill traced group {}: {err}", tracee.group())),
        }
    }
}

impl Drop for Tracer {
    fn drop(&mut self) {
        // without a tracee no event loop will ever end the engine
        if self.core.tracee.get().is_none() {
            self.core.finish_tracing();
        }
        self.core.wait_for_state(EngineState::Stopped);
        if let Some(handle) = self.command_thread.take()
            && handle.join().is_err()
        {
            log::error(format_args!("command thread panicked"));
        }
        let event_thread = self.core.event_thread.lock_or_poison().take();
        if let Some(handle) = event_thread
            && handle.join().is_err()
        {
            log::error(format_args!("event thread panicked"));
        }
    }
}
