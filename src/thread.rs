// Per-thread state machine. Transitions come from the event thread (wait statuses) and from
// commands executed on the command thread; readers may block on the condition variable.
use crate::arch;
use crate::breakpoint::{BreakPoint, BreakPointTable};
use crate::error::{Error, Result};
use crate::log;
use crate::sync::{CondvarPoisonRecover, MutexPoisonRecover};
use crate::tracer::TracerCore;
use nix::errno::Errno;
use nix::sys::ptrace;
use nix::sys::signal::Signal;
use nix::sys::wait::WaitStatus;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};


#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum RunState {
    Stopped,
    Running,
    // absorbing
    Terminated,
}

impl RunState {
    // state of a thread first revealed by `status`, before that status is applied;
    // a thread reported dead was running until then
    pub(crate) fn initial_for(status: &WaitStatus) -> Self {
        match status {
            WaitStatus::Continued(_) | WaitStatus::Exited(..) | WaitStatus::Signaled(..) => {
                Self::Running
            }
            _ => Self::Stopped,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ExitReason {
    Exited(i32),
    Signaled(Signal),
    // released with PTRACE_DETACH, no longer observed
    Detached,
}

impl ExitReason {
    // exit status or terminating signal number, as the kernel reported it
    pub fn code(&self) -> Option<i32> {
        match self {
            Self::Exited(code) => Some(*code),
            Self::Signaled(signal) => Some(*signal as i32),
            Self::Detached => None,
        }
    }
}

// How the last SIGTRAP stop was explained
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TrapOutcome {
    StepCompleted,
    BreakPoint { id: u32, addr: usize },
    // PTRACE_EVENT_* stop (clone, fork, exec)
    TraceEvent(i32),
    Unexpected { pc: usize },
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum TrapCause {
    Signal,
    Event(i32),
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct WatchPoint {
    id: u32,
    tid: Pid,
    addr: usize,
    len: usize,
}

impl WatchPoint {
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn contains(&self, addr: usize) -> bool {
        addr >= self.addr && addr - self.addr < self.len
    }
}

struct ThreadStatus {
    run: RunState,
    last_signal: Option<Signal>,
    exit: Option<ExitReason>,
    last_trap: Option<TrapOutcome>,
    // set before PTRACE_SINGLESTEP, consumed by the next trap
    trap_expected: bool,
}

pub struct SpiedThread {
    tid: Pid,
    status: Mutex<ThreadStatus>,
    status_cv: Condvar,
    watch_points: Mutex<Vec<WatchPoint>>,
    next_watch_id: AtomicU32,
    tracer: Arc<TracerCore>,
}

// tkill rather than tgkill: forked tracees live in other thread groups
fn tkill(tid: Pid, signal: Signal) -> nix::Result<()> {
    let result = unsafe { libc::syscall(libc::SYS_tkill, tid.as_raw(), signal as libc::c_int) };
    Errno::result(result).map(drop)
}

impl SpiedThread {
    pub(crate) fn new(tid: Pid, tracer: Arc<TracerCore>, initial: RunState) -> Self {
        Self {
            tid,
            status: Mutex::new(ThreadStatus {
                run: initial,
                last_signal: None,
                exit: None,
                last_trap: None,
                trap_expected: false,
            }),
            status_cv: Condvar::new(),
            watch_points: Mutex::new(Vec::new()),
            next_watch_id: AtomicU32::new(1),
            tracer,
        }
    }

    pub fn tid(&self) -> Pid {
        self.tid
    }

    pub fn state(&self) -> RunState {
        self.status.lock_or_poison().run
    }

    pub fn last_signal(&self) -> Option<Signal> {
        self.status.lock_or_poison().last_signal
    }

    pub fn exit_reason(&self) -> Option<ExitReason> {
        self.status.lock_or_poison().exit
    }

    pub fn last_trap(&self) -> Option<TrapOutcome> {
        self.status.lock_or_poison().last_trap
    }

    pub fn is_trap_expected(&self) -> bool {
        self.status.lock_or_poison().trap_expected
    }

    fn require(&self, status: &ThreadStatus, op: &'static str, valid: &[RunState]) -> Result<()> {
        if valid.contains(&status.run) {
            return Ok(());
        }
        Err(Error::InvalidThreadState {
            tid: self.tid,
            op,
            state: status.run,
        })
    }

    pub fn resume(self: &Arc<Self>) -> Result<()> {
        self.resume_with(None)
    }

    // Continue from STOPPED, optionally delivering `signal`. RUNNING is recorded once
    // PTRACE_CONT has succeeded, under the same lock the event thread uses.
    pub fn resume_with(self: &Arc<Self>, signal: Option<Signal>) -> Result<()> {
        let thread = Arc::clone(self);
        self.tracer.exec(move || {
            let mut status = thread.status.lock_or_poison();
            thread.require(&status, "resume", &[RunState::Stopped])?;
            ptrace::cont(thread.tid, signal).map_err(Error::ptrace("cont", thread.tid))?;
            status.run = RunState::Running;
            thread.status_cv.notify_all();
            Ok(())
        })
    }

    pub fn single_step(self: &Arc<Self>) -> Result<()> {
        let thread = Arc::clone(self);
        self.tracer.exec(move || {
            let mut status = thread.status.lock_or_poison();
            thread.require(&status, "single-step", &[RunState::Stopped])?;
            status.trap_expected = true;
            if let Err(source) = ptrace::step(thread.tid, None) {
                status.trap_expected = false;
                return Err(Error::ptrace("singlestep", thread.tid)(source));
            }
            status.run = RunState::Running;
            thread.status_cv.notify_all();
            Ok(())
        })
    }

    // Asks the kernel for a SIGSTOP; STOPPED follows with the stop notification
    pub fn stop(self: &Arc<Self>) -> Result<()> {
        let thread = Arc::clone(self);
        self.tracer.exec(move || {
            let status = thread.status.lock_or_poison();
            thread.require(&status, "stop", &[RunState::Running])?;
            tkill(thread.tid, Signal::SIGSTOP).map_err(Error::ptrace("tkill", thread.tid))
        })
    }

    // SIGKILL; TERMINATED follows with the exit notification
    pub fn terminate(self: &Arc<Self>) -> Result<()> {
        let thread = Arc::clone(self);
        self.tracer.exec(move || {
            let status = thread.status.lock_or_poison();
            thread.require(&status, "terminate", &[RunState::Stopped, RunState::Running])?;
            tkill(thread.tid, Signal::SIGKILL).map_err(Error::ptrace("tkill", thread.tid))
        })
    }

    pub fn detach(self: &Arc<Self>) -> Result<()> {
        let thread = Arc::clone(self);
        self.tracer.exec(move || {
            let mut status = thread.status.lock_or_poison();
            thread.require(&status, "detach", &[RunState::Stopped])?;
            ptrace::detach(thread.tid, None).map_err(Error::ptrace("detach", thread.tid))?;
            status.run = RunState::Terminated;
            status.exit = Some(ExitReason::Detached);
            thread.status_cv.notify_all();
            Ok(())
        })
    }

    // Blocks until the thread is in `wanted`. Fails early when it terminates instead.
    pub fn wait_for(&self, wanted: RunState, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut status = self.status.lock_or_poison();
        loop {
            if status.run == wanted {
                return Ok(());
            }
            if status.run == RunState::Terminated {
                return Err(Error::InvalidThreadState {
                    tid: self.tid,
                    op: "wait",
                    state: status.run,
                });
            }
            let (guard, in_time) = self.status_cv.wait_deadline_or_poison(status, deadline);
            status = guard;
            if !in_time && status.run != wanted {
                return Err(Error::Timeout {
                    tid: self.tid,
                    wanted,
                });
            }
        }
    }

    pub fn create_watch_point(&self, addr: usize, len: usize) -> Result<WatchPoint> {
        if len == 0 || addr.checked_add(len).is_none() {
            return Err(Error::Memory {
                addr,
                reason: format!("invalid watch range of {len} bytes"),
            });
        }
        let watch_point = WatchPoint {
            id: self.next_watch_id.fetch_add(1, Ordering::Relaxed),
            tid: self.tid,
            addr,
            len,
        };
        self.watch_points.lock_or_poison().push(watch_point);
        log::debug(format_args!(
            "thread {} watch point {} at 0x{addr:x}+{len}",
            self.tid, watch_point.id
        ));
        Ok(watch_point)
    }

    pub fn delete_watch_point(&self, watch_point: &WatchPoint) -> bool {
        let mut watch_points = self.watch_points.lock_or_poison();
        let before = watch_points.len();
        watch_points.retain(|wp| wp.id != watch_point.id || wp.tid != watch_point.tid);
        watch_points.len() != before
    }

    pub fn watch_points(&self) -> Vec<WatchPoint> {
        self.watch_points.lock_or_poison().clone()
    }

    // Event-thread entry point: one wait status for this thread
    pub(crate) fn on_wait_status(self: &Arc<Self>, status: WaitStatus, breakpoints: &BreakPointTable) {
        match status {
            WaitStatus::Stopped(_, Signal::SIGTRAP) => self.on_trap(TrapCause::Signal, breakpoints),
            WaitStatus::PtraceEvent(_, _, event) => {
                self.on_trap(TrapCause::Event(event), breakpoints)
            }
            WaitStatus::PtraceSyscall(_) => self.record_stop(Signal::SIGTRAP, None),
            WaitStatus::Stopped(_, signal) => self.record_stop(signal, None),
            WaitStatus::Continued(_) => self.record_running(),
            WaitStatus::Exited(_, code) => self.record_exit(ExitReason::Exited(code)),
            WaitStatus::Signaled(_, signal, _) => self.record_exit(ExitReason::Signaled(signal)),
            WaitStatus::StillAlive => {}
        }
    }

    // STOPPED is published after the trap is explained, and the breakpoint handler runs last
    // so it may resume the thread itself.
    fn on_trap(self: &Arc<Self>, cause: TrapCause, breakpoints: &BreakPointTable) {
        let (outcome, hit) = self.handle_sig_trap(cause, breakpoints);
        log::debug(format_args!("thread {} trap: {outcome:?}", self.tid));
        self.record_stop(Signal::SIGTRAP, Some(outcome));
        if let Some(breakpoint) = hit {
            breakpoint.invoke_handler(self);
        }
    }

    pub(crate) fn handle_sig_trap(
        &self,
        cause: TrapCause,
        breakpoints: &BreakPointTable,
    ) -> (TrapOutcome, Option<Arc<BreakPoint>>) {
        {
            let mut status = self.status.lock_or_poison();
            if status.trap_expected {
                status.trap_expected = false;
                return (TrapOutcome::StepCompleted, None);
            }
        }
        if let TrapCause::Event(event) = cause {
            return (TrapOutcome::TraceEvent(event), None);
        }

        let tid = self.tid;
        let pc = match self
            .tracer
            .exec(move || arch::read_pc(tid).map_err(Error::ptrace("getregs", tid)))
        {
            Ok(pc) => pc,
            Err(err) => {
                log::warn(format_args!("thread {tid} trap: cannot read pc: {err}"));
                return (TrapOutcome::Unexpected { pc: 0 }, None);
            }
        };
        let addr = arch::breakpoint_address(pc);
        let Some(breakpoint) = breakpoints.installed_at(addr) else {
            log::warn(format_args!("thread {tid} trapped at 0x{pc:x} without a breakpoint"));
            return (TrapOutcome::Unexpected { pc }, None);
        };
        match breakpoint.on_hit(tid) {
            Ok(()) => (
                TrapOutcome::BreakPoint {
                    id: breakpoint.id(),
                    addr,
                },
                Some(breakpoint),
            ),
            Err(err) => {
                log::error(format_args!(
                    "thread {tid} breakpoint {} at 0x{addr:x}: {err}",
                    breakpoint.name()
                ));
                (TrapOutcome::Unexpected { pc }, None)
            }
        }
    }

    pub(crate) fn record_stop(&self, signal: Signal, trap: Option<TrapOutcome>) {
        let mut status = self.status.lock_or_poison();
        if status.run == RunState::Terminated {
            return;
        }
        status.run = RunState::Stopped;
        status.last_signal = Some(signal);
        if trap.is_some() {
            status.last_trap = trap;
        }
        self.status_cv.notify_all();
    }

    pub(crate) fn record_running(&self) {
        let mut status = self.status.lock_or_poison();
        if status.run == RunState::Terminated {
            return;
        }
        status.run = RunState::Running;
        self.status_cv.notify_all();
    }

    pub(crate) fn record_exit(&self, reason: ExitReason) {
        let mut status = self.status.lock_or_poison();
        if status.run == RunState::Terminated {
            return;
        }
        status.run = RunState::Terminated;
        status.exit = Some(reason);
        status.trap_expected = false;
        self.status_cv.notify_all();
    }

    #[cfg(test)]
    pub(crate) fn expect_trap(&self) {
        self.status.lock_or_poison().trap_expected = true;
    }
}
