// Produces a traced program sharing our address space:
//   command thread --clone(VM|FS|FILES)--> helper: TRACEME, SIGTRAP, pthread_create(starter)
//   starter (auto-attached, starts in SIGSTOP) jumps to the program entry point
use crate::arch;
use crate::error::{Error, Result};
use crate::log;
use nix::errno::Errno;
use nix::sys::ptrace::{self, Options};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::ffi::{c_int, c_void};
use std::ptr;

// What the starter thread needs to enter the program; must outlive the program
#[repr(C)]
pub(crate) struct EntryParams {
    pub(crate) entry: usize,
    pub(crate) stack_pointer: usize,
}

pub(crate) struct LaunchParams {
    pub(crate) helper_stack_top: usize,
    // address of a live EntryParams
    pub(crate) entry_params: usize,
}

// helper: the cloned child, leader of the traced group; root: the program's first thread
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Tracee {
    pub(crate) helper: Pid,
    pub(crate) root: Pid,
}

impl Tracee {
    // The helper leads its own process group. Its threads and forks inherit it, so the
    // group names exactly the traced tree.
    pub(crate) fn group(&self) -> Pid {
        self.helper
    }
}

// The helper shares the command thread's TLS, so it sticks to raw syscalls until
// pthread_create hands over to a thread with its own TCB.
extern "C" fn helper_main(arg: *mut c_void) -> c_int {
    unsafe {
        if libc::syscall(libc::SYS_setpgid, 0, 0) == -1 {
            libc::syscall(libc::SYS_exit_group, 4);
        }
        if libc::syscall(libc::SYS_ptrace, libc::PTRACE_TRACEME, 0, 0, 0) == -1 {
            libc::syscall(libc::SYS_exit_group, 1);
        }
        let pid = libc::syscall(libc::SYS_getpid);
        let tid = libc::syscall(libc::SYS_gettid);
        if libc::syscall(libc::SYS_tgkill, pid, tid, libc::SIGTRAP) == -1 {
            libc::syscall(libc::SYS_exit_group, 2);
        }
        let mut thread: libc::pthread_t = 0;
        if libc::pthread_create(&mut thread, ptr::null(), starter_main, arg) != 0 {
            libc::syscall(libc::SYS_exit_group, 3);
        }
    }
    0
}

extern "C" fn starter_main(arg: *mut c_void) -> *mut c_void {
    let params = unsafe { &*(arg as *const EntryParams) };
    unsafe { arch::enter_entry_point(params.entry, params.stack_pointer) }
}

fn expect_status(stage: &str, status: nix::Result<WaitStatus>) -> Result<WaitStatus> {
    status.map_err(|err| Error::Bootstrap(format!("{stage}: waitpid failed: {err}")))
}

fn unexpected(stage: &str, status: WaitStatus) -> Error {
    Error::Bootstrap(format!("{stage}: unexpected wait status {status:?}"))
}

// Runs on the command thread, which thereby becomes the tracer
pub(crate) fn launch(params: &LaunchParams) -> Result<Tracee> {
    let flags = libc::CLONE_VM | libc::CLONE_FS | libc::CLONE_FILES | libc::SIGCHLD;
    let helper = unsafe {
        libc::clone(
            helper_main,
            params.helper_stack_top as *mut c_void,
            flags,
            params.entry_params as *mut c_void,
        )
    };
    if helper == -1 {
        return Err(Error::Bootstrap(format!(
            "clone failed: {}",
            std::io::Error::last_os_error()
        )));
    }
    let helper = Pid::from_raw(helper);
    log::debug(format_args!("bootstrap helper {helper} cloned"));

    let mut root = None;
    let result = attach(helper, &mut root);
    if result.is_err() {
        abort(helper, root);
    }
    result
}

fn attach(helper: Pid, root_out: &mut Option<Pid>) -> Result<Tracee> {
    match expect_status("helper trap", waitpid(helper, Some(WaitPidFlag::__WALL)))? {
        WaitStatus::Stopped(_, Signal::SIGTRAP) => {}
        status => return Err(unexpected("helper trap", status)),
    }

    let options = Options::PTRACE_O_TRACECLONE | Options::PTRACE_O_TRACEFORK;
    ptrace::setoptions(helper, options).map_err(Error::ptrace("setoptions", helper))?;
    ptrace::cont(helper, None).map_err(Error::ptrace("cont", helper))?;

    match expect_status("helper clone", waitpid(helper, Some(WaitPidFlag::__WALL)))? {
        WaitStatus::PtraceEvent(_, Signal::SIGTRAP, libc::PTRACE_EVENT_CLONE) => {}
        status => return Err(unexpected("helper clone", status)),
    }
    let root = ptrace::getevent(helper).map_err(Error::ptrace("getevent", helper))?;
    let root = Pid::from_raw(root as libc::pid_t);
    *root_out = Some(root);

    match expect_status("starter stop", waitpid(root, Some(WaitPidFlag::__WALL)))? {
        WaitStatus::Stopped(_, Signal::SIGSTOP) => {}
        status => return Err(unexpected("starter stop", status)),
    }

    // the helper has nothing left to do: let it return and exit
    ptrace::cont(helper, None).map_err(Error::ptrace("cont", helper))?;
    log::debug(format_args!("bootstrap done: helper {helper} root {root}"));
    Ok(Tracee { helper, root })
}

// Kills a half-built traced group and reaps what we can, so no zombie outlives the failure
pub(crate) fn abort(helper: Pid, root: Option<Pid>) {
    if let Err(err) = signal::kill(helper, Signal::SIGKILL)
        && err != Errno::ESRCH
    {
        log::warn(format_args!("kill helper {helper}: {err}"));
    }
    for pid in root.into_iter().chain(Some(helper)) {
        loop {
            match waitpid(pid, Some(WaitPidFlag::__WALL)) {
                Ok(WaitStatus::Exited(..) | WaitStatus::Signaled(..)) | Err(_) => break,
                Ok(_) => {}
            }
        }
    }
}
