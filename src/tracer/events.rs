// Event thread: reaps every wait status of the traced tree and feeds the thread state machines
use super::{Tracee, TracerCore};
use crate::log;
use crate::program::ProgramShared;
use crate::thread::RunState;
use nix::errno::Errno;
use nix::sys::wait::{WaitPidFlag, WaitStatus, waitpid};
use nix::unistd::Pid;
use std::sync::{Arc, Weak};

pub(super) fn event_loop(core: Arc<TracerCore>, program: Weak<ProgramShared>, tracee: Tracee) {
    log::debug(format_args!("event loop started for root {}", tracee.root));
    loop {
        let flags = WaitPidFlag::__WALL | WaitPidFlag::WCONTINUED;
        // other children of the tester keep their statuses; ECHILD means the traced tree is gone
        match waitpid(Pid::from_raw(-tracee.group().as_raw()), Some(flags)) {
            Ok(status) => dispatch(&core, &program, tracee, status),
            Err(Errno::EINTR) => continue,
            Err(Errno::ECHILD) => break,
            Err(err) => {
                log::error(format_args!("waitpid failed, event loop ends: {err}"));
                break;
            }
        }
    }
    log::debug(format_args!("no traced children left"));
    core.finish_tracing();
}

fn dispatch(core: &Arc<TracerCore>, program: &Weak<ProgramShared>, tracee: Tracee, status: WaitStatus) {
    let Some(tid) = status.pid() else {
        return;
    };
    // the helper only shows up again when the whole group is gone
    if tid == tracee.helper {
        log::debug(format_args!("bootstrap helper {tid}: {status:?}"));
        return;
    }
    let Some(program) = program.upgrade() else {
        log::debug(format_args!("thread {tid}: {status:?} after program teardown"));
        return;
    };

    let (thread, created) = program.thread_or_insert(tid, core, RunState::initial_for(&status));
    if created {
        program.notify_thread_start(&thread);
    }
    log::debug(format_args!("thread {tid}: {status:?}"));
    thread.on_wait_status(status, program.breakpoints());
    if thread.state() == RunState::Terminated {
        program.retire_thread(tid);
    }
}
