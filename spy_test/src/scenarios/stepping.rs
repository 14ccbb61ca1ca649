use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use spytester::{RunState, TrapOutcome};

use crate::test_ctx::{load_fixture, settle, started_root, wait_until};

pub fn scenario_step_versus_breakpoint() {
    let program = load_fixture(&[]);
    let root = started_root(&program);

    root.stop().expect("stop failed");
    settle(&root, RunState::Stopped);

    let breakpoint = program
        .create_breakpoint_at_symbol("spy_fixture_tick")
        .expect("breakpoint creation failed");
    assert!(breakpoint.is_installed());
    assert!(program.breakpoint_at(breakpoint.addr()).is_some());

    // a single step traps, but is not a breakpoint hit
    root.single_step().expect("single step failed");
    settle(&root, RunState::Stopped);
    assert!(!root.is_trap_expected());
    assert_eq!(root.last_trap(), Some(TrapOutcome::StepCompleted));
    assert_eq!(breakpoint.hit_count(), 0);

    root.resume().expect("resume failed");
    settle(&root, RunState::Stopped);
    assert_eq!(
        root.last_trap(),
        Some(TrapOutcome::BreakPoint {
            id: breakpoint.id(),
            addr: breakpoint.addr(),
        })
    );
    assert_eq!(breakpoint.hit_count(), 1);
    assert!(!breakpoint.is_installed());

    // the original instruction is back: the loop keeps running
    root.resume().expect("resume after hit failed");
    program.remove_breakpoint(&breakpoint).expect("remove failed");
    assert!(program.breakpoint_at(breakpoint.addr()).is_none());

    program.terminate().expect("terminate failed");
    settle(&root, RunState::Terminated);
}

pub fn scenario_breakpoint_handler() {
    let program = load_fixture(&[]);
    let root = started_root(&program);
    root.stop().expect("stop failed");
    settle(&root, RunState::Stopped);

    let breakpoint = program
        .create_breakpoint_at_symbol("spy_fixture_tick")
        .expect("breakpoint creation failed");
    let seen = Arc::new(AtomicU32::new(0));
    let handler_seen = Arc::clone(&seen);
    breakpoint.set_handler(move |breakpoint, thread| {
        assert_eq!(thread.state(), RunState::Stopped);
        handler_seen.store(breakpoint.id(), Ordering::SeqCst);
        // the handler may resume the thread itself
        thread.resume().expect("resume from handler failed");
    });

    root.resume().expect("resume failed");
    wait_until("the breakpoint handler ran", || seen.load(Ordering::SeqCst) != 0);
    assert_eq!(seen.load(Ordering::SeqCst), breakpoint.id());
    settle(&root, RunState::Running);

    program.terminate().expect("terminate failed");
    settle(&root, RunState::Terminated);
}
