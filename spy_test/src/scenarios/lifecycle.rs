use std::process::Command;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use spytester::{EngineState, ExitReason, RunState, Signal};

use crate::test_ctx::{load_fixture, settle, started_root, wait_until};

pub fn scenario_start_terminate() {
    let program = load_fixture(&[]);
    assert_eq!(program.tracer().state(), EngineState::Starting);
    assert_eq!(program.stack_size(), spytester::DEFAULT_STACK_SIZE);
    assert!(program.entry_point() != 0);

    let root = started_root(&program);
    assert_eq!(program.tracer().state(), EngineState::Tracing);
    assert_eq!(root.state(), RunState::Running);

    root.terminate().expect("terminate failed");
    settle(&root, RunState::Terminated);
    assert_eq!(root.exit_reason(), Some(ExitReason::Signaled(Signal::SIGKILL)));
    assert_eq!(root.exit_reason().and_then(|reason| reason.code()), Some(9));

    // nothing moves a terminated thread again
    assert!(root.resume().is_err());
    assert_eq!(root.state(), RunState::Terminated);
}

pub fn scenario_exit_code() {
    let program = load_fixture(&["exit", "7"]);
    let root = started_root(&program);
    settle(&root, RunState::Terminated);
    assert_eq!(root.exit_reason(), Some(ExitReason::Exited(7)));
    wait_until("the exited thread is retired", || program.thread(root.tid()).is_none());
}

pub fn scenario_thread_callbacks() {
    let program = load_fixture(&[]);
    let started = Arc::new(AtomicUsize::new(0));
    let exited = Arc::new(AtomicUsize::new(0));
    let on_start = Arc::clone(&started);
    let on_exit = Arc::clone(&exited);
    program.set_on_thread_start(move |_| {
        on_start.fetch_add(1, Ordering::SeqCst);
    });
    program.set_on_thread_exit(move |thread| {
        assert_eq!(thread.state(), RunState::Terminated);
        on_exit.fetch_add(1, Ordering::SeqCst);
    });

    let root = started_root(&program);
    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(program.threads().len(), 1);

    program.terminate().expect("program terminate failed");
    settle(&root, RunState::Terminated);
    drop(program);
    assert_eq!(exited.load(Ordering::SeqCst), 1);
}

// Children of the tester that are not traced keep their statuses and never hold up teardown
pub fn scenario_unrelated_children() {
    let program = load_fixture(&[]);
    let root = started_root(&program);

    let status = Command::new("true").status().expect("running an unrelated child failed");
    assert!(status.success());
    let mut sleeper = Command::new("sleep")
        .arg("2")
        .spawn()
        .expect("spawning an unrelated child failed");
    assert_eq!(program.threads().len(), 1, "an unrelated child was registered");

    program.terminate().expect("terminate failed");
    settle(&root, RunState::Terminated);
    let teardown = Instant::now();
    drop(program);
    assert!(
        teardown.elapsed() < Duration::from_secs(1),
        "teardown waited {:?} on an unrelated child",
        teardown.elapsed()
    );

    let status = sleeper.wait().expect("the unrelated child lost its status");
    assert!(status.success());
}

// Each program reaps only its own traced tree
pub fn scenario_two_programs() {
    let first = load_fixture(&[]);
    let second = load_fixture(&[]);
    let first_root = started_root(&first);
    let second_root = started_root(&second);

    first.terminate().expect("terminate failed");
    settle(&first_root, RunState::Terminated);
    let teardown = Instant::now();
    drop(first);
    assert!(teardown.elapsed() < Duration::from_secs(1));

    // the survivor is still traced by its own engine
    assert_eq!(second_root.state(), RunState::Running);
    second_root.stop().expect("stop failed");
    settle(&second_root, RunState::Stopped);
    second.terminate().expect("terminate failed");
    settle(&second_root, RunState::Terminated);
}
