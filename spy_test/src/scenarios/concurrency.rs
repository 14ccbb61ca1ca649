use std::sync::atomic::{AtomicUsize, Ordering};
use std::thread;

use spytester::{RunState, SpiedProgram};

use crate::test_ctx::{load_fixture, settle, started_root};

const SUBMITTERS: usize = 8;
const ROUNDS: usize = 50;

fn stop_resume(program: &SpiedProgram, cycles: usize) {
    let root = started_root(program);
    for cycle in 0..cycles {
        root.stop().unwrap_or_else(|err| panic!("stop in cycle {cycle} failed: {err}"));
        settle(&root, RunState::Stopped);
        root.resume().unwrap_or_else(|err| panic!("resume in cycle {cycle} failed: {err}"));
        assert_eq!(root.state(), RunState::Running);
    }
    program.terminate().expect("terminate failed");
    settle(&root, RunState::Terminated);
}

pub fn scenario_stop_resume_cycles() {
    let program = load_fixture(&[]);
    stop_resume(&program, 20);
}

pub fn scenario_stop_resume_soak() {
    let program = load_fixture(&[]);
    stop_resume(&program, 2000);
}

pub fn scenario_parallel_submitters() {
    let program = load_fixture(&[]);
    let root = started_root(&program);
    root.stop().expect("stop failed");
    settle(&root, RunState::Stopped);

    let tracer = program.tracer();
    let entry_word = program.entry_point() & !(size_of::<usize>() - 1);
    let expected = unsafe { tracer.read_word(entry_word) }.expect("read entry word failed");
    let executed = AtomicUsize::new(0);

    thread::scope(|scope| {
        for _ in 0..SUBMITTERS {
            scope.spawn(|| {
                for _ in 0..ROUNDS {
                    let word = unsafe { tracer.read_word(entry_word) }.expect("read failed");
                    assert_eq!(word, expected);
                    tracer.exec(|| Ok(())).expect("exec failed");
                    executed.fetch_add(1, Ordering::SeqCst);
                }
            });
        }
    });
    assert_eq!(executed.load(Ordering::SeqCst), SUBMITTERS * ROUNDS);
    assert_eq!(root.state(), RunState::Stopped);

    program.terminate().expect("terminate failed");
    settle(&root, RunState::Terminated);
}
