use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn spawn_idle() -> Tracer {
    Tracer::spawn(|_| Ok(())).unwrap()
}

#[test]
fn spawned_engine_accepts_commands() {
    let tracer = spawn_idle();
    assert_eq!(tracer.state(), EngineState::Starting);
    assert!(!tracer.is_command_thread());
    assert_eq!(tracer.root_tid(), None);
    assert_eq!(tracer.exec(|| Ok(41 + 1)).unwrap(), 42);
}

#[test]
fn start_moves_to_tracing_once() {
    let tracer = spawn_idle();
    tracer.start().unwrap();
    assert_eq!(tracer.state(), EngineState::Tracing);
    assert!(matches!(
        tracer.start(),
        Err(Error::NotAccepting(EngineState::Tracing))
    ));
    assert_eq!(tracer.exec(|| Ok("still served")).unwrap(), "still served");
}

#[test]
fn setup_failure_surfaces_from_spawn() {
    let result = Tracer::spawn(|_| Err(Error::Bootstrap("no tracee".into())));
    assert!(matches!(result, Err(Error::Bootstrap(_))));
}

#[test]
fn commands_run_in_submission_order() {
    let tracer = spawn_idle();
    let order = Arc::new(Mutex::new(Vec::new()));
    for index in 0..64 {
        let order = Arc::clone(&order);
        tracer
            .post(move || {
                order.lock_or_poison().push(index);
                Ok(())
            })
            .unwrap();
    }
    let seen = Arc::clone(&order);
    let snapshot = tracer.exec(move || Ok(seen.lock_or_poison().clone())).unwrap();
    assert_eq!(snapshot, (0..64).collect::<Vec<_>>());
}

#[test]
fn concurrent_submitters_all_complete() {
    let tracer = Arc::new(spawn_idle());
    let executed = Arc::new(AtomicUsize::new(0));
    let submitters: Vec<_> = (0..8)
        .map(|submitter| {
            let tracer = Arc::clone(&tracer);
            let executed = Arc::clone(&executed);
            thread::spawn(move || {
                for round in 0..50 {
                    let executed = Arc::clone(&executed);
                    let value = tracer
                        .exec(move || {
                            executed.fetch_add(1, Ordering::SeqCst);
                            Ok(submitter * 1000 + round)
                        })
                        .unwrap();
                    assert_eq!(value, submitter * 1000 + round);
                }
            })
        })
        .collect();
    for submitter in submitters {
        submitter.join().unwrap();
    }
    assert_eq!(executed.load(Ordering::SeqCst), 400);
}

#[test]
fn nested_exec_runs_inline_on_the_command_thread() {
    let tracer = spawn_idle();
    let core = Arc::clone(tracer.core());
    let nested = tracer
        .exec(move || {
            let inner = Arc::clone(&core);
            let inline = core.exec(move || Ok(inner.is_command_thread()))?;
            Ok(inline && core.is_command_thread())
        })
        .unwrap();
    assert!(nested);
}

#[test]
fn post_from_the_command_thread_runs_immediately() {
    let tracer = spawn_idle();
    let core = Arc::clone(tracer.core());
    let ran = Arc::new(AtomicBool::new(false));
    let flag = Arc::clone(&ran);
    let observed = tracer
        .exec(move || {
            let inner = Arc::clone(&flag);
            core.post(move || {
                inner.store(true, Ordering::SeqCst);
                Ok(())
            })?;
            Ok(flag.load(Ordering::SeqCst))
        })
        .unwrap();
    assert!(observed);
    assert!(ran.load(Ordering::SeqCst));
}

#[test]
fn panicking_command_does_not_stop_the_engine() {
    let tracer = spawn_idle();
    let result: Result<()> = tracer.exec(|| panic!("command blew up"));
    assert!(matches!(result, Err(Error::CommandPanicked)));
    assert!(tracer.post(|| panic!("posted command blew up")).is_ok());
    assert_eq!(tracer.exec(|| Ok(7)).unwrap(), 7);
}

#[test]
fn failed_command_keeps_its_own_error() {
    let tracer = spawn_idle();
    let result: Result<()> = tracer.exec(|| Err(Error::Memory {
        addr: 0x10,
        reason: "test".into(),
    }));
    assert!(matches!(result, Err(Error::Memory { addr: 0x10, .. })));
    assert_eq!(tracer.state(), EngineState::Starting);
}

#[test]
fn stopping_engine_rejects_new_commands() {
    let tracer = spawn_idle();
    tracer.core().finish_tracing();
    let result = tracer.exec(|| Ok(()));
    assert!(matches!(
        result,
        Err(Error::NotAccepting(EngineState::Stopping | EngineState::Stopped))
    ));
    assert!(tracer.post(|| Ok(())).is_err());
    tracer.core().wait_for_state(EngineState::Stopped);
    assert_eq!(tracer.state(), EngineState::Stopped);
}

#[test]
fn queued_commands_drain_before_stop() {
    let tracer = spawn_idle();
    let executed = Arc::new(AtomicUsize::new(0));
    let gate = Arc::new((Mutex::new(false), Condvar::new()));

    // hold the command thread so the next jobs stay queued
    let blocker = Arc::clone(&gate);
    tracer
        .post(move || {
            let (open, cv) = &*blocker;
            let mut open = open.lock_or_poison();
            while !*open {
                open = cv.wait_or_poison(open);
            }
            Ok(())
        })
        .unwrap();
    for _ in 0..5 {
        let executed = Arc::clone(&executed);
        tracer
            .post(move || {
                executed.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
            .unwrap();
    }
    tracer.core().finish_tracing();
    {
        let (open, cv) = &*gate;
        *open.lock_or_poison() = true;
        cv.notify_all();
    }
    drop(tracer);
    assert_eq!(executed.load(Ordering::SeqCst), 5);
}

#[test]
fn words_round_trip_through_the_command_channel() {
    let tracer = spawn_idle();
    let word = Box::new(0x1111usize);
    let addr = &*word as *const usize as usize;
    let previous = unsafe { tracer.write_word(addr, 0xfeed) }.unwrap();
    assert_eq!(previous, 0x1111);
    assert_eq!(unsafe { tracer.read_word(addr) }.unwrap(), 0xfeed);
    assert_eq!(unsafe { std::ptr::read_volatile(&*word) }, 0xfeed);
}

#[test]
fn engine_states_are_ordered() {
    assert!(EngineState::NotStarted < EngineState::Starting);
    assert!(EngineState::Tracing < EngineState::Stopping);
    assert!(EngineState::Starting.accepts_commands());
    assert!(EngineState::Tracing.accepts_commands());
    assert!(!EngineState::Stopping.accepts_commands());
    assert!(!EngineState::NotStarted.accepts_commands());
}
