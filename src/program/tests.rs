use super::*;
use std::sync::atomic::{AtomicUsize, Ordering};

fn idle_tracer() -> Tracer {
    match Tracer::spawn(|_| Ok(())) {
        Ok(tracer) => tracer,
        Err(err) => panic!("tracer spawn failed: {err}"),
    }
}

#[test]
fn initial_stack_words_follow_kernel_layout() {
    let argv = [0x1000, 0x2000];
    let envp = [0x3000];
    let auxv = [(libc::AT_PAGESZ as usize, 4096)];
    let words = initial_stack_words(&argv, &envp, &auxv);
    assert_eq!(
        words,
        vec![
            2,
            0x1000,
            0x2000,
            0,
            0x3000,
            0,
            libc::AT_PAGESZ as usize,
            4096,
            libc::AT_NULL as usize,
            0
        ]
    );
}

#[test]
fn initial_stack_words_without_arguments() {
    let words = initial_stack_words(&[], &[], &[]);
    assert_eq!(words, vec![0, 0, 0, libc::AT_NULL as usize, 0]);
}

#[test]
fn initial_stack_is_aligned_below_top() {
    let stack = StackRegion::map(memory::page_size()).expect("map stack");
    let words = initial_stack_words(&[0x1000], &[], &[(libc::AT_PAGESZ as usize, 4096)]);
    let sp = write_initial_stack(&stack, &words).expect("write stack");

    assert_eq!(sp % 16, 0);
    assert!(sp + size_of_val(words.as_slice()) <= stack.top());
    let copied = unsafe { std::slice::from_raw_parts(sp as *const usize, words.len()) };
    assert_eq!(copied, words.as_slice());
}

#[test]
fn oversized_stack_image_is_rejected() {
    let stack = StackRegion::map(memory::page_size()).expect("map stack");
    let envp = vec![0x1000; memory::page_size() / size_of::<usize>()];
    let words = initial_stack_words(&[], &envp, &[]);
    assert!(matches!(
        write_initial_stack(&stack, &words),
        Err(Error::InvalidConfig(_))
    ));
}

#[test]
fn forwarded_auxv_reports_page_size() {
    let auxv = forwarded_auxv();
    assert!(auxv.contains(&(libc::AT_PAGESZ as usize, memory::page_size())));
    assert!(auxv.iter().all(|&(_, value)| value != 0));
}

#[test]
fn nul_bytes_in_arguments_are_rejected() {
    assert!(c_strings(&["ok", "also ok"]).is_ok());
    assert!(matches!(c_strings(&["bad\0arg"]), Err(Error::InvalidConfig(_))));
}

#[test]
fn registry_creates_each_thread_once() {
    let tracer = idle_tracer();
    let shared = ProgramShared::new(0x7000);
    let tid = Pid::from_raw(4242);

    let (first, created) = shared.thread_or_insert(tid, tracer.core(), RunState::Stopped);
    assert!(created);
    let (second, created) = shared.thread_or_insert(tid, tracer.core(), RunState::Running);
    assert!(!created);
    assert!(Arc::ptr_eq(&first, &second));
    assert_eq!(second.state(), RunState::Stopped);
    assert_eq!(shared.threads().len(), 1);
    assert_eq!(shared.stack_top(), 0x7000);
}

#[test]
fn retiring_fires_the_exit_callback_once() {
    let tracer = idle_tracer();
    let shared = ProgramShared::new(0);
    let started = Arc::new(AtomicUsize::new(0));
    let exited = Arc::new(AtomicUsize::new(0));
    let on_start = Arc::clone(&started);
    let on_exit = Arc::clone(&exited);
    *shared.on_thread_start.lock_or_poison() = Some(Arc::new(move |_: &Arc<SpiedThread>| {
        on_start.fetch_add(1, Ordering::SeqCst);
    }));
    *shared.on_thread_exit.lock_or_poison() = Some(Arc::new(move |thread: &Arc<SpiedThread>| {
        assert_eq!(thread.tid(), Pid::from_raw(77));
        on_exit.fetch_add(1, Ordering::SeqCst);
    }));

    let tid = Pid::from_raw(77);
    let (thread, _) = shared.thread_or_insert(tid, tracer.core(), RunState::Running);
    shared.notify_thread_start(&thread);
    shared.retire_thread(tid);
    shared.retire_thread(tid);

    assert_eq!(started.load(Ordering::SeqCst), 1);
    assert_eq!(exited.load(Ordering::SeqCst), 1);
    assert!(shared.thread(tid).is_none());
}

#[test]
fn missing_program_is_a_setup_error() {
    let result = SpiedProgram::new("/nonexistent/spy-program.so", &["prog"], SpyConfig::default());
    match result {
        Err(err) => assert!(err.is_setup(), "unexpected error {err}"),
        Ok(_) => panic!("loading a missing program succeeded"),
    }
}

#[test]
fn invalid_config_fails_before_loading() {
    let config = SpyConfig::default().with_stack_size(1);
    let result = SpiedProgram::new("/nonexistent/spy-program.so", &["prog"], config);
    assert!(matches!(result, Err(Error::InvalidConfig(_))));
}
