mod concurrency;
mod lifecycle;
mod relink;
mod stepping;

use crate::test_ctx::env_flag;

pub fn run_all() {
    run("start-terminate", lifecycle::scenario_start_terminate);
    run("exit-code", lifecycle::scenario_exit_code);
    run("thread-callbacks", lifecycle::scenario_thread_callbacks);
    run("unrelated-children", lifecycle::scenario_unrelated_children);
    run("two-programs", lifecycle::scenario_two_programs);
    run("step-vs-breakpoint", stepping::scenario_step_versus_breakpoint);
    run("breakpoint-handler", stepping::scenario_breakpoint_handler);
    run("relink-libm", relink::scenario_relink_libm);
    run("relink-undeclared", relink::scenario_relink_undeclared_library);
    run("stop-resume-cycles", concurrency::scenario_stop_resume_cycles);
    run("parallel-submitters", concurrency::scenario_parallel_submitters);
    if env_flag("SPY_TEST_SOAK") {
        run("stop-resume-soak", concurrency::scenario_stop_resume_soak);
    }
}

fn run(name: &str, scenario: fn()) {
    println!("scenario: {name}");
    scenario();
}
