mod scenarios;
mod test_ctx;

use spytester::set_debug_enabled;

fn main() {
    test_ctx::init_logging();
    set_debug_enabled(test_ctx::env_flag("SPY_TEST_DEBUG"));
    scenarios::run_all();
    println!("spy_test all scenarios passed");
}
