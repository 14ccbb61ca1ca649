use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use spytester::{RunState, SpiedProgram, SpiedThread, SpyConfig};
use tracing_subscriber::EnvFilter;

pub const FIXTURE_NAME: &str = "libspy_test.so";
pub const SETTLE_TIMEOUT: Duration = Duration::from_secs(5);

pub fn env_flag(name: &str) -> bool {
    std::env::var(name)
        .ok()
        .map(|value| {
            matches!(
                value.trim().to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            )
        })
        .unwrap_or(false)
}

pub fn init_logging() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("spytester=info"));
    let _ = tracing_subscriber::fmt().with_env_filter(filter).try_init();
}

// SPY_TEST_FIXTURE overrides; the default is the cdylib built next to this binary
pub fn fixture_path() -> String {
    if let Ok(path) = std::env::var("SPY_TEST_FIXTURE") {
        return path;
    }
    let exe = std::env::current_exe().expect("current_exe failed");
    let dir = exe.parent().map(PathBuf::from).unwrap_or_default();
    dir.join(FIXTURE_NAME).to_string_lossy().into_owned()
}

pub fn load_fixture(args: &[&str]) -> SpiedProgram {
    let mut argv = vec![FIXTURE_NAME];
    argv.extend_from_slice(args);
    SpiedProgram::new(&fixture_path(), &argv, SpyConfig::from_env())
        .expect("loading the fixture program failed")
}

pub fn started_root(program: &SpiedProgram) -> Arc<SpiedThread> {
    program.start().expect("start failed");
    program.root_thread().expect("root thread not registered")
}

pub fn settle(thread: &SpiedThread, wanted: RunState) {
    thread
        .wait_for(wanted, SETTLE_TIMEOUT)
        .unwrap_or_else(|err| panic!("thread {} never became {wanted:?}: {err}", thread.tid()));
}

pub fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let deadline = Instant::now() + SETTLE_TIMEOUT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting until {what}");
        std::thread::sleep(Duration::from_millis(1));
    }
}
