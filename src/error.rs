// Crate-wide error type, grouped by setup, command, protocol and relink failures

use crate::thread::RunState;
use crate::tracer::EngineState;
use nix::errno::Errno;
use nix::unistd::Pid;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // setup failures
    #[error("failed to load {path} into a new namespace: {reason}")]
    NamespaceLoad { path: String, reason: String },
    #[error("entry point symbol {0} not found in the spied program")]
    EntryPointMissing(String),
    #[error("failed to map a {size} byte stack: {source}")]
    StackAllocation {
        size: usize,
        source: std::io::Error,
    },
    #[error("failed to spawn the {name} thread: {source}")]
    ThreadSpawn {
        name: &'static str,
        source: std::io::Error,
    },
    #[error("tracee bootstrap failed: {0}")]
    Bootstrap(String),
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    // command failures
    #[error("{op} failed for thread {tid}: {source}")]
    Ptrace {
        op: &'static str,
        tid: Pid,
        source: Errno,
    },
    #[error("memory access at {addr:#x} failed: {reason}")]
    Memory { addr: usize, reason: String },
    #[error("command panicked on the tracer thread")]
    CommandPanicked,

    // protocol violations
    #[error("tracer is not accepting commands in state {0:?}")]
    NotAccepting(EngineState),
    #[error("thread {tid} cannot {op} while {state:?}")]
    InvalidThreadState {
        tid: Pid,
        op: &'static str,
        state: RunState,
    },
    #[error("timed out waiting for thread {tid} to become {wanted:?}")]
    Timeout { tid: Pid, wanted: RunState },

    // relink and loader failures
    #[error("library {0} is not loaded in the spied namespace")]
    LibraryNotLoaded(String),
    #[error("relink of {library} left {skipped} bindings unredirected")]
    RelinkIncomplete { library: String, skipped: usize },
    #[error("dynamic loader: {0}")]
    Loader(String),
    #[error("malformed dynamic section in {0}")]
    Format(String),
}

impl Error {
    // construction errors release partial resources and surface to the caller directly
    pub fn is_setup(&self) -> bool {
        matches!(
            self,
            Self::NamespaceLoad { .. }
                | Self::EntryPointMissing(_)
                | Self::StackAllocation { .. }
                | Self::ThreadSpawn { .. }
                | Self::Bootstrap(_)
                | Self::InvalidConfig(_)
        )
    }

    pub(crate) fn ptrace(op: &'static str, tid: Pid) -> impl FnOnce(Errno) -> Self {
        move |source| Self::Ptrace { op, tid, source }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
