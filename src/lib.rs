#![allow(unsafe_op_in_unsafe_fn)]
#![allow(clippy::missing_safety_doc)]

#[cfg(not(all(target_os = "linux", target_env = "gnu")))]
compile_error!("spytester needs Linux with glibc (dlmopen, ptrace and clone)");

#[cfg(not(any(target_arch = "aarch64", target_arch = "x86_64")))]
compile_error!("spytester supports only 64-bit architectures: aarch64 and x86_64");

// Trap instruction, pc access and entry trampoline per architecture
mod arch;
// One-shot software breakpoints
mod breakpoint;
// SpyConfig and its environment overrides
mod config;
// Dynamic section, symbol and relocation table reader
mod elf;
mod error;
// dlmopen/dlinfo wrappers and link map traversal
mod loader;
mod log;
// /proc/self/maps protections, protected word writes and stack mappings
mod memory;
// SpiedProgram facade and the registry the event thread reaches
mod program;
// Relocation patching toward a namespace copy of a library
mod relink;
mod sync;
// Per traced thread state machine
mod thread;
// Command/event engine and the tracee bootstrap
mod tracer;

pub use breakpoint::{BreakPoint, BreakPointHandler};
pub use config::{
    DEFAULT_ENTRY_SYMBOL, DEFAULT_HELPER_STACK_SIZE, DEFAULT_STACK_SIZE, RelinkPolicy, SpyConfig,
};
pub use elf::BindingKind;
pub use error::{Error, Result};
pub use loader::Lmid;
pub use log::{debug_enabled, set_debug_enabled};
pub use nix::sys::signal::Signal;
pub use nix::unistd::Pid;
pub use program::{SpiedProgram, ThreadCallback};
pub use relink::{PatchedBinding, RelinkReport, SkipReason, SkippedBinding};
pub use thread::{ExitReason, RunState, SpiedThread, TrapOutcome, WatchPoint};
pub use tracer::{EngineState, Tracer};
