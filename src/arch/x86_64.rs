// x86_64: int3 breakpoints, rip via PTRACE_GETREGS, and the _start trampoline
use nix::sys::ptrace;
use nix::unistd::Pid;

pub(crate) const BREAKPOINT_INSN: &[u8] = &[0xcc];

// After int3 the kernel reports rip one past the patched byte
pub(crate) fn breakpoint_address(pc: usize) -> usize {
    pc.wrapping_sub(BREAKPOINT_INSN.len())
}

pub(crate) fn read_pc(tid: Pid) -> nix::Result<usize> {
    Ok(ptrace::getregs(tid)?.rip as usize)
}

pub(crate) fn write_pc(tid: Pid, pc: usize) -> nix::Result<()> {
    let mut regs = ptrace::getregs(tid)?;
    regs.rip = pc as u64;
    ptrace::setregs(tid, regs)
}

// Kernel-style process entry: rsp points at argc, rdx carries the rtld_fini callback (none here)
core::arch::global_asm!(
    ".text",
    ".p2align 4",
    ".globl spytester_enter_entry_point",
    ".hidden spytester_enter_entry_point",
    ".type spytester_enter_entry_point, @function",
    "spytester_enter_entry_point:",
    "mov rsp, rsi",
    "xor edx, edx",
    "xor ebp, ebp",
    "jmp rdi",
    ".size spytester_enter_entry_point, . - spytester_enter_entry_point",
);

unsafe extern "C" {
    fn spytester_enter_entry_point(entry: usize, stack_pointer: usize) -> !;
}

// Never returns: the calling thread becomes the program's initial thread
pub(crate) unsafe fn enter_entry_point(entry: usize, stack_pointer: usize) -> ! {
    spytester_enter_entry_point(entry, stack_pointer)
}
