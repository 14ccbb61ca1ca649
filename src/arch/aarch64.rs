// aarch64: brk #0 breakpoints, pc via PTRACE_GETREGSET, and the _start trampoline
use nix::errno::Errno;
use nix::unistd::Pid;
use std::ffi::c_void;

// brk #0, little endian
pub(crate) const BREAKPOINT_INSN: &[u8] = &[0x00, 0x00, 0x20, 0xd4];

// brk does not advance the pc
pub(crate) fn breakpoint_address(pc: usize) -> usize {
    pc
}

fn get_regs(tid: Pid) -> nix::Result<libc::user_regs_struct> {
    let mut regs: libc::user_regs_struct = unsafe { std::mem::zeroed() };
    let mut iov = libc::iovec {
        iov_base: (&mut regs as *mut libc::user_regs_struct).cast::<c_void>(),
        iov_len: std::mem::size_of::<libc::user_regs_struct>(),
    };
    let result = unsafe {
        libc::ptrace(
            libc::PTRACE_GETREGSET,
            tid.as_raw(),
            libc::NT_PRSTATUS as usize as *mut c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(result)?;
    Ok(regs)
}

fn set_regs(tid: Pid, regs: &mut libc::user_regs_struct) -> nix::Result<()> {
    let mut iov = libc::iovec {
        iov_base: (regs as *mut libc::user_regs_struct).cast::<c_void>(),
        iov_len: std::mem::size_of::<libc::user_regs_struct>(),
    };
    let result = unsafe {
        libc::ptrace(
            libc::PTRACE_SETREGSET,
            tid.as_raw(),
            libc::NT_PRSTATUS as usize as *mut c_void,
            &mut iov as *mut libc::iovec,
        )
    };
    Errno::result(result).map(drop)
}

pub(crate) fn read_pc(tid: Pid) -> nix::Result<usize> {
    Ok(get_regs(tid)?.pc as usize)
}

pub(crate) fn write_pc(tid: Pid, pc: usize) -> nix::Result<()> {
    let mut regs = get_regs(tid)?;
    regs.pc = pc as u64;
    set_regs(tid, &mut regs)
}

// Kernel-style process entry: sp points at argc, x0 carries the rtld_fini callback (none here)
core::arch::global_asm!(
    ".text",
    ".p2align 2",
    ".globl spytester_enter_entry_point",
    ".hidden spytester_enter_entry_point",
    ".type spytester_enter_entry_point, %function",
    "spytester_enter_entry_point:",
    "mov sp, x1",
    "mov x16, x0",
    "mov x0, xzr",
    "mov x29, xzr",
    "mov x30, xzr",
    "br x16",
    ".size spytester_enter_entry_point, . - spytester_enter_entry_point",
);

unsafe extern "C" {
    fn spytester_enter_entry_point(entry: usize, stack_pointer: usize) -> !;
}

pub(crate) unsafe fn enter_entry_point(entry: usize, stack_pointer: usize) -> ! {
    spytester_enter_entry_point(entry, stack_pointer)
}
