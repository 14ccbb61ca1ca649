#![allow(unsafe_op_in_unsafe_fn)]

// Fixture program loaded by the scenarios into its own namespace. It shares no libc state
// with the tester, so everything past `_start` sticks to raw syscalls.
use core::arch::naked_asm;
use core::sync::atomic::{AtomicUsize, Ordering};

static TICKS: AtomicUsize = AtomicUsize::new(0);

#[repr(C)]
struct Timespec {
    tv_sec: i64,
    tv_nsec: i64,
}

// Breakpoint target: called once per loop iteration
#[unsafe(no_mangle)]
#[inline(never)]
pub extern "C" fn spy_fixture_tick() -> usize {
    TICKS.fetch_add(1, Ordering::SeqCst) + 1
}

#[unsafe(no_mangle)]
pub extern "C" fn spy_fixture_ticks() -> usize {
    TICKS.load(Ordering::SeqCst)
}

#[cfg(target_arch = "x86_64")]
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    naked_asm!(
        "xor ebp, ebp",
        "mov rdi, rsp",
        "and rsp, -16",
        "call {main}",
        "ud2",
        main = sym fixture_main,
    )
}

#[cfg(target_arch = "aarch64")]
#[unsafe(naked)]
#[unsafe(no_mangle)]
pub unsafe extern "C" fn _start() -> ! {
    naked_asm!(
        "mov x29, xzr",
        "mov x30, xzr",
        "mov x0, sp",
        "bl {main}",
        "brk #1",
        main = sym fixture_main,
    )
}

#[cfg(target_arch = "x86_64")]
unsafe fn raw_syscall2(nr: libc::c_long, a0: usize, a1: usize) -> isize {
    let ret: isize;
    core::arch::asm!(
        "syscall",
        inlateout("rax") nr as isize => ret,
        in("rdi") a0,
        in("rsi") a1,
        lateout("rcx") _,
        lateout("r11") _,
        options(nostack),
    );
    ret
}

#[cfg(target_arch = "aarch64")]
unsafe fn raw_syscall2(nr: libc::c_long, a0: usize, a1: usize) -> isize {
    let ret: isize;
    core::arch::asm!(
        "svc #0",
        in("x8") nr as usize,
        inlateout("x0") a0 as isize => ret,
        in("x1") a1,
        options(nostack),
    );
    ret
}

fn exit_group(code: i32) -> ! {
    loop {
        unsafe { raw_syscall2(libc::SYS_exit_group, code as usize, 0) };
    }
}

fn sleep_millis(millis: i64) {
    let request = Timespec {
        tv_sec: 0,
        tv_nsec: millis * 1_000_000,
    };
    unsafe { raw_syscall2(libc::SYS_nanosleep, &request as *const Timespec as usize, 0) };
}

unsafe fn c_arg<'a>(ptr: *const u8) -> &'a [u8] {
    let mut len = 0;
    while *ptr.add(len) != 0 {
        len += 1;
    }
    core::slice::from_raw_parts(ptr, len)
}

fn parse_code(text: &[u8]) -> Option<i32> {
    if text.is_empty() || text.len() > 3 {
        return None;
    }
    text.iter().try_fold(0i32, |code, digit| {
        digit.is_ascii_digit().then(|| code * 10 + i32::from(digit - b'0'))
    })
}

// argv: [name] loops calling spy_fixture_tick until killed; [name, "exit", N] exits with N
unsafe extern "C" fn fixture_main(sp: *const usize) -> ! {
    let argc = *sp;
    let argv = sp.add(1) as *const *const u8;
    if argc >= 3 && c_arg(*argv.add(1)) == b"exit" {
        exit_group(parse_code(c_arg(*argv.add(2))).unwrap_or(1));
    }
    loop {
        spy_fixture_tick();
        sleep_millis(1);
    }
}
