// Local memory helpers: page protections read from /proc/self/maps, protected word writes, stack mappings

use crate::error::{Error, Result};
use crate::log;
use once_cell::sync::OnceCell;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::ptr;
use std::sync::atomic::{Ordering, fence};

pub(crate) const PROT_READ_FLAG: u32 = 0x1;
pub(crate) const PROT_WRITE_FLAG: u32 = 0x2;
pub(crate) const PROT_EXEC_FLAG: u32 = 0x4;

const WORD_SIZE: usize = std::mem::size_of::<usize>();

// Protection of [addr, addr+len); across several mappings the intersection is returned
pub(crate) fn get_mem_protect(addr: usize, len: usize) -> Result<u32> {
    let file = File::open("/proc/self/maps").map_err(|err| Error::Memory {
        addr,
        reason: format!("open /proc/self/maps: {err}"),
    })?;
    scan_maps_for_protect(BufReader::new(file), addr, len)
}

// Only private mappings (perm[3] == 'p') count, shared ones are never patched
fn scan_maps_for_protect(reader: impl BufRead, addr: usize, len: usize) -> Result<u32> {
    let mut start_addr = addr;
    let end_addr = addr.saturating_add(len);
    let mut prot: Option<u32> = None;

    for line in reader.lines() {
        let line = line.map_err(|err| Error::Memory {
            addr,
            reason: format!("read /proc/self/maps: {err}"),
        })?;
        let Some((start, end, perm)) = parse_maps_range(&line) else {
            continue;
        };
        if perm[3] != b'p' || start_addr < start || start_addr >= end {
            continue;
        }

        let mut line_prot = 0;
        if perm[0] == b'r' {
            line_prot |= PROT_READ_FLAG;
        }
        if perm[1] == b'w' {
            line_prot |= PROT_WRITE_FLAG;
        }
        if perm[2] == b'x' {
            line_prot |= PROT_EXEC_FLAG;
        }
        prot = Some(prot.map_or(line_prot, |prev| prev & line_prot));

        if end_addr <= end {
            return prot.ok_or_else(|| unmapped(addr));
        }
        start_addr = end;
    }

    Err(unmapped(addr))
}

fn unmapped(addr: usize) -> Error {
    Error::Memory {
        addr,
        reason: "address is not covered by a private mapping".into(),
    }
}

fn parse_maps_range(line: &str) -> Option<(usize, usize, &[u8])> {
    let mut parts = line.split_whitespace();
    let range = parts.next()?;
    let perm = parts.next()?.as_bytes();
    if perm.len() < 4 {
        return None;
    }
    let (start, end) = range.split_once('-')?;
    let start = usize::from_str_radix(start, 16).ok()?;
    let end = usize::from_str_radix(end, 16).ok()?;
    Some((start, end, perm))
}

pub(crate) fn get_addr_protect(addr: usize) -> Result<u32> {
    get_mem_protect(addr, WORD_SIZE)
}

// Changes the protection of the page(s) holding one word at addr
pub(crate) fn set_addr_protect(addr: usize, prot: u32) -> Result<()> {
    let (start, len) = page_bounds(addr);
    let result = unsafe { libc::mprotect(start as *mut libc::c_void, len, prot as i32) };
    if result != 0 {
        let err = std::io::Error::last_os_error();
        log::error(format_args!("mprotect 0x{start:x}+0x{len:x} failed: {err}"));
        return Err(Error::Memory {
            addr,
            reason: format!("mprotect: {err}"),
        });
    }
    Ok(())
}

pub(crate) unsafe fn read_word(addr: usize) -> usize {
    ptr::read_volatile(addr as *const usize)
}

// Writes one word in place, temporarily adding write permission when the page lacks it.
// Returns the previous value.
pub(crate) unsafe fn write_word_protected(addr: usize, value: usize) -> Result<usize> {
    if addr == 0 || addr % WORD_SIZE != 0 {
        return Err(Error::Memory {
            addr,
            reason: "unaligned word address".into(),
        });
    }
    let prot = get_addr_protect(addr)?;
    if prot & PROT_READ_FLAG == 0 {
        return Err(Error::Memory {
            addr,
            reason: "page is not readable".into(),
        });
    }
    let writable = prot & PROT_WRITE_FLAG != 0;
    if !writable {
        set_addr_protect(addr, prot | PROT_WRITE_FLAG)?;
    }

    let previous = ptr::read_volatile(addr as *const usize);
    ptr::write_volatile(addr as *mut usize, value);

    if !writable && let Err(err) = set_addr_protect(addr, prot) {
        log::warn(format_args!("failed to restore protection at 0x{addr:x}: {err}"));
    }
    if prot & PROT_EXEC_FLAG != 0 {
        flush_instruction_cache_range(addr, addr + WORD_SIZE);
    }
    Ok(previous)
}

// aarch64: clean dcache lines then invalidate icache lines, finishing with dsb+isb
// x86_64: caches are coherent, a fence is enough
pub(crate) fn flush_instruction_cache_range(start: usize, end: usize) {
    if start >= end {
        return;
    }

    #[cfg(target_arch = "aarch64")]
    {
        let (dcache_line, icache_line) = cache_line_size();
        let mut dcache_addr = align_down(start, dcache_line);
        while dcache_addr < end {
            unsafe {
                core::arch::asm!("dc cvau, {}", in(reg) dcache_addr, options(nostack, preserves_flags));
            }
            dcache_addr = dcache_addr.saturating_add(dcache_line);
        }
        unsafe {
            core::arch::asm!("dsb ish", options(nostack, preserves_flags));
        }

        let mut icache_addr = align_down(start, icache_line);
        while icache_addr < end {
            unsafe {
                core::arch::asm!("ic ivau, {}", in(reg) icache_addr, options(nostack, preserves_flags));
            }
            icache_addr = icache_addr.saturating_add(icache_line);
        }
        unsafe {
            core::arch::asm!("dsb ish", options(nostack, preserves_flags));
            core::arch::asm!("isb", options(nostack, preserves_flags));
        }
    }

    #[cfg(target_arch = "x86_64")]
    {
        fence(Ordering::SeqCst);
    }
}

#[cfg(target_arch = "aarch64")]
fn cache_line_size() -> (usize, usize) {
    let ctr_el0: usize;
    unsafe {
        core::arch::asm!("mrs {}, ctr_el0", out(reg) ctr_el0, options(nomem, nostack, preserves_flags));
    }

    let dcache_line = 4usize << ((ctr_el0 >> 16) & 0x0f);
    let icache_line = 4usize << (ctr_el0 & 0x0f);
    (dcache_line.max(4), icache_line.max(4))
}

pub(crate) fn align_down(addr: usize, align: usize) -> usize {
    let mask = !(align.saturating_sub(1));
    addr & mask
}

pub(crate) fn page_size() -> usize {
    static PAGE_SIZE: OnceCell<usize> = OnceCell::new();
    *PAGE_SIZE.get_or_init(|| {
        let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
        if size > 0 { size as usize } else { 4096 }
    })
}

// Page-aligned start and length covering one word at addr
fn page_bounds(addr: usize) -> (usize, usize) {
    let page_size = page_size();
    let page_mask = !(page_size - 1);
    let start = addr & page_mask;
    let end = ((addr + WORD_SIZE - 1) & page_mask) + page_size;
    (start, end - start)
}

// Anonymous private mapping used as a thread stack, unmapped on drop
pub(crate) struct StackRegion {
    base: usize,
    len: usize,
}

impl StackRegion {
    pub(crate) fn map(len: usize) -> Result<Self> {
        let page_size = page_size();
        let len = len.div_ceil(page_size) * page_size;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_PRIVATE | libc::MAP_ANONYMOUS | libc::MAP_STACK,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(Error::StackAllocation {
                size: len,
                source: std::io::Error::last_os_error(),
            });
        }
        log::debug(format_args!("mapped stack 0x{:x}+0x{len:x}", base as usize));
        Ok(Self {
            base: base as usize,
            len,
        })
    }

    #[cfg(test)]
    pub(crate) fn base(&self) -> usize {
        self.base
    }

    pub(crate) fn len(&self) -> usize {
        self.len
    }

    // stacks grow down, so the usable start is the end of the mapping
    pub(crate) fn top(&self) -> usize {
        self.base + self.len
    }
}

impl Drop for StackRegion {
    fn drop(&mut self) {
        let result = unsafe { libc::munmap(self.base as *mut libc::c_void, self.len) };
        if result != 0 {
            log::warn(format_args!(
                "munmap 0x{:x}+0x{:x} failed: {}",
                self.base,
                self.len,
                std::io::Error::last_os_error()
            ));
        }
    }
}
