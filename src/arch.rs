// Architecture boundary: entry trampoline, breakpoint encoding, program counter access

#[cfg(target_arch = "aarch64")]
mod aarch64;
#[cfg(target_arch = "x86_64")]
mod x86_64;

#[cfg(target_arch = "aarch64")]
pub(crate) use aarch64::{BREAKPOINT_INSN, breakpoint_address, enter_entry_point, read_pc, write_pc};
#[cfg(target_arch = "x86_64")]
pub(crate) use x86_64::{BREAKPOINT_INSN, breakpoint_address, enter_entry_point, read_pc, write_pc};

const WORD_SIZE: usize = std::mem::size_of::<usize>();

// Aligned word holding the breakpoint instruction at `addr`, and the byte offset inside it
pub(crate) fn patch_window(addr: usize) -> (usize, usize) {
    let word = addr & !(WORD_SIZE - 1);
    (word, addr - word)
}

// `word` with BREAKPOINT_INSN written at byte `offset`; the instruction must fit the word
pub(crate) fn insert_breakpoint(word: usize, offset: usize) -> Option<usize> {
    if offset + BREAKPOINT_INSN.len() > WORD_SIZE {
        return None;
    }
    let mut bytes = word.to_ne_bytes();
    bytes[offset..offset + BREAKPOINT_INSN.len()].copy_from_slice(BREAKPOINT_INSN);
    Some(usize::from_ne_bytes(bytes))
}

// `current` with the bytes at `offset` taken back from `original`
pub(crate) fn restore_breakpoint(current: usize, original: usize, offset: usize) -> usize {
    let mut bytes = current.to_ne_bytes();
    let original = original.to_ne_bytes();
    let end = (offset + BREAKPOINT_INSN.len()).min(WORD_SIZE);
    bytes[offset..end].copy_from_slice(&original[offset..end]);
    usize::from_ne_bytes(bytes)
}
