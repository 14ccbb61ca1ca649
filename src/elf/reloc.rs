// r_info of an ELF64 relocation packs the symbol index and the relocation type

// high 32 bits: symbol table index
pub(super) fn elf_r_sym(info: u64) -> u32 {
    (info >> 32) as u32
}

// low 32 bits: relocation type
pub(super) fn elf_r_type(info: u64) -> u32 {
    (info & 0xffff_ffff) as u32
}

#[cfg(test)]
pub(super) fn elf_r_info(sym: u32, r_type: u32) -> u64 {
    ((sym as u64) << 32) | r_type as u64
}
