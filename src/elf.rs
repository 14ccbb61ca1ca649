// Dynamic-section view of a loaded module: symbol/string tables, relocation tables, DT_NEEDED

use crate::error::{Error, Result};
use std::ffi::{CStr, c_char};
use std::mem;
use std::path::Path;
use std::slice;

// r_sym / r_type extraction from r_info
mod reloc;

#[cfg(test)]
pub(crate) mod fixture;

use reloc::{elf_r_sym, elf_r_type};

// dynamic section tags
pub(crate) const DT_NULL: i64 = 0;
pub(crate) const DT_NEEDED: i64 = 1;
pub(crate) const DT_PLTRELSZ: i64 = 2;
pub(crate) const DT_STRTAB: i64 = 5;
pub(crate) const DT_SYMTAB: i64 = 6;
pub(crate) const DT_RELA: i64 = 7;
pub(crate) const DT_RELASZ: i64 = 8;
pub(crate) const DT_STRSZ: i64 = 10;
pub(crate) const DT_REL: i64 = 17;
pub(crate) const DT_RELSZ: i64 = 18;
pub(crate) const DT_PLTREL: i64 = 20;
pub(crate) const DT_JMPREL: i64 = 23;

// AArch64 relocation types
#[cfg(target_arch = "aarch64")]
pub(crate) const R_GENERIC_JUMP_SLOT: u32 = 1026;
#[cfg(target_arch = "aarch64")]
pub(crate) const R_GENERIC_GLOB_DAT: u32 = 1025;
// R_AARCH64_ABS64
#[cfg(all(test, target_arch = "aarch64"))]
pub(crate) const R_GENERIC_ABS: u32 = 257;

// x86_64 relocation types
#[cfg(target_arch = "x86_64")]
pub(crate) const R_GENERIC_JUMP_SLOT: u32 = 7;
#[cfg(target_arch = "x86_64")]
pub(crate) const R_GENERIC_GLOB_DAT: u32 = 6;
// R_X86_64_64
#[cfg(all(test, target_arch = "x86_64"))]
pub(crate) const R_GENERIC_ABS: u32 = 1;

type ElfAddr = u64;
type ElfWord = u32;
type ElfXword = u64;
type ElfSxword = i64;
type ElfHalf = u16;

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ElfDyn {
    pub(crate) d_tag: ElfSxword,
    pub(crate) d_un: ElfXword,
}

#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ElfSym {
    pub(crate) st_name: ElfWord,
    pub(crate) st_info: u8,
    pub(crate) st_other: u8,
    pub(crate) st_shndx: ElfHalf,
    pub(crate) st_value: ElfAddr,
    pub(crate) st_size: ElfXword,
}

// REL entry, no addend
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ElfRel {
    pub(crate) r_offset: ElfAddr,
    pub(crate) r_info: ElfXword,
}

// RELA entry, with addend
#[repr(C)]
#[derive(Clone, Copy)]
pub(crate) struct ElfRela {
    pub(crate) r_offset: ElfAddr,
    pub(crate) r_info: ElfXword,
    pub(crate) r_addend: ElfSxword,
}

// The two binding kinds a relink pass may rewrite
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BindingKind {
    GlobalData,
    JumpSlot,
}

impl BindingKind {
    pub(crate) fn from_type(r_type: u32) -> Option<Self> {
        match r_type {
            R_GENERIC_GLOB_DAT => Some(Self::GlobalData),
            R_GENERIC_JUMP_SLOT => Some(Self::JumpSlot),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum RelocTable {
    Dyn,
    Plt,
}

#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) struct Relocation {
    pub(crate) table: RelocTable,
    pub(crate) offset: usize,
    pub(crate) sym: u32,
    pub(crate) r_type: u32,
}

// Tables of one loaded module, read in place from its dynamic section
pub(crate) struct ModuleImage {
    name: String,
    bias: usize,
    strtab: *const c_char,
    strtab_sz: usize,
    symtab: *const ElfSym,
    // .rel(a).dyn address and size
    reldyn: usize,
    reldyn_sz: usize,
    reldyn_rela: bool,
    // .rel(a).plt address and size
    relplt: usize,
    relplt_sz: usize,
    relplt_rela: bool,
    // DT_NEEDED string table offsets
    needed: Vec<usize>,
}

// glibc rewrites most d_ptr entries to absolute addresses while loading; the vDSO keeps
// link-time values. Anything below the bias cannot be absolute.
fn resolve_dyn_ptr(bias: usize, value: u64) -> usize {
    let value = value as usize;
    if value >= bias { value } else { bias.wrapping_add(value) }
}

impl ModuleImage {
    // Walks the DT_NULL terminated dynamic array. Ok(None) means the module has no
    // symbol or string table and is not relinkable.
    pub(crate) unsafe fn from_dynamic(
        name: &str,
        bias: usize,
        dynamic: *const ElfDyn,
    ) -> Result<Option<Self>> {
        if dynamic.is_null() {
            return Ok(None);
        }

        let mut image = ModuleImage {
            name: name.to_string(),
            bias,
            strtab: std::ptr::null(),
            strtab_sz: 0,
            symtab: std::ptr::null(),
            reldyn: 0,
            reldyn_sz: 0,
            reldyn_rela: true,
            relplt: 0,
            relplt_sz: 0,
            relplt_rela: true,
            needed: Vec::new(),
        };

        let mut entry = dynamic;
        loop {
            let dyn_entry = *entry;
            match dyn_entry.d_tag {
                DT_NULL => break,
                DT_NEEDED => image.needed.push(dyn_entry.d_un as usize),
                DT_STRTAB => image.strtab = resolve_dyn_ptr(bias, dyn_entry.d_un) as *const c_char,
                DT_STRSZ => image.strtab_sz = dyn_entry.d_un as usize,
                DT_SYMTAB => image.symtab = resolve_dyn_ptr(bias, dyn_entry.d_un) as *const ElfSym,
                DT_PLTREL => image.relplt_rela = dyn_entry.d_un as i64 == DT_RELA,
                DT_JMPREL => image.relplt = resolve_dyn_ptr(bias, dyn_entry.d_un),
                DT_PLTRELSZ => image.relplt_sz = dyn_entry.d_un as usize,
                DT_REL | DT_RELA => {
                    image.reldyn = resolve_dyn_ptr(bias, dyn_entry.d_un);
                    image.reldyn_rela = dyn_entry.d_tag == DT_RELA;
                }
                DT_RELSZ | DT_RELASZ => image.reldyn_sz = dyn_entry.d_un as usize,
                _ => {}
            }
            entry = entry.add(1);
        }

        if image.strtab.is_null() || image.symtab.is_null() {
            return Ok(None);
        }
        let dyn_partial = (image.reldyn == 0) != (image.reldyn_sz == 0);
        let plt_partial = (image.relplt == 0) != (image.relplt_sz == 0);
        if dyn_partial || plt_partial {
            return Err(Error::Format(image.name));
        }
        Ok(Some(image))
    }

    pub(crate) fn name(&self) -> &str {
        &self.name
    }

    fn string_at(&self, offset: usize) -> Option<&str> {
        if self.strtab_sz != 0 && offset >= self.strtab_sz {
            return None;
        }
        let name = unsafe { CStr::from_ptr(self.strtab.add(offset)) };
        name.to_str().ok()
    }

    pub(crate) fn needed(&self) -> impl Iterator<Item = &str> {
        self.needed.iter().filter_map(|offset| self.string_at(*offset))
    }

    // Does this module declare a dependency on `library`?
    pub(crate) fn needs(&self, library: &str) -> bool {
        self.needed().any(|needed| library_matches(needed, library))
    }

    pub(crate) fn symbol_name(&self, sym_index: u32) -> Option<&str> {
        if sym_index == 0 {
            return None;
        }
        let sym = unsafe { &*self.symtab.add(sym_index as usize) };
        let name = self.string_at(sym.st_name as usize)?;
        (!name.is_empty()).then_some(name)
    }

    // .rel(a).dyn entries first, then .rel(a).plt
    pub(crate) fn relocations(&self) -> Vec<Relocation> {
        let mut relocations = Vec::new();
        unsafe {
            let dyn_table = (self.reldyn, self.reldyn_sz, self.reldyn_rela);
            let plt_table = (self.relplt, self.relplt_sz, self.relplt_rela);
            collect_table(RelocTable::Dyn, dyn_table, &mut relocations);
            collect_table(RelocTable::Plt, plt_table, &mut relocations);
        }
        relocations
    }

    // absolute address of the slot a relocation binds
    pub(crate) fn slot_address(&self, relocation: &Relocation) -> usize {
        self.bias.wrapping_add(relocation.offset)
    }
}

unsafe fn collect_table(
    table: RelocTable,
    (addr, size, is_rela): (usize, usize, bool),
    out: &mut Vec<Relocation>,
) {
    if addr == 0 || size == 0 {
        return;
    }
    let mut push = |offset: u64, info: u64| {
        out.push(Relocation {
            table,
            offset: offset as usize,
            sym: elf_r_sym(info),
            r_type: elf_r_type(info),
        })
    };
    if is_rela {
        let count = size / mem::size_of::<ElfRela>();
        for rela in slice::from_raw_parts(addr as *const ElfRela, count) {
            push(rela.r_offset, rela.r_info);
        }
    } else {
        let count = size / mem::size_of::<ElfRel>();
        for rel in slice::from_raw_parts(addr as *const ElfRel, count) {
            push(rel.r_offset, rel.r_info);
        }
    }
}

// A DT_NEEDED entry matches the exact requested name, or the file name of a requested path
pub(crate) fn library_matches(needed: &str, requested: &str) -> bool {
    if needed == requested {
        return true;
    }
    if !requested.contains('/') {
        return false;
    }
    Path::new(requested)
        .file_name()
        .and_then(|name| name.to_str())
        .is_some_and(|name| name == needed)
}
