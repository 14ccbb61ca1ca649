// In-memory module with a hand-built dynamic section, for relink tests that must not touch real GOTs

use super::reloc::elf_r_info;
use super::{
    DT_JMPREL, DT_NEEDED, DT_NULL, DT_PLTREL, DT_PLTRELSZ, DT_RELA, DT_RELASZ, DT_STRSZ,
    DT_STRTAB, DT_SYMTAB, ElfDyn, ElfRela, ElfSym, ModuleImage, R_GENERIC_ABS,
    R_GENERIC_GLOB_DAT, R_GENERIC_JUMP_SLOT,
};
use std::mem;

pub(crate) const FAKE_NEEDED: &str = "libspyfake.so.1";
pub(crate) const SLOT_COUNT: usize = 5;

// slot layout:
// 0: GLOB_DAT spy_global   1: GLOB_DAT spy_missing   2: RELATIVE (no symbol)
// 3: JUMP_SLOT spy_func    4: ABS64 spy_func (not a binding kind)
pub(crate) const SLOT_GLOBAL: usize = 0;
pub(crate) const SLOT_MISSING: usize = 1;
pub(crate) const SLOT_RELATIVE: usize = 2;
pub(crate) const SLOT_FUNC: usize = 3;
pub(crate) const SLOT_ABS: usize = 4;

#[cfg(target_arch = "x86_64")]
const R_GENERIC_RELATIVE: u32 = 8;
#[cfg(target_arch = "aarch64")]
const R_GENERIC_RELATIVE: u32 = 1027;

pub(crate) struct SyntheticModule {
    strtab: Vec<u8>,
    symtab: Vec<ElfSym>,
    rela_dyn: Vec<ElfRela>,
    rela_plt: Vec<ElfRela>,
    dynamic: Vec<ElfDyn>,
    pub(crate) slots: Box<[usize; SLOT_COUNT]>,
}

fn sym(st_name: usize) -> ElfSym {
    ElfSym {
        st_name: st_name as u32,
        st_info: 0x12,
        st_other: 0,
        st_shndx: 0,
        st_value: 0,
        st_size: 0,
    }
}

impl SyntheticModule {
    pub(crate) fn new(needed: &str) -> Box<Self> {
        let mut strtab = vec![0u8];
        let mut intern = |text: &str| {
            let offset = strtab.len();
            strtab.extend_from_slice(text.as_bytes());
            strtab.push(0);
            offset
        };
        let needed_off = intern(needed);
        let global_off = intern("spy_global");
        let missing_off = intern("spy_missing");
        let func_off = intern("spy_func");

        let mut module = Box::new(SyntheticModule {
            strtab,
            symtab: vec![sym(0), sym(global_off), sym(missing_off), sym(func_off)],
            rela_dyn: Vec::new(),
            rela_plt: Vec::new(),
            dynamic: Vec::new(),
            slots: Box::new([0x1000, 0x2000, 0x3000, 0x4000, 0x5000]),
        });

        let slot = |module: &SyntheticModule, index: usize| {
            &module.slots[index] as *const usize as u64
        };
        module.rela_dyn = vec![
            rela(slot(&module, SLOT_GLOBAL), elf_r_info(1, R_GENERIC_GLOB_DAT)),
            rela(slot(&module, SLOT_MISSING), elf_r_info(2, R_GENERIC_GLOB_DAT)),
            rela(slot(&module, SLOT_RELATIVE), elf_r_info(0, R_GENERIC_RELATIVE)),
        ];
        module.rela_plt = vec![
            rela(slot(&module, SLOT_FUNC), elf_r_info(3, R_GENERIC_JUMP_SLOT)),
            rela(slot(&module, SLOT_ABS), elf_r_info(3, R_GENERIC_ABS)),
        ];
        module.dynamic = vec![
            dyn_entry(DT_NEEDED, needed_off as u64),
            dyn_entry(DT_STRTAB, module.strtab.as_ptr() as u64),
            dyn_entry(DT_STRSZ, module.strtab.len() as u64),
            dyn_entry(DT_SYMTAB, module.symtab.as_ptr() as u64),
            dyn_entry(DT_RELA, module.rela_dyn.as_ptr() as u64),
            dyn_entry(DT_RELASZ, (module.rela_dyn.len() * mem::size_of::<ElfRela>()) as u64),
            dyn_entry(DT_PLTREL, DT_RELA as u64),
            dyn_entry(DT_JMPREL, module.rela_plt.as_ptr() as u64),
            dyn_entry(DT_PLTRELSZ, (module.rela_plt.len() * mem::size_of::<ElfRela>()) as u64),
            dyn_entry(DT_NULL, 0),
        ];
        module
    }

    pub(crate) fn slot_addr(&self, index: usize) -> usize {
        &self.slots[index] as *const usize as usize
    }

    pub(crate) fn slot_value(&self, index: usize) -> usize {
        unsafe { std::ptr::read_volatile(&self.slots[index]) }
    }

    // bias 0: every table pointer and r_offset above is already absolute
    pub(crate) fn image(&self, name: &str) -> ModuleImage {
        unsafe { ModuleImage::from_dynamic(name, 0, self.dynamic.as_ptr()) }
            .expect("synthetic dynamic section parses")
            .expect("synthetic module has tables")
    }
}

fn rela(offset: u64, info: u64) -> ElfRela {
    ElfRela {
        r_offset: offset,
        r_info: info,
        r_addend: 0,
    }
}

fn dyn_entry(tag: i64, value: u64) -> ElfDyn {
    ElfDyn {
        d_tag: tag,
        d_un: value,
    }
}
