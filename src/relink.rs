// Call redirection by relocation patching: GLOB_DAT and JUMP_SLOT slots of every module that
// depends on a library are pointed at that library's copy inside the spied namespace.
use crate::config::RelinkPolicy;
use crate::elf::{BindingKind, ModuleImage};
use crate::error::{Error, Result};
use crate::loader::{self, LibraryHandle};
use crate::log;
use crate::tracer::TracerCore;
use std::sync::Arc;

#[cfg(test)]
mod tests;

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct PatchedBinding {
    pub module: String,
    pub symbol: String,
    pub slot: usize,
    pub previous: usize,
    pub target: usize,
    pub kind: BindingKind,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum SkipReason {
    // the library defines the symbol but its namespace copy does not
    Unresolved,
    UnsupportedKind(u32),
    WriteFailed(String),
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct SkippedBinding {
    pub module: String,
    pub symbol: String,
    pub slot: usize,
    pub reason: SkipReason,
}

#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct RelinkReport {
    pub library: String,
    pub modules_scanned: usize,
    // modules declaring the library in DT_NEEDED
    pub dependents: Vec<String>,
    pub patched: Vec<PatchedBinding>,
    pub skipped: Vec<SkippedBinding>,
}

impl RelinkReport {
    pub fn is_complete(&self) -> bool {
        self.skipped.is_empty()
    }

    pub fn patched_symbol<'a>(&'a self, symbol: &'a str) -> impl Iterator<Item = &'a PatchedBinding> {
        self.patched.iter().filter(move |binding| binding.symbol == symbol)
    }
}

// Where symbol addresses come from
pub(crate) trait SymbolSource {
    fn resolve(&self, symbol: &str) -> Option<usize>;
}

// Writes one slot and returns its previous value
pub(crate) trait SlotWriter {
    fn write_slot(&self, addr: usize, value: usize) -> Result<usize>;
}

// Definitions of one loaded library, as dlsym finds them
pub(crate) struct LibrarySymbols(pub(crate) LibraryHandle);

impl SymbolSource for LibrarySymbols {
    fn resolve(&self, symbol: &str) -> Option<usize> {
        loader::definition(self.0, symbol)
    }
}

// Slot writes go through the command channel, never directly
pub(crate) struct CommandSlotWriter(pub(crate) Arc<TracerCore>);

impl SlotWriter for CommandSlotWriter {
    fn write_slot(&self, addr: usize, value: usize) -> Result<usize> {
        self.0.write_word(addr, value)
    }
}

pub(crate) struct RelinkTargets<'a> {
    // the implementation loaded in the spied namespace
    pub(crate) alternate: &'a dyn SymbolSource,
    // the tester's own copy, used to tell the library's bindings from those of other
    // dependencies; without it every unresolved binding is reported
    pub(crate) original: Option<&'a dyn SymbolSource>,
}

pub(crate) fn relink_modules(
    library: &str,
    modules: &[ModuleImage],
    targets: &RelinkTargets,
    writer: &dyn SlotWriter,
    policy: RelinkPolicy,
) -> Result<RelinkReport> {
    let mut report = RelinkReport {
        library: library.to_string(),
        modules_scanned: modules.len(),
        ..RelinkReport::default()
    };

    for module in modules.iter().filter(|module| module.needs(library)) {
        report.dependents.push(module.name().to_string());
        relink_module(module, targets, writer, &mut report);
    }

    log::info(format_args!(
        "relink {library}: {} modules depend on it, {} bindings patched, {} skipped",
        report.dependents.len(),
        report.patched.len(),
        report.skipped.len()
    ));
    if policy == RelinkPolicy::Strict && !report.is_complete() {
        return Err(Error::RelinkIncomplete {
            library: library.to_string(),
            skipped: report.skipped.len(),
        });
    }
    Ok(report)
}

fn relink_module(
    module: &ModuleImage,
    targets: &RelinkTargets,
    writer: &dyn SlotWriter,
    report: &mut RelinkReport,
) {
    for relocation in module.relocations() {
        let Some(symbol) = module.symbol_name(relocation.sym) else {
            continue;
        };
        let slot = module.slot_address(&relocation);
        let skip = |reason| SkippedBinding {
            module: module.name().to_string(),
            symbol: symbol.to_string(),
            slot,
            reason,
        };

        let Some(target) = targets.alternate.resolve(symbol) else {
            let owned = targets
                .original
                .is_none_or(|original| original.resolve(symbol).is_some());
            if owned {
                log::debug(format_args!("{symbol} not found in the alternate library"));
                report.skipped.push(skip(SkipReason::Unresolved));
            }
            continue;
        };
        let Some(kind) = BindingKind::from_type(relocation.r_type) else {
            log::warn(format_args!(
                "unexpected relocation type {} for {symbol} in {}",
                relocation.r_type,
                module.name()
            ));
            report.skipped.push(skip(SkipReason::UnsupportedKind(relocation.r_type)));
            continue;
        };

        match writer.write_slot(slot, target) {
            Ok(previous) => {
                log::debug(format_args!(
                    "{}: {symbol} slot 0x{slot:x} 0x{previous:x} -> 0x{target:x}",
                    module.name()
                ));
                report.patched.push(PatchedBinding {
                    module: module.name().to_string(),
                    symbol: symbol.to_string(),
                    slot,
                    previous,
                    target,
                    kind,
                });
            }
            Err(err) => {
                log::warn(format_args!("{symbol}: write to slot 0x{slot:x} failed: {err}"));
                report.skipped.push(skip(SkipReason::WriteFailed(err.to_string())));
            }
        }
    }
}
