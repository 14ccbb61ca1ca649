// Software breakpoints: the trap instruction is patched through the command channel and
// removed again on the first hit.
use crate::arch;
use crate::error::{Error, Result};
use crate::log;
use crate::sync::MutexPoisonRecover;
use crate::thread::SpiedThread;
use crate::tracer::TracerCore;
use nix::unistd::Pid;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

pub type BreakPointHandler = Arc<dyn Fn(&BreakPoint, &Arc<SpiedThread>) + Send + Sync>;

pub struct BreakPoint {
    id: u32,
    name: String,
    addr: usize,
    tracer: Arc<TracerCore>,
    // original contents of the patched word while installed
    saved_word: Mutex<Option<usize>>,
    hits: AtomicU64,
    handler: Mutex<Option<BreakPointHandler>>,
}

impl BreakPoint {
    pub(crate) fn new(id: u32, name: String, addr: usize, tracer: Arc<TracerCore>) -> Self {
        Self {
            id,
            name,
            addr,
            tracer,
            saved_word: Mutex::new(None),
            hits: AtomicU64::new(0),
            handler: Mutex::new(None),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn addr(&self) -> usize {
        self.addr
    }

    pub fn hit_count(&self) -> u64 {
        self.hits.load(Ordering::Acquire)
    }

    pub fn is_installed(&self) -> bool {
        self.saved_word.lock_or_poison().is_some()
    }

    pub fn set_handler(&self, handler: impl Fn(&BreakPoint, &Arc<SpiedThread>) + Send + Sync + 'static) {
        *self.handler.lock_or_poison() = Some(Arc::new(handler));
    }

    // Installs the trap instruction; a no-op when already installed
    pub fn set(self: &Arc<Self>) -> Result<()> {
        let breakpoint = Arc::clone(self);
        self.tracer.exec(move || {
            let mut saved_word = breakpoint.saved_word.lock_or_poison();
            if saved_word.is_some() {
                return Ok(());
            }
            let (word_addr, offset) = arch::patch_window(breakpoint.addr);
            let original = breakpoint.tracer.read_word(word_addr)?;
            let patched = arch::insert_breakpoint(original, offset).ok_or_else(|| Error::Memory {
                addr: breakpoint.addr,
                reason: "breakpoint instruction straddles a word".into(),
            })?;
            breakpoint.tracer.write_word(word_addr, patched)?;
            *saved_word = Some(original);
            log::debug(format_args!(
                "breakpoint {} set at 0x{:x}",
                breakpoint.name, breakpoint.addr
            ));
            Ok(())
        })
    }

    pub fn unset(self: &Arc<Self>) -> Result<()> {
        let breakpoint = Arc::clone(self);
        self.tracer.exec(move || {
            let mut saved_word = breakpoint.saved_word.lock_or_poison();
            breakpoint.restore(&mut saved_word)
        })
    }

    // command thread only
    fn restore(&self, saved_word: &mut Option<usize>) -> Result<()> {
        let Some(original) = *saved_word else {
            return Ok(());
        };
        let (word_addr, offset) = arch::patch_window(self.addr);
        let current = self.tracer.read_word(word_addr)?;
        let restored = arch::restore_breakpoint(current, original, offset);
        self.tracer.write_word(word_addr, restored)?;
        *saved_word = None;
        Ok(())
    }

    // `tid` trapped on this breakpoint: put the original instruction back and rewind its pc
    pub(crate) fn on_hit(self: &Arc<Self>, tid: Pid) -> Result<()> {
        let breakpoint = Arc::clone(self);
        self.tracer.exec(move || {
            let mut saved_word = breakpoint.saved_word.lock_or_poison();
            breakpoint.restore(&mut saved_word)?;
            arch::write_pc(tid, breakpoint.addr).map_err(Error::ptrace("setregs", tid))
        })?;
        self.hits.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn invoke_handler(&self, thread: &Arc<SpiedThread>) {
        let handler = self.handler.lock_or_poison().clone();
        match handler {
            Some(handler) => handler(self, thread),
            None => log::info(format_args!(
                "thread {} hit breakpoint {} at 0x{:x}",
                thread.tid(),
                self.name,
                self.addr
            )),
        }
    }
}

// Breakpoints of one program, with the program-owned id counter
pub(crate) struct BreakPointTable {
    entries: Mutex<Vec<Arc<BreakPoint>>>,
    next_id: AtomicU32,
}

impl BreakPointTable {
    pub(crate) fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            next_id: AtomicU32::new(1),
        }
    }

    pub(crate) fn next_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::Relaxed)
    }

    pub(crate) fn insert(&self, breakpoint: Arc<BreakPoint>) {
        self.entries.lock_or_poison().push(breakpoint);
    }

    pub(crate) fn remove(&self, id: u32) -> Option<Arc<BreakPoint>> {
        let mut entries = self.entries.lock_or_poison();
        let index = entries.iter().position(|bp| bp.id == id)?;
        Some(entries.remove(index))
    }

    pub(crate) fn at(&self, addr: usize) -> Option<Arc<BreakPoint>> {
        self.entries
            .lock_or_poison()
            .iter()
            .find(|bp| bp.addr == addr)
            .cloned()
    }

    pub(crate) fn installed_at(&self, addr: usize) -> Option<Arc<BreakPoint>> {
        self.entries
            .lock_or_poison()
            .iter()
            .find(|bp| bp.addr == addr && bp.is_installed())
            .cloned()
    }
}
