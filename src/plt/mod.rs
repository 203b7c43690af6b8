// This module implements the lazy symbol table: a growable, thread-safe collection of
// deferred bindings that compiled code reaches through per-entry call stubs. Each entry
// carries an atomic tri-state (unresolved, resolving, resolved) and the address its stub
// jumps through. Resolution has a lock-free fast path for already-resolved entries and a
// slow path that serializes on the table's resolve mutex, double-checks the state and asks
// the table's SymbolLookup for the address. Failure resets the entry so a later call can
// try again. Entries are individually reference counted so growing the table never moves
// an entry a stub points at, and every entry holds a weak reference back to its table so
// the resolver trampoline can find the owner without consulting global state. One table
// at a time is also published as the process-wide active table.

//! Lazy symbol table (PLT).

pub mod imports;
mod stats;

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, AtomicU64, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Weak};

use hashbrown::HashMap;
use once_cell::sync::Lazy;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

use crate::core::{SymbolAddr, SymbolLookup};

pub use imports::{register_undefined, undefined_symbols};
pub use stats::{PltStats, TopEntry, TOP_ENTRY_LIMIT};

/// Capacity used when zero is requested.
pub const DEFAULT_CAPACITY: usize = 256;

/// Errors from the lazy symbol table.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PltError {
    #[error("symbol name must not be empty")]
    EmptyName,

    #[error("failed to resolve symbol '{name}'")]
    Unresolved { name: String },

    #[error("entry '{name}' belongs to a different table")]
    ForeignEntry { name: String },

    #[error("entry index {index} out of range (table has {len} entries)")]
    IndexOutOfRange { index: usize, len: usize },

    #[error("the table owning this entry has been dropped")]
    TableGone,

    #[error("could not read object file: {0}")]
    Object(String),
}

/// Resolution state of one entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum EntryState {
    Unresolved = 0,
    Resolving = 1,
    Resolved = 2,
}

impl EntryState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            1 => EntryState::Resolving,
            2 => EntryState::Resolved,
            _ => EntryState::Unresolved,
        }
    }
}

/// One deferred binding.
///
/// `jump_target` must stay the first field: call stubs jump through the word
/// at the entry's address.
#[repr(C)]
pub struct PltEntry {
    jump_target: AtomicUsize,
    resolved_address: AtomicUsize,
    state: AtomicU8,
    call_count: AtomicU32,
    index: usize,
    name: Box<str>,
    owner: Weak<PltShared>,
}

impl PltEntry {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn state(&self) -> EntryState {
        EntryState::from_raw(self.state.load(Ordering::Acquire))
    }

    pub fn is_resolved(&self) -> bool {
        self.state() == EntryState::Resolved
    }

    pub fn call_count(&self) -> u32 {
        self.call_count.load(Ordering::Relaxed)
    }

    pub fn resolved_address(&self) -> Option<SymbolAddr> {
        if self.is_resolved() {
            SymbolAddr::new(self.resolved_address.load(Ordering::Acquire))
        } else {
            None
        }
    }

    /// Address a call stub currently jumps to.
    pub fn jump_target(&self) -> usize {
        self.jump_target.load(Ordering::Acquire)
    }

    /// The entry's address, as loaded into `r11` by its call stub.
    pub fn as_ptr(&self) -> *const PltEntry {
        self
    }

    /// The table this entry belongs to, if it is still alive.
    pub fn owner(&self) -> Option<PltTable> {
        self.owner.upgrade().map(|shared| PltTable { shared })
    }

    /// Resolve through the owning table.
    pub fn resolve(&self) -> Result<SymbolAddr, PltError> {
        self.owner().ok_or(PltError::TableGone)?.resolve(self)
    }

    fn count_call(&self) {
        self.call_count.fetch_add(1, Ordering::Relaxed);
    }
}

impl fmt::Debug for PltEntry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PltEntry")
            .field("index", &self.index)
            .field("name", &self.name)
            .field("state", &self.state())
            .field("call_count", &self.call_count())
            .finish()
    }
}

#[derive(Clone, Copy)]
enum ResolveKind {
    Lazy,
    Eager,
}

struct EntryStore {
    entries: Vec<Arc<PltEntry>>,
    by_name: HashMap<Box<str>, usize>,
    capacity: usize,
}

struct PltShared {
    store: RwLock<EntryStore>,
    resolve_lock: Mutex<()>,
    lookup: Arc<dyn SymbolLookup>,
    lazy: bool,
    trampoline: usize,
    /// Symbols ever added. Survives teardown.
    total_symbols: AtomicU64,
    lazy_resolved: AtomicU64,
    eager_resolved: AtomicU64,
    failures: AtomicU64,
}

static ACTIVE: Lazy<Mutex<Weak<PltShared>>> = Lazy::new(|| Mutex::new(Weak::new()));

/// Handle to a lazy symbol table. Clones share the table.
#[derive(Clone)]
pub struct PltTable {
    shared: Arc<PltShared>,
}

impl PltTable {
    /// Create a table without publishing it as the active one.
    pub fn new(lookup: Arc<dyn SymbolLookup>, lazy: bool, initial_capacity: usize) -> Self {
        let capacity = if initial_capacity == 0 {
            DEFAULT_CAPACITY
        } else {
            initial_capacity
        };
        Self {
            shared: Arc::new(PltShared {
                store: RwLock::new(EntryStore {
                    entries: Vec::with_capacity(capacity),
                    by_name: HashMap::with_capacity(capacity),
                    capacity,
                }),
                resolve_lock: Mutex::new(()),
                lookup,
                lazy,
                trampoline: resolver_trampoline_address(),
                total_symbols: AtomicU64::new(0),
                lazy_resolved: AtomicU64::new(0),
                eager_resolved: AtomicU64::new(0),
                failures: AtomicU64::new(0),
            }),
        }
    }

    /// Create a table and make it the process-wide active table.
    pub fn init(lookup: Arc<dyn SymbolLookup>, lazy: bool, initial_capacity: usize) -> Self {
        let table = Self::new(lookup, lazy, initial_capacity);
        table.activate();
        log::debug!(
            "Initialized {} symbol table with capacity {}",
            if lazy { "lazy" } else { "eager" },
            table.capacity()
        );
        table
    }

    /// Publish this table as the active one.
    pub fn activate(&self) {
        *ACTIVE.lock() = Arc::downgrade(&self.shared);
    }

    /// The process-wide active table, if any.
    pub fn active() -> Option<PltTable> {
        ACTIVE.lock().upgrade().map(|shared| PltTable { shared })
    }

    pub fn is_active(&self) -> bool {
        std::ptr::eq(ACTIVE.lock().as_ptr(), Arc::as_ptr(&self.shared))
    }

    pub fn is_lazy(&self) -> bool {
        self.shared.lazy
    }

    pub fn len(&self) -> usize {
        self.shared.store.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn capacity(&self) -> usize {
        self.shared.store.read().capacity
    }

    /// Address new entries jump to before resolution.
    pub fn trampoline_address(&self) -> usize {
        self.shared.trampoline
    }

    /// Register `name`, returning its index. Re-registration returns the
    /// existing index.
    pub fn add_symbol(&self, name: &str) -> Result<usize, PltError> {
        if name.is_empty() {
            return Err(PltError::EmptyName);
        }

        let mut store = self.shared.store.write();
        if let Some(&index) = store.by_name.get(name) {
            return Ok(index);
        }

        let index = store.entries.len();
        if index == store.capacity {
            let grown = store.capacity * 2;
            store.entries.reserve_exact(grown - index);
            store.capacity = grown;
            log::debug!("Grew symbol table to {} entries", grown);
        }

        store.entries.push(Arc::new(PltEntry {
            jump_target: AtomicUsize::new(self.shared.trampoline),
            resolved_address: AtomicUsize::new(0),
            state: AtomicU8::new(EntryState::Unresolved as u8),
            call_count: AtomicU32::new(0),
            index,
            name: name.into(),
            owner: Arc::downgrade(&self.shared),
        }));
        store.by_name.insert(name.into(), index);
        self.shared.total_symbols.fetch_add(1, Ordering::Relaxed);
        log::trace!("Added lazy symbol '{}' at index {}", name, index);
        Ok(index)
    }

    pub fn get_by_index(&self, index: usize) -> Option<Arc<PltEntry>> {
        self.shared.store.read().entries.get(index).cloned()
    }

    pub fn find_by_name(&self, name: &str) -> Option<Arc<PltEntry>> {
        let store = self.shared.store.read();
        let index = *store.by_name.get(name)?;
        store.entries.get(index).cloned()
    }

    /// Snapshot of all entries in index order.
    pub fn entries(&self) -> Vec<Arc<PltEntry>> {
        self.shared.store.read().entries.clone()
    }

    /// Resolve `entry` and count the call.
    pub fn resolve(&self, entry: &PltEntry) -> Result<SymbolAddr, PltError> {
        if !std::ptr::eq(entry.owner.as_ptr(), Arc::as_ptr(&self.shared)) {
            return Err(PltError::ForeignEntry {
                name: entry.name.to_string(),
            });
        }

        if let Some(addr) = entry.resolved_address() {
            entry.count_call();
            return Ok(addr);
        }

        let _guard = self.shared.resolve_lock.lock();
        let result = match entry.resolved_address() {
            Some(addr) => Ok(addr),
            None => self.resolve_locked(entry, ResolveKind::Lazy),
        };
        entry.count_call();
        result
    }

    pub fn resolve_index(&self, index: usize) -> Result<SymbolAddr, PltError> {
        let entry = self.get_by_index(index).ok_or_else(|| PltError::IndexOutOfRange {
            index,
            len: self.len(),
        })?;
        self.resolve(&entry)
    }

    /// Eagerly resolve every unresolved entry. Returns how many entries are
    /// resolved afterwards.
    pub fn resolve_all(&self) -> usize {
        let entries = self.entries();
        let mut resolved = 0;
        for entry in &entries {
            if entry.is_resolved() {
                resolved += 1;
                continue;
            }
            let _guard = self.shared.resolve_lock.lock();
            if entry.is_resolved() || self.resolve_locked(entry, ResolveKind::Eager).is_ok() {
                resolved += 1;
            }
        }
        log::debug!("Eagerly resolved {}/{} symbols", resolved, entries.len());
        resolved
    }

    // Caller holds the resolve lock.
    fn resolve_locked(&self, entry: &PltEntry, kind: ResolveKind) -> Result<SymbolAddr, PltError> {
        entry
            .state
            .store(EntryState::Resolving as u8, Ordering::Release);

        match self.shared.lookup.lookup_symbol(&entry.name) {
            Some(addr) => {
                entry.resolved_address.store(addr.get(), Ordering::Release);
                entry.jump_target.store(addr.get(), Ordering::Release);
                entry
                    .state
                    .store(EntryState::Resolved as u8, Ordering::Release);
                let counter = match kind {
                    ResolveKind::Lazy => &self.shared.lazy_resolved,
                    ResolveKind::Eager => &self.shared.eager_resolved,
                };
                counter.fetch_add(1, Ordering::Relaxed);
                log::trace!("Resolved '{}' to {}", entry.name, addr);
                Ok(addr)
            }
            None => {
                entry
                    .state
                    .store(EntryState::Unresolved as u8, Ordering::Release);
                self.shared.failures.fetch_add(1, Ordering::Relaxed);
                log::warn!("Failed to resolve symbol '{}'", entry.name);
                Err(PltError::Unresolved {
                    name: entry.name.to_string(),
                })
            }
        }
    }

    pub fn stats(&self) -> PltStats {
        let entries = self.entries();
        PltStats {
            total: self.shared.total_symbols.load(Ordering::Relaxed),
            lazy_resolved: self.shared.lazy_resolved.load(Ordering::Relaxed),
            eager_resolved: self.shared.eager_resolved.load(Ordering::Relaxed),
            failures: self.shared.failures.load(Ordering::Relaxed),
            lazy_mode: self.shared.lazy,
            top: stats::top_entries(&entries),
        }
    }

    /// Zero the resolution counters and every call count.
    pub fn reset_stats(&self) {
        self.shared.lazy_resolved.store(0, Ordering::Relaxed);
        self.shared.eager_resolved.store(0, Ordering::Relaxed);
        self.shared.failures.store(0, Ordering::Relaxed);
        for entry in self.shared.store.read().entries.iter() {
            entry.call_count.store(0, Ordering::Relaxed);
        }
    }

    /// Release all entries; stop being the active table.
    pub fn teardown(&self) {
        {
            let mut store = self.shared.store.write();
            store.entries.clear();
            store.by_name.clear();
        }
        let mut active = ACTIVE.lock();
        if std::ptr::eq(active.as_ptr(), Arc::as_ptr(&self.shared)) {
            *active = Weak::new();
        }
        log::debug!("Tore down symbol table");
    }
}

impl fmt::Debug for PltTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PltTable")
            .field("len", &self.len())
            .field("capacity", &self.capacity())
            .field("lazy", &self.shared.lazy)
            .finish()
    }
}

/// Resolve function called by the resolver trampoline.
///
/// Returns the resolved address, or 0 when resolution fails.
///
/// # Safety
///
/// `entry` must be null or point to a live [`PltEntry`].
pub unsafe extern "C" fn plt_resolve_entry(entry: *const PltEntry) -> usize {
    if entry.is_null() {
        return 0;
    }
    let entry = &*entry;
    panic::catch_unwind(AssertUnwindSafe(|| entry.resolve()))
        .ok()
        .and_then(Result::ok)
        .map_or(0, SymbolAddr::get)
}

#[cfg(all(unix, target_arch = "x86_64"))]
static TRAMPOLINE: Lazy<Option<crate::x64::ResolverTrampoline>> = Lazy::new(|| {
    match crate::x64::ResolverTrampoline::new(plt_resolve_entry as usize) {
        Ok(trampoline) => Some(trampoline),
        Err(e) => {
            log::warn!("Could not emit resolver trampoline: {}", e);
            None
        }
    }
});

#[cfg(all(unix, target_arch = "x86_64"))]
fn machine_trampoline() -> Option<usize> {
    TRAMPOLINE.as_ref().map(|t| t.address())
}

#[cfg(not(all(unix, target_arch = "x86_64")))]
fn machine_trampoline() -> Option<usize> {
    None
}

/// Whether call stubs can be emitted on this host.
pub fn machine_stubs_available() -> bool {
    machine_trampoline().is_some()
}

/// Initial jump target of every entry.
pub fn resolver_trampoline_address() -> usize {
    machine_trampoline().unwrap_or(plt_resolve_entry as usize)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LookupFn;
    use proptest::prelude::*;
    use std::sync::atomic::AtomicUsize;

    fn table_of(names: &'static [(&'static str, usize)]) -> PltTable {
        let lookup = LookupFn(move |name: &str| {
            names
                .iter()
                .find(|(n, _)| *n == name)
                .and_then(|(_, addr)| SymbolAddr::new(*addr))
        });
        PltTable::new(Arc::new(lookup), true, 4)
    }

    #[test]
    fn test_entry_layout() {
        assert_eq!(std::mem::offset_of!(PltEntry, jump_target), 0);
    }

    #[test]
    fn test_add_symbol_is_idempotent() {
        let table = table_of(&[]);
        let a = table.add_symbol("puts").unwrap();
        let b = table.add_symbol("printf").unwrap();
        assert_eq!(table.add_symbol("puts").unwrap(), a);
        assert_ne!(a, b);
        assert_eq!(table.len(), 2);
        assert_eq!(table.add_symbol(""), Err(PltError::EmptyName));
    }

    #[test]
    fn test_new_entries_point_at_trampoline() {
        let table = table_of(&[]);
        let idx = table.add_symbol("puts").unwrap();
        let entry = table.get_by_index(idx).unwrap();
        assert_eq!(entry.state(), EntryState::Unresolved);
        assert_eq!(entry.jump_target(), table.trampoline_address());
        assert_eq!(entry.call_count(), 0);
    }

    #[test]
    fn test_resolution_updates_entry() {
        let table = table_of(&[("puts", 0x1000)]);
        let idx = table.add_symbol("puts").unwrap();

        let addr = table.resolve_index(idx).unwrap();
        assert_eq!(addr.get(), 0x1000);

        let entry = table.find_by_name("puts").unwrap();
        assert!(entry.is_resolved());
        assert_eq!(entry.jump_target(), 0x1000);
        assert_eq!(entry.call_count(), 1);

        entry.resolve().unwrap();
        assert_eq!(entry.call_count(), 2);
        assert_eq!(table.stats().lazy_resolved, 1);
    }

    #[test]
    fn test_failed_resolution_is_retryable() {
        let table = table_of(&[]);
        let idx = table.add_symbol("missing").unwrap();

        let err = table.resolve_index(idx).unwrap_err();
        assert_eq!(
            err,
            PltError::Unresolved {
                name: "missing".to_string()
            }
        );
        let entry = table.get_by_index(idx).unwrap();
        assert_eq!(entry.state(), EntryState::Unresolved);
        assert_eq!(entry.call_count(), 1);

        assert!(table.resolve(&entry).is_err());
        assert_eq!(table.stats().failures, 2);
    }

    #[test]
    fn test_growth_doubles_and_keeps_entries() {
        let table = table_of(&[]);
        let first = table.get_by_index(table.add_symbol("s0").unwrap()).unwrap();
        for i in 1..9 {
            table.add_symbol(&format!("s{i}")).unwrap();
        }
        assert_eq!(table.capacity(), 16);
        let again = table.get_by_index(0).unwrap();
        assert!(Arc::ptr_eq(&first, &again));
        assert_eq!(table.find_by_name("s8").unwrap().index(), 8);
    }

    #[test]
    fn test_zero_capacity_uses_default() {
        let table = PltTable::new(Arc::new(LookupFn(|_: &str| None)), true, 0);
        assert_eq!(table.capacity(), DEFAULT_CAPACITY);
    }

    #[test]
    fn test_foreign_entry_rejected() {
        let a = table_of(&[("x", 1)]);
        let b = table_of(&[("x", 1)]);
        let entry = a.get_by_index(a.add_symbol("x").unwrap()).unwrap();
        assert!(matches!(b.resolve(&entry), Err(PltError::ForeignEntry { .. })));
    }

    #[test]
    fn test_index_out_of_range() {
        let table = table_of(&[]);
        assert_eq!(
            table.resolve_index(3),
            Err(PltError::IndexOutOfRange { index: 3, len: 0 })
        );
    }

    #[test]
    fn test_resolve_all_counts_resolved() {
        let table = table_of(&[("a", 0x10), ("b", 0x20)]);
        for name in ["a", "b", "c"] {
            table.add_symbol(name).unwrap();
        }
        table.resolve_index(0).unwrap();

        assert_eq!(table.resolve_all(), 2);
        let stats = table.stats();
        assert_eq!(stats.lazy_resolved, 1);
        assert_eq!(stats.eager_resolved, 1);
        assert_eq!(stats.failures, 1);
        // eager resolution does not count as a call
        assert_eq!(table.find_by_name("b").unwrap().call_count(), 0);
    }

    #[test]
    fn test_concurrent_resolution_looks_up_once() {
        let lookups = Arc::new(AtomicUsize::new(0));
        let counter = lookups.clone();
        let lookup = LookupFn(move |_: &str| {
            counter.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(std::time::Duration::from_millis(5));
            SymbolAddr::new(0x2000)
        });
        let table = PltTable::new(Arc::new(lookup), true, 0);
        let idx = table.add_symbol("shared").unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let table = table.clone();
                std::thread::spawn(move || table.resolve_index(idx).unwrap().get())
            })
            .collect();
        for handle in handles {
            assert_eq!(handle.join().unwrap(), 0x2000);
        }

        assert_eq!(lookups.load(Ordering::SeqCst), 1);
        assert_eq!(table.get_by_index(idx).unwrap().call_count(), 8);
    }

    #[test]
    fn test_reset_stats() {
        let table = table_of(&[("a", 0x10)]);
        table.add_symbol("a").unwrap();
        table.add_symbol("b").unwrap();
        table.resolve_index(0).unwrap();
        let _ = table.resolve_index(1);

        table.reset_stats();
        let stats = table.stats();
        assert_eq!(
            (stats.lazy_resolved, stats.eager_resolved, stats.failures),
            (0, 0, 0)
        );
        assert!(stats.top.is_empty());
        assert_eq!(stats.total, 2);
        assert!(table.get_by_index(0).unwrap().is_resolved());
    }

    #[test]
    fn test_total_survives_teardown() {
        let table = table_of(&[]);
        table.add_symbol("a").unwrap();
        table.add_symbol("b").unwrap();
        table.add_symbol("a").unwrap();
        table.teardown();

        assert!(table.is_empty());
        assert_eq!(table.stats().total, 2);
        table.add_symbol("c").unwrap();
        assert_eq!(table.stats().total, 3);
    }

    #[test]
    fn test_extern_resolver() {
        let table = table_of(&[("a", 0x10)]);
        let entry = table.get_by_index(table.add_symbol("a").unwrap()).unwrap();
        let missing = table.get_by_index(table.add_symbol("zz").unwrap()).unwrap();

        unsafe {
            assert_eq!(plt_resolve_entry(entry.as_ptr()), 0x10);
            assert_eq!(plt_resolve_entry(missing.as_ptr()), 0);
            assert_eq!(plt_resolve_entry(std::ptr::null()), 0);
        }
    }

    #[test]
    fn test_dropped_table() {
        let table = table_of(&[("a", 0x10)]);
        let entry = table.get_by_index(table.add_symbol("a").unwrap()).unwrap();
        drop(table);
        assert_eq!(entry.resolve(), Err(PltError::TableGone));
    }

    proptest! {
        #[test]
        fn prop_indices_match_first_registration(names in prop::collection::vec("[a-e]{1,2}", 1..64)) {
            let table = PltTable::new(Arc::new(LookupFn(|_: &str| None)), true, 1);
            let mut first_seen: Vec<String> = Vec::new();
            for name in &names {
                let idx = table.add_symbol(name).unwrap();
                match first_seen.iter().position(|n| n == name) {
                    Some(pos) => prop_assert_eq!(idx, pos),
                    None => {
                        prop_assert_eq!(idx, first_seen.len());
                        first_seen.push(name.clone());
                    }
                }
            }
            prop_assert_eq!(table.len(), first_seen.len());
            prop_assert!(table.capacity() >= table.len());
            prop_assert!(table.capacity().is_power_of_two());
        }
    }
}
