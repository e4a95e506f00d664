//! Instruction-pointer symbolization: a TTL'd cache plus the pluggable
//! resolver seam.
//!
//! The cache is keyed by raw ip value and bounded only by the number of
//! distinct ips the pipeline encounters; entries expire lazily on access
//! after the configured TTL, and consumers under memory pressure can
//! [`clear`](SymbolCache::clear) it wholesale.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

/// Default entry lifetime.
pub const DEFAULT_SYMBOL_TTL: Duration = Duration::from_secs(3600);

/// One cached resolution. Carries the resolver's locals so repeated
/// faults at the same ip keep them without re-resolving.
#[derive(Debug, Clone)]
pub struct SymbolEntry {
    pub symbol: String,
    pub file: String,
    pub line: u32,
    pub locals: Vec<String>,
    inserted_at: Instant,
}

/// Resolution result handed back by a [`SymbolResolver`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResolvedSymbol {
    pub symbol: String,
    pub file: String,
    pub line: u32,
    /// Source-local variable names, when the resolver can recover them.
    pub locals: Vec<String>,
}

/// Maps an instruction pointer to source information.
///
/// Implementations must be callable from the enrichment thread; a slow
/// resolver delays enrichment but never the fault path.
pub trait SymbolResolver: Send + Sync {
    /// `None` when the ip cannot be resolved at all; the pipeline then
    /// falls back to `("??", "", 0)` without caching.
    fn resolve(&self, ip: u64) -> Option<ResolvedSymbol>;
}

/// In-process resolver over the `backtrace` crate's symbol tables.
///
/// Only resolves ips inside the current process image (the usual case:
/// the faulting instruction belongs to the host binary or its loaded
/// libraries).
#[derive(Debug, Default)]
pub struct BacktraceResolver;

impl SymbolResolver for BacktraceResolver {
    fn resolve(&self, ip: u64) -> Option<ResolvedSymbol> {
        let mut out = None;
        backtrace::resolve(ip as *mut std::ffi::c_void, |symbol| {
            if out.is_some() {
                return;
            }
            let name = symbol.name().map(|n| n.to_string());
            let file = symbol
                .filename()
                .map(|p| p.display().to_string())
                .unwrap_or_default();
            let line = symbol.lineno().unwrap_or(0);
            if let Some(name) = name {
                out = Some(ResolvedSymbol {
                    symbol: name,
                    file,
                    line,
                    locals: Vec::new(),
                });
            }
        });
        out
    }
}

/// TTL'd ip → symbol map behind a single mutex.
pub struct SymbolCache {
    entries: Mutex<HashMap<u64, SymbolEntry>>,
    ttl: Duration,
}

impl SymbolCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(HashMap::new()),
            ttl,
        }
    }

    /// Fresh entry for `ip`, evicting it first if it has expired.
    pub fn get(&self, ip: u64) -> Option<SymbolEntry> {
        let mut entries = self.entries.lock().unwrap();
        match entries.get(&ip) {
            Some(entry) if entry.inserted_at.elapsed() <= self.ttl => Some(entry.clone()),
            Some(_) => {
                entries.remove(&ip);
                None
            }
            None => None,
        }
    }

    /// Insert or replace with a fresh timestamp.
    pub fn set(&self, ip: u64, symbol: String, file: String, line: u32, locals: Vec<String>) {
        let mut entries = self.entries.lock().unwrap();
        entries.insert(
            ip,
            SymbolEntry {
                symbol,
                file,
                line,
                locals,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn clear(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SymbolCache {
    fn default() -> Self {
        Self::new(DEFAULT_SYMBOL_TTL)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hit_and_miss() {
        let cache = SymbolCache::default();
        cache.set(0x1234, "f".into(), "f.rs".into(), 42, Vec::new());

        let entry = cache.get(0x1234).unwrap();
        assert_eq!(entry.symbol, "f");
        assert_eq!(entry.file, "f.rs");
        assert_eq!(entry.line, 42);
        assert!(cache.get(0x9999).is_none());
    }

    #[test]
    fn locals_round_trip_through_cache() {
        let cache = SymbolCache::default();
        cache.set(
            0x1234,
            "f".into(),
            "f.rs".into(),
            42,
            vec!["counter".to_string(), "tmp".to_string()],
        );
        assert_eq!(cache.get(0x1234).unwrap().locals, ["counter", "tmp"]);
    }

    #[test]
    fn expired_entries_evict_on_access() {
        let cache = SymbolCache::new(Duration::ZERO);
        cache.set(0x1, "f".into(), String::new(), 0, Vec::new());
        std::thread::sleep(Duration::from_millis(2));
        assert!(cache.get(0x1).is_none());
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn set_replaces_and_refreshes() {
        let cache = SymbolCache::default();
        cache.set(0x1, "old".into(), String::new(), 1, Vec::new());
        cache.set(0x1, "new".into(), String::new(), 2, Vec::new());
        assert_eq!(cache.get(0x1).unwrap().symbol, "new");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn clear_empties() {
        let cache = SymbolCache::default();
        cache.set(0x1, "f".into(), String::new(), 0, Vec::new());
        cache.set(0x2, "g".into(), String::new(), 0, Vec::new());
        cache.clear();
        assert!(cache.is_empty());
    }

    #[test]
    fn backtrace_resolver_resolves_own_function() {
        // Take the address of a function in this image; resolution may
        // legitimately fail without debug info, but must not panic.
        let ip = backtrace_resolver_resolves_own_function as usize as u64;
        let _ = BacktraceResolver.resolve(ip);
    }
}
