//! Symbol table statistics.

use std::fmt;
use std::sync::Arc;

use super::PltEntry;

/// How many entries the statistics report lists.
pub const TOP_ENTRY_LIMIT: usize = 10;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TopEntry {
    pub name: String,
    pub calls: u32,
}

/// Point-in-time counters of a symbol table.
#[derive(Debug, Clone, PartialEq)]
pub struct PltStats {
    pub total: u64,
    pub lazy_resolved: u64,
    pub eager_resolved: u64,
    pub failures: u64,
    pub lazy_mode: bool,
    /// Most-called entries, highest first. Never-called entries are left out.
    pub top: Vec<TopEntry>,
}

impl PltStats {
    /// Percentage of registered symbols resolved so far.
    pub fn resolution_rate(&self) -> Option<f64> {
        (self.total > 0).then(|| {
            (self.lazy_resolved + self.eager_resolved) as f64 / self.total as f64 * 100.0
        })
    }
}

// Stable: equal counts keep index order.
pub(super) fn top_entries(entries: &[Arc<PltEntry>]) -> Vec<TopEntry> {
    let mut called: Vec<TopEntry> = entries
        .iter()
        .filter(|e| e.call_count() > 0)
        .map(|e| TopEntry {
            name: e.name().to_string(),
            calls: e.call_count(),
        })
        .collect();
    called.sort_by(|a, b| b.calls.cmp(&a.calls));
    called.truncate(TOP_ENTRY_LIMIT);
    called
}

impl fmt::Display for PltStats {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== PLT Statistics ===")?;
        writeln!(f, "Total symbols:        {}", self.total)?;
        writeln!(f, "Lazy resolved:        {}", self.lazy_resolved)?;
        writeln!(f, "Eager resolved:       {}", self.eager_resolved)?;
        writeln!(f, "Resolution failures:  {}", self.failures)?;
        writeln!(
            f,
            "Resolution mode:      {}",
            if self.lazy_mode { "lazy" } else { "eager" }
        )?;
        if let Some(rate) = self.resolution_rate() {
            writeln!(f, "Resolution rate:      {rate:.1}%")?;
        }
        writeln!(f)?;
        writeln!(f, "Top {TOP_ENTRY_LIMIT} Most Called Symbols:")?;
        for (i, entry) in self.top.iter().enumerate() {
            writeln!(f, "  {:2}. {:<30}  {:6} calls", i + 1, entry.name, entry.calls)?;
        }
        write!(f, "======================")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::LookupFn;
    use crate::core::SymbolAddr;
    use crate::plt::PltTable;

    fn called_table(calls: &[(&str, u32)]) -> PltTable {
        let table = PltTable::new(Arc::new(LookupFn(|_: &str| SymbolAddr::new(0x10))), true, 0);
        for (name, n) in calls {
            let idx = table.add_symbol(name).unwrap();
            for _ in 0..*n {
                table.resolve_index(idx).unwrap();
            }
        }
        table
    }

    #[test]
    fn test_top_entries_order_and_ties() {
        let table = called_table(&[("a", 2), ("b", 5), ("c", 0), ("d", 2), ("e", 7)]);
        let names: Vec<_> = table.stats().top.into_iter().map(|t| t.name).collect();
        assert_eq!(names, vec!["e", "b", "a", "d"]);
    }

    #[test]
    fn test_top_entries_limited() {
        let calls: Vec<(String, u32)> = (0..15).map(|i| (format!("f{i}"), i + 1)).collect();
        let refs: Vec<(&str, u32)> = calls.iter().map(|(n, c)| (n.as_str(), *c)).collect();
        let stats = called_table(&refs).stats();
        assert_eq!(stats.top.len(), TOP_ENTRY_LIMIT);
        assert_eq!(stats.top[0].name, "f14");
        assert_eq!(stats.top[0].calls, 15);
    }

    #[test]
    fn test_display_layout() {
        let stats = called_table(&[("puts", 3), ("never", 0)]).stats();
        let text = stats.to_string();
        assert!(text.starts_with("=== PLT Statistics ==="));
        assert!(text.contains("Total symbols:        2"));
        assert!(text.contains("Resolution mode:      lazy"));
        assert!(text.contains("Resolution rate:      50.0%"));
        assert!(text.contains("   1. puts"));
        assert!(!text.contains("never"));
    }

    #[test]
    fn test_rate_absent_when_empty() {
        let stats = called_table(&[]).stats();
        assert_eq!(stats.resolution_rate(), None);
        assert!(!stats.to_string().contains("Resolution rate"));
    }
}
