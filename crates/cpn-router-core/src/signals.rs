//! External load signals
//!
//! Two persisted tables (instance capacity, ingress arrival rate), both a
//! JSON object of name -> requests/s rewritten wholesale by their
//! producers, and a CPU utilization snapshot published by the container
//! probe.

use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::debug;

use crate::error::{PolicyError, PolicyResult};

/// name -> value
pub type SignalTable = BTreeMap<String, f64>;

/// Source of the capacity and arrival tables.
///
/// `Ok(None)` means the table does not exist yet.
pub trait SignalSource: Send + Sync {
    /// Instance name -> sustainable requests/s
    fn capacities(&self) -> PolicyResult<Option<SignalTable>>;

    /// Ingress name -> arrival requests/s
    fn arrivals(&self) -> PolicyResult<Option<SignalTable>>;
}

/// Values of `table` in `names` order.
///
/// `None` if the table does not hold exactly those names.
pub fn ordered_values(table: &SignalTable, names: &[String]) -> Option<Vec<f64>> {
    if table.len() != names.len() {
        return None;
    }
    names.iter().map(|name| table.get(name).copied()).collect()
}

// ========== JSON files ==========

/// Tables re-read from disk on every call
#[derive(Debug, Clone, Default)]
pub struct JsonFileSignals {
    capacity_path: Option<PathBuf>,
    arrival_path: Option<PathBuf>,
}

impl JsonFileSignals {
    pub fn new(capacity_path: Option<PathBuf>, arrival_path: Option<PathBuf>) -> Self {
        Self {
            capacity_path,
            arrival_path,
        }
    }

    fn read_table(path: Option<&Path>) -> PolicyResult<Option<SignalTable>> {
        let Some(path) = path else {
            return Ok(None);
        };
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "Signal table not present");
                return Ok(None);
            }
            Err(source) => {
                return Err(PolicyError::SignalIo {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        Ok(Some(serde_json::from_str(&text)?))
    }
}

impl SignalSource for JsonFileSignals {
    fn capacities(&self) -> PolicyResult<Option<SignalTable>> {
        Self::read_table(self.capacity_path.as_deref())
    }

    fn arrivals(&self) -> PolicyResult<Option<SignalTable>> {
        Self::read_table(self.arrival_path.as_deref())
    }
}

// ========== In-memory ==========

/// Tables set programmatically
#[derive(Debug, Default)]
pub struct StaticSignals {
    capacities: RwLock<Option<SignalTable>>,
    arrivals: RwLock<Option<SignalTable>>,
}

impl StaticSignals {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_capacities(&self, table: SignalTable) {
        *self.capacities.write() = Some(table);
    }

    pub fn set_arrivals(&self, table: SignalTable) {
        *self.arrivals.write() = Some(table);
    }
}

impl SignalSource for StaticSignals {
    fn capacities(&self) -> PolicyResult<Option<SignalTable>> {
        Ok(self.capacities.read().clone())
    }

    fn arrivals(&self) -> PolicyResult<Option<SignalTable>> {
        Ok(self.arrivals.read().clone())
    }
}

// ========== CPU utilization ==========

/// Instance name -> CPU percentage
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UtilizationSnapshot {
    values: BTreeMap<String, f64>,
}

impl UtilizationSnapshot {
    pub fn new(values: BTreeMap<String, f64>) -> Self {
        Self { values }
    }

    pub fn get(&self, name: &str) -> Option<f64> {
        self.values.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }
}

/// Parse `name: 12.34%` lines, keeping names with `prefix` (stripped)
pub fn parse_container_stats(output: &str, prefix: &str) -> UtilizationSnapshot {
    let values = output
        .lines()
        .filter_map(|line| {
            let (name, value) = line.trim().split_once(':')?;
            let name = name.trim().strip_prefix(prefix)?;
            let percent = value.trim().trim_end_matches('%').parse::<f64>().ok()?;
            Some((name.to_string(), percent))
        })
        .collect();
    UtilizationSnapshot { values }
}

/// Latest published utilization snapshot
#[derive(Debug, Default)]
pub struct UtilizationFeed {
    latest: RwLock<Option<Arc<UtilizationSnapshot>>>,
}

impl UtilizationFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn publish(&self, snapshot: UtilizationSnapshot) {
        *self.latest.write() = Some(Arc::new(snapshot));
    }

    pub fn latest(&self) -> Option<Arc<UtilizationSnapshot>> {
        self.latest.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn names(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_ordered_values() {
        let table: SignalTable = [("b".to_string(), 2.0), ("a".to_string(), 1.0)].into_iter().collect();
        assert_eq!(ordered_values(&table, &names(&["b", "a"])), Some(vec![2.0, 1.0]));
        assert_eq!(ordered_values(&table, &names(&["a"])), None);
        assert_eq!(ordered_values(&table, &names(&["a", "c"])), None);
    }

    #[test]
    fn test_json_file_tables() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"primeApp1": 120.5, "primeApp2": 80}}"#).unwrap();
        let signals = JsonFileSignals::new(
            Some(file.path().to_path_buf()),
            Some(PathBuf::from("/nonexistent/cpn_node_rps.json")),
        );

        let capacities = signals.capacities().unwrap().unwrap();
        assert_eq!(capacities.get("primeApp1"), Some(&120.5));
        assert_eq!(capacities.get("primeApp2"), Some(&80.0));
        assert!(signals.arrivals().unwrap().is_none());
    }

    #[test]
    fn test_malformed_table() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, "[1, 2, 3]").unwrap();
        let signals = JsonFileSignals::new(Some(file.path().to_path_buf()), None);
        assert!(matches!(signals.capacities(), Err(PolicyError::SignalParse(_))));
    }

    #[test]
    fn test_parse_container_stats() {
        let output = "mn.primeApp1: 12.50%\nmn.primeApp2: 3%\nmn.cpNode1: 1.00%\nother: 9%\nmn.bad: n/a\n";
        let snapshot = parse_container_stats(output, "mn.");
        assert_eq!(snapshot.get("primeApp1"), Some(12.5));
        assert_eq!(snapshot.get("primeApp2"), Some(3.0));
        assert_eq!(snapshot.get("cpNode1"), Some(1.0));
        assert!(snapshot.get("other").is_none());
        assert_eq!(snapshot.len(), 3);
    }

    #[test]
    fn test_feed_publish() {
        let feed = UtilizationFeed::new();
        assert!(feed.latest().is_none());
        feed.publish(parse_container_stats("mn.a: 1%", "mn."));
        assert_eq!(feed.latest().unwrap().get("a"), Some(1.0));
    }
}
