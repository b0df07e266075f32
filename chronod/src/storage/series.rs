//! Series names: canonicalization and the name <-> id registry.
//!
//! A series name is `<metric> <key>=<value> ...`. The canonical form has
//! exactly one space between tokens and tags sorted by a byte comparison
//! in which `=` ranks below every other byte, so `k=v` sorts before
//! `kk=v`. Two names with the same canonical form denote the same series.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Result, StorageError};
use crate::types::{SeriesId, SERIES_ID_BASE};

/// Maximum canonical name length in bytes.
pub const MAX_SERIES_NAME: usize = 4096;
/// Maximum number of tags per series.
pub const MAX_TAGS: usize = 32;

/// Compare two tag tokens byte-wise with `=` below every other byte.
fn tag_order(a: &&str, b: &&str) -> std::cmp::Ordering {
    let rank = |byte: u8| -> u16 {
        if byte == b'=' {
            0
        } else {
            u16::from(byte) + 1
        }
    };
    let mut lhs = a.bytes().map(rank);
    let mut rhs = b.bytes().map(rank);
    loop {
        match (lhs.next(), rhs.next()) {
            (None, None) => return std::cmp::Ordering::Equal,
            (None, Some(_)) => return std::cmp::Ordering::Less,
            (Some(_), None) => return std::cmp::Ordering::Greater,
            (Some(x), Some(y)) => match x.cmp(&y) {
                std::cmp::Ordering::Equal => continue,
                other => return other,
            },
        }
    }
}

/// Rewrite a raw series name into canonical form.
pub fn to_normal_form(raw: &str) -> Result<String> {
    let mut tokens = raw.split_ascii_whitespace();
    let metric = tokens
        .next()
        .ok_or_else(|| StorageError::bad_data("empty series name"))?;

    let mut tags: Vec<&str> = Vec::new();
    for token in tokens {
        let (key, value) = token
            .split_once('=')
            .ok_or_else(|| StorageError::bad_data(format!("malformed tag '{token}'")))?;
        if key.is_empty() {
            return Err(StorageError::bad_data(format!("missing tag key in '{token}'")));
        }
        if value.is_empty() {
            return Err(StorageError::bad_data(format!(
                "missing tag value in '{token}'"
            )));
        }
        tags.push(token);
        if tags.len() > MAX_TAGS {
            return Err(StorageError::bad_data("too many tags"));
        }
    }
    if tags.is_empty() {
        return Err(StorageError::bad_data("at least one tag is required"));
    }
    tags.sort_by(tag_order);

    let length =
        metric.len() + tags.iter().map(|t| t.len() + 1).sum::<usize>();
    if length > MAX_SERIES_NAME {
        return Err(StorageError::bad_data("series name too long"));
    }

    let mut out = String::with_capacity(length);
    out.push_str(metric);
    for tag in tags {
        out.push(' ');
        out.push_str(tag);
    }
    Ok(out)
}

/// Split a canonical name into its metric and tag block.
pub fn split_canonical(canonical: &str) -> (&str, &str) {
    match canonical.split_once(' ') {
        Some((metric, tags)) => (metric, tags),
        None => (canonical, ""),
    }
}

/// Tuple persisted to (and restored from) the catalog.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SeriesRecord {
    pub id: SeriesId,
    pub metric: String,
    pub tags: String,
}

impl SeriesRecord {
    pub fn canonical(&self) -> String {
        format!("{} {}", self.metric, self.tags)
    }
}

struct RegistryInner {
    table: HashMap<Arc<str>, SeriesId>,
    names: HashMap<SeriesId, Arc<str>>,
    next_id: SeriesId,
    /// Ids created since the last persistence pull.
    pending: Vec<SeriesRecord>,
}

/// The authoritative name <-> id map. One mutex guards both directions;
/// sessions keep their own unsynchronized caches in front of it.
pub struct SeriesRegistry {
    inner: Mutex<RegistryInner>,
}

impl SeriesRegistry {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(RegistryInner {
                table: HashMap::new(),
                names: HashMap::new(),
                next_id: SERIES_ID_BASE,
                pending: Vec::new(),
            }),
        }
    }

    /// Canonicalize and resolve a raw name, assigning a fresh id on first
    /// sight.
    pub fn resolve(&self, raw: &str) -> Result<SeriesId> {
        let canonical = to_normal_form(raw)?;
        Ok(self.resolve_canonical(&canonical))
    }

    fn resolve_canonical(&self, canonical: &str) -> SeriesId {
        let mut inner = self.inner.lock().unwrap();
        if let Some(&id) = inner.table.get(canonical) {
            return id;
        }
        let id = inner.next_id;
        inner.next_id += 1;
        let name: Arc<str> = Arc::from(canonical);
        inner.table.insert(name.clone(), id);
        inner.names.insert(id, name);
        let (metric, tags) = split_canonical(canonical);
        inner.pending.push(SeriesRecord {
            id,
            metric: metric.to_string(),
            tags: tags.to_string(),
        });
        id
    }

    pub fn name_of(&self, id: SeriesId) -> Option<Arc<str>> {
        self.inner.lock().unwrap().names.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drain the names created since the last call, for catalog
    /// persistence.
    pub fn pull_new_names(&self) -> Vec<SeriesRecord> {
        std::mem::take(&mut self.inner.lock().unwrap().pending)
    }

    /// Rebuild both map directions from catalog tuples (any order). The
    /// id counter continues one past the largest restored id.
    pub fn restore(&self, records: Vec<SeriesRecord>) {
        let mut inner = self.inner.lock().unwrap();
        for record in records {
            let name: Arc<str> = Arc::from(record.canonical().as_str());
            inner.table.insert(name.clone(), record.id);
            inner.names.insert(record.id, name);
            inner.next_id = inner.next_id.max(record.id + 1);
        }
    }
}

impl Default for SeriesRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-connection resolution cache. Touched only by its session task, so
/// no synchronization; misses fall through to the shared registry and
/// install the result locally.
pub struct SeriesSession {
    registry: Arc<SeriesRegistry>,
    cache: HashMap<String, SeriesId>,
}

impl SeriesSession {
    pub fn new(registry: Arc<SeriesRegistry>) -> Self {
        Self {
            registry,
            cache: HashMap::new(),
        }
    }

    pub fn resolve(&mut self, raw: &str) -> Result<SeriesId> {
        if let Some(&id) = self.cache.get(raw) {
            return Ok(id);
        }
        let id = self.registry.resolve(raw)?;
        self.cache.insert(raw.to_string(), id);
        Ok(id)
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonicalization_sorts_and_normalizes_whitespace() {
        let canonical = to_normal_form("  cpu   host=a\tregion=eu ").unwrap();
        assert_eq!(canonical, "cpu host=a region=eu");
        let canonical = to_normal_form("cpu region=eu host=a").unwrap();
        assert_eq!(canonical, "cpu host=a region=eu");
    }

    #[test]
    fn canonicalization_is_idempotent() {
        let inputs = [
            "sensor host=a",
            "m b=2 a=1 c=3",
            "disk  mount=/var  host=db1",
        ];
        for raw in inputs {
            let once = to_normal_form(raw).unwrap();
            let twice = to_normal_form(&once).unwrap();
            assert_eq!(once, twice);
        }
    }

    #[test]
    fn tag_order_is_permutation_invariant() {
        let perms = [
            "m a=1 b=2 c=3",
            "m a=1 c=3 b=2",
            "m b=2 a=1 c=3",
            "m b=2 c=3 a=1",
            "m c=3 a=1 b=2",
            "m c=3 b=2 a=1",
        ];
        let expect = to_normal_form(perms[0]).unwrap();
        for p in &perms[1..] {
            assert_eq!(to_normal_form(p).unwrap(), expect);
        }
    }

    #[test]
    fn equals_sorts_below_other_bytes() {
        // "k=v" must sort before "kk=v" even though '=' > 'k' is false
        // only under the custom rank.
        let canonical = to_normal_form("m kk=v k=v").unwrap();
        assert_eq!(canonical, "m k=v kk=v");
        // And before a shorter key with a digit suffix.
        let canonical = to_normal_form("m k0=x k=y").unwrap();
        assert_eq!(canonical, "m k=y k0=x");
    }

    #[test]
    fn malformed_names_rejected() {
        assert!(to_normal_form("").is_err());
        assert!(to_normal_form("metric").is_err()); // no tags
        assert!(to_normal_form("metric host").is_err()); // '='-free tag
        assert!(to_normal_form("metric =a").is_err()); // missing key
        assert!(to_normal_form("metric host=").is_err()); // missing value
    }

    #[test]
    fn limits_enforced() {
        let mut name = String::from("m");
        for i in 0..33 {
            name.push_str(&format!(" t{i:02}=v"));
        }
        assert!(to_normal_form(&name).is_err());

        let long = format!("m tag={}", "x".repeat(MAX_SERIES_NAME));
        assert!(to_normal_form(&long).is_err());
    }

    #[test]
    fn registry_assigns_dense_ids_from_base() {
        let registry = SeriesRegistry::new();
        let a = registry.resolve("sensor host=a").unwrap();
        let b = registry.resolve("sensor host=b").unwrap();
        assert_eq!(a, SERIES_ID_BASE);
        assert_eq!(b, SERIES_ID_BASE + 1);
        // Same canonical form, different spelling: same id.
        let a2 = registry.resolve("  sensor   host=a").unwrap();
        assert_eq!(a2, a);
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn registry_is_bijective() {
        let registry = SeriesRegistry::new();
        let names = ["cpu host=a", "cpu host=b", "mem host=a region=eu"];
        for raw in names {
            let id = registry.resolve(raw).unwrap();
            let stored = registry.name_of(id).unwrap();
            assert_eq!(registry.resolve(&stored).unwrap(), id);
        }
    }

    #[test]
    fn pending_names_drain_once() {
        let registry = SeriesRegistry::new();
        registry.resolve("cpu host=a").unwrap();
        registry.resolve("cpu host=b").unwrap();
        let pulled = registry.pull_new_names();
        assert_eq!(pulled.len(), 2);
        assert_eq!(pulled[0].metric, "cpu");
        assert_eq!(pulled[0].tags, "host=a");
        assert!(registry.pull_new_names().is_empty());
        // Known names do not re-enter the pending list.
        registry.resolve("cpu host=a").unwrap();
        assert!(registry.pull_new_names().is_empty());
    }

    #[test]
    fn restore_continues_after_largest_id() {
        let registry = SeriesRegistry::new();
        registry.restore(vec![
            SeriesRecord {
                id: 2000,
                metric: "cpu".into(),
                tags: "host=b".into(),
            },
            SeriesRecord {
                id: 1024,
                metric: "cpu".into(),
                tags: "host=a".into(),
            },
        ]);
        assert_eq!(registry.resolve("cpu host=a").unwrap(), 1024);
        assert_eq!(registry.resolve("cpu host=b").unwrap(), 2000);
        let fresh = registry.resolve("cpu host=c").unwrap();
        assert_eq!(fresh, 2001);
    }

    #[test]
    fn session_cache_falls_back_then_installs() {
        let registry = Arc::new(SeriesRegistry::new());
        let mut session = SeriesSession::new(registry.clone());
        let id = session.resolve("cpu host=a").unwrap();
        assert_eq!(session.cached_len(), 1);
        // Second lookup is served locally; the shared map is unchanged.
        assert_eq!(session.resolve("cpu host=a").unwrap(), id);
        assert_eq!(registry.len(), 1);

        let mut other = SeriesSession::new(registry.clone());
        assert_eq!(other.resolve("cpu  host=a").unwrap(), id);
    }
}
