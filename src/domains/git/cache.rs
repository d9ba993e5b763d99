use dashmap::DashMap;
use std::path::Path;
use std::time::{Duration, Instant};

pub const DEFAULT_QUERY_TTL: Duration = Duration::from_secs(10);

struct CacheEntry {
    value: String,
    inserted: Instant,
}

/// Short-TTL cache for read-only git queries, keyed by operation + repo +
/// arguments. It exists to absorb repeated subprocess spawns within a single
/// logical operation (one merge flow issues the same branch lookups several
/// times); it is scoped to one CLI invocation and never shared across
/// processes. Mutating operations invalidate every entry for their repo.
pub struct QueryCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl QueryCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn key(op: &str, repo: &Path, args: &[&str]) -> String {
        format!("{op}:{}:{}", repo.display(), args.join("\u{1f}"))
    }

    pub fn get(&self, key: &str) -> Option<String> {
        let entry = self.entries.get(key)?;
        if entry.inserted.elapsed() > self.ttl {
            drop(entry);
            self.entries.remove(key);
            return None;
        }
        Some(entry.value.clone())
    }

    pub fn put(&self, key: String, value: String) {
        self.entries.insert(
            key,
            CacheEntry {
                value,
                inserted: Instant::now(),
            },
        );
    }

    pub fn invalidate_repo(&self, repo: &Path) {
        let marker = format!(":{}:", repo.display());
        self.entries.retain(|key, _| !key.contains(&marker));
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

impl Default for QueryCache {
    fn default() -> Self {
        Self::new(DEFAULT_QUERY_TTL)
    }
}
