//! Multi-key store operations backing the job-file commands.
//!
//! One job line can touch several keys at once. Every distinct bucket the
//! line needs is locked up front, in ascending index order over a
//! deduplicated list, before any pair is touched; that fixed global order is
//! the crate's deadlock rule for bucket locks. Keys are processed in sorted
//! order for READ and DELETE, so the emitted records are deterministic.

use std::io::Write;

use tracing::warn;

use super::{hash, subscription, validate_key, validate_value, KeyEntry, KvStore};
use crate::Result;

/// sentinel recorded for a READ miss
const READ_MISS: &str = "KVSERROR";

/// sentinel recorded for a DELETE miss
const DELETE_MISS: &str = "KVSMISSING";

/// deduplicated, ascending bucket indices for the hashable keys of a batch
fn bucket_set<'a, I>(keys: I) -> Vec<usize>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut indices: Vec<usize> = keys.into_iter().filter_map(hash).collect();
    indices.sort_unstable();
    indices.dedup();
    indices
}

impl KvStore {
    /// Applies one WRITE command: every pair is inserted or overwritten
    /// under write locks covering all target buckets. Pairs that fail
    /// validation are reported and skipped; the rest of the batch still
    /// applies. Overwrites fan `Changed` events out while the locks are
    /// held.
    pub fn write_batch(&self, pairs: &[(String, String)]) -> Result<()> {
        let mut valid: Vec<&(String, String)> = Vec::with_capacity(pairs.len());
        for pair in pairs {
            match validate_key(&pair.0).and_then(|_| validate_value(&pair.1)) {
                Ok(()) => valid.push(pair),
                Err(e) => warn!(key = %pair.0, error = %e, "failed to write keypair"),
            }
        }
        let indices = bucket_set(valid.iter().map(|p| p.0.as_str()));
        let mut guards = self.write_buckets(&indices)?;

        for (key, value) in valid {
            // hash() succeeded during validation
            let index = hash(key).unwrap();
            let bucket = guards.get_mut(&index).unwrap();
            match bucket.get_mut(key) {
                Some(entry) => {
                    entry.value = value.clone();
                    subscription::fan_out_changed(entry, key);
                }
                None => {
                    bucket.insert(key.clone(), KeyEntry::new(value.clone()));
                }
            }
        }
        Ok(())
    }

    /// Applies one READ command and returns the encoded result line:
    /// `[(k,v)(k,KVSERROR)…]\n`, keys in sorted order, duplicates kept.
    pub fn read_batch(&self, keys: &[String]) -> Result<String> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        let indices = bucket_set(sorted.iter().map(|k| k.as_str()));
        let guards = self.read_buckets(&indices)?;

        let mut out = String::from("[");
        for key in sorted {
            let value = hash(key)
                .and_then(|index| guards.get(&index))
                .and_then(|bucket| bucket.get(key.as_str()))
                .map(|entry| entry.value.as_str());
            match value {
                Some(value) => out.push_str(&format!("({},{})", key, value)),
                None => out.push_str(&format!("({},{})", key, READ_MISS)),
            }
        }
        out.push_str("]\n");
        Ok(out)
    }

    /// Applies one DELETE command and returns the encoded miss line:
    /// `[(k,KVSMISSING)…]\n` listing only the keys that did not exist, or an
    /// empty string when every delete succeeded. Deletions fan `Deleted`
    /// events out and strip the subscription backlinks while the write
    /// locks are held.
    pub fn delete_batch(&self, keys: &[String]) -> Result<String> {
        let mut sorted: Vec<&String> = keys.iter().collect();
        sorted.sort();
        let indices = bucket_set(sorted.iter().map(|k| k.as_str()));
        let mut guards = self.write_buckets(&indices)?;

        let mut misses = String::new();
        for key in sorted {
            let removed = hash(key)
                .and_then(|index| guards.get_mut(&index))
                .and_then(|bucket| bucket.remove(key.as_str()));
            match removed {
                Some(mut entry) => {
                    subscription::fan_out_deleted(&mut entry, key);
                    subscription::strip_backlinks(&entry, key);
                }
                None => misses.push_str(&format!("({},{})", key, DELETE_MISS)),
            }
        }
        if misses.is_empty() {
            Ok(String::new())
        } else {
            Ok(format!("[{}]\n", misses))
        }
    }

    /// Applies one SHOW command: writes every stored pair as `(k, v)\n`
    /// from a point-in-time snapshot taken under all bucket read locks in
    /// ascending order.
    pub fn show<W: Write>(&self, out: &mut W) -> Result<()> {
        let entries = self.snapshot()?;
        out.write_all(render_entries(&entries).as_bytes())?;
        Ok(())
    }
}

/// Renders snapshot entries in the SHOW format, one `(k, v)\n` line per
/// pair. Backup files use the same encoding.
pub fn render_entries(entries: &[(String, String)]) -> String {
    let mut out = String::new();
    for (key, value) in entries {
        out.push_str(&format!("({}, {})\n", key, value));
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    fn pairs(raw: &[(&str, &str)]) -> Vec<(String, String)> {
        raw.iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    fn keys(raw: &[&str]) -> Vec<String> {
        raw.iter().map(|k| k.to_string()).collect()
    }

    #[test]
    fn write_batch_inserts_and_overwrites() {
        let store = KvStore::new();
        store
            .write_batch(&pairs(&[("apple", "red"), ("banana", "yellow")]))
            .unwrap();
        store.write_batch(&pairs(&[("apple", "green")])).unwrap();
        assert_eq!(store.get("apple").unwrap(), Some("green".to_string()));
        assert_eq!(store.get("banana").unwrap(), Some("yellow".to_string()));
    }

    #[test]
    fn write_batch_skips_invalid_pairs_but_applies_the_rest() {
        let store = KvStore::new();
        store
            .write_batch(&pairs(&[("_bad", "x"), ("apple", "red")]))
            .unwrap();
        assert_eq!(store.get("apple").unwrap(), Some("red".to_string()));
        assert_eq!(store.len().unwrap(), 1);
    }

    #[test]
    fn duplicate_keys_in_one_write_last_value_wins() {
        let store = KvStore::new();
        store
            .write_batch(&pairs(&[("apple", "first"), ("apple", "second")]))
            .unwrap();
        assert_eq!(store.get("apple").unwrap(), Some("second".to_string()));
    }

    #[test]
    fn read_batch_reports_hits_and_misses_in_sorted_order() {
        let store = KvStore::new();
        store.write_batch(&pairs(&[("banana", "1"), ("apple", "2")])).unwrap();
        let line = store
            .read_batch(&keys(&["banana", "missing", "apple"]))
            .unwrap();
        assert_eq!(line, "[(apple,2)(banana,1)(missing,KVSERROR)]\n");
    }

    #[test]
    fn delete_batch_reports_only_misses() {
        let store = KvStore::new();
        store.write_batch(&pairs(&[("apple", "1"), ("pear", "2")])).unwrap();

        let all_hit = store.delete_batch(&keys(&["apple"])).unwrap();
        assert_eq!(all_hit, "");

        let some_miss = store.delete_batch(&keys(&["pear", "apple", "kiwi"])).unwrap();
        assert_eq!(some_miss, "[(apple,KVSMISSING)(kiwi,KVSMISSING)]\n");
        assert_eq!(store.len().unwrap(), 0);
    }

    #[test]
    fn show_uses_the_spaced_pair_format() {
        let store = KvStore::new();
        store.write_batch(&pairs(&[("banana", "1"), ("apple", "2")])).unwrap();
        let mut out = Vec::new();
        store.show(&mut out).unwrap();
        assert_eq!(String::from_utf8(out).unwrap(), "(apple, 2)\n(banana, 1)\n");
    }

    #[test]
    fn overlapping_batches_do_not_deadlock() {
        let store = Arc::new(KvStore::new());
        let mut handles = Vec::new();
        for t in 0..4 {
            let store = Arc::clone(&store);
            handles.push(thread::spawn(move || {
                for i in 0..200 {
                    let forward = pairs(&[("alpha", "1"), ("mike", "2"), ("zulu", "3")]);
                    let backward = pairs(&[("zulu", "4"), ("mike", "5"), ("alpha", "6")]);
                    let batch = if (t + i) % 2 == 0 { forward } else { backward };
                    store.write_batch(&batch).unwrap();
                    store
                        .read_batch(&keys(&["zulu", "alpha", "mike"]))
                        .unwrap();
                }
            }));
        }
        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(store.len().unwrap(), 3);
    }
}
