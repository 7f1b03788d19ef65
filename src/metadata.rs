//! The in-memory metadata index (§4.2). Every operation here requires
//! the instance mutex to already be held by the caller; this type has no
//! locking of its own.

use std::collections::HashMap;
use std::time::SystemTime;

#[derive(Debug, Clone, Copy)]
pub struct Entry {
    pub date: SystemTime,
    pub size: u64,
}

#[derive(Debug, Default)]
pub struct Metadata {
    entries: HashMap<String, Entry>,
    byte_count: u64,
}

impl Metadata {
    pub fn byte_count(&self) -> u64 {
        self.byte_count
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn get(&self, key: &str) -> Option<&Entry> {
        self.entries.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Creates the entry if absent, adjusts `byte_count` by `new_size -
    /// old_size` otherwise.
    pub fn insert_or_replace(&mut self, key: impl Into<String>, date: SystemTime, size: u64) {
        let key = key.into();
        match self.entries.insert(key, Entry { date, size }) {
            Some(old) => {
                self.byte_count = self.byte_count - old.size + size;
            }
            None => {
                self.byte_count += size;
            }
        }
    }

    /// Refreshes only the date of an existing entry, leaving size (and
    /// byte_count) untouched. Used after the post-read mtime bump (§4.4
    /// step 6).
    pub fn touch(&mut self, key: &str, date: SystemTime) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.date = date;
        }
    }

    /// Removes the entry if present, subtracting its size from
    /// `byte_count`. Returns the removed entry.
    pub fn remove(&mut self, key: &str) -> Option<Entry> {
        let removed = self.entries.remove(key);
        if let Some(entry) = &removed {
            self.byte_count -= entry.size;
        }
        removed
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.byte_count = 0;
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.entries.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &Entry)> {
        self.entries.iter().map(|(k, v)| (k.as_str(), v))
    }

    /// Largest entries first. Ties broken by key, for determinism.
    pub fn keys_sorted_by_size_desc(&self) -> Vec<String> {
        let mut keys: Vec<(String, Entry)> =
            self.entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
        keys.sort_by(|a, b| b.1.size.cmp(&a.1.size).then_with(|| a.0.cmp(&b.0)));
        keys.into_iter().map(|(k, _)| k).collect()
    }

    /// Oldest entries first. Ties broken by key, for determinism.
    pub fn keys_sorted_by_date_asc(&self) -> Vec<String> {
        let mut keys: Vec<(String, Entry)> =
            self.entries.iter().map(|(k, v)| (k.clone(), *v)).collect();
        keys.sort_by(|a, b| a.1.date.cmp(&b.1.date).then_with(|| a.0.cmp(&b.0)));
        keys.into_iter().map(|(k, _)| k).collect()
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use std::time::Duration;

    fn at(secs: u64) -> SystemTime {
        SystemTime::UNIX_EPOCH + Duration::from_secs(secs)
    }

    #[test]
    fn byte_count_tracks_insert_replace_remove() {
        let mut m = Metadata::default();
        m.insert_or_replace("a", at(1), 10);
        assert_eq!(m.byte_count(), 10);

        m.insert_or_replace("a", at(2), 4);
        assert_eq!(m.byte_count(), 4);

        m.insert_or_replace("b", at(3), 6);
        assert_eq!(m.byte_count(), 10);

        m.remove("a");
        assert_eq!(m.byte_count(), 6);
        assert!(!m.contains("a"));
    }

    #[test]
    fn sorted_by_size_desc_breaks_ties_by_key() {
        let mut m = Metadata::default();
        m.insert_or_replace("b", at(1), 5);
        m.insert_or_replace("a", at(1), 5);
        m.insert_or_replace("c", at(1), 9);
        assert_eq!(m.keys_sorted_by_size_desc(), vec!["c", "a", "b"]);
    }

    #[test]
    fn sorted_by_date_asc_is_oldest_first() {
        let mut m = Metadata::default();
        m.insert_or_replace("new", at(10), 1);
        m.insert_or_replace("old", at(1), 1);
        m.insert_or_replace("mid", at(5), 1);
        assert_eq!(m.keys_sorted_by_date_asc(), vec!["old", "mid", "new"]);
    }

    #[test]
    fn clear_resets_everything() {
        let mut m = Metadata::default();
        m.insert_or_replace("a", at(1), 10);
        m.clear();
        assert_eq!(m.byte_count(), 0);
        assert!(m.is_empty());
    }
}
