//! Best-effort persisted preferences.
//!
//! One opaque string per name (e.g. `"theme"`), stored as a small file
//! under the session's data directory. Non-transactional by design:
//! storage being unavailable is not an error the caller sees.

use std::fs;
use std::path::{Path, PathBuf};

/// Stores named string preferences on disk.
#[derive(Debug, Clone)]
pub struct PreferenceStore {
    dir: PathBuf,
}

impl PreferenceStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Read a preference; absent or unreadable values read as `""`.
    pub fn read(&self, name: &str) -> String {
        fs::read_to_string(self.path(name)).unwrap_or_default()
    }

    /// Persist a preference. Failures are logged and swallowed.
    pub fn write(&self, name: &str, value: &str) {
        if let Err(e) = fs::create_dir_all(&self.dir) {
            log::warn!("preference dir unavailable: {e}");
            return;
        }
        if let Err(e) = fs::write(self.path(name), value) {
            log::warn!("failed to persist preference {name}: {e}");
        }
    }

    fn path(&self, name: &str) -> PathBuf {
        // Preference names map to file names; keep them from escaping the dir.
        let safe: String = name
            .chars()
            .map(|c| if c.is_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.pref"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_absent_preference_reads_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::new(dir.path());
        assert_eq!(store.read("theme"), "");
    }

    #[test]
    fn test_write_then_read() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::new(dir.path());
        store.write("theme", "dark");
        assert_eq!(store.read("theme"), "dark");

        store.write("theme", "light");
        assert_eq!(store.read("theme"), "light");
    }

    #[test]
    fn test_names_are_independent() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::new(dir.path());
        store.write("theme", "dark");
        store.write("deck", "fibonacci");
        assert_eq!(store.read("theme"), "dark");
        assert_eq!(store.read("deck"), "fibonacci");
    }

    #[test]
    fn test_hostile_name_stays_in_dir() {
        let dir = tempfile::tempdir().unwrap();
        let store = PreferenceStore::new(dir.path());
        store.write("../escape", "nope");
        assert_eq!(store.read("../escape"), "nope");
        // Nothing was written outside the store directory.
        assert!(!dir.path().parent().unwrap().join("escape.pref").exists());
    }

    #[test]
    fn test_unwritable_dir_is_silent() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("not-a-dir");
        std::fs::write(&blocker, "file in the way").unwrap();
        let store = PreferenceStore::new(&blocker);
        store.write("theme", "dark"); // must not panic
        assert_eq!(store.read("theme"), "");
    }
}
