//! A content-addressed shadow copy of every file the handler saves, so a
//! damaged or deleted `.fhi` can be detected and put back.
//!
//! ```text
//! <root>/
//! ├── objects/ab/cdef…          content, named by SHA-256
//! ├── journal/2026-01-05.journal ts|op|key|before|after|message
//! └── manifest.json              file key → path + current hash
//! ```

use crate::core::safe_file::{
    corrupted_copy_path, move_into_place, remove_temp, sha256_hex, temp_path, SaveReceipt,
};
use crate::utils::error::{EtmaError, Result};
use chrono::{DateTime, Local, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

pub const STORE_DIR_NAME: &str = ".etma-integrity";
const OBJECTS_DIR: &str = "objects";
const JOURNAL_DIR: &str = "journal";
const MANIFEST_FILE: &str = "manifest.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileRecord {
    pub path: PathBuf,
    pub hash: String,
    pub modified: DateTime<Utc>,
}

/// A save in flight. Hand it back to [`IntegrityStore::commit`] or
/// [`IntegrityStore::rollback`]; either consumes it.
#[derive(Debug)]
#[must_use = "a transaction must be committed or rolled back"]
pub struct Transaction {
    path: PathBuf,
    before_hash: Option<String>,
    after_hash: String,
    started_at: DateTime<Utc>,
}

impl Transaction {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn before_hash(&self) -> Option<&str> {
        self.before_hash.as_deref()
    }

    pub fn after_hash(&self) -> &str {
        &self.after_hash
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IntegrityStatus {
    Valid { hash: String },
    Corrupted { expected: String, actual: String },
    Missing { expected: String },
    Untracked,
    Unreadable { message: String },
}

impl IntegrityStatus {
    pub fn is_valid(&self) -> bool {
        matches!(self, IntegrityStatus::Valid { .. })
    }

    pub fn can_recover(&self) -> bool {
        matches!(
            self,
            IntegrityStatus::Corrupted { .. } | IntegrityStatus::Missing { .. }
        )
    }

    pub fn describe(&self) -> String {
        match self {
            IntegrityStatus::Valid { .. } => "File integrity verified".to_string(),
            IntegrityStatus::Corrupted { .. } => {
                "File content has changed - possible corruption".to_string()
            }
            IntegrityStatus::Missing { .. } => {
                "File missing - can be restored from integrity store".to_string()
            }
            IntegrityStatus::Untracked => "File not tracked by integrity store".to_string(),
            IntegrityStatus::Unreadable { message } => format!("Cannot read file: {}", message),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VersionRecord {
    pub timestamp: DateTime<Utc>,
    pub operation: String,
    pub hash: String,
    pub message: String,
}

#[derive(Debug)]
pub struct IntegrityStore {
    root: PathBuf,
    objects_dir: PathBuf,
    journal_dir: PathBuf,
    manifest: BTreeMap<String, FileRecord>,
}

impl IntegrityStore {
    /// `~/.etma-integrity`, or a relative directory when there is no home.
    pub fn default_root() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(STORE_DIR_NAME)
    }

    pub fn open(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let objects_dir = root.join(OBJECTS_DIR);
        let journal_dir = root.join(JOURNAL_DIR);
        fs::create_dir_all(&objects_dir).map_err(|e| {
            EtmaError::integrity(format!("cannot initialise store at {}: {}", root.display(), e))
        })?;
        fs::create_dir_all(&journal_dir)?;

        let manifest_path = root.join(MANIFEST_FILE);
        let manifest = if manifest_path.exists() {
            serde_json::from_slice(&fs::read(&manifest_path)?)?
        } else {
            BTreeMap::new()
        };

        tracing::debug!(
            "Opened integrity store at {} ({} tracked files)",
            root.display(),
            manifest.len()
        );
        Ok(Self {
            root,
            objects_dir,
            journal_dir,
            manifest,
        })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn tracked_count(&self) -> usize {
        self.manifest.len()
    }

    /// Records both sides of a save before the file itself is touched.
    pub fn begin(&self, path: &Path, before: Option<&[u8]>, after: &[u8]) -> Result<Transaction> {
        let before_hash = before.map(|b| self.store_content(b)).transpose()?;
        let after_hash = self.store_content(after)?;
        Ok(Transaction {
            path: path.to_path_buf(),
            before_hash,
            after_hash,
            started_at: Utc::now(),
        })
    }

    pub fn commit(&mut self, tx: Transaction) -> Result<()> {
        let key = file_key(&tx.path)?;
        self.manifest.insert(
            key.clone(),
            FileRecord {
                path: absolute(&tx.path)?,
                hash: tx.after_hash.clone(),
                modified: Utc::now(),
            },
        );
        self.save_manifest()?;
        self.journal(
            "COMMIT",
            &key,
            tx.before_hash.as_deref(),
            Some(&tx.after_hash),
            "Save successful",
        )
    }

    pub fn rollback(&self, tx: Transaction) -> Result<()> {
        let key = file_key(&tx.path)?;
        self.journal(
            "ROLLBACK",
            &key,
            tx.before_hash.as_deref(),
            Some(&tx.after_hash),
            "Save failed",
        )
    }

    /// The manifest entry for `path`, only if it was recorded for that exact
    /// path.
    fn record(&self, path: &Path) -> Option<&FileRecord> {
        let key = file_key(path).ok()?;
        let record = self.manifest.get(&key)?;
        let wanted = absolute(path).ok()?;
        if record.path != wanted {
            tracing::warn!(
                "⚠️ Manifest entry for {} belongs to {}",
                wanted.display(),
                record.path.display()
            );
            return None;
        }
        Some(record)
    }

    pub fn expected_hash(&self, path: &Path) -> Option<&str> {
        self.record(path).map(|r| r.hash.as_str())
    }

    pub fn verify(&self, path: &Path) -> IntegrityStatus {
        let Some(expected) = self.expected_hash(path) else {
            return IntegrityStatus::Untracked;
        };
        if !path.exists() {
            return IntegrityStatus::Missing {
                expected: expected.to_string(),
            };
        }
        match fs::read(path) {
            Ok(bytes) => {
                let actual = sha256_hex(&bytes);
                if actual == expected {
                    IntegrityStatus::Valid { hash: actual }
                } else {
                    IntegrityStatus::Corrupted {
                        expected: expected.to_string(),
                        actual,
                    }
                }
            }
            Err(e) => IntegrityStatus::Unreadable {
                message: e.to_string(),
            },
        }
    }

    pub fn verify_all(&self) -> Vec<(PathBuf, IntegrityStatus)> {
        self.manifest
            .values()
            .map(|record| (record.path.clone(), self.verify(&record.path)))
            .collect()
    }

    pub fn retrieve(&self, hash: &str) -> Result<Option<Vec<u8>>> {
        let path = self.object_path(hash)?;
        if !path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read(path)?))
    }

    /// Puts the last committed content back. A damaged file that is still
    /// present is first copied aside as `<name>.<timestamp>.corrupted.bak`.
    pub fn restore(&mut self, path: &Path) -> Result<SaveReceipt> {
        let key = file_key(path)?;
        let hash = self
            .record(path)
            .map(|r| r.hash.clone())
            .ok_or_else(|| EtmaError::integrity(format!("file not tracked: {}", path.display())))?;
        let content = self.retrieve(&hash)?.ok_or_else(|| {
            EtmaError::integrity(format!("content not found in store for hash {}", hash))
        })?;

        if path.exists() {
            fs::copy(path, corrupted_copy_path(path))?;
        }

        let temp = temp_path(path);
        let written = fs::write(&temp, &content).and_then(|_| move_into_place(&temp, path));
        if let Err(e) = written {
            remove_temp(&temp);
            return Err(EtmaError::integrity(format!("restore failed: {}", e)));
        }

        self.journal("RESTORE", &key, None, Some(&hash), "Restored from integrity store")?;
        tracing::info!("♻️ Restored {} from integrity store", path.display());
        Ok(SaveReceipt {
            path: path.to_path_buf(),
            bytes: content.len() as u64,
            hash,
            saved_at: Local::now(),
        })
    }

    /// Every journalled operation on `path`, newest first.
    pub fn history(&self, path: &Path) -> Result<Vec<VersionRecord>> {
        let key = file_key(path)?;
        let mut records = Vec::new();
        for (entry_key, record) in self.journal_entries()? {
            if entry_key == key {
                records.push(record);
            }
        }
        records.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        Ok(records)
    }

    /// Deletes stored objects that are neither a file's current content nor
    /// among its `keep` most recent committed versions.
    pub fn prune(&mut self, keep: usize) -> Result<usize> {
        let mut retained: HashSet<String> =
            self.manifest.values().map(|r| r.hash.clone()).collect();

        let mut per_file: HashMap<String, Vec<VersionRecord>> = HashMap::new();
        for (key, record) in self.journal_entries()? {
            if record.operation == "COMMIT" {
                per_file.entry(key).or_default().push(record);
            }
        }
        for versions in per_file.values_mut() {
            versions.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
            retained.extend(versions.iter().take(keep).map(|v| v.hash.clone()));
        }

        let mut pruned = 0;
        for prefix_dir in fs::read_dir(&self.objects_dir)? {
            let prefix_dir = prefix_dir?;
            if !prefix_dir.file_type()?.is_dir() {
                continue;
            }
            let prefix = prefix_dir.file_name().to_string_lossy().into_owned();
            for object in fs::read_dir(prefix_dir.path())? {
                let object = object?;
                let hash = format!("{}{}", prefix, object.file_name().to_string_lossy());
                if !retained.contains(&hash) {
                    fs::remove_file(object.path())?;
                    pruned += 1;
                }
            }
        }
        tracing::info!("🧹 Pruned {} stored versions (keeping {} per file)", pruned, keep);
        Ok(pruned)
    }

    fn store_content(&self, content: &[u8]) -> Result<String> {
        let hash = sha256_hex(content);
        let path = self.object_path(&hash)?;
        if !path.exists() {
            if let Some(dir) = path.parent() {
                fs::create_dir_all(dir)?;
            }
            fs::write(&path, content)
                .map_err(|e| EtmaError::integrity(format!("cannot store content: {}", e)))?;
        }
        Ok(hash)
    }

    fn object_path(&self, hash: &str) -> Result<PathBuf> {
        if hash.len() < 3 || !hash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(EtmaError::integrity(format!("malformed hash '{}'", hash)));
        }
        let (prefix, rest) = hash.split_at(2);
        Ok(self.objects_dir.join(prefix).join(rest))
    }

    fn save_manifest(&self) -> Result<()> {
        let path = self.root.join(MANIFEST_FILE);
        let temp = temp_path(&path);
        fs::write(&temp, serde_json::to_vec_pretty(&self.manifest)?)?;
        move_into_place(&temp, &path)?;
        Ok(())
    }

    fn journal(
        &self,
        operation: &str,
        key: &str,
        before: Option<&str>,
        after: Option<&str>,
        message: &str,
    ) -> Result<()> {
        let now = Utc::now();
        let path = self
            .journal_dir
            .join(format!("{}.journal", now.format("%Y-%m-%d")));
        let line = format!(
            "{}|{}|{}|{}|{}|{}\n",
            now.to_rfc3339(),
            operation,
            key,
            before.unwrap_or(""),
            after.unwrap_or(""),
            message.replace(['|', '\n'], " ")
        );
        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn journal_entries(&self) -> Result<Vec<(String, VersionRecord)>> {
        let mut entries = Vec::new();
        for file in fs::read_dir(&self.journal_dir)? {
            let path = file?.path();
            if path.extension().and_then(|e| e.to_str()) != Some("journal") {
                continue;
            }
            for line in fs::read_to_string(&path)?.lines() {
                let parts: Vec<&str> = line.splitn(6, '|').collect();
                if parts.len() < 5 {
                    continue;
                }
                let Ok(timestamp) = DateTime::parse_from_rfc3339(parts[0]) else {
                    tracing::warn!("Skipping unreadable journal line in {}", path.display());
                    continue;
                };
                entries.push((
                    parts[2].to_string(),
                    VersionRecord {
                        timestamp: timestamp.with_timezone(&Utc),
                        operation: parts[1].to_string(),
                        hash: parts[4].to_string(),
                        message: parts.get(5).unwrap_or(&"").to_string(),
                    },
                ));
            }
        }
        Ok(entries)
    }
}

pub(crate) fn absolute(path: &Path) -> Result<PathBuf> {
    let joined = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()?.join(path)
    };
    let mut normalized = PathBuf::new();
    for component in joined.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                normalized.pop();
            }
            other => normalized.push(other.as_os_str()),
        }
    }
    Ok(normalized)
}

/// SHA-256 of the normalised absolute path: one journal-safe token per path.
pub fn file_key(path: &Path) -> Result<String> {
    let normalized = absolute(path)?;
    Ok(sha256_hex(normalized.to_string_lossy().as_bytes()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store(dir: &TempDir) -> IntegrityStore {
        IntegrityStore::open(dir.path().join("store")).unwrap()
    }

    fn save(store: &mut IntegrityStore, path: &Path, content: &[u8]) {
        let before = fs::read(path).ok();
        let tx = store.begin(path, before.as_deref(), content).unwrap();
        fs::write(path, content).unwrap();
        store.commit(tx).unwrap();
    }

    #[test]
    fn test_verify_states() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let file = dir.path().join("a.fhi");

        assert_eq!(store.verify(&file), IntegrityStatus::Untracked);

        save(&mut store, &file, b"<a>1</a>");
        assert!(store.verify(&file).is_valid());

        fs::write(&file, b"<a>1</a").unwrap();
        let status = store.verify(&file);
        assert!(matches!(status, IntegrityStatus::Corrupted { .. }));
        assert!(status.can_recover());

        fs::remove_file(&file).unwrap();
        assert!(matches!(store.verify(&file), IntegrityStatus::Missing { .. }));
    }

    #[test]
    fn test_restore_preserves_damaged_copy() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let file = dir.path().join("a.fhi");
        save(&mut store, &file, b"<a>good</a>");
        fs::write(&file, b"<a>bad").unwrap();

        let receipt = store.restore(&file).unwrap();
        assert_eq!(fs::read(&file).unwrap(), b"<a>good</a>");
        assert_eq!(receipt.hash, sha256_hex(b"<a>good</a>"));

        let aside: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().ends_with(".corrupted.bak"))
            .collect();
        assert_eq!(aside.len(), 1);
        assert_eq!(fs::read(aside[0].path()).unwrap(), b"<a>bad");
    }

    #[test]
    fn test_manifest_survives_reopen() {
        let dir = TempDir::new().unwrap();
        let file = dir.path().join("a.fhi");
        {
            let mut store = store(&dir);
            save(&mut store, &file, b"v1");
        }
        let reopened = store(&dir);
        assert_eq!(reopened.tracked_count(), 1);
        assert_eq!(reopened.expected_hash(&file), Some(sha256_hex(b"v1").as_str()));
    }

    #[test]
    fn test_rollback_does_not_move_ref() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let file = dir.path().join("a.fhi");
        save(&mut store, &file, b"v1");

        let tx = store.begin(&file, Some(b"v1"), b"v2").unwrap();
        store.rollback(tx).unwrap();

        assert_eq!(store.expected_hash(&file), Some(sha256_hex(b"v1").as_str()));
        let history = store.history(&file).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().any(|v| v.operation == "ROLLBACK"));
    }

    #[test]
    fn test_history_and_prune() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let file = dir.path().join("a.fhi");
        for v in [b"v1", b"v2", b"v3"] {
            save(&mut store, &file, v);
        }

        let history = store.history(&file).unwrap();
        assert_eq!(history.len(), 3);
        assert!(history.iter().all(|v| v.operation == "COMMIT"));

        let pruned = store.prune(2).unwrap();
        assert_eq!(pruned, 1);
        assert!(store.retrieve(&sha256_hex(b"v1")).unwrap().is_none());
        assert!(store.retrieve(&sha256_hex(b"v2")).unwrap().is_some());
        assert!(store.retrieve(&sha256_hex(b"v3")).unwrap().is_some());
    }

    #[test]
    fn test_file_key_is_distinct_per_path() {
        let key = file_key(Path::new("/home/tutor/etmas/E225/a.fhi")).unwrap();
        assert_eq!(key.len(), 64);
        assert!(key.chars().all(|c| c.is_ascii_hexdigit()));
        assert_eq!(key, file_key(Path::new("/home/tutor/etmas/./E225/a.fhi")).unwrap());

        assert_ne!(
            file_key(Path::new("/etmas/a_b/c.fhi")).unwrap(),
            file_key(Path::new("/etmas/a/b_c.fhi")).unwrap()
        );
    }

    #[test]
    fn test_lookalike_paths_tracked_separately() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let first = dir.path().join("a_b").join("c.fhi");
        let second = dir.path().join("a").join("b_c.fhi");
        fs::create_dir_all(first.parent().unwrap()).unwrap();
        fs::create_dir_all(second.parent().unwrap()).unwrap();

        save(&mut store, &first, b"ONE");
        save(&mut store, &second, b"TWO");

        assert_eq!(store.tracked_count(), 2);
        assert!(store.verify(&first).is_valid());
        assert!(store.verify(&second).is_valid());

        fs::write(&second, b"T#O").unwrap();
        store.restore(&second).unwrap();
        assert_eq!(fs::read(&first).unwrap(), b"ONE");
        assert_eq!(fs::read(&second).unwrap(), b"TWO");
    }

    #[test]
    fn test_unreadable_file_reported() {
        let dir = TempDir::new().unwrap();
        let mut store = store(&dir);
        let file = dir.path().join("a.fhi");
        save(&mut store, &file, b"<a/>");

        fs::remove_file(&file).unwrap();
        fs::create_dir(&file).unwrap();

        let status = store.verify(&file);
        assert!(matches!(status, IntegrityStatus::Unreadable { .. }));
        assert!(!status.can_recover());
    }
}
