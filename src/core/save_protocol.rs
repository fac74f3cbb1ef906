//! Save as an explicit state machine, with the integrity store told about
//! every outcome.

use crate::core::integrity::{IntegrityStore, Transaction};
use crate::core::safe_file::{
    is_fhi, move_into_place, remove_temp, sha256_hex, temp_path, SafeFileService, SaveReceipt,
};
use crate::utils::encoding::TextEncoding;
use crate::utils::error::{EtmaError, Result};
use chrono::Local;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum SaveState {
    Initial,
    Preparing,
    BackedUp,
    TempWritten,
    Validated,
    Moved,
    Complete,
    Failed,
}

impl SaveState {
    pub fn description(self) -> &'static str {
        match self {
            SaveState::Initial => "Ready to save",
            SaveState::Preparing => "Preparing save operation",
            SaveState::BackedUp => "Backup of original file created",
            SaveState::TempWritten => "Content written to temporary file",
            SaveState::Validated => "Temporary file validated",
            SaveState::Moved => "Atomic move completed",
            SaveState::Complete => "Save complete and verified",
            SaveState::Failed => "Save failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, SaveState::Complete | SaveState::Failed)
    }

    /// The single forward step, if any. `Failed` is reachable from every
    /// non-terminal state in addition to this.
    fn next(self) -> Option<SaveState> {
        match self {
            SaveState::Initial => Some(SaveState::Preparing),
            SaveState::Preparing => Some(SaveState::BackedUp),
            SaveState::BackedUp => Some(SaveState::TempWritten),
            SaveState::TempWritten => Some(SaveState::Validated),
            SaveState::Validated => Some(SaveState::Moved),
            SaveState::Moved => Some(SaveState::Complete),
            SaveState::Complete | SaveState::Failed => None,
        }
    }

    pub fn can_transition_to(self, to: SaveState) -> bool {
        if self.is_terminal() {
            return false;
        }
        to == SaveState::Failed || self.next() == Some(to)
    }
}

impl fmt::Display for SaveState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SaveState::Initial => "INITIAL",
            SaveState::Preparing => "PREPARING",
            SaveState::BackedUp => "BACKED_UP",
            SaveState::TempWritten => "TEMP_WRITTEN",
            SaveState::Validated => "VALIDATED",
            SaveState::Moved => "MOVED",
            SaveState::Complete => "COMPLETE",
            SaveState::Failed => "FAILED",
        };
        f.write_str(name)
    }
}

pub fn validate_transition(from: SaveState, to: SaveState) -> Result<()> {
    if from.can_transition_to(to) {
        Ok(())
    } else {
        Err(EtmaError::InvalidTransition {
            from: from.to_string(),
            to: to.to_string(),
        })
    }
}

/// Everything known about one save while it runs. Listeners see it after
/// every state change.
#[derive(Debug)]
pub struct SaveContext {
    target: PathBuf,
    intended: Vec<u8>,
    state: SaveState,
    original: Option<Vec<u8>>,
    temp_path: Option<PathBuf>,
    backup_path: Option<PathBuf>,
    transaction: Option<Transaction>,
    /// The target holds the new content.
    moved: bool,
    errors: Vec<String>,
}

impl SaveContext {
    fn new(target: &Path, intended: Vec<u8>) -> Self {
        Self {
            target: target.to_path_buf(),
            intended,
            state: SaveState::Initial,
            original: None,
            temp_path: None,
            backup_path: None,
            transaction: None,
            moved: false,
            errors: Vec::new(),
        }
    }

    pub fn target(&self) -> &Path {
        &self.target
    }

    pub fn state(&self) -> SaveState {
        self.state
    }

    pub fn intended(&self) -> &[u8] {
        &self.intended
    }

    pub fn original(&self) -> Option<&[u8]> {
        self.original.as_deref()
    }

    pub fn temp_path(&self) -> Option<&Path> {
        self.temp_path.as_deref()
    }

    pub fn backup_path(&self) -> Option<&Path> {
        self.backup_path.as_deref()
    }

    pub fn has_transaction(&self) -> bool {
        self.transaction.is_some()
    }

    pub fn errors(&self) -> &[String] {
        &self.errors
    }
}

impl fmt::Display for SaveContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "SaveContext[state={}, target={}, errors={}]",
            self.state,
            self.target
                .file_name()
                .unwrap_or_default()
                .to_string_lossy(),
            self.errors.len()
        )
    }
}

/// Conditions that must hold in the state `ctx` is in, checked on entry to
/// every state.
pub fn check_invariants(ctx: &SaveContext) -> Vec<String> {
    let mut violations = Vec::new();

    if !ctx.state.is_terminal() && ctx.intended.is_empty() {
        violations.push("content to save is empty before completion".to_string());
    }

    if ctx.state < SaveState::Moved {
        if let Some(original) = &ctx.original {
            if let Ok(current) = fs::read(&ctx.target) {
                if &current != original {
                    violations.push("original file modified before the move".to_string());
                }
            }
        }
    }

    if ctx.state == SaveState::Failed && ctx.intended.is_empty() && ctx.transaction.is_none() {
        violations.push("no recovery data available after failure".to_string());
    }

    violations
}

pub type StateListener = Box<dyn Fn(&SaveContext) + Send + Sync>;

pub struct FormalSaveProtocol {
    files: SafeFileService,
    store: IntegrityStore,
    listener: Option<StateListener>,
}

impl FormalSaveProtocol {
    pub fn new(files: SafeFileService, store: IntegrityStore) -> Self {
        Self {
            files,
            store,
            listener: None,
        }
    }

    pub fn with_listener<F>(mut self, listener: F) -> Self
    where
        F: Fn(&SaveContext) + Send + Sync + 'static,
    {
        self.listener = Some(Box::new(listener));
        self
    }

    pub fn store(&self) -> &IntegrityStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut IntegrityStore {
        &mut self.store
    }

    pub fn into_store(self) -> IntegrityStore {
        self.store
    }

    pub fn execute_save(
        &mut self,
        target: &Path,
        content: &str,
        encoding: TextEncoding,
    ) -> Result<SaveReceipt> {
        let intended = encoding.encode(content)?;
        let mut ctx = SaveContext::new(target, intended);
        self.notify(&ctx);

        match self.run(&mut ctx, encoding) {
            Ok(receipt) => {
                if let Some(tx) = ctx.transaction.take() {
                    self.store.commit(tx)?;
                }
                tracing::info!("💾 {}", receipt);
                Ok(receipt)
            }
            Err(mut message) => {
                if ctx.moved {
                    message = match self.undo_move(&ctx) {
                        Ok(()) => format!("{}; the original content was put back", message),
                        Err(e) => format!(
                            "{}; the file could not be reset ({}), recover it from {}",
                            message,
                            e,
                            ctx.backup_path
                                .as_deref()
                                .map(|p| p.display().to_string())
                                .unwrap_or_else(|| "the integrity store".to_string())
                        ),
                    };
                }
                ctx.errors.push(message.clone());
                ctx.state = SaveState::Failed;
                self.notify(&ctx);
                if let Some(tx) = ctx.transaction.take() {
                    if let Err(e) = self.store.rollback(tx) {
                        tracing::warn!("⚠️ Could not journal rollback: {}", e);
                    }
                }
                tracing::error!("❌ Save of {} failed: {}", target.display(), message);
                Err(EtmaError::save(message))
            }
        }
    }

    fn run(&self, ctx: &mut SaveContext, encoding: TextEncoding) -> std::result::Result<SaveReceipt, String> {
        self.transition(ctx, SaveState::Preparing)
            .map_err(|e| format!("Cannot begin save operation: {}", e))?;

        let target = ctx.target.clone();
        if target.exists() {
            let original =
                fs::read(&target).map_err(|e| format!("Cannot read original: {}", e))?;
            let tx = self
                .store
                .begin(&target, Some(&original), &ctx.intended)
                .map_err(|e| e.to_string())?;
            ctx.original = Some(original);
            ctx.transaction = Some(tx);
            ctx.backup_path = self
                .files
                .create_backup(&target)
                .map_err(|e| format!("Backup failed: {}", e))?;
        } else {
            ctx.transaction = Some(
                self.store
                    .begin(&target, None, &ctx.intended)
                    .map_err(|e| e.to_string())?,
            );
        }
        self.transition(ctx, SaveState::BackedUp)?;

        let temp = temp_path(&target);
        fs::write(&temp, &ctx.intended)
            .map_err(|e| format!("Failed to write temp file: {}", e))?;
        ctx.temp_path = Some(temp.clone());

        let staged = self
            .transition(ctx, SaveState::TempWritten)
            .and_then(|_| self.validate_temp(ctx, &temp, encoding))
            .and_then(|_| self.transition(ctx, SaveState::Validated))
            .and_then(|_| move_into_place(&temp, &target).map_err(|e| format!("Move failed: {}", e)));
        if let Err(message) = staged {
            remove_temp(&temp);
            return Err(message);
        }
        ctx.moved = true;
        self.transition(ctx, SaveState::Moved)?;

        let written = fs::read(&target).map_err(|e| format!("Cannot verify final file: {}", e))?;
        if written != ctx.intended {
            return Err("Final content does not match; data may be corrupted".to_string());
        }
        self.transition(ctx, SaveState::Complete)?;

        let hash = ctx
            .transaction
            .as_ref()
            .map(|tx| tx.after_hash().to_string())
            .unwrap_or_else(|| sha256_hex(&written));
        Ok(SaveReceipt {
            path: target,
            bytes: written.len() as u64,
            hash,
            saved_at: Local::now(),
        })
    }

    /// Puts the target back the way it was before the move.
    fn undo_move(&self, ctx: &SaveContext) -> std::result::Result<(), String> {
        let Some(original) = &ctx.original else {
            return fs::remove_file(&ctx.target).map_err(|e| e.to_string());
        };
        let temp = temp_path(&ctx.target);
        let reset = fs::write(&temp, original).and_then(|_| move_into_place(&temp, &ctx.target));
        if let Err(e) = reset {
            remove_temp(&temp);
            return Err(e.to_string());
        }
        tracing::warn!("↩️ Reset {} to its content before the save", ctx.target.display());
        Ok(())
    }

    fn validate_temp(
        &self,
        ctx: &SaveContext,
        temp: &Path,
        encoding: TextEncoding,
    ) -> std::result::Result<(), String> {
        if is_fhi(&ctx.target) {
            self.files
                .validate_xml_file(temp, encoding)
                .map_err(|e| format!("Validation failed: {}", e))?;
        }
        let on_disk = fs::read(temp).map_err(|e| format!("Cannot verify temp file: {}", e))?;
        if on_disk != ctx.intended {
            return Err("Written content does not match intended content".to_string());
        }
        Ok(())
    }

    fn transition(&self, ctx: &mut SaveContext, to: SaveState) -> std::result::Result<(), String> {
        validate_transition(ctx.state, to).map_err(|e| e.to_string())?;

        let from = ctx.state;
        ctx.state = to;
        let violations = check_invariants(ctx);
        if !violations.is_empty() {
            ctx.state = from;
            let message = format!("Invariant violations: {}", violations.join(", "));
            ctx.errors.push(message.clone());
            return Err(message);
        }

        tracing::debug!("{} → {} ({})", from, to, to.description());
        self.notify(ctx);
        Ok(())
    }

    fn notify(&self, ctx: &SaveContext) {
        if let Some(listener) = &self.listener {
            listener(ctx);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::integrity::IntegrityStatus;
    use std::sync::{Arc, Mutex};
    use tempfile::TempDir;

    fn protocol(dir: &TempDir) -> FormalSaveProtocol {
        let store = IntegrityStore::open(dir.path().join("store")).unwrap();
        FormalSaveProtocol::new(SafeFileService::default(), store)
    }

    fn recording(dir: &TempDir) -> (FormalSaveProtocol, Arc<Mutex<Vec<SaveState>>>) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let protocol = protocol(dir).with_listener(move |ctx| sink.lock().unwrap().push(ctx.state()));
        (protocol, seen)
    }

    #[test]
    fn test_transition_table() {
        assert!(validate_transition(SaveState::Initial, SaveState::Preparing).is_ok());
        assert!(validate_transition(SaveState::Validated, SaveState::Failed).is_ok());
        assert!(validate_transition(SaveState::Initial, SaveState::Moved).is_err());
        assert!(validate_transition(SaveState::Complete, SaveState::Failed).is_err());
        assert!(validate_transition(SaveState::Failed, SaveState::Initial).is_err());

        let err = validate_transition(SaveState::BackedUp, SaveState::Complete).unwrap_err();
        assert_eq!(err.to_string(), "Cannot move from BACKED_UP to COMPLETE");
    }

    #[test]
    fn test_successful_save_walks_every_state() {
        let dir = TempDir::new().unwrap();
        let (mut protocol, seen) = recording(&dir);
        let target = dir.path().join("a.fhi");

        let receipt = protocol
            .execute_save(&target, "<student_submission/>", TextEncoding::Latin1)
            .unwrap();

        assert_eq!(
            *seen.lock().unwrap(),
            vec![
                SaveState::Initial,
                SaveState::Preparing,
                SaveState::BackedUp,
                SaveState::TempWritten,
                SaveState::Validated,
                SaveState::Moved,
                SaveState::Complete,
            ]
        );
        assert!(protocol.store().verify(&target).is_valid());
        assert_eq!(protocol.store().expected_hash(&target), Some(receipt.hash.as_str()));
    }

    #[test]
    fn test_invalid_xml_fails_and_rolls_back() {
        let dir = TempDir::new().unwrap();
        let (mut protocol, seen) = recording(&dir);
        let target = dir.path().join("a.fhi");
        fs::write(&target, "<student_submission/>").unwrap();

        let err = protocol
            .execute_save(&target, "<student_submission>", TextEncoding::Latin1)
            .unwrap_err();

        assert!(err.to_string().contains("Validation failed"));
        assert_eq!(seen.lock().unwrap().last(), Some(&SaveState::Failed));
        assert_eq!(fs::read_to_string(&target).unwrap(), "<student_submission/>");
        assert!(!temp_path(&target).exists());
        assert_eq!(protocol.store().verify(&target), IntegrityStatus::Untracked);

        let history = protocol.store().history(&target).unwrap();
        assert_eq!(history[0].operation, "ROLLBACK");
    }

    #[test]
    fn test_empty_content_violates_invariant() {
        let dir = TempDir::new().unwrap();
        let mut protocol = protocol(&dir);
        let target = dir.path().join("notes.txt");

        let err = protocol
            .execute_save(&target, "", TextEncoding::Utf8)
            .unwrap_err();
        assert!(err.to_string().contains("Invariant violations"));
        assert!(!target.exists());
    }

    #[test]
    fn test_overwrite_records_backup() {
        let dir = TempDir::new().unwrap();
        let backups = dir.path().join("backups");
        let store = IntegrityStore::open(dir.path().join("store")).unwrap();
        let backup_seen = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&backup_seen);
        let mut protocol =
            FormalSaveProtocol::new(SafeFileService::new(Some(backups.clone())), store)
                .with_listener(move |ctx| {
                    if let Some(path) = ctx.backup_path() {
                        *sink.lock().unwrap() = Some(path.to_path_buf());
                    }
                });
        let target = dir.path().join("a.fhi");
        fs::write(&target, "<student_submission/>").unwrap();

        protocol
            .execute_save(&target, "<student_submission><x>1</x></student_submission>", TextEncoding::Latin1)
            .unwrap();

        let backup = backup_seen.lock().unwrap().clone().unwrap();
        assert!(backup.starts_with(&backups));
        assert_eq!(fs::read_to_string(backup).unwrap(), "<student_submission/>");
    }

    #[test]
    fn test_overwrite_existing_file_commits() {
        let dir = TempDir::new().unwrap();
        let (mut protocol, seen) = recording(&dir);
        let target = dir.path().join("a.fhi");
        let first = "<student_submission><score>40</score></student_submission>";
        let second = "<student_submission><score>70</score></student_submission>";

        protocol.execute_save(&target, first, TextEncoding::Latin1).unwrap();
        let receipt = protocol
            .execute_save(&target, second, TextEncoding::Latin1)
            .unwrap();

        assert_eq!(fs::read_to_string(&target).unwrap(), second);
        assert_eq!(seen.lock().unwrap().last(), Some(&SaveState::Complete));
        assert!(protocol.store().verify(&target).is_valid());
        assert_eq!(protocol.store().expected_hash(&target), Some(receipt.hash.as_str()));

        let history = protocol.store().history(&target).unwrap();
        assert_eq!(history.len(), 2);
        assert!(history.iter().all(|v| v.operation == "COMMIT"));
    }

    #[test]
    fn test_original_changed_before_move_is_rejected() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.fhi");
        fs::write(&target, "<student_submission/>").unwrap();
        let watched = target.clone();
        let mut protocol = protocol(&dir).with_listener(move |ctx| {
            if ctx.state() == SaveState::TempWritten {
                fs::write(&watched, "<student_submission><other/></student_submission>").unwrap();
            }
        });

        let err = protocol
            .execute_save(&target, "<student_submission><x/></student_submission>", TextEncoding::Latin1)
            .unwrap_err();

        assert!(err.to_string().contains("original file modified before the move"));
        assert_eq!(
            fs::read_to_string(&target).unwrap(),
            "<student_submission><other/></student_submission>"
        );
        assert!(!temp_path(&target).exists());
    }

    #[test]
    fn test_failure_after_move_puts_original_back() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a.fhi");
        fs::write(&target, "<student_submission/>").unwrap();
        let watched = target.clone();
        let mut protocol = protocol(&dir).with_listener(move |ctx| {
            if ctx.state() == SaveState::Moved {
                fs::write(&watched, "garbled").unwrap();
            }
        });

        let err = protocol
            .execute_save(&target, "<student_submission><x/></student_submission>", TextEncoding::Latin1)
            .unwrap_err();

        assert!(err.to_string().contains("original content was put back"));
        assert_eq!(fs::read_to_string(&target).unwrap(), "<student_submission/>");
        assert_eq!(protocol.store().verify(&target), IntegrityStatus::Untracked);
        assert_eq!(protocol.store().history(&target).unwrap()[0].operation, "ROLLBACK");
    }

    #[test]
    fn test_failure_after_move_removes_new_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("new.fhi");
        let watched = target.clone();
        let mut protocol = protocol(&dir).with_listener(move |ctx| {
            if ctx.state() == SaveState::Moved {
                fs::write(&watched, "garbled").unwrap();
            }
        });

        assert!(protocol
            .execute_save(&target, "<student_submission/>", TextEncoding::Latin1)
            .is_err());
        assert!(!target.exists());
    }
}
