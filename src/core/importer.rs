//! Bringing an existing eTMA folder under the integrity store, checking it,
//! and fixing what can be fixed.

use crate::core::fhi;
use crate::core::integrity::{absolute, IntegrityStatus, IntegrityStore};
use crate::core::safe_file::{collect_fhi_files, sha256_hex, SafeFileService};
use crate::utils::encoding::{decode_latin1, encode_latin1};
use crate::utils::error::Result;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptedFile {
    pub path: PathBuf,
    pub error: String,
}

impl CorruptedFile {
    fn new(path: &Path, error: impl Into<String>) -> Self {
        Self {
            path: path.to_path_buf(),
            error: error.into(),
        }
    }
}

fn write_problems(f: &mut fmt::Formatter<'_>, title: &str, files: &[CorruptedFile]) -> fmt::Result {
    if files.is_empty() {
        return Ok(());
    }
    writeln!(f, "\n=== {} ===", title)?;
    for file in files {
        let name = file.path.file_name().unwrap_or_default().to_string_lossy();
        writeln!(f, "  {}: {}", name, file.error)?;
    }
    Ok(())
}

#[derive(Debug, Default)]
pub struct ImportReport {
    pub imported: Vec<PathBuf>,
    pub corrupted: Vec<CorruptedFile>,
    pub skipped: Vec<PathBuf>,
}

impl ImportReport {
    pub fn total(&self) -> usize {
        self.imported.len() + self.corrupted.len() + self.skipped.len()
    }
}

impl fmt::Display for ImportReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== FHI Import Summary ===")?;
        writeln!(f, "Total files found: {}", self.total())?;
        writeln!(f, "Successfully imported: {}", self.imported.len())?;
        writeln!(f, "Corrupted (need repair): {}", self.corrupted.len())?;
        writeln!(f, "Already tracked: {}", self.skipped.len())?;
        write_problems(f, "Corrupted Files", &self.corrupted)
    }
}

#[derive(Debug, Default)]
pub struct VerificationReport {
    pub valid: Vec<PathBuf>,
    pub corrupted: Vec<CorruptedFile>,
    pub untracked: Vec<PathBuf>,
}

impl VerificationReport {
    pub fn is_clean(&self) -> bool {
        self.corrupted.is_empty()
    }
}

impl fmt::Display for VerificationReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== FHI Verification Summary ===")?;
        writeln!(f, "Valid: {}", self.valid.len())?;
        writeln!(f, "Corrupted: {}", self.corrupted.len())?;
        writeln!(f, "Not tracked: {}", self.untracked.len())?;
        write_problems(f, "Corrupted Files", &self.corrupted)
    }
}

#[derive(Debug, Default)]
pub struct RepairReport {
    pub repaired: Vec<PathBuf>,
    pub restored: Vec<PathBuf>,
    pub unrepairable: Vec<CorruptedFile>,
}

impl fmt::Display for RepairReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "=== Repair Summary ===")?;
        writeln!(f, "Repaired: {}", self.repaired.len())?;
        writeln!(f, "Restored from store: {}", self.restored.len())?;
        writeln!(f, "Unrepairable: {}", self.unrepairable.len())?;
        write_problems(f, "Unrepairable Files", &self.unrepairable)
    }
}

/// Tracks every well-formed `.fhi` under `dir`. Files whose current content
/// is already what the store expects are left alone.
pub fn import_directory(dir: &Path, store: &mut IntegrityStore) -> Result<ImportReport> {
    let mut report = ImportReport::default();

    for path in collect_fhi_files(dir)? {
        let bytes = match fs::read(&path) {
            Ok(bytes) => bytes,
            Err(e) => {
                report
                    .corrupted
                    .push(CorruptedFile::new(&path, format!("Cannot read file: {}", e)));
                continue;
            }
        };

        if let Err(e) = fhi::check_well_formed(&decode_latin1(&bytes)) {
            tracing::warn!("⚠️ {} is malformed: {}", path.display(), e);
            report.corrupted.push(CorruptedFile::new(&path, e.to_string()));
            continue;
        }

        if store.expected_hash(&path) == Some(sha256_hex(&bytes).as_str()) {
            report.skipped.push(path);
            continue;
        }

        let tx = store.begin(&path, None, &bytes)?;
        store.commit(tx)?;
        report.imported.push(path);
    }

    tracing::info!(
        "📥 Imported {} files ({} corrupted, {} already tracked)",
        report.imported.len(),
        report.corrupted.len(),
        report.skipped.len()
    );
    Ok(report)
}

/// Checks every `.fhi` under `dir` against the store. Tracked files that have
/// disappeared from `dir` are reported as corrupted too.
pub fn verify_directory(dir: &Path, store: &IntegrityStore) -> Result<VerificationReport> {
    let mut report = VerificationReport::default();
    let found = collect_fhi_files(dir)?;

    for path in &found {
        classify(&mut report, path, store.verify(path));
    }

    let root = absolute(dir)?;
    for (path, status) in store.verify_all() {
        if matches!(status, IntegrityStatus::Missing { .. }) && path.starts_with(&root) {
            classify(&mut report, &path, status);
        }
    }

    Ok(report)
}

fn classify(report: &mut VerificationReport, path: &Path, status: IntegrityStatus) {
    match status {
        IntegrityStatus::Valid { .. } => report.valid.push(path.to_path_buf()),
        IntegrityStatus::Untracked => report.untracked.push(path.to_path_buf()),
        other => report
            .corrupted
            .push(CorruptedFile::new(path, other.describe())),
    }
}

/// Malformed files get the textual repair first, saved through `files` with
/// the damaged copy preserved. Anything that can't be repaired that way,
/// including well-formed files whose content changed behind the store's back,
/// is restored from the store when it holds a copy.
pub fn repair_corrupted(
    corrupted: &[CorruptedFile],
    store: &mut IntegrityStore,
    files: &SafeFileService,
) -> Result<RepairReport> {
    let mut report = RepairReport::default();

    for damaged in corrupted {
        let path = &damaged.path;
        if store.verify(path).is_valid() {
            tracing::info!("Leaving {} alone, it matches its recorded hash", path.display());
            continue;
        }
        let content = fs::read(path).ok().map(|b| decode_latin1(&b));

        let repaired = content
            .as_deref()
            .filter(|c| fhi::check_well_formed(c).is_err())
            .and_then(fhi::attempt_repair);

        if let (Some(original), Some(fixed)) = (content.as_deref(), repaired) {
            files.preserve_corrupted(path)?;
            match files.save_fhi(path, &fixed) {
                Ok(receipt) => {
                    let before = encode_latin1(original).ok();
                    let after = fs::read(path)?;
                    let tx = store.begin(path, before.as_deref(), &after)?;
                    store.commit(tx)?;
                    tracing::info!("🔧 Repaired {}", receipt.path.display());
                    report.repaired.push(path.clone());
                }
                Err(e) => report.unrepairable.push(CorruptedFile::new(
                    path,
                    format!("{}; repair failed: {}", damaged.error, e),
                )),
            }
            continue;
        }

        if store.verify(path).can_recover() {
            store.restore(path)?;
            report.restored.push(path.clone());
        } else {
            report.unrepairable.push(damaged.clone());
        }
    }

    Ok(report)
}
