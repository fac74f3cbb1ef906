use crate::core::fhi;
use crate::utils::encoding::TextEncoding;
use crate::utils::error::{EtmaError, Result};
use chrono::{DateTime, Local};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

const TEMP_SUFFIX: &str = ".tmp";
const BACKUP_SUFFIX: &str = ".bak";
const CORRUPTED_SUFFIX: &str = ".corrupted.bak";
const TIMESTAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

pub fn sha256_hex(bytes: &[u8]) -> String {
    format!("{:x}", Sha256::digest(bytes))
}

pub fn hash_file(path: &Path) -> Result<String> {
    Ok(sha256_hex(&fs::read(path)?))
}

pub fn is_fhi(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("fhi"))
        .unwrap_or(false)
}

/// Every `.fhi` below `dir`, in path order. Symbolic links are not followed.
pub fn collect_fhi_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    let mut pending = vec![dir.to_path_buf()];
    while let Some(current) = pending.pop() {
        for entry in fs::read_dir(&current)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let path = entry.path();
            if file_type.is_symlink() {
                tracing::debug!("Not following link {}", path.display());
            } else if file_type.is_dir() {
                pending.push(path);
            } else if file_type.is_file() && is_fhi(&path) {
                found.push(path);
            }
        }
    }
    found.sort();
    Ok(found)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().unwrap_or_default().to_os_string();
    name.push(suffix);
    path.with_file_name(name)
}

/// `<name>.<timestamp>.corrupted.bak` beside `path`.
pub(crate) fn corrupted_copy_path(path: &Path) -> PathBuf {
    with_suffix(
        path,
        &format!(".{}{}", Local::now().format(TIMESTAMP_FORMAT), CORRUPTED_SUFFIX),
    )
}

pub(crate) fn temp_path(target: &Path) -> PathBuf {
    with_suffix(target, TEMP_SUFFIX)
}

pub(crate) fn remove_temp(temp: &Path) {
    if let Err(e) = fs::remove_file(temp) {
        if e.kind() != std::io::ErrorKind::NotFound {
            tracing::warn!("⚠️ Could not clean up temp file {}: {}", temp.display(), e);
        }
    }
}

/// `rename` is atomic within one filesystem; across devices fall back to
/// copy-then-remove.
pub(crate) fn move_into_place(temp: &Path, target: &Path) -> std::io::Result<()> {
    match fs::rename(temp, target) {
        Ok(()) => Ok(()),
        Err(e) => {
            tracing::debug!("rename failed ({}), falling back to copy", e);
            fs::copy(temp, target)?;
            fs::remove_file(temp)
        }
    }
}

/// What a successful save wrote.
#[derive(Debug, Clone, PartialEq)]
pub struct SaveReceipt {
    pub path: PathBuf,
    pub bytes: u64,
    pub hash: String,
    pub saved_at: DateTime<Local>,
}

impl std::fmt::Display for SaveReceipt {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "saved {} ({} bytes, sha256 {})",
            self.path.display(),
            self.bytes,
            &self.hash[..self.hash.len().min(16)]
        )
    }
}

/// File writes that either fully succeed or leave the target untouched.
#[derive(Debug, Clone, Default)]
pub struct SafeFileService {
    backup_dir: Option<PathBuf>,
}

impl SafeFileService {
    /// With no backup directory, backups sit beside the file as `<name>.bak`.
    pub fn new(backup_dir: Option<PathBuf>) -> Self {
        Self { backup_dir }
    }

    /// Backup, write temp, validate, verify, rename over target, re-verify.
    pub fn save_with_verification(
        &self,
        target: &Path,
        content: &str,
        encoding: TextEncoding,
    ) -> Result<SaveReceipt> {
        let encoded = encoding.encode(content)?;

        if target.exists() {
            self.create_backup(target)
                .map_err(|e| EtmaError::save(format!("failed to create backup: {}", e)))?;
        }

        let temp = temp_path(target);
        if let Err(e) = self.write_temp(&temp, target, &encoded, encoding) {
            remove_temp(&temp);
            tracing::warn!("❌ Save of {} aborted: {}", target.display(), e);
            return Err(e);
        }

        if let Err(e) = move_into_place(&temp, target) {
            remove_temp(&temp);
            return Err(EtmaError::save(format!("failed to move temp file into place: {}", e)));
        }

        let written = fs::read(target)
            .map_err(|e| EtmaError::save(format!("failed to verify final file: {}", e)))?;
        if written != encoded {
            return Err(EtmaError::save(
                "final verification failed: saved content does not match",
            ));
        }

        let receipt = SaveReceipt {
            path: target.to_path_buf(),
            bytes: written.len() as u64,
            hash: sha256_hex(&written),
            saved_at: Local::now(),
        };
        tracing::debug!("{}", receipt);
        Ok(receipt)
    }

    fn write_temp(
        &self,
        temp: &Path,
        target: &Path,
        encoded: &[u8],
        encoding: TextEncoding,
    ) -> Result<()> {
        fs::write(temp, encoded)
            .map_err(|e| EtmaError::save(format!("failed to write temp file: {}", e)))?;

        if is_fhi(target) {
            self.validate_xml_file(temp, encoding)
                .map_err(|e| EtmaError::save(format!("XML validation failed: {}", e)))?;
        }

        let on_disk = fs::read(temp)
            .map_err(|e| EtmaError::save(format!("failed to verify temp file: {}", e)))?;
        if on_disk != encoded {
            return Err(EtmaError::save(
                "content verification failed: written content does not match",
            ));
        }
        Ok(())
    }

    /// ISO-8859-1, as the OU's tools expect.
    pub fn save_fhi(&self, target: &Path, content: &str) -> Result<SaveReceipt> {
        self.save_with_verification(target, content, TextEncoding::Latin1)
    }

    pub fn save_utf8(&self, target: &Path, content: &str) -> Result<SaveReceipt> {
        self.save_with_verification(target, content, TextEncoding::Utf8)
    }

    /// Returns the backup written, or `None` when there was nothing to back up.
    pub fn create_backup(&self, source: &Path) -> Result<Option<PathBuf>> {
        if !source.exists() {
            return Ok(None);
        }
        let backup = self.backup_path(source);
        if let Some(dir) = backup.parent() {
            fs::create_dir_all(dir)?;
        }
        fs::copy(source, &backup)?;
        tracing::debug!("Backed up {} to {}", source.display(), backup.display());
        Ok(Some(backup))
    }

    fn backup_path(&self, source: &Path) -> PathBuf {
        match &self.backup_dir {
            Some(dir) => {
                let name = source.file_name().unwrap_or_default().to_string_lossy();
                dir.join(format!(
                    "{}.{}{}",
                    name,
                    Local::now().format(TIMESTAMP_FORMAT),
                    BACKUP_SUFFIX
                ))
            }
            None => with_suffix(source, BACKUP_SUFFIX),
        }
    }

    pub fn validate_xml_file(&self, path: &Path, encoding: TextEncoding) -> Result<()> {
        let content = self.read_text(path, encoding)?;
        fhi::check_well_formed(&content)
    }

    /// Copies a damaged file aside as `<name>.<timestamp>.corrupted.bak`.
    pub fn preserve_corrupted(&self, path: &Path) -> Result<PathBuf> {
        if !path.exists() {
            return Err(EtmaError::save(format!(
                "corrupted file {} does not exist",
                path.display()
            )));
        }
        let preserved = corrupted_copy_path(path);
        fs::copy(path, &preserved)?;
        tracing::info!("🗄️ Preserved damaged file as {}", preserved.display());
        Ok(preserved)
    }

    pub fn read_text(&self, path: &Path, encoding: TextEncoding) -> Result<String> {
        encoding.decode(&fs::read(path)?)
    }

    pub fn read_fhi(&self, path: &Path) -> Result<String> {
        self.read_text(path, TextEncoding::Latin1)
    }
}
