use crate::core::fhi::FhiDocument;
use crate::core::safe_file::collect_fhi_files;
use crate::domain::model::Submission;
use crate::domain::ports::{Pipeline, Storage};
use crate::utils::encoding::decode_latin1;
use crate::utils::error::{EtmaError, Result};
use serde::Serialize;
use std::io::Write;
use std::path::{Path, PathBuf};
use zip::write::{FileOptions, ZipWriter};

pub const MARKS_CSV: &str = "marks.csv";

/// A marked script ready to go back to the OU.
#[derive(Debug, Clone)]
pub struct MarkedScript {
    pub archive_path: String,
    pub submission: Submission,
    pub bytes: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MarkRow {
    pub personal_id: String,
    pub student: String,
    pub course: String,
    pub tma: String,
    pub score: u32,
    pub max_score: u32,
    pub percentage: String,
    pub grade: String,
    pub file: String,
}

#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub name: String,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct ReturnBundle {
    pub rows: Vec<MarkRow>,
    pub csv_output: String,
    pub entries: Vec<ArchiveEntry>,
}

/// Packages every marked `.fhi` under a directory, plus a marks summary,
/// into one zip written through `storage`.
pub struct ReturnsPipeline<S: Storage> {
    storage: S,
    source_dir: PathBuf,
    archive_name: String,
}

impl<S: Storage> ReturnsPipeline<S> {
    pub fn new(storage: S, source_dir: impl Into<PathBuf>, archive_name: impl Into<String>) -> Self {
        Self {
            storage,
            source_dir: source_dir.into(),
            archive_name: archive_name.into(),
        }
    }

    fn archive_path(&self, path: &Path) -> String {
        let relative = path.strip_prefix(&self.source_dir).unwrap_or(path);
        relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/")
    }
}

/// `returns-YYYYMMDD-HHMMSS.zip`
pub fn default_archive_name() -> String {
    format!("returns-{}.zip", chrono::Local::now().format("%Y%m%d-%H%M%S"))
}

#[async_trait::async_trait]
impl<S: Storage> Pipeline for ReturnsPipeline<S> {
    type Item = MarkedScript;
    type Output = ReturnBundle;

    async fn extract(&self) -> Result<Vec<MarkedScript>> {
        tracing::info!("🚀 Collecting marked scripts from {}", self.source_dir.display());
        let mut scripts = Vec::new();

        for path in collect_fhi_files(&self.source_dir)? {
            let bytes = tokio::fs::read(&path).await?;
            let document = match FhiDocument::parse(&decode_latin1(&bytes)) {
                Ok(doc) => doc,
                Err(e) => {
                    tracing::warn!("⚠️ Skipping unreadable {}: {}", path.display(), e);
                    continue;
                }
            };
            let submission = document.to_submission(Some(&path));
            if submission.status.marking().is_none() {
                tracing::warn!("⚠️ Skipping unmarked {}", path.display());
                continue;
            }
            scripts.push(MarkedScript {
                archive_path: self.archive_path(&path),
                submission,
                bytes,
            });
        }

        tracing::info!("📊 Found {} marked scripts", scripts.len());
        Ok(scripts)
    }

    async fn transform(&self, data: Vec<MarkedScript>) -> Result<ReturnBundle> {
        let mut rows = Vec::with_capacity(data.len());
        let mut entries = Vec::with_capacity(data.len() + 1);

        for script in data {
            let Some(marking) = script.submission.status.marking() else {
                continue;
            };
            let student = &script.submission.student;
            rows.push(MarkRow {
                personal_id: student.pi_number.clone(),
                student: student.full_name(),
                course: script.submission.course.to_string(),
                tma: script.submission.tma_number.clone(),
                score: marking.score,
                max_score: marking.max_score,
                percentage: format!("{:.1}", marking.percentage()),
                grade: marking.grade().to_string(),
                file: script.archive_path.clone(),
            });
            entries.push(ArchiveEntry {
                name: script.archive_path,
                data: script.bytes,
            });
        }

        let mut writer = csv::Writer::from_writer(Vec::new());
        for row in &rows {
            writer.serialize(row)?;
        }
        let csv_bytes = writer
            .into_inner()
            .map_err(|e| EtmaError::processing(format!("cannot finish marks summary: {}", e)))?;
        let csv_output = String::from_utf8(csv_bytes)
            .map_err(|e| EtmaError::processing(format!("marks summary is not UTF-8: {}", e)))?;

        tracing::info!("🔧 Prepared marks for {} scripts", rows.len());
        Ok(ReturnBundle {
            rows,
            csv_output,
            entries,
        })
    }

    async fn load(&self, result: ReturnBundle) -> Result<String> {
        let zip_data = {
            let mut zip = ZipWriter::new(std::io::Cursor::new(Vec::new()));

            zip.start_file::<_, ()>(MARKS_CSV, FileOptions::default())?;
            zip.write_all(result.csv_output.as_bytes())?;

            for entry in &result.entries {
                zip.start_file::<_, ()>(entry.name.as_str(), FileOptions::default())?;
                zip.write_all(&entry.data)?;
            }

            zip.finish()?.into_inner()
        };

        self.storage.write_file(&self.archive_name, &zip_data).await?;
        tracing::info!("📦 Returns archive written: {}", self.archive_name);
        Ok(self.archive_name.clone())
    }
}

pub struct ReturnEngine<P: Pipeline> {
    pipeline: P,
}

impl<P: Pipeline> ReturnEngine<P> {
    pub fn new(pipeline: P) -> Self {
        Self { pipeline }
    }

    pub async fn run(&self) -> Result<String> {
        tracing::info!("Starting returns packaging...");

        let items = self.pipeline.extract().await?;
        tracing::info!("Extracted {} items", items.len());

        let output = self.pipeline.transform(items).await?;

        let location = self.pipeline.load(output).await?;
        tracing::info!("Output saved to: {}", location);

        Ok(location)
    }
}
