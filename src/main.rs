use clap::Parser;
use etma_handler::config::cli::{Cli, Command};
use etma_handler::config::{EtmaConfig, LogFormat};
use etma_handler::core::fhi::FhiDocument;
use etma_handler::core::importer::{import_directory, repair_corrupted, verify_directory};
use etma_handler::core::preview::evaluate;
use etma_handler::core::returns::{default_archive_name, ReturnEngine, ReturnsPipeline};
use etma_handler::core::spelling::Dictionary;
use etma_handler::domain::model::MarkStatus;
use etma_handler::utils::encoding::TextEncoding;
use etma_handler::utils::error::{EtmaError, Result};
use etma_handler::utils::{logger, validation::Validate};
use etma_handler::{FormalSaveProtocol, IntegrityStore, LocalStorage, SafeFileService};
use std::path::Path;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = match load_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            logger::init_cli_logger(cli.verbose);
            report_failure(&e);
            std::process::exit(e.exit_code());
        }
    };

    match config.logging.format {
        LogFormat::Compact => logger::init_cli_logger(cli.verbose),
        LogFormat::Json => logger::init_json_logger(cli.verbose),
    }
    tracing::debug!("Configuration: {:?}", config);

    if let Err(e) = run(cli.command, &config).await {
        report_failure(&e);
        std::process::exit(e.exit_code());
    }

    Ok(())
}

fn load_config(cli: &Cli) -> Result<EtmaConfig> {
    let mut config = EtmaConfig::load(cli.config.as_deref())?;
    cli.apply_overrides(&mut config);
    config.validate()?;
    Ok(config)
}

fn report_failure(e: &EtmaError) {
    tracing::error!(
        "❌ {} (Category: {:?}, Severity: {:?})",
        e,
        e.category(),
        e.severity()
    );
    eprintln!("❌ {}", e.user_friendly_message());
    eprintln!("💡 {}", e.recovery_suggestion());
}

fn open_store(config: &EtmaConfig) -> Result<IntegrityStore> {
    IntegrityStore::open(config.paths.integrity_root())
}

fn file_service(config: &EtmaConfig) -> SafeFileService {
    SafeFileService::new(config.paths.backup_dir.clone())
}

async fn run(command: Command, config: &EtmaConfig) -> Result<()> {
    match command {
        Command::Preview { expr } => {
            println!("= {}", evaluate(&expr)?);
        }
        Command::Show { file } => show(&file, config)?,
        Command::Mark {
            file,
            score,
            max,
            feedback,
        } => mark(&file, score, max, &feedback, config)?,
        Command::Import { dir } => {
            let dir = dir.unwrap_or_else(|| config.paths.etmas_dir.clone());
            let mut store = open_store(config)?;
            let report = import_directory(&dir, &mut store)?;
            println!("{}", report);
        }
        Command::Verify { dir } => {
            let store = open_store(config)?;
            let report = verify_directory(&dir, &store)?;
            println!("{}", report);
            if !report.is_clean() {
                return Err(EtmaError::integrity(format!(
                    "{} file(s) failed verification",
                    report.corrupted.len()
                )));
            }
        }
        Command::Repair { dir } => {
            let mut store = open_store(config)?;
            let report = verify_directory(&dir, &store)?;
            if report.is_clean() {
                println!("✅ Nothing to repair in {}", dir.display());
                return Ok(());
            }
            let repairs = repair_corrupted(&report.corrupted, &mut store, &file_service(config))?;
            println!("{}", repairs);
        }
        Command::History { file } => {
            let store = open_store(config)?;
            let versions = store.history(&file)?;
            if versions.is_empty() {
                println!("No recorded versions of {}", file.display());
            }
            for version in versions {
                println!(
                    "{}  {:<8} {}  {}",
                    version.timestamp.format("%Y-%m-%d %H:%M:%S"),
                    version.operation,
                    &version.hash[..version.hash.len().min(12)],
                    version.message
                );
            }
        }
        Command::Prune { keep } => {
            let mut store = open_store(config)?;
            let removed = store.prune(keep)?;
            println!("🧹 Removed {} stored version(s)", removed);
        }
        Command::Package { dir, name } => {
            let storage = LocalStorage::new(config.paths.returns_dir.clone());
            let archive = name.unwrap_or_else(default_archive_name);
            let engine = ReturnEngine::new(ReturnsPipeline::new(storage, dir, archive));
            let output = engine.run().await?;
            println!("📁 Returns archive saved to: {}", output);
        }
        Command::Spell { text } => {
            let path = config
                .spelling
                .dictionary
                .as_deref()
                .ok_or_else(|| EtmaError::MissingConfigError {
                    field: "spelling.dictionary".to_string(),
                })?;
            let dictionary = Dictionary::load(path)?;
            let errors = dictionary.check(&text);
            if errors.is_empty() {
                println!("✅ No spelling problems found");
            }
            for error in errors {
                println!(
                    "{} (at {}): {}",
                    error.word,
                    error.offset,
                    error.suggestions.join(", ")
                );
            }
        }
    }
    Ok(())
}

fn show(file: &Path, config: &EtmaConfig) -> Result<()> {
    let xml = file_service(config).read_fhi(file)?;
    let document = FhiDocument::parse(&xml)?;
    let submission = document.to_submission(Some(file));

    println!("Student:  {}", submission.student.display_name());
    println!(
        "Course:   {} ({})",
        submission.course,
        submission.course.presentation_name()
    );
    println!("TMA:      {}", submission.tma_number);
    if let Some(date) = submission.submitted_at {
        println!("Received: {}", date);
    }
    println!("Status:   {}", submission.status_description());
    if let Some(marking) = submission.status.marking() {
        println!("Feedback: {}", marking.feedback);
    }
    Ok(())
}

/// Records the mark in the script and writes it back through the formal
/// save protocol, so the integrity store tracks the new version.
fn mark(
    file: &Path,
    score: u32,
    max: Option<u32>,
    feedback: &str,
    config: &EtmaConfig,
) -> Result<()> {
    let files = file_service(config);
    let mut document = FhiDocument::parse(&files.read_fhi(file)?)?;
    let mut submission = document.to_submission(Some(file));

    if matches!(submission.status, MarkStatus::Marked(_)) {
        tracing::info!("✏️ Re-marking {}", submission.student.display_name());
        submission.reopen()?;
    } else {
        submission.start_marking()?;
    }
    let max_score = max.unwrap_or_else(|| document.max_score());
    submission.complete_mark(score, max_score, feedback)?;

    let Some(marking) = submission.status.marking() else {
        return Err(EtmaError::processing("marking missing after completion"));
    };
    document.apply_marking(marking);
    if document.tutor().is_none() {
        if let Some(tutor) = config.tutor() {
            document.set_field("tutor_details", "staff_forenames", &tutor.forenames);
            document.set_field("tutor_details", "staff_surname", &tutor.surname);
            document.set_field("tutor_details", "staff_initials", &tutor.initials);
            if let Some(staff_id) = &tutor.staff_id {
                document.set_field("tutor_details", "staff_id", staff_id);
            }
        }
    }

    let mut protocol = FormalSaveProtocol::new(files, open_store(config)?);
    protocol.execute_save(file, &document.to_xml()?, TextEncoding::Latin1)?;
    println!(
        "✅ {}: {}",
        submission.student.display_name(),
        submission.status_description()
    );
    Ok(())
}
