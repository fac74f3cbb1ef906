use crate::config::toml_config::{EtmaConfig, LogFormat};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Debug, Clone, Parser)]
#[command(name = "etma")]
#[command(about = "Receive, mark and return Open University eTMAs")]
pub struct Cli {
    #[arg(long, global = true, help = "Configuration file (TOML)")]
    pub config: Option<PathBuf>,

    #[arg(long, global = true, help = "Integrity store directory")]
    pub integrity_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Directory for backup copies")]
    pub backup_dir: Option<PathBuf>,

    #[arg(long, global = true, help = "Emit JSON log lines")]
    pub json_logs: bool,

    #[arg(long, short, global = true, help = "Enable verbose output")]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Debug, Clone, Subcommand)]
pub enum Command {
    /// Evaluate a mark expression the way the live preview does
    Preview { expr: String },
    /// Print the student, course and marking held in a script
    Show { file: PathBuf },
    /// Record a mark and feedback in a script
    Mark {
        file: PathBuf,
        #[arg(long)]
        score: u32,
        #[arg(long, help = "Maximum score (defaults to the script's own)")]
        max: Option<u32>,
        #[arg(long)]
        feedback: String,
    },
    /// Start tracking every script under a directory
    Import { dir: Option<PathBuf> },
    /// Check scripts against their recorded hashes
    Verify { dir: PathBuf },
    /// Verify, then repair or restore what is damaged
    Repair { dir: PathBuf },
    /// List the recorded versions of a script
    History { file: PathBuf },
    /// Drop old stored versions
    Prune {
        #[arg(long, default_value = "5")]
        keep: usize,
    },
    /// Build a returns archive of the marked scripts in a directory
    Package {
        dir: PathBuf,
        #[arg(long)]
        name: Option<String>,
    },
    /// Spell-check feedback text
    Spell { text: String },
}

impl Cli {
    /// Flags given on the command line win over the file.
    pub fn apply_overrides(&self, config: &mut EtmaConfig) {
        if let Some(dir) = &self.integrity_dir {
            config.paths.integrity_dir = Some(dir.clone());
        }
        if let Some(dir) = &self.backup_dir {
            config.paths.backup_dir = Some(dir.clone());
        }
        if self.json_logs {
            config.logging.format = LogFormat::Json;
        }
    }
}
