use crate::core::hooks::DEFAULT_AUTOSAVE_IDLE;
use crate::core::inactivity::InactivityPolicy;
use crate::core::integrity::IntegrityStore;
use crate::domain::model::Tutor;
use crate::utils::error::{EtmaError, Result};
use crate::utils::validation::{
    validate_increasing, validate_non_empty_string, validate_path, validate_positive_number,
    validate_range, Validate,
};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

pub const CONFIG_FILE_NAME: &str = "config.toml";
const APP_DIR_NAME: &str = "etma-handler";

fn env_var_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| Regex::new(r"\$\{([^}]+)\}").unwrap())
}

/// Everything the handler reads from `config.toml`. Each section may be
/// left out.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EtmaConfig {
    pub tutor: TutorConfig,
    pub paths: PathsConfig,
    pub autosave: AutosaveConfig,
    pub inactivity: InactivityConfig,
    pub spelling: SpellingConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TutorConfig {
    pub forenames: String,
    pub surname: String,
    pub initials: String,
    pub email: Option<String>,
    pub staff_id: Option<String>,
    pub smtp_server: Option<String>,
}

impl TutorConfig {
    /// `None` until at least a surname is set.
    pub fn to_tutor(&self) -> Option<Tutor> {
        if self.surname.trim().is_empty() {
            return None;
        }
        let mut tutor = Tutor::new(self.forenames.trim(), self.surname.trim())
            .with_initials(&self.initials);
        tutor.email = self.email.clone().filter(|e| !e.trim().is_empty());
        tutor.staff_id = self.staff_id.clone().filter(|s| !s.trim().is_empty());
        tutor.smtp_server = self.smtp_server.clone();
        Some(tutor)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PathsConfig {
    pub etmas_dir: PathBuf,
    pub backup_dir: Option<PathBuf>,
    pub integrity_dir: Option<PathBuf>,
    pub returns_dir: PathBuf,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            etmas_dir: PathBuf::from("./etmas"),
            backup_dir: None,
            integrity_dir: None,
            returns_dir: PathBuf::from("./returns"),
        }
    }
}

impl PathsConfig {
    pub fn integrity_root(&self) -> PathBuf {
        self.integrity_dir
            .clone()
            .unwrap_or_else(IntegrityStore::default_root)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AutosaveConfig {
    pub idle_ms: u64,
}

impl Default for AutosaveConfig {
    fn default() -> Self {
        Self {
            idle_ms: DEFAULT_AUTOSAVE_IDLE.as_millis() as u64,
        }
    }
}

impl AutosaveConfig {
    pub fn idle(&self) -> Duration {
        Duration::from_millis(self.idle_ms)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InactivityConfig {
    pub warning_minutes: u64,
    pub soft_lock_minutes: u64,
    pub hard_lock_minutes: u64,
    pub check_interval_seconds: u64,
}

impl Default for InactivityConfig {
    fn default() -> Self {
        Self {
            warning_minutes: 10,
            soft_lock_minutes: 15,
            hard_lock_minutes: 30,
            check_interval_seconds: 30,
        }
    }
}

/// A week; longer lock times are almost certainly a typo.
pub const MAX_LOCK_MINUTES: u64 = 7 * 24 * 60;

fn minutes(field: &str, value: u64) -> Result<Duration> {
    value
        .checked_mul(60)
        .map(Duration::from_secs)
        .ok_or_else(|| EtmaError::InvalidConfigValueError {
            field: format!("inactivity.{}", field),
            value: value.to_string(),
            reason: "Too large to express in seconds".to_string(),
        })
}

impl InactivityConfig {
    pub fn to_policy(&self) -> Result<InactivityPolicy> {
        InactivityPolicy::new(
            minutes("warning_minutes", self.warning_minutes)?,
            minutes("soft_lock_minutes", self.soft_lock_minutes)?,
            minutes("hard_lock_minutes", self.hard_lock_minutes)?,
            Duration::from_secs(self.check_interval_seconds),
        )
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpellingConfig {
    pub dictionary: Option<PathBuf>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Compact,
    Json,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    pub format: LogFormat,
}

impl EtmaConfig {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let content = std::fs::read_to_string(&path).map_err(EtmaError::IoError)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        let processed = Self::substitute_env_vars(content);

        toml::from_str(&processed).map_err(|e| EtmaError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        })
    }

    /// `<config dir>/etma-handler/config.toml`.
    pub fn default_location() -> Option<PathBuf> {
        dirs::config_dir().map(|d| d.join(APP_DIR_NAME).join(CONFIG_FILE_NAME))
    }

    /// An explicit path must exist. Without one the default location is
    /// tried, falling back to built-in defaults.
    pub fn load(explicit: Option<&Path>) -> Result<Self> {
        if let Some(path) = explicit {
            tracing::debug!("Loading configuration from {}", path.display());
            return Self::from_file(path);
        }
        match Self::default_location() {
            Some(path) if path.is_file() => {
                tracing::debug!("Loading configuration from {}", path.display());
                Self::from_file(path)
            }
            _ => {
                tracing::debug!("No configuration file found, using defaults");
                Ok(Self::default())
            }
        }
    }

    /// Unset variables are left as written.
    fn substitute_env_vars(content: &str) -> String {
        env_var_pattern()
            .replace_all(content, |caps: &regex::Captures| {
                let var_name = &caps[1];
                std::env::var(var_name).unwrap_or_else(|_| format!("${{{}}}", var_name))
            })
            .into_owned()
    }

    pub fn tutor(&self) -> Option<Tutor> {
        self.tutor.to_tutor()
    }
}

impl Validate for EtmaConfig {
    fn validate(&self) -> Result<()> {
        validate_path(
            "paths.etmas_dir",
            &self.paths.etmas_dir.to_string_lossy(),
        )?;
        validate_path(
            "paths.returns_dir",
            &self.paths.returns_dir.to_string_lossy(),
        )?;
        if let Some(dir) = &self.paths.backup_dir {
            validate_path("paths.backup_dir", &dir.to_string_lossy())?;
        }
        if let Some(dir) = &self.paths.integrity_dir {
            validate_path("paths.integrity_dir", &dir.to_string_lossy())?;
        }

        validate_range("autosave.idle_ms", self.autosave.idle_ms, 100, 600_000)?;

        validate_positive_number(
            "inactivity.warning_minutes",
            self.inactivity.warning_minutes,
            1,
        )?;
        validate_increasing(
            "inactivity",
            &[
                ("warning_minutes", self.inactivity.warning_minutes),
                ("soft_lock_minutes", self.inactivity.soft_lock_minutes),
                ("hard_lock_minutes", self.inactivity.hard_lock_minutes),
            ],
        )?;
        validate_range(
            "inactivity.hard_lock_minutes",
            self.inactivity.hard_lock_minutes,
            1,
            MAX_LOCK_MINUTES,
        )?;
        validate_positive_number(
            "inactivity.check_interval_seconds",
            self.inactivity.check_interval_seconds,
            1,
        )?;

        if self.tutor != TutorConfig::default() {
            validate_non_empty_string("tutor.surname", &self.tutor.surname)?;
        }
        if let Some(email) = self.tutor.email.as_deref().filter(|e| !e.trim().is_empty()) {
            if !email.contains('@') {
                return Err(EtmaError::InvalidConfigValueError {
                    field: "tutor.email".to_string(),
                    value: email.to_string(),
                    reason: "Not an email address".to_string(),
                });
            }
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_empty_config_uses_defaults() {
        let config = EtmaConfig::from_toml_str("").unwrap();

        assert_eq!(config, EtmaConfig::default());
        assert_eq!(config.autosave.idle(), Duration::from_millis(2000));
        assert_eq!(config.inactivity.to_policy().unwrap(), InactivityPolicy::default());
        assert_eq!(config.logging.format, LogFormat::Compact);
        assert!(config.tutor().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_parse_full_config() {
        let toml_content = r#"
[tutor]
forenames = "Ada Mary"
surname = "Lovelace"
email = "ada@example.org"
staff_id = "00123456"

[paths]
etmas_dir = "/home/ada/etmas"
integrity_dir = "/home/ada/.etma-integrity"

[autosave]
idle_ms = 5000

[inactivity]
warning_minutes = 5
soft_lock_minutes = 8
hard_lock_minutes = 20

[logging]
format = "json"
"#;

        let config = EtmaConfig::from_toml_str(toml_content).unwrap();
        let tutor = config.tutor().unwrap();

        assert_eq!(tutor.initials, "AML");
        assert_eq!(tutor.effective_smtp_server(), "smtp.open.ac.uk");
        assert_eq!(
            config.paths.integrity_root(),
            PathBuf::from("/home/ada/.etma-integrity")
        );
        assert_eq!(config.paths.returns_dir, PathBuf::from("./returns"));
        assert_eq!(config.inactivity.check_interval_seconds, 30);
        assert_eq!(
            config.inactivity.to_policy().unwrap().soft_lock_after,
            Duration::from_secs(8 * 60)
        );
        assert_eq!(config.logging.format, LogFormat::Json);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_env_var_substitution() {
        std::env::set_var("ETMA_TEST_SURNAME", "Hopper");

        let toml_content = r#"
[tutor]
forenames = "Grace"
surname = "${ETMA_TEST_SURNAME}"
email = "${ETMA_TEST_UNSET_EMAIL}"
"#;

        let config = EtmaConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.tutor.surname, "Hopper");
        assert_eq!(
            config.tutor.email.as_deref(),
            Some("${ETMA_TEST_UNSET_EMAIL}")
        );

        std::env::remove_var("ETMA_TEST_SURNAME");
    }

    #[test]
    fn test_validation_rejects_out_of_order_lock_times() {
        let toml_content = r#"
[inactivity]
warning_minutes = 20
soft_lock_minutes = 15
"#;

        let config = EtmaConfig::from_toml_str(toml_content).unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("inactivity.soft_lock_minutes"));
        assert!(config.inactivity.to_policy().is_err());
    }

    #[test]
    fn test_huge_lock_times_are_rejected() {
        let config = EtmaConfig {
            inactivity: InactivityConfig {
                warning_minutes: 10,
                soft_lock_minutes: 15,
                hard_lock_minutes: u64::MAX,
                check_interval_seconds: 30,
            },
            ..EtmaConfig::default()
        };

        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("inactivity.hard_lock_minutes"));
        let err = config.inactivity.to_policy().unwrap_err();
        assert!(matches!(err, EtmaError::InvalidConfigValueError { .. }));
    }

    #[test]
    fn test_validation_rejects_bad_email() {
        let config =
            EtmaConfig::from_toml_str("[tutor]\nsurname = \"Evans\"\nemail = \"nobody\"\n")
                .unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validation_requires_tutor_surname() {
        let config = EtmaConfig::from_toml_str("[tutor]\nforenames = \"Mary\"\n").unwrap();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("tutor.surname"));
    }

    #[test]
    fn test_validation_bounds_autosave_idle() {
        let config = EtmaConfig::from_toml_str("[autosave]\nidle_ms = 5\n").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_malformed_toml_is_config_error() {
        let err = EtmaConfig::from_toml_str("[tutor\nsurname=").unwrap_err();
        assert!(matches!(err, EtmaError::ConfigValidationError { .. }));
    }

    #[test]
    fn test_config_from_file() {
        let mut temp_file = NamedTempFile::new().unwrap();
        temp_file
            .write_all(b"[spelling]\ndictionary = \"/usr/share/dict/words\"\n")
            .unwrap();

        let config = EtmaConfig::load(Some(temp_file.path())).unwrap();
        assert_eq!(
            config.spelling.dictionary,
            Some(PathBuf::from("/usr/share/dict/words"))
        );
    }

    #[test]
    fn test_explicit_missing_file_is_an_error() {
        let dir = tempfile::TempDir::new().unwrap();
        assert!(EtmaConfig::load(Some(&dir.path().join("absent.toml"))).is_err());
    }
}
