use thiserror::Error;

#[derive(Error, Debug)]
pub enum EtmaError {
    #[error("Zip operation failed: {0}")]
    ZipError(#[from] zip::result::ZipError),

    #[error("CSV processing error: {0}")]
    CsvError(#[from] csv::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("Configuration error in '{field}': {message}")]
    ConfigValidationError { field: String, message: String },

    #[error("Invalid value '{value}' for '{field}': {reason}")]
    InvalidConfigValueError {
        field: String,
        value: String,
        reason: String,
    },

    #[error("Missing required configuration: {field}")]
    MissingConfigError { field: String },

    #[error("XML error: {message}")]
    XmlError { message: String },

    #[error("Encoding error: {message}")]
    EncodingError { message: String },

    #[error("Save failed: {message}")]
    SaveError { message: String },

    #[error("Integrity store error: {message}")]
    IntegrityError { message: String },

    #[error("Cannot move from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    #[error("Data processing error: {message}")]
    ProcessingError { message: String },

    #[error("Validation error: {message}")]
    ValidationError { message: String },

    #[error("Cannot evaluate mark expression: {message}")]
    ExpressionError { message: String },
}

pub type Result<T> = std::result::Result<T, EtmaError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    Configuration,
    Storage,
    Format,
    Marking,
    Internal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorSeverity {
    Low,
    Medium,
    High,
    Critical,
}

impl ErrorSeverity {
    /// Process exit code reported by the `etma` binary. Every failure is
    /// non-zero.
    pub fn exit_code(self) -> i32 {
        match self {
            ErrorSeverity::Low => 1,
            ErrorSeverity::Medium => 2,
            ErrorSeverity::High => 1,
            ErrorSeverity::Critical => 3,
        }
    }
}

impl EtmaError {
    pub fn save(message: impl Into<String>) -> Self {
        EtmaError::SaveError {
            message: message.into(),
        }
    }

    pub fn xml(message: impl Into<String>) -> Self {
        EtmaError::XmlError {
            message: message.into(),
        }
    }

    pub fn integrity(message: impl Into<String>) -> Self {
        EtmaError::IntegrityError {
            message: message.into(),
        }
    }

    pub fn processing(message: impl Into<String>) -> Self {
        EtmaError::ProcessingError {
            message: message.into(),
        }
    }

    pub fn exit_code(&self) -> i32 {
        self.severity().exit_code()
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            EtmaError::ConfigValidationError { .. }
            | EtmaError::InvalidConfigValueError { .. }
            | EtmaError::MissingConfigError { .. } => ErrorCategory::Configuration,
            EtmaError::IoError(_)
            | EtmaError::ZipError(_)
            | EtmaError::SaveError { .. }
            | EtmaError::IntegrityError { .. } => ErrorCategory::Storage,
            EtmaError::XmlError { .. }
            | EtmaError::EncodingError { .. }
            | EtmaError::CsvError(_)
            | EtmaError::SerializationError(_) => ErrorCategory::Format,
            EtmaError::InvalidTransition { .. }
            | EtmaError::ValidationError { .. }
            | EtmaError::ExpressionError { .. } => ErrorCategory::Marking,
            EtmaError::ProcessingError { .. } => ErrorCategory::Internal,
        }
    }

    pub fn severity(&self) -> ErrorSeverity {
        match self {
            EtmaError::ValidationError { .. } | EtmaError::ExpressionError { .. } => {
                ErrorSeverity::Low
            }
            EtmaError::InvalidTransition { .. } | EtmaError::IoError(_) => ErrorSeverity::Medium,
            EtmaError::SaveError { .. } | EtmaError::IntegrityError { .. } => {
                ErrorSeverity::Critical
            }
            _ => ErrorSeverity::High,
        }
    }

    pub fn recovery_suggestion(&self) -> &'static str {
        match self.category() {
            ErrorCategory::Configuration => {
                "Check the TOML configuration file and the environment variables it references"
            }
            ErrorCategory::Storage => match self {
                EtmaError::SaveError { .. } => {
                    "Your work was NOT saved. The original file is untouched; retry the save or restore the .bak copy"
                }
                EtmaError::IntegrityError { .. } => {
                    "Run `etma verify` on the eTMA folder and `etma repair` for damaged files"
                }
                _ => "Check that the folder exists and that you have permission to write to it",
            },
            ErrorCategory::Format => {
                "The file may be damaged; run `etma repair` or restore it from the integrity store"
            }
            ErrorCategory::Marking => match self {
                EtmaError::ExpressionError { .. } => {
                    "Write the mark as numbers joined by + - * /, for example 12+7.5+9"
                }
                EtmaError::ValidationError { .. } => {
                    "Enter a score between 0 and the assignment's maximum"
                }
                _ => "Check the submission's current marking status and retry",
            },
            ErrorCategory::Internal => "Re-run with --verbose and report the log output",
        }
    }

    pub fn user_friendly_message(&self) -> String {
        match self {
            EtmaError::SaveError { message } => format!("SAVE FAILED - {}", message),
            EtmaError::IoError(e) => format!("Could not access a file: {}", e),
            EtmaError::XmlError { .. } | EtmaError::EncodingError { .. } => {
                format!("The eTMA file could not be read: {}", self)
            }
            EtmaError::InvalidTransition { from, to } => {
                format!("A submission that is {} cannot be {}", from, to)
            }
            other => other.to_string(),
        }
    }
}

impl From<toml::de::Error> for EtmaError {
    fn from(e: toml::de::Error) -> Self {
        EtmaError::ConfigValidationError {
            field: "toml_parsing".to_string(),
            message: format!("TOML parsing error: {}", e),
        }
    }
}
