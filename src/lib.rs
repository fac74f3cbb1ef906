pub mod adapters;
pub mod config;
pub mod core;
pub mod domain;
pub mod utils;

pub use adapters::LocalStorage;
pub use config::EtmaConfig;
pub use core::{FormalSaveProtocol, IntegrityStore, SafeFileService};
pub use domain::model::{Course, MarkStatus, Marking, Student, Submission, Tutor};
pub use utils::error::{EtmaError, Result};
