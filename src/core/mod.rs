pub mod batch;
pub mod fhi;
pub mod hooks;
pub mod importer;
pub mod inactivity;
pub mod integrity;
pub mod preview;
pub mod returns;
pub mod safe_file;
pub mod save_protocol;
pub mod spelling;

pub use crate::domain::ports::{Pipeline, Storage};
pub use crate::utils::error::Result;
pub use integrity::IntegrityStore;
pub use safe_file::SafeFileService;
pub use save_protocol::FormalSaveProtocol;
