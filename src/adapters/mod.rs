// Concrete implementations of the domain ports.
pub mod local_storage;

pub use local_storage::LocalStorage;
