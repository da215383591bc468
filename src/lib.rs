// Questboard storage library
// Opens the application database and converges its schema on every start

pub mod config;
pub mod error;
pub mod logging;
pub mod storage;

pub use config::StorageConfig;
pub use error::{AppError, Result};
pub use storage::Database;
