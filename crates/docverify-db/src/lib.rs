pub mod error;
pub mod session;

// Re-exports
pub use error::{Error, Result};
pub use session::PgSession;
