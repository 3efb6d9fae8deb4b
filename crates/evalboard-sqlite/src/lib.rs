//! SQLite backend for evalboard
//!
//! [`SqliteStore`] implements the run and dataset store contracts of
//! `evalboard-core` on a single SQLite database (bundled library), so runs,
//! results and metrics survive restarts.

mod error;
mod rows;
mod store;

pub use error::SqliteError;
pub use store::SqliteStore;
