//! Database module for querygate.
//!
//! Provides the SQLite reference store with automatic migrations, plus its
//! implementations of the storage contracts.

mod models;
mod querier;
mod store;

pub use models::*;
pub use querier::*;
pub use store::*;

use crate::storage::StorageError;

impl From<DbError> for StorageError {
    fn from(err: DbError) -> Self {
        StorageError::Db(err.to_string())
    }
}
