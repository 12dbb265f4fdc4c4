//! Storage layer - SQLite
//!
//! Database management, migrations and the timestamp encoding shared by every
//! table.
//!
//! # Architecture
//!
//! - `database`: Connection pool management and initialization
//! - `migrations`: Schema versioning and automatic migration
//!
//! # Usage
//!
//! ```ignore
//! use keel_core::storage::Database;
//!
//! let db = Database::in_memory().await?;
//! let status = db.migration_status().await?;
//! ```

pub mod database;
pub mod migrations;

pub use database::{Database, DatabaseConfig, default_database_path, repository_database_path};
pub use migrations::{CURRENT_VERSION, MigrationStatus, migration_status, run_migrations};

use chrono::{DateTime, SecondsFormat, Utc};

use crate::error::{Error, Result};

/// Encode a timestamp for storage
///
/// Fixed-width RFC 3339 in UTC, so lexical order in SQL is chronological order.
pub fn to_db_timestamp(dt: &DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Decode a stored timestamp
pub fn from_db_timestamp(value: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(value)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| Error::Other(format!("Invalid stored timestamp '{}': {}", value, e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_timestamp_roundtrip_preserves_micros() {
        let now = Utc::now();
        let decoded = from_db_timestamp(&to_db_timestamp(&now)).unwrap();
        assert_eq!(decoded.timestamp_micros(), now.timestamp_micros());
    }

    #[test]
    fn test_timestamps_sort_lexically() {
        let earlier = Utc::now();
        let later = earlier + Duration::milliseconds(1500);
        assert!(to_db_timestamp(&earlier) < to_db_timestamp(&later));
        assert_eq!(to_db_timestamp(&earlier).len(), to_db_timestamp(&later).len());
    }

    #[test]
    fn test_invalid_timestamp() {
        assert!(from_db_timestamp("yesterday").is_err());
    }
}
