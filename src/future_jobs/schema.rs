//! SQLite schema for the deferred jobs database.

use crate::sqlite_column;
use crate::sqlite_persistence::{Column, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP};

const FUTURE_JOBS_TABLE_V0: Table = Table {
    name: "future_jobs",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("dedup_key", &SqlType::Text, non_null = true),
        sqlite_column!("action_type", &SqlType::Text, non_null = true),
        sqlite_column!("action_params", &SqlType::Text, non_null = true),
        sqlite_column!("triggered_at", &SqlType::Integer, non_null = true),
        sqlite_column!("completed_at", &SqlType::Integer),
        sqlite_column!("status", &SqlType::Text, non_null = true),
        sqlite_column!("error", &SqlType::Text),
        sqlite_column!(
            "created_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
        sqlite_column!(
            "updated_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[
        ("idx_future_jobs_due", "status, triggered_at"),
        ("idx_future_jobs_dedup_key", "dedup_key"),
    ],
};

pub const FUTURE_JOBS_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[FUTURE_JOBS_TABLE_V0],
}];
