use crate::sqlite_column;
use crate::sqlite_persistence::{
    Column, ForeignKey, ForeignKeyOnChange, SqlType, Table, VersionedSchema, DEFAULT_TIMESTAMP,
};

const CHATS_TABLE_V_0: Table = Table {
    name: "chats",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!("user_id", &SqlType::Integer, non_null = true),
        sqlite_column!("session_id", &SqlType::Text, non_null = true, is_unique = true),
        sqlite_column!("started_date", &SqlType::Text, non_null = true),
        sqlite_column!("user_timezone", &SqlType::Text, non_null = true),
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
        sqlite_column!("finished_at", &SqlType::Integer),
        sqlite_column!("archived_at", &SqlType::Integer),
        sqlite_column!("chat_duration", &SqlType::Integer),
    ],
    indices: &[("idx_chats_user_created", "user_id, created_at")],
};

const CHAT_HISTORIES_TABLE_V_0: Table = Table {
    name: "chat_histories",
    columns: &[
        sqlite_column!("id", &SqlType::Integer, is_primary_key = true),
        sqlite_column!(
            "chat_id",
            &SqlType::Integer,
            non_null = true,
            foreign_key = Some(&ForeignKey {
                foreign_table: "chats",
                foreign_column: "id",
                on_delete: ForeignKeyOnChange::Cascade,
            })
        ),
        sqlite_column!("message_id", &SqlType::Text, non_null = true),
        sqlite_column!("role", &SqlType::Text, non_null = true),
        sqlite_column!("content", &SqlType::Text, non_null = true),
        sqlite_column!("metadata", &SqlType::Text, non_null = true, default_value = Some("'{}'")),
        sqlite_column!(
            "inserted_at",
            &SqlType::Integer,
            non_null = true,
            default_value = Some(DEFAULT_TIMESTAMP)
        ),
    ],
    indices: &[("idx_chat_histories_chat_id", "chat_id")],
};

pub const CHAT_VERSIONED_SCHEMAS: &[VersionedSchema] = &[VersionedSchema {
    version: 0,
    tables: &[CHATS_TABLE_V_0, CHAT_HISTORIES_TABLE_V_0],
}];
