//! Database initialization and schema setup.

use aurora_db::{Aurora, FieldType};

use crate::error::StoreError;

/// Open the Aurora database at `db_path` and make sure every collection exists.
pub fn init_database(db_path: &str) -> Result<Aurora, StoreError> {
    let db = Aurora::open(db_path).map_err(|e| StoreError::Backend(format!("open {db_path}: {e}")))?;

    // Collections that already exist are left as they are.
    let _ = db.new_collection(
        "users",
        vec![
            ("id", FieldType::String, true),
            ("name", FieldType::String, false),
            ("avatar", FieldType::String, false),
            ("is_active", FieldType::String, false),
            ("friends", FieldType::String, false),       // JSON serialized
            ("blocked_users", FieldType::String, false), // JSON serialized
            ("last_seen", FieldType::String, false),
        ],
    );

    let _ = db.new_collection(
        "group_members",
        vec![
            ("group_id", FieldType::String, false),
            ("user_id", FieldType::String, false),
            ("created_at", FieldType::String, false),
        ],
    );

    let _ = db.new_collection(
        "messages",
        vec![
            ("id", FieldType::String, true),
            ("sender_id", FieldType::String, false),
            ("recipient_id", FieldType::String, false),
            ("content", FieldType::String, false),
            ("kind", FieldType::String, false),
            ("image", FieldType::String, false),
            ("file", FieldType::String, false),
            ("reply_to", FieldType::String, false),
            ("is_read", FieldType::String, false),
            ("read_at", FieldType::String, false),
            ("created_at", FieldType::String, false),
        ],
    );

    // `participant_key` is the sorted pair "a|b" so either direction finds the row.
    let _ = db.new_collection(
        "conversations",
        vec![
            ("id", FieldType::String, true),
            ("participant_key", FieldType::String, true),
            ("participants", FieldType::String, false), // JSON serialized
            ("last_message_id", FieldType::String, false),
            ("last_message_at", FieldType::String, false),
        ],
    );

    let _ = db.new_collection(
        "notifications",
        vec![
            ("id", FieldType::String, true),
            ("recipient_id", FieldType::String, false),
            ("sender_id", FieldType::String, false),
            ("kind", FieldType::String, false),
            ("title", FieldType::String, false),
            ("message", FieldType::String, false),
            ("data", FieldType::String, false), // JSON serialized
            ("is_read", FieldType::String, false),
            ("created_at", FieldType::String, false),
        ],
    );

    Ok(db)
}
