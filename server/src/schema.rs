//! Collections of the court board.

use courtside_engine::{CollectionSchema, FieldDef, FieldType, Schema};

/// Teams are loaded once at startup; they are not followed live.
pub const TEAMS: &str = "teams";
pub const MATCHES: &str = "matches";
pub const MESSAGES: &str = "messages";

/// Every table the backing store must hold.
pub const STORE_TABLES: [&str; 3] = [TEAMS, MATCHES, MESSAGES];

/// Schema of the collections followed live.
pub fn live_schema() -> Schema {
    Schema::new()
        .with_collection(CollectionSchema::new(
            MATCHES,
            vec![
                FieldDef::required("team1_id", FieldType::Int),
                FieldDef::required("team2_id", FieldType::Int),
                FieldDef::required("court", FieldType::Int),
                FieldDef::optional("team1_score", FieldType::Int),
                FieldDef::optional("team2_score", FieldType::Int),
                FieldDef::optional("is_finished", FieldType::Bool),
                FieldDef::optional("created_at", FieldType::Timestamp),
                FieldDef::optional("client_op_id", FieldType::String),
            ],
        ))
        .with_collection(CollectionSchema::new(
            MESSAGES,
            vec![
                FieldDef::required("message_body", FieldType::String),
                FieldDef::optional("created_at", FieldType::Timestamp),
                FieldDef::optional("client_op_id", FieldType::String),
            ],
        ))
}
