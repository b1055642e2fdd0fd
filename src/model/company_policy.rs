use chrono::NaiveDateTime;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use std::str::FromStr;
use strum_macros::{AsRefStr, EnumString};
use utoipa::ToSchema;

#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Serialize, Deserialize, ToSchema, EnumString, AsRefStr,
    strum_macros::Display,
)]
#[serde(rename_all = "UPPERCASE")]
#[strum(serialize_all = "UPPERCASE")]
pub enum EmbeddingStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl TryFrom<String> for EmbeddingStatus {
    type Error = strum::ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        EmbeddingStatus::from_str(&value)
    }
}

/// Columns without `extracted_text`, which can be large.
pub const POLICY_COLUMNS: &str = "id, filename, file_type, upload_date, uploaded_by, is_active, \
     version, embedding_status, effective_date, policy_type";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow, ToSchema)]
pub struct CompanyPolicy {
    #[schema(example = 4)]
    pub id: u64,
    #[schema(example = "leave_policy_2026.pdf")]
    pub filename: String,
    #[schema(example = "pdf")]
    pub file_type: String,
    #[schema(value_type = String, format = "date-time")]
    pub upload_date: NaiveDateTime,
    pub uploaded_by: Option<u64>,
    pub is_active: bool,
    #[schema(example = 2)]
    pub version: i32,
    #[sqlx(default)]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extracted_text: Option<String>,
    #[sqlx(try_from = "String")]
    pub embedding_status: EmbeddingStatus,
    #[schema(value_type = Option<String>, format = "date-time")]
    pub effective_date: Option<NaiveDateTime>,
    #[schema(example = "LEAVE")]
    pub policy_type: String,
}
