use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// メッセージ種別。DBにはTEXTで保存する
pub mod message_type {
    pub const TEXT: &str = "text";
    pub const IMAGE: &str = "image";
    pub const PDF: &str = "pdf";
    pub const CONTEXT: &str = "context";
    pub const TEXT_WITH_FIGURES: &str = "text_with_figures";
}

pub mod role {
    pub const USER: &str = "user";
    pub const MODEL: &str = "model";
    /// post_messages側のモデル役割タグ（歴史的経緯でroomsと異なる）
    pub const ASSISTANT: &str = "assistant";
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Room {
    pub id: Option<i64>,
    pub title: String,
    pub user_id: String,
    pub interactive: bool,
    pub internet_search: bool,
    pub created_at: Option<String>,
    pub updated_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Message {
    pub id: Option<i64>,
    pub room_id: i64,
    pub user_id: Option<String>,
    pub role: String,
    pub content: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub message_type: String,
    pub file_url: Option<String>,
    pub file_name: Option<String>,
    pub start_page: Option<i64>,
    pub end_page: Option<i64>,
    /// 図付きメッセージのみ: Figure配列のJSON
    pub figures: Option<String>,
    /// 図付きメッセージのみ: 加工前メッセージのID
    pub original_message_id: Option<i64>,
    pub created_at: Option<String>,
}

impl Message {
    /// 通常のテキストメッセージを組み立てる
    pub fn text(room_id: i64, role: &str, content: impl Into<String>) -> Self {
        Self {
            id: None,
            room_id,
            user_id: None,
            role: role.to_string(),
            content: content.into(),
            message_type: message_type::TEXT.to_string(),
            file_url: None,
            file_name: None,
            start_page: None,
            end_page: None,
            figures: None,
            original_message_id: None,
            created_at: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Post {
    pub id: Option<i64>,
    pub user_id: String,
    pub document_id: i64,
    pub start_page: i64,
    pub end_page: i64,
    pub comment: String,
    pub duration: Option<i64>,
    pub interactive: bool,
    pub internet_search: bool,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct PostMessage {
    pub id: Option<i64>,
    pub post_id: i64,
    pub role: String,
    pub content: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct DocumentMetadata {
    pub id: Option<i64>,
    pub file_name: String,
    pub bucket: String,
    pub title: String,
    pub file_size: Option<i64>,
    pub total_pages: i64,
    pub status: String,
    pub created_at: Option<String>,
}

#[derive(Debug, Clone, FromRow)]
pub struct TranscriptionRow {
    pub page: i64,
    pub transcription: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct InstantReport {
    pub user_id: String,
    pub content: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct DailyReport {
    pub id: i64,
    pub user_id: String,
    pub report_date: String,
    /// 分析文字列のJSON配列
    pub daily_report: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChatSetting {
    pub id: i64,
    pub user_id: String,
    pub subject: String,
    pub level: i64,
    pub explanation: String,
}

#[derive(Debug, Clone, FromRow)]
pub struct ChatSettingSub {
    pub setting_id: i64,
    pub field: String,
    pub level: i64,
    pub explanation: String,
}
