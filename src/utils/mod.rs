pub mod logger;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error("バリデーションエラー: {0}")]
    Validation(String),

    #[error("リソースが見つかりません: {0}")]
    NotFound(String),

    #[error("不正な状態: {0}")]
    InvalidState(String),

    #[error("ストレージ取得エラー: {0}")]
    Fetch(#[from] sqlx::Error),

    #[error("ストレージ書き込みエラー: {0}")]
    Persistence(String),

    #[error("添付ファイル取得エラー: {0}")]
    MediaFetch(String),

    #[error("応答生成エラー: {0}")]
    Generation(String),

    #[error("ツール応答の解析エラー: {0}")]
    ToolResultParse(String),

    #[error("解析エラー: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("ネットワークエラー: {0}")]
    Network(#[from] reqwest::Error),

    #[error("IOエラー: {0}")]
    Io(#[from] std::io::Error),
}

pub type AppResult<T> = Result<T, AppError>;
