use crate::storage::models::TranscriptionRow;
use crate::storage::Database;
use crate::utils::{AppError, AppResult};

/// ページ範囲のバリデーション。ストレージアクセス前に行う
pub fn validate_page_range(start_page: i64, end_page: i64) -> AppResult<()> {
    if start_page > end_page {
        return Err(AppError::Validation(format!(
            "開始ページは終了ページ以下である必要があります ({} > {})",
            start_page, end_page
        )));
    }
    Ok(())
}

/// ファイル名指定でドキュメントの該当範囲を取得し、質問用の前置き付きで整形する
pub async fn fetch_document_context(
    db: &Database,
    file_name: &str,
    start_page: i64,
    end_page: i64,
) -> AppResult<String> {
    validate_page_range(start_page, end_page)?;

    let rows = db
        .fetch_transcriptions_by_file(file_name, start_page, end_page)
        .await?;
    if rows.is_empty() {
        return Err(AppError::NotFound(format!(
            "{} の {}〜{} ページのトランスクリプションが見つかりません",
            file_name, start_page, end_page
        )));
    }

    Ok(format!(
        "以下は{}の{}ページから{}ページまでの内容です：\n\n{}\n\n上記の内容に基づいて、以下の質問に答えてください。\n\n",
        file_name,
        start_page,
        end_page,
        join_pages(&rows)
    ))
}

/// ドキュメントID指定の取得（投稿フロー用）。前置きなしの素のページ連結を返す
pub async fn fetch_post_context(
    db: &Database,
    document_id: i64,
    start_page: i64,
    end_page: i64,
) -> AppResult<String> {
    validate_page_range(start_page, end_page)?;

    let rows = db
        .fetch_transcriptions_by_document(document_id, start_page, end_page)
        .await?;
    if rows.is_empty() {
        return Err(AppError::NotFound(format!(
            "ドキュメント{} の {}〜{} ページのトランスクリプションが見つかりません",
            document_id, start_page, end_page
        )));
    }

    Ok(join_pages(&rows))
}

/// 各ページをページマーカー付きで連結する
fn join_pages(rows: &[TranscriptionRow]) -> String {
    rows.iter()
        .map(|r| format!("[ページ{}]\n{}", r.page, r.transcription))
        .collect::<Vec<_>>()
        .join("\n\n")
}
