use axum::extract::{Multipart, State};
use axum::Json;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::pipeline::{analysis, media, orchestrator};
use crate::pipeline::orchestrator::PostPayload;
use crate::utils::{AppError, AppResult};

use super::AppState;

pub async fn health() -> Json<Value> {
    Json(json!({ "status": "ok", "version": env!("CARGO_PKG_VERSION") }))
}

#[derive(Deserialize)]
pub struct GenerateResponseRequest {
    pub room_id: i64,
}

/// ルームの最新ユーザーターンへの応答を生成する
pub async fn generate_response(
    State(state): State<AppState>,
    Json(request): Json<GenerateResponseRequest>,
) -> AppResult<Json<Value>> {
    info!("generate-response 受信 (room={})", request.room_id);

    orchestrator::generate_room_response(
        &state.db,
        &state.gemini,
        &state.store,
        &state.queue,
        &state.config,
        request.room_id,
    )
    .await?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct GeneratePostResponseRequest {
    pub post: PostPayload,
}

/// 投稿への返信を生成する
pub async fn generate_post_response(
    State(state): State<AppState>,
    Json(request): Json<GeneratePostResponseRequest>,
) -> AppResult<Json<Value>> {
    info!("generate-post-response 受信 (post={})", request.post.id);

    orchestrator::generate_post_response(&state.db, &state.gemini, &state.queue, &request.post)
        .await?;

    Ok(Json(json!({ "success": true })))
}

#[derive(Deserialize)]
pub struct AnalyzeUserRequest {
    #[serde(rename = "type")]
    pub kind: String,
    pub id: i64,
    pub user_id: String,
}

/// 学習分析を実行してレポートを更新する
pub async fn analyze_user(
    State(state): State<AppState>,
    Json(request): Json<AnalyzeUserRequest>,
) -> AppResult<Json<Value>> {
    info!("analyze-user 受信 (type={}, id={})", request.kind, request.id);

    match request.kind.as_str() {
        "messages" => {
            analysis::analyze_room(&state.db, &state.gemini, request.id, &request.user_id).await?
        }
        "post_messages" => {
            analysis::analyze_post(&state.db, &state.gemini, request.id, &request.user_id).await?
        }
        other => {
            return Err(AppError::Validation(format!("未対応のtypeです: {}", other)));
        }
    }

    Ok(Json(json!({ "success": true })))
}

/// ファイルアップロード。`<user_id>/<uuid>.<ext>` に保存し、
/// PDFの場合はページ数を数えてメタデータ行も作成する
pub async fn upload(
    State(state): State<AppState>,
    mut multipart: Multipart,
) -> AppResult<Json<Value>> {
    let mut file_bytes: Option<Vec<u8>> = None;
    let mut original_name: Option<String> = None;
    let mut user_id: Option<String> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| AppError::Validation(format!("マルチパートの読み取りに失敗しました: {}", e)))?
    {
        let field_name = field.name().unwrap_or("").to_string();
        match field_name.as_str() {
            "file" => {
                original_name = field.file_name().map(|s| s.to_string());
                let bytes = field
                    .bytes()
                    .await
                    .map_err(|e| AppError::Validation(format!("ファイルの読み取りに失敗しました: {}", e)))?;
                file_bytes = Some(bytes.to_vec());
            }
            "user_id" => {
                user_id = Some(field.text().await.map_err(|e| {
                    AppError::Validation(format!("user_idの読み取りに失敗しました: {}", e))
                })?);
            }
            other => {
                warn!("未知のフィールドを無視: {}", other);
            }
        }
    }

    let (file_bytes, original_name, user_id) = match (file_bytes, original_name, user_id) {
        (Some(bytes), Some(name), Some(user_id)) if !user_id.is_empty() => {
            (bytes, name, user_id)
        }
        _ => {
            return Err(AppError::Validation(
                "fileとuser_idは必須です".to_string(),
            ));
        }
    };

    let (file_path, ext) = build_file_path(&user_id, &original_name);
    let bucket = state.config.storage.chat_bucket.clone();
    let content_type = media::mime_from_path(&file_path);
    let file_size = file_bytes.len() as i64;

    // PDFは保存前にページ数を取得しておく（メタデータ行に必要）
    let total_pages = if ext == "pdf" {
        match lopdf::Document::load_mem(&file_bytes) {
            Ok(doc) => Some(doc.get_pages().len() as i64),
            Err(e) => {
                warn!("PDFのページ数取得に失敗 ({}): {}", original_name, e);
                None
            }
        }
    } else {
        None
    };

    state
        .store
        .upload(&bucket, &file_path, file_bytes, content_type)
        .await?;

    let mut stored_pages = None;
    if let Some(total_pages) = total_pages {
        state
            .db
            .insert_document_metadata(&file_path, &bucket, file_size, total_pages)
            .await
            .map_err(|e| AppError::Persistence(e.to_string()))?;

        // 応答には保存済み行の値を返す
        stored_pages = state
            .db
            .get_document_metadata(&file_path, &bucket)
            .await?
            .map(|m| m.total_pages);
        info!("ドキュメントメタデータ作成: {} ({}ページ)", file_path, total_pages);
    }

    Ok(Json(json!({
        "filePath": file_path,
        "fileName": original_name,
        "totalPages": stored_pages,
    })))
}

/// 保存先パス `<user_id>/<uuid>.<ext>` と小文字拡張子を返す。
/// 拡張子が無いファイル名は `bin` として扱う
fn build_file_path(user_id: &str, original_name: &str) -> (String, String) {
    let ext = original_name
        .rsplit('.')
        .next()
        .filter(|e| *e != original_name)
        .unwrap_or("bin")
        .to_ascii_lowercase();
    (format!("{}/{}.{}", user_id, Uuid::new_v4(), ext), ext)
}
