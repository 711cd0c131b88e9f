use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use tracing::warn;

use crate::gemini::Part;
use crate::pipeline::history::MediaRef;
use crate::storage::ObjectStore;
use crate::utils::AppResult;

/// モデル呼び出しに埋め込む添付ファイル
#[derive(Debug, Clone)]
pub struct InlineMedia {
    pub mime_type: String,
    /// base64エンコード済み
    pub data: String,
}

/// 保存済みファイルパスから署名URLを発行し、本体を取得してインライン形式にする。
/// 失敗した添付は呼び出し側でスキップする（1件の失敗で応答全体を止めない）
pub async fn resolve_media(
    store: &ObjectStore,
    bucket: &str,
    file_path: &str,
) -> AppResult<InlineMedia> {
    let signed_url = store.create_signed_url(bucket, file_path).await?;
    let bytes = store.download(&signed_url).await?;

    Ok(InlineMedia {
        mime_type: mime_from_path(file_path).to_string(),
        data: BASE64.encode(bytes),
    })
}

/// 履歴中の添付ファイルを出現順にすべて解決する。
/// 解決できなかったものはログを残して飛ばし、残りだけ返す
pub async fn resolve_all_media(
    store: &ObjectStore,
    bucket: &str,
    refs: &[MediaRef],
) -> Vec<Part> {
    let mut parts = Vec::new();
    for media_ref in refs {
        match resolve_media(store, bucket, &media_ref.file_url).await {
            Ok(inline) => {
                parts.push(Part::inline_data(inline.mime_type, inline.data));
            }
            Err(e) => {
                warn!(
                    "添付ファイルの取得に失敗、スキップします ({}): {}",
                    media_ref.file_url, e
                );
            }
        }
    }
    parts
}

pub fn mime_from_path(path: &str) -> &'static str {
    let ext = path.rsplit('.').next().unwrap_or("").to_ascii_lowercase();
    match ext.as_str() {
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "pdf" => "application/pdf",
        _ => "application/octet-stream",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::extract::Path as UrlPath;
    use axum::http::StatusCode;
    use axum::routing::{get, post};
    use axum::{Json, Router};

    /// 署名発行とダウンロードだけを受けるスタブストレージを立てる。
    /// `u1/ok.png` 以外のダウンロードは404を返す
    async fn spawn_store_stub() -> String {
        let app = Router::new()
            .route(
                "/object/sign/chat-files/{*path}",
                post(|UrlPath(path): UrlPath<String>| async move {
                    Json(serde_json::json!({ "signedURL": format!("/files/{}", path) }))
                }),
            )
            .route(
                "/files/{*path}",
                get(|UrlPath(path): UrlPath<String>| async move {
                    if path == "u1/ok.png" {
                        (StatusCode::OK, b"pngdata".to_vec())
                    } else {
                        (StatusCode::NOT_FOUND, Vec::new())
                    }
                }),
            );

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(listener, app).await.unwrap();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn one_failed_attachment_does_not_drop_the_rest() {
        let base = spawn_store_stub().await;
        let store = ObjectStore::new(crate::config::StorageConfig {
            database_url: String::new(),
            object_store_url: base,
            service_key: "key".to_string(),
            chat_bucket: "chat-files".to_string(),
            signed_url_expires_secs: 300,
        });

        let refs = vec![
            MediaRef {
                file_url: "u1/missing.png".to_string(),
                placeholder: "[添付画像1]".to_string(),
            },
            MediaRef {
                file_url: "u1/ok.png".to_string(),
                placeholder: "[添付画像2]".to_string(),
            },
        ];

        let parts = resolve_all_media(&store, "chat-files", &refs).await;
        assert_eq!(parts.len(), 1);
        let blob = parts[0].inline_data.as_ref().unwrap();
        assert_eq!(blob.mime_type, "image/png");
        assert_eq!(blob.data, BASE64.encode(b"pngdata"));
    }

    #[test]
    fn mime_is_derived_from_extension() {
        assert_eq!(mime_from_path("u1/abc.PNG"), "image/png");
        assert_eq!(mime_from_path("u1/abc.jpeg"), "image/jpeg");
        assert_eq!(mime_from_path("u1/notes.pdf"), "application/pdf");
        assert_eq!(mime_from_path("u1/unknown.bin"), "application/octet-stream");
        assert_eq!(mime_from_path("noextension"), "application/octet-stream");
    }
}
