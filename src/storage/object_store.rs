use serde::Deserialize;
use tracing::{debug, info};

use crate::config::StorageConfig;
use crate::storage::cache::SignedUrlCache;
use crate::utils::{AppError, AppResult};

#[derive(Deserialize)]
struct SignedUrlResponse {
    #[serde(rename = "signedURL")]
    signed_url: String,
}

/// オブジェクトストレージクライアント（Supabase Storage互換API）
pub struct ObjectStore {
    client: reqwest::Client,
    config: StorageConfig,
    cache: SignedUrlCache,
}

impl ObjectStore {
    pub fn new(config: StorageConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");

        // 期限切れ直前のURLを掴まないよう、キャッシュ寿命は発行期限より30秒短くする
        let cache_ttl = config.signed_url_expires_secs.saturating_sub(30) as i64;
        let cache = SignedUrlCache::new(cache_ttl);

        Self { client, config, cache }
    }

    /// 時限付き署名URLを発行する。発行済みで有効なものはキャッシュから返す
    pub async fn create_signed_url(&self, bucket: &str, file_path: &str) -> AppResult<String> {
        let cache_key = format!("{}/{}", bucket, file_path);
        if let Some(url) = self.cache.get(&cache_key) {
            debug!("署名URLキャッシュ命中: {}", cache_key);
            return Ok(url);
        }

        let endpoint = format!(
            "{}/object/sign/{}/{}",
            self.config.object_store_url, bucket, file_path
        );
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.config.service_key)
            .json(&serde_json::json!({ "expiresIn": self.config.signed_url_expires_secs }))
            .send()
            .await
            .map_err(|e| AppError::MediaFetch(format!("署名URL発行に失敗しました: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::MediaFetch(format!(
                "署名URL発行に失敗しました ({}): {}",
                status, body
            )));
        }

        let signed: SignedUrlResponse = response
            .json()
            .await
            .map_err(|e| AppError::MediaFetch(format!("署名URL応答の解析に失敗しました: {}", e)))?;

        // APIはベースURLからの相対パスを返す
        let url = format!("{}{}", self.config.object_store_url, signed.signed_url);
        self.cache.clear_expired();
        self.cache.set(cache_key, url.clone());
        Ok(url)
    }

    /// 署名URLからファイル本体を取得する
    pub async fn download(&self, signed_url: &str) -> AppResult<Vec<u8>> {
        let response = self
            .client
            .get(signed_url)
            .send()
            .await
            .map_err(|e| AppError::MediaFetch(format!("ファイル取得に失敗しました: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            return Err(AppError::MediaFetch(format!(
                "ファイル取得に失敗しました ({})",
                status
            )));
        }

        let bytes = response
            .bytes()
            .await
            .map_err(|e| AppError::MediaFetch(format!("ファイル読み取りに失敗しました: {}", e)))?;
        Ok(bytes.to_vec())
    }

    /// ファイルをアップロードする
    pub async fn upload(
        &self,
        bucket: &str,
        file_path: &str,
        data: Vec<u8>,
        content_type: &str,
    ) -> AppResult<()> {
        let endpoint = format!(
            "{}/object/{}/{}",
            self.config.object_store_url, bucket, file_path
        );
        let response = self
            .client
            .post(&endpoint)
            .bearer_auth(&self.config.service_key)
            .header("Content-Type", content_type)
            .body(data)
            .send()
            .await
            .map_err(|e| AppError::Persistence(format!("アップロードに失敗しました: {}", e)))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Persistence(format!(
                "アップロードに失敗しました ({}): {}",
                status, body
            )));
        }

        info!("アップロード完了: {}/{}", bucket, file_path);
        Ok(())
    }
}
