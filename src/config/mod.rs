use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use anyhow::Result;

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    pub server: ServerConfig,
    pub storage: StorageConfig,
    pub gemini: GeminiConfig,
    pub figures: FigureConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    /// リクエスト全体のタイムアウト（秒）
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct StorageConfig {
    pub database_url: String,
    /// オブジェクトストレージのベースURL（Supabase Storage互換API）
    pub object_store_url: String,
    /// サービスロールキー。環境変数 STORAGE_SERVICE_KEY で上書き可能
    pub service_key: String,
    pub chat_bucket: String,
    /// 署名付きURLの有効期限（秒）
    pub signed_url_expires_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct GeminiConfig {
    /// 環境変数 GOOGLE_API_KEY で上書き可能
    pub api_key: String,
    pub api_url: String,
    pub chat_model: String,
    pub analysis_model: String,
    pub figure_model: String,
    pub code_model: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FigureConfig {
    pub enabled: bool,
    /// matplotlib描画サービスのURL。環境変数 FIGURE_RENDERER_URL で上書き可能
    pub renderer_url: String,
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        let config_path = PathBuf::from("config/settings.toml");

        let mut config = if config_path.exists() {
            let content = std::fs::read_to_string(config_path)?;
            toml::from_str::<AppConfig>(&content)?
        } else {
            Self::default()
        };

        config.apply_env_overrides();
        Ok(config)
    }

    pub fn save(&self, path: &str) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// 秘匿値は設定ファイルではなく環境変数から受け取る
    fn apply_env_overrides(&mut self) {
        if let Ok(key) = std::env::var("GOOGLE_API_KEY") {
            self.gemini.api_key = key;
        }
        if let Ok(key) = std::env::var("STORAGE_SERVICE_KEY") {
            self.storage.service_key = key;
        }
        if let Ok(url) = std::env::var("OBJECT_STORE_URL") {
            self.storage.object_store_url = url;
        }
        if let Ok(url) = std::env::var("DATABASE_URL") {
            self.storage.database_url = url;
        }
        if let Ok(url) = std::env::var("FIGURE_RENDERER_URL") {
            self.figures.renderer_url = url;
        }
    }

    pub fn is_gemini_configured(&self) -> bool {
        !self.gemini.api_key.is_empty() && self.gemini.api_key != "your-api-key"
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
                request_timeout_secs: 60,
            },
            storage: StorageConfig {
                database_url: "sqlite:data/studyfellow.db".to_string(),
                object_store_url: "http://127.0.0.1:54321/storage/v1".to_string(),
                service_key: "".to_string(),
                chat_bucket: "chat-files".to_string(),
                signed_url_expires_secs: 300,
            },
            gemini: GeminiConfig {
                api_key: "your-api-key".to_string(),
                api_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
                chat_model: "gemini-2.5-flash".to_string(),
                analysis_model: "gemini-2.0-flash".to_string(),
                figure_model: "gemini-2.0-flash".to_string(),
                code_model: "gemini-2.5-pro".to_string(),
            },
            figures: FigureConfig {
                enabled: true,
                renderer_url: "".to_string(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_roundtrips_through_toml() {
        let config = AppConfig::default();
        let text = toml::to_string_pretty(&config).unwrap();
        let parsed: AppConfig = toml::from_str(&text).unwrap();
        assert_eq!(parsed.server.port, 8080);
        assert_eq!(parsed.storage.signed_url_expires_secs, 300);
        assert_eq!(parsed.gemini.chat_model, "gemini-2.5-flash");
    }

    #[test]
    fn unconfigured_api_key_is_detected() {
        let config = AppConfig::default();
        assert!(!config.is_gemini_configured());
    }
}
