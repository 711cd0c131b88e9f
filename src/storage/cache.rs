use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use chrono::{DateTime, Utc, Duration};

#[derive(Clone)]
struct CacheEntry {
    url: String,
    expires_at: DateTime<Utc>,
}

/// 署名付きURLのインメモリキャッシュ。発行済みURLを有効期限まで使い回す
pub struct SignedUrlCache {
    store: Arc<RwLock<HashMap<String, CacheEntry>>>,
    ttl: Duration,
}

impl SignedUrlCache {
    /// ttl_secsは署名URLの有効期限より短く設定すること（期限切れ直前のURLを返さないため）
    pub fn new(ttl_secs: i64) -> Self {
        Self {
            store: Arc::new(RwLock::new(HashMap::new())),
            ttl: Duration::seconds(ttl_secs),
        }
    }

    pub fn get(&self, file_path: &str) -> Option<String> {
        let store = self.store.read().unwrap();
        if let Some(entry) = store.get(file_path) {
            if entry.expires_at > Utc::now() {
                return Some(entry.url.clone());
            }
        }
        None
    }

    pub fn set(&self, file_path: String, url: String) {
        let mut store = self.store.write().unwrap();
        store.insert(
            file_path,
            CacheEntry {
                url,
                expires_at: Utc::now() + self.ttl,
            },
        );
    }

    pub fn clear_expired(&self) {
        let mut store = self.store.write().unwrap();
        let now = Utc::now();
        store.retain(|_, entry| entry.expires_at > now);
    }
}
