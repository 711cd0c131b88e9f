use sqlx::{SqlitePool, sqlite::SqlitePoolOptions};
use anyhow::Result;
use tracing::info;

use crate::storage::models::{
    ChatSetting, ChatSettingSub, DailyReport, DocumentMetadata, InstantReport, Message, Post,
    PostMessage, TranscriptionRow,
};
use crate::storage::models::Room;

pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn new(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(
                database_url.parse::<sqlx::sqlite::SqliteConnectOptions>()?
                    .create_if_missing(true)
            )
            .await?;

        info!("データベース接続成功: {}", database_url);
        Ok(Self { pool })
    }

    pub async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                display_name TEXT,
                user_name TEXT UNIQUE,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_metadata (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                file_name TEXT NOT NULL,
                bucket TEXT NOT NULL,
                title TEXT DEFAULT '',
                file_size INTEGER,
                total_pages INTEGER NOT NULL,
                status TEXT DEFAULT 'unprocessed',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(file_name, bucket)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS document_transcriptions (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                document_id INTEGER,
                file_name TEXT NOT NULL,
                page INTEGER NOT NULL,
                transcription TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(file_name, page)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS rooms (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                title TEXT NOT NULL,
                user_id TEXT NOT NULL,
                interactive INTEGER DEFAULT 0,
                internet_search INTEGER DEFAULT 0,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                room_id INTEGER NOT NULL,
                user_id TEXT,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                type TEXT DEFAULT 'text',
                file_url TEXT,
                file_name TEXT,
                start_page INTEGER,
                end_page INTEGER,
                figures TEXT,
                original_message_id INTEGER,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (room_id) REFERENCES rooms(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS posts (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                document_id INTEGER NOT NULL,
                start_page INTEGER NOT NULL,
                end_page INTEGER NOT NULL,
                comment TEXT NOT NULL,
                duration INTEGER,
                interactive INTEGER DEFAULT 0,
                internet_search INTEGER DEFAULT 0,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS post_messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                post_id INTEGER NOT NULL,
                role TEXT NOT NULL,
                content TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                FOREIGN KEY (post_id) REFERENCES posts(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_instant_reports (
                user_id TEXT PRIMARY KEY,
                content TEXT NOT NULL DEFAULT '',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                updated_at TEXT DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_daily_reports (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                report_date TEXT NOT NULL,
                daily_report TEXT NOT NULL,
                created_at TEXT DEFAULT CURRENT_TIMESTAMP,
                UNIQUE(user_id, report_date)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_chat_settings (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                user_id TEXT NOT NULL,
                subject TEXT NOT NULL,
                level INTEGER NOT NULL,
                explanation TEXT DEFAULT '',
                created_at TEXT DEFAULT CURRENT_TIMESTAMP
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS user_chat_settings_sub (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                setting_id INTEGER NOT NULL,
                field TEXT NOT NULL,
                level INTEGER NOT NULL,
                explanation TEXT DEFAULT '',
                FOREIGN KEY (setting_id) REFERENCES user_chat_settings(id)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        info!("データベーステーブル初期化完了");
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// ファイル名でトランスクリプションをページ順に取得する
    pub async fn fetch_transcriptions_by_file(
        &self,
        file_name: &str,
        start_page: i64,
        end_page: i64,
    ) -> sqlx::Result<Vec<TranscriptionRow>> {
        sqlx::query_as::<_, TranscriptionRow>(
            r#"
            SELECT page, transcription FROM document_transcriptions
            WHERE file_name = ? AND page >= ? AND page <= ?
            ORDER BY page
            "#,
        )
        .bind(file_name)
        .bind(start_page)
        .bind(end_page)
        .fetch_all(&self.pool)
        .await
    }

    /// ドキュメントIDでトランスクリプションをページ順に取得する（投稿フロー用）
    pub async fn fetch_transcriptions_by_document(
        &self,
        document_id: i64,
        start_page: i64,
        end_page: i64,
    ) -> sqlx::Result<Vec<TranscriptionRow>> {
        sqlx::query_as::<_, TranscriptionRow>(
            r#"
            SELECT page, transcription FROM document_transcriptions
            WHERE document_id = ? AND page >= ? AND page <= ?
            ORDER BY page
            "#,
        )
        .bind(document_id)
        .bind(start_page)
        .bind(end_page)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn get_room(&self, room_id: i64) -> sqlx::Result<Option<Room>> {
        sqlx::query_as::<_, Room>("SELECT * FROM rooms WHERE id = ?")
            .bind(room_id)
            .fetch_optional(&self.pool)
            .await
    }

    /// ルームの全メッセージを作成順に取得する
    pub async fn fetch_room_messages(&self, room_id: i64) -> sqlx::Result<Vec<Message>> {
        sqlx::query_as::<_, Message>(
            // CURRENT_TIMESTAMPは秒精度なので同秒内の順序はidで保証する
            "SELECT * FROM messages WHERE room_id = ? ORDER BY created_at, id",
        )
        .bind(room_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn insert_message(&self, message: &Message) -> sqlx::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO messages
                (room_id, user_id, role, content, type, file_url, file_name,
                 start_page, end_page, figures, original_message_id)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(message.room_id)
        .bind(&message.user_id)
        .bind(&message.role)
        .bind(&message.content)
        .bind(&message.message_type)
        .bind(&message.file_url)
        .bind(&message.file_name)
        .bind(message.start_page)
        .bind(message.end_page)
        .bind(&message.figures)
        .bind(message.original_message_id)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_post(&self, post_id: i64) -> sqlx::Result<Option<Post>> {
        sqlx::query_as::<_, Post>("SELECT * FROM posts WHERE id = ?")
            .bind(post_id)
            .fetch_optional(&self.pool)
            .await
    }

    pub async fn fetch_post_messages(&self, post_id: i64) -> sqlx::Result<Vec<PostMessage>> {
        sqlx::query_as::<_, PostMessage>(
            "SELECT * FROM post_messages WHERE post_id = ? ORDER BY created_at, id",
        )
        .bind(post_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn insert_post_message(
        &self,
        post_id: i64,
        role: &str,
        content: &str,
    ) -> sqlx::Result<i64> {
        let result = sqlx::query(
            "INSERT INTO post_messages (post_id, role, content) VALUES (?, ?, ?)",
        )
        .bind(post_id)
        .bind(role)
        .bind(content)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_instant_report(&self, user_id: &str) -> sqlx::Result<Option<InstantReport>> {
        sqlx::query_as::<_, InstantReport>(
            "SELECT user_id, content FROM user_instant_reports WHERE user_id = ?",
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await
    }

    /// 存在しなければ空レポートを作成する。既存行はそのまま
    pub async fn create_instant_report(&self, user_id: &str) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO user_instant_reports (user_id, content) VALUES (?, '') \
             ON CONFLICT(user_id) DO NOTHING",
        )
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_instant_report(&self, user_id: &str, content: &str) -> sqlx::Result<()> {
        sqlx::query(
            "UPDATE user_instant_reports SET content = ?, updated_at = CURRENT_TIMESTAMP \
             WHERE user_id = ?",
        )
        .bind(content)
        .bind(user_id)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_daily_report(
        &self,
        user_id: &str,
        report_date: &str,
    ) -> sqlx::Result<Option<DailyReport>> {
        sqlx::query_as::<_, DailyReport>(
            "SELECT id, user_id, report_date, daily_report FROM user_daily_reports \
             WHERE user_id = ? AND report_date = ?",
        )
        .bind(user_id)
        .bind(report_date)
        .fetch_optional(&self.pool)
        .await
    }

    pub async fn insert_daily_report(
        &self,
        user_id: &str,
        report_date: &str,
        daily_report: &str,
    ) -> sqlx::Result<()> {
        sqlx::query(
            "INSERT INTO user_daily_reports (user_id, report_date, daily_report) VALUES (?, ?, ?)",
        )
        .bind(user_id)
        .bind(report_date)
        .bind(daily_report)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn update_daily_report(&self, id: i64, daily_report: &str) -> sqlx::Result<()> {
        sqlx::query("UPDATE user_daily_reports SET daily_report = ? WHERE id = ?")
            .bind(daily_report)
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    pub async fn fetch_chat_settings(&self, user_id: &str) -> sqlx::Result<Vec<ChatSetting>> {
        sqlx::query_as::<_, ChatSetting>(
            "SELECT id, user_id, subject, level, explanation FROM user_chat_settings \
             WHERE user_id = ? ORDER BY id",
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await
    }

    pub async fn fetch_chat_settings_sub(
        &self,
        setting_id: i64,
    ) -> sqlx::Result<Vec<ChatSettingSub>> {
        sqlx::query_as::<_, ChatSettingSub>(
            "SELECT setting_id, field, level, explanation FROM user_chat_settings_sub \
             WHERE setting_id = ? ORDER BY id",
        )
        .bind(setting_id)
        .fetch_all(&self.pool)
        .await
    }

    /// アップロードされたPDFのメタデータ行を作成する
    pub async fn insert_document_metadata(
        &self,
        file_name: &str,
        bucket: &str,
        file_size: i64,
        total_pages: i64,
    ) -> sqlx::Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO document_metadata (file_name, bucket, title, file_size, total_pages, status)
            VALUES (?, ?, '', ?, ?, 'unprocessed')
            ON CONFLICT(file_name, bucket) DO UPDATE SET
                file_size = excluded.file_size,
                total_pages = excluded.total_pages
            "#,
        )
        .bind(file_name)
        .bind(bucket)
        .bind(file_size)
        .bind(total_pages)
        .execute(&self.pool)
        .await?;

        Ok(result.last_insert_rowid())
    }

    pub async fn get_document_metadata(
        &self,
        file_name: &str,
        bucket: &str,
    ) -> sqlx::Result<Option<DocumentMetadata>> {
        sqlx::query_as::<_, DocumentMetadata>(
            "SELECT * FROM document_metadata WHERE file_name = ? AND bucket = ?",
        )
        .bind(file_name)
        .bind(bucket)
        .fetch_optional(&self.pool)
        .await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::storage::models::{message_type, role};
    use tempfile::TempDir;

    /// テスト用の一時DBを作成する。メモリDBはプール接続ごとに分かれてしまうためファイルを使う
    pub(crate) async fn test_db() -> (Database, TempDir) {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.db");
        let url = format!("sqlite://{}", path.display());
        let db = Database::new(&url).await.unwrap();
        db.init_schema().await.unwrap();
        (db, dir)
    }

    pub(crate) async fn seed_room(db: &Database, user_id: &str) -> i64 {
        sqlx::query("INSERT INTO rooms (title, user_id) VALUES ('テスト', ?)")
            .bind(user_id)
            .execute(db.pool())
            .await
            .unwrap()
            .last_insert_rowid()
    }

    pub(crate) async fn seed_transcription(
        db: &Database,
        document_id: i64,
        file_name: &str,
        page: i64,
        text: &str,
    ) {
        sqlx::query(
            "INSERT INTO document_transcriptions (document_id, file_name, page, transcription) \
             VALUES (?, ?, ?, ?)",
        )
        .bind(document_id)
        .bind(file_name)
        .bind(page)
        .bind(text)
        .execute(db.pool())
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn transcriptions_come_back_page_ordered() {
        let (db, _dir) = test_db().await;
        seed_transcription(&db, 1, "biology.pdf", 3, "三ページ目").await;
        seed_transcription(&db, 1, "biology.pdf", 1, "一ページ目").await;
        seed_transcription(&db, 1, "biology.pdf", 2, "二ページ目").await;

        let rows = db
            .fetch_transcriptions_by_file("biology.pdf", 1, 3)
            .await
            .unwrap();
        let pages: Vec<i64> = rows.iter().map(|r| r.page).collect();
        assert_eq!(pages, vec![1, 2, 3]);
    }

    #[tokio::test]
    async fn message_roundtrip_preserves_order() {
        let (db, _dir) = test_db().await;
        let room_id = seed_room(&db, "u1").await;

        for text in ["一", "二", "三"] {
            db.insert_message(&Message::text(room_id, role::USER, text))
                .await
                .unwrap();
        }

        let messages = db.fetch_room_messages(room_id).await.unwrap();
        let contents: Vec<&str> = messages.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(contents, vec!["一", "二", "三"]);
        assert!(messages.iter().all(|m| m.message_type == message_type::TEXT));
    }

    #[tokio::test]
    async fn document_metadata_upsert_refreshes_pages() {
        let (db, _dir) = test_db().await;
        db.insert_document_metadata("u1/a.pdf", "documents", 1000, 10)
            .await
            .unwrap();
        db.insert_document_metadata("u1/a.pdf", "documents", 2000, 12)
            .await
            .unwrap();

        let meta = db
            .get_document_metadata("u1/a.pdf", "documents")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(meta.total_pages, 12);
        assert_eq!(meta.file_size, Some(2000));
        assert_eq!(meta.status, "unprocessed");
    }

    #[tokio::test]
    async fn instant_report_create_is_idempotent() {
        let (db, _dir) = test_db().await;
        db.create_instant_report("u1").await.unwrap();
        db.create_instant_report("u1").await.unwrap();

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM user_instant_reports WHERE user_id = 'u1'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count, 1);

        let report = db.get_instant_report("u1").await.unwrap().unwrap();
        assert_eq!(report.content, "");
    }
}
