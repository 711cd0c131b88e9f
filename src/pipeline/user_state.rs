use serde_json::json;

use crate::storage::Database;
use crate::utils::AppResult;

/// インスタントレポートを取得する。未作成なら空レポート行を作ってから空文字を返す。
/// 「行なし」は失敗ではなく空の成功として扱う
pub async fn get_or_create_instant_report(db: &Database, user_id: &str) -> AppResult<String> {
    match db.get_instant_report(user_id).await? {
        Some(report) => Ok(report.content),
        None => {
            db.create_instant_report(user_id).await?;
            Ok(String::new())
        }
    }
}

/// ユーザー状態からシステム指示文を組み立てる。
/// レポートと科目設定はそれぞれ独立した任意の寄与で、欠けていてもエラーにしない
pub async fn build_system_instruction(db: &Database, user_id: &str) -> AppResult<String> {
    let mut instruction = String::new();

    let report = get_or_create_instant_report(db, user_id).await?;
    if !report.trim().is_empty() {
        instruction.push_str(&format_report_instruction(&report));
    }

    if let Some(settings_json) = build_settings_json(db, user_id).await? {
        instruction.push_str(&format!(
            "ユーザーが自己申告した科目ごとの理解度は以下の通りです（level: 1〜5）：\n{}\nこの申告レベルも説明の深さの調整に利用してください。\n",
            settings_json
        ));
    }

    Ok(instruction)
}

fn format_report_instruction(report: &str) -> String {
    format!(
        "以下のユーザーの学習状況を考慮して、適切なレベルの回答を提供してください：\n{}\n\n\
         回答の際は以下の点に注意してください：\n\
         1. ユーザーの現在の理解度に合わせた説明を心がける\n\
         2. 必要に応じて基礎的な概念から説明する\n\
         3. 専門用語は適切に説明を加える\n\
         4. ユーザーの学習進捗に合わせた難易度で回答する\n",
        report
    )
}

/// 科目設定を {subject: {level, explanation, fields: [...]}} のJSONに直列化する。
/// 設定がなければNone
async fn build_settings_json(db: &Database, user_id: &str) -> AppResult<Option<String>> {
    let settings = db.fetch_chat_settings(user_id).await?;
    if settings.is_empty() {
        return Ok(None);
    }

    let mut subjects = serde_json::Map::new();
    for setting in settings {
        let subs = db.fetch_chat_settings_sub(setting.id).await?;
        let fields: Vec<serde_json::Value> = subs
            .iter()
            .map(|s| {
                json!({
                    "field": s.field,
                    "level": s.level,
                    "explanation": s.explanation,
                })
            })
            .collect();

        subjects.insert(
            setting.subject.clone(),
            json!({
                "level": setting.level,
                "explanation": setting.explanation,
                "fields": fields,
            }),
        );
    }

    Ok(Some(serde_json::to_string_pretty(&subjects)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::tests::test_db;

    #[tokio::test]
    async fn new_user_yields_empty_contribution_and_one_row() {
        let (db, _dir) = test_db().await;

        let instruction = build_system_instruction(&db, "u1").await.unwrap();
        assert_eq!(instruction, "");

        // 2回目の呼び出しでも行は増えない
        let instruction = build_system_instruction(&db, "u1").await.unwrap();
        assert_eq!(instruction, "");

        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM user_instant_reports WHERE user_id = 'u1'")
                .fetch_one(db.pool())
                .await
                .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn report_and_settings_both_contribute() {
        let (db, _dir) = test_db().await;
        db.create_instant_report("u1").await.unwrap();
        db.update_instant_report("u1", "微分の基礎は理解済み").await.unwrap();

        let setting_id: i64 = sqlx::query(
            "INSERT INTO user_chat_settings (user_id, subject, level, explanation) \
             VALUES ('u1', '数学', 3, '教科書レベルは解ける')",
        )
        .execute(db.pool())
        .await
        .unwrap()
        .last_insert_rowid();
        sqlx::query(
            "INSERT INTO user_chat_settings_sub (setting_id, field, level, explanation) \
             VALUES (?, '微分積分', 4, '')",
        )
        .bind(setting_id)
        .execute(db.pool())
        .await
        .unwrap();

        let instruction = build_system_instruction(&db, "u1").await.unwrap();
        assert!(instruction.contains("微分の基礎は理解済み"));
        assert!(instruction.contains("\"数学\""));
        assert!(instruction.contains("\"微分積分\""));
        assert!(instruction.contains("\"level\": 3"));
    }

    #[tokio::test]
    async fn settings_only_user_gets_settings_block_only() {
        let (db, _dir) = test_db().await;
        sqlx::query(
            "INSERT INTO user_chat_settings (user_id, subject, level, explanation) \
             VALUES ('u2', '物理', 2, '')",
        )
        .execute(db.pool())
        .await
        .unwrap();

        let instruction = build_system_instruction(&db, "u2").await.unwrap();
        assert!(!instruction.contains("学習状況を考慮して"));
        assert!(instruction.contains("\"物理\""));
    }
}
