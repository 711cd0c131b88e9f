use tracing::info;

use crate::gemini::{GeminiClient, Part};
use crate::pipeline::{history, transcription, user_state};
use crate::storage::Database;
use crate::utils::{AppError, AppResult};

/// ルームの会話履歴からインスタントレポートを更新する。
/// 前回の内容をプロンプトに含めてモデルの続きで上書きする（追記方式）。
/// 同一ユーザーへの同時実行はlast-write-wins
pub async fn analyze_room(
    db: &Database,
    gemini: &GeminiClient,
    room_id: i64,
    user_id: &str,
) -> AppResult<()> {
    let chat_history = history::load_room_history_basic(db, room_id).await?;
    let current_report = user_state::get_or_create_instant_report(db, user_id).await?;

    let prompt = format!(
        "この会話履歴をもとに、ユーザーの学習状況を、前回の分析内容に付け足してください。\n\
         前回の分析内容：\n{}",
        current_report
    );

    let reply = gemini
        .send_chat(
            &gemini.config().analysis_model,
            None,
            chat_history,
            vec![Part::text(prompt)],
            None,
        )
        .await?;

    if reply.text.trim().is_empty() {
        return Err(AppError::Generation("Geminiの応答が空です".to_string()));
    }

    db.update_instant_report(user_id, &reply.text)
        .await
        .map_err(|e| AppError::Persistence(e.to_string()))?;

    info!("インスタントレポートを更新しました (user={})", user_id);
    Ok(())
}

/// 投稿内容からその日のデイリーレポートに分析を追記する
pub async fn analyze_post(
    db: &Database,
    gemini: &GeminiClient,
    post_id: i64,
    user_id: &str,
) -> AppResult<()> {
    let post = db
        .get_post(post_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("投稿が見つかりません: {}", post_id)))?;

    let context =
        transcription::fetch_post_context(db, post.document_id, post.start_page, post.end_page)
            .await?;

    let prompt = format!(
        "ユーザーの学習記録やコメントをもとに、以下の観点から学力を多角的に分析してください：\n\
         - 知識の定着度\n\
         - 応用力\n\
         - 課題点や今後の伸びしろ\n\
         - 学習姿勢やモチベーション\n\
         - その他気づいた点\n\n\
         300〜500文字程度で、具体的かつ前向きなフィードバックをお願いします。\n\n\
         【ユーザーのコメント】\n{}\n\n\
         【教科書の内容】\n{}",
        post.comment, context
    );

    let analysis = gemini
        .generate_content(&gemini.config().analysis_model, vec![Part::text(prompt)], None)
        .await?;

    append_daily_report(db, user_id, &analysis).await?;
    info!("デイリーレポートに分析を追記しました (user={})", user_id);
    Ok(())
}

/// 今日のデイリーレポート行に分析文字列を追記する。行がなければ作る
async fn append_daily_report(db: &Database, user_id: &str, analysis: &str) -> AppResult<()> {
    let today = chrono::Utc::now().format("%Y-%m-%d").to_string();

    match db.get_daily_report(user_id, &today).await? {
        Some(report) => {
            let mut entries: Vec<String> =
                serde_json::from_str(&report.daily_report).unwrap_or_default();
            entries.push(analysis.to_string());
            db.update_daily_report(report.id, &serde_json::to_string(&entries)?)
                .await
                .map_err(|e| AppError::Persistence(e.to_string()))?;
        }
        None => {
            let entries = serde_json::to_string(&vec![analysis])?;
            db.insert_daily_report(user_id, &today, &entries)
                .await
                .map_err(|e| AppError::Persistence(e.to_string()))?;
        }
    }
    Ok(())
}
