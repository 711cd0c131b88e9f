use tracing::warn;

use crate::gemini::{Content, Part};
use crate::pipeline::transcription;
use crate::storage::models::{message_type, role, PostMessage};
use crate::storage::Database;
use crate::utils::{AppError, AppResult};

/// 履歴中の添付ファイル参照。indexはプレースホルダ番号と対応する
#[derive(Debug, Clone)]
pub struct MediaRef {
    pub file_url: String,
    pub placeholder: String,
}

/// 応答生成用に組み立てた会話履歴
#[derive(Debug)]
pub struct HistoryBundle {
    /// 最後のターンを除いた履歴
    pub history: Vec<Content>,
    /// 送信すべき新規ターン（最後のユーザーメッセージ）
    pub new_turn: Vec<Part>,
    /// ルーム内の全添付ファイル。出現順
    pub media: Vec<MediaRef>,
}

fn to_gemini_role(db_role: &str) -> &'static str {
    if db_role == role::USER { "user" } else { "model" }
}

/// 基本ローダー: textタイプのみを {role, content} に写像する（分析フロー用）
pub async fn load_room_history_basic(db: &Database, room_id: i64) -> AppResult<Vec<Content>> {
    let messages = db.fetch_room_messages(room_id).await?;

    Ok(messages
        .iter()
        .filter(|m| m.message_type == message_type::TEXT && !m.content.trim().is_empty())
        .map(|m| Content {
            role: to_gemini_role(&m.role).to_string(),
            parts: vec![Part::text(m.content.clone())],
        })
        .collect())
}

/// 投稿スレッドを {role, content} に写像する
pub fn map_post_messages(messages: &[PostMessage]) -> Vec<Content> {
    messages
        .iter()
        .filter(|m| !m.content.trim().is_empty())
        .map(|m| Content {
            role: to_gemini_role(&m.role).to_string(),
            parts: vec![Part::text(m.content.clone())],
        })
        .collect()
}

/// リッチローダー: contextタイプは引用範囲を読み直して本文に前置し、
/// image/pdfタイプはプレースホルダ文字列に置き換える。
/// 最後のメッセージは履歴から除き、新規ターンとして返す
pub async fn load_room_history_rich(db: &Database, room_id: i64) -> AppResult<HistoryBundle> {
    let messages = db.fetch_room_messages(room_id).await?;

    let mut contents: Vec<Content> = Vec::new();
    let mut media: Vec<MediaRef> = Vec::new();
    let mut image_count = 0usize;
    let mut pdf_count = 0usize;

    for message in &messages {
        let gemini_role = to_gemini_role(&message.role).to_string();

        match message.message_type.as_str() {
            message_type::TEXT => {
                if message.content.trim().is_empty() {
                    continue;
                }
                contents.push(Content {
                    role: gemini_role,
                    parts: vec![Part::text(message.content.clone())],
                });
            }
            message_type::CONTEXT => {
                let text = match (&message.file_name, message.start_page, message.end_page) {
                    (Some(file_name), Some(start), Some(end)) => {
                        let context =
                            transcription::fetch_document_context(db, file_name, start, end)
                                .await?;
                        format!("{}{}", context, message.content)
                    }
                    _ => {
                        warn!("contextメッセージに引用情報がありません (id={:?})", message.id);
                        message.content.clone()
                    }
                };
                contents.push(Content { role: gemini_role, parts: vec![Part::text(text)] });
            }
            message_type::IMAGE | message_type::PDF => {
                let placeholder = if message.message_type == message_type::IMAGE {
                    image_count += 1;
                    format!("[添付画像{}]", image_count)
                } else {
                    pdf_count += 1;
                    format!("[添付PDF{}]", pdf_count)
                };

                if let Some(file_url) = &message.file_url {
                    media.push(MediaRef {
                        file_url: file_url.clone(),
                        placeholder: placeholder.clone(),
                    });
                } else {
                    warn!("添付メッセージにfile_urlがありません (id={:?})", message.id);
                }

                let text = if message.content.trim().is_empty() {
                    placeholder
                } else {
                    format!("{}\n{}", message.content, placeholder)
                };
                contents.push(Content { role: gemini_role, parts: vec![Part::text(text)] });
            }
            other => {
                // text_with_figures等の加工済みメッセージは履歴に含めない
                warn!("未対応のメッセージタイプを除外: {}", other);
            }
        }
    }

    let last = contents
        .pop()
        .ok_or_else(|| AppError::InvalidState("応答対象のメッセージがありません".to_string()))?;

    if last.role != "user" {
        return Err(AppError::InvalidState(
            "最後のメッセージがユーザーのものではありません".to_string(),
        ));
    }

    Ok(HistoryBundle { history: contents, new_turn: last.parts, media })
}

/// マルチターン履歴を単発呼び出し用の説明文ブロックに平坦化する。
/// インラインの添付ファイルを含む呼び出しは履歴付きチャット形式を受け付けないため
pub fn flatten_history(history: &[Content]) -> String {
    if history.is_empty() {
        return String::new();
    }

    let lines: Vec<String> = history
        .iter()
        .map(|c| {
            let speaker = if c.role == "user" { "ユーザー" } else { "AI" };
            format!("{}: {}", speaker, c.text())
        })
        .collect();

    format!(
        "これまでの会話：\n{}\n\n上記の会話の続きとして、以下に回答してください。\n\n",
        lines.join("\n")
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::database::tests::{seed_room, seed_transcription, test_db};
    use crate::storage::models::Message;

    async fn seed_text(db: &Database, room_id: i64, msg_role: &str, content: &str) {
        db.insert_message(&Message::text(room_id, msg_role, content))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn order_is_preserved_and_last_turn_split_off() {
        let (db, _dir) = test_db().await;
        let room_id = seed_room(&db, "u1").await;
        seed_text(&db, room_id, role::USER, "光合成とは？").await;
        seed_text(&db, room_id, role::MODEL, "光合成は植物が光エネルギーを使う反応です。").await;
        seed_text(&db, room_id, role::USER, "もっと詳しく").await;

        let bundle = load_room_history_rich(&db, room_id).await.unwrap();
        assert_eq!(bundle.history.len(), 2);
        assert_eq!(bundle.history[0].role, "user");
        assert_eq!(bundle.history[0].text(), "光合成とは？");
        assert_eq!(bundle.history[1].role, "model");
        assert_eq!(bundle.new_turn[0].text.as_deref(), Some("もっと詳しく"));
        assert!(bundle.media.is_empty());
    }

    #[tokio::test]
    async fn single_message_room_yields_empty_history() {
        let (db, _dir) = test_db().await;
        let room_id = seed_room(&db, "u1").await;
        seed_text(&db, room_id, role::USER, "はじめまして").await;

        let bundle = load_room_history_rich(&db, room_id).await.unwrap();
        assert!(bundle.history.is_empty());
        assert_eq!(bundle.new_turn[0].text.as_deref(), Some("はじめまして"));
        assert!(bundle.media.is_empty());
    }

    #[tokio::test]
    async fn empty_room_is_invalid_state() {
        let (db, _dir) = test_db().await;
        let room_id = seed_room(&db, "u1").await;
        let err = load_room_history_rich(&db, room_id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn last_turn_must_be_from_user() {
        let (db, _dir) = test_db().await;
        let room_id = seed_room(&db, "u1").await;
        seed_text(&db, room_id, role::USER, "質問").await;
        seed_text(&db, room_id, role::MODEL, "回答").await;

        let err = load_room_history_rich(&db, room_id).await.unwrap_err();
        assert!(matches!(err, AppError::InvalidState(_)));
    }

    #[tokio::test]
    async fn context_message_is_reresolved_at_read_time() {
        let (db, _dir) = test_db().await;
        let room_id = seed_room(&db, "u1").await;
        seed_transcription(&db, 1, "math.pdf", 2, "二次関数").await;
        seed_transcription(&db, 1, "math.pdf", 3, "判別式").await;

        let mut context_msg = Message::text(room_id, role::USER, "この範囲を説明して");
        context_msg.message_type = message_type::CONTEXT.to_string();
        context_msg.file_name = Some("math.pdf".to_string());
        context_msg.start_page = Some(2);
        context_msg.end_page = Some(3);
        db.insert_message(&context_msg).await.unwrap();

        let bundle = load_room_history_rich(&db, room_id).await.unwrap();
        let direct = transcription::fetch_document_context(&db, "math.pdf", 2, 3)
            .await
            .unwrap();
        let turn_text = bundle.new_turn[0].text.clone().unwrap();
        assert!(turn_text.starts_with(&direct));
        assert!(turn_text.ends_with("この範囲を説明して"));
    }

    #[tokio::test]
    async fn media_messages_become_placeholders() {
        let (db, _dir) = test_db().await;
        let room_id = seed_room(&db, "u1").await;

        let mut image_msg = Message::text(room_id, role::USER, "この図を見てください");
        image_msg.message_type = message_type::IMAGE.to_string();
        image_msg.file_url = Some("u1/fig.png".to_string());
        db.insert_message(&image_msg).await.unwrap();
        seed_text(&db, room_id, role::MODEL, "拝見しました。").await;
        seed_text(&db, room_id, role::USER, "説明して").await;

        let bundle = load_room_history_rich(&db, room_id).await.unwrap();
        assert_eq!(bundle.history[0].text(), "この図を見てください\n[添付画像1]");
        assert_eq!(bundle.media.len(), 1);
        assert_eq!(bundle.media[0].file_url, "u1/fig.png");
        assert_eq!(bundle.media[0].placeholder, "[添付画像1]");
    }

    #[tokio::test]
    async fn basic_loader_includes_only_text_messages() {
        let (db, _dir) = test_db().await;
        let room_id = seed_room(&db, "u1").await;
        seed_text(&db, room_id, role::USER, "テキスト").await;

        let mut image_msg = Message::text(room_id, role::USER, "画像付き");
        image_msg.message_type = message_type::IMAGE.to_string();
        image_msg.file_url = Some("u1/fig.png".to_string());
        db.insert_message(&image_msg).await.unwrap();

        let history = load_room_history_basic(&db, room_id).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].text(), "テキスト");
    }

    #[test]
    fn flatten_prefixes_roles() {
        let history = vec![
            Content::user(vec![Part::text("質問です")]),
            Content::model(vec![Part::text("回答です")]),
        ];
        let flat = flatten_history(&history);
        assert!(flat.contains("ユーザー: 質問です\nAI: 回答です"));
        assert_eq!(flatten_history(&[]), "");
    }
}
