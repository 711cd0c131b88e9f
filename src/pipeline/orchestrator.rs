use serde::Deserialize;
use tracing::info;

use crate::config::AppConfig;
use crate::gemini::{GeminiClient, Part, practice_question_tool};
use crate::pipeline::{history, media, transcription, user_state};
use crate::storage::models::{role, Message};
use crate::storage::{Database, ObjectStore};
use crate::tasks::{Job, TaskQueue};
use crate::utils::{AppError, AppResult};

/// 探究学習モード時の家庭教師プロンプト
const TUTOR_INSTRUCTION: &str =
    "あなたは、生徒一人ひとりに寄り添う、非常に優秀で忍耐強いAI家庭教師です。\
     あなたの使命は、生徒が学習内容を深く理解し、「自力で問題を解く力」を身につける手助けをすることです。\
     単に答えを教えるのではなく、生徒の思考を促し、学習のパートナーとして振る舞ってください。\
     対話の基本はポジティブな姿勢です。生徒の質問や試みを「良い質問だね！」「そこまで考えられたのは素晴らしい！」のように、\
     まず褒めてから対話を開始してください。";

/// ルームの最新ユーザーターンに対する応答を生成して保存する
pub async fn generate_room_response(
    db: &Database,
    gemini: &GeminiClient,
    store: &ObjectStore,
    queue: &TaskQueue,
    config: &AppConfig,
    room_id: i64,
) -> AppResult<()> {
    let room = db
        .get_room(room_id)
        .await?
        .ok_or_else(|| AppError::NotFound(format!("ルームが見つかりません: {}", room_id)))?;

    let bundle = history::load_room_history_rich(db, room_id).await?;

    let mut system_instruction = String::new();
    if room.interactive {
        system_instruction.push_str(TUTOR_INSTRUCTION);
        system_instruction.push('\n');
    }
    system_instruction.push_str(&user_state::build_system_instruction(db, &room.user_id).await?);

    // 添付ファイルは出現順に解決する。1件の失敗で応答全体は止めない
    let inline_parts =
        media::resolve_all_media(store, &config.storage.chat_bucket, &bundle.media).await;

    let answer = if inline_parts.is_empty() {
        // 通常はマルチターンのチャット呼び出し。類題生成ツールを提示する
        let reply = gemini
            .send_chat(
                &gemini.config().chat_model,
                Some(&system_instruction),
                bundle.history,
                bundle.new_turn,
                Some(vec![practice_question_tool()]),
            )
            .await?;

        match reply.function_call {
            Some(call) if call.name == "generate_similar_question" => {
                let question = call.args["question"].as_str().ok_or_else(|| {
                    AppError::ToolResultParse("ツール引数questionがありません".to_string())
                })?;
                let answer = call.args["answer"].as_str().ok_or_else(|| {
                    AppError::ToolResultParse("ツール引数answerがありません".to_string())
                })?;
                gemini.generate_similar_question(question, answer).await?
            }
            Some(call) => {
                return Err(AppError::ToolResultParse(format!(
                    "未知のツール呼び出し: {}",
                    call.name
                )));
            }
            None => {
                if reply.text.trim().is_empty() {
                    return Err(AppError::Generation("モデルの応答が空です".to_string()));
                }
                reply.text
            }
        }
    } else {
        // インライン添付を含む呼び出しはマルチターン形式を受け付けないため、
        // 履歴を説明文ブロックに平坦化して単発呼び出しにする
        let mut parts = Vec::new();
        let mut preamble = String::new();
        if !system_instruction.is_empty() {
            preamble.push_str(&system_instruction);
            preamble.push_str("\n\n");
        }
        preamble.push_str(&history::flatten_history(&bundle.history));
        if !preamble.is_empty() {
            parts.push(Part::text(preamble));
        }
        parts.extend(inline_parts);
        parts.extend(bundle.new_turn);

        gemini
            .generate_content(&gemini.config().chat_model, parts, None)
            .await?
    };

    let message_id = db
        .insert_message(&Message::text(room_id, role::MODEL, answer.clone()))
        .await
        .map_err(|e| AppError::Persistence(e.to_string()))?;

    info!("モデル応答を保存しました (room={}, message={})", room_id, message_id);

    // 後続処理はキュー経由の非同期実行。失敗してもこのリクエストは成功のまま
    queue.submit(Job::AnalyzeRoom { room_id, user_id: room.user_id });
    if config.figures.enabled {
        queue.submit(Job::GenerateFigures {
            room_id,
            original_message_id: message_id,
            answer,
        });
    }

    Ok(())
}

/// generate-post-responseのリクエスト本文
#[derive(Debug, Clone, Deserialize)]
pub struct PostPayload {
    pub id: i64,
    pub document_id: i64,
    pub start_page: i64,
    pub end_page: i64,
    pub comment: String,
    pub user_id: String,
}

impl PostPayload {
    pub fn validate(&self) -> AppResult<()> {
        if self.comment.trim().is_empty() {
            return Err(AppError::Validation("コメントが必要です".to_string()));
        }
        transcription::validate_page_range(self.start_page, self.end_page)
    }
}

/// 投稿への返信を生成して保存する
pub async fn generate_post_response(
    db: &Database,
    gemini: &GeminiClient,
    queue: &TaskQueue,
    post: &PostPayload,
) -> AppResult<()> {
    post.validate()?;

    let context =
        transcription::fetch_post_context(db, post.document_id, post.start_page, post.end_page)
            .await?;

    let prompt = format!(
        "以下は教科書の内容です：\n\n{}\n\n\
         ユーザーのコメント：\n{}\n\n\
         上記の教科書の内容に関するユーザーのコメントについて、以下の点を踏まえて返信してください：\n\
         1. 教科書の内容を参照しながら、具体的に説明する\n\
         2. ユーザーの理解を深めるような質問や補足を含める\n\
         3. 友好的で励ましになるような口調を使用する\n\
         4. 必要に応じて、教科書の特定の箇所を引用する\n\
         5. 返信は300-500文字程度に収める",
        context, post.comment
    );

    let answer = gemini
        .generate_content(&gemini.config().chat_model, vec![Part::text(prompt)], None)
        .await?;

    db.insert_post_message(post.id, role::ASSISTANT, &answer)
        .await
        .map_err(|e| AppError::Persistence(e.to_string()))?;

    info!("投稿への返信を保存しました (post={})", post.id);

    queue.submit(Job::AnalyzePost { post_id: post.id, user_id: post.user_id.clone() });
    Ok(())
}
