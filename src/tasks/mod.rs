use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::gemini::GeminiClient;
use crate::pipeline::{analysis, figures};
use crate::storage::Database;
use crate::utils::AppResult;

/// 応答生成後の二次処理ジョブ。
/// fire-and-forgetなHTTP呼び出しの代わりに明示的なキューで扱う
#[derive(Debug)]
pub enum Job {
    AnalyzeRoom {
        room_id: i64,
        user_id: String,
    },
    AnalyzePost {
        post_id: i64,
        user_id: String,
    },
    GenerateFigures {
        room_id: i64,
        original_message_id: i64,
        answer: String,
    },
}

impl Job {
    fn label(&self) -> &'static str {
        match self {
            Job::AnalyzeRoom { .. } => "analyze_room",
            Job::AnalyzePost { .. } => "analyze_post",
            Job::GenerateFigures { .. } => "generate_figures",
        }
    }
}

#[derive(Clone)]
pub struct TaskQueue {
    tx: mpsc::UnboundedSender<Job>,
}

impl TaskQueue {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<Job>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    /// ジョブを投入して即座に戻る。投入失敗（ワーカー停止後）はログのみ
    pub fn submit(&self, job: Job) {
        let label = job.label();
        if self.tx.send(job).is_err() {
            warn!("ワーカー停止のためジョブを破棄しました: {}", label);
        }
    }
}

/// ワーカーがジョブ実行に使う依存一式
pub struct JobContext {
    pub db: Arc<Database>,
    pub gemini: Arc<GeminiClient>,
    pub http: reqwest::Client,
    pub config: Arc<AppConfig>,
}

/// ジョブを順に消化するワーカーを起動する。
/// ジョブの失敗は記録するだけで、元のリクエストには影響しない
pub fn spawn_worker(
    mut rx: mpsc::UnboundedReceiver<Job>,
    ctx: JobContext,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        info!("タスクワーカー起動");
        while let Some(job) = rx.recv().await {
            let label = job.label();
            if let Err(e) = run_job(&ctx, job).await {
                warn!("ジョブ失敗 ({}): {}", label, e);
            }
        }
        info!("タスクワーカー終了");
    })
}

async fn run_job(ctx: &JobContext, job: Job) -> AppResult<()> {
    match job {
        Job::AnalyzeRoom { room_id, user_id } => {
            analysis::analyze_room(&ctx.db, &ctx.gemini, room_id, &user_id).await
        }
        Job::AnalyzePost { post_id, user_id } => {
            analysis::analyze_post(&ctx.db, &ctx.gemini, post_id, &user_id).await
        }
        Job::GenerateFigures { room_id, original_message_id, answer } => {
            figures::run_figure_job(
                &ctx.db,
                &ctx.gemini,
                &ctx.http,
                &ctx.config,
                room_id,
                original_message_id,
                &answer,
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn submitted_jobs_arrive_in_order() {
        let (queue, mut rx) = TaskQueue::new();
        queue.submit(Job::AnalyzeRoom { room_id: 1, user_id: "u1".to_string() });
        queue.submit(Job::AnalyzePost { post_id: 2, user_id: "u1".to_string() });

        assert!(matches!(rx.recv().await.unwrap(), Job::AnalyzeRoom { room_id: 1, .. }));
        assert!(matches!(rx.recv().await.unwrap(), Job::AnalyzePost { post_id: 2, .. }));
    }

    #[tokio::test]
    async fn submit_after_worker_shutdown_is_silently_dropped() {
        let (queue, rx) = TaskQueue::new();
        drop(rx);
        // パニックせずログだけ残して戻ること
        queue.submit(Job::AnalyzeRoom { room_id: 1, user_id: "u1".to_string() });
    }
}
