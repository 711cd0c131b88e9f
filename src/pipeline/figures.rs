use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::AppConfig;
use crate::gemini::{GeminiClient, GenerationConfig, Part};
use crate::storage::models::{message_type, role, Message};
use crate::storage::Database;
use crate::utils::{AppError, AppResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Figure {
    #[serde(rename = "type")]
    pub figure_type: String,
    pub title: String,
    pub description: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
    #[serde(rename = "imageUrl", default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct AnalysisPayload {
    #[serde(rename = "processedText")]
    processed_text: Vec<String>,
    #[serde(default)]
    figures: Vec<Figure>,
}

#[derive(Debug, Deserialize)]
struct CodePayload {
    code: String,
}

/// 図分析の結果。パース失敗は例外ではなく明示的なフォールバック
#[derive(Debug)]
pub enum FigureAnalysis {
    Parsed {
        processed_text: Vec<String>,
        figures: Vec<Figure>,
    },
    /// 元テキストをそのまま使う（図なし）
    Fallback,
}

/// 完成した解答を分析し、図を挿入すべき箇所と図の仕様を得る。
/// JSONの形が崩れていても失敗にせずフォールバックする
pub async fn analyze_figures(gemini: &GeminiClient, answer: &str) -> FigureAnalysis {
    let prompt = format!(
        "以下の解答・解説を分析し、図を用いた方が理解しやすい箇所を特定してください。\n\
         そして、その箇所に適切な図のタイトルと種類を生成してください。\n\n\
         図の種類の判断基準：\n\
         - matplotlib: 数学的なグラフ、関数のプロット、統計データの可視化など\n\
         - canvas: アニメーションや動的な図、インタラクティブな要素が必要な場合\n\
         - svg: 概念図、構造図、シンプルな説明図など\n\n\
         応答は必ず有効なJSONのみで返してください：\n\
         {{\n\
           \"processedText\": [\"テキスト1\", \"テキスト2\"],\n\
           \"figures\": [{{ \"type\": \"matplotlib\", \"title\": \"図1: タイトル\", \"description\": \"図の生成プロンプト\" }}]\n\
         }}\n\n\
         processedTextは元のテキストを図の挿入位置で分解した配列で、\n\
         要素数は必ずfiguresの数+1になります。\n\n\
         解答・解説：\n{answer}",
    );

    let response = match gemini
        .generate_content(
            &gemini.config().figure_model,
            vec![Part::text(prompt)],
            Some(GenerationConfig::json()),
        )
        .await
    {
        Ok(text) => text,
        Err(e) => {
            warn!("図分析の呼び出しに失敗、図なしで続行: {}", e);
            return FigureAnalysis::Fallback;
        }
    };

    parse_analysis(&response)
}

/// 図分析応答をパースする。processedText.len() == figures.len() + 1 の
/// 不変条件を満たさないものはパース失敗として扱う
pub fn parse_analysis(response: &str) -> FigureAnalysis {
    // JSONの前後に余計な文字列が付くことがあるためJSON部分のみ抜き出す
    let json_re = Regex::new(r"(?s)\{.*\}").unwrap();
    let json_text = match json_re.find(response) {
        Some(m) => m.as_str(),
        None => {
            warn!("図分析応答にJSONが含まれていません");
            return FigureAnalysis::Fallback;
        }
    };

    let payload: AnalysisPayload = match serde_json::from_str(json_text) {
        Ok(p) => p,
        Err(e) => {
            warn!("図分析応答のJSONパースに失敗: {}", e);
            return FigureAnalysis::Fallback;
        }
    };

    if payload.processed_text.len() != payload.figures.len() + 1 {
        warn!(
            "図分析応答の形が不正 (processedText={}, figures={})",
            payload.processed_text.len(),
            payload.figures.len()
        );
        return FigureAnalysis::Fallback;
    }

    FigureAnalysis::Parsed {
        processed_text: payload.processed_text,
        figures: payload.figures,
    }
}

/// 図の種類に応じたソースコードを生成する
pub async fn generate_figure_code(gemini: &GeminiClient, figure: &Figure) -> AppResult<String> {
    let requirements = match figure.figure_type.as_str() {
        "matplotlib" => {
            "要件:\n\
             - import matplotlib.pyplot as plt / import numpy as np（必要に応じて）\n\
             - 完全に実行可能なコード。plt.show()は使用しない（画像として保存するため）\n\
             - 日本語ラベル対応、適切な軸ラベル・タイトル・凡例\n\
             - LaTeX数式は必ずraw文字列（r\"$...$\"）を使用する\n\n\
             JSON形式で出力してください:\n{ \"code\": \"import matplotlib.pyplot as plt\\n...\" }"
        }
        "canvas" => {
            "要件:\n\
             - Canvasタグとスクリプトを含む完全なHTML構造\n\
             - インタラクティブまたはアニメーション機能\n\
             - 日本語対応\n\n\
             JSON形式で出力してください:\n{ \"code\": \"<canvas id='canvas' width='400' height='300'></canvas>\\n<script>...</script>\" }"
        }
        "svg" => {
            "要件:\n\
             - viewBox設定を含む完全なSVG要素\n\
             - 適切な色とスタイル、日本語テキスト対応\n\n\
             JSON形式で出力してください:\n{ \"code\": \"<svg viewBox='0 0 400 300' xmlns='http://www.w3.org/2000/svg'>...</svg>\" }"
        }
        other => {
            return Err(AppError::Validation(format!(
                "未対応の図タイプです: {}",
                other
            )));
        }
    };

    let prompt = format!(
        "以下の要求に基づいて、{}のコードを生成してください。\n\n\
         タイトル: {}\n説明: {}\n\n{}",
        figure.figure_type, figure.title, figure.description, requirements
    );

    let response = gemini
        .generate_content(
            &gemini.config().code_model,
            vec![Part::text(prompt)],
            Some(GenerationConfig::json()),
        )
        .await?;

    let payload: CodePayload = serde_json::from_str(extract_json(&response))?;
    Ok(payload.code)
}

fn extract_json(response: &str) -> &str {
    let json_re = Regex::new(r"(?s)\{.*\}").unwrap();
    json_re
        .find(response)
        .map(|m| m.as_str())
        .unwrap_or(response)
}

#[derive(Serialize)]
struct RenderRequest<'a> {
    code: &'a str,
    room_id: i64,
    filename: String,
}

#[derive(Deserialize)]
struct RenderResponse {
    status: String,
    #[serde(default)]
    download_url: Option<String>,
    #[serde(default)]
    error: Option<String>,
}

/// matplotlibコードを外部描画サービスに送って画像URLを得る。
/// 描画失敗は図自体を落とさない（コード表示で代替するためNoneを返す）
pub async fn render_matplotlib(
    http: &reqwest::Client,
    renderer_url: &str,
    code: &str,
    room_id: i64,
    title: &str,
) -> Option<String> {
    if renderer_url.is_empty() {
        return None;
    }

    let filename: String = title
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '_' })
        .collect();
    let request = RenderRequest { code, room_id, filename };

    let response = match http.post(renderer_url).json(&request).send().await {
        Ok(r) => r,
        Err(e) => {
            warn!("描画サービス呼び出しに失敗: {}", e);
            return None;
        }
    };

    let status = response.status();
    if !status.is_success() {
        warn!("描画サービスがエラーを返しました: {}", status);
        return None;
    }

    let result: RenderResponse = match response.json().await {
        Ok(r) => r,
        Err(e) => {
            warn!("描画サービス応答の解析に失敗: {}", e);
            return None;
        }
    };

    if result.status == "success" {
        result.download_url
    } else {
        warn!(
            "描画サービスが失敗を報告: {}",
            result.error.unwrap_or_else(|| "不明なエラー".to_string())
        );
        None
    }
}

/// processedTextと図タイトルのリンクを交互に連結して最終メッセージを作る
pub fn compose_message(processed_text: &[String], figures: &[Figure]) -> String {
    let mut message = String::new();
    for (i, text) in processed_text.iter().enumerate() {
        message.push_str(text);
        if i < figures.len() {
            message.push_str(&format!(
                "\n<a href=\"#figure-{i}\" data-figure-index=\"{i}\">{}</a>\n",
                figures[i].title
            ));
        }
    }
    message
}

/// 図生成ジョブ本体。元の解答は保存済みなので、ここでの失敗はすべて非致命
pub async fn run_figure_job(
    db: &Database,
    gemini: &GeminiClient,
    http: &reqwest::Client,
    config: &AppConfig,
    room_id: i64,
    original_message_id: i64,
    answer: &str,
) -> AppResult<()> {
    let (processed_text, mut figures) = match analyze_figures(gemini, answer).await {
        FigureAnalysis::Parsed { processed_text, figures } if !figures.is_empty() => {
            (processed_text, figures)
        }
        _ => {
            info!("図の挿入は不要と判断 (message_id={})", original_message_id);
            return Ok(());
        }
    };

    for figure in figures.iter_mut() {
        match generate_figure_code(gemini, figure).await {
            Ok(code) => {
                if figure.figure_type == "matplotlib" {
                    figure.image_url = render_matplotlib(
                        http,
                        &config.figures.renderer_url,
                        &code,
                        room_id,
                        &figure.title,
                    )
                    .await;
                }
                figure.code = Some(code);
            }
            Err(e) => {
                warn!("図コード生成に失敗 ({}): {}", figure.title, e);
            }
        }
    }

    let content = compose_message(&processed_text, &figures);
    let mut message = Message::text(room_id, role::MODEL, content);
    message.message_type = message_type::TEXT_WITH_FIGURES.to_string();
    message.figures = Some(serde_json::to_string(&figures)?);
    message.original_message_id = Some(original_message_id);

    db.insert_message(&message)
        .await
        .map_err(|e| AppError::Persistence(e.to_string()))?;

    info!(
        "図付きメッセージを保存しました (room={}, figures={})",
        room_id,
        figures.len()
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn analysis_with_matching_lengths_parses() {
        let response = r#"{
            "processedText": ["前半", "後半"],
            "figures": [{ "type": "svg", "title": "図1: 構造図", "description": "細胞の構造" }]
        }"#;

        match parse_analysis(response) {
            FigureAnalysis::Parsed { processed_text, figures } => {
                assert_eq!(processed_text, vec!["前半", "後半"]);
                assert_eq!(figures.len(), 1);
                assert_eq!(figures[0].figure_type, "svg");
            }
            FigureAnalysis::Fallback => panic!("parsed expected"),
        }
    }

    #[test]
    fn length_mismatch_falls_back() {
        // processedTextはfigures+1要素でなければならない
        let response = r#"{
            "processedText": ["唯一の要素"],
            "figures": [{ "type": "svg", "title": "図1", "description": "d" }]
        }"#;
        assert!(matches!(parse_analysis(response), FigureAnalysis::Fallback));
    }

    #[test]
    fn malformed_json_falls_back() {
        assert!(matches!(
            parse_analysis("図は不要だと思います。"),
            FigureAnalysis::Fallback
        ));
        assert!(matches!(
            parse_analysis("{ \"processedText\": [1, 2] }"),
            FigureAnalysis::Fallback
        ));
    }

    #[test]
    fn json_is_extracted_from_surrounding_prose() {
        let response = "以下が分析結果です：\n{ \"processedText\": [\"a\", \"b\"], \"figures\": [{ \"type\": \"matplotlib\", \"title\": \"図1\", \"description\": \"d\" }] }\n以上です。";
        assert!(matches!(
            parse_analysis(response),
            FigureAnalysis::Parsed { .. }
        ));
    }

    #[test]
    fn message_interleaves_text_and_figure_links() {
        let processed = vec!["説明の前半".to_string(), "説明の後半".to_string()];
        let figures = vec![Figure {
            figure_type: "svg".to_string(),
            title: "図1: 概念図".to_string(),
            description: "d".to_string(),
            code: None,
            image_url: None,
        }];

        let message = compose_message(&processed, &figures);
        assert_eq!(
            message,
            "説明の前半\n<a href=\"#figure-0\" data-figure-index=\"0\">図1: 概念図</a>\n説明の後半"
        );
    }
}
