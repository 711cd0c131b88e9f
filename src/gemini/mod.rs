use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::GeminiConfig;
use crate::utils::{AppError, AppResult};

/// Gemini API リクエスト/レスポンスの型定義
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Content {
    pub role: String,
    pub parts: Vec<Part>,
}

impl Content {
    pub fn user(parts: Vec<Part>) -> Self {
        Self { role: "user".to_string(), parts }
    }

    pub fn model(parts: Vec<Part>) -> Self {
        Self { role: "model".to_string(), parts }
    }

    /// パーツ中のテキストを連結して返す
    pub fn text(&self) -> String {
        self.parts
            .iter()
            .filter_map(|p| p.text.as_deref())
            .collect::<Vec<_>>()
            .join("")
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Part {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(rename = "inlineData", skip_serializing_if = "Option::is_none")]
    pub inline_data: Option<Blob>,
    #[serde(rename = "functionCall", skip_serializing_if = "Option::is_none")]
    pub function_call: Option<FunctionCall>,
}

impl Part {
    pub fn text(text: impl Into<String>) -> Self {
        Self { text: Some(text.into()), ..Default::default() }
    }

    pub fn inline_data(mime_type: impl Into<String>, data: impl Into<String>) -> Self {
        Self {
            inline_data: Some(Blob { mime_type: mime_type.into(), data: data.into() }),
            ..Default::default()
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Blob {
    #[serde(rename = "mimeType")]
    pub mime_type: String,
    /// base64エンコード済みペイロード
    pub data: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    #[serde(default)]
    pub args: serde_json::Value,
}

#[derive(Debug, Clone, Serialize)]
pub struct Tool {
    #[serde(rename = "functionDeclarations")]
    pub function_declarations: Vec<FunctionDeclaration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FunctionDeclaration {
    pub name: String,
    pub description: String,
    pub parameters: serde_json::Value,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct GenerationConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(rename = "responseMimeType", skip_serializing_if = "Option::is_none")]
    pub response_mime_type: Option<String>,
}

impl GenerationConfig {
    pub fn json() -> Self {
        Self {
            response_mime_type: Some("application/json".to_string()),
            ..Default::default()
        }
    }
}

#[derive(Debug, Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "systemInstruction", skip_serializing_if = "Option::is_none")]
    system_instruction: Option<Content>,
    #[serde(rename = "generationConfig", skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
    #[serde(skip_serializing_if = "Option::is_none")]
    tools: Option<Vec<Tool>>,
}

#[derive(Debug, Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<Content>,
}

/// モデルからの1ターン分の応答
#[derive(Debug, Clone)]
pub struct ModelReply {
    pub text: String,
    pub function_call: Option<FunctionCall>,
}

pub struct GeminiClient {
    client: reqwest::Client,
    config: GeminiConfig,
}

impl GeminiClient {
    pub fn new(config: GeminiConfig) -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()
            .expect("Failed to create HTTP client");
        Self { client, config }
    }

    pub fn config(&self) -> &GeminiConfig {
        &self.config
    }

    /// マルチターンのチャット呼び出し。履歴＋新規ターンをまとめて送る
    pub async fn send_chat(
        &self,
        model: &str,
        system_instruction: Option<&str>,
        history: Vec<Content>,
        new_turn: Vec<Part>,
        tools: Option<Vec<Tool>>,
    ) -> AppResult<ModelReply> {
        let mut contents = history;
        contents.push(Content::user(new_turn));

        let request = GenerateContentRequest {
            contents,
            system_instruction: system_instruction
                .filter(|s| !s.is_empty())
                .map(|s| Content::user(vec![Part::text(s)])),
            generation_config: None,
            tools,
        };

        let response = self.call_api(model, &request).await?;
        Ok(extract_reply(response))
    }

    /// 単発のgenerateContent呼び出し。テキスト完了が空ならエラー
    pub async fn generate_content(
        &self,
        model: &str,
        parts: Vec<Part>,
        generation_config: Option<GenerationConfig>,
    ) -> AppResult<String> {
        let request = GenerateContentRequest {
            contents: vec![Content::user(parts)],
            system_instruction: None,
            generation_config,
            tools: None,
        };

        let response = self.call_api(model, &request).await?;
        let reply = extract_reply(response);
        if reply.text.trim().is_empty() {
            return Err(AppError::Generation("モデルの応答が空です".to_string()));
        }
        Ok(reply.text)
    }

    /// 類題生成ツール。問題と解答のペアから独立した2回目の呼び出しで類題を作る
    pub async fn generate_similar_question(
        &self,
        question: &str,
        answer: &str,
    ) -> AppResult<String> {
        let prompt = format!(
            "以下の問題と解答を参考に、同じ分野・同じ難易度の類題を新しく1問作成してください。\n\n\
             問題：{question}\n\n解答：{answer}\n\n\
             出力は必ず次の形式に従ってください。他の文章は含めないでください：\n\
             問題：（新しい問題文）\n\n解答：（新しい問題の解答）",
        );

        let text = self
            .generate_content(&self.config.chat_model, vec![Part::text(prompt)], None)
            .await?;

        let (new_question, new_answer) = parse_practice_question(&text)?;
        Ok(format!("問題：{}\n\n解答：{}", new_question, new_answer))
    }

    /// API呼び出し本体。指数バックオフ付きで3回まで再試行する
    async fn call_api(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> AppResult<GenerateContentResponse> {
        let mut last_error = None;

        for attempt in 0..3 {
            if attempt > 0 {
                let delay = std::time::Duration::from_millis(500 * 2u64.pow(attempt as u32));
                info!("Gemini API 再試行 ({}/3)、{}ms待機...", attempt + 1, delay.as_millis());
                tokio::time::sleep(delay).await;
            }

            match self.do_request(model, request).await {
                Ok(response) => return Ok(response),
                Err(e) => {
                    warn!("Gemini API 呼び出し失敗 (試行 {}/3): {}", attempt + 1, e);
                    last_error = Some(e);
                }
            }
        }

        Err(last_error
            .unwrap_or_else(|| AppError::Generation("Gemini API 呼び出しに失敗しました".to_string())))
    }

    async fn do_request(
        &self,
        model: &str,
        request: &GenerateContentRequest,
    ) -> AppResult<GenerateContentResponse> {
        let url = format!(
            "{}/models/{}:generateContent?key={}",
            self.config.api_url, model, self.config.api_key
        );

        let response = self.client.post(&url).json(request).send().await?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Generation(format!(
                "Gemini API がエラーを返しました {}: {}",
                status, body
            )));
        }

        let parsed: GenerateContentResponse = response.json().await?;
        Ok(parsed)
    }
}

fn extract_reply(response: GenerateContentResponse) -> ModelReply {
    let content = response
        .candidates
        .into_iter()
        .next()
        .and_then(|c| c.content);

    match content {
        Some(content) => {
            let function_call = content
                .parts
                .iter()
                .find_map(|p| p.function_call.clone());
            ModelReply { text: content.text(), function_call }
        }
        None => ModelReply { text: String::new(), function_call: None },
    }
}

/// 類題生成ツールの関数宣言
pub fn practice_question_tool() -> Tool {
    Tool {
        function_declarations: vec![FunctionDeclaration {
            name: "generate_similar_question".to_string(),
            description: "問題と解答のペアから、同じ分野・同じ難易度の類題を新しく作成する"
                .to_string(),
            parameters: serde_json::json!({
                "type": "object",
                "properties": {
                    "question": { "type": "string", "description": "元の問題文" },
                    "answer": { "type": "string", "description": "元の問題の解答" }
                },
                "required": ["question", "answer"]
            }),
        }],
    }
}

/// `問題：...\n\n解答：...` 形式のツール出力を分解する
pub fn parse_practice_question(text: &str) -> AppResult<(String, String)> {
    let text = text.trim();

    let rest = text
        .strip_prefix("問題：")
        .ok_or_else(|| AppError::ToolResultParse(format!("想定形式と一致しません: {}", text)))?;

    let answer_pos = rest
        .find("解答：")
        .ok_or_else(|| AppError::ToolResultParse(format!("解答が見つかりません: {}", text)))?;

    let question = rest[..answer_pos].trim();
    let answer = rest[answer_pos + "解答：".len()..].trim();

    if question.is_empty() || answer.is_empty() {
        return Err(AppError::ToolResultParse(
            "問題または解答が空です".to_string(),
        ));
    }

    Ok((question.to_string(), answer.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn practice_question_template_parses() {
        let text = "問題：二次方程式 x^2 - 5x + 6 = 0 を解け。\n\n解答：x = 2, 3";
        let (question, answer) = parse_practice_question(text).unwrap();
        assert_eq!(question, "二次方程式 x^2 - 5x + 6 = 0 を解け。");
        assert_eq!(answer, "x = 2, 3");
    }

    #[test]
    fn malformed_template_is_rejected() {
        let err = parse_practice_question("これは類題です。x = 2, 3").unwrap_err();
        assert!(matches!(err, AppError::ToolResultParse(_)));

        let err = parse_practice_question("問題：解答のない問題").unwrap_err();
        assert!(matches!(err, AppError::ToolResultParse(_)));
    }

    #[test]
    fn request_serializes_with_camel_case_fields() {
        let request = GenerateContentRequest {
            contents: vec![Content::user(vec![
                Part::text("こんにちは"),
                Part::inline_data("image/png", "QUJD"),
            ])],
            system_instruction: Some(Content::user(vec![Part::text("指示")])),
            generation_config: Some(GenerationConfig::json()),
            tools: Some(vec![practice_question_tool()]),
        };

        let value = serde_json::to_value(&request).unwrap();
        assert!(value.get("systemInstruction").is_some());
        assert_eq!(
            value["generationConfig"]["responseMimeType"],
            "application/json"
        );
        let part = &value["contents"][0]["parts"][1];
        assert_eq!(part["inlineData"]["mimeType"], "image/png");
        assert!(part.get("text").is_none());
        assert!(value["tools"][0].get("functionDeclarations").is_some());
    }

    #[test]
    fn function_call_reply_is_extracted() {
        let response: GenerateContentResponse = serde_json::from_value(serde_json::json!({
            "candidates": [{
                "content": {
                    "role": "model",
                    "parts": [{
                        "functionCall": {
                            "name": "generate_similar_question",
                            "args": { "question": "Q", "answer": "A" }
                        }
                    }]
                }
            }]
        }))
        .unwrap();

        let reply = extract_reply(response);
        assert!(reply.text.is_empty());
        let call = reply.function_call.unwrap();
        assert_eq!(call.name, "generate_similar_question");
        assert_eq!(call.args["question"], "Q");
    }
}
