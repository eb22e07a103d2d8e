//! Stateless question generation over the Gemini `generateContent` API.

use crate::config::FallbackConfig;
use crate::error::{ReflectaError, Result};
use crate::fallback::client::{QaPair, QuestionGenerator};
use crate::prompt;
use crate::session::model::ContentItem;
use crate::transport::connection::Credentials;
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Serialize)]
struct GenerateRequest {
    contents: Vec<RequestContent>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct RequestContent {
    role: &'static str,
    parts: Vec<TextPart>,
}

#[derive(Serialize, Deserialize)]
struct TextPart {
    text: String,
}

#[derive(Serialize)]
struct GenerationConfig {
    temperature: f32,
    #[serde(rename = "candidateCount")]
    candidate_count: u32,
}

#[derive(Deserialize)]
struct GenerateResponse {
    candidates: Option<Vec<Candidate>>,
    error: Option<ApiError>,
}

#[derive(Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

#[derive(Deserialize)]
struct ApiError {
    message: String,
}

/// One HTTP request per question; nothing is kept between calls.
pub struct GeminiQuestionClient {
    client: Client,
    endpoint: String,
    model: String,
    temperature: f32,
    credentials: Option<Credentials>,
}

impl GeminiQuestionClient {
    pub fn new(config: &FallbackConfig, credentials: Option<Credentials>) -> Result<Self> {
        let client = Client::builder()
            .timeout(config.timeout()?)
            .build()
            .map_err(|e| ReflectaError::FallbackRequest {
                message: format!("Failed to build HTTP client: {}", e),
            })?;
        Ok(Self {
            client,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            temperature: config.temperature,
            credentials,
        })
    }

    fn url(&self) -> String {
        format!("{}/{}:generateContent", self.endpoint, self.model)
    }

    async fn generate(&self, prompt: String) -> Result<String> {
        let credentials = self
            .credentials
            .as_ref()
            .filter(|c| !c.is_empty())
            .ok_or(ReflectaError::MissingCredential)?;

        let request = GenerateRequest {
            contents: vec![RequestContent {
                role: "user",
                parts: vec![TextPart { text: prompt }],
            }],
            generation_config: GenerationConfig {
                temperature: self.temperature,
                candidate_count: 1,
            },
        };

        debug!(model = %self.model, "requesting fallback question");
        let response = self
            .client
            .post(self.url())
            .header("x-goog-api-key", credentials.api_key())
            .json(&request)
            .send()
            .await
            .map_err(|e| ReflectaError::FallbackRequest {
                message: e.to_string(),
            })?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| ReflectaError::FallbackRequest {
                message: format!("Failed to read response body: {}", e),
            })?;

        if !status.is_success() {
            let detail = serde_json::from_str::<GenerateResponse>(&body)
                .ok()
                .and_then(|r| r.error)
                .map(|e| e.message)
                .unwrap_or(body);
            return Err(ReflectaError::FallbackRequest {
                message: format!("API returned status {}: {}", status, detail),
            });
        }

        extract_question(&body)
    }
}

/// First candidate's text, trimmed.
///
/// # Errors
/// `ReflectaError::FallbackResponse` for invalid JSON or an empty answer.
fn extract_question(body: &str) -> Result<String> {
    let response: GenerateResponse =
        serde_json::from_str(body).map_err(|e| ReflectaError::FallbackResponse {
            message: e.to_string(),
        })?;

    if let Some(error) = response.error {
        return Err(ReflectaError::FallbackResponse {
            message: error.message,
        });
    }

    let text: String = response
        .candidates
        .unwrap_or_default()
        .into_iter()
        .next()
        .and_then(|c| c.content)
        .map(|content| {
            content
                .parts
                .into_iter()
                .filter_map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();

    let question = text.trim();
    if question.is_empty() {
        return Err(ReflectaError::FallbackResponse {
            message: "response contained no question".to_string(),
        });
    }
    Ok(question.to_string())
}

#[async_trait]
impl QuestionGenerator for GeminiQuestionClient {
    async fn generate_first_question(&self, content: &ContentItem) -> Result<String> {
        self.generate(prompt::first_question_prompt(content)).await
    }

    async fn generate_follow_up(
        &self,
        content: &ContentItem,
        history: &[QaPair],
    ) -> Result<String> {
        self.generate(prompt::follow_up_prompt(content, history)).await
    }

    fn name(&self) -> &str {
        "gemini"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::model::ContentKind;

    #[test]
    fn test_extracts_and_joins_first_candidate_parts() {
        let body = r#"{"candidates":[{"content":{"parts":[{"text":"무엇이 "},{"text":"기억에 남나요?\n"}]}},{"content":{"parts":[{"text":"ignored"}]}}]}"#;
        assert_eq!(extract_question(body).unwrap(), "무엇이 기억에 남나요?");
    }

    #[test]
    fn test_empty_candidates_are_malformed() {
        assert!(matches!(
            extract_question(r#"{"candidates":[]}"#),
            Err(ReflectaError::FallbackResponse { .. })
        ));
        assert!(matches!(
            extract_question(r#"{"candidates":[{"content":{"parts":[{"text":"  "}]}}]}"#),
            Err(ReflectaError::FallbackResponse { .. })
        ));
        assert!(matches!(
            extract_question(r#"{}"#),
            Err(ReflectaError::FallbackResponse { .. })
        ));
    }

    #[test]
    fn test_invalid_json_is_malformed() {
        assert!(matches!(
            extract_question("<html>"),
            Err(ReflectaError::FallbackResponse { .. })
        ));
    }

    #[test]
    fn test_embedded_error_is_reported() {
        match extract_question(r#"{"error":{"message":"quota exceeded"}}"#) {
            Err(ReflectaError::FallbackResponse { message }) => {
                assert_eq!(message, "quota exceeded")
            }
            other => panic!("Expected FallbackResponse, got {:?}", other),
        }
    }

    #[test]
    fn test_url_joins_endpoint_and_model() {
        let config = FallbackConfig {
            endpoint: "https://example.test/v1beta/models/".to_string(),
            model: "gemini-test".to_string(),
            ..FallbackConfig::default()
        };
        let client = GeminiQuestionClient::new(&config, None).unwrap();
        assert_eq!(
            client.url(),
            "https://example.test/v1beta/models/gemini-test:generateContent"
        );
    }

    #[tokio::test]
    async fn test_missing_key_fails_without_request() {
        let client = GeminiQuestionClient::new(&FallbackConfig::default(), None).unwrap();
        let content = ContentItem::new("Dune", ContentKind::Note);
        assert!(matches!(
            client.generate_first_question(&content).await,
            Err(ReflectaError::MissingCredential)
        ));
    }
}
