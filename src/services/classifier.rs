use async_trait::async_trait;
use base64::Engine;
use garde::Validate;
use reqwest::Client;
use serde::Deserialize;
use std::time::Duration;

use crate::models::classification::{Classification, ClassificationMetadata};
use crate::services::temp_files::StagedImage;

/// External vision model producing a fossil identification.
#[async_trait]
pub trait Classifier: Send + Sync {
    async fn classify(&self, images: &[StagedImage]) -> Result<Classification, ClassifierError>;
}

/// Client for an OpenAI-compatible chat completions endpoint with vision input.
pub struct VisionClient {
    http: Client,
    base_url: String,
    api_key: String,
    model: String,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessage,
}

#[derive(Deserialize)]
struct ChatMessage {
    content: Option<String>,
}

const OUTPUT_FORMAT: &str = r#"{
  "fossil_name": "common name of the fossil",
  "scientific_name": "binomial or lowest identifiable taxon",
  "estimated_age": "geological period and approximate age",
  "confidence": 0.0,
  "description": "short description of the diagnostic features"
}"#;

impl VisionClient {
    pub fn new(
        base_url: &str,
        api_key: &str,
        model: &str,
        timeout: Duration,
    ) -> Result<Self, ClassifierError> {
        let http = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(ClassifierError::Http)?;

        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
        })
    }

    async fn image_part(image: &StagedImage) -> Result<serde_json::Value, ClassifierError> {
        let bytes = tokio::fs::read(&image.path).await?;
        let encoded = base64::engine::general_purpose::STANDARD.encode(bytes);
        Ok(serde_json::json!({
            "type": "image_url",
            "image_url": {
                "url": format!("data:{};base64,{}", image.content_type, encoded),
                "detail": "high"
            }
        }))
    }
}

#[async_trait]
impl Classifier for VisionClient {
    async fn classify(&self, images: &[StagedImage]) -> Result<Classification, ClassifierError> {
        let mut content = vec![serde_json::json!({
            "type": "text",
            "text": build_prompt(images.len()),
        })];
        for image in images {
            content.push(Self::image_part(image).await?);
        }

        let request_body = serde_json::json!({
            "model": self.model,
            "messages": [{ "role": "user", "content": content }],
            "max_tokens": 2000,
            "temperature": 0,
            "response_format": { "type": "json_object" }
        });

        let response = self
            .http
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&request_body)
            .send()
            .await
            .map_err(ClassifierError::Http)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ClassifierError::Api {
                status: status.as_u16(),
                body,
            });
        }

        let chat: ChatResponse = response.json().await.map_err(ClassifierError::Http)?;
        let text = chat
            .choices
            .into_iter()
            .next()
            .and_then(|c| c.message.content)
            .ok_or(ClassifierError::EmptyResponse)?;

        parse_classification(&text, images.len())
    }
}

pub fn build_prompt(image_count: usize) -> String {
    let mut prompt = String::from(
        "You are an expert palaeontologist. Identify the fossil shown in the image(s).\n",
    );
    if image_count > 1 {
        prompt.push_str(&format!(
            "\nNOTE: You are being provided with {image_count} images of the SAME fossil from \
             different angles. Analyze ALL images together to make one classification.\n"
        ));
    }
    prompt.push_str("\nReturn your response as a JSON object in exactly this format:\n");
    prompt.push_str(OUTPUT_FORMAT);
    prompt.push_str(
        "\nconfidence is a number between 0 and 1. Do not add commentary outside the JSON.",
    );
    prompt
}

/// Strip a markdown code fence around the model output, if present.
pub fn extract_json(text: &str) -> &str {
    let trimmed = text.trim();
    let Some(start) = trimmed.find("```") else {
        return trimmed;
    };
    let after_fence = &trimmed[start + 3..];
    let body = after_fence
        .strip_prefix("json")
        .unwrap_or(after_fence);
    match body.find("```") {
        Some(end) => body[..end].trim(),
        None => body.trim(),
    }
}

/// Parse, normalize and validate the model's reply.
pub fn parse_classification(
    text: &str,
    image_count: usize,
) -> Result<Classification, ClassifierError> {
    let mut classification: Classification =
        serde_json::from_str(extract_json(text)).map_err(ClassifierError::Parse)?;
    classification.normalize();
    classification
        .validate()
        .map_err(|report| ClassifierError::Invalid(report.to_string()))?;
    classification.metadata = Some(ClassificationMetadata {
        num_images_analyzed: image_count,
    });
    Ok(classification)
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("HTTP request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Classifier API returned {status}: {body}")]
    Api { status: u16, body: String },

    #[error("Classifier returned no content")]
    EmptyResponse,

    #[error("Failed to parse classifier response: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("Classifier response failed validation: {0}")]
    Invalid(String),

    #[error("Failed to read staged image: {0}")]
    Io(#[from] std::io::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_plain() {
        assert_eq!(extract_json("  {\"a\": 1} "), "{\"a\": 1}");
    }

    #[test]
    fn test_extract_json_fenced() {
        let text = "Here you go:\n```json\n{\"fossil_name\": \"Ammonite\"}\n```\nDone";
        assert_eq!(extract_json(text), "{\"fossil_name\": \"Ammonite\"}");

        let bare = "```\n{\"x\": 2}\n```";
        assert_eq!(extract_json(bare), "{\"x\": 2}");
    }

    #[test]
    fn test_parse_classification_sets_metadata() {
        let text = r#"```json
        {"fossil_name": "Megalodon tooth", "scientific_name": "Otodus megalodon",
         "estimated_age": "Miocene, ~15 Ma", "confidence": 0.9}
        ```"#;
        let parsed = parse_classification(text, 3).unwrap();
        assert_eq!(parsed.fossil_name, "Megalodon tooth");
        assert_eq!(parsed.metadata.unwrap().num_images_analyzed, 3);
    }

    #[test]
    fn test_parse_classification_rejects_garbage() {
        assert!(matches!(
            parse_classification("I cannot identify this.", 1),
            Err(ClassifierError::Parse(_))
        ));
        assert!(matches!(
            parse_classification(r#"{"fossil_name": "", "confidence": 0.5}"#, 1),
            Err(ClassifierError::Invalid(_))
        ));
    }

    #[test]
    fn test_prompt_mentions_multiple_views() {
        assert!(build_prompt(3).contains("3 images of the SAME fossil"));
        assert!(!build_prompt(1).contains("SAME fossil"));
    }

    #[test]
    fn test_base_url_trailing_slash_trimmed() {
        let client = VisionClient::new(
            "https://api.example.com/v1/",
            "key",
            "gpt-4o",
            Duration::from_secs(5),
        )
        .unwrap();
        assert_eq!(client.base_url, "https://api.example.com/v1");
    }
}
