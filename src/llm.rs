use anyhow::{bail, Context};
use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper_tls::HttpsConnector;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::client::legacy::Client;
use hyper_util::rt::TokioExecutor;
use log::debug;
use serde::{Deserialize, Serialize};

const DEFAULT_MODEL: &str = "gemini-1.5-pro";

/// The external categorization model: structured prompt in, raw text out.
///
/// Kept behind a trait so the parse/merge logic tests against canned
/// responses instead of a live model.
#[allow(async_fn_in_trait)]
pub trait UsageModel {
    async fn categorize(&self, prompt: &str) -> anyhow::Result<String>;
}

/// Client for a Gemini-compatible `generateContent` endpoint.
pub struct GeminiClient {
    http: Client<HttpsConnector<HttpConnector>, Full<Bytes>>,
    endpoint: String,
    model: String,
    api_key: Option<String>,
}

impl GeminiClient {
    pub fn new(endpoint: String, model: String, api_key: Option<String>) -> Self {
        Self {
            http: Client::builder(TokioExecutor::new()).build(HttpsConnector::new()),
            endpoint: normalize_endpoint(endpoint),
            model,
            api_key,
        }
    }

    /// Reads `LLM_ENDPOINT` (required), `LLM_MODEL`, and `LLM_API_KEY`.
    pub fn from_env() -> anyhow::Result<Self> {
        let endpoint = std::env::var("LLM_ENDPOINT")
            .context("LLM_ENDPOINT must be set to a Gemini-compatible endpoint")?;
        let model = std::env::var("LLM_MODEL").unwrap_or_else(|_| DEFAULT_MODEL.to_string());
        let api_key = std::env::var("LLM_API_KEY").ok();
        Ok(Self::new(endpoint, model, api_key))
    }
}

impl UsageModel for GeminiClient {
    async fn categorize(&self, prompt: &str) -> anyhow::Result<String> {
        let url = format!(
            "{}/v1beta/models/{}:generateContent",
            self.endpoint, self.model
        );
        let body = serde_json::to_vec(&GenerateContentRequest {
            contents: vec![Content {
                role: "user",
                parts: vec![Part {
                    text: prompt.to_string(),
                }],
            }],
            generation_config: GenerationConfig::default(),
        })?;

        let mut request = http::Request::builder()
            .method("POST")
            .uri(&url)
            .header(http::header::CONTENT_TYPE, "application/json");
        if let Some(key) = &self.api_key {
            request = request.header("x-goog-api-key", key.as_str());
        }
        let request = request
            .body(Full::new(Bytes::from(body)))
            .context("failed to build model request")?;

        debug!("sending categorization prompt to {url}");
        let response = self
            .http
            .request(request)
            .await
            .with_context(|| format!("model request to {url} failed"))?;
        let status = response.status();
        let payload = response
            .into_body()
            .collect()
            .await
            .context("failed to read model response")?
            .to_bytes();
        if !status.is_success() {
            bail!(
                "model request failed with {status}: {}",
                String::from_utf8_lossy(&payload)
            );
        }

        extract_text(&payload)
    }
}

fn normalize_endpoint(endpoint: String) -> String {
    let trimmed = endpoint.trim_end_matches('/');
    if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    }
}

/// Pulls the first candidate's text out of a `generateContent` response.
fn extract_text(payload: &[u8]) -> anyhow::Result<String> {
    let response: GenerateContentResponse =
        serde_json::from_slice(payload).context("model response is not generateContent JSON")?;
    let text: String = response
        .candidates
        .into_iter()
        .next()
        .map(|candidate| {
            candidate
                .content
                .parts
                .into_iter()
                .map(|part| part.text)
                .collect()
        })
        .unwrap_or_default();
    if text.is_empty() {
        bail!("model returned no text candidates");
    }
    Ok(text)
}

#[derive(Serialize)]
struct GenerateContentRequest {
    contents: Vec<Content>,
    #[serde(rename = "generationConfig")]
    generation_config: GenerationConfig,
}

#[derive(Serialize)]
struct Content {
    role: &'static str,
    parts: Vec<Part>,
}

#[derive(Serialize, Deserialize)]
struct Part {
    #[serde(default)]
    text: String,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    temperature: f64,
    top_p: f64,
    top_k: u32,
    max_output_tokens: u32,
    candidate_count: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.2,
            top_p: 0.8,
            top_k: 40,
            max_output_tokens: 8192,
            candidate_count: 1,
        }
    }
}

#[derive(Deserialize)]
struct GenerateContentResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<Part>,
}
