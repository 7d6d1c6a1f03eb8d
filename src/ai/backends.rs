use crate::ai::diagnoser::{format_prompt, Diagnosis, IncidentContext};
use crate::error::DiagnosisError;
use crate::remediation::RemediationAction;
use log::warn;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// External collaborator that turns incident context into a diagnosis
pub trait ReasoningProvider: Send + Sync {
    fn analyze<'a>(
        &'a self,
        context: &'a IncidentContext,
    ) -> Pin<Box<dyn Future<Output = Result<Diagnosis, DiagnosisError>> + Send + 'a>>;

    /// Short name used in log messages
    fn name(&self) -> &str;
}

/// Confidence as providers return it: a score or a coarse label
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
enum ConfidenceValue {
    Score(f64),
    Label(String),
}

impl ConfidenceValue {
    fn to_score(&self) -> Result<f64, DiagnosisError> {
        match self {
            ConfidenceValue::Score(score) => Ok(*score),
            ConfidenceValue::Label(label) => match label.trim().to_uppercase().as_str() {
                "HIGH" => Ok(0.9),
                "MEDIUM" => Ok(0.6),
                "LOW" => Ok(0.3),
                other => Err(DiagnosisError::InvalidResponse(format!(
                    "unknown confidence label '{}'",
                    other
                ))),
            },
        }
    }
}

/// Expected JSON structure of a provider answer
#[derive(Debug, Serialize, Deserialize)]
struct ProviderAnalysisResponse {
    #[serde(alias = "root_cause_summary")]
    root_cause: String,
    confidence: ConfidenceValue,
    #[serde(default)]
    evidence: Vec<String>,
    #[serde(default)]
    suggested_action: Option<serde_json::Value>,
}

/// Extract JSON from model output
///
/// Models sometimes wrap JSON in markdown code blocks or add extra text.
fn extract_json_from_response(response_text: &str) -> String {
    let text = response_text.trim();

    if let Some(start) = text.find("```json") {
        let json_start = start + 7;
        if let Some(end) = text[json_start..].find("```") {
            let candidate = text[json_start..json_start + end].trim();
            if !candidate.is_empty() {
                return candidate.to_string();
            }
        }
    }

    if let Some(start) = text.find("```") {
        let json_start = start + 3;
        if let Some(end) = text[json_start..].find("```") {
            let candidate = text[json_start..json_start + end].trim();
            if candidate.starts_with('{') && candidate.ends_with('}') {
                return candidate.to_string();
            }
        }
    }

    if let (Some(start), Some(end)) = (text.find('{'), text.rfind('}')) {
        if start < end {
            return text[start..=end].to_string();
        }
    }

    text.to_string()
}

/// Parse a provider's text answer into a diagnosis
///
/// An action object the agent does not understand is dropped with a
/// warning, which leaves the diagnosis without a suggested action.
fn parse_diagnosis_response(response_text: &str) -> Result<Diagnosis, DiagnosisError> {
    let json_text = extract_json_from_response(response_text);

    let parsed: ProviderAnalysisResponse = serde_json::from_str(&json_text).map_err(|e| {
        DiagnosisError::InvalidResponse(format!(
            "failed to parse provider JSON: {}. Response was: {}",
            e, json_text
        ))
    })?;

    let suggested_action = match parsed.suggested_action {
        None | Some(serde_json::Value::Null) => None,
        Some(value) => match serde_json::from_value::<RemediationAction>(value.clone()) {
            Ok(action) => Some(action),
            Err(e) => {
                warn!("Ignoring unrecognised suggested action {}: {}", value, e);
                None
            }
        },
    };

    Ok(Diagnosis {
        root_cause_summary: parsed.root_cause,
        confidence: parsed.confidence.to_score()?,
        evidence: parsed.evidence,
        suggested_action,
    })
}

fn build_client(timeout: Duration) -> Result<Client, DiagnosisError> {
    Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| DiagnosisError::HttpError(format!("failed to create HTTP client: {}", e)))
}

/// Map a non-success HTTP status to the matching diagnosis error
async fn status_error(provider: &str, response: reqwest::Response) -> DiagnosisError {
    let status = response.status();
    let error_text = response
        .text()
        .await
        .unwrap_or_else(|_| "Unknown error".to_string());

    if status == StatusCode::TOO_MANY_REQUESTS {
        DiagnosisError::QuotaExceeded(format!("{} returned {}: {}", provider, status, error_text))
    } else {
        DiagnosisError::BackendError(format!("{} returned {}: {}", provider, status, error_text))
    }
}

/// Ollama backend for local model inference
pub struct OllamaBackend {
    client: Client,
    endpoint: String,
    model: String,
}

#[derive(Debug, Serialize)]
struct OllamaRequest {
    model: String,
    prompt: String,
    stream: bool,
    format: String,
    options: OllamaOptions,
}

#[derive(Debug, Serialize)]
struct OllamaOptions {
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct OllamaResponse {
    #[serde(default)]
    response: String,
    #[serde(default)]
    error: Option<String>,
}

impl OllamaBackend {
    /// Create a new Ollama backend
    ///
    /// # Arguments
    /// * `endpoint` - Ollama server URL (e.g., "http://localhost:11434")
    /// * `model` - Model name to use (e.g., "llama3.1")
    /// * `request_timeout` - Transport timeout for one HTTP request
    pub fn new(
        endpoint: String,
        model: String,
        request_timeout: Duration,
    ) -> Result<Self, DiagnosisError> {
        Ok(Self {
            client: build_client(request_timeout)?,
            endpoint,
            model,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/api/generate", self.endpoint.trim_end_matches('/'))
    }
}

impl ReasoningProvider for OllamaBackend {
    fn analyze<'a>(
        &'a self,
        context: &'a IncidentContext,
    ) -> Pin<Box<dyn Future<Output = Result<Diagnosis, DiagnosisError>> + Send + 'a>> {
        Box::pin(async move {
            let request = OllamaRequest {
                model: self.model.clone(),
                prompt: format_prompt(context),
                stream: false,
                format: "json".to_string(),
                options: OllamaOptions { temperature: 0.1 },
            };

            let response = self
                .client
                .post(self.api_url())
                .json(&request)
                .send()
                .await
                .map_err(|e| DiagnosisError::HttpError(format!("HTTP request failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(status_error("Ollama", response).await);
            }

            let ollama_response: OllamaResponse = response.json().await.map_err(|e| {
                DiagnosisError::InvalidResponse(format!("failed to parse Ollama response: {}", e))
            })?;

            if let Some(error) = ollama_response.error {
                return Err(DiagnosisError::BackendError(format!("Ollama error: {}", error)));
            }

            parse_diagnosis_response(&ollama_response.response)
        })
    }

    fn name(&self) -> &str {
        "ollama"
    }
}

/// Backend for OpenAI-compatible chat completion APIs
///
/// Covers OpenAI itself and compatible services such as Groq through
/// [`with_base_url`](Self::with_base_url).
pub struct OpenAIBackend {
    client: Client,
    api_key: String,
    model: String,
    base_url: String,
}

#[derive(Debug, Serialize)]
struct OpenAIRequest {
    model: String,
    messages: Vec<OpenAIMessage>,
    temperature: f32,
    max_tokens: u32,
    response_format: OpenAIResponseFormat,
}

#[derive(Debug, Serialize)]
struct OpenAIMessage {
    role: String,
    content: String,
}

#[derive(Debug, Serialize)]
struct OpenAIResponseFormat {
    #[serde(rename = "type")]
    format_type: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponse {
    #[serde(default)]
    choices: Vec<OpenAIChoice>,
    #[serde(default)]
    error: Option<OpenAIError>,
}

#[derive(Debug, Deserialize)]
struct OpenAIChoice {
    message: OpenAIResponseMessage,
}

#[derive(Debug, Deserialize)]
struct OpenAIResponseMessage {
    content: String,
}

#[derive(Debug, Deserialize)]
struct OpenAIError {
    message: String,
    #[serde(rename = "type", default)]
    error_type: String,
}

impl OpenAIBackend {
    pub fn new(api_key: String, model: String, request_timeout: Duration) -> Result<Self, DiagnosisError> {
        Self::with_base_url(
            api_key,
            model,
            "https://api.openai.com/v1".to_string(),
            request_timeout,
        )
    }

    /// Create a backend for any OpenAI-compatible endpoint
    pub fn with_base_url(
        api_key: String,
        model: String,
        base_url: String,
        request_timeout: Duration,
    ) -> Result<Self, DiagnosisError> {
        Ok(Self {
            client: build_client(request_timeout)?,
            api_key,
            model,
            base_url,
        })
    }

    fn api_url(&self) -> String {
        format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
    }

    fn create_system_prompt() -> String {
        "You are an expert Site Reliability Engineer. Diagnose infrastructure anomalies and answer in JSON with fields: root_cause (string), confidence (number between 0 and 1), evidence (array of strings), suggested_action (object or null).".to_string()
    }
}

impl ReasoningProvider for OpenAIBackend {
    fn analyze<'a>(
        &'a self,
        context: &'a IncidentContext,
    ) -> Pin<Box<dyn Future<Output = Result<Diagnosis, DiagnosisError>> + Send + 'a>> {
        Box::pin(async move {
            let request = OpenAIRequest {
                model: self.model.clone(),
                messages: vec![
                    OpenAIMessage {
                        role: "system".to_string(),
                        content: Self::create_system_prompt(),
                    },
                    OpenAIMessage {
                        role: "user".to_string(),
                        content: format_prompt(context),
                    },
                ],
                temperature: 0.1,
                max_tokens: 1000,
                response_format: OpenAIResponseFormat {
                    format_type: "json_object".to_string(),
                },
            };

            let mut builder = self.client.post(self.api_url()).json(&request);
            if !self.api_key.is_empty() {
                builder = builder.bearer_auth(&self.api_key);
            }

            let response = builder
                .send()
                .await
                .map_err(|e| DiagnosisError::HttpError(format!("HTTP request failed: {}", e)))?;

            if !response.status().is_success() {
                return Err(status_error("OpenAI-compatible API", response).await);
            }

            let openai_response: OpenAIResponse = response.json().await.map_err(|e| {
                DiagnosisError::InvalidResponse(format!("failed to parse chat response: {}", e))
            })?;

            if let Some(error) = openai_response.error {
                return Err(DiagnosisError::BackendError(format!(
                    "API error ({}): {}",
                    error.error_type, error.message
                )));
            }

            let content = openai_response
                .choices
                .first()
                .ok_or_else(|| {
                    DiagnosisError::InvalidResponse("no choices in chat response".to_string())
                })?
                .message
                .content
                .clone();

            parse_diagnosis_response(&content)
        })
    }

    fn name(&self) -> &str {
        "openai"
    }
}

/// Scripted provider for tests and dry runs
///
/// Responses are returned in order and cycle after the last one.
pub struct MockBackend {
    responses: Vec<Result<Diagnosis, DiagnosisError>>,
    current_index: Arc<Mutex<usize>>,
    delay: Option<Duration>,
    call_count: Arc<Mutex<usize>>,
    last_context: Arc<Mutex<Option<IncidentContext>>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl MockBackend {
    pub fn with_response(response: Result<Diagnosis, DiagnosisError>) -> Self {
        Self::with_responses(vec![response])
    }

    pub fn with_responses(responses: Vec<Result<Diagnosis, DiagnosisError>>) -> Self {
        Self {
            responses,
            current_index: Arc::new(Mutex::new(0)),
            delay: None,
            call_count: Arc::new(Mutex::new(0)),
            last_context: Arc::new(Mutex::new(None)),
        }
    }

    /// Always diagnose with confidence 0.9 and suggest no action
    pub fn success() -> Self {
        Self::with_response(Ok(Diagnosis::new(
            "Mock root cause",
            0.9,
            Some(RemediationAction::NoAction),
        )
        .with_evidence(vec!["mock evidence".to_string()])))
    }

    pub fn error(error_message: String) -> Self {
        Self::with_response(Err(DiagnosisError::BackendError(error_message)))
    }

    pub fn timeout() -> Self {
        Self::with_response(Err(DiagnosisError::Timeout))
    }

    /// Delay every response, useful to exercise call timeouts
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    pub fn call_count(&self) -> usize {
        *lock(&self.call_count)
    }

    pub fn last_context(&self) -> Option<IncidentContext> {
        lock(&self.last_context).clone()
    }

    pub fn reset(&self) {
        *lock(&self.call_count) = 0;
        *lock(&self.last_context) = None;
        *lock(&self.current_index) = 0;
    }
}

impl ReasoningProvider for MockBackend {
    fn analyze<'a>(
        &'a self,
        context: &'a IncidentContext,
    ) -> Pin<Box<dyn Future<Output = Result<Diagnosis, DiagnosisError>> + Send + 'a>> {
        Box::pin(async move {
            *lock(&self.call_count) += 1;
            *lock(&self.last_context) = Some(context.clone());

            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }

            if self.responses.is_empty() {
                return Err(DiagnosisError::BackendError(
                    "mock backend has no responses".to_string(),
                ));
            }

            let response_index = {
                let mut index = lock(&self.current_index);
                let current = *index % self.responses.len();
                *index += 1;
                current
            };

            self.responses[response_index].clone()
        })
    }

    fn name(&self) -> &str {
        "mock"
    }
}
