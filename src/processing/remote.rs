use base64::{engine::general_purpose::STANDARD, Engine};
use lazy_static::lazy_static;
use log::{debug, warn};
use regex::Regex;
use reqwest::blocking::Client;
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::sync::Once;
use std::thread;
use std::time::Duration;

use crate::config::{LlmConfig, RemoteConfig};
use crate::models::{DocumentType, OcrResult};
use crate::processing::image::{ImageProcessor, NormalizedImage};
use crate::processing::ocr::{RecognitionRequest, Recognizer, Region};
use crate::utils::{ExtractError, Result};

lazy_static! {
    static ref CODE_FENCE: Regex = Regex::new(r"(?s)^\s*```[A-Za-z]*\s*(.*?)\s*```\s*$").unwrap();
}

/// HTTP client for one remote backend, primed by a single warm-up request.
pub struct RemoteSession {
    backend: &'static str,
    client: Client,
    max_retries: u32,
    warmup_image: Option<std::path::PathBuf>,
    warmup: Once,
}

impl RemoteSession {
    pub fn new(backend: &'static str, config: &RemoteConfig) -> Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()
            .map_err(|e| {
                ExtractError::engine_unavailable(
                    backend,
                    format!("failed to create HTTP client: {}", e),
                    "check the TLS setup of this host",
                )
            })?;

        Ok(RemoteSession {
            backend,
            client,
            max_retries: config.max_retries,
            warmup_image: config.warmup_image.clone(),
            warmup: Once::new(),
        })
    }

    /// Runs `prime` with the warm-up payload the first time it is called on
    /// this session; concurrent first callers block until it has finished.
    pub fn warm_up<F: FnOnce(&[u8])>(&self, prime: F) {
        self.warmup.call_once(|| {
            let payload = match self.warmup_payload() {
                Ok(payload) => payload,
                Err(e) => {
                    warn!("{} warm-up skipped: {}", self.backend, e);
                    return;
                }
            };
            debug!("warming up {} session", self.backend);
            prime(&payload);
        });
    }

    pub fn is_warm(&self) -> bool {
        self.warmup.is_completed()
    }

    fn warmup_payload(&self) -> Result<Vec<u8>> {
        if let Some(path) = &self.warmup_image {
            match std::fs::read(path) {
                Ok(bytes) => return Ok(bytes),
                Err(e) => warn!(
                    "cannot read warm-up image {}: {}, using a blank page",
                    path.display(),
                    e
                ),
            }
        }
        Ok(ImageProcessor::blank(64, 64)?.jpeg().to_vec())
    }

    /// POSTs `body` and returns the response text, retrying transport
    /// failures, 429 and 5xx with exponential backoff.
    pub fn post_json(&self, url: &str, headers: &[(&str, &str)], body: &Value) -> Result<String> {
        let mut attempt = 0u32;
        loop {
            let mut request = self.client.post(url).json(body);
            for (name, value) in headers {
                request = request.header(*name, *value);
            }

            let failure = match request.send() {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        return response.text().map_err(|e| {
                            ExtractError::engine_unavailable(
                                self.backend,
                                format!("failed to read response body: {}", e.without_url()),
                                "retry the request",
                            )
                        });
                    }
                    if status.as_u16() != 429 && !status.is_server_error() {
                        let body = response.text().unwrap_or_default();
                        return Err(ExtractError::engine_unavailable(
                            self.backend,
                            format!("request rejected with {}: {}", status, snippet(&body)),
                            "check the API key, endpoint and model settings",
                        ));
                    }
                    format!("server answered {}", status)
                }
                Err(e) if e.is_timeout() => format!("request timed out: {}", e.without_url()),
                Err(e) => format!("transport error: {}", e.without_url()),
            };

            if attempt >= self.max_retries {
                return Err(ExtractError::engine_unavailable(
                    self.backend,
                    format!("{} after {} retries", failure, self.max_retries),
                    "check network connectivity or raise timeout_secs / max_retries",
                ));
            }
            let delay = backoff(attempt);
            warn!(
                "{} request failed ({}), retrying in {:?}",
                self.backend, failure, delay
            );
            thread::sleep(delay);
            attempt += 1;
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    Duration::from_millis(100 * 2u64.pow(attempt.min(10)))
}

fn snippet(body: &str) -> String {
    body.chars().take(200).collect()
}

/// Tesseract codes to the ISO 639-1 hints remote engines expect.
pub fn language_hints(request: &RecognitionRequest) -> Vec<String> {
    request
        .languages()
        .into_iter()
        .map(|lang| match lang {
            "eng" => "en".to_string(),
            "ind" => "id".to_string(),
            "msa" => "ms".to_string(),
            "fra" => "fr".to_string(),
            "deu" => "de".to_string(),
            "spa" => "es".to_string(),
            "nld" => "nl".to_string(),
            "jpn" => "ja".to_string(),
            "chi_sim" | "chi_tra" => "zh".to_string(),
            other => other.to_string(),
        })
        .collect()
}

pub struct CloudVisionBackend {
    session: RemoteSession,
    endpoint: String,
    api_key: String,
}

impl CloudVisionBackend {
    const ID: &'static str = "cloud_vision";

    pub fn new(config: &RemoteConfig) -> Result<Self> {
        let api_key = config.resolve_api_key(Self::ID)?;
        Ok(CloudVisionBackend {
            session: RemoteSession::new(Self::ID, config)?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    fn annotate(&self, jpeg: &[u8], hints: &[String]) -> Result<OcrResult> {
        let body = json!({
            "requests": [{
                "image": { "content": STANDARD.encode(jpeg) },
                "features": [{ "type": "DOCUMENT_TEXT_DETECTION" }],
                "imageContext": { "languageHints": hints },
            }]
        });
        let url = format!("{}/v1/images:annotate", self.endpoint);
        let text = self
            .session
            .post_json(&url, &[("x-goog-api-key", self.api_key.as_str())], &body)?;
        Ok(parse_vision_response(&text))
    }
}

impl Recognizer for CloudVisionBackend {
    fn id(&self) -> &str {
        Self::ID
    }

    fn recognize(&self, image: &NormalizedImage, request: &RecognitionRequest) -> Result<OcrResult> {
        let hints = language_hints(request);
        self.session.warm_up(|payload| {
            if let Err(e) = self.annotate(payload, &hints) {
                debug!("cloud_vision warm-up failed: {}", e);
            }
        });

        let mut result = self.annotate(image.jpeg(), &hints)?;
        result.languages = hints;
        Ok(result)
    }
}

/// Text of an `images:annotate` response; anything unexpected yields an empty result.
pub fn parse_vision_response(body: &str) -> OcrResult {
    let backend = CloudVisionBackend::ID;
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            warn!("cloud_vision returned undecodable body: {}", e);
            return OcrResult::empty(backend);
        }
    };

    let response = &value["responses"][0];
    if let Some(message) = response["error"]["message"].as_str() {
        warn!("cloud_vision reported an error: {}", message);
        return OcrResult::empty(backend);
    }

    let text = response["fullTextAnnotation"]["text"]
        .as_str()
        .or_else(|| response["textAnnotations"][0]["description"].as_str());

    match text {
        Some(text) => {
            let mut result = OcrResult::from_text(backend, text);
            result.confidence = response["fullTextAnnotation"]["pages"][0]["confidence"]
                .as_f64()
                .map(|c| (c * 100.0) as f32);
            result
        }
        None => {
            warn!("cloud_vision response carried no text annotations");
            OcrResult::empty(backend)
        }
    }
}

pub struct LlmBackend {
    session: RemoteSession,
    endpoint: String,
    model: String,
    api_key: String,
    prompts: BTreeMap<String, String>,
}

impl LlmBackend {
    const ID: &'static str = "llm";

    pub fn new(config: &LlmConfig) -> Result<Self> {
        let remote = config.remote();
        let api_key = remote.resolve_api_key(Self::ID)?;
        Ok(LlmBackend {
            session: RemoteSession::new(Self::ID, &remote)?,
            endpoint: config.endpoint.trim_end_matches('/').to_string(),
            model: config.model.clone(),
            api_key,
            prompts: config.prompts.clone(),
        })
    }

    /// Configured override for the document type, then `default`, then the built-in prompt.
    pub fn prompt_for(&self, request: &RecognitionRequest) -> String {
        if request.region == Region::Mrz {
            return MRZ_PROMPT.to_string();
        }
        let doc = request.document_type;
        let mut keys = vec![doc.as_str()];
        if doc == DocumentType::NationalId {
            keys.push("ktp");
        }
        keys.push("default");

        keys.iter()
            .find_map(|key| self.prompts.get(*key))
            .cloned()
            .unwrap_or_else(|| default_prompt(doc).to_string())
    }

    fn generate(&self, jpeg: &[u8], prompt: &str) -> Result<String> {
        let body = json!({
            "contents": [{
                "parts": [
                    { "text": prompt },
                    { "inline_data": { "mime_type": "image/jpeg", "data": STANDARD.encode(jpeg) } },
                ]
            }],
            "generationConfig": { "temperature": 0.0 },
        });
        let url = format!("{}/models/{}:generateContent", self.endpoint, self.model);
        self.session
            .post_json(&url, &[("x-goog-api-key", self.api_key.as_str())], &body)
    }
}

impl Recognizer for LlmBackend {
    fn id(&self) -> &str {
        Self::ID
    }

    fn recognize(&self, image: &NormalizedImage, request: &RecognitionRequest) -> Result<OcrResult> {
        let prompt = self.prompt_for(request);
        self.session.warm_up(|payload| {
            if let Err(e) = self.generate(payload, &prompt) {
                debug!("llm warm-up failed: {}", e);
            }
        });

        let body = self.generate(image.jpeg(), &prompt)?;
        Ok(parse_llm_response(&body, request.region))
    }
}

/// Reads a `generateContent` response. Page requests expect a JSON object of
/// fields, MRZ requests the verbatim zone lines.
pub fn parse_llm_response(body: &str, region: Region) -> OcrResult {
    let backend = LlmBackend::ID;
    let value: Value = match serde_json::from_str(body) {
        Ok(value) => value,
        Err(e) => {
            warn!("llm returned undecodable body: {}", e);
            return OcrResult::empty(backend);
        }
    };

    let usage = value.get("usageMetadata").cloned();
    let text: String = value["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| parts.iter().filter_map(|p| p["text"].as_str()).collect())
        .unwrap_or_default();

    if text.trim().is_empty() {
        warn!("llm response carried no candidates");
        return OcrResult {
            usage,
            ..OcrResult::empty(backend)
        };
    }
    let text = strip_code_fence(&text);

    let mut result = match region {
        Region::Mrz => OcrResult::from_text(backend, text),
        Region::Page => match structured_fields(text) {
            Some(fields) => {
                let lines = fields
                    .iter()
                    .map(|(key, value)| format!("{}: {}", key, value))
                    .collect();
                OcrResult {
                    backend: backend.to_string(),
                    lines,
                    structured: Some(fields),
                    ..Default::default()
                }
            }
            None => {
                warn!("llm answer is not a JSON object");
                OcrResult::empty(backend)
            }
        },
    };
    result.usage = usage;
    result
}

fn strip_code_fence(text: &str) -> &str {
    match CODE_FENCE.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => text.trim(),
    }
}

fn structured_fields(text: &str) -> Option<BTreeMap<String, String>> {
    let value: Value = serde_json::from_str(text).ok()?;
    let object = value.as_object()?;
    Some(
        object
            .iter()
            .filter_map(|(key, value)| {
                let value = match value {
                    Value::String(s) => s.trim().to_string(),
                    Value::Number(n) => n.to_string(),
                    Value::Bool(b) => b.to_string(),
                    _ => return None,
                };
                Some((key.clone(), value)).filter(|(_, v)| !v.is_empty())
            })
            .collect(),
    )
}

const MRZ_PROMPT: &str = "Transcribe the machine-readable zone at the bottom of this document exactly as printed, \
one MRZ line per output line, using only A-Z, 0-9 and '<'. Output nothing else.";

fn default_prompt(document_type: DocumentType) -> &'static str {
    match document_type {
        DocumentType::NationalId => {
            "Extract the fields of this Indonesian identity card (KTP). Respond with a single JSON object \
with exactly these keys: province, city, nik, name, birth_place, birth_date, gender, blood_type, \
address, rt_rw, kelurahan_desa, kecamatan, religion, marital_status, occupation, nationality, \
valid_until. Copy values as printed; use an empty string for anything unreadable. No explanations."
        }
        DocumentType::Passport => {
            "Extract the fields of this passport data page. Respond with a single JSON object with exactly \
these keys: passport_number, name, nationality, date_of_birth, gender, expiration_date, country_code. \
Copy values as printed; use an empty string for anything unreadable. No explanations."
        }
    }
}
