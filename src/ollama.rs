use crate::chat::{Chat, PromptTemplate};
use crate::config::Config;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use futures_util::StreamExt;
use log::{info, warn};
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::fmt::Debug;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::process::Command;

const RETRY_ATTEMPTS: usize = 3;
const RETRY_BACKOFF: Duration = Duration::from_secs(1);
const CONTROL_TIMEOUT: Duration = Duration::from_secs(10);
const MULTIMODAL_TIMEOUT: Duration = Duration::from_secs(30);
const SLOW_MODEL_TIMEOUT: Duration = Duration::from_secs(300);
const TEXT_TIMEOUT: Duration = Duration::from_secs(120);
const PULL_TIMEOUT: Duration = Duration::from_secs(3600);

/// Model families matching this marker need the generous timeout.
const SLOW_MODEL_MARKER: &str = "xtral";

const DEFAULT_INSTRUCTION: &str =
    "You are a helpful assistant. Respond to the user's request accurately and concisely.";

#[derive(Error, Debug)]
pub enum CompletionError {
    /// The cache remembers this exact request failing before. Retryable by
    /// bypassing the cache.
    #[error("previous attempt at this prompt failed; bypass the cache to retry")]
    CachedFailure,

    #[error("backend request failed after {attempts} attempts: {message}")]
    Transport { attempts: usize, message: String },
}

#[derive(Debug, Clone)]
pub enum Prompt {
    Chat(Chat),
    Text(String),
}

#[derive(Debug, Clone)]
pub struct CompletionRequest {
    pub prompt: Prompt,
    pub model: String,
    pub seed_response: String,
    pub instruction: String,
    pub temperature: f32,
    pub images: Vec<String>,
    pub include_seed: bool,
    pub use_cache: bool,
    pub stream: bool,
}

impl CompletionRequest {
    pub fn chat(chat: Chat, model: &str) -> Self {
        Self::build(Prompt::Chat(chat), model)
    }

    pub fn text(text: &str, model: &str) -> Self {
        Self::build(Prompt::Text(text.to_string()), model)
    }

    fn build(prompt: Prompt, model: &str) -> Self {
        Self {
            prompt,
            model: model.to_string(),
            seed_response: String::new(),
            instruction: DEFAULT_INSTRUCTION.to_string(),
            temperature: 0.8,
            images: Vec::new(),
            include_seed: true,
            use_cache: true,
            stream: false,
        }
    }

    /// Biases the opening tokens of the continuation.
    pub fn seed(mut self, seed: &str) -> Self {
        self.seed_response = seed.to_string();
        self
    }

    pub fn temperature(mut self, temperature: f32) -> Self {
        self.temperature = temperature;
        self
    }

    pub fn images(mut self, images: Vec<String>) -> Self {
        self.images = images;
        self
    }

    pub fn without_seed_in_output(mut self) -> Self {
        self.include_seed = false;
        self
    }

    pub fn no_cache(mut self) -> Self {
        self.use_cache = false;
        self
    }

    pub fn streaming(mut self) -> Self {
        self.stream = true;
        self
    }
}

/// Anything able to turn a prompt into text. The production implementation
/// is [`OllamaClient`]; tests substitute scripted mocks.
#[async_trait]
pub trait CompletionBackend: Send + Sync + Debug {
    async fn complete(&self, request: CompletionRequest) -> Result<String>;
}

/// Append-only completion store, fully loaded at startup and rewritten as a
/// whole on every update. An empty value remembers a failed request.
struct CompletionCache {
    path: PathBuf,
    entries: HashMap<String, String>,
}

impl CompletionCache {
    fn load(path: &Path) -> Self {
        let entries = std::fs::read_to_string(path)
            .ok()
            .and_then(|content| serde_json::from_str(&content).ok())
            .unwrap_or_default();
        Self {
            path: path.to_path_buf(),
            entries,
        }
    }

    fn key(model: &str, temperature: &str, prompt: &str, images: &[String]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(format!("{}:{}:{}{}", model, temperature, prompt, images.join(":")));
        hex::encode(hasher.finalize())
    }

    fn get(&self, key: &str) -> Option<&String> {
        self.entries.get(key)
    }

    fn put(&mut self, key: &str, completion: &str) -> Result<()> {
        self.entries.insert(key.to_string(), completion.to_string());
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let content = serde_json::to_string_pretty(&self.entries)?;
        std::fs::write(&self.path, content).context("Failed to write completion cache")?;
        Ok(())
    }
}

#[derive(Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    response: String,
}

#[derive(Deserialize)]
struct StreamChunk {
    #[serde(default)]
    response: String,
    #[serde(default)]
    done: bool,
}

#[derive(Deserialize)]
struct ShowResponse {
    template: Option<String>,
    error: Option<String>,
}

#[derive(Deserialize)]
struct TagsResponse {
    #[serde(default)]
    models: Vec<ModelTag>,
}

#[derive(Deserialize)]
struct ModelTag {
    name: String,
}

#[derive(Debug)]
pub struct OllamaClient {
    base_url: String,
    container_name: String,
    http: reqwest::Client,
    cache: Mutex<CompletionCache>,
    templates: Mutex<HashMap<String, PromptTemplate>>,
}

impl Debug for CompletionCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompletionCache")
            .field("path", &self.path)
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl OllamaClient {
    /// Connects to the backend, starting its container when unreachable.
    pub async fn new(config: &Config) -> Result<Self> {
        let client = Self::with_base_url(
            &config.backend.base_url,
            Path::new(&config.backend.cache_file),
            &config.backend.container_name,
        );
        client.ensure_running().await?;
        Ok(client)
    }

    pub fn with_base_url(base_url: &str, cache_file: &Path, container_name: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            container_name: container_name.to_string(),
            http: reqwest::Client::new(),
            cache: Mutex::new(CompletionCache::load(cache_file)),
            templates: Mutex::new(HashMap::new()),
        }
    }

    /// Idempotent backend bring-up: probe first, only then drive the
    /// container runtime.
    pub async fn ensure_running(&self) -> Result<()> {
        if self.probe().await {
            return Ok(());
        }

        if self.container_exists().await? {
            if !self.container_running().await? {
                info!("Restarting the existing backend container...");
                run_checked(Command::new("docker").args(["restart", self.container_name.as_str()]))
                    .await?;
            }
        } else {
            info!("Starting a new backend container...");
            run_checked(Command::new("docker").args([
                "run",
                "-d",
                "--gpus=all",
                "-v",
                "ollama:/root/.ollama",
                "-p",
                "11434:11434",
                "--name",
                self.container_name.as_str(),
                "ollama/ollama",
            ]))
            .await?;
        }

        for _ in 0..30 {
            if self.probe().await {
                return Ok(());
            }
            tokio::time::sleep(Duration::from_secs(1)).await;
        }
        Err(anyhow!("backend did not become reachable at {}", self.base_url))
    }

    async fn probe(&self) -> bool {
        let url = format!("{}/tags", self.base_url);
        matches!(
            self.http.get(&url).timeout(CONTROL_TIMEOUT).send().await,
            Ok(resp) if resp.status().is_success()
        )
    }

    async fn container_exists(&self) -> Result<bool> {
        let output = Command::new("docker")
            .args(["ps", "-a", "-q", "--filter"])
            .arg(format!("name={}", self.container_name))
            .output()
            .await
            .context("Failed to query the container runtime")?;
        Ok(!String::from_utf8_lossy(&output.stdout).trim().is_empty())
    }

    async fn container_running(&self) -> Result<bool> {
        let output = Command::new("docker")
            .args(["inspect", "--format={{ .State.Running }}", self.container_name.as_str()])
            .output()
            .await?;
        Ok(String::from_utf8_lossy(&output.stdout).trim() == "true")
    }

    pub async fn list_models(&self) -> Result<Vec<String>> {
        let resp = self.get_with_retry("tags", CONTROL_TIMEOUT).await?;
        let tags: TagsResponse = resp.json().await?;
        Ok(tags.models.into_iter().map(|m| m.name).collect())
    }

    /// Idempotent: pulls only when the model is not already present.
    pub async fn ensure_model(&self, model: &str) -> Result<()> {
        let available = self.list_models().await?;
        let present = available
            .iter()
            .any(|name| name == model || name.starts_with(&format!("{}:", model)));
        if present {
            return Ok(());
        }
        info!("Model '{}' not found. Downloading...", model);
        self.pull_model(model).await?;
        info!("Model '{}' downloaded.", model);
        Ok(())
    }

    async fn pull_model(&self, model: &str) -> Result<()> {
        let body = json!({ "name": model, "stream": false });
        self.post_with_retry("pull", &body, PULL_TIMEOUT).await?;
        Ok(())
    }

    /// Fetches and normalizes a model's prompt template, pulling the model
    /// first when the backend doesn't know it yet. Memoized per model.
    async fn template_for(&self, model: &str) -> Result<PromptTemplate> {
        if let Some(template) = self.templates.lock().unwrap().get(model) {
            return Ok(template.clone());
        }

        let body = json!({ "name": model });
        let resp = self.post_with_retry("show", &body, CONTROL_TIMEOUT).await?;
        let mut show: ShowResponse = resp.json().await?;

        if show.error.is_some() || show.template.is_none() {
            self.pull_model(model).await?;
            let resp = self.post_with_retry("show", &body, CONTROL_TIMEOUT).await?;
            show = resp.json().await?;
        }

        let raw = show
            .template
            .ok_or_else(|| anyhow!("backend returned no template for model '{}'", model))?;
        let template = PromptTemplate::parse(&raw);
        self.templates
            .lock()
            .unwrap()
            .insert(model.to_string(), template.clone());
        Ok(template)
    }

    fn generate_timeout(request: &CompletionRequest) -> Duration {
        if !request.images.is_empty() {
            MULTIMODAL_TIMEOUT
        } else if request.model.contains(SLOW_MODEL_MARKER) {
            SLOW_MODEL_TIMEOUT
        } else {
            TEXT_TIMEOUT
        }
    }

    async fn post_with_retry(
        &self,
        endpoint: &str,
        body: &serde_json::Value,
        timeout: Duration,
    ) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut last_error = String::new();
        for attempt in 1..=RETRY_ATTEMPTS {
            let started = Instant::now();
            match self.http.post(&url).json(body).timeout(timeout).send().await {
                Ok(resp) if resp.status().is_success() => {
                    if endpoint == "generate" {
                        info!("Request took {:.2} seconds", started.elapsed().as_secs_f64());
                    }
                    return Ok(resp);
                }
                Ok(resp) => {
                    let status = resp.status();
                    let text = resp.text().await.unwrap_or_default();
                    last_error = format!("HTTP {}: {}", status, text);
                }
                Err(e) => last_error = e.to_string(),
            }
            warn!(
                "Request failed, attempt {}/{}, error: {}",
                attempt, RETRY_ATTEMPTS, last_error
            );
            if attempt < RETRY_ATTEMPTS {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
        Err(CompletionError::Transport {
            attempts: RETRY_ATTEMPTS,
            message: last_error,
        }
        .into())
    }

    async fn get_with_retry(&self, endpoint: &str, timeout: Duration) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.base_url, endpoint);
        let mut last_error = String::new();
        for attempt in 1..=RETRY_ATTEMPTS {
            match self.http.get(&url).timeout(timeout).send().await {
                Ok(resp) if resp.status().is_success() => return Ok(resp),
                Ok(resp) => last_error = format!("HTTP {}", resp.status()),
                Err(e) => last_error = e.to_string(),
            }
            warn!(
                "Request failed, attempt {}/{}, error: {}",
                attempt, RETRY_ATTEMPTS, last_error
            );
            if attempt < RETRY_ATTEMPTS {
                tokio::time::sleep(RETRY_BACKOFF).await;
            }
        }
        Err(CompletionError::Transport {
            attempts: RETRY_ATTEMPTS,
            message: last_error,
        }
        .into())
    }

    async fn generate(
        &self,
        body: serde_json::Value,
        timeout: Duration,
        stream: bool,
    ) -> Result<String> {
        let resp = self.post_with_retry("generate", &body, timeout).await?;
        if !stream {
            let parsed: GenerateResponse = resp.json().await?;
            return Ok(parsed.response);
        }

        // Streaming responses arrive as newline-delimited JSON chunks.
        let mut full_response = String::new();
        let mut pending = String::new();
        let mut byte_stream = resp.bytes_stream();
        'outer: while let Some(chunk) = byte_stream.next().await {
            let chunk = chunk.context("Streamed response interrupted")?;
            pending.push_str(&String::from_utf8_lossy(&chunk));
            while let Some(newline) = pending.find('\n') {
                let line = pending[..newline].trim().to_string();
                pending.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                let parsed: StreamChunk = serde_json::from_str(&line)
                    .with_context(|| format!("Malformed stream chunk: {}", line))?;
                full_response.push_str(&parsed.response);
                if parsed.done {
                    break 'outer;
                }
            }
        }
        Ok(full_response)
    }

    fn cache_lookup(&self, key: &str) -> Option<String> {
        self.cache.lock().unwrap().get(key).cloned()
    }

    fn cache_store(&self, key: &str, completion: &str) {
        if let Err(e) = self.cache.lock().unwrap().put(key, completion) {
            warn!("Failed to persist completion cache: {}", e);
        }
    }
}

pub fn format_temperature(temperature: f32) -> String {
    format!("{}", (temperature * 100.0).round() / 100.0)
}

async fn run_checked(command: &mut Command) -> Result<()> {
    let status = command.status().await.context("Failed to run container command")?;
    if !status.success() {
        anyhow::bail!("container command exited with {}", status);
    }
    Ok(())
}

#[async_trait]
impl CompletionBackend for OllamaClient {
    async fn complete(&self, request: CompletionRequest) -> Result<String> {
        let temperature = format_temperature(request.temperature);
        let template = self.template_for(&request.model).await?;

        let rendered = match &request.prompt {
            Prompt::Chat(chat) => chat.render(&template),
            // Multimodal prompts carry no instruction; the vision models
            // expect the bare question.
            Prompt::Text(text) if request.images.is_empty() => {
                template.render(&request.instruction, text)
            }
            Prompt::Text(text) => template.render("", text),
        };

        // The fingerprint is taken before the seed is appended so a request
        // is identified by what the caller asked, not how the response is
        // biased to open.
        let cache_key = CompletionCache::key(&request.model, &temperature, &rendered, &request.images);

        if request.use_cache {
            if let Some(cached) = self.cache_lookup(&cache_key) {
                if cached.is_empty() {
                    return Err(CompletionError::CachedFailure.into());
                }
                info!("Cache hit! For: {}", request.model);
                return Ok(if request.include_seed {
                    format!("{}{}", request.seed_response, cached)
                } else {
                    cached
                });
            }
        }

        let prompt_with_seed = format!("{}{}", rendered, request.seed_response);
        let body = if request.images.is_empty() {
            json!({
                "model": request.model,
                "prompt": prompt_with_seed,
                "temperature": temperature,
                "raw": true,
                "stream": request.stream,
            })
        } else {
            json!({
                "model": request.model,
                "prompt": prompt_with_seed,
                "images": request.images,
                "stream": request.stream,
            })
        };

        let timeout = Self::generate_timeout(&request);
        let completion = match self.generate(body, timeout, request.stream).await {
            Ok(text) => text,
            Err(e) => {
                if !request.images.is_empty() {
                    // Remember failing multimodal inputs so repeat calls fail
                    // fast instead of re-incurring the cost.
                    self.cache_store(&cache_key, "");
                }
                return Err(e);
            }
        };

        self.cache_store(&cache_key, &completion);

        Ok(if request.include_seed {
            format!("{}{}", request.seed_response, completion)
        } else {
            completion
        })
    }
}
