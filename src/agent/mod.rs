pub mod prompts;

use async_trait::async_trait;
use futures_util::stream::{self, BoxStream};
use futures_util::StreamExt;
use rig::agent::MultiTurnStreamItem;
use rig::client::Nothing;
use rig::completion::Chat;
use rig::message::Message as RigMessage;
use rig::prelude::CompletionClient;
use rig::providers::ollama;
use rig::streaming::{StreamedAssistantContent, StreamingChat};
use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::errors::AppError;
use crate::models::{ChatTurn, StreamChunk, TurnRole, PLACEHOLDER_SESSION_NAME};

pub const DEFAULT_MODEL: &str = "llama3.2";

/// Lazy, non-restartable sequence of reply fragments. An `Err` item is terminal.
pub type ChunkStream = BoxStream<'static, Result<StreamChunk, AppError>>;

/// Chat backend: takes the system prompt plus ordered history (last entry is
/// the new user turn) and streams the reply.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_chat(&self, system_prompt: &str, history: Vec<ChatTurn>) -> Result<ChunkStream, AppError>;
}

#[async_trait]
pub trait TitleGenerator: Send + Sync {
    async fn generate_title(&self, user_text: &str, assistant_text: &str) -> Result<String, AppError>;
}

/// Cleans a raw model title; falls back to the placeholder when nothing is left.
pub fn tidy_title(raw: &str) -> String {
    let title: String = raw.trim().chars().filter(|c| !matches!(c, '"' | '《' | '》')).collect();
    let title = title.trim();
    if title.is_empty() {
        PLACEHOLDER_SESSION_NAME.to_string()
    } else {
        title.to_string()
    }
}

/// Builds a rig [`RigMessage`] history list from transport turns.
fn to_rig_history(turns: &[ChatTurn]) -> Vec<RigMessage> {
    turns
        .iter()
        .map(|t| match t.role {
            TurnRole::User => RigMessage::user(&t.content),
            TurnRole::Assistant => RigMessage::assistant(&t.content),
        })
        .collect()
}

/// Chat transport and title generator backed by the rig [`ollama::Client`].
/// A fresh agent is built per request so the history is replayed each time.
#[derive(Clone)]
pub struct OllamaAgentService {
    client: ollama::Client,
    base_url: String,
    model: String,
}

impl OllamaAgentService {
    pub fn new(base_url: &str, model: &str) -> Self {
        let client = ollama::Client::builder()
            .api_key(Nothing)
            .base_url(base_url)
            .build()
            .expect("Failed to build Ollama client");
        Self {
            client,
            base_url: base_url.to_string(),
            model: model.to_string(),
        }
    }

    fn classify_error(&self, msg: String) -> AppError {
        if msg.contains("Connection refused") || msg.contains("connect") {
            AppError::OllamaUnavailable { host: self.base_url.clone() }
        } else if msg.contains("model") {
            AppError::ModelNotFound { model_name: self.model.clone() }
        } else {
            AppError::InferenceError { message: msg }
        }
    }

    /// Streams one reply into `tx`. Returns once the model is done or the
    /// receiver has gone away.
    async fn stream_chat(
        &self,
        system_prompt: &str,
        history: &[ChatTurn],
        tx: &mpsc::Sender<Result<StreamChunk, AppError>>,
    ) -> Result<(), AppError> {
        let Some((prompt, earlier)) = history.split_last() else {
            return Err(AppError::EmptyField { field_name: "history".to_string() });
        };

        let agent = self
            .client
            .agent(&self.model)
            .preamble(system_prompt)
            .build();

        let mut stream = agent
            .stream_chat(prompt.content.as_str(), to_rig_history(earlier))
            .await;

        while let Some(item) = stream.next().await {
            match item {
                Ok(MultiTurnStreamItem::StreamAssistantItem(StreamedAssistantContent::Text(text))) => {
                    if tx.send(Ok(StreamChunk::new(text.text))).await.is_err() {
                        debug!("Stream receiver dropped; stopping generation");
                        return Ok(());
                    }
                }
                Ok(_) => {}
                Err(e) => return Err(self.classify_error(e.to_string())),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChatTransport for OllamaAgentService {
    async fn send_chat(&self, system_prompt: &str, history: Vec<ChatTurn>) -> Result<ChunkStream, AppError> {
        let (tx, rx) = mpsc::channel::<Result<StreamChunk, AppError>>(64);
        let agent = self.clone();
        let system_prompt = system_prompt.to_string();

        tokio::spawn(async move {
            if let Err(e) = agent.stream_chat(&system_prompt, &history, &tx).await {
                error!("Ollama streaming failed: {e}");
                let _ = tx.send(Err(e)).await;
            }
        });

        Ok(stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|item| (item, rx)) }).boxed())
    }
}

#[async_trait]
impl TitleGenerator for OllamaAgentService {
    async fn generate_title(&self, user_text: &str, assistant_text: &str) -> Result<String, AppError> {
        let agent = self
            .client
            .agent(&self.model)
            .preamble(prompts::TITLE_PREAMBLE)
            .build();

        let prompt = prompts::title_prompt(user_text, assistant_text);
        let raw = agent
            .chat(prompt.as_str(), Vec::<RigMessage>::new())
            .await
            .map_err(|e| self.classify_error(e.to_string()))?;

        Ok(tidy_title(&raw))
    }
}
