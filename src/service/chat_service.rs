use std::sync::Arc;

use tokio::sync::mpsc::{self, UnboundedSender};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::agent::TitleGenerator;
use crate::db::message_repository::MessageRepository;
use crate::db::session_repository::SessionRepository;
use crate::errors::AppError;
use crate::models::{
    is_placeholder_name, ChatRequest, ChatResponse, ChatSession, SessionMessage, SessionSummary,
};
use crate::service::orchestrator::{ChatOrchestrator, TitleRequest, TurnEvent};

const MAX_MESSAGE_LENGTH: usize = 8000;

fn validate_message(message: &str) -> Result<(), AppError> {
    if message.trim().is_empty() {
        return Err(AppError::EmptyField { field_name: "message".to_string() });
    }
    if message.len() > MAX_MESSAGE_LENGTH {
        return Err(AppError::FieldTooLong {
            field_name: "message".to_string(),
            max_length: MAX_MESSAGE_LENGTH,
            actual_length: message.len(),
        });
    }
    Ok(())
}

/// Asks for a title; `None` keeps the placeholder.
async fn generate_title(titler: &dyn TitleGenerator, request: &TitleRequest) -> Option<String> {
    match titler.generate_title(&request.user_text, &request.assistant_text).await {
        Ok(title) if !is_placeholder_name(&title) => Some(title),
        Ok(_) => None,
        Err(e) => {
            warn!("Title generation failed for session {}: {e}", request.session_id);
            None
        }
    }
}

#[derive(Clone)]
pub struct ChatService {
    session_repo: SessionRepository,
    message_repo: MessageRepository,
    orchestrator: Arc<ChatOrchestrator>,
    titler: Arc<dyn TitleGenerator>,
}

impl ChatService {
    pub fn new(
        session_repo: SessionRepository,
        message_repo: MessageRepository,
        orchestrator: Arc<ChatOrchestrator>,
        titler: Arc<dyn TitleGenerator>,
    ) -> Self {
        Self { session_repo, message_repo, orchestrator, titler }
    }

    pub async fn get_sessions(&self) -> Result<Vec<SessionSummary>, AppError> {
        self.session_repo.find_all().await
    }

    pub async fn get_messages(&self, session_id: &str) -> Result<Vec<SessionMessage>, AppError> {
        self.session_repo
            .find_by_id(session_id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound { id: session_id.to_string() })?;
        self.message_repo.find_by_session_id(session_id).await
    }

    /// Runs a turn without a live observer.
    pub async fn chat(&self, request: ChatRequest) -> Result<ChatResponse, AppError> {
        let (events, _) = mpsc::unbounded_channel();
        self.run_turn(request, &events).await
    }

    /// Runs a turn, reporting progress on `events`, then persists what it appended.
    ///
    /// The session stays claimed from before its history is read until the
    /// turn's messages are committed.
    pub async fn run_turn(
        &self,
        request: ChatRequest,
        events: &UnboundedSender<TurnEvent>,
    ) -> Result<ChatResponse, AppError> {
        validate_message(&request.message)?;

        let session_id = request.session_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let lease = self.orchestrator.claim(&session_id)?;
        let mut session = self.load_or_create(&session_id).await?;
        let preferences = request.preferences.unwrap_or_default();

        let outcome = self
            .orchestrator
            .send_turn(&lease, &mut session, &request.message, &preferences, events)
            .await?;

        self.message_repo.append_turn(&session.id, &outcome.appended).await?;
        drop(lease);

        if outcome.transport_failed {
            warn!("Turn on session {} ended with the chat backend unreachable", session.id);
        }

        if let Some(title_request) = outcome.title_request {
            self.spawn_titling(title_request);
        }

        Ok(ChatResponse { session_id: session.id, messages: outcome.appended })
    }

    async fn load(&self, session_id: &str) -> Result<Option<ChatSession>, AppError> {
        let Some(summary) = self.session_repo.find_by_id(session_id).await? else {
            return Ok(None);
        };
        let messages = self.message_repo.find_by_session_id(session_id).await?;
        Ok(Some(ChatSession {
            id: summary.id,
            name: summary.name,
            messages,
            updated_at: summary.updated_at,
        }))
    }

    /// Existing sessions are read back in full; new ones open with the greeting.
    async fn load_or_create(&self, session_id: &str) -> Result<ChatSession, AppError> {
        if let Some(session) = self.load(session_id).await? {
            return Ok(session);
        }

        let session = ChatSession::start(session_id);
        let summary = SessionSummary::new(session.id.clone(), session.name.clone());
        if self.session_repo.create(&summary, &session.messages).await? {
            info!("Created session {session_id}");
            return Ok(session);
        }

        // Created by another instance between the lookup and the insert.
        self.load(session_id)
            .await?
            .ok_or_else(|| AppError::SessionNotFound { id: session_id.to_string() })
    }

    /// Fire-and-forget: the turn has already completed when this runs.
    fn spawn_titling(&self, request: TitleRequest) {
        let titler = Arc::clone(&self.titler);
        let session_repo = self.session_repo.clone();
        tokio::spawn(async move {
            let Some(title) = generate_title(titler.as_ref(), &request).await else {
                return;
            };
            match session_repo.rename(&request.session_id, &title).await {
                Ok(()) => info!("Session {} titled '{title}'", request.session_id),
                Err(e) => error!("Failed to store title for session {}: {e}", request.session_id),
            }
        });
    }
}
