//! Drives one chat turn: send, stream, extract, enrich, then maybe ask for a title.
//!
//! The session is passed in explicitly and mutated only between suspension
//! points; observers get every intermediate state over an unbounded channel.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, warn};

use crate::agent::prompts::SYSTEM_INSTRUCTION;
use crate::agent::ChatTransport;
use crate::errors::AppError;
use crate::geocoding::enricher::GeocodingEnricher;
use crate::models::{
    is_placeholder_name, ChatSession, ChatTurn, Coordinate, Itinerary, SessionMessage, UserPreferences,
};
use crate::service::itinerary_extractor::{self, Extracted};
use crate::service::stream_accumulator::{accumulate, Accumulated};

/// Shown as its own model message when the chat backend fails mid-turn.
pub const TRANSPORT_FAILURE_NOTICE: &str = "网络错误，请稍后重试。";

/// A session is titled once it holds at least this many messages.
const MIN_MESSAGES_FOR_TITLE: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TurnPhase {
    Sending,
    Streaming,
    Extracting,
    Enriching,
    Titling,
    Idle,
}

/// Progress of a turn, in the order observers receive it.
#[derive(Debug, Clone, PartialEq)]
pub enum TurnEvent {
    Started { session_id: String, user_message: SessionMessage },
    /// In-progress reply with the full text received so far.
    Snapshot(SessionMessage),
    /// Reply with cleaned text and, when present, the enriched itinerary.
    Finalized(SessionMessage),
    /// Transport failure; `partial` is the text already shown, if any.
    Failed { partial: Option<SessionMessage>, notice: SessionMessage },
}

/// Side-channel request to name a still-untitled session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TitleRequest {
    pub session_id: String,
    pub user_text: String,
    pub assistant_text: String,
}

#[derive(Debug)]
pub struct TurnOutcome {
    /// Messages this turn appended to the session, in order.
    pub appended: Vec<SessionMessage>,
    pub title_request: Option<TitleRequest>,
    pub transport_failed: bool,
}

/// Exclusive right to run a turn on one session. The session leaves the
/// in-flight set when the lease is dropped.
pub struct TurnLease<'a> {
    sessions: &'a Mutex<HashSet<String>>,
    id: String,
}

impl Drop for TurnLease<'_> {
    fn drop(&mut self) {
        self.sessions.lock().unwrap_or_else(PoisonError::into_inner).remove(&self.id);
    }
}

pub struct ChatOrchestrator {
    transport: Arc<dyn ChatTransport>,
    enricher: Arc<GeocodingEnricher>,
    in_flight: Mutex<HashSet<String>>,
}

impl ChatOrchestrator {
    pub fn new(transport: Arc<dyn ChatTransport>, enricher: Arc<GeocodingEnricher>) -> Self {
        Self { transport, enricher, in_flight: Mutex::new(HashSet::new()) }
    }

    /// Reserves `session_id` for one turn. Fails while another turn on the
    /// same session still holds its lease.
    ///
    /// Callers take the lease before loading the session and keep it until
    /// the turn's messages are stored.
    pub fn claim(&self, session_id: &str) -> Result<TurnLease<'_>, AppError> {
        let mut sessions = self.in_flight.lock().unwrap_or_else(PoisonError::into_inner);
        if !sessions.insert(session_id.to_string()) {
            return Err(AppError::TurnInProgress { id: session_id.to_string() });
        }
        Ok(TurnLease { sessions: &self.in_flight, id: session_id.to_string() })
    }

    /// Runs a full turn for `user_text` against `session`.
    ///
    /// Every failure below the turn is absorbed: a transport failure appends
    /// [`TRANSPORT_FAILURE_NOTICE`] and ends the turn.
    pub async fn send_turn(
        &self,
        lease: &TurnLease<'_>,
        session: &mut ChatSession,
        user_text: &str,
        preferences: &UserPreferences,
        events: &UnboundedSender<TurnEvent>,
    ) -> Result<TurnOutcome, AppError> {
        if lease.id != session.id {
            return Err(AppError::Unexpected(format!(
                "turn lease for session '{}' used on session '{}'",
                lease.id, session.id
            )));
        }
        let first_new = session.messages.len();
        let emit = |event: TurnEvent| {
            // A departed observer must not stop the turn.
            let _ = events.send(event);
        };

        enter(TurnPhase::Sending, &session.id);
        let user_message = SessionMessage::user(user_text);
        session.push(user_message.clone());
        emit(TurnEvent::Started { session_id: session.id.clone(), user_message });

        let history = outgoing_history(session, preferences);
        let placeholder = SessionMessage::model("");
        session.push(placeholder.clone());

        let chunks = match self.transport.send_chat(SYSTEM_INSTRUCTION, history).await {
            Ok(chunks) => chunks,
            Err(e) => {
                let outcome = self.fail(session, placeholder, e, first_new, &emit);
                return Ok(outcome);
            }
        };

        enter(TurnPhase::Streaming, &session.id);
        let Accumulated { message, failure } = accumulate(placeholder, chunks, |snapshot| {
            session.replace(snapshot.clone());
            emit(TurnEvent::Snapshot(snapshot.clone()));
        })
        .await;

        if let Some(e) = failure {
            return Ok(self.fail(session, message, e, first_new, &emit));
        }

        enter(TurnPhase::Extracting, &session.id);
        let Extracted { cleaned_text, itinerary } = itinerary_extractor::extract(&message.text);

        let itinerary = match itinerary {
            Some(itinerary) => {
                enter(TurnPhase::Enriching, &session.id);
                let mut itinerary = self.enrich(itinerary, preferences.default_city()).await;
                itinerary.fill_default_days();
                Some(itinerary)
            }
            None => None,
        };

        let mut reply = message;
        reply.text = cleaned_text;
        reply.itinerary = itinerary;
        session.replace(reply.clone());
        emit(TurnEvent::Finalized(reply.clone()));

        let title_request = (is_placeholder_name(&session.name)
            && session.messages.len() >= MIN_MESSAGES_FOR_TITLE)
            .then(|| {
                enter(TurnPhase::Titling, &session.id);
                TitleRequest {
                    session_id: session.id.clone(),
                    user_text: user_text.to_string(),
                    assistant_text: reply.text.clone(),
                }
            });

        enter(TurnPhase::Idle, &session.id);
        Ok(TurnOutcome {
            appended: session.messages[first_new..].to_vec(),
            title_request,
            transport_failed: false,
        })
    }

    /// Keeps whatever was streamed, then appends the fixed notice.
    fn fail(
        &self,
        session: &mut ChatSession,
        partial: SessionMessage,
        cause: AppError,
        first_new: usize,
        emit: &impl Fn(TurnEvent),
    ) -> TurnOutcome {
        error!("Chat transport failed for session {}: {cause}", session.id);

        let partial = if partial.text.is_empty() {
            session.messages.retain(|m| m.id != partial.id);
            None
        } else {
            session.replace(partial.clone());
            Some(partial)
        };

        let notice = SessionMessage::model(TRANSPORT_FAILURE_NOTICE);
        session.push(notice.clone());
        emit(TurnEvent::Failed { partial, notice });

        enter(TurnPhase::Idle, &session.id);
        TurnOutcome {
            appended: session.messages[first_new..].to_vec(),
            title_request: None,
            transport_failed: true,
        }
    }

    /// Runs the enricher in its own task so even a crash inside it leaves the
    /// itinerary in place, with every point unresolved.
    async fn enrich(&self, itinerary: Itinerary, default_city: Option<&str>) -> Itinerary {
        let enricher = Arc::clone(&self.enricher);
        let input = itinerary.clone();
        let default_city = default_city.map(str::to_string);

        match tokio::spawn(async move { enricher.enrich(input, default_city.as_deref()).await }).await {
            Ok(enriched) => enriched,
            Err(e) => {
                warn!("Itinerary enrichment failed, keeping unresolved points: {e}");
                let mut fallback = itinerary;
                for point in &mut fallback.points {
                    point.set_coordinate(Coordinate::UNRESOLVED);
                }
                fallback
            }
        }
    }
}

fn enter(phase: TurnPhase, session_id: &str) {
    debug!("Session {session_id}: {phase:?}");
}

/// History for the backend: everything non-empty so far, with the preference
/// context appended to the newest user turn.
fn outgoing_history(session: &ChatSession, preferences: &UserPreferences) -> Vec<ChatTurn> {
    let mut history: Vec<ChatTurn> = session
        .messages
        .iter()
        .filter(|m| !m.text.is_empty())
        .map(ChatTurn::from)
        .collect();

    let context = preferences.format_context();
    if let Some(last) = history.last_mut() {
        last.content.push_str(&context);
    }
    history
}
