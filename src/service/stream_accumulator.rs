use futures_util::{Stream, StreamExt};

use crate::errors::AppError;
use crate::models::{SessionMessage, StreamChunk};

/// Folds streamed text fragments into one in-progress model message.
pub struct StreamAccumulator {
    message: SessionMessage,
    buffer: String,
}

impl StreamAccumulator {
    /// Starts from the placeholder shown while the reply is being typed.
    pub fn new(placeholder: SessionMessage) -> Self {
        Self { message: placeholder, buffer: String::new() }
    }

    /// Appends a fragment and returns a snapshot carrying the full text so far.
    /// Empty fragments are ignored and yield no snapshot.
    pub fn push(&mut self, chunk: StreamChunk) -> Option<SessionMessage> {
        if chunk.text.is_empty() {
            return None;
        }
        self.buffer.push_str(&chunk.text);
        self.message.text.clone_from(&self.buffer);
        Some(self.message.clone())
    }

    /// The message with the buffer as its definitive text.
    pub fn finish(mut self) -> SessionMessage {
        self.message.text = self.buffer;
        self.message
    }
}

/// Outcome of draining a transport stream.
#[derive(Debug)]
pub struct Accumulated {
    /// Message holding everything received, even when the stream failed.
    pub message: SessionMessage,
    pub failure: Option<AppError>,
}

/// Drains `chunks` into `placeholder`, handing each snapshot to `on_snapshot`.
///
/// Stops at the first transport error; text collected before it is kept.
pub async fn accumulate<S, F>(placeholder: SessionMessage, chunks: S, mut on_snapshot: F) -> Accumulated
where
    S: Stream<Item = Result<StreamChunk, AppError>> + Unpin,
    F: FnMut(&SessionMessage),
{
    let mut accumulator = StreamAccumulator::new(placeholder);
    let mut chunks = chunks;
    let mut failure = None;

    while let Some(item) = chunks.next().await {
        match item {
            Ok(chunk) => {
                if let Some(snapshot) = accumulator.push(chunk) {
                    on_snapshot(&snapshot);
                }
            }
            Err(e) => {
                failure = Some(e);
                break;
            }
        }
    }

    Accumulated { message: accumulator.finish(), failure }
}
