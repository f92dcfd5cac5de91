use std::convert::Infallible;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use axum::extract::{Path, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use futures_util::Stream;
use tokio::sync::mpsc;
use tracing::{info, warn};

use super::{error_response, UserId};
use crate::models::{new_id, Message};
use crate::service::chat_service::{ChatService, StreamSource};
use crate::stream::{Chunk, StreamHub};

const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// GET `/api/messages/{id}/stream` — Server-Sent Events for one reply.
///
/// Protocol: every event is `data: {"t": <kind code>, "c": "<text>"}`.
/// - Live reply: replay of what has accumulated, then every new chunk, ending
///   with a finish-reason chunk (`t = 4`).
/// - Finished reply: the stored reasoning (when present) and content, then the
///   stream ends.
pub async fn stream_message_handler(
    Path(message_id): Path<String>,
    State(svc): State<ChatService>,
    UserId(user_id): UserId,
) -> Response {
    match svc.stream_source(&user_id, &message_id).await {
        Err(e) => error_response(&e),
        Ok(StreamSource::Live(hub)) => {
            let subscriber_id = new_id();
            info!("Viewer {subscriber_id} attached to live stream {message_id}");
            let rx = hub.subscribe(subscriber_id.clone());
            Sse::new(Subscription { hub, subscriber_id, rx })
                .keep_alive(KeepAlive::new().interval(KEEP_ALIVE_INTERVAL))
                .into_response()
        }
        Ok(StreamSource::Stored(message)) => {
            let events: Vec<Result<Event, Infallible>> =
                stored_chunks(&message).iter().map(chunk_event).map(Ok).collect();
            Sse::new(futures_util::stream::iter(events)).into_response()
        }
    }
}

/// A viewer's delivery queue as an event stream. Dropping it (the client went
/// away) removes the viewer from the hub.
struct Subscription {
    hub: Arc<StreamHub>,
    subscriber_id: String,
    rx: mpsc::Receiver<Chunk>,
}

impl Stream for Subscription {
    type Item = Result<Event, Infallible>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.get_mut().rx.poll_recv(cx).map(|chunk| chunk.map(|chunk| Ok(chunk_event(&chunk))))
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        self.hub.unsubscribe(&self.subscriber_id);
    }
}

fn stored_chunks(message: &Message) -> Vec<Chunk> {
    let mut chunks = Vec::with_capacity(2);
    if !message.parts.reasoning.is_empty() {
        chunks.push(Chunk::reasoning(message.parts.reasoning.clone()));
    }
    chunks.push(Chunk::content(message.parts.content.clone()));
    chunks
}

fn chunk_event(chunk: &Chunk) -> Event {
    match Event::default().json_data(chunk) {
        Ok(event) => event,
        Err(e) => {
            warn!("Failed to encode chunk: {e}");
            Event::default().comment("unencodable chunk")
        }
    }
}
