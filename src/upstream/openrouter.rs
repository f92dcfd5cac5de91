use std::collections::VecDeque;
use std::pin::Pin;

use async_trait::async_trait;
use futures_util::{Stream, StreamExt};
use serde_json::json;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use super::{CompletionFrame, CompletionProvider, CompletionRequest, FrameStream, UpstreamError};
use crate::models::ReasoningEffort;

/// OpenAI-compatible chat-completions client (OpenRouter by default) that
/// streams frames over server-sent events.
#[derive(Clone)]
pub struct OpenRouterProvider {
    client: reqwest::Client,
    base_url: String,
}

impl OpenRouterProvider {
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }
}

/// Request body for a streaming completion, including the OpenRouter
/// extensions for web search and reasoning effort.
pub fn build_request_body(request: &CompletionRequest) -> serde_json::Value {
    let mut body = json!({
        "model": request.model,
        "messages": request.transcript,
        "stream": true,
        "stream_options": { "include_usage": true },
    });

    if request.options.web_search {
        body["plugins"] = json!([{ "id": "web" }]);
    }
    match request.options.reasoning_effort {
        Some(ReasoningEffort::Off) => body["reasoning"] = json!({ "max_tokens": 0 }),
        Some(effort) => body["reasoning"] = json!({ "effort": effort.as_str() }),
        None => {}
    }

    body
}

#[async_trait]
impl CompletionProvider for OpenRouterProvider {
    async fn stream_completion(
        &self,
        request: CompletionRequest,
        cancel: CancellationToken,
    ) -> Result<FrameStream, UpstreamError> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = build_request_body(&request);
        debug!("Opening completion stream at {url} for model {}", request.model);

        let send = self
            .client
            .post(&url)
            .bearer_auth(&request.api_key)
            .json(&body)
            .send();

        let response = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(UpstreamError::Cancelled),
            response = send => response.map_err(|e| UpstreamError::Request(e.to_string()))?,
        };

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            warn!("Provider rejected completion request with {status}");
            return Err(UpstreamError::Status { status: status.as_u16(), body });
        }

        Ok(Box::pin(sse_frames(response.bytes_stream())))
    }
}

// ── SSE decoding ──────────────────────────────────────────────────────────────

enum SseLine {
    Frame(CompletionFrame),
    Done,
    Skip,
}

fn parse_sse_line(line: &str) -> Result<SseLine, UpstreamError> {
    let line = line.trim();
    // Blank separators, `:` comments and non-data fields carry nothing for us.
    let Some(data) = line.strip_prefix("data:") else {
        return Ok(SseLine::Skip);
    };
    let data = data.trim();
    if data.is_empty() {
        return Ok(SseLine::Skip);
    }
    if data == "[DONE]" {
        return Ok(SseLine::Done);
    }

    let value: serde_json::Value =
        serde_json::from_str(data).map_err(|e| UpstreamError::Decode(e.to_string()))?;
    // Mid-stream failures arrive as `{"error": {...}}` payloads.
    if let Some(error) = value.get("error") {
        let message = error
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_owned)
            .unwrap_or_else(|| error.to_string());
        return Err(UpstreamError::Provider(message));
    }
    serde_json::from_value(value)
        .map(SseLine::Frame)
        .map_err(|e| UpstreamError::Decode(e.to_string()))
}

struct SseState<S> {
    body: Pin<Box<S>>,
    buffer: Vec<u8>,
    pending: VecDeque<CompletionFrame>,
    finished: bool,
}

/// Turns a raw SSE byte stream into completion frames. Lines are split on
/// bytes, so multi-byte characters spanning two network reads survive.
pub fn sse_frames<S, B, E>(body: S) -> impl Stream<Item = Result<CompletionFrame, UpstreamError>> + Send
where
    S: Stream<Item = Result<B, E>> + Send + 'static,
    B: AsRef<[u8]> + Send,
    E: std::fmt::Display + Send,
{
    let state = SseState {
        body: Box::pin(body),
        buffer: Vec::new(),
        pending: VecDeque::new(),
        finished: false,
    };

    futures_util::stream::try_unfold(state, |mut state| async move {
        loop {
            if let Some(frame) = state.pending.pop_front() {
                return Ok(Some((frame, state)));
            }
            if state.finished {
                return Ok(None);
            }

            if let Some(pos) = state.buffer.iter().position(|b| *b == b'\n') {
                let raw: Vec<u8> = state.buffer.drain(..=pos).collect();
                let line = String::from_utf8_lossy(&raw);
                match parse_sse_line(&line)? {
                    SseLine::Frame(frame) => state.pending.push_back(frame),
                    SseLine::Done => state.finished = true,
                    SseLine::Skip => {}
                }
                continue;
            }

            match state.body.next().await {
                Some(Ok(bytes)) => state.buffer.extend_from_slice(bytes.as_ref()),
                Some(Err(e)) => return Err(UpstreamError::Transport(e.to_string())),
                None => {
                    // Flush a trailing line that arrived without a newline.
                    if !state.buffer.is_empty() {
                        let raw = std::mem::take(&mut state.buffer);
                        if let SseLine::Frame(frame) = parse_sse_line(&String::from_utf8_lossy(&raw))? {
                            state.pending.push_back(frame);
                        }
                    }
                    state.finished = true;
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use std::convert::Infallible;

    use futures_util::stream;

    use super::*;
    use crate::lineage::TranscriptEntry;
    use crate::models::ModelOptions;

    fn body(parts: Vec<&'static str>) -> impl Stream<Item = Result<&'static [u8], Infallible>> {
        stream::iter(parts.into_iter().map(|p| Ok(p.as_bytes())))
    }

    #[tokio::test]
    async fn decodes_frames_split_across_reads() {
        let frames: Vec<_> = sse_frames(body(vec![
            "data: {\"choices\":[{\"delta\":{\"content\":\"Hel\"}}]}\n\n: keep-alive\n",
            "data: {\"choices\":[{\"delta\":{\"cont",
            "ent\":\"lo\"}}]}\n\ndata: [DONE]\n\n",
            "data: {\"choices\":[{\"delta\":{\"content\":\"ignored\"}}]}\n\n",
        ]))
        .collect()
        .await;

        let contents: Vec<_> = frames
            .into_iter()
            .map(|f| f.unwrap().choices[0].delta.content.clone().unwrap())
            .collect();
        assert_eq!(contents, vec!["Hel", "lo"]);
    }

    #[tokio::test]
    async fn keeps_multibyte_characters_split_between_reads() {
        let snowman = "data: {\"choices\":[{\"delta\":{\"content\":\"\u{2603}\"}}]}\n".as_bytes();
        let (head, tail) = snowman.split_at(snowman.len() - 8);
        let frames: Vec<_> = sse_frames(stream::iter(vec![
            Ok::<_, Infallible>(head.to_vec()),
            Ok(tail.to_vec()),
        ]))
        .collect()
        .await;
        assert_eq!(frames[0].as_ref().unwrap().choices[0].delta.content.as_deref(), Some("\u{2603}"));
    }

    #[tokio::test]
    async fn provider_error_payload_becomes_stream_error() {
        let mut frames = Box::pin(sse_frames(body(vec![
            "data: {\"error\":{\"message\":\"rate limited\",\"code\":429}}\n\n",
        ])));
        let first = frames.next().await.unwrap();
        assert_eq!(first, Err(UpstreamError::Provider("rate limited".into())));
    }

    #[tokio::test]
    async fn invalid_json_is_a_decode_error() {
        let mut frames = Box::pin(sse_frames(body(vec!["data: {not json\n\n"])));
        assert!(matches!(frames.next().await, Some(Err(UpstreamError::Decode(_)))));
    }

    #[test]
    fn request_body_carries_options() {
        let request = CompletionRequest {
            api_key: "k".into(),
            model: "openai/gpt-4o".into(),
            transcript: vec![TranscriptEntry::text(crate::models::MessageRole::User, "hi")],
            options: ModelOptions {
                web_search: true,
                reasoning_effort: Some(ReasoningEffort::Off),
            },
        };
        let body = build_request_body(&request);
        assert_eq!(body["plugins"][0]["id"], "web");
        assert_eq!(body["reasoning"]["max_tokens"], 0);
        assert_eq!(body["messages"][0]["role"], "user");
        assert_eq!(body["messages"][0]["content"], "hi");

        let request = CompletionRequest {
            options: ModelOptions { web_search: false, reasoning_effort: Some(ReasoningEffort::High) },
            ..request
        };
        let body = build_request_body(&request);
        assert!(body.get("plugins").is_none());
        assert_eq!(body["reasoning"]["effort"], "high");
    }
}
