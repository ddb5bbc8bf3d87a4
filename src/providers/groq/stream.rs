use futures::StreamExt;
use tokio::sync::mpsc;

use super::models::StreamChunk;
use crate::providers::types::StreamEvent;

/// Incremental decoder for an OpenAI-style `text/event-stream` body.
///
/// Bytes may arrive split anywhere, including inside a UTF-8 sequence or an
/// SSE event, so both are buffered until complete.
#[derive(Debug, Default)]
pub struct SseDecoder {
    byte_buf: Vec<u8>,
    buffer: String,
    tokens_in: Option<i64>,
    tokens_out: Option<i64>,
    finished: bool,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_finished(&self) -> bool {
        self.finished
    }

    /// Feed a chunk of the body and return the events it completes.
    pub fn push(&mut self, bytes: &[u8]) -> Vec<StreamEvent> {
        let mut events = Vec::new();
        if self.finished {
            return events;
        }

        self.byte_buf.extend_from_slice(bytes);
        let decoded = self.take_utf8();
        if decoded.is_empty() {
            return events;
        }

        self.buffer.push_str(&decoded.replace("\r\n", "\n"));

        while let Some(event_end) = self.buffer.find("\n\n") {
            let event_text: String = self.buffer.drain(..event_end + 2).collect();

            for line in event_text.lines() {
                let payload = match line
                    .strip_prefix("data: ")
                    .or_else(|| line.strip_prefix("data:"))
                {
                    Some(p) => p.trim(),
                    None => continue,
                };

                if payload == "[DONE]" {
                    self.finished = true;
                    events.push(self.done_event());
                    return events;
                }

                match serde_json::from_str::<StreamChunk>(payload) {
                    Ok(chunk) => {
                        if let Some(usage) = chunk.x_groq.and_then(|x| x.usage) {
                            self.tokens_in = usage.prompt_tokens;
                            self.tokens_out = usage.completion_tokens;
                        }
                        if let Some(content) = chunk
                            .choices
                            .into_iter()
                            .next()
                            .and_then(|c| c.delta.content)
                        {
                            if !content.is_empty() {
                                events.push(StreamEvent::Token(content));
                            }
                        }
                    }
                    Err(e) => {
                        tracing::warn!("Failed to parse SSE data: {}", e);
                    }
                }
            }
        }

        events
    }

    /// Completion event for a body that ended without `[DONE]`.
    pub fn finish(mut self) -> Option<StreamEvent> {
        if self.finished {
            None
        } else {
            self.finished = true;
            Some(self.done_event())
        }
    }

    fn done_event(&self) -> StreamEvent {
        StreamEvent::Done {
            tokens_in: self.tokens_in,
            tokens_out: self.tokens_out,
        }
    }

    // Decode as much valid UTF-8 as possible, leaving an incomplete trailing
    // sequence in the byte buffer.
    fn take_utf8(&mut self) -> String {
        match std::str::from_utf8(&self.byte_buf) {
            Ok(s) => {
                let decoded = s.to_string();
                self.byte_buf.clear();
                decoded
            }
            Err(e) => {
                let consumed = match e.error_len() {
                    Some(bad) => e.valid_up_to() + bad,
                    None => e.valid_up_to(),
                };
                let decoded = String::from_utf8_lossy(&self.byte_buf[..consumed]).into_owned();
                self.byte_buf.drain(..consumed);
                decoded
            }
        }
    }
}

pub async fn forward_sse(response: reqwest::Response, tx: mpsc::Sender<StreamEvent>) {
    let mut stream = response.bytes_stream();
    let mut decoder = SseDecoder::new();

    while let Some(chunk_result) = stream.next().await {
        let bytes = match chunk_result {
            Ok(b) => b,
            Err(e) => {
                let _ = tx
                    .send(StreamEvent::Error(format!("Stream error: {}", e)))
                    .await;
                return;
            }
        };

        for event in decoder.push(&bytes) {
            if tx.send(event).await.is_err() {
                return; // receiver dropped
            }
        }

        if decoder.is_finished() {
            return;
        }
    }

    if let Some(done) = decoder.finish() {
        let _ = tx.send(done).await;
    }
}
