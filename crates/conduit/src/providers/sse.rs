//! Server-sent events decoding shared by every adapter.

use std::future::Future;

use futures::stream::{BoxStream, StreamExt};
use reqwest::Response;

use super::base::StreamEvent;
use crate::errors::ProviderError;

/// Maximum number of undecoded bytes we hold before giving up on the stream.
const MAX_BUFFER: usize = 16 * 1024 * 1024;

/// Splits a byte stream into SSE `data:` payloads. Bytes may arrive split
/// anywhere, including inside a multi-byte character.
#[derive(Debug, Default)]
pub struct SseDecoder {
    buffer: String,
    utf8_buf: Vec<u8>,
}

impl SseDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed raw bytes and return every payload completed by them.
    pub fn push(&mut self, bytes: &[u8]) -> Result<Vec<String>, ProviderError> {
        self.utf8_buf.extend_from_slice(bytes);
        if self.utf8_buf.len() + self.buffer.len() > MAX_BUFFER {
            return Err(ProviderError::Stream(
                "event stream buffer exceeded 16 MiB".into(),
            ));
        }

        loop {
            match std::str::from_utf8(&self.utf8_buf) {
                Ok(text) => {
                    self.buffer.push_str(&text.replace('\r', ""));
                    self.utf8_buf.clear();
                    break;
                }
                Err(e) => {
                    let valid_up_to = e.valid_up_to();
                    let valid = String::from_utf8_lossy(&self.utf8_buf[..valid_up_to]).into_owned();
                    self.buffer.push_str(&valid.replace('\r', ""));
                    match e.error_len() {
                        // Incomplete character at the end, wait for more bytes.
                        None => {
                            self.utf8_buf.drain(..valid_up_to);
                            break;
                        }
                        Some(invalid) => {
                            self.utf8_buf.drain(..valid_up_to + invalid);
                        }
                    }
                }
            }
        }

        let mut payloads = Vec::new();
        while let Some(pos) = self.buffer.find("\n\n") {
            let event: String = self.buffer.drain(..pos + 2).collect();
            if let Some(data) = extract_data(&event) {
                payloads.push(data);
            }
        }
        Ok(payloads)
    }

    /// Payload of a final event that was not followed by a blank line.
    pub fn finish(&mut self) -> Option<String> {
        let rest = std::mem::take(&mut self.buffer);
        extract_data(&rest)
    }
}

/// Join the `data:` lines of one event. Comments and other fields are ignored.
fn extract_data(event: &str) -> Option<String> {
    let lines: Vec<&str> = event
        .lines()
        .filter_map(|line| line.strip_prefix("data:"))
        .map(|data| data.strip_prefix(' ').unwrap_or(data))
        .collect();
    if lines.is_empty() {
        None
    } else {
        Some(lines.join("\n"))
    }
}

/// Vendor specific interpretation of SSE payloads.
pub trait EventDecoder: Send {
    fn on_data(&mut self, data: &str) -> Vec<StreamEvent>;

    /// Called once when the body ends without an error.
    fn on_end(&mut self) -> Vec<StreamEvent>;
}

/// A round that fails before any request is made.
pub fn error_stream<'a>(error: ProviderError) -> BoxStream<'a, StreamEvent> {
    Box::pin(futures::stream::once(async move { StreamEvent::Error(error) }))
}

/// Turn a pending HTTP response into a stream of [`StreamEvent`]s. Nothing is
/// emitted after the first `Error` event.
pub fn decode_stream<'a, F, D>(response: F, mut decoder: D) -> BoxStream<'a, StreamEvent>
where
    F: Future<Output = Result<Response, ProviderError>> + Send + 'a,
    D: EventDecoder + 'a,
{
    Box::pin(async_stream::stream! {
        match response.await {
            Err(e) => yield StreamEvent::Error(e),
            Ok(response) => {
                let mut sse = SseDecoder::new();
                let mut body = response.bytes_stream();
                let mut failed = false;

                'read: while let Some(chunk) = body.next().await {
                    let payloads = match chunk {
                        Ok(bytes) => sse.push(&bytes),
                        Err(e) => Err(ProviderError::Stream(e.to_string())),
                    };
                    let payloads = match payloads {
                        Ok(payloads) => payloads,
                        Err(e) => {
                            yield StreamEvent::Error(e);
                            failed = true;
                            break 'read;
                        }
                    };
                    for data in payloads {
                        for event in decoder.on_data(&data) {
                            let terminal = matches!(event, StreamEvent::Error(_));
                            yield event;
                            if terminal {
                                failed = true;
                                break 'read;
                            }
                        }
                    }
                }

                if !failed {
                    let mut tail = sse.finish().map(|data| decoder.on_data(&data)).unwrap_or_default();
                    let errored = tail.iter().any(|e| matches!(e, StreamEvent::Error(_)));
                    if !errored {
                        tail.extend(decoder.on_end());
                    }
                    for event in tail {
                        yield event;
                    }
                }
            }
        }
    })
}
