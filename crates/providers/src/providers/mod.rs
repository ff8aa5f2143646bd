//! Built-in HTTP providers

use bytes::Bytes;
use futures::stream::{self, BoxStream, Stream, StreamExt};
use reqwest::header::RETRY_AFTER;
use reqwest::Response;
use std::time::Duration;

use crate::error::{ProviderError, Result};

#[cfg(feature = "cloud")]
pub mod cloud;
#[cfg(feature = "local")]
pub mod local;

#[cfg(feature = "cloud")]
pub use cloud::{CloudApiFactory, CloudApiProvider};
#[cfg(feature = "local")]
pub use local::{LocalModelRunnerFactory, LocalModelRunnerProvider};

/// Turn a non-success response into a classified error.
pub(crate) async fn error_from_response(response: Response) -> ProviderError {
    let status = response.status().as_u16();
    let retry_after = response
        .headers()
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map(Duration::from_secs);
    let body = response.text().await.unwrap_or_default();
    let message = extract_error_message(&body).unwrap_or_else(|| format!("HTTP {}", status));

    match ProviderError::from_status(status, message) {
        ProviderError::RateLimit { message, .. } => ProviderError::rate_limited(message, retry_after),
        other => other,
    }
}

/// Pull a human readable message out of `{"error": "..."}` or
/// `{"error": {"message": "..."}}` bodies.
fn extract_error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    match value.get("error")? {
        serde_json::Value::String(s) => Some(s.clone()),
        other => other
            .get("message")
            .and_then(|m| m.as_str())
            .map(str::to_string),
    }
}

/// Split a byte stream into trimmed, non-empty text lines.
pub(crate) fn byte_lines<S>(bytes: S) -> BoxStream<'static, Result<String>>
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    let state = (Box::pin(bytes), Vec::<u8>::new(), false);

    stream::unfold(state, |(mut bytes, mut buffer, mut finished)| async move {
        loop {
            if let Some(pos) = buffer.iter().position(|b| *b == b'\n') {
                let line: Vec<u8> = buffer.drain(..=pos).collect();
                let text = String::from_utf8_lossy(&line).trim().to_string();
                if text.is_empty() {
                    continue;
                }
                return Some((Ok(text), (bytes, buffer, finished)));
            }

            if finished {
                let text = String::from_utf8_lossy(&buffer).trim().to_string();
                buffer.clear();
                if text.is_empty() {
                    return None;
                }
                return Some((Ok(text), (bytes, buffer, finished)));
            }

            match bytes.next().await {
                Some(Ok(chunk)) => buffer.extend_from_slice(&chunk),
                Some(Err(e)) => {
                    finished = true;
                    buffer.clear();
                    return Some((Err(ProviderError::from(e)), (bytes, buffer, finished)));
                }
                None => finished = true,
            }
        }
    })
    .boxed()
}
