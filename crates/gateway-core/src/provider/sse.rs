//! SSE line parsing shared by the streaming adapters (spec §4.3
//! "Streaming protocol"), grounded on both providers' `aiter_lines()` loop
//! in the Python original.

use crate::error::{ProviderError, ProviderResult};
use crate::types::ChatChunk;
use bytes::Bytes;
use futures::{Stream, StreamExt};
use tracing::warn;

/// Parse an upstream byte stream of `data: <json>\n\n`-framed SSE lines
/// into a stream of chunks. Terminates normally on `data: [DONE]`, skips
/// malformed JSON lines with a warning (never errors the whole stream for
/// one bad line), and propagates transport errors as `ProviderError`.
pub fn sse_chunk_stream<S>(bytes_stream: S) -> impl Stream<Item = ProviderResult<ChatChunk>> + Send + 'static
where
    S: Stream<Item = reqwest::Result<Bytes>> + Send + 'static,
{
    async_stream::stream! {
        futures::pin_mut!(bytes_stream);
        let mut buffer = String::new();

        loop {
            match bytes_stream.next().await {
                Some(Ok(bytes)) => {
                    buffer.push_str(&String::from_utf8_lossy(&bytes));

                    while let Some(pos) = buffer.find('\n') {
                        let line = buffer[..pos].trim_end_matches('\r').to_string();
                        buffer.drain(..=pos);

                        let Some(data) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if data == "[DONE]" {
                            return;
                        }
                        match serde_json::from_str::<ChatChunk>(data) {
                            Ok(chunk) => yield Ok(chunk),
                            Err(err) => {
                                warn!(error = %err, line = %data, "failed to parse streaming chunk, skipping");
                            }
                        }
                    }
                }
                Some(Err(err)) => {
                    yield Err(ProviderError::from(err));
                    return;
                }
                None => return,
            }
        }
    }
}
