//! Minimal Server-Sent-Events line decoder shared by every upstream adapter
//! that speaks SSE (all of them, for streaming).
//!
//! Takes a byte stream as it arrives off the wire and yields one parsed JSON
//! [`Value`] per `data: ...` frame. `data: [DONE]` frames are swallowed —
//! the Pipeline emits its own terminator (spec §4.3) rather than forwarding
//! the upstream's.

use bytes::Bytes;
use futures_util::{Stream, StreamExt};
use serde_json::Value;

/// Decode a raw SSE byte stream into parsed JSON chunk values.
///
/// Buffers partial lines across chunk boundaries (TCP reads don't respect
/// SSE frame boundaries) and splits on `\n`, tolerating either `\n` or `\r\n`.
pub fn decode<S>(mut bytes: S) -> impl Stream<Item = anyhow::Result<Value>>
where
    S: Stream<Item = anyhow::Result<Bytes>> + Unpin + Send + 'static,
{
    async_stream::stream! {
        let mut buf = String::new();
        while let Some(next) = bytes.next().await {
            let chunk = match next {
                Ok(b) => b,
                Err(e) => {
                    yield Err(e);
                    continue;
                }
            };
            buf.push_str(&String::from_utf8_lossy(&chunk));

            while let Some(pos) = buf.find('\n') {
                let line = buf[..pos].trim_end_matches('\r').to_string();
                buf.drain(..=pos);

                let Some(payload) = line.strip_prefix("data:") else { continue };
                let payload = payload.trim();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<Value>(payload) {
                    Ok(value) => yield Ok(value),
                    Err(e) => yield Err(anyhow::Error::from(e).context("parsing SSE data frame")),
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures_util::StreamExt;

    fn byte_stream(parts: Vec<&'static str>) -> impl Stream<Item = anyhow::Result<Bytes>> + Unpin {
        futures_util::stream::iter(parts.into_iter().map(|p| Ok(Bytes::from_static(p.as_bytes()))))
    }

    #[tokio::test]
    async fn decodes_single_complete_frame() {
        let stream = byte_stream(vec!["data: {\"delta\":\"he\"}\n\n"]);
        let out: Vec<_> = decode(stream).collect().await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap()["delta"], "he");
    }

    #[tokio::test]
    async fn skips_done_sentinel() {
        let stream = byte_stream(vec!["data: {\"delta\":\"he\"}\n\n", "data: [DONE]\n\n"]);
        let out: Vec<_> = decode(stream).collect().await;
        assert_eq!(out.len(), 1);
    }

    #[tokio::test]
    async fn reassembles_a_frame_split_across_chunks() {
        let stream = byte_stream(vec!["data: {\"delta\"", ":\"he\"}\n\n"]);
        let out: Vec<_> = decode(stream).collect().await;
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].as_ref().unwrap()["delta"], "he");
    }

    #[tokio::test]
    async fn decodes_multiple_frames_in_one_chunk() {
        let stream = byte_stream(vec!["data: {\"delta\":\"he\"}\n\ndata: {\"delta\":\"llo\"}\n\n"]);
        let out: Vec<_> = decode(stream).collect().await;
        assert_eq!(out.len(), 2);
        assert_eq!(out[1].as_ref().unwrap()["delta"], "llo");
    }
}
