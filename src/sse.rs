//! Server-Sent Events (SSE) processing for streaming responses.
//!
//! The DeepSeek chat-completions endpoint streams replies as data-only SSE
//! frames (`data: {json}`) terminated by a literal `data: [DONE]` frame.
//! This module turns the raw HTTP byte stream into a stream of parsed
//! [`ChatCompletionChunk`] values, handling buffering, keep-alive comments,
//! and error conditions.

use bytes::Bytes;
use futures::stream::{self, Stream, StreamExt};

use crate::client::ChatCompletionChunk;
use crate::error::{Error, Result};

/// Outcome of parsing one SSE frame.
enum Frame {
    /// A data frame carrying a chunk (or a parse failure for one).
    Chunk(Result<ChatCompletionChunk>),
    /// The `[DONE]` terminator.
    Done,
    /// Comment or fieldless frame; nothing to surface.
    Ignore,
}

/// Process a stream of bytes into a stream of chat-completion chunks.
///
/// The returned stream ends at the `[DONE]` terminator or when the
/// connection closes, whichever comes first. Dropping it releases the
/// underlying byte stream.
pub fn process_sse<S>(byte_stream: S) -> impl Stream<Item = Result<ChatCompletionChunk>>
where
    S: Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static,
{
    // Convert reqwest errors to our error type
    let stream = byte_stream.map(|result| {
        result
            .map_err(|e| Error::streaming(format!("Error in HTTP stream: {e}"), Some(Box::new(e))))
    });

    stream::unfold(
        (stream, String::new(), Vec::new(), false),
        move |(mut stream, mut buffer, mut tail, done)| async move {
            if done {
                return None;
            }
            loop {
                // First drain any complete frames already buffered.
                if let Some((frame, remaining)) = extract_frame(&buffer) {
                    buffer = remaining;
                    match parse_frame(&frame) {
                        Frame::Ignore => continue,
                        Frame::Done => return None,
                        Frame::Chunk(result) => {
                            return Some((result, (stream, buffer, tail, false)));
                        }
                    }
                }

                // Read more data
                match stream.next().await {
                    Some(Ok(bytes)) => {
                        if let Err(e) = append_utf8(&mut buffer, &mut tail, &bytes) {
                            return Some((Err(e), (stream, buffer, tail, false)));
                        }
                    }
                    Some(Err(e)) => {
                        return Some((Err(e), (stream, buffer, tail, false)));
                    }
                    None => {
                        if !tail.is_empty() {
                            return Some((
                                Err(Error::encoding(
                                    "Invalid UTF-8 in stream: truncated multibyte sequence at connection close",
                                    None,
                                )),
                                (stream, buffer, tail, true),
                            ));
                        }
                        // Connection closed; a trailing frame may lack the
                        // final blank line.
                        let trailing = std::mem::take(&mut buffer);
                        let trailing = trailing.trim();
                        if trailing.is_empty() {
                            return None;
                        }
                        return match parse_frame(trailing) {
                            Frame::Chunk(result) => Some((result, (stream, buffer, tail, true))),
                            Frame::Done | Frame::Ignore => None,
                        };
                    }
                }
            }
        },
    )
}

/// Appends a network read to the text buffer.
///
/// Reads arrive at arbitrary byte boundaries, so a multibyte character may
/// be split across two of them; the incomplete suffix is carried in `tail`
/// until the next read completes it. Only genuinely invalid sequences are an
/// error.
fn append_utf8(buffer: &mut String, tail: &mut Vec<u8>, bytes: &[u8]) -> Result<()> {
    tail.extend_from_slice(bytes);
    match std::str::from_utf8(tail) {
        Ok(text) => {
            buffer.push_str(text);
            tail.clear();
            Ok(())
        }
        Err(e) if e.error_len().is_none() => {
            let rest = tail.split_off(e.valid_up_to());
            let valid = std::mem::replace(tail, rest);
            if let Ok(text) = String::from_utf8(valid) {
                buffer.push_str(&text);
            }
            Ok(())
        }
        Err(e) => Err(Error::encoding(
            format!("Invalid UTF-8 in stream: {e}"),
            Some(Box::new(e)),
        )),
    }
}

/// Splits one complete frame off the front of the buffer.
///
/// Frames are delimited by a blank line.
fn extract_frame(buffer: &str) -> Option<(String, String)> {
    let (frame, rest) = buffer.split_once("\n\n")?;
    Some((frame.to_string(), rest.to_string()))
}

/// Parses a single frame's lines.
///
/// Only `data:` fields matter for this endpoint; comment lines (leading `:`)
/// and other fields are skipped. Multiple data lines are joined with a
/// newline per the SSE spec.
fn parse_frame(frame: &str) -> Frame {
    let mut data = String::new();
    for line in frame.lines() {
        if let Some(payload) = line.strip_prefix("data:") {
            if !data.is_empty() {
                data.push('\n');
            }
            data.push_str(payload.trim_start());
        }
    }

    if data.is_empty() {
        return Frame::Ignore;
    }
    if data == "[DONE]" {
        return Frame::Done;
    }
    match serde_json::from_str::<ChatCompletionChunk>(&data) {
        Ok(chunk) => Frame::Chunk(Ok(chunk)),
        Err(e) => Frame::Chunk(Err(Error::serialization(
            format!("Malformed chunk in SSE frame: {e}"),
            Some(Box::new(e)),
        ))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    const CHUNK: &[u8] =
        b"data: {\"choices\":[{\"delta\":{\"content\":\"Hi\"},\"finish_reason\":null}]}\n\n";

    fn byte_stream(
        chunks: Vec<&'static [u8]>,
    ) -> impl Stream<Item = std::result::Result<Bytes, reqwest::Error>> + Send + Unpin + 'static
    {
        stream::iter(chunks.into_iter().map(|c| Ok(Bytes::from(c))))
    }

    #[tokio::test]
    async fn parse_single_chunk() {
        let mut sse = Box::pin(process_sse(byte_stream(vec![CHUNK])));
        let chunk = sse.next().await.unwrap().unwrap();
        assert_eq!(chunk.delta_text(), Some("Hi"));
        assert!(sse.next().await.is_none());
    }

    #[tokio::test]
    async fn done_terminates_stream() {
        let data: &[u8] = b"data: [DONE]\n\ndata: {\"choices\":[]}\n\n";
        let mut sse = Box::pin(process_sse(byte_stream(vec![data])));
        // Nothing after [DONE] is surfaced.
        assert!(sse.next().await.is_none());
    }

    #[tokio::test]
    async fn handle_frame_split_across_reads() {
        let part1: &[u8] = b"data: {\"choices\":[{\"delta\":{\"cont";
        let part2: &[u8] = b"ent\":\"Hello\"},\"finish_reason\":null}]}\n\n";
        let mut sse = Box::pin(process_sse(byte_stream(vec![part1, part2])));
        let chunk = sse.next().await.unwrap().unwrap();
        assert_eq!(chunk.delta_text(), Some("Hello"));
    }

    #[tokio::test]
    async fn handle_multibyte_character_split_across_reads() {
        const FRAME: &[u8] =
            "data: {\"choices\":[{\"delta\":{\"content\":\"日本\"},\"finish_reason\":null}]}\n\n"
                .as_bytes();
        // Split inside the first three-byte character.
        let (head, tail) = FRAME.split_at(40);
        assert!(std::str::from_utf8(head).is_err());

        let mut sse = Box::pin(process_sse(byte_stream(vec![head, tail])));
        let chunk = sse.next().await.unwrap().unwrap();
        assert_eq!(chunk.delta_text(), Some("日本"));
        assert!(sse.next().await.is_none());
    }

    #[tokio::test]
    async fn invalid_utf8_is_an_error() {
        let data: &[u8] = b"data: \xff\xfe\n\n";
        let mut sse = Box::pin(process_sse(byte_stream(vec![data])));
        let item = sse.next().await.unwrap();
        assert!(item.is_err());
    }

    #[tokio::test]
    async fn truncated_multibyte_at_close_is_an_error() {
        // Connection drops mid-character.
        let data: &[u8] = b"data: {\"choices\":[{\"delta\":{\"content\":\"\xe6\x97";
        let mut sse = Box::pin(process_sse(byte_stream(vec![data])));
        let item = sse.next().await.unwrap();
        assert!(item.is_err());
        assert!(sse.next().await.is_none());
    }

    #[tokio::test]
    async fn keep_alive_comments_ignored() {
        let data: &[u8] = b": keep-alive\n\n";
        let mut sse = Box::pin(process_sse(byte_stream(vec![data, CHUNK])));
        let chunk = sse.next().await.unwrap().unwrap();
        assert_eq!(chunk.delta_text(), Some("Hi"));
    }

    #[tokio::test]
    async fn malformed_json_is_an_error() {
        let data: &[u8] = b"data: {not json}\n\n";
        let mut sse = Box::pin(process_sse(byte_stream(vec![data])));
        let item = sse.next().await.unwrap();
        assert!(item.is_err());
    }

    #[tokio::test]
    async fn trailing_frame_without_blank_line() {
        let data: &[u8] =
            b"data: {\"choices\":[{\"delta\":{\"content\":\"end\"},\"finish_reason\":\"stop\"}]}";
        let mut sse = Box::pin(process_sse(byte_stream(vec![data])));
        let chunk = sse.next().await.unwrap().unwrap();
        assert_eq!(chunk.delta_text(), Some("end"));
        assert_eq!(chunk.finish_reason(), Some("stop"));
        assert!(sse.next().await.is_none());
    }

    #[tokio::test]
    async fn multiple_chunks_in_order() {
        let data: &[u8] = b"data: {\"choices\":[{\"delta\":{\"content\":\"He\"},\"finish_reason\":null}]}\n\ndata: {\"choices\":[{\"delta\":{\"content\":\"llo!\"},\"finish_reason\":null}]}\n\ndata: [DONE]\n\n";
        let mut sse = Box::pin(process_sse(byte_stream(vec![data])));
        assert_eq!(sse.next().await.unwrap().unwrap().delta_text(), Some("He"));
        assert_eq!(
            sse.next().await.unwrap().unwrap().delta_text(),
            Some("llo!")
        );
        assert!(sse.next().await.is_none());
    }
}
