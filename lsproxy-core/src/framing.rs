//! Wire framing for JSON-RPC over stdio.
//!
//! Messages are framed the LSP way: a block of `Name: value` header lines,
//! each terminated by CRLF, then an empty line, then exactly
//! `Content-Length` bytes of UTF-8 JSON:
//!
//! ```text
//! Content-Length: <n>\r\n
//! \r\n
//! <n bytes of JSON>
//! ```
//!
//! [`FrameDecoder`] turns an unbounded chunk stream with arbitrary
//! boundaries back into complete frames. The emitted frames keep the
//! original header bytes, so a frame can be forwarded verbatim without
//! re-serialization.

use crate::protocol::JsonRpcMessage;
use bytes::{Bytes, BytesMut};
use thiserror::Error;

pub const CONTENT_LENGTH: &str = "Content-Length";

const HEADER_SEPARATOR: &[u8] = b"\r\n\r\n";

#[derive(Debug, Error)]
pub enum FramingError {
    #[error("missing Content-Length header in {0:?}")]
    MissingContentLength(String),
    #[error("invalid Content-Length value {0:?}")]
    InvalidContentLength(String),
    #[error("framing already failed on this stream")]
    Failed,
}

/// Incremental frame decoder over an accumulation buffer.
///
/// Feed it chunks as they arrive; each call returns every frame completed so
/// far, in order. A chunk may complete zero, one or many frames, and a frame
/// may span any number of chunks. A framing error is fatal: the decoder
/// refuses all further input for this stream.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    buffer: BytesMut,
    // (bytes up to and including the separator, body length) of the frame
    // currently being assembled, once its header block is complete
    current: Option<(usize, usize)>,
    failed: bool,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, chunk: &[u8]) -> Result<Vec<Bytes>, FramingError> {
        if self.failed {
            return Err(FramingError::Failed);
        }

        self.buffer.extend_from_slice(chunk);
        let mut frames = Vec::new();

        loop {
            let (header_len, body_len) = match self.current {
                Some(known) => known,
                None => {
                    // Header values may be empty, so only the double CRLF
                    // marks the header/body boundary.
                    let Some(separator) = find_subsequence(&self.buffer, HEADER_SEPARATOR) else {
                        break;
                    };
                    let header_len = separator + HEADER_SEPARATOR.len();
                    let body_len = match parse_content_length(&self.buffer[..separator]) {
                        Ok(len) => len,
                        Err(e) => {
                            self.failed = true;
                            return Err(e);
                        }
                    };
                    self.current = Some((header_len, body_len));
                    (header_len, body_len)
                }
            };

            if self.buffer.len() < header_len + body_len {
                break;
            }

            frames.push(self.buffer.split_to(header_len + body_len).freeze());
            self.current = None;
        }

        Ok(frames)
    }
}

/// Parses the header block and extracts the mandatory `Content-Length`.
fn parse_content_length(headers: &[u8]) -> Result<usize, FramingError> {
    let headers = String::from_utf8_lossy(headers);
    for line in headers.split("\r\n") {
        if let Some((name, value)) = line.split_once(':') {
            if name.trim().eq_ignore_ascii_case(CONTENT_LENGTH) {
                let value = value.trim();
                return value
                    .parse::<usize>()
                    .map_err(|_| FramingError::InvalidContentLength(value.to_string()));
            }
        }
    }
    Err(FramingError::MissingContentLength(headers.into_owned()))
}

/// Serializes a message into one complete frame.
///
/// The header carries the byte length of the encoded JSON, not the character
/// count, so multi-byte payloads frame correctly.
pub fn encode_message(message: &JsonRpcMessage) -> Bytes {
    let body = serde_json::to_vec(message).expect("JSON-RPC messages always serialize");
    let mut frame = BytesMut::with_capacity(body.len() + 32);
    frame.extend_from_slice(format!("{}: {}\r\n\r\n", CONTENT_LENGTH, body.len()).as_bytes());
    frame.extend_from_slice(&body);
    frame.freeze()
}

/// Parses the body of a complete frame.
///
/// Returns `None` for anything that is not valid JSON-RPC; malformed payloads
/// must never crash the relay, they are classified as unmatched by the caller.
pub fn decode_frame(frame: &[u8]) -> Option<JsonRpcMessage> {
    let separator = find_subsequence(frame, HEADER_SEPARATOR)?;
    serde_json::from_slice(&frame[separator + HEADER_SEPARATOR.len()..]).ok()
}

fn find_subsequence(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::JsonRpcNotification;
    use serde_json::json;

    fn frame_bytes(body: &str) -> Vec<u8> {
        format!("{}: {}\r\n\r\n{}", CONTENT_LENGTH, body.len(), body).into_bytes()
    }

    #[test]
    fn test_encode_decode_round_trip() {
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(
            "textDocument/didOpen",
            Some(json!({"uri": "file:///tmp/a.java"})),
        ));
        let frame = encode_message(&message);
        let decoded = decode_frame(&frame).expect("frame should decode");
        assert_eq!(
            serde_json::to_value(&decoded).unwrap(),
            serde_json::to_value(&message).unwrap()
        );
    }

    #[test]
    fn test_encode_uses_byte_length() {
        let message = JsonRpcMessage::Notification(JsonRpcNotification::new(
            "window/showMessage",
            Some(json!({"message": "héllo"})),
        ));
        let frame = encode_message(&message);
        let text = String::from_utf8_lossy(&frame);
        let (header, body) = text.split_once("\r\n\r\n").unwrap();
        let declared: usize = header
            .strip_prefix("Content-Length: ")
            .unwrap()
            .parse()
            .unwrap();
        assert_eq!(declared, body.len());
        assert!(declared > body.chars().count());
    }

    #[test]
    fn test_single_chunk_single_frame() {
        let mut decoder = FrameDecoder::new();
        let input = frame_bytes(r#"{"jsonrpc":"2.0","method":"a"}"#);
        let frames = decoder.push(&input).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &input[..]);
    }

    #[test]
    fn test_multiple_frames_in_one_chunk() {
        let mut decoder = FrameDecoder::new();
        let first = frame_bytes(r#"{"jsonrpc":"2.0","method":"a"}"#);
        let second = frame_bytes(r#"{"jsonrpc":"2.0","method":"b"}"#);
        let mut input = first.clone();
        input.extend_from_slice(&second);

        let frames = decoder.push(&input).unwrap();
        assert_eq!(frames.len(), 2);
        assert_eq!(&frames[0][..], &first[..]);
        assert_eq!(&frames[1][..], &second[..]);
    }

    #[test]
    fn test_scenario_three_chunk_split() {
        // Split inside the header, inside the separator and mid-body.
        let body = r#"{"jsonrpc":"x"}"#;
        assert_eq!(body.len(), 15);
        let input = frame_bytes(body);

        // "Content-Length: 15" is 18 bytes, the separator spans 18..22 and
        // the body 22..37.
        let mut decoder = FrameDecoder::new();
        assert!(decoder.push(&input[..10]).unwrap().is_empty());
        assert!(decoder.push(&input[10..20]).unwrap().is_empty());
        assert!(decoder.push(&input[20..30]).unwrap().is_empty());
        let frames = decoder.push(&input[30..]).unwrap();
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &input[..]);
    }

    #[test]
    fn test_chunk_boundary_invariance() {
        let bodies = [
            r#"{"jsonrpc":"2.0","id":1,"method":"foo/bar","params":{"a":1}}"#,
            r#"{"jsonrpc":"2.0","id":1,"result":null}"#,
            r#"{"jsonrpc":"2.0","method":"$/progress"}"#,
        ];
        let mut stream = Vec::new();
        let mut expected = Vec::new();
        for body in bodies {
            let frame = frame_bytes(body);
            stream.extend_from_slice(&frame);
            expected.push(frame);
        }

        // Splitting the concatenated stream at every single position must
        // yield the identical frame sequence.
        for split in 0..=stream.len() {
            let mut decoder = FrameDecoder::new();
            let mut frames = decoder.push(&stream[..split]).unwrap();
            frames.extend(decoder.push(&stream[split..]).unwrap());
            assert_eq!(frames.len(), expected.len(), "split at {}", split);
            for (frame, expected) in frames.iter().zip(&expected) {
                assert_eq!(&frame[..], &expected[..], "split at {}", split);
            }
        }
    }

    #[test]
    fn test_byte_by_byte_delivery() {
        let input = frame_bytes(r#"{"jsonrpc":"2.0","method":"a"}"#);
        let mut decoder = FrameDecoder::new();
        let mut frames = Vec::new();
        for byte in &input {
            frames.extend(decoder.push(std::slice::from_ref(byte)).unwrap());
        }
        assert_eq!(frames.len(), 1);
        assert_eq!(&frames[0][..], &input[..]);
    }

    #[test]
    fn test_extra_headers_and_case_insensitive_length() {
        let body = r#"{"jsonrpc":"2.0","method":"a"}"#;
        let input = format!(
            "Content-Type: application/vscode-jsonrpc\r\ncontent-length: {}\r\n\r\n{}",
            body.len(),
            body
        );
        let mut decoder = FrameDecoder::new();
        let frames = decoder.push(input.as_bytes()).unwrap();
        assert_eq!(frames.len(), 1);
    }

    #[test]
    fn test_missing_content_length_is_fatal() {
        let mut decoder = FrameDecoder::new();
        let err = decoder
            .push(b"Content-Type: application/json\r\n\r\n{}")
            .unwrap_err();
        assert!(matches!(err, FramingError::MissingContentLength(_)));

        // The decoder stays failed even for well-formed later input.
        let good = frame_bytes(r#"{"jsonrpc":"2.0","method":"a"}"#);
        assert!(decoder.push(&good).is_err());
    }

    #[test]
    fn test_non_numeric_content_length_is_fatal() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.push(b"Content-Length: nope\r\n\r\n{}").unwrap_err();
        assert!(matches!(err, FramingError::InvalidContentLength(_)));
    }

    #[test]
    fn test_negative_content_length_is_fatal() {
        let mut decoder = FrameDecoder::new();
        let err = decoder.push(b"Content-Length: -5\r\n\r\n{}").unwrap_err();
        assert!(matches!(err, FramingError::InvalidContentLength(_)));
    }

    #[test]
    fn test_decode_frame_malformed_body_is_none() {
        assert!(decode_frame(b"Content-Length: 8\r\n\r\nnot json").is_none());
    }
}
