//! Newline-delimited JSON framing: one message per line.

use serde::Serialize;
use serde::de::DeserializeOwned;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::error::ProtocolError;

/// Largest accepted message.
pub const MAX_MESSAGE_BYTES: usize = 64 * 1024;

/// Reads one message. A final message without a trailing newline is accepted.
pub async fn read_message<T, R>(reader: &mut R, limit: usize) -> Result<T, ProtocolError>
where
    T: DeserializeOwned,
    R: AsyncBufRead + Unpin,
{
    let mut buf = Vec::new();
    let cap = u64::try_from(limit).unwrap_or(u64::MAX).saturating_add(1);
    reader.take(cap).read_until(b'\n', &mut buf).await?;

    if buf.len() > limit {
        return Err(ProtocolError::TooLarge(limit));
    }
    if buf.iter().all(u8::is_ascii_whitespace) {
        return Err(ProtocolError::Closed);
    }
    serde_json::from_slice(&buf).map_err(|e| ProtocolError::Decode(e.to_string()))
}

/// Writes `message` followed by a newline and flushes.
pub async fn write_message<T, W>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    T: Serialize,
    W: AsyncWrite + Unpin,
{
    let mut buf = serde_json::to_vec(message).map_err(|e| ProtocolError::Encode(e.to_string()))?;
    buf.push(b'\n');
    writer.write_all(&buf).await?;
    writer.flush().await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{CniRequest, CniResponse};
    use tokio::io::BufReader;

    #[tokio::test]
    async fn reads_single_line() {
        let input = b"{\"cmd\":\"Del\",\"cmdArgs\":{\"ifName\":\"eth0\"}}\n{\"ignored\":true}\n";
        let mut reader = BufReader::new(&input[..]);
        let request: CniRequest = read_message(&mut reader, MAX_MESSAGE_BYTES).await.unwrap();
        assert_eq!(request.cmd, "Del");
    }

    #[tokio::test]
    async fn accepts_missing_trailing_newline() {
        let mut reader = BufReader::new(&b"{\"error\":\"x\"}"[..]);
        let response: CniResponse = read_message(&mut reader, MAX_MESSAGE_BYTES).await.unwrap();
        assert_eq!(response.error, "x");
    }

    #[tokio::test]
    async fn rejects_oversized_and_garbage() {
        let big = vec![b'a'; 100];
        let mut reader = BufReader::new(&big[..]);
        let err = read_message::<CniResponse, _>(&mut reader, 10).await.unwrap_err();
        assert_eq!(err, ProtocolError::TooLarge(10));

        let mut reader = BufReader::new(&b"not json\n"[..]);
        let err = read_message::<CniResponse, _>(&mut reader, MAX_MESSAGE_BYTES).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Decode(_)));

        let mut reader = BufReader::new(&b""[..]);
        let err = read_message::<CniResponse, _>(&mut reader, MAX_MESSAGE_BYTES).await.unwrap_err();
        assert_eq!(err, ProtocolError::Closed);
    }

    #[tokio::test]
    async fn writes_newline_terminated_json() {
        let mut out = Vec::new();
        write_message(&mut out, &CniResponse::failure("boom")).await.unwrap();
        assert_eq!(out, b"{\"error\":\"boom\"}\n");
    }
}
