//! One request/response exchange with the attachment server.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use cni_protocol::{CniRequest, CniResponse, MAX_MESSAGE_BYTES, read_message, write_message};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::UnixStream;

/// Upper bound for one exchange; the server enforces its own, shorter deadline.
pub const EXCHANGE_TIMEOUT: Duration = Duration::from_secs(90);

/// Error raised when the server cannot be reached at all.
#[derive(Debug)]
pub struct Unreachable(pub String);

impl std::fmt::Display for Unreachable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "attachment server unreachable: {}", self.0)
    }
}

impl std::error::Error for Unreachable {}

/// Sends `request` to the server at `socket` and waits for its response.
pub async fn send(socket: &Path, request: &CniRequest) -> anyhow::Result<CniResponse> {
    let stream = UnixStream::connect(socket)
        .await
        .map_err(|e| Unreachable(format!("{}: {e}", socket.display())))?;
    tokio::time::timeout(EXCHANGE_TIMEOUT, exchange(stream, request))
        .await
        .context("attachment server did not answer in time")?
}

async fn exchange<S>(stream: S, request: &CniRequest) -> anyhow::Result<CniResponse>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    write_message(&mut write, request).await.context("sending request")?;
    let mut reader = BufReader::new(read);
    read_message(&mut reader, MAX_MESSAGE_BYTES)
        .await
        .context("reading response")
}

#[cfg(test)]
mod tests {
    use super::*;
    use cni_protocol::{CmdArgs, Command};
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};

    #[tokio::test]
    async fn exchange_writes_request_and_reads_response() {
        let (client, server) = tokio::io::duplex(4096);
        let peer = tokio::spawn(async move {
            let (read, mut write) = tokio::io::split(server);
            let mut line = String::new();
            BufReader::new(read).read_line(&mut line).await.unwrap();
            let request: CniRequest = serde_json::from_str(&line).unwrap();
            assert_eq!(request.cmd, "Del");
            write.write_all(b"{\"error\":\"\"}\n").await.unwrap();
        });

        let request = CniRequest::new(
            Command::Del,
            CmdArgs {
                if_name: "eth0".to_string(),
                ..CmdArgs::default()
            },
        );
        let response = exchange(client, &request).await.unwrap();
        assert!(!response.is_error());
        peer.await.unwrap();
    }

    #[tokio::test]
    async fn missing_socket_is_unreachable() {
        let err = send(Path::new("/nonexistent/histack.sock"), &CniRequest::new(Command::Del, CmdArgs::default()))
            .await
            .unwrap_err();
        assert!(err.downcast_ref::<Unreachable>().is_some());
    }
}
