//! Unix socket front end.
//!
//! One request and one response per connection, newline-delimited JSON.
//! Connections are handled concurrently up to the configured limit; a
//! connection arriving while every slot is taken gets a busy error.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use cni_protocol::{CniRequest, CniResponse, MAX_MESSAGE_BYTES, ProtocolError, read_message, write_message};
use tokio::io::{AsyncRead, AsyncWrite, BufReader};
use tokio::net::UnixListener;
use tokio::sync::{Semaphore, watch};
use tracing::{debug, error, info, warn};

use crate::error::AttachError;
use crate::orchestrator::Orchestrator;

/// Binds `path`, replacing a stale socket left by a previous run.
pub fn bind(path: &Path) -> Result<UnixListener, AttachError> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    match std::fs::remove_file(path) {
        Ok(()) => debug!("Removed stale socket {}", path.display()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(UnixListener::bind(path)?)
}

/// Serves attach requests until shutdown is signalled.
pub struct CniServer {
    orchestrator: Arc<Orchestrator>,
    max_connections: usize,
    request_timeout: Duration,
}

impl std::fmt::Debug for CniServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CniServer")
            .field("max_connections", &self.max_connections)
            .field("request_timeout", &self.request_timeout)
            .finish_non_exhaustive()
    }
}

impl CniServer {
    /// Creates a server handling at most `max_connections` requests at once,
    /// each bounded by `request_timeout`.
    pub fn new(orchestrator: Arc<Orchestrator>, max_connections: usize, request_timeout: Duration) -> Self {
        Self {
            orchestrator,
            max_connections: max_connections.max(1),
            request_timeout,
        }
    }

    /// Accepts connections on the socket at `path` until `shutdown` flips
    /// to true. The socket file is removed on exit.
    pub async fn run(&self, path: &Path, mut shutdown: watch::Receiver<bool>) -> Result<(), AttachError> {
        let listener = bind(path)?;
        let _socket = SocketGuard(path.to_path_buf());
        info!("CNI server listening on {}", path.display());

        let slots = Arc::new(Semaphore::new(self.max_connections));
        loop {
            let stream = tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, _)) => stream,
                    Err(e) => {
                        warn!("Accept failed: {}", e);
                        continue;
                    }
                },
                _ = shutdown.changed() => break,
            };

            let timeout = self.request_timeout;
            let Ok(permit) = Arc::clone(&slots).try_acquire_owned() else {
                warn!("All {} connection slots busy, rejecting request", self.max_connections);
                tokio::spawn(reject_busy(stream, timeout));
                continue;
            };

            let orchestrator = Arc::clone(&self.orchestrator);
            tokio::spawn(async move {
                if let Err(e) = handle_connection(stream, &orchestrator, timeout).await {
                    warn!("Connection error: {}", e);
                }
                drop(permit);
            });
        }

        info!("CNI server shutting down");
        Ok(())
    }
}

struct SocketGuard(PathBuf);

impl Drop for SocketGuard {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.0) {
            if e.kind() != std::io::ErrorKind::NotFound {
                error!("Failed to remove socket {}: {}", self.0.display(), e);
            }
        }
    }
}

/// Answers a connection that arrived while every slot was taken.
async fn reject_busy<S>(mut stream: S, write_timeout: Duration)
where
    S: AsyncWrite + Unpin,
{
    let response = CniResponse::failure(AttachError::Busy.to_string());
    match tokio::time::timeout(write_timeout, write_message(&mut stream, &response)).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => debug!("Failed to send busy response: {}", e),
        Err(_) => debug!("Timed out sending busy response"),
    }
}

/// Reads one request from `stream`, answers it and writes the response.
///
/// `request_timeout` bounds reading and handling together, so a peer that
/// connects and never sends cannot hold the connection. A connection closed
/// before sending anything gets no response. Requests that cannot be decoded,
/// or that do not finish in time, get an error response.
pub async fn handle_connection<S>(
    stream: S,
    orchestrator: &Orchestrator,
    request_timeout: Duration,
) -> Result<(), ProtocolError>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (read, mut write) = tokio::io::split(stream);
    let mut reader = BufReader::new(read);

    let exchange = async {
        match read_message::<CniRequest, _>(&mut reader, MAX_MESSAGE_BYTES).await {
            Ok(request) => {
                debug!(cmd = %request.cmd, netns = %request.cmd_args.netns, "Request received");
                Some(orchestrator.handle(request).await)
            }
            Err(ProtocolError::Closed) => None,
            Err(e) => {
                warn!("Rejecting request: {}", e);
                Some(CniResponse::failure(e.to_string()))
            }
        }
    };

    let response = match tokio::time::timeout(request_timeout, exchange).await {
        Ok(Some(response)) => response,
        Ok(None) => return Ok(()),
        Err(_) => {
            warn!("Request not completed within {:?}", request_timeout);
            CniResponse::failure(AttachError::Timeout(request_timeout).to_string())
        }
    };

    tokio::time::timeout(request_timeout, write_message(&mut write, &response))
        .await
        .map_err(|elapsed| ProtocolError::Io(format!("writing response: {elapsed}")))?
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{cmd_args, fixture};
    use cni_protocol::Command;
    use tokio::io::{AsyncBufReadExt, AsyncWriteExt};
    use tokio::net::UnixStream;

    async fn exchange(orchestrator: &Orchestrator, payload: &[u8]) -> Option<CniResponse> {
        let (client, server) = tokio::io::duplex(64 * 1024);
        let (client_read, mut client_write) = tokio::io::split(client);

        client_write.write_all(payload).await.unwrap();
        client_write.shutdown().await.unwrap();
        handle_connection(server, orchestrator, Duration::from_secs(5))
            .await
            .unwrap();

        let mut line = String::new();
        BufReader::new(client_read).read_line(&mut line).await.unwrap();
        if line.is_empty() {
            None
        } else {
            Some(serde_json::from_str(&line).unwrap())
        }
    }

    fn encode(request: &CniRequest) -> Vec<u8> {
        let mut buf = serde_json::to_vec(request).unwrap();
        buf.push(b'\n');
        buf
    }

    #[tokio::test]
    async fn add_request_gets_result() {
        let f = fixture("10.0.0.0/24", None);
        let request = CniRequest::new(Command::Add, cmd_args("eth0"));

        let response = exchange(&f.orchestrator, &encode(&request)).await.unwrap();
        assert!(!response.is_error(), "{}", response.error);
        let result = response.result.unwrap();
        assert_eq!(result.ips[0].address.to_string(), "10.0.0.1/24");
    }

    #[tokio::test]
    async fn del_request_gets_empty_success() {
        let f = fixture("10.0.0.0/24", None);
        let request = CniRequest::new(Command::Del, cmd_args("eth0"));

        let response = exchange(&f.orchestrator, &encode(&request)).await.unwrap();
        assert!(!response.is_error());
        assert!(response.result.is_none());
    }

    #[tokio::test]
    async fn garbage_gets_error_response() {
        let f = fixture("10.0.0.0/24", None);
        let response = exchange(&f.orchestrator, b"{not json\n").await.unwrap();
        assert!(response.error.starts_with("failed to decode request"));
        assert!(f.journal.calls().is_empty());
    }

    #[tokio::test]
    async fn closed_connection_gets_no_response() {
        let f = fixture("10.0.0.0/24", None);
        assert!(exchange(&f.orchestrator, b"").await.is_none());
    }

    #[tokio::test]
    async fn silent_peer_times_out() {
        let f = fixture("10.0.0.0/24", None);
        let (client, server) = tokio::io::duplex(64 * 1024);

        let handled = tokio::time::timeout(
            Duration::from_secs(2),
            handle_connection(server, &f.orchestrator, Duration::from_millis(100)),
        )
        .await
        .expect("silent connection held past the request deadline");
        handled.unwrap();

        let mut line = String::new();
        BufReader::new(client).read_line(&mut line).await.unwrap();
        let response: CniResponse = serde_json::from_str(&line).unwrap();
        assert!(response.error.contains("timed out"), "{}", response.error);
        assert!(f.journal.calls().is_empty());
    }

    #[tokio::test]
    async fn busy_server_rejects_and_keeps_accepting() {
        let f = fixture("10.0.0.0/24", None);
        let dir = std::env::temp_dir().join(format!("cni-server-busy-{}", std::process::id()));
        let path = dir.join("cni.sock");
        let server = CniServer::new(Arc::new(f.orchestrator), 1, Duration::from_millis(300));
        let (tx, rx) = watch::channel(false);

        let serve_path = path.clone();
        let task = tokio::spawn(async move { server.run(&serve_path, rx).await });

        let silent = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };

        // The only slot is held by the silent peer
        let mut rejected = UnixStream::connect(&path).await.unwrap();
        let mut line = String::new();
        BufReader::new(&mut rejected).read_line(&mut line).await.unwrap();
        let response: CniResponse = serde_json::from_str(&line).unwrap();
        assert!(response.error.contains("busy"), "{}", response.error);

        // Once the silent peer times out its slot is free again
        let mut silent = silent;
        let mut timed_out = String::new();
        BufReader::new(&mut silent).read_line(&mut timed_out).await.unwrap();
        assert!(timed_out.contains("timed out"));
        drop(silent);
        tokio::time::sleep(Duration::from_millis(50)).await;

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let request = CniRequest::new(Command::Add, cmd_args("eth0"));
        stream.write_all(&encode(&request)).await.unwrap();
        let mut line = String::new();
        BufReader::new(&mut stream).read_line(&mut line).await.unwrap();
        let response: CniResponse = serde_json::from_str(&line).unwrap();
        assert!(!response.is_error(), "{}", response.error);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn bind_replaces_stale_socket() {
        let dir = std::env::temp_dir().join(format!("cni-server-bind-{}", std::process::id()));
        let path = dir.join("nested").join("cni.sock");
        let _first = bind(&path).unwrap();
        let _second = bind(&path).unwrap();
        assert!(path.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[tokio::test]
    async fn serves_until_shutdown() {
        let f = fixture("10.0.0.0/24", None);
        let dir = std::env::temp_dir().join(format!("cni-server-run-{}", std::process::id()));
        let path = dir.join("cni.sock");
        let server = CniServer::new(Arc::new(f.orchestrator), 4, Duration::from_secs(5));
        let (tx, rx) = watch::channel(false);

        let serve_path = path.clone();
        let task = tokio::spawn(async move { server.run(&serve_path, rx).await });

        let mut stream = loop {
            match UnixStream::connect(&path).await {
                Ok(stream) => break stream,
                Err(_) => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        };
        let request = CniRequest::new(Command::Add, cmd_args("eth0"));
        stream.write_all(&encode(&request)).await.unwrap();
        let mut line = String::new();
        BufReader::new(&mut stream).read_line(&mut line).await.unwrap();
        let response: CniResponse = serde_json::from_str(&line).unwrap();
        assert!(!response.is_error(), "{}", response.error);

        tx.send(true).unwrap();
        task.await.unwrap().unwrap();
        assert!(!path.exists());
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
