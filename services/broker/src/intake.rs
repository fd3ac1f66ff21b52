//! Request intake: the shared inbound channel.
//!
//! Each client request uses a fresh connection.  The exchange is fixed:
//! read exactly one frame, write the ACK token, wait for the peer to hang
//! up, then hand the decoded request to the core.  Holding delivery until
//! the disconnect keeps the shared socket reserved for the minimum time —
//! execution never overlaps with a client still holding the channel.

use sqlapi_protocol::{DecodeError, Request, read_frame, write_ack};
use tokio::io::AsyncReadExt;
use tokio::net::{UnixListener, UnixStream};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Events delivered to the broker core.
#[derive(Debug)]
pub enum IntakeEvent {
    /// One fully read and acknowledged request.
    Request(Request),
    /// A connection died before its request was read, or sent garbage.
    Aborted,
}

#[derive(Debug, thiserror::Error)]
enum IntakeError {
    #[error("I/O: {0}")]
    Io(#[from] std::io::Error),
    #[error("decode: {0}")]
    Decode(#[from] DecodeError),
    #[error("peer closed before sending a request")]
    Disconnected,
}

/// Accept loop.  Runs until the listener fails or the core drops the
/// receiver.
pub async fn run(listener: UnixListener, tx: mpsc::UnboundedSender<IntakeEvent>) {
    loop {
        match listener.accept().await {
            Ok((stream, _addr)) => {
                let tx = tx.clone();
                tokio::spawn(async move {
                    match serve_connection(stream).await {
                        Ok(request) => {
                            let _ = tx.send(IntakeEvent::Request(request));
                        }
                        Err(e) => {
                            debug!(error = %e, "request connection dropped");
                            let _ = tx.send(IntakeEvent::Aborted);
                        }
                    }
                });
            }
            Err(e) => {
                warn!(error = %e, "request accept failed");
                break;
            }
        }
    }
}

async fn serve_connection(mut stream: UnixStream) -> Result<Request, IntakeError> {
    let frame = read_frame(&mut stream)
        .await?
        .ok_or(IntakeError::Disconnected)?;
    let request = Request::from_frame(&frame)?;
    write_ack(&mut stream).await?;

    // Drain until EOF: the request is delivered only once the client has
    // released the shared channel.
    let mut sink = [0u8; 64];
    loop {
        match stream.read(&mut sink).await {
            Ok(0) | Err(_) => break,
            Ok(_) => {}
        }
    }
    Ok(request)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlapi_protocol::{RequestKind, read_ack, request_socket_path, write_frame};

    #[tokio::test]
    async fn one_request_per_connection_with_ack() {
        let dir = tempfile::tempdir().unwrap();
        let path = request_socket_path(dir.path());
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(run(listener, tx));

        let mut stream = UnixStream::connect(&path).await.unwrap();
        let request = Request::control(3, RequestKind::Register);
        write_frame(&mut stream, &request.to_frame()).await.unwrap();
        read_ack(&mut stream).await.unwrap();
        drop(stream);

        match rx.recv().await.unwrap() {
            IntakeEvent::Request(got) => assert_eq!(got, request),
            IntakeEvent::Aborted => panic!("expected a request"),
        }
    }

    #[tokio::test]
    async fn early_disconnect_reports_abort() {
        let dir = tempfile::tempdir().unwrap();
        let path = request_socket_path(dir.path());
        let listener = UnixListener::bind(&path).unwrap();
        let (tx, mut rx) = mpsc::unbounded_channel();
        tokio::spawn(run(listener, tx));

        let stream = UnixStream::connect(&path).await.unwrap();
        drop(stream);

        assert!(matches!(rx.recv().await.unwrap(), IntakeEvent::Aborted));
    }
}
