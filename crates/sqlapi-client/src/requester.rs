//! Request-channel transmission.
//!
//! Every request uses a fresh connection to the shared request socket: the
//! exchange is connect, write one frame, wait for the broker's ACK, then
//! disconnect so other clients can take the channel.

use std::io;
use std::path::Path;

use sqlapi_protocol::{names::CONNECT_RETRIES, read_ack, write_frame};
use tokio::net::UnixStream;
use tracing::debug;

#[derive(Debug, thiserror::Error)]
pub enum RequestError {
    #[error("broker not found after {0} attempt(s)")]
    ServerNotFound(u32),
    #[error("broker refused the connection")]
    Refused,
    #[error("I/O: {0}")]
    Io(#[from] io::Error),
}

/// Deliver one encoded request frame and wait for the ACK.
///
/// An absent socket name retries up to [`CONNECT_RETRIES`] times with
/// immediate reconnection; a refused connection is fatal at once; a peer
/// close before the ACK is an I/O error.
pub(crate) async fn send_request(path: &Path, frame: &[u8]) -> Result<(), RequestError> {
    let mut attempts = 0u32;
    let mut stream = loop {
        match UnixStream::connect(path).await {
            Ok(stream) => break stream,
            Err(e) if e.kind() == io::ErrorKind::ConnectionRefused => {
                return Err(RequestError::Refused);
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                attempts += 1;
                if attempts > CONNECT_RETRIES {
                    return Err(RequestError::ServerNotFound(attempts));
                }
                debug!(attempts, "request socket absent; retrying");
            }
            Err(e) => return Err(e.into()),
        }
    };
    write_frame(&mut stream, frame).await?;
    read_ack(&mut stream).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlapi_protocol::{ACK_TOKEN, read_frame, request_socket_path};
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn frame_is_delivered_and_acked() {
        let dir = tempfile::tempdir().unwrap();
        let path = request_socket_path(dir.path());
        let listener = UnixListener::bind(&path).unwrap();

        let server = tokio::spawn(async move {
            let (mut peer, _) = listener.accept().await.unwrap();
            let frame = read_frame(&mut peer).await.unwrap().unwrap();
            peer.write_all(ACK_TOKEN).await.unwrap();
            frame
        });

        send_request(&path, b"payload").await.unwrap();
        assert_eq!(&server.await.unwrap()[..], b"payload");
    }

    #[tokio::test]
    async fn missing_socket_exhausts_retries() {
        let dir = tempfile::tempdir().unwrap();
        let path = request_socket_path(dir.path());
        let err = send_request(&path, b"x").await.unwrap_err();
        assert!(matches!(err, RequestError::ServerNotFound(n) if n > CONNECT_RETRIES));
    }

    #[tokio::test]
    async fn stale_socket_file_is_refused_immediately() {
        let dir = tempfile::tempdir().unwrap();
        let path = request_socket_path(dir.path());
        // Bind and drop: the file stays, nobody listens.
        drop(std::os::unix::net::UnixListener::bind(&path).unwrap());
        let err = send_request(&path, b"x").await.unwrap_err();
        assert!(matches!(err, RequestError::Refused));
    }
}
