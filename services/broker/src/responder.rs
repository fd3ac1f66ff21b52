//! Per-client response channel.
//!
//! One writer task per registered client, holding the persistent outbound
//! connection to that client's notify listener.  The command channel is the
//! send queue; frames drain strictly one at a time — the next write happens
//! only after the client has ACKed the previous one, so the client's frame
//! decoder sees one logical frame per wake-up even if the transport
//! coalesces writes.
//!
//! A transport failure is fatal for the client: the task reports
//! `client_id` on the gone channel and ends; the core removes the state.

use std::io;
use std::path::Path;

use bytes::Bytes;
use sqlapi_protocol::{read_ack, response_socket_path, write_frame};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

#[derive(Debug)]
enum Command {
    Send(Bytes),
    Close,
}

/// Handle used by the broker core to feed one client's response stream.
#[derive(Debug, Clone)]
pub struct ResponderHandle {
    tx: mpsc::UnboundedSender<Command>,
}

impl ResponderHandle {
    /// Queue one frame.  Ordering is FIFO; flow control happens in the task.
    pub fn send(&self, frame: Bytes) {
        let _ = self.tx.send(Command::Send(frame));
    }

    /// End the task once everything queued so far has flushed.  Used on
    /// Unregister so the final Confirmation still reaches the client.
    pub fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

/// Connect to the client's notify listener and start the writer task.
pub async fn connect(
    socket_dir: &Path,
    client_id: i32,
    gone_tx: mpsc::UnboundedSender<i32>,
) -> io::Result<(ResponderHandle, JoinHandle<()>)> {
    let path = response_socket_path(socket_dir, client_id);
    let stream = UnixStream::connect(&path).await?;
    let (tx, rx) = mpsc::unbounded_channel();
    let task = tokio::spawn(write_loop(stream, client_id, rx, gone_tx));
    Ok((ResponderHandle { tx }, task))
}

async fn write_loop(
    mut stream: UnixStream,
    client_id: i32,
    mut rx: mpsc::UnboundedReceiver<Command>,
    gone_tx: mpsc::UnboundedSender<i32>,
) {
    while let Some(command) = rx.recv().await {
        match command {
            Command::Send(frame) => {
                if write_frame(&mut stream, &frame).await.is_err()
                    || read_ack(&mut stream).await.is_err()
                {
                    debug!(client_id, "response channel lost");
                    let _ = gone_tx.send(client_id);
                    return;
                }
                trace!(client_id, len = frame.len(), "frame acked");
            }
            Command::Close => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sqlapi_protocol::{ACK_TOKEN, read_frame};
    use tokio::io::AsyncWriteExt;
    use tokio::net::UnixListener;

    #[tokio::test]
    async fn second_frame_waits_for_the_first_ack() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(response_socket_path(dir.path(), 9)).unwrap();
        let (gone_tx, _gone_rx) = mpsc::unbounded_channel();

        let (handle, _task) = connect(dir.path(), 9, gone_tx).await.unwrap();
        let (mut peer, _) = listener.accept().await.unwrap();

        handle.send(Bytes::from_static(b"one"));
        handle.send(Bytes::from_static(b"two"));

        let first = read_frame(&mut peer).await.unwrap().unwrap();
        assert_eq!(&first[..], b"one");

        // Nothing else may arrive until we ACK.
        let premature =
            tokio::time::timeout(std::time::Duration::from_millis(100), read_frame(&mut peer))
                .await;
        assert!(premature.is_err(), "frame two must wait for the ACK");

        peer.write_all(ACK_TOKEN).await.unwrap();
        let second = read_frame(&mut peer).await.unwrap().unwrap();
        assert_eq!(&second[..], b"two");
    }

    #[tokio::test]
    async fn lost_peer_reports_client_gone() {
        let dir = tempfile::tempdir().unwrap();
        let listener = UnixListener::bind(response_socket_path(dir.path(), 4)).unwrap();
        let (gone_tx, mut gone_rx) = mpsc::unbounded_channel();

        let (handle, _task) = connect(dir.path(), 4, gone_tx).await.unwrap();
        let (peer, _) = listener.accept().await.unwrap();
        drop(peer);

        handle.send(Bytes::from_static(b"frame"));
        assert_eq!(gone_rx.recv().await, Some(4));
    }
}
