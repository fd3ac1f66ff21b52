//! Client notify listener: the inbound-from-broker channel.
//!
//! Listens on the private response socket named by the client id.  The
//! broker connects once, right after registration, and keeps that connection
//! for the life of the registration; every response and notification frame
//! is read from it.  Frames are handed to the engine, which writes the ACK
//! token back once each frame has been handled — the broker will not send
//! the next frame before then.

use std::io;
use std::path::Path;

use sqlapi_protocol::{Response, read_frame, response_socket_path};
use tokio::net::UnixListener;
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::{mpsc, watch};
use tracing::{debug, warn};

/// Events from the listener to the engine.
#[derive(Debug)]
pub(crate) enum NotifierEvent {
    /// The broker connected; the engine writes ACKs through this half.
    Connected(OwnedWriteHalf),
    /// One decoded frame.
    Frame(Response),
    /// A frame that did not decode.  The engine still ACKs it so the broker
    /// does not stall on this client.
    Garbage,
    /// The broker hung up.
    Closed,
}

/// Bind the response socket and start listening.  Returns a watch that
/// flips to `true` when the broker's connection arrives — the constructor's
/// spawn handshake waits on it.
pub(crate) fn start(
    socket_dir: &Path,
    client_id: i32,
    notify_tx: mpsc::UnboundedSender<NotifierEvent>,
) -> io::Result<watch::Receiver<bool>> {
    let path = response_socket_path(socket_dir, client_id);
    // Client ids are random; a leftover socket file under our name belongs
    // to a dead process.
    if path.exists() {
        let _ = std::fs::remove_file(&path);
    }
    let listener = UnixListener::bind(&path)?;
    let (connected_tx, connected_rx) = watch::channel(false);
    tokio::spawn(listen(listener, notify_tx, connected_tx));
    Ok(connected_rx)
}

async fn listen(
    listener: UnixListener,
    notify_tx: mpsc::UnboundedSender<NotifierEvent>,
    connected_tx: watch::Sender<bool>,
) {
    let Ok((stream, _addr)) = listener.accept().await else {
        return;
    };
    debug!("broker connected to notify listener");
    let _ = connected_tx.send(true);

    let (mut read_half, write_half) = stream.into_split();
    if notify_tx.send(NotifierEvent::Connected(write_half)).is_err() {
        return;
    }

    loop {
        match read_frame(&mut read_half).await {
            Ok(Some(frame)) => {
                let event = match Response::from_frame(&frame) {
                    Ok(response) => NotifierEvent::Frame(response),
                    Err(e) => {
                        warn!(error = %e, "ignoring undecodable frame");
                        NotifierEvent::Garbage
                    }
                };
                if notify_tx.send(event).is_err() {
                    return;
                }
            }
            Ok(None) | Err(_) => {
                debug!("notify channel closed");
                let _ = notify_tx.send(NotifierEvent::Closed);
                return;
            }
        }
    }
}
