//! Façade engine: the request queue and response demultiplexer.
//!
//! One task owns the client-side state.  Public API calls enqueue requests;
//! the engine keeps at most one outstanding on the wire and sends the next
//! only once a confirmation or data response has arrived.  Inbound frames
//! are demultiplexed into [`SqlApiEvent`]s and ACKed back to the broker
//! after handling, which is what paces the broker's response channel.

use std::collections::VecDeque;
use std::path::PathBuf;

use sqlapi_protocol::{ErrorCode, Request, Response, ResponseKind, Value, request_socket_path, write_ack};
use tokio::net::unix::OwnedWriteHalf;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::SqlApiEvent;
use crate::notifier::NotifierEvent;
use crate::requester::{self, RequestError};

/// Commands from the façade to the engine.
#[derive(Debug)]
pub(crate) enum EngineCmd {
    Submit {
        request: Request,
        /// Updated row width for chunking streamed ItemData bodies.
        columns: Option<usize>,
    },
}

pub(crate) fn spawn(
    socket_dir: PathBuf,
    cmd_rx: mpsc::UnboundedReceiver<EngineCmd>,
    notify_rx: mpsc::UnboundedReceiver<NotifierEvent>,
    events_tx: mpsc::UnboundedSender<SqlApiEvent>,
) {
    let (send_done_tx, send_done_rx) = mpsc::unbounded_channel();
    let engine = Engine {
        socket_dir,
        events_tx,
        send_done_tx,
        queue: VecDeque::new(),
        waiting: false,
        dead: false,
        columns: 0,
        ack_writer: None,
    };
    tokio::spawn(run(engine, cmd_rx, notify_rx, send_done_rx));
}

struct Engine {
    socket_dir: PathBuf,
    events_tx: mpsc::UnboundedSender<SqlApiEvent>,
    send_done_tx: mpsc::UnboundedSender<Result<(), RequestError>>,
    queue: VecDeque<Request>,
    /// True from dispatch until the matching response frame arrives.
    waiting: bool,
    /// Set on fatal transport failure; everything queued is abandoned.
    dead: bool,
    /// Cells per row when splitting an ItemData body.
    columns: usize,
    ack_writer: Option<OwnedWriteHalf>,
}

async fn run(
    mut engine: Engine,
    mut cmd_rx: mpsc::UnboundedReceiver<EngineCmd>,
    mut notify_rx: mpsc::UnboundedReceiver<NotifierEvent>,
    mut send_done_rx: mpsc::UnboundedReceiver<Result<(), RequestError>>,
) {
    loop {
        tokio::select! {
            cmd = cmd_rx.recv() => match cmd {
                Some(EngineCmd::Submit { request, columns }) => engine.submit(request, columns),
                None => break, // façade dropped
            },
            Some(event) = notify_rx.recv() => engine.handle_notifier(event).await,
            Some(outcome) = send_done_rx.recv() => engine.handle_send_outcome(outcome),
        }
    }
}

impl Engine {
    fn submit(&mut self, request: Request, columns: Option<usize>) {
        if let Some(columns) = columns {
            self.columns = columns;
        }
        self.queue.push_back(request);
        self.try_dispatch();
    }

    /// Put the next queued request on the wire if none is outstanding.
    fn try_dispatch(&mut self) {
        if self.waiting || self.dead {
            return;
        }
        let Some(request) = self.queue.pop_front() else {
            return;
        };
        debug!(kind = ?request.kind, "sending request");
        self.waiting = true;
        let path = request_socket_path(&self.socket_dir);
        let frame = request.to_frame();
        let done = self.send_done_tx.clone();
        tokio::spawn(async move {
            let _ = done.send(requester::send_request(&path, &frame).await);
        });
    }

    fn handle_send_outcome(&mut self, outcome: Result<(), RequestError>) {
        if let Err(e) = outcome {
            warn!(error = %e, "request transmission failed");
            self.dead = true;
            self.waiting = false;
            self.emit(SqlApiEvent::TransportError(e.to_string()));
        }
        // On success the response frame, not the ACK, advances the queue.
    }

    async fn handle_notifier(&mut self, event: NotifierEvent) {
        match event {
            NotifierEvent::Connected(writer) => {
                self.ack_writer = Some(writer);
            }
            NotifierEvent::Frame(response) => {
                let advance = self.handle_frame(response);
                self.ack().await;
                if advance {
                    self.waiting = false;
                    self.try_dispatch();
                }
            }
            NotifierEvent::Garbage => {
                // Unknown frames are ignored, but the broker still needs the
                // ACK or it stalls on this client.
                self.ack().await;
            }
            NotifierEvent::Closed => {
                self.ack_writer = None;
                if self.waiting || !self.queue.is_empty() {
                    self.emit(SqlApiEvent::TransportError(
                        "notify channel closed".to_owned(),
                    ));
                }
                self.dead = true;
            }
        }
    }

    async fn ack(&mut self) {
        if let Some(writer) = &mut self.ack_writer {
            if write_ack(writer).await.is_err() {
                debug!("ack write failed");
            }
        }
    }

    /// Demultiplex one frame.  Returns whether it completes an outstanding
    /// request (notifications do not).
    fn handle_frame(&mut self, response: Response) -> bool {
        match response {
            Response::Confirmation => {
                self.emit(SqlApiEvent::Confirmation);
                true
            }
            Response::Update(key) => {
                self.emit(SqlApiEvent::UpdateNotification(key));
                false
            }
            Response::Delete(key) => {
                self.emit(SqlApiEvent::DeleteNotification(key));
                false
            }
            Response::Data { kind, status, body } => {
                self.handle_data(kind, status, body);
                true
            }
        }
    }

    fn handle_data(&mut self, kind: ResponseKind, status: ErrorCode, body: Vec<Value>) {
        match kind {
            ResponseKind::Initialized => self.emit(SqlApiEvent::Initialized(status)),
            ResponseKind::ItemData => {
                let rows = chunk_rows(body, self.columns);
                // An empty result means not-found regardless of what the
                // engine reported.
                let status = if rows.is_empty() {
                    ErrorCode::NotFoundError
                } else {
                    status
                };
                self.emit(SqlApiEvent::Read { status, rows });
            }
            ResponseKind::Count => {
                let count = body.first().map_or(0, cell_to_i64);
                self.emit(SqlApiEvent::Count { status, count });
            }
            ResponseKind::Tables => self.emit(SqlApiEvent::Tables {
                status,
                tables: body,
            }),
            ResponseKind::Columns => self.emit(SqlApiEvent::Columns {
                status,
                columns: body,
            }),
            ResponseKind::WriteAck => self.emit(SqlApiEvent::Written(status)),
            ResponseKind::DeleteAck => self.emit(SqlApiEvent::Deleted),
            ResponseKind::DeleteAllAck => self.emit(SqlApiEvent::DeletedAll),
            other => debug!(kind = ?other, "ignoring unexpected response kind"),
        }
    }

    fn emit(&self, event: SqlApiEvent) {
        let _ = self.events_tx.send(event);
    }
}

/// Split a flat run of cells into rows of `columns` cells each.
fn chunk_rows(body: Vec<Value>, columns: usize) -> Vec<Vec<Value>> {
    if body.is_empty() {
        return Vec::new();
    }
    let width = columns.max(1);
    body.chunks(width).map(<[Value]>::to_vec).collect()
}

fn cell_to_i64(value: &Value) -> i64 {
    match value {
        Value::Int(v) => *v,
        Value::UInt(v) => *v as i64,
        Value::Double(v) => *v as i64,
        _ => 0,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn text(s: &str) -> Value {
        Value::Text(s.to_owned())
    }

    #[test]
    fn chunking_splits_on_column_boundaries() {
        let body = vec![text("a"), Value::Int(1), text("b"), Value::Int(2)];
        let rows = chunk_rows(body, 2);
        assert_eq!(rows, vec![
            vec![text("a"), Value::Int(1)],
            vec![text("b"), Value::Int(2)],
        ]);
    }

    #[test]
    fn chunking_with_unset_width_yields_single_cell_rows() {
        let rows = chunk_rows(vec![text("a"), text("b")], 0);
        assert_eq!(rows.len(), 2);
    }

    #[test]
    fn empty_body_yields_no_rows() {
        assert!(chunk_rows(Vec::new(), 3).is_empty());
    }

    #[test]
    fn count_cell_coerces_numeric_kinds() {
        assert_eq!(cell_to_i64(&Value::Int(3)), 3);
        assert_eq!(cell_to_i64(&Value::UInt(4)), 4);
        assert_eq!(cell_to_i64(&Value::Double(5.9)), 5);
        assert_eq!(cell_to_i64(&text("x")), 0);
    }
}
