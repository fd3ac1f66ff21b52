//! Broker core: owns every piece of per-client state and routes requests.
//!
//! One task runs the event loop; request intake and the per-client response
//! writers are cooperative tasks feeding it through channels, and the SQL
//! thread returns execution outcomes the same way.  No component holds a
//! reference back to the core — everything is message passing.

use std::collections::HashMap;
use std::io;

use sqlapi_protocol::{
    DEFAULT_DB_NAME, ErrorCode, Request, RequestKind, Response, ResponseKind, VERSION,
    request_socket_path,
};
use tokio::net::UnixListener;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::BrokerConfig;
use crate::intake::{self, IntakeEvent};
use crate::queue::RequestQueue;
use crate::responder::{self, ResponderHandle};
use crate::storage::{ExecOutcome, Storage, db_path};
use crate::subscriptions::SubscriptionSet;

/// Broker-side record of one registered client.
struct ClientState {
    responder: ResponderHandle,
    task: JoinHandle<()>,
    subscriptions: SubscriptionSet,
}

/// Run the broker until its exit condition fires.
///
/// Binds the request channel, registers the launching client when given one,
/// then serves until the registered-client count drops to zero or an
/// abnormal disconnect arrives with at most one client registered.
pub async fn run(cfg: BrokerConfig) -> io::Result<()> {
    let request_path = request_socket_path(&cfg.socket_dir);
    // A socket file left by a crashed broker blocks the bind; the singleton
    // guard already guarantees we are alone.
    if request_path.exists() {
        let _ = std::fs::remove_file(&request_path);
    }
    let listener = UnixListener::bind(&request_path)?;
    info!(version = VERSION, path = %request_path.display(), "request channel open");

    let (intake_tx, intake_rx) = mpsc::unbounded_channel();
    let intake_task = tokio::spawn(intake::run(listener, intake_tx));

    let (results_tx, results_rx) = mpsc::unbounded_channel();
    let (gone_tx, gone_rx) = mpsc::unbounded_channel();
    let storage = Storage::spawn(db_path(&cfg.db_dir, DEFAULT_DB_NAME), 0, results_tx.clone());

    let mut broker = Broker {
        cfg,
        clients: HashMap::new(),
        queue: RequestQueue::new(),
        storage,
        busy: false,
        results_tx,
        gone_tx,
        closing: Vec::new(),
        shutdown: false,
    };

    if let Some(first) = broker.cfg.first_client {
        if broker.register_client(first).await {
            // First frame on the fresh response channel doubles as the
            // launch handshake: the client observes connect + Confirmation.
            broker.confirm(first);
        } else {
            warn!(client_id = first, "launching client is unreachable; exiting");
            broker.shutdown = true;
        }
    }

    broker.event_loop(intake_rx, results_rx, gone_rx).await;
    intake_task.abort();
    broker.finish().await;
    let _ = std::fs::remove_file(&request_path);
    info!("broker exit");
    Ok(())
}

struct Broker {
    cfg: BrokerConfig,
    clients: HashMap<i32, ClientState>,
    queue: RequestQueue,
    storage: Storage,
    /// True while the queue head is on the SQL thread.
    busy: bool,
    results_tx: mpsc::UnboundedSender<ExecOutcome>,
    gone_tx: mpsc::UnboundedSender<i32>,
    /// Writer tasks still flushing a final Confirmation.
    closing: Vec<JoinHandle<()>>,
    shutdown: bool,
}

impl Broker {
    async fn event_loop(
        &mut self,
        mut intake_rx: mpsc::UnboundedReceiver<IntakeEvent>,
        mut results_rx: mpsc::UnboundedReceiver<ExecOutcome>,
        mut gone_rx: mpsc::UnboundedReceiver<i32>,
    ) {
        while !self.shutdown {
            tokio::select! {
                event = intake_rx.recv() => match event {
                    Some(IntakeEvent::Request(request)) => self.handle_request(request).await,
                    Some(IntakeEvent::Aborted) => {
                        if self.clients.len() <= 1 {
                            info!(clients = self.clients.len(), "abnormal disconnect; shutting down");
                            self.shutdown = true;
                        }
                    }
                    None => self.shutdown = true,
                },
                Some(outcome) = results_rx.recv() => self.handle_outcome(outcome),
                Some(client_id) = gone_rx.recv() => self.remove_client(client_id),
            }
        }
    }

    // -----------------------------------------------------------------------
    // Request routing
    // -----------------------------------------------------------------------

    async fn handle_request(&mut self, request: Request) {
        debug!(client_id = request.client_id, kind = ?request.kind, "request");
        match request.kind {
            RequestKind::Register => {
                if self.register_client(request.client_id).await {
                    self.confirm(request.client_id);
                }
            }

            RequestKind::Unregister => {
                self.confirm(request.client_id);
                if let Some(state) = self.clients.remove(&request.client_id) {
                    info!(client_id = request.client_id, "client unregistered");
                    // Close after the Confirmation so it still flushes.
                    state.responder.close();
                    self.closing.push(state.task);
                    if self.clients.is_empty() {
                        info!("no registered clients left; shutting down");
                        self.shutdown = true;
                    }
                }
            }

            RequestKind::SubscribeKey | RequestKind::UnsubscribeKey => {
                match self.clients.get_mut(&request.client_id) {
                    Some(state) => {
                        if request.kind == RequestKind::SubscribeKey {
                            state.subscriptions.subscribe(request.item_key.clone());
                        } else if !state.subscriptions.unsubscribe(&request.item_key) {
                            debug!(client_id = request.client_id, "unsubscribe: key not found");
                        }
                        self.confirm(request.client_id);
                    }
                    None => {
                        warn!(client_id = request.client_id, "subscription change from unknown client");
                    }
                }
            }

            RequestKind::CancelLast => {
                if !self.queue.cancel_last(request.client_id) {
                    debug!(client_id = request.client_id, "cancel: nothing to remove");
                }
                self.confirm(request.client_id);
            }

            RequestKind::ChangeDB => {
                let name = request.item_key.sql_text();
                info!(db = %name, dropped = self.queue.len(), "switching database");
                self.queue.drain();
                let generation = self.storage.generation() + 1;
                self.storage = Storage::spawn(
                    db_path(&self.cfg.db_dir, &name),
                    generation,
                    self.results_tx.clone(),
                );
                self.busy = false;
                self.confirm(request.client_id);
            }

            RequestKind::CreateTable
            | RequestKind::ReadOne
            | RequestKind::Count
            | RequestKind::ReadTables
            | RequestKind::ReadColumns
            | RequestKind::ReadAll
            | RequestKind::WriteRow
            | RequestKind::DeleteOne
            | RequestKind::DeleteAll => {
                if self.clients.contains_key(&request.client_id) {
                    self.queue.push(request);
                    self.dispatch();
                } else {
                    debug!(client_id = request.client_id, "request from unregistered client dropped");
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Dispatch and response emission
    // -----------------------------------------------------------------------

    /// Hand the queue head to the SQL thread if it is idle.  The head stays
    /// queued until its outcome returns, so `cancel_last` can never race it.
    fn dispatch(&mut self) {
        if self.busy {
            return;
        }
        if let Some(head) = self.queue.head() {
            self.storage.submit(head.clone());
            self.busy = true;
        }
    }

    fn handle_outcome(&mut self, outcome: ExecOutcome) {
        if outcome.generation != self.storage.generation() {
            debug!("discarding result from a replaced storage");
            return;
        }
        self.busy = false;
        let _ = self.queue.pop_head();
        self.emit(outcome);
        self.dispatch();
    }

    fn emit(&mut self, outcome: ExecOutcome) {
        let ExecOutcome {
            request,
            mut status,
            mut cursor,
            ..
        } = outcome;

        match request.kind {
            RequestKind::CreateTable => {
                // Re-running initialize over an existing table is the
                // intended idempotent shape; mask the duplicate-table error.
                if status == ErrorCode::AlreadyExistError {
                    status = ErrorCode::NoError;
                }
                self.send_to(
                    request.client_id,
                    &Response::data(ResponseKind::Initialized, status, Vec::new()),
                );
            }

            RequestKind::ReadOne
            | RequestKind::Count
            | RequestKind::ReadTables
            | RequestKind::ReadColumns => {
                if cursor.row_count() == 0 {
                    // The engine reports no error for an empty result.
                    status = ErrorCode::NotFoundError;
                }
                let kind = match request.kind {
                    RequestKind::ReadOne => ResponseKind::ItemData,
                    RequestKind::Count => ResponseKind::Count,
                    RequestKind::ReadTables => ResponseKind::Tables,
                    _ => ResponseKind::Columns,
                };
                self.send_to(
                    request.client_id,
                    &Response::data(kind, status, cursor.into_cells()),
                );
            }

            RequestKind::ReadAll => {
                if status != ErrorCode::NoError || cursor.row_count() == 0 {
                    let status = if status == ErrorCode::NoError {
                        ErrorCode::NotFoundError
                    } else {
                        status
                    };
                    self.send_to(
                        request.client_id,
                        &Response::data(ResponseKind::ItemData, status, Vec::new()),
                    );
                } else {
                    // One frame per row; the responder delivers them one ACK
                    // cycle at a time.
                    while let Some(row) = cursor.next_row() {
                        self.send_to(
                            request.client_id,
                            &Response::data(ResponseKind::ItemData, status, row),
                        );
                    }
                }
            }

            RequestKind::WriteRow | RequestKind::DeleteOne | RequestKind::DeleteAll => {
                let kind = match request.kind {
                    RequestKind::WriteRow => ResponseKind::WriteAck,
                    RequestKind::DeleteOne => ResponseKind::DeleteAck,
                    _ => ResponseKind::DeleteAllAck,
                };
                self.send_to(request.client_id, &Response::data(kind, status, Vec::new()));
                if status == ErrorCode::NoError {
                    self.fan_out(&request);
                }
            }

            _ => debug!(kind = ?request.kind, "no response emitter for kind"),
        }
    }

    /// Notify every other registered client subscribed to the mutated key.
    /// The originator's ack has already been queued, so a client's own
    /// notification can never overtake its ack.
    fn fan_out(&self, request: &Request) {
        let response = match request.kind {
            RequestKind::WriteRow => Response::Update(request.item_key.clone()),
            _ => Response::Delete(request.item_key.clone()),
        };
        let frame = response.to_frame();
        for (id, state) in &self.clients {
            if *id != request.client_id && state.subscriptions.contains(&request.item_key) {
                debug!(client_id = *id, "change notification");
                state.responder.send(frame.clone());
            }
        }
    }

    // -----------------------------------------------------------------------
    // Client lifecycle
    // -----------------------------------------------------------------------

    async fn register_client(&mut self, client_id: i32) -> bool {
        if self.clients.contains_key(&client_id) {
            // Re-register from the client that launched us.
            return true;
        }
        match responder::connect(&self.cfg.socket_dir, client_id, self.gone_tx.clone()).await {
            Ok((handle, task)) => {
                self.clients.insert(
                    client_id,
                    ClientState {
                        responder: handle,
                        task,
                        subscriptions: SubscriptionSet::new(),
                    },
                );
                info!(client_id, clients = self.clients.len(), "client registered");
                true
            }
            Err(e) => {
                warn!(client_id, error = %e, "cannot reach client notify channel");
                false
            }
        }
    }

    fn remove_client(&mut self, client_id: i32) {
        if let Some(state) = self.clients.remove(&client_id) {
            info!(client_id, clients = self.clients.len(), "client removed");
            state.responder.close();
            self.closing.push(state.task);
            if self.clients.is_empty() {
                info!("no registered clients left; shutting down");
                self.shutdown = true;
            }
        }
    }

    fn confirm(&self, client_id: i32) {
        self.send_to(client_id, &Response::Confirmation);
    }

    fn send_to(&self, client_id: i32, response: &Response) {
        if let Some(state) = self.clients.get(&client_id) {
            state.responder.send(response.to_frame());
        } else {
            // The client may have been removed before its response was ready.
            debug!(client_id, "no response channel for client");
        }
    }

    /// Let every writer task flush its queue before the process exits.
    async fn finish(&mut self) {
        for (_, state) in self.clients.drain() {
            state.responder.close();
            self.closing.push(state.task);
        }
        for task in self.closing.drain(..) {
            let _ = task.await;
        }
    }
}
