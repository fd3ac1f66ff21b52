//! Public client façade.
//!
//! A `SqlApi` is one registered client of the host's broker.  Construction
//! performs the launch handshake: probe the shared request channel, register
//! over it when a broker is already running, or spawn the broker binary and
//! wait for it to connect back.  Every operation is asynchronous and
//! fire-and-forget; results and change notifications arrive as
//! [`SqlApiEvent`]s on the receiver handed out by [`SqlApi::take_events`].

use std::io;
use std::path::PathBuf;
use std::process::{Child, Command};
use std::time::Duration;

use rand::Rng;
use sqlapi_protocol::{
    ErrorCode, Request, RequestKind, Value, names, read_ack, request_socket_path, write_frame,
};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::engine::{self, EngineCmd};
use crate::notifier;

// ---------------------------------------------------------------------------
// Configuration
// ---------------------------------------------------------------------------

/// Configuration for one façade instance.
#[derive(Debug, Clone)]
pub struct SqlApiConfig {
    /// Storage table targeted by the data operations.
    pub table: String,
    /// Directory holding the broker's sockets.
    pub socket_dir: PathBuf,
    /// Broker executable, spawned when no broker is reachable.
    pub server_exe: PathBuf,
    /// Working directory for a spawned broker (database files land there).
    pub server_workdir: Option<PathBuf>,
    /// How long the constructor waits for registration to complete.
    pub register_timeout: Duration,
}

impl SqlApiConfig {
    pub fn new(table: impl Into<String>) -> Self {
        SqlApiConfig {
            table: table.into(),
            socket_dir: sqlapi_protocol::socket_dir(),
            server_exe: std::env::var_os(names::SERVER_EXE_ENV)
                .map_or_else(|| PathBuf::from(names::SERVER_EXE_NAME), PathBuf::from),
            server_workdir: None,
            register_timeout: Duration::from_secs(names::REGISTER_TIMEOUT_SECS),
        }
    }
}

// ---------------------------------------------------------------------------
// Events and errors
// ---------------------------------------------------------------------------

/// Asynchronous results and notifications, one per response frame.
#[derive(Debug, Clone, PartialEq)]
pub enum SqlApiEvent {
    /// `initialize` finished (`AlreadyExist` is already masked broker-side).
    Initialized(ErrorCode),
    /// Result rows for `read` / one streamed frame of `read_all`.
    Read {
        status: ErrorCode,
        rows: Vec<Vec<Value>>,
    },
    Count {
        status: ErrorCode,
        count: i64,
    },
    Tables {
        status: ErrorCode,
        tables: Vec<Value>,
    },
    Columns {
        status: ErrorCode,
        columns: Vec<Value>,
    },
    Written(ErrorCode),
    /// Delete acks carry no status: the engine cannot tell whether anything
    /// matched.
    Deleted,
    DeletedAll,
    /// Another client wrote the row with this key.
    UpdateNotification(Value),
    /// Another client deleted the row with this key.
    DeleteNotification(Value),
    /// Ack for a control request (subscribe, cancel, changeDB, ...).
    Confirmation,
    /// Fatal transport failure; the façade is dead.
    TransportError(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SqlApiError {
    #[error("failed to bind the notify listener: {0}")]
    Bind(io::Error),
    #[error("failed to launch the broker: {0}")]
    Spawn(io::Error),
    #[error("timed out waiting for broker registration")]
    RegistrationTimeout,
    #[error("transport: {0}")]
    Transport(String),
}

// ---------------------------------------------------------------------------
// Schema initializers
// ---------------------------------------------------------------------------

/// Abstract column kinds accepted by `initialize`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValueKind {
    Bool,
    Int,
    UInt,
    LongLong,
    ULongLong,
    Float,
    String,
    Char,
    Date,
    Bytes,
    BitArray,
}

/// One column declaration: kind, name, and reserved length.
#[derive(Debug, Clone)]
pub struct Initializer {
    kind: ValueKind,
    name: String,
    max_length: usize,
}

impl Initializer {
    pub fn new(kind: ValueKind, name: impl Into<String>, max_length: usize) -> Self {
        Initializer {
            kind,
            name: name.into(),
            max_length,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The SQL column type for this kind.
    fn sql_type(&self) -> String {
        match self.kind {
            ValueKind::Bool
            | ValueKind::Int
            | ValueKind::UInt
            | ValueKind::LongLong
            | ValueKind::ULongLong
            | ValueKind::Float => "INTEGER".to_owned(),
            ValueKind::String | ValueKind::Char | ValueKind::Date => {
                format!("VARCHAR({})", self.max_length)
            }
            ValueKind::Bytes | ValueKind::BitArray => "BLOB".to_owned(),
        }
    }
}

// ---------------------------------------------------------------------------
// SqlApi
// ---------------------------------------------------------------------------

/// One registered client of the host broker.
pub struct SqlApi {
    client_id: i32,
    table: String,
    primary_key: String,
    columns: usize,
    cmd_tx: mpsc::UnboundedSender<EngineCmd>,
    events_rx: Option<mpsc::UnboundedReceiver<SqlApiEvent>>,
    /// Broker child when this façade launched it.  Never killed: the broker
    /// outlives us and exits on its own once idle.
    _server: Option<Child>,
}

impl SqlApi {
    /// Register with the host broker, launching it if necessary.
    pub async fn connect(config: SqlApiConfig) -> Result<Self, SqlApiError> {
        let client_id = rand::thread_rng().gen_range(1..=i32::MAX);
        info!(
            version = sqlapi_protocol::VERSION,
            client_id, "connecting client façade"
        );

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let mut connected_rx = notifier::start(&config.socket_dir, client_id, notify_tx)
            .map_err(SqlApiError::Bind)?;
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        engine::spawn(config.socket_dir.clone(), cmd_rx, notify_rx, events_tx);

        let request_path = request_socket_path(&config.socket_dir);
        let mut server = None;
        match UnixStream::connect(&request_path).await {
            Ok(mut stream) => {
                // A broker is running: register over the probe connection.
                debug!(client_id, "broker reachable; registering");
                let register = Request::control(client_id, RequestKind::Register);
                write_frame(&mut stream, &register.to_frame())
                    .await
                    .map_err(|e| SqlApiError::Transport(e.to_string()))?;
                read_ack(&mut stream)
                    .await
                    .map_err(|e| SqlApiError::Transport(e.to_string()))?;
                drop(stream);

                // Registration completes when the Confirmation lands on the
                // fresh response channel.
                await_confirmation(&mut events_rx, config.register_timeout).await?;
            }
            Err(probe_err) => {
                // No broker: launch it with our id; it registers us itself
                // and connects back to the notify listener.
                debug!(client_id, error = %probe_err, "broker not reachable; launching");
                let mut command = Command::new(&config.server_exe);
                command
                    .arg(client_id.to_string())
                    .arg("--socket-dir")
                    .arg(&config.socket_dir);
                if let Some(dir) = &config.server_workdir {
                    command.current_dir(dir);
                }
                server = Some(command.spawn().map_err(SqlApiError::Spawn)?);

                let connected = async {
                    while !*connected_rx.borrow() {
                        if connected_rx.changed().await.is_err() {
                            break;
                        }
                    }
                };
                tokio::time::timeout(config.register_timeout, connected)
                    .await
                    .map_err(|_| SqlApiError::RegistrationTimeout)?;
                if !*connected_rx.borrow() {
                    return Err(SqlApiError::Transport(
                        "notify listener stopped".to_owned(),
                    ));
                }
                // The broker confirms the implicit registration with a first
                // frame; consume it here so it never reaches the application.
                await_confirmation(&mut events_rx, config.register_timeout).await?;
                info!(client_id, "broker launched and connected");
            }
        }

        Ok(SqlApi {
            client_id,
            table: config.table,
            primary_key: String::new(),
            columns: 0,
            cmd_tx,
            events_rx: Some(events_rx),
            _server: server,
        })
    }

    pub fn client_id(&self) -> i32 {
        self.client_id
    }

    /// The event stream.  Yields `None` after a fatal transport failure.
    pub fn take_events(&mut self) -> Option<mpsc::UnboundedReceiver<SqlApiEvent>> {
        self.events_rx.take()
    }

    // -----------------------------------------------------------------------
    // Storage operations
    // -----------------------------------------------------------------------

    /// Create the storage table.  Safe to call on every start: an existing
    /// identical table reports `NoError`.
    pub fn initialize(&mut self, identifier: &Initializer, fields: &[Initializer]) {
        self.primary_key = identifier.name().to_owned();
        self.columns = fields.len() + 1;
        let query = create_table_sql(&self.table, identifier, fields);
        self.submit_with_columns(
            Request {
                client_id: self.client_id,
                kind: RequestKind::CreateTable,
                item_key: Value::Null,
                payload: query,
            },
            self.columns,
        );
    }

    /// Read the row stored under `key`.  Emits one `Read` event.
    pub fn read(&self, key: &Value) {
        let query = format!(
            "SELECT * FROM {} WHERE {} = {}",
            self.table,
            self.primary_key,
            sql_quote(key)
        );
        self.submit(self.data_request(RequestKind::ReadOne, Value::Null, query));
    }

    /// Read every row.  Emits one `Read` event per row, in table order;
    /// `columns_count` tells the decoder how to slice the streamed cells.
    pub fn read_all(&mut self, columns_count: usize) {
        if columns_count > 0 {
            self.columns = columns_count;
        }
        let query = format!("SELECT * FROM {}", self.table);
        self.submit_with_columns(
            self.data_request(RequestKind::ReadAll, Value::Null, query),
            self.columns,
        );
    }

    /// Row count of the table.  Emits a `Count` event.
    pub fn count(&self) {
        let query = format!("SELECT COUNT(*) FROM {}", self.table);
        self.submit(self.data_request(RequestKind::Count, Value::Null, query));
    }

    /// List all tables in the database.  Emits a `Tables` event.
    pub fn read_tables(&self) {
        let query = "SELECT name FROM sqlite_master WHERE type='table'".to_owned();
        self.submit(self.data_request(RequestKind::ReadTables, Value::Null, query));
    }

    /// Schema of the current table.  Emits a `Columns` event.
    pub fn read_columns(&self) {
        let query = format!("PRAGMA table_info({})", self.table);
        self.submit(self.data_request(RequestKind::ReadColumns, Value::Null, query));
    }

    /// Insert or replace one row.  The first value is the primary key and
    /// becomes the notification key for subscribers.
    pub fn write_item(&self, values: &[Value]) {
        let Some(key) = values.first() else {
            warn!("write_item called with no values");
            return;
        };
        let cells: Vec<String> = values.iter().map(sql_quote).collect();
        let query = format!("INSERT INTO {} VALUES ({})", self.table, cells.join(","));
        self.submit(self.data_request(RequestKind::WriteRow, key.clone(), query));
    }

    /// Delete the row stored under `key`.  Emits `Deleted` regardless of
    /// whether the row existed.
    pub fn delete_item(&self, key: &Value) {
        let query = format!(
            "DELETE FROM {} WHERE {} = {}",
            self.table,
            self.primary_key,
            sql_quote(key)
        );
        self.submit(self.data_request(RequestKind::DeleteOne, key.clone(), query));
    }

    /// Drop the named table, or the current one when `table` is `None`.
    pub fn delete_all(&self, table: Option<&str>) {
        let query = format!("DROP TABLE {}", table.unwrap_or(&self.table));
        self.submit(self.data_request(RequestKind::DeleteAll, Value::Null, query));
    }

    // -----------------------------------------------------------------------
    // Subscriptions and control
    // -----------------------------------------------------------------------

    /// Be notified when any other client changes the row under `key`.
    /// Key types must match the writer's key type exactly.
    pub fn subscribe_change_notifications(&self, key: &Value) {
        self.submit(self.control_request(RequestKind::SubscribeKey, key.clone()));
    }

    pub fn unsubscribe_change_notifications(&self, key: &Value) {
        self.submit(self.control_request(RequestKind::UnsubscribeKey, key.clone()));
    }

    /// Best-effort cancel of the most recent queued request; a request
    /// already executing is not affected.
    pub fn cancel_async_request(&self) {
        self.submit(Request::control(self.client_id, RequestKind::CancelLast));
    }

    /// Rebind the broker to another database file.  Pending queued requests
    /// of all clients are dropped.
    pub fn change_db(&self, filename: &str) {
        self.submit(self.control_request(RequestKind::ChangeDB, Value::Text(filename.to_owned())));
    }

    /// Deregister from the broker.  The last client to leave shuts the
    /// broker down.
    pub fn unregister(&self) {
        self.submit(Request::control(self.client_id, RequestKind::Unregister));
    }

    /// Switch the table targeted by subsequent operations.  Local only.
    pub fn set_table(&mut self, name: &str) {
        self.table = name.to_owned();
    }

    /// Switch the primary-key column used by `read`/`delete_item`.  Local
    /// only.
    pub fn set_primary_key(&mut self, name: &str) {
        self.primary_key = name.to_owned();
    }

    // -----------------------------------------------------------------------
    // Private helpers
    // -----------------------------------------------------------------------

    fn data_request(&self, kind: RequestKind, item_key: Value, payload: String) -> Request {
        Request {
            client_id: self.client_id,
            kind,
            item_key,
            payload,
        }
    }

    fn control_request(&self, kind: RequestKind, item_key: Value) -> Request {
        Request {
            client_id: self.client_id,
            kind,
            item_key,
            payload: String::new(),
        }
    }

    fn submit(&self, request: Request) {
        if self
            .cmd_tx
            .send(EngineCmd::Submit {
                request,
                columns: None,
            })
            .is_err()
        {
            warn!("engine stopped; request dropped");
        }
    }

    fn submit_with_columns(&self, request: Request, columns: usize) {
        if self
            .cmd_tx
            .send(EngineCmd::Submit {
                request,
                columns: Some(columns),
            })
            .is_err()
        {
            warn!("engine stopped; request dropped");
        }
    }
}

/// Wait for the registration Confirmation, discarding anything else that
/// sneaks in first.  Timeout here is fatal for the constructor.
async fn await_confirmation(
    events_rx: &mut mpsc::UnboundedReceiver<SqlApiEvent>,
    register_timeout: Duration,
) -> Result<(), SqlApiError> {
    let deadline = tokio::time::Instant::now() + register_timeout;
    loop {
        let now = tokio::time::Instant::now();
        if now >= deadline {
            return Err(SqlApiError::RegistrationTimeout);
        }
        match tokio::time::timeout(deadline - now, events_rx.recv()).await {
            Ok(Some(SqlApiEvent::Confirmation)) => return Ok(()),
            Ok(Some(event)) => debug!(?event, "event before registration confirmed"),
            Ok(None) => return Err(SqlApiError::Transport("engine stopped".to_owned())),
            Err(_) => return Err(SqlApiError::RegistrationTimeout),
        }
    }
}

/// Synthesise the idempotent CREATE TABLE statement.  `ON CONFLICT REPLACE`
/// on the primary key turns later inserts into upserts.  The emitted shape
/// is frozen for compatibility with databases created by earlier versions.
fn create_table_sql(table: &str, identifier: &Initializer, fields: &[Initializer]) -> String {
    let mut query = format!(
        "CREATE TABLE {} ({} {} NOT NULL PRIMARY KEY ON CONFLICT REPLACE",
        table,
        identifier.name(),
        identifier.sql_type()
    );
    for field in fields {
        query.push_str(", ");
        query.push_str(field.name());
        query.push(' ');
        query.push_str(&field.sql_type());
    }
    query.push(')');
    query
}

/// Quote a value for embedding in synthesised SQL.
fn sql_quote(value: &Value) -> String {
    format!("'{}'", value.sql_text().replace('\'', "''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn create_table_matches_the_frozen_shape() {
        let identifier = Initializer::new(ValueKind::String, "service", 255);
        let fields = [Initializer::new(ValueKind::Int, "count", 0)];
        assert_eq!(
            create_table_sql("invitations", &identifier, &fields),
            "CREATE TABLE invitations (service VARCHAR(255) NOT NULL PRIMARY KEY \
             ON CONFLICT REPLACE, count INTEGER)"
        );
    }

    #[test]
    fn create_table_without_extra_fields_stays_valid() {
        let identifier = Initializer::new(ValueKind::String, "k", 64);
        assert_eq!(
            create_table_sql("t", &identifier, &[]),
            "CREATE TABLE t (k VARCHAR(64) NOT NULL PRIMARY KEY ON CONFLICT REPLACE)"
        );
    }

    #[test]
    fn kind_mapping_covers_all_column_types() {
        assert_eq!(Initializer::new(ValueKind::Bool, "b", 0).sql_type(), "INTEGER");
        assert_eq!(Initializer::new(ValueKind::LongLong, "l", 0).sql_type(), "INTEGER");
        assert_eq!(Initializer::new(ValueKind::Date, "d", 10).sql_type(), "VARCHAR(10)");
        assert_eq!(Initializer::new(ValueKind::Bytes, "p", 0).sql_type(), "BLOB");
        assert_eq!(Initializer::new(ValueKind::BitArray, "m", 0).sql_type(), "BLOB");
    }

    #[test]
    fn quoting_doubles_embedded_quotes() {
        assert_eq!(sql_quote(&Value::Text("o'clock".to_owned())), "'o''clock'");
        assert_eq!(sql_quote(&Value::Int(7)), "'7'");
        assert_eq!(sql_quote(&Value::Null), "''");
    }
}
