//! Broker runtime configuration.

use std::path::PathBuf;

/// Configuration for one broker process.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// Directory holding the request socket, the per-client response sockets
    /// and the singleton guard.
    pub socket_dir: PathBuf,
    /// Directory database files are created in.
    pub db_dir: PathBuf,
    /// Client id passed on the command line by the client that launched us.
    /// That client is registered before the intake opens.
    pub first_client: Option<i32>,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        BrokerConfig {
            socket_dir: sqlapi_protocol::socket_dir(),
            db_dir: PathBuf::from("."),
            first_client: None,
        }
    }
}
