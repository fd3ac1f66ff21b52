//! Frozen channel names, filesystem mapping, and shared constants.
//!
//! Channel *names* are fixed strings shared with every deployed peer; they
//! map to UNIX socket paths inside a socket directory.  The directory
//! defaults to the system temp dir and can be overridden through
//! `TINYSQLAPI_SOCKET_DIR` (tests isolate themselves this way).

use std::path::{Path, PathBuf};

/// Shared request channel every client connects to.
pub const REQUEST_CHANNEL_NAME: &str = "TinySqlApiReqSocketEA012FCB";

/// Prefix of the per-client response channel; the decimal client id follows.
pub const RESPONSE_CHANNEL_PREFIX: &str = "TinySqlApiRespSocket";

/// Name of the singleton-election guard object.
pub const SERVER_UNIQUE_KEY: &str = "TinySqlApiServerKeyEA012FCB";

/// Broker executable name, resolved from PATH unless overridden.
pub const SERVER_EXE_NAME: &str = "tinysqliteapiserver";

/// Default database filename, created in the broker's database directory.
pub const DEFAULT_DB_NAME: &str = "sqliteapidb.db";

/// Protocol lineage marker, logged at startup on both sides.
pub const VERSION: &str = "v.1.1.2";

/// ACK token written back over request and response channels.  Receivers do
/// not inspect the content: any inbound bytes count as the ACK.
pub const ACK_TOKEN: &[u8] = b"ready";

/// Environment override for the socket directory.
pub const SOCKET_DIR_ENV: &str = "TINYSQLAPI_SOCKET_DIR";

/// Environment override for the broker executable path.
pub const SERVER_EXE_ENV: &str = "TINYSQLAPI_SERVER_EXE";

/// Registration handshake timeout in seconds.
pub const REGISTER_TIMEOUT_SECS: u64 = 10;

/// Connect retries on the request channel when the socket name is absent.
pub const CONNECT_RETRIES: u32 = 3;

/// The response channel name for `client_id`.
pub fn response_channel_name(client_id: i32) -> String {
    format!("{RESPONSE_CHANNEL_PREFIX}{client_id}")
}

/// The socket directory: `TINYSQLAPI_SOCKET_DIR` if set, else the temp dir.
pub fn socket_dir() -> PathBuf {
    std::env::var_os(SOCKET_DIR_ENV)
        .map_or_else(std::env::temp_dir, PathBuf::from)
}

pub fn request_socket_path(dir: &Path) -> PathBuf {
    dir.join(REQUEST_CHANNEL_NAME)
}

pub fn response_socket_path(dir: &Path, client_id: i32) -> PathBuf {
    dir.join(response_channel_name(client_id))
}

pub fn singleton_guard_path(dir: &Path) -> PathBuf {
    dir.join(SERVER_UNIQUE_KEY)
}
