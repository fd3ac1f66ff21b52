// sqlapi-client: the in-process client façade for the TinySQL API broker.
//
// Applications construct a `SqlApi`, receive asynchronous results and change
// notifications as `SqlApiEvent`s, and never talk to the broker directly.
// The façade auto-launches the broker when it is the first client on the
// host.

pub mod api;
mod engine;
mod notifier;
mod requester;

pub use api::{Initializer, SqlApi, SqlApiConfig, SqlApiError, SqlApiEvent, ValueKind};
pub use sqlapi_protocol::{ErrorCode, Value};
