// sqlapi-protocol: wire types and framing shared by the broker and clients.
//
// Everything on the wire is little-endian and length-prefixed.  The frozen
// channel names and the ACK token live in `names`; the dynamic cell type and
// its tagged encoding in `value`; request/response records in `message`;
// async frame I/O helpers in `codec`.

pub mod codec;
pub mod message;
pub mod names;
pub mod value;

pub use codec::{MAX_FRAME_LEN, read_ack, read_frame, write_ack, write_frame};
pub use message::{ErrorCode, Request, RequestKind, Response, ResponseKind};
pub use names::{
    ACK_TOKEN, DEFAULT_DB_NAME, REQUEST_CHANNEL_NAME, RESPONSE_CHANNEL_PREFIX, SERVER_EXE_NAME,
    SERVER_UNIQUE_KEY, VERSION, request_socket_path, response_channel_name, response_socket_path,
    singleton_guard_path, socket_dir,
};
pub use value::{DecodeError, Value};
