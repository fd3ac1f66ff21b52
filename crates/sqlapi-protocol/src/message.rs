//! Request and response records.
//!
//! Request frame layout: `client_id:i32 | kind:i32 | item_key:Value |
//! payload:text`.  Response frames come in three shapes, discriminated by
//! the leading kind tag: confirmations carry the kind alone, notifications
//! carry the kind plus the mutated item key, data responses carry kind,
//! status and a run of body values to the end of the frame.

use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::value::{DecodeError, Value, put_text, take_i32, take_text};

// ---------------------------------------------------------------------------
// Kinds and status codes
// ---------------------------------------------------------------------------

/// Client-to-broker request kinds.  Wire tags are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum RequestKind {
    Register = 1,
    Unregister = 2,
    CreateTable = 3,
    ReadOne = 4,
    Count = 5,
    ReadTables = 6,
    ReadColumns = 7,
    ReadAll = 8,
    SubscribeKey = 9,
    UnsubscribeKey = 10,
    WriteRow = 11,
    CancelLast = 12,
    DeleteOne = 13,
    DeleteAll = 14,
    ChangeDB = 15,
}

impl RequestKind {
    pub fn from_i32(v: i32) -> Result<Self, DecodeError> {
        Ok(match v {
            1 => Self::Register,
            2 => Self::Unregister,
            3 => Self::CreateTable,
            4 => Self::ReadOne,
            5 => Self::Count,
            6 => Self::ReadTables,
            7 => Self::ReadColumns,
            8 => Self::ReadAll,
            9 => Self::SubscribeKey,
            10 => Self::UnsubscribeKey,
            11 => Self::WriteRow,
            12 => Self::CancelLast,
            13 => Self::DeleteOne,
            14 => Self::DeleteAll,
            15 => Self::ChangeDB,
            other => return Err(DecodeError::BadRequestKind(other)),
        })
    }

    /// True for kinds that run SQL and therefore pass through the dispatch
    /// queue.  Control kinds are handled inline by the broker core.
    pub fn is_sql(self) -> bool {
        matches!(
            self,
            Self::CreateTable
                | Self::ReadOne
                | Self::Count
                | Self::ReadTables
                | Self::ReadColumns
                | Self::ReadAll
                | Self::WriteRow
                | Self::DeleteOne
                | Self::DeleteAll
        )
    }

    /// True for kinds whose success mutates table data (notification fan-out).
    pub fn mutates(self) -> bool {
        matches!(self, Self::WriteRow | Self::DeleteOne | Self::DeleteAll)
    }
}

/// Broker-to-client response kinds.  Wire tags are frozen.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ResponseKind {
    Confirmation = 0,
    Initialized = 1,
    ItemData = 2,
    Tables = 3,
    Columns = 4,
    Count = 5,
    WriteAck = 6,
    DeleteAck = 7,
    DeleteAllAck = 8,
    UpdateNotify = 9,
    DeleteNotify = 10,
}

impl ResponseKind {
    pub fn from_i32(v: i32) -> Result<Self, DecodeError> {
        Ok(match v {
            0 => Self::Confirmation,
            1 => Self::Initialized,
            2 => Self::ItemData,
            3 => Self::Tables,
            4 => Self::Columns,
            5 => Self::Count,
            6 => Self::WriteAck,
            7 => Self::DeleteAck,
            8 => Self::DeleteAllAck,
            9 => Self::UpdateNotify,
            10 => Self::DeleteNotify,
            other => return Err(DecodeError::BadResponseKind(other)),
        })
    }
}

/// Status codes carried in data responses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(i32)]
pub enum ErrorCode {
    NoError = 0,
    InitializationError = 1,
    NotFoundError = 2,
    AlreadyExistError = 3,
    UndefinedError = 4,
}

impl ErrorCode {
    pub fn from_i32(v: i32) -> Result<Self, DecodeError> {
        Ok(match v {
            0 => Self::NoError,
            1 => Self::InitializationError,
            2 => Self::NotFoundError,
            3 => Self::AlreadyExistError,
            4 => Self::UndefinedError,
            other => return Err(DecodeError::BadErrorCode(other)),
        })
    }
}

// ---------------------------------------------------------------------------
// Request
// ---------------------------------------------------------------------------

/// One client request.  `payload` is the SQL text (empty for control
/// requests); `item_key` is the primary-key value used for subscription
/// routing (`Value::Null` when the request targets no single row).
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub client_id: i32,
    pub kind: RequestKind,
    pub item_key: Value,
    pub payload: String,
}

impl Request {
    /// A control request with no SQL text and no item key.
    pub fn control(client_id: i32, kind: RequestKind) -> Self {
        Request {
            client_id,
            kind,
            item_key: Value::Null,
            payload: String::new(),
        }
    }

    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_i32_le(self.client_id);
        buf.put_i32_le(self.kind as i32);
        self.item_key.encode(&mut buf);
        put_text(&mut buf, &self.payload);
        buf.freeze()
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = frame;
        let client_id = take_i32(&mut buf)?;
        let kind = RequestKind::from_i32(take_i32(&mut buf)?)?;
        let item_key = Value::decode(&mut buf)?;
        let payload = take_text(&mut buf)?;
        Ok(Request {
            client_id,
            kind,
            item_key,
            payload,
        })
    }
}

// ---------------------------------------------------------------------------
// Response
// ---------------------------------------------------------------------------

/// One broker response frame, in its three wire shapes.
#[derive(Debug, Clone, PartialEq)]
pub enum Response {
    /// Control acknowledgment: kind tag only, no status.
    Confirmation,
    /// Change notification: kind tag plus the mutated item key, no status.
    Update(Value),
    Delete(Value),
    /// Query/mutation result: kind, status, then body values to frame end.
    Data {
        kind: ResponseKind,
        status: ErrorCode,
        body: Vec<Value>,
    },
}

impl Response {
    pub fn data(kind: ResponseKind, status: ErrorCode, body: Vec<Value>) -> Self {
        Response::Data { kind, status, body }
    }

    pub fn to_frame(&self) -> Bytes {
        let mut buf = BytesMut::new();
        match self {
            Response::Confirmation => buf.put_i32_le(ResponseKind::Confirmation as i32),
            Response::Update(key) => {
                buf.put_i32_le(ResponseKind::UpdateNotify as i32);
                key.encode(&mut buf);
            }
            Response::Delete(key) => {
                buf.put_i32_le(ResponseKind::DeleteNotify as i32);
                key.encode(&mut buf);
            }
            Response::Data { kind, status, body } => {
                buf.put_i32_le(*kind as i32);
                buf.put_i32_le(*status as i32);
                for value in body {
                    value.encode(&mut buf);
                }
            }
        }
        buf.freeze()
    }

    pub fn from_frame(frame: &[u8]) -> Result<Self, DecodeError> {
        let mut buf = frame;
        let kind = ResponseKind::from_i32(take_i32(&mut buf)?)?;
        match kind {
            ResponseKind::Confirmation => Ok(Response::Confirmation),
            ResponseKind::UpdateNotify => Ok(Response::Update(Value::decode(&mut buf)?)),
            ResponseKind::DeleteNotify => Ok(Response::Delete(Value::decode(&mut buf)?)),
            _ => {
                let status = ErrorCode::from_i32(take_i32(&mut buf)?)?;
                let mut body = Vec::new();
                while buf.has_remaining() {
                    body.push(Value::decode(&mut buf)?);
                }
                Ok(Response::Data { kind, status, body })
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_frame_layout_is_id_kind_key_payload() {
        let req = Request {
            client_id: 7,
            kind: RequestKind::ReadOne,
            item_key: Value::Null,
            payload: "SELECT".to_owned(),
        };
        let frame = req.to_frame();
        assert_eq!(&frame[0..4], &7i32.to_le_bytes());
        assert_eq!(&frame[4..8], &4i32.to_le_bytes());
        assert_eq!(frame[8], 0); // Null key tag
        assert_eq!(&frame[9..13], &6u32.to_le_bytes());
        assert_eq!(&frame[13..], b"SELECT");
        assert_eq!(Request::from_frame(&frame).unwrap(), req);
    }

    #[test]
    fn confirmation_carries_only_the_kind() {
        let frame = Response::Confirmation.to_frame();
        assert_eq!(&frame[..], &0i32.to_le_bytes());
        assert_eq!(Response::from_frame(&frame).unwrap(), Response::Confirmation);
    }

    #[test]
    fn notification_carries_kind_and_key_without_status() {
        let frame = Response::Update(Value::Text("row-1".to_owned())).to_frame();
        assert_eq!(&frame[0..4], &9i32.to_le_bytes());
        let decoded = Response::from_frame(&frame).unwrap();
        assert_eq!(decoded, Response::Update(Value::Text("row-1".to_owned())));
    }

    #[test]
    fn data_response_reads_body_to_frame_end() {
        let resp = Response::data(
            ResponseKind::ItemData,
            ErrorCode::NoError,
            vec![Value::Text("k".to_owned()), Value::Int(3)],
        );
        let frame = resp.to_frame();
        assert_eq!(Response::from_frame(&frame).unwrap(), resp);
    }

    #[test]
    fn control_kinds_do_not_queue_for_sql() {
        for kind in [
            RequestKind::Register,
            RequestKind::Unregister,
            RequestKind::SubscribeKey,
            RequestKind::UnsubscribeKey,
            RequestKind::CancelLast,
            RequestKind::ChangeDB,
        ] {
            assert!(!kind.is_sql());
        }
        assert!(RequestKind::ReadAll.is_sql());
        assert!(RequestKind::WriteRow.mutates());
        assert!(!RequestKind::ReadOne.mutates());
    }
}
