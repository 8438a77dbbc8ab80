//! PostgreSQL frontend/backend protocol v3 messages, as spoken by a
//! replication client: length-prefixed framing, the backend message subset
//! the backup engine consumes, and the frontend messages it produces.
//!
//! Wire format of every regular message: a one-byte kind tag followed by an
//! `i32` big-endian length that counts itself plus the payload. Startup
//! packets (StartupMessage, SSLRequest) carry no kind tag.

pub mod framed;

use byteorder::{BigEndian, ByteOrder};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

use utils::lsn::Lsn;

pub const PROTOCOL_VERSION: u32 = 196608; // 3.0
pub const SSL_REQUEST_CODE: u32 = 80877103;

/// Backend message kind tags.
pub mod tag {
    pub const AUTHENTICATION: u8 = b'R';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const COPY_OUT_RESPONSE: u8 = b'H';
    pub const COPY_IN_RESPONSE: u8 = b'G';
    pub const COPY_BOTH_RESPONSE: u8 = b'W';
    pub const COPY_DATA: u8 = b'd';
    pub const COPY_DONE: u8 = b'c';
    pub const COPY_FAIL: u8 = b'f';
}

#[derive(thiserror::Error, Debug)]
pub enum ProtocolError {
    /// Invalid packet was received from the server.
    #[error("Protocol error: {0}")]
    Protocol(String),
    /// Failed to parse or, (unlikely), serialize a protocol message.
    #[error("Message parse error: {0}")]
    BadMessage(String),
}

/// Backend messages the engine understands.
#[derive(Debug)]
pub enum BeMessage {
    AuthenticationOk,
    AuthenticationCleartextPassword,
    AuthenticationMd5Password([u8; 4]),
    AuthenticationSasl(Vec<String>),
    AuthenticationSaslContinue(Bytes),
    AuthenticationSaslFinal(Bytes),
    ParameterStatus { name: Bytes, value: Bytes },
    BackendKeyData { pid: u32, secret: u32 },
    ReadyForQuery(u8),
    RowDescription(Vec<Bytes>),
    DataRow(Vec<Option<Bytes>>),
    CommandComplete(Bytes),
    CopyOutResponse { n_columns: u16 },
    CopyInResponse,
    CopyBothResponse,
    CopyData(Bytes),
    CopyDone,
    ErrorResponse(ErrorOrNoticeFields),
    NoticeResponse(ErrorOrNoticeFields),
}

/// Severity/code/message triple from an ErrorResponse or NoticeResponse.
#[derive(Debug, Clone, Default)]
pub struct ErrorOrNoticeFields {
    pub severity: String,
    pub code: String,
    pub message: String,
}

impl fmt::Display for ErrorOrNoticeFields {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {} ({})", self.severity, self.message, self.code)
    }
}

impl BeMessage {
    /// Parse one backend message from a `(tag, payload)` pair. The payload
    /// must be exactly the message body, with the length prefix stripped.
    pub fn parse(tag: u8, mut buf: Bytes) -> Result<BeMessage, ProtocolError> {
        use tag::*;
        let msg = match tag {
            AUTHENTICATION => {
                if buf.remaining() < 4 {
                    return Err(ProtocolError::BadMessage(
                        "authentication message too short".to_string(),
                    ));
                }
                match buf.get_i32() {
                    0 => BeMessage::AuthenticationOk,
                    3 => BeMessage::AuthenticationCleartextPassword,
                    5 => {
                        let mut salt = [0u8; 4];
                        if buf.remaining() < 4 {
                            return Err(ProtocolError::BadMessage("bad md5 salt".to_string()));
                        }
                        buf.copy_to_slice(&mut salt);
                        BeMessage::AuthenticationMd5Password(salt)
                    }
                    10 => {
                        let mut mechanisms = Vec::new();
                        loop {
                            let m = get_cstr(&mut buf)?;
                            if m.is_empty() {
                                break;
                            }
                            mechanisms.push(m);
                        }
                        BeMessage::AuthenticationSasl(mechanisms)
                    }
                    11 => BeMessage::AuthenticationSaslContinue(buf),
                    12 => BeMessage::AuthenticationSaslFinal(buf),
                    other => {
                        return Err(ProtocolError::Protocol(format!(
                            "unsupported authentication request {other}"
                        )))
                    }
                }
            }
            PARAMETER_STATUS => {
                let name = get_cstr_bytes(&mut buf)?;
                let value = get_cstr_bytes(&mut buf)?;
                BeMessage::ParameterStatus { name, value }
            }
            BACKEND_KEY_DATA => BeMessage::BackendKeyData {
                pid: buf.get_u32(),
                secret: buf.get_u32(),
            },
            READY_FOR_QUERY => BeMessage::ReadyForQuery(buf.get_u8()),
            ROW_DESCRIPTION => {
                let n_fields = buf.get_u16();
                let mut names = Vec::with_capacity(n_fields as usize);
                for _ in 0..n_fields {
                    names.push(get_cstr_bytes(&mut buf)?);
                    // table oid, attnum, type oid, typlen, atttypmod, format
                    if buf.remaining() < 18 {
                        return Err(ProtocolError::BadMessage(
                            "RowDescription field truncated".to_string(),
                        ));
                    }
                    buf.advance(18);
                }
                BeMessage::RowDescription(names)
            }
            DATA_ROW => {
                let n_cols = buf.get_u16();
                let mut cols = Vec::with_capacity(n_cols as usize);
                for _ in 0..n_cols {
                    let len = buf.get_i32();
                    if len < 0 {
                        cols.push(None);
                    } else {
                        let len = len as usize;
                        if buf.remaining() < len {
                            return Err(ProtocolError::BadMessage(
                                "DataRow column truncated".to_string(),
                            ));
                        }
                        cols.push(Some(buf.split_to(len)));
                    }
                }
                BeMessage::DataRow(cols)
            }
            COMMAND_COMPLETE => BeMessage::CommandComplete(get_cstr_bytes(&mut buf)?),
            COPY_OUT_RESPONSE => {
                buf.get_u8(); // overall format
                BeMessage::CopyOutResponse {
                    n_columns: buf.get_u16(),
                }
            }
            COPY_IN_RESPONSE => BeMessage::CopyInResponse,
            COPY_BOTH_RESPONSE => BeMessage::CopyBothResponse,
            COPY_DATA => BeMessage::CopyData(buf),
            COPY_DONE => BeMessage::CopyDone,
            ERROR_RESPONSE => BeMessage::ErrorResponse(parse_fields(&mut buf)?),
            NOTICE_RESPONSE => BeMessage::NoticeResponse(parse_fields(&mut buf)?),
            other => {
                return Err(ProtocolError::Protocol(format!(
                    "unexpected backend message '{}'",
                    other as char
                )))
            }
        };
        Ok(msg)
    }
}

fn parse_fields(buf: &mut Bytes) -> Result<ErrorOrNoticeFields, ProtocolError> {
    let mut fields = ErrorOrNoticeFields::default();
    loop {
        if buf.remaining() == 0 {
            break;
        }
        let field_type = buf.get_u8();
        if field_type == 0 {
            break;
        }
        let value = get_cstr(buf)?;
        match field_type {
            b'S' => fields.severity = value,
            b'C' => fields.code = value,
            b'M' => fields.message = value,
            _ => {} // detail, hint, position etc. are not kept
        }
    }
    Ok(fields)
}

fn get_cstr_bytes(buf: &mut Bytes) -> Result<Bytes, ProtocolError> {
    let pos = buf
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| ProtocolError::BadMessage("unterminated string".to_string()))?;
    let s = buf.split_to(pos);
    buf.advance(1); // NUL
    Ok(s)
}

fn get_cstr(buf: &mut Bytes) -> Result<String, ProtocolError> {
    let raw = get_cstr_bytes(buf)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| ProtocolError::BadMessage("non-utf8 string".to_string()))
}

/// Frontend messages the engine produces.
#[derive(Debug)]
pub enum FeMessage<'a> {
    /// Startup packet; `replication` selects the walsender command set.
    Startup {
        user: &'a str,
        database: Option<&'a str>,
        replication: Option<&'a str>,
    },
    SslRequest,
    /// Password, SASLInitialResponse and SASLResponse all travel as 'p'.
    PasswordMessage(&'a [u8]),
    SaslInitialResponse {
        mechanism: &'a str,
        body: &'a [u8],
    },
    SaslResponse(&'a [u8]),
    Query(&'a str),
    CopyData(&'a [u8]),
    CopyDone,
    CopyFail(&'a str),
    Terminate,
}

impl FeMessage<'_> {
    /// Serialize into `buf`, framing included.
    pub fn write(&self, buf: &mut BytesMut) {
        match self {
            FeMessage::Startup {
                user,
                database,
                replication,
            } => {
                let mut body = BytesMut::new();
                body.put_u32(PROTOCOL_VERSION);
                put_param(&mut body, "user", user);
                if let Some(database) = database {
                    put_param(&mut body, "database", database);
                }
                if let Some(replication) = replication {
                    put_param(&mut body, "replication", replication);
                }
                body.put_u8(0);
                buf.put_u32(body.len() as u32 + 4);
                buf.put_slice(&body);
            }
            FeMessage::SslRequest => {
                buf.put_u32(8);
                buf.put_u32(SSL_REQUEST_CODE);
            }
            FeMessage::PasswordMessage(password) => {
                buf.put_u8(b'p');
                buf.put_u32(4 + password.len() as u32 + 1);
                buf.put_slice(password);
                buf.put_u8(0);
            }
            FeMessage::SaslInitialResponse { mechanism, body } => {
                buf.put_u8(b'p');
                buf.put_u32(4 + mechanism.len() as u32 + 1 + 4 + body.len() as u32);
                buf.put_slice(mechanism.as_bytes());
                buf.put_u8(0);
                buf.put_u32(body.len() as u32);
                buf.put_slice(body);
            }
            FeMessage::SaslResponse(body) => {
                buf.put_u8(b'p');
                buf.put_u32(4 + body.len() as u32);
                buf.put_slice(body);
            }
            FeMessage::Query(query) => {
                buf.put_u8(b'Q');
                buf.put_u32(4 + query.len() as u32 + 1);
                buf.put_slice(query.as_bytes());
                buf.put_u8(0);
            }
            FeMessage::CopyData(data) => {
                buf.put_u8(b'd');
                buf.put_u32(4 + data.len() as u32);
                buf.put_slice(data);
            }
            FeMessage::CopyDone => {
                buf.put_u8(b'c');
                buf.put_u32(4);
            }
            FeMessage::CopyFail(reason) => {
                buf.put_u8(b'f');
                buf.put_u32(4 + reason.len() as u32 + 1);
                buf.put_slice(reason.as_bytes());
                buf.put_u8(0);
            }
            FeMessage::Terminate => {
                buf.put_u8(b'X');
                buf.put_u32(4);
            }
        }
    }
}

fn put_param(buf: &mut BytesMut, name: &str, value: &str) {
    buf.put_slice(name.as_bytes());
    buf.put_u8(0);
    buf.put_slice(value.as_bytes());
    buf.put_u8(0);
}

/// Standby status update sent inside CopyData during START_REPLICATION.
#[derive(Debug, Clone, Copy)]
pub struct StandbyStatusUpdate {
    pub received_lsn: Lsn,
    pub flushed_lsn: Lsn,
    pub applied_lsn: Lsn,
    /// Microseconds since the PostgreSQL epoch (2000-01-01).
    pub now: i64,
    pub reply_requested: bool,
}

impl StandbyStatusUpdate {
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(1 + 8 * 3 + 8 + 1);
        buf.put_u8(b'r');
        buf.put_u64(self.received_lsn.0);
        buf.put_u64(self.flushed_lsn.0);
        buf.put_u64(self.applied_lsn.0);
        buf.put_i64(self.now);
        buf.put_u8(self.reply_requested as u8);
        buf.freeze()
    }
}

/// XLogData payload header inside CopyData during START_REPLICATION.
#[derive(Debug, Clone, Copy)]
pub struct XLogDataHeader {
    pub wal_start: Lsn,
    pub wal_end: Lsn,
    pub timestamp: i64,
}

/// Sub-messages multiplexed in a CopyBoth replication stream.
#[derive(Debug)]
pub enum ReplicationMessage {
    XLogData {
        header: XLogDataHeader,
        data: Bytes,
    },
    /// Server keepalive; reply with a status update when requested.
    PrimaryKeepAlive {
        wal_end: Lsn,
        timestamp: i64,
        reply_requested: bool,
    },
}

impl ReplicationMessage {
    pub fn parse(mut buf: Bytes) -> Result<ReplicationMessage, ProtocolError> {
        if buf.remaining() < 1 {
            return Err(ProtocolError::BadMessage("empty CopyData".to_string()));
        }
        match buf.get_u8() {
            b'w' => {
                if buf.remaining() < 24 {
                    return Err(ProtocolError::BadMessage("short XLogData".to_string()));
                }
                let header = XLogDataHeader {
                    wal_start: Lsn(buf.get_u64()),
                    wal_end: Lsn(buf.get_u64()),
                    timestamp: buf.get_i64(),
                };
                Ok(ReplicationMessage::XLogData { header, data: buf })
            }
            b'k' => {
                if buf.remaining() < 17 {
                    return Err(ProtocolError::BadMessage("short keepalive".to_string()));
                }
                Ok(ReplicationMessage::PrimaryKeepAlive {
                    wal_end: Lsn(buf.get_u64()),
                    timestamp: buf.get_i64(),
                    reply_requested: buf.get_u8() != 0,
                })
            }
            other => Err(ProtocolError::Protocol(format!(
                "unknown replication message '{}'",
                other as char
            ))),
        }
    }
}

/// A growable buffer over which multiple logical protocol messages share one
/// transport read, as happens in COPY mode. Bytes are fed in with
/// [`StreamBuffer::feed`]; complete messages are drained out one at a time.
#[derive(Default)]
pub struct StreamBuffer {
    buf: BytesMut,
}

/// Message kinds delivered by the COPY-stream demultiplexer. Anything else
/// found in the stream is skipped silently.
pub const COPY_DEMUX_KINDS: &[u8] = &[
    tag::DATA_ROW,
    tag::COPY_OUT_RESPONSE,
    tag::COPY_IN_RESPONSE,
    tag::COPY_DATA,
    tag::COPY_DONE,
    tag::COPY_FAIL,
    tag::ROW_DESCRIPTION,
    tag::COMMAND_COMPLETE,
    tag::ERROR_RESPONSE,
];

impl StreamBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn feed(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Direct access for transport reads, avoiding a copy through
    /// [`Self::feed`].
    pub fn buf_mut(&mut self) -> &mut BytesMut {
        &mut self.buf
    }

    pub fn len(&self) -> usize {
        self.buf.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    /// Pop the next logical message of any kind. This is the base framing
    /// used outside COPY mode; the demux variants below filter on top.
    pub fn next_any_message(&mut self) -> Result<Option<(u8, Bytes)>, ProtocolError> {
        let Some((kind, payload_len)) = self.peek_header()? else {
            return Ok(None);
        };
        self.buf.advance(5);
        Ok(Some((kind, self.buf.split_to(payload_len).freeze())))
    }

    /// Pop the next recognized logical message, allocating a fresh payload.
    /// Unrecognized kinds are dropped. Returns `None` when no complete
    /// message remains buffered.
    pub fn next_message(&mut self) -> Result<Option<(u8, Bytes)>, ProtocolError> {
        loop {
            let Some((kind, payload_len)) = self.peek_header()? else {
                return Ok(None);
            };
            self.buf.advance(5);
            let payload = self.buf.split_to(payload_len).freeze();
            if COPY_DEMUX_KINDS.contains(&kind) {
                return Ok(Some((kind, payload)));
            }
            // not a kind the copy layer understands; skip it
        }
    }

    /// Scratch-buffer variant of [`Self::next_message`]: the payload is
    /// copied into `scratch` (cleared first), bounding allocations on the
    /// backup receive path.
    pub fn next_message_into(
        &mut self,
        scratch: &mut Vec<u8>,
    ) -> Result<Option<u8>, ProtocolError> {
        loop {
            let Some((kind, payload_len)) = self.peek_header()? else {
                return Ok(None);
            };
            self.buf.advance(5);
            if COPY_DEMUX_KINDS.contains(&kind) {
                scratch.clear();
                scratch.extend_from_slice(&self.buf[..payload_len]);
                self.buf.advance(payload_len);
                return Ok(Some(kind));
            }
            self.buf.advance(payload_len);
        }
    }

    /// Returns `(kind, payload_len)` if a whole message is buffered.
    fn peek_header(&self) -> Result<Option<(u8, usize)>, ProtocolError> {
        if self.buf.len() < 5 {
            return Ok(None);
        }
        let kind = self.buf[0];
        let len = BigEndian::read_i32(&self.buf[1..5]);
        if len < 4 {
            return Err(ProtocolError::Protocol(format!(
                "invalid message length {len}"
            )));
        }
        let payload_len = len as usize - 4;
        if self.buf.len() < 5 + payload_len {
            return Ok(None);
        }
        Ok(Some((kind, payload_len)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(kind: u8, payload: &[u8]) -> Vec<u8> {
        let mut out = vec![kind];
        out.extend_from_slice(&(payload.len() as i32 + 4).to_be_bytes());
        out.extend_from_slice(payload);
        out
    }

    fn data_row(cols: &[&str]) -> Vec<u8> {
        let mut payload = Vec::new();
        payload.extend_from_slice(&(cols.len() as u16).to_be_bytes());
        for c in cols {
            payload.extend_from_slice(&(c.len() as i32).to_be_bytes());
            payload.extend_from_slice(c.as_bytes());
        }
        frame(tag::DATA_ROW, &payload)
    }

    #[test]
    fn demux_preserves_message_order() {
        // One transport frame carrying three logical messages.
        let mut wire = Vec::new();
        wire.extend_from_slice(&data_row(&["foo", "1"]));
        wire.extend_from_slice(&frame(tag::COPY_DATA, &[0xAA; 16]));
        let mut complete = b"SELECT 1".to_vec();
        complete.push(0);
        wire.extend_from_slice(&frame(tag::COMMAND_COMPLETE, &complete));

        let mut sb = StreamBuffer::new();
        sb.feed(&wire);

        let (kind, _) = sb.next_message().unwrap().unwrap();
        assert_eq!(kind, tag::DATA_ROW);
        let (kind, payload) = sb.next_message().unwrap().unwrap();
        assert_eq!(kind, tag::COPY_DATA);
        assert_eq!(payload.len(), 16);
        let (kind, payload) = sb.next_message().unwrap().unwrap();
        assert_eq!(kind, tag::COMMAND_COMPLETE);
        assert_eq!(&payload[..8], b"SELECT 1");
        assert!(sb.next_message().unwrap().is_none());
    }

    #[test]
    fn demux_skips_unknown_kinds() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&frame(b'S', b"name\0value\0")); // ParameterStatus
        wire.extend_from_slice(&frame(tag::COPY_DONE, &[]));
        wire.extend_from_slice(&frame(b'A', b"notify")); // NotificationResponse

        let mut sb = StreamBuffer::new();
        sb.feed(&wire);
        let (kind, _) = sb.next_message().unwrap().unwrap();
        assert_eq!(kind, tag::COPY_DONE);
        assert!(sb.next_message().unwrap().is_none());
    }

    #[test]
    fn demux_waits_for_partial_message() {
        let full = data_row(&["x"]);
        let mut sb = StreamBuffer::new();
        sb.feed(&full[..3]);
        assert!(sb.next_message().unwrap().is_none());
        sb.feed(&full[3..]);
        assert_eq!(sb.next_message().unwrap().unwrap().0, tag::DATA_ROW);
    }

    #[test]
    fn scratch_variant_reuses_buffer() {
        let mut wire = Vec::new();
        wire.extend_from_slice(&frame(tag::COPY_DATA, &[1, 2, 3]));
        wire.extend_from_slice(&frame(tag::COPY_DATA, &[4, 5]));
        let mut sb = StreamBuffer::new();
        sb.feed(&wire);

        let mut scratch = Vec::new();
        assert_eq!(sb.next_message_into(&mut scratch).unwrap(), Some(tag::COPY_DATA));
        assert_eq!(scratch, vec![1, 2, 3]);
        assert_eq!(sb.next_message_into(&mut scratch).unwrap(), Some(tag::COPY_DATA));
        assert_eq!(scratch, vec![4, 5]);
        assert_eq!(sb.next_message_into(&mut scratch).unwrap(), None);
    }

    #[test]
    fn parse_error_response() {
        let mut payload = Vec::new();
        payload.extend_from_slice(b"SFATAL\0");
        payload.extend_from_slice(b"C28P01\0");
        payload.extend_from_slice(b"Mpassword authentication failed\0");
        payload.push(0);
        match BeMessage::parse(tag::ERROR_RESPONSE, Bytes::from(payload)).unwrap() {
            BeMessage::ErrorResponse(fields) => {
                assert_eq!(fields.severity, "FATAL");
                assert_eq!(fields.code, "28P01");
                assert_eq!(fields.message, "password authentication failed");
            }
            other => panic!("unexpected message {other:?}"),
        }
    }

    #[test]
    fn startup_message_layout() {
        let mut buf = BytesMut::new();
        FeMessage::Startup {
            user: "repl",
            database: None,
            replication: Some("true"),
        }
        .write(&mut buf);
        let len = BigEndian::read_u32(&buf[0..4]) as usize;
        assert_eq!(len, buf.len());
        assert_eq!(BigEndian::read_u32(&buf[4..8]), PROTOCOL_VERSION);
        assert!(buf[8..].windows(5).any(|w| w == b"repl\0"));
        assert!(buf[8..].windows(12).any(|w| w == b"replication\0"));
        assert_eq!(buf[buf.len() - 1], 0);
    }

    #[test]
    fn replication_keepalive_roundtrip() {
        let mut payload = BytesMut::new();
        payload.put_u8(b'k');
        payload.put_u64(0x0123_4567_89AB_CDEF);
        payload.put_i64(42);
        payload.put_u8(1);
        match ReplicationMessage::parse(payload.freeze()).unwrap() {
            ReplicationMessage::PrimaryKeepAlive {
                wal_end,
                timestamp,
                reply_requested,
            } => {
                assert_eq!(wal_end, Lsn(0x0123_4567_89AB_CDEF));
                assert_eq!(timestamp, 42);
                assert!(reply_requested);
            }
            other => panic!("unexpected message {other:?}"),
        }
    }
}
