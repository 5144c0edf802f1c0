/// Message framing for the version 3 protocol
///
/// Every message after startup is `kind:u8 | len:i32 | payload` where
/// len counts itself but not the kind byte. The proxy forwards frames
/// verbatim; the only messages it fabricates are ParameterStatus and
/// ReadyForQuery during pool reuse, plus error responses of its own.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;

use super::stream::PacketStream;
use super::{CancelKey, ProtocolError, ProtocolResult, TransactionState};

/// Backend message kinds the proxy inspects
pub mod kind {
    pub const AUTHENTICATION: u8 = b'R';
    pub const BACKEND_KEY_DATA: u8 = b'K';
    pub const PARAMETER_STATUS: u8 = b'S';
    pub const READY_FOR_QUERY: u8 = b'Z';
    pub const ERROR_RESPONSE: u8 = b'E';
    pub const NOTICE_RESPONSE: u8 = b'N';
    pub const COMMAND_COMPLETE: u8 = b'C';
    pub const ROW_DESCRIPTION: u8 = b'T';
    pub const DATA_ROW: u8 = b'D';

    pub const QUERY: u8 = b'Q';
    pub const TERMINATE: u8 = b'X';
    pub const PASSWORD_MESSAGE: u8 = b'p';
    pub const SYNC: u8 = b'S';
}

/// Authentication request sub-codes carried in 'R' messages
pub mod auth_code {
    pub const OK: i32 = 0;
    pub const CLEARTEXT_PASSWORD: i32 = 3;
    pub const MD5_PASSWORD: i32 = 5;
}

/// One framed wire message
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WireMessage {
    pub kind: u8,
    pub payload: Bytes,
}

impl WireMessage {
    pub fn new(kind: u8, payload: Bytes) -> Self {
        Self { kind, payload }
    }

    /// Read one message from the stream
    pub async fn read_from<S>(stream: &mut PacketStream<S>) -> ProtocolResult<Self>
    where
        S: AsyncRead + Unpin,
    {
        let kind = stream.read_u8().await?;
        let len = stream.read_i32().await?;
        if len < 4 {
            return Err(ProtocolError::malformed(format!(
                "message '{}' with length {}",
                kind as char, len
            )));
        }
        let payload = stream.read_exact_bytes(len as usize - 4).await?;
        Ok(Self { kind, payload })
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(5 + self.payload.len());
        self.encode_into(&mut buf);
        buf.freeze()
    }

    pub fn encode_into(&self, buf: &mut BytesMut) {
        buf.put_u8(self.kind);
        buf.put_i32(self.payload.len() as i32 + 4);
        buf.put_slice(&self.payload);
    }
}

/// Fields of a protocol error report
#[derive(Debug, Clone, Default)]
pub struct ErrorFields {
    pub severity: String,
    pub sqlstate: String,
    pub message: String,
    pub detail: String,
    pub hint: String,
    pub file: String,
    pub line: u32,
}

impl ErrorFields {
    pub fn fatal(sqlstate: &str, message: &str) -> Self {
        Self {
            severity: "FATAL".into(),
            sqlstate: sqlstate.into(),
            message: message.into(),
            file: file!().into(),
            line: line!(),
            ..Default::default()
        }
    }

    pub fn error(sqlstate: &str, message: &str) -> Self {
        Self {
            severity: "ERROR".into(),
            sqlstate: sqlstate.into(),
            message: message.into(),
            file: file!().into(),
            line: line!(),
            ..Default::default()
        }
    }
}

/// V3 error response with tagged fields
pub fn error_response_v3(fields: &ErrorFields) -> WireMessage {
    let mut payload = BytesMut::new();
    let mut put = |tag: u8, value: &str| {
        if !value.is_empty() {
            payload.put_u8(tag);
            payload.put_slice(value.as_bytes());
            payload.put_u8(0);
        }
    };
    put(b'S', &fields.severity);
    put(b'C', &fields.sqlstate);
    put(b'M', &fields.message);
    put(b'D', &fields.detail);
    put(b'H', &fields.hint);
    put(b'F', &fields.file);
    put(b'L', &fields.line.to_string());
    payload.put_u8(0);
    WireMessage::new(kind::ERROR_RESPONSE, payload.freeze())
}

/// V2 error response: the legacy single-string form
pub fn error_response_v2(message: &str) -> WireMessage {
    let mut payload = BytesMut::with_capacity(message.len() + 1);
    payload.put_slice(message.as_bytes());
    payload.put_u8(0);
    WireMessage::new(kind::ERROR_RESPONSE, payload.freeze())
}

pub fn parameter_status(name: &str, value: &str) -> WireMessage {
    let mut payload = BytesMut::with_capacity(name.len() + value.len() + 2);
    payload.put_slice(name.as_bytes());
    payload.put_u8(0);
    payload.put_slice(value.as_bytes());
    payload.put_u8(0);
    WireMessage::new(kind::PARAMETER_STATUS, payload.freeze())
}

pub fn ready_for_query(state: TransactionState) -> WireMessage {
    let mut payload = BytesMut::with_capacity(1);
    payload.put_u8(state.as_byte());
    WireMessage::new(kind::READY_FOR_QUERY, payload.freeze())
}

pub fn backend_key_data(key: CancelKey) -> WireMessage {
    let mut payload = BytesMut::with_capacity(8);
    payload.put_i32(key.pid);
    payload.put_i32(key.key);
    WireMessage::new(kind::BACKEND_KEY_DATA, payload.freeze())
}

pub fn authentication_ok() -> WireMessage {
    let mut payload = BytesMut::with_capacity(4);
    payload.put_i32(auth_code::OK);
    WireMessage::new(kind::AUTHENTICATION, payload.freeze())
}

pub fn authentication_md5(salt: [u8; 4]) -> WireMessage {
    let mut payload = BytesMut::with_capacity(8);
    payload.put_i32(auth_code::MD5_PASSWORD);
    payload.put_slice(&salt);
    WireMessage::new(kind::AUTHENTICATION, payload.freeze())
}

pub fn password_message(password: &str) -> WireMessage {
    let mut payload = BytesMut::with_capacity(password.len() + 1);
    payload.put_slice(password.as_bytes());
    payload.put_u8(0);
    WireMessage::new(kind::PASSWORD_MESSAGE, payload.freeze())
}

pub fn terminate() -> WireMessage {
    WireMessage::new(kind::TERMINATE, Bytes::new())
}

/// Parse the auth sub-code (and MD5 salt, when present) out of an 'R'
pub fn parse_authentication(msg: &WireMessage) -> ProtocolResult<(i32, Option<[u8; 4]>)> {
    if msg.kind != kind::AUTHENTICATION || msg.payload.len() < 4 {
        return Err(ProtocolError::malformed("bad authentication message"));
    }
    let mut p = msg.payload.clone();
    let code = p.get_i32();
    let salt = if code == auth_code::MD5_PASSWORD {
        if p.len() < 4 {
            return Err(ProtocolError::malformed("md5 request without salt"));
        }
        Some([p[0], p[1], p[2], p[3]])
    } else {
        None
    };
    Ok((code, salt))
}

pub fn parse_backend_key_data(msg: &WireMessage) -> ProtocolResult<CancelKey> {
    if msg.kind != kind::BACKEND_KEY_DATA || msg.payload.len() < 8 {
        return Err(ProtocolError::malformed("bad BackendKeyData message"));
    }
    let mut p = msg.payload.clone();
    Ok(CancelKey::new(p.get_i32(), p.get_i32()))
}

pub fn parse_parameter_status(msg: &WireMessage) -> ProtocolResult<(String, String)> {
    if msg.kind != kind::PARAMETER_STATUS {
        return Err(ProtocolError::malformed("bad ParameterStatus message"));
    }
    let payload = &msg.payload;
    let first_nul = payload
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ProtocolError::malformed("unterminated parameter name"))?;
    let rest = &payload[first_nul + 1..];
    let second_nul = rest
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ProtocolError::malformed("unterminated parameter value"))?;
    Ok((
        String::from_utf8_lossy(&payload[..first_nul]).into_owned(),
        String::from_utf8_lossy(&rest[..second_nul]).into_owned(),
    ))
}

pub fn parse_ready_for_query(msg: &WireMessage) -> ProtocolResult<TransactionState> {
    if msg.kind != kind::READY_FOR_QUERY || msg.payload.is_empty() {
        return Err(ProtocolError::malformed("bad ReadyForQuery message"));
    }
    TransactionState::from_byte(msg.payload[0])
        .ok_or_else(|| ProtocolError::malformed("unknown transaction state"))
}

/// Read the cleartext/md5 answer out of a frontend 'p' message
pub fn parse_password_message(msg: &WireMessage) -> ProtocolResult<String> {
    if msg.kind != kind::PASSWORD_MESSAGE {
        return Err(ProtocolError::malformed("expected password message"));
    }
    let nul = msg
        .payload
        .iter()
        .position(|b| *b == 0)
        .unwrap_or(msg.payload.len());
    Ok(String::from_utf8_lossy(&msg.payload[..nul]).into_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{duplex, AsyncWriteExt};

    #[tokio::test]
    async fn test_frame_round_trip() {
        let (mut a, b) = duplex(256);
        let mut stream = PacketStream::new(b);

        let msg = parameter_status("server_version", "15.3");
        a.write_all(&msg.encode()).await.unwrap();

        let got = WireMessage::read_from(&mut stream).await.unwrap();
        assert_eq!(got, msg);
        let (name, value) = parse_parameter_status(&got).unwrap();
        assert_eq!(name, "server_version");
        assert_eq!(value, "15.3");
    }

    #[tokio::test]
    async fn test_short_length_is_malformed() {
        let (mut a, b) = duplex(64);
        let mut stream = PacketStream::new(b);

        a.write_all(&[b'Q']).await.unwrap();
        a.write_all(&2i32.to_be_bytes()).await.unwrap();
        let err = WireMessage::read_from(&mut stream).await.unwrap_err();
        assert!(matches!(err, ProtocolError::Malformed(_)));
    }

    #[test]
    fn test_ready_for_query_round_trip() {
        for state in [
            TransactionState::Idle,
            TransactionState::InBlock,
            TransactionState::FailedBlock,
        ] {
            let msg = ready_for_query(state);
            assert_eq!(parse_ready_for_query(&msg).unwrap(), state);
        }
    }

    #[test]
    fn test_backend_key_data_round_trip() {
        let key = CancelKey::new(42, 0x1234_5678);
        let msg = backend_key_data(key);
        assert_eq!(parse_backend_key_data(&msg).unwrap(), key);
    }

    #[test]
    fn test_error_response_v3_fields() {
        let msg = error_response_v3(&ErrorFields::fatal(
            "53300",
            "sorry, too many clients already",
        ));
        assert_eq!(msg.kind, kind::ERROR_RESPONSE);
        let text = String::from_utf8_lossy(&msg.payload);
        assert!(text.contains("FATAL"));
        assert!(text.contains("53300"));
        assert!(text.contains("sorry, too many clients already"));
    }

    #[test]
    fn test_error_response_v2_single_string() {
        let msg = error_response_v2("FATAL: bad");
        assert_eq!(msg.payload.last(), Some(&0u8));
        assert!(msg.payload.starts_with(b"FATAL: bad"));
    }

    #[test]
    fn test_parse_authentication_md5_salt() {
        let msg = authentication_md5([1, 2, 3, 4]);
        let (code, salt) = parse_authentication(&msg).unwrap();
        assert_eq!(code, auth_code::MD5_PASSWORD);
        assert_eq!(salt, Some([1, 2, 3, 4]));

        let (code, salt) = parse_authentication(&authentication_ok()).unwrap();
        assert_eq!(code, auth_code::OK);
        assert_eq!(salt, None);
    }
}
