/// Startup packet reading and canonicalization
///
/// The first packet on a frontend connection has no message-kind byte:
/// `int32 totalLen | int32 protoVersion | bytes`. The version slot may
/// instead carry one of the special request magics (cancel, SSL,
/// GSSAPI). V3 startup options are canonically re-ordered here so two
/// packets carrying the same option set become byte-comparable, which
/// is what the connection pool keys on.
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tokio::io::AsyncRead;

use super::stream::PacketStream;
use super::{CancelKey, ProtocolError, ProtocolMajor, ProtocolResult, SessionKey};

pub const CANCEL_REQUEST_CODE: i32 = 80877102;
pub const SSL_REQUEST_CODE: i32 = 80877103;
pub const GSS_ENC_REQUEST_CODE: i32 = 80877104;

/// Upper bound on a sane startup packet, length prefix included
pub const MAX_STARTUP_PACKET_LENGTH: i32 = 10000;

/// V2 fixed-layout field widths
const V2_DATABASE_LEN: usize = 64;
const V2_USER_LEN: usize = 32;

/// First packet on a frontend connection
#[derive(Debug)]
pub enum InitialMessage {
    Startup(StartupPacket),
    Cancel(CancelKey),
    SslRequest,
    GssEncRequest,
}

/// A parsed startup packet owning its canonical bytes
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StartupPacket {
    major: ProtocolMajor,
    minor: u16,
    user: String,
    database: String,
    application_name: Option<String>,
    /// Packet body (no length prefix) with V3 options canonically
    /// sorted; byte-equal iff the option sets are equal
    canonical: Bytes,
}

impl StartupPacket {
    pub fn major(&self) -> ProtocolMajor {
        self.major
    }

    pub fn minor(&self) -> u16 {
        self.minor
    }

    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn database(&self) -> &str {
        &self.database
    }

    pub fn application_name(&self) -> Option<&str> {
        self.application_name.as_deref()
    }

    /// Canonical body bytes used for pool-entry comparison
    pub fn canonical_bytes(&self) -> &Bytes {
        &self.canonical
    }

    pub fn session_key(&self) -> SessionKey {
        SessionKey {
            user: self.user.clone(),
            database: self.database.clone(),
            major: self.major,
        }
    }

    /// Databases that are never returned to the pool after use
    pub fn is_template_like_database(&self) -> bool {
        matches!(
            self.database.as_str(),
            "template0" | "template1" | "postgres" | "regression"
        )
    }

    /// Full wire form: length prefix followed by the canonical body
    pub fn to_wire_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(4 + self.canonical.len());
        buf.put_i32(self.canonical.len() as i32 + 4);
        buf.put_slice(&self.canonical);
        buf.freeze()
    }

    /// Parse a packet body (the bytes after the length prefix)
    pub fn parse(body: Bytes) -> ProtocolResult<Self> {
        if body.len() < 4 {
            return Err(ProtocolError::BadStartup("truncated startup packet".into()));
        }
        let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);
        let major = (code >> 16) as u16;
        let minor = (code & 0xffff) as u16;
        match major {
            2 => Self::parse_v2(body, minor),
            3 => Self::parse_v3(body, minor),
            _ => Err(ProtocolError::BadStartup(format!(
                "invalid major version {} in startup packet",
                major
            ))),
        }
    }

    fn parse_v2(body: Bytes, minor: u16) -> ProtocolResult<Self> {
        // protoVersion | database[64] | user[32] | options | unused | tty
        let read_padded = |offset: usize, width: usize| -> String {
            let end = (offset + width).min(body.len());
            if offset >= end {
                return String::new();
            }
            let field = &body[offset..end];
            let nul = field.iter().position(|b| *b == 0).unwrap_or(field.len());
            String::from_utf8_lossy(&field[..nul]).into_owned()
        };

        let database = read_padded(4, V2_DATABASE_LEN);
        let user = read_padded(4 + V2_DATABASE_LEN, V2_USER_LEN);

        if user.is_empty() {
            return Err(ProtocolError::MissingUser);
        }
        let database = if database.is_empty() {
            user.clone()
        } else {
            database
        };

        // The fixed layout is already canonical
        Ok(Self {
            major: ProtocolMajor::V2,
            minor,
            user,
            database,
            application_name: None,
            canonical: body,
        })
    }

    fn parse_v3(body: Bytes, minor: u16) -> ProtocolResult<Self> {
        let mut options = Vec::new();
        let mut cursor = &body[4..];

        while !cursor.is_empty() && cursor[0] != 0 {
            let key = take_nul_string(&mut cursor)?;
            let value = take_nul_string(&mut cursor)?;
            options.push((key, value));
        }

        let find = |name: &str| {
            options
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };

        let user = find("user").unwrap_or_default();
        if user.is_empty() {
            return Err(ProtocolError::MissingUser);
        }
        let database = match find("database") {
            Some(db) if !db.is_empty() => db,
            _ => user.clone(),
        };
        let application_name = find("application_name");

        // Sort options by key (value as tie-break) so equal option
        // sets produce identical bytes
        options.sort_by(|a, b| a.0.cmp(&b.0).then_with(|| a.1.cmp(&b.1)));

        let mut canonical = BytesMut::with_capacity(body.len());
        canonical.put_slice(&body[..4]);
        for (k, v) in &options {
            canonical.put_slice(k.as_bytes());
            canonical.put_u8(0);
            canonical.put_slice(v.as_bytes());
            canonical.put_u8(0);
        }
        canonical.put_u8(0);

        Ok(Self {
            major: ProtocolMajor::V3,
            minor,
            user,
            database,
            application_name,
            canonical: canonical.freeze(),
        })
    }
}

fn take_nul_string(cursor: &mut &[u8]) -> ProtocolResult<String> {
    let nul = cursor
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ProtocolError::BadStartup("unterminated startup option".into()))?;
    let s = String::from_utf8_lossy(&cursor[..nul]).into_owned();
    cursor.advance(nul + 1);
    Ok(s)
}

/// Read the initial frontend message: startup packet, cancel request,
/// or an encryption negotiation magic
pub async fn read_initial_message<S>(
    stream: &mut PacketStream<S>,
) -> ProtocolResult<InitialMessage>
where
    S: AsyncRead + Unpin,
{
    let len = stream.read_i32().await?;
    if len <= 0 || len >= MAX_STARTUP_PACKET_LENGTH {
        return Err(ProtocolError::BadStartup(format!(
            "incorrect packet length ({})",
            len
        )));
    }
    let body = stream.read_exact_bytes(len as usize - 4).await?;
    if body.len() < 4 {
        return Err(ProtocolError::BadStartup("truncated startup packet".into()));
    }
    let code = i32::from_be_bytes([body[0], body[1], body[2], body[3]]);

    match code {
        CANCEL_REQUEST_CODE => {
            if body.len() < 12 {
                return Err(ProtocolError::BadStartup("truncated cancel request".into()));
            }
            let pid = i32::from_be_bytes([body[4], body[5], body[6], body[7]]);
            let key = i32::from_be_bytes([body[8], body[9], body[10], body[11]]);
            Ok(InitialMessage::Cancel(CancelKey::new(pid, key)))
        }
        SSL_REQUEST_CODE => Ok(InitialMessage::SslRequest),
        GSS_ENC_REQUEST_CODE => Ok(InitialMessage::GssEncRequest),
        _ => Ok(InitialMessage::Startup(StartupPacket::parse(body)?)),
    }
}

/// Build a V3 cancel-request wire frame for forwarding to a backend
pub fn encode_cancel_request(key: CancelKey) -> Bytes {
    let mut buf = BytesMut::with_capacity(16);
    buf.put_i32(16);
    buf.put_i32(CANCEL_REQUEST_CODE);
    buf.put_i32(key.pid);
    buf.put_i32(key.key);
    buf.freeze()
}
