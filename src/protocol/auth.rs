/// Password authentication on both sides of the proxy
///
/// Backend side: drives the Authentication exchange of a fresh
/// backend connection until ReadyForQuery, collecting the session
/// parameters and cancel key on the way. Frontend side: challenges
/// the client per the configured method, used both for fresh sessions
/// and for re-authenticating a client that is about to adopt a pooled
/// backend connection.
use md5::{Digest, Md5};
use rand::Rng;
use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::message::{self, auth_code, kind, WireMessage};
use super::startup::StartupPacket;
use super::stream::PacketStream;
use super::{CancelKey, ParameterSet, ProtocolError, ProtocolResult, TransactionState};

/// How frontend clients prove their identity
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientAuthMethod {
    Trust,
    Md5,
}

/// Everything a freshly authenticated backend connection reported
/// before its first ReadyForQuery
#[derive(Debug, Clone)]
pub struct BackendGreeting {
    pub parameters: ParameterSet,
    pub cancel_key: CancelKey,
    pub tstate: TransactionState,
}

/// PostgreSQL MD5 password scheme: md5(md5(password + user) + salt),
/// prefixed with the literal "md5"
pub fn md5_password_hash(user: &str, password: &str, salt: [u8; 4]) -> String {
    let inner = {
        let mut hasher = Md5::new();
        hasher.update(password.as_bytes());
        hasher.update(user.as_bytes());
        format!("{:x}", hasher.finalize())
    };
    let mut hasher = Md5::new();
    hasher.update(inner.as_bytes());
    hasher.update(salt);
    format!("md5{:x}", hasher.finalize())
}

/// Drive a new backend connection from just-after-startup to
/// ReadyForQuery. The startup packet must already have been written.
pub async fn authenticate_backend<S>(
    stream: &mut PacketStream<S>,
    startup: &StartupPacket,
    password: Option<&str>,
) -> ProtocolResult<BackendGreeting>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let mut parameters = ParameterSet::new();
    let mut cancel_key = None;

    loop {
        let msg = WireMessage::read_from(stream).await?;
        match msg.kind {
            kind::AUTHENTICATION => {
                let (code, salt) = message::parse_authentication(&msg)?;
                match code {
                    auth_code::OK => {}
                    auth_code::CLEARTEXT_PASSWORD => {
                        let password = password.ok_or_else(|| {
                            ProtocolError::AuthFailed(format!(
                                "backend requested a password for \"{}\" but none is configured",
                                startup.user()
                            ))
                        })?;
                        stream
                            .write_and_flush(&message::password_message(password).encode())
                            .await?;
                    }
                    auth_code::MD5_PASSWORD => {
                        let password = password.ok_or_else(|| {
                            ProtocolError::AuthFailed(format!(
                                "backend requested md5 auth for \"{}\" but no password is configured",
                                startup.user()
                            ))
                        })?;
                        let salt = salt.ok_or_else(|| {
                            ProtocolError::malformed("md5 request without salt")
                        })?;
                        let hashed = md5_password_hash(startup.user(), password, salt);
                        stream
                            .write_and_flush(&message::password_message(&hashed).encode())
                            .await?;
                    }
                    other => {
                        return Err(ProtocolError::Unsupported(format!(
                            "backend authentication method {}",
                            other
                        )));
                    }
                }
            }
            kind::PARAMETER_STATUS => {
                parameters.push(message::parse_parameter_status(&msg)?);
            }
            kind::BACKEND_KEY_DATA => {
                cancel_key = Some(message::parse_backend_key_data(&msg)?);
            }
            kind::READY_FOR_QUERY => {
                let tstate = message::parse_ready_for_query(&msg)?;
                let cancel_key = cancel_key.ok_or_else(|| {
                    ProtocolError::malformed("backend ready without BackendKeyData")
                })?;
                debug!(
                    user = startup.user(),
                    database = startup.database(),
                    backend_pid = cancel_key.pid,
                    "backend connection authenticated"
                );
                return Ok(BackendGreeting {
                    parameters,
                    cancel_key,
                    tstate,
                });
            }
            kind::ERROR_RESPONSE => {
                return Err(ProtocolError::AuthFailed(String::from_utf8_lossy(
                    &msg.payload,
                )
                .into_owned()));
            }
            kind::NOTICE_RESPONSE => {}
            other => {
                return Err(ProtocolError::malformed(format!(
                    "unexpected message '{}' during backend authentication",
                    other as char
                )));
            }
        }
    }
}

/// Challenge a frontend per the configured method. Does not send
/// AuthenticationOk; the caller follows up with the full greeting.
pub async fn authenticate_frontend<S>(
    stream: &mut PacketStream<S>,
    user: &str,
    method: ClientAuthMethod,
    stored_password: Option<&str>,
) -> ProtocolResult<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    match method {
        ClientAuthMethod::Trust => Ok(()),
        ClientAuthMethod::Md5 => {
            let stored = stored_password.ok_or_else(|| {
                ProtocolError::AuthFailed(format!("no password configured for user \"{}\"", user))
            })?;
            let salt: [u8; 4] = rand::thread_rng().gen();
            stream
                .write_and_flush(&message::authentication_md5(salt).encode())
                .await?;

            let reply = WireMessage::read_from(stream).await?;
            let answer = message::parse_password_message(&reply)?;
            let expected = md5_password_hash(user, stored, salt);
            if answer != expected {
                return Err(ProtocolError::AuthFailed(format!(
                    "password authentication failed for user \"{}\"",
                    user
                )));
            }
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::startup::StartupPacket;
    use bytes::{BufMut, BytesMut};
    use tokio::io::{duplex, AsyncWriteExt};

    fn startup(user: &str, db: &str) -> StartupPacket {
        let mut buf = BytesMut::new();
        buf.put_i32(196608);
        for (k, v) in [("user", user), ("database", db)] {
            buf.put_slice(k.as_bytes());
            buf.put_u8(0);
            buf.put_slice(v.as_bytes());
            buf.put_u8(0);
        }
        buf.put_u8(0);
        StartupPacket::parse(buf.freeze()).unwrap()
    }

    #[test]
    fn test_md5_password_hash_shape() {
        let hash = md5_password_hash("alice", "secret", [0, 1, 2, 3]);
        assert!(hash.starts_with("md5"));
        assert_eq!(hash.len(), 3 + 32);
        // deterministic
        assert_eq!(hash, md5_password_hash("alice", "secret", [0, 1, 2, 3]));
        assert_ne!(hash, md5_password_hash("alice", "secret", [9, 9, 9, 9]));
    }

    #[tokio::test]
    async fn test_backend_auth_trust_flow() {
        let (mut server, client) = duplex(1024);
        let mut stream = PacketStream::new(client);

        server
            .write_all(&message::authentication_ok().encode())
            .await
            .unwrap();
        server
            .write_all(&message::parameter_status("server_version", "15.3").encode())
            .await
            .unwrap();
        server
            .write_all(&message::backend_key_data(CancelKey::new(42, 7)).encode())
            .await
            .unwrap();
        server
            .write_all(&message::ready_for_query(TransactionState::Idle).encode())
            .await
            .unwrap();

        let greeting = authenticate_backend(&mut stream, &startup("alice", "shop"), None)
            .await
            .unwrap();
        assert_eq!(greeting.cancel_key, CancelKey::new(42, 7));
        assert_eq!(greeting.tstate, TransactionState::Idle);
        assert_eq!(
            greeting.parameters,
            vec![("server_version".to_string(), "15.3".to_string())]
        );
    }

    #[tokio::test]
    async fn test_backend_auth_md5_round_trip() {
        let (server_io, client_io) = duplex(1024);
        let mut backend = PacketStream::new(server_io);
        let mut stream = PacketStream::new(client_io);

        let salt = [7, 8, 9, 10];
        let server = tokio::spawn(async move {
            backend
                .write_and_flush(&message::authentication_md5(salt).encode())
                .await
                .unwrap();
            let reply = WireMessage::read_from(&mut backend).await.unwrap();
            let answer = message::parse_password_message(&reply).unwrap();
            assert_eq!(answer, md5_password_hash("alice", "secret", salt));
            backend
                .write_and_flush(&message::authentication_ok().encode())
                .await
                .unwrap();
            backend
                .write_and_flush(&message::backend_key_data(CancelKey::new(1, 2)).encode())
                .await
                .unwrap();
            backend
                .write_and_flush(&message::ready_for_query(TransactionState::Idle).encode())
                .await
                .unwrap();
        });

        let greeting =
            authenticate_backend(&mut stream, &startup("alice", "shop"), Some("secret"))
                .await
                .unwrap();
        assert_eq!(greeting.cancel_key, CancelKey::new(1, 2));
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_backend_auth_error_response() {
        let (mut server, client) = duplex(1024);
        let mut stream = PacketStream::new(client);

        let err = message::error_response_v3(&message::ErrorFields::fatal(
            "28P01",
            "password authentication failed",
        ));
        server.write_all(&err.encode()).await.unwrap();

        let got = authenticate_backend(&mut stream, &startup("alice", "shop"), None)
            .await
            .unwrap_err();
        assert!(matches!(got, ProtocolError::AuthFailed(_)));
    }

    #[tokio::test]
    async fn test_frontend_md5_rejects_wrong_password() {
        let (client_io, server_io) = duplex(1024);
        let mut server = PacketStream::new(server_io);
        let mut client = PacketStream::new(client_io);

        let client_task = tokio::spawn(async move {
            let challenge = WireMessage::read_from(&mut client).await.unwrap();
            let (code, salt) = message::parse_authentication(&challenge).unwrap();
            assert_eq!(code, auth_code::MD5_PASSWORD);
            let bad = md5_password_hash("alice", "wrong", salt.unwrap());
            client
                .write_and_flush(&message::password_message(&bad).encode())
                .await
                .unwrap();
        });

        let res =
            authenticate_frontend(&mut server, "alice", ClientAuthMethod::Md5, Some("secret"))
                .await;
        assert!(matches!(res, Err(ProtocolError::AuthFailed(_))));
        client_task.await.unwrap();
    }

    #[tokio::test]
    async fn test_frontend_trust_is_a_no_op() {
        let (_client_io, server_io) = duplex(64);
        let mut server = PacketStream::new(server_io);
        authenticate_frontend(&mut server, "alice", ClientAuthMethod::Trust, None)
            .await
            .unwrap();
    }
}
