//! Replication-protocol client: startup and authentication, simple
//! queries, the walsender command set, and the base-backup receive paths.

pub mod basebackup;
pub mod scram;

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::TcpStream;
use tokio_rustls::rustls::{self, client::ServerCertVerified, ServerName};
use tracing::{debug, info};

use pq_proto::framed::{Framed, MaybeTlsStream};
use pq_proto::{BeMessage, FeMessage, ReplicationMessage, StandbyStatusUpdate};
use postgres_wal::{Lsn, PgMajorVersion, TimeLineId};
use utils::rate_limit::TokenBucket;

use crate::conf::{ServerConf, ServerVersionInfo};
use crate::error::{Error, ErrorKind, Result};
use scram::ScramClient;

/// Microseconds between the PostgreSQL epoch (2000-01-01) and the Unix
/// epoch.
const PG_EPOCH_OFFSET_US: i64 = 946_684_800_000_000;

pub fn pg_now() -> i64 {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default();
    now.as_micros() as i64 - PG_EPOCH_OFFSET_US
}

/// Replication-mode flavor requested in the startup packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationMode {
    /// Plain SQL session (server probing).
    None,
    /// Physical replication: walsender command set.
    Physical,
}

pub struct PgClient {
    framed: Framed,
    blocking_timeout: Duration,
    /// Set after the startup ParameterStatus messages arrive.
    pub server_version: Option<String>,
}

impl PgClient {
    /// Connect, optionally negotiate TLS, authenticate, and wait for
    /// ReadyForQuery.
    pub async fn connect(
        server: &ServerConf,
        mode: ReplicationMode,
        authentication_timeout: Duration,
        blocking_timeout: Duration,
    ) -> Result<PgClient> {
        let stream = TcpStream::connect((server.host.as_str(), server.port))
            .await
            .map_err(|e| {
                Error::with_source(
                    ErrorKind::NetworkIo,
                    format!("connecting to {}:{}", server.host, server.port),
                    e,
                )
            })?;
        stream.set_nodelay(true).ok();

        let mut framed = if server.tls {
            let mut plain = Framed::new(MaybeTlsStream::Tcp(stream));
            plain.send(&FeMessage::SslRequest).await.map_err(Error::from)?;
            match plain.read_ssl_answer().await.map_err(Error::from)? {
                b'S' => {
                    let stream = match plain.into_inner() {
                        MaybeTlsStream::Tcp(tcp) => tcp,
                        MaybeTlsStream::Tls(_) => unreachable!("no TLS before the handshake"),
                    };
                    let connector = tls_connector()?;
                    let domain = ServerName::try_from(server.host.as_str())
                        .unwrap_or(ServerName::try_from("localhost").unwrap());
                    let tls = connector.connect(domain, stream).await.map_err(|e| {
                        Error::with_source(ErrorKind::Tls, "TLS handshake failed", e)
                    })?;
                    Framed::new(MaybeTlsStream::Tls(Box::new(tls)))
                }
                b'N' => {
                    return Err(Error::new(
                        ErrorKind::Tls,
                        format!("server {} refused TLS", server.host),
                    ))
                }
                other => {
                    return Err(Error::new(
                        ErrorKind::ProtocolViolation,
                        format!("unexpected SSLRequest answer {other:#04x}"),
                    ))
                }
            }
        } else {
            Framed::new(MaybeTlsStream::Tcp(stream))
        };

        let replication = match mode {
            ReplicationMode::None => None,
            ReplicationMode::Physical => Some("true"),
        };
        framed
            .send(&FeMessage::Startup {
                user: &server.user,
                database: match mode {
                    ReplicationMode::None => Some("postgres"),
                    ReplicationMode::Physical => None,
                },
                replication,
            })
            .await
            .map_err(Error::from)?;

        let mut client = PgClient {
            framed,
            blocking_timeout,
            server_version: None,
        };
        tokio::time::timeout(authentication_timeout, client.authenticate(server))
            .await
            .map_err(|_| Error::new(ErrorKind::Timeout, "authentication timed out"))??;
        client.wait_ready().await?;
        info!("connected to {}:{} ({mode:?})", server.host, server.port);
        Ok(client)
    }

    async fn authenticate(&mut self, server: &ServerConf) -> Result<()> {
        loop {
            match self.framed.read_message().await.map_err(Error::from)? {
                BeMessage::AuthenticationOk => return Ok(()),
                BeMessage::AuthenticationCleartextPassword => {
                    let password = required_password(server)?;
                    self.framed
                        .send(&FeMessage::PasswordMessage(password.as_bytes()))
                        .await
                        .map_err(Error::from)?;
                }
                BeMessage::AuthenticationMd5Password(salt) => {
                    let password = required_password(server)?;
                    let response = md5_password(&server.user, password, &salt);
                    self.framed
                        .send(&FeMessage::PasswordMessage(response.as_bytes()))
                        .await
                        .map_err(Error::from)?;
                }
                BeMessage::AuthenticationSasl(mechanisms) => {
                    if !mechanisms.iter().any(|m| m == scram::SCRAM_SHA_256) {
                        return Err(Error::new(
                            ErrorKind::AuthFailed,
                            format!("no common SASL mechanism in {mechanisms:?}"),
                        ));
                    }
                    let password = required_password(server)?;
                    self.sasl_exchange(password).await?;
                }
                BeMessage::ErrorResponse(fields) => {
                    return Err(Error::new(
                        ErrorKind::AuthFailed,
                        format!("authentication failed: {fields}"),
                    ))
                }
                BeMessage::NoticeResponse(fields) => debug!("server notice: {fields}"),
                other => {
                    return Err(Error::new(
                        ErrorKind::ProtocolViolation,
                        format!("unexpected message during authentication: {other:?}"),
                    ))
                }
            }
        }
    }

    async fn sasl_exchange(&mut self, password: &str) -> Result<()> {
        // The role was already named in the startup packet; SCRAM carries
        // the empty name.
        let mut scram = ScramClient::new("", password);
        let first = scram.client_first_message();
        self.framed
            .send(&FeMessage::SaslInitialResponse {
                mechanism: scram::SCRAM_SHA_256,
                body: first.as_bytes(),
            })
            .await
            .map_err(Error::from)?;

        let server_first = match self.framed.read_message().await.map_err(Error::from)? {
            BeMessage::AuthenticationSaslContinue(body) => utf8_message(&body)?,
            BeMessage::ErrorResponse(fields) => {
                return Err(Error::new(ErrorKind::AuthFailed, fields.to_string()))
            }
            other => {
                return Err(Error::new(
                    ErrorKind::ProtocolViolation,
                    format!("expected SASLContinue, got {other:?}"),
                ))
            }
        };
        let client_final = scram
            .handle_server_first(&server_first)
            .map_err(|e| Error::with_source(ErrorKind::AuthFailed, "SCRAM exchange failed", e))?;
        self.framed
            .send(&FeMessage::SaslResponse(client_final.as_bytes()))
            .await
            .map_err(Error::from)?;

        let server_final = match self.framed.read_message().await.map_err(Error::from)? {
            BeMessage::AuthenticationSaslFinal(body) => utf8_message(&body)?,
            BeMessage::ErrorResponse(fields) => {
                return Err(Error::new(ErrorKind::AuthFailed, fields.to_string()))
            }
            other => {
                return Err(Error::new(
                    ErrorKind::ProtocolViolation,
                    format!("expected SASLFinal, got {other:?}"),
                ))
            }
        };
        scram
            .verify_server_final(&server_final)
            .map_err(|e| Error::with_source(ErrorKind::AuthFailed, "SCRAM verification failed", e))
    }

    /// Drain startup chatter until ReadyForQuery.
    async fn wait_ready(&mut self) -> Result<()> {
        loop {
            match self.read_timeout().await? {
                BeMessage::ReadyForQuery(_) => return Ok(()),
                BeMessage::ParameterStatus { name, value } => {
                    if name.as_ref() == b"server_version" {
                        self.server_version = Some(String::from_utf8_lossy(&value).into_owned());
                    }
                }
                BeMessage::BackendKeyData { .. } | BeMessage::NoticeResponse(_) => {}
                BeMessage::ErrorResponse(fields) => {
                    return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
                }
                other => {
                    return Err(Error::new(
                        ErrorKind::ProtocolViolation,
                        format!("unexpected message before ReadyForQuery: {other:?}"),
                    ))
                }
            }
        }
    }

    async fn read_timeout(&mut self) -> Result<BeMessage> {
        self.framed
            .read_message_timeout(self.blocking_timeout)
            .await
            .map_err(Error::from)
    }

    /// Run one simple query, streaming rows to `on_row`; the decoded
    /// column names are returned with the row count.
    pub async fn query_streamed(
        &mut self,
        sql: &str,
        mut on_row: impl FnMut(&[Option<String>]),
    ) -> Result<(Vec<String>, usize)> {
        debug!("query: {sql}");
        self.framed.send(&FeMessage::Query(sql)).await.map_err(Error::from)?;
        let mut columns = Vec::new();
        let mut count = 0usize;
        loop {
            match self.read_timeout().await? {
                BeMessage::RowDescription(names) => {
                    columns = names
                        .iter()
                        .map(|n| String::from_utf8_lossy(n).into_owned())
                        .collect();
                }
                BeMessage::DataRow(cols) => {
                    let row: Vec<Option<String>> = cols
                        .iter()
                        .map(|c| c.as_ref().map(|v| String::from_utf8_lossy(v).into_owned()))
                        .collect();
                    on_row(&row);
                    count += 1;
                }
                BeMessage::CommandComplete(_) => {}
                BeMessage::ReadyForQuery(_) => return Ok((columns, count)),
                BeMessage::ErrorResponse(fields) => {
                    // Drain to ReadyForQuery before surfacing the error.
                    let err = Error::new(ErrorKind::ProtocolViolation, fields.to_string());
                    loop {
                        if let BeMessage::ReadyForQuery(_) = self.read_timeout().await? {
                            break;
                        }
                    }
                    return Err(err);
                }
                BeMessage::NoticeResponse(fields) => debug!("notice: {fields}"),
                BeMessage::CopyOutResponse { .. }
                | BeMessage::CopyBothResponse
                | BeMessage::CopyInResponse => {
                    return Err(Error::new(
                        ErrorKind::ProtocolViolation,
                        "unexpected COPY response to a plain query",
                    ))
                }
                _ => {}
            }
        }
    }

    /// Materialized form of [`Self::query_streamed`].
    pub async fn query(&mut self, sql: &str) -> Result<QueryResponse> {
        let mut tuples = Vec::new();
        let (column_names, _) = self
            .query_streamed(sql, |row| tuples.push(row.to_vec()))
            .await?;
        Ok(QueryResponse {
            column_names,
            tuples,
        })
    }

    /// Scalar convenience: first column of the first row.
    pub async fn query_one(&mut self, sql: &str) -> Result<String> {
        let response = self.query(sql).await?;
        response
            .tuples
            .first()
            .and_then(|row| row.first())
            .and_then(|v| v.clone())
            .ok_or_else(|| Error::new(ErrorKind::ProtocolViolation, format!("empty result for {sql:?}")))
    }

    /// `IDENTIFY_SYSTEM` on a replication connection.
    pub async fn identify_system(&mut self) -> Result<SystemIdentification> {
        let response = self.query("IDENTIFY_SYSTEM").await?;
        let row = response
            .tuples
            .first()
            .ok_or_else(|| Error::new(ErrorKind::ProtocolViolation, "empty IDENTIFY_SYSTEM"))?;
        let field = |i: usize| -> Result<&str> {
            row.get(i)
                .and_then(|v| v.as_deref())
                .ok_or_else(|| Error::new(ErrorKind::ProtocolViolation, "null IDENTIFY_SYSTEM field"))
        };
        Ok(SystemIdentification {
            systemid: field(0)?.parse().map_err(|_| {
                Error::new(ErrorKind::ProtocolViolation, "bad system identifier")
            })?,
            timeline: field(1)?.parse().map_err(|_| {
                Error::new(ErrorKind::ProtocolViolation, "bad timeline")
            })?,
            xlogpos: field(2)?.parse().map_err(|_| {
                Error::new(ErrorKind::ProtocolViolation, "bad xlogpos")
            })?,
        })
    }

    /// Probe version and WAL geometry over a plain SQL connection.
    pub async fn probe_version(&mut self) -> Result<ServerVersionInfo> {
        let version_num: u32 = self
            .query_one("SHOW server_version_num")
            .await?
            .parse()
            .map_err(|_| Error::new(ErrorKind::ProtocolViolation, "bad server_version_num"))?;
        let major = PgMajorVersion::from_major(version_num / 10000)
            .map_err(|e| Error::with_source(ErrorKind::IncompatibleVersion, "unsupported server", e))?;
        let minor = version_num % 10000;

        let wal_segment_size = parse_wal_segment_size(
            &self.query_one("SHOW wal_segment_size").await?,
        )?;
        Ok(ServerVersionInfo {
            major,
            minor,
            wal_segment_size,
        })
    }

    pub async fn timeline_history(&mut self, tli: TimeLineId) -> Result<(String, String)> {
        let response = self.query(&format!("TIMELINE_HISTORY {tli}")).await?;
        let row = response
            .tuples
            .first()
            .ok_or_else(|| Error::new(ErrorKind::NotFound, format!("no history for timeline {tli}")))?;
        let filename = row.first().and_then(|v| v.clone()).unwrap_or_default();
        let content = row.get(1).and_then(|v| v.clone()).unwrap_or_default();
        Ok((filename, content))
    }

    pub async fn read_replication_slot(&mut self, slot: &str) -> Result<Option<SlotInfo>> {
        let response = self.query(&format!("READ_REPLICATION_SLOT {slot}")).await?;
        let Some(row) = response.tuples.first() else {
            return Ok(None);
        };
        match (row.first().cloned().flatten(), row.get(1).cloned().flatten()) {
            (Some(slot_type), Some(restart_lsn)) => Ok(Some(SlotInfo {
                slot_type,
                restart_lsn: restart_lsn.parse().map_err(|_| {
                    Error::new(ErrorKind::ProtocolViolation, "bad restart_lsn")
                })?,
                restart_tli: row
                    .get(2)
                    .cloned()
                    .flatten()
                    .and_then(|v| v.parse().ok()),
            })),
            _ => Ok(None),
        }
    }

    pub async fn create_replication_slot(&mut self, slot: &str) -> Result<()> {
        self.query(&format!(
            "CREATE_REPLICATION_SLOT {slot} PHYSICAL (RESERVE_WAL)"
        ))
        .await?;
        info!("created physical replication slot {slot}");
        Ok(())
    }

    /// `START_REPLICATION`: switch the connection into CopyBoth and wrap
    /// it as a WAL stream.
    pub async fn start_replication(
        mut self,
        slot: &str,
        start_lsn: Lsn,
        tli: TimeLineId,
        network_bucket: Option<Arc<TokenBucket>>,
    ) -> Result<WalStream> {
        let command = format!("START_REPLICATION SLOT {slot} PHYSICAL {start_lsn} TIMELINE {tli}");
        debug!("{command}");
        self.framed
            .send(&FeMessage::Query(&command))
            .await
            .map_err(Error::from)?;
        loop {
            match self.read_timeout().await? {
                BeMessage::CopyBothResponse => break,
                BeMessage::NoticeResponse(fields) => debug!("notice: {fields}"),
                BeMessage::ErrorResponse(fields) => {
                    return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
                }
                other => {
                    return Err(Error::new(
                        ErrorKind::ProtocolViolation,
                        format!("expected CopyBothResponse, got {other:?}"),
                    ))
                }
            }
        }
        self.framed.set_network_bucket(network_bucket);
        Ok(WalStream { client: self })
    }

    /// `UPLOAD_MANIFEST`: ship the parent backup's manifest ahead of an
    /// incremental `BASE_BACKUP` (v17+).
    pub async fn upload_manifest(&mut self, manifest: &[u8]) -> Result<()> {
        self.framed
            .send(&FeMessage::Query("UPLOAD_MANIFEST"))
            .await
            .map_err(Error::from)?;
        loop {
            match self.read_timeout().await? {
                BeMessage::CopyInResponse => break,
                BeMessage::NoticeResponse(fields) => debug!("notice: {fields}"),
                BeMessage::ErrorResponse(fields) => {
                    return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
                }
                other => {
                    return Err(Error::new(
                        ErrorKind::ProtocolViolation,
                        format!("expected CopyInResponse, got {other:?}"),
                    ))
                }
            }
        }
        for chunk in manifest.chunks(64 * 1024) {
            self.framed
                .send(&FeMessage::CopyData(chunk))
                .await
                .map_err(Error::from)?;
        }
        self.framed.send(&FeMessage::CopyDone).await.map_err(Error::from)?;
        loop {
            match self.read_timeout().await? {
                BeMessage::ReadyForQuery(_) => return Ok(()),
                BeMessage::CommandComplete(_) | BeMessage::NoticeResponse(_) => {}
                BeMessage::ErrorResponse(fields) => {
                    return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
                }
                other => debug!("draining {other:?}"),
            }
        }
    }

    /// Issue `BASE_BACKUP` with the given options; the connection is left
    /// positioned at the start of the result stream.
    pub(crate) async fn send_base_backup_command(&mut self, command: &str) -> Result<()> {
        debug!("{command}");
        self.framed
            .send(&FeMessage::Query(command))
            .await
            .map_err(Error::from)
    }

    pub(crate) async fn next_message(&mut self) -> Result<BeMessage> {
        self.read_timeout().await
    }

    pub async fn terminate(mut self) {
        let _ = self.framed.send(&FeMessage::Terminate).await;
    }
}

fn required_password(server: &ServerConf) -> Result<&str> {
    server.password.as_deref().ok_or_else(|| {
        Error::new(
            ErrorKind::AuthFailed,
            format!("server {} requires a password and none is configured", server.name),
        )
    })
}

fn utf8_message(body: &Bytes) -> Result<String> {
    String::from_utf8(body.to_vec())
        .map_err(|_| Error::new(ErrorKind::ProtocolViolation, "non-utf8 SASL message"))
}

/// `md5<hex(md5(hex(md5(password+user))+salt))>`.
fn md5_password(user: &str, password: &str, salt: &[u8; 4]) -> String {
    let inner = format!("{:x}", md5::compute(format!("{password}{user}")));
    let mut outer_input = inner.into_bytes();
    outer_input.extend_from_slice(salt);
    format!("md5{:x}", md5::compute(outer_input))
}

fn parse_wal_segment_size(text: &str) -> Result<usize> {
    // `SHOW wal_segment_size` answers like "16MB" or "64MB".
    let trimmed = text.trim();
    let (number, unit) = trimmed.split_at(
        trimmed
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(trimmed.len()),
    );
    let number: usize = number
        .parse()
        .map_err(|_| Error::new(ErrorKind::ProtocolViolation, format!("bad wal_segment_size {text:?}")))?;
    let multiplier = match unit.trim() {
        "MB" => 1024 * 1024,
        "GB" => 1024 * 1024 * 1024,
        "kB" => 1024,
        "" => 1,
        other => {
            return Err(Error::new(
                ErrorKind::ProtocolViolation,
                format!("bad wal_segment_size unit {other:?}"),
            ))
        }
    };
    let size = number * multiplier;
    if !size.is_power_of_two() {
        return Err(Error::new(
            ErrorKind::ProtocolViolation,
            format!("wal_segment_size {size} is not a power of two"),
        ));
    }
    Ok(size)
}

#[derive(Debug, Clone)]
pub struct QueryResponse {
    pub column_names: Vec<String>,
    pub tuples: Vec<Vec<Option<String>>>,
}

#[derive(Debug, Clone, Copy)]
pub struct SystemIdentification {
    pub systemid: u64,
    pub timeline: TimeLineId,
    pub xlogpos: Lsn,
}

#[derive(Debug, Clone)]
pub struct SlotInfo {
    pub slot_type: String,
    pub restart_lsn: Lsn,
    pub restart_tli: Option<TimeLineId>,
}

/// A live physical replication stream.
pub struct WalStream {
    client: PgClient,
}

pub enum WalStreamEvent {
    XLogData { wal_start: Lsn, data: Bytes },
    KeepAlive { wal_end: Lsn, reply_requested: bool },
    /// Server ended the stream (timeline switch).
    EndOfStream,
}

impl WalStream {
    pub async fn next_event(&mut self) -> Result<WalStreamEvent> {
        loop {
            match self.client.framed.read_message().await.map_err(Error::from)? {
                BeMessage::CopyData(payload) => {
                    let msg = ReplicationMessage::parse(payload).map_err(|e| {
                        Error::with_source(ErrorKind::ProtocolViolation, "bad replication message", e)
                    })?;
                    return Ok(match msg {
                        ReplicationMessage::XLogData { header, data } => WalStreamEvent::XLogData {
                            wal_start: header.wal_start,
                            data,
                        },
                        ReplicationMessage::PrimaryKeepAlive {
                            wal_end,
                            reply_requested,
                            ..
                        } => WalStreamEvent::KeepAlive {
                            wal_end,
                            reply_requested,
                        },
                    });
                }
                BeMessage::CopyDone => return Ok(WalStreamEvent::EndOfStream),
                BeMessage::ErrorResponse(fields) => {
                    return Err(Error::new(ErrorKind::ProtocolViolation, fields.to_string()))
                }
                BeMessage::NoticeResponse(fields) => debug!("notice: {fields}"),
                _ => {}
            }
        }
    }

    pub async fn send_status_update(
        &mut self,
        received_lsn: Lsn,
        flushed_lsn: Lsn,
        applied_lsn: Lsn,
    ) -> Result<()> {
        let update = StandbyStatusUpdate {
            received_lsn,
            flushed_lsn,
            applied_lsn,
            now: pg_now(),
            reply_requested: false,
        };
        let encoded = update.encode();
        self.client
            .framed
            .send(&FeMessage::CopyData(&encoded))
            .await
            .map_err(Error::from)
    }

    pub async fn finish(self) {
        self.client.terminate().await;
    }
}

/// Accept-any-certificate verifier: `sslmode=require` semantics, the
/// transport is encrypted but the peer is not authenticated.
struct AcceptAnyServerCert;

impl rustls::client::ServerCertVerifier for AcceptAnyServerCert {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::Certificate,
        _intermediates: &[rustls::Certificate],
        _server_name: &ServerName,
        _scts: &mut dyn Iterator<Item = &[u8]>,
        _ocsp_response: &[u8],
        _now: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }
}

fn tls_connector() -> Result<tokio_rustls::TlsConnector> {
    let config = rustls::ClientConfig::builder()
        .with_safe_defaults()
        .with_custom_certificate_verifier(Arc::new(AcceptAnyServerCert))
        .with_no_client_auth();
    Ok(tokio_rustls::TlsConnector::from(Arc::new(config)))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn md5_response_shape() {
        // Matches the server-side algorithm: md5(md5(password || user) || salt).
        let response = md5_password("repl", "secret", &[1, 2, 3, 4]);
        assert!(response.starts_with("md5"));
        assert_eq!(response.len(), 3 + 32);
        // Deterministic.
        assert_eq!(response, md5_password("repl", "secret", &[1, 2, 3, 4]));
        assert_ne!(response, md5_password("repl", "other", &[1, 2, 3, 4]));
    }

    #[test]
    fn wal_segment_size_parsing() {
        assert_eq!(parse_wal_segment_size("16MB").unwrap(), 16 * 1024 * 1024);
        assert_eq!(parse_wal_segment_size("64MB").unwrap(), 64 * 1024 * 1024);
        assert_eq!(parse_wal_segment_size("1GB").unwrap(), 1024 * 1024 * 1024);
        assert!(parse_wal_segment_size("15MB").is_err());
        assert!(parse_wal_segment_size("banana").is_err());
    }

    #[test]
    fn pg_epoch_offset() {
        // pg_now counts from 2000-01-01, so it must be far smaller than
        // the Unix clock but positive this century.
        let now = pg_now();
        assert!(now > 0);
        let unix_us = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_micros() as i64;
        assert!(now < unix_us);
    }
}
