//! Index metadata lookups over a dedicated wire-protocol backchannel.
//!
//! The backchannel is a single lazily-dialed connection to one of the
//! configured upstreams, used only for metadata reads. It is never part of
//! the proxied traffic path.

use crate::config::Config;
use crate::error::{Error, Result};
use crate::protocol::{self, OP_REPLY, REPLY_FLAG_QUERY_FAILURE, ReplyBody};
use async_trait::async_trait;
use bson::{Bson, Document, doc};
use md5::{Digest, Md5};
use rand::Rng;
use std::sync::atomic::{AtomicI32, Ordering};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::time::{Duration, timeout};

/// An index as reported by the catalog: the ordered key fields, each
/// optionally prefixed `-` for descending order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexSpec {
    pub key: Vec<String>,
}

/// The capability the oracle consumes. Test doubles implement it directly;
/// the production implementation is [`WireCatalog`].
#[async_trait]
pub trait Catalog: Send + Sync {
    async fn indexes(&self, db: &str, coll: &str) -> Result<Vec<IndexSpec>>;
}

#[derive(Debug, Clone)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub auth_db: String,
}

pub struct WireCatalog {
    addrs: Vec<String>,
    timeout: Duration,
    credentials: Option<Credentials>,
    stream: Mutex<Option<TcpStream>>,
    request_id: AtomicI32,
}

impl WireCatalog {
    pub fn new(addrs: Vec<String>, timeout: Duration, credentials: Option<Credentials>) -> Self {
        Self {
            addrs,
            timeout,
            credentials,
            stream: Mutex::new(None),
            request_id: AtomicI32::new(1),
        }
    }

    pub fn from_config(cfg: &Config) -> Self {
        let catalog_cfg = cfg.catalog.clone().unwrap_or_default();
        let credentials = match (&catalog_cfg.username, &catalog_cfg.password) {
            (Some(username), Some(password)) => Some(Credentials {
                username: username.clone(),
                password: password.clone(),
                auth_db: catalog_cfg.auth_db.clone(),
            }),
            _ => None,
        };
        Self::new(
            cfg.upstream_addrs.clone(),
            Duration::from_millis(catalog_cfg.timeout_ms),
            credentials,
        )
    }

    /// Eagerly establish the backchannel so a dead catalog fails at startup
    /// instead of degrading every session to fail-open.
    pub async fn connect(&self) -> Result<()> {
        let mut guard = self.stream.lock().await;
        self.ensure_connected(&mut guard).await
    }

    async fn ensure_connected(&self, guard: &mut Option<TcpStream>) -> Result<()> {
        if guard.is_some() {
            return Ok(());
        }
        let addr = self.pick_addr()?;
        let mut stream = timeout(self.timeout, TcpStream::connect(addr))
            .await
            .map_err(|_| Error::CatalogUnavailable(format!("connect to {addr} timed out")))?
            .map_err(|e| Error::CatalogUnavailable(format!("connect to {addr}: {e}")))?;
        if let Some(creds) = &self.credentials {
            self.authenticate(&mut stream, creds).await?;
        }
        tracing::debug!(%addr, "catalog backchannel connected");
        *guard = Some(stream);
        Ok(())
    }

    fn pick_addr(&self) -> Result<&str> {
        match self.addrs.len() {
            0 => Err(Error::CatalogUnavailable(
                "no catalog address configured".into(),
            )),
            1 => Ok(&self.addrs[0]),
            len => Ok(&self.addrs[rand::thread_rng().gen_range(0..len)]),
        }
    }

    /// Send one OP_QUERY and read back the single OP_REPLY it elicits.
    async fn round_trip(
        &self,
        stream: &mut TcpStream,
        full_collection_name: &str,
        number_to_return: i32,
        query: &Document,
    ) -> Result<ReplyBody> {
        let request_id = self.request_id.fetch_add(1, Ordering::Relaxed);
        let wire = protocol::encode_op_query(request_id, full_collection_name, number_to_return, query);
        timeout(self.timeout, stream.write_all(&wire))
            .await
            .map_err(|_| Error::CatalogUnavailable("send timed out".into()))?
            .map_err(|e| Error::CatalogUnavailable(format!("send: {e}")))?;

        let header = timeout(self.timeout, protocol::read_header(stream))
            .await
            .map_err(|_| Error::CatalogUnavailable("recv timed out".into()))?
            .map_err(|e| Error::CatalogUnavailable(format!("recv header: {e}")))?;
        if header.op_code != OP_REPLY {
            return Err(Error::CatalogUnavailable(format!(
                "unexpected op code {} in reply",
                header.op_code
            )));
        }
        let mut body = vec![0u8; header.body_len()];
        timeout(self.timeout, stream.read_exact(&mut body))
            .await
            .map_err(|_| Error::CatalogUnavailable("recv timed out".into()))?
            .map_err(|e| Error::CatalogUnavailable(format!("recv body: {e}")))?;

        protocol::decode_op_reply(&body).map_err(|e| Error::CatalogUnavailable(e.to_string()))
    }

    /// Legacy nonce handshake: `getnonce`, then `authenticate` with the MD5
    /// digest, both against the auth database's command namespace.
    async fn authenticate(&self, stream: &mut TcpStream, creds: &Credentials) -> Result<()> {
        let cmd_ns = format!("{}.$cmd", creds.auth_db);

        let reply = self
            .round_trip(stream, &cmd_ns, -1, &doc! { "getnonce": 1 })
            .await?;
        let nonce = reply
            .documents
            .first()
            .and_then(|d| d.get_str("nonce").ok())
            .ok_or_else(|| Error::CatalogUnavailable("getnonce reply carried no nonce".into()))?
            .to_string();

        let digest = md5_hex(&format!("{}:mongo:{}", creds.username, creds.password));
        let key = md5_hex(&format!("{nonce}{}{digest}", creds.username));
        let auth = doc! {
            "authenticate": 1,
            "user": &creds.username,
            "nonce": &nonce,
            "key": key,
        };
        let reply = self.round_trip(stream, &cmd_ns, -1, &auth).await?;
        let ok = reply.documents.first().is_some_and(command_ok);
        if !ok {
            return Err(Error::CatalogUnavailable(format!(
                "authentication failed for {}",
                creds.username
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl Catalog for WireCatalog {
    async fn indexes(&self, db: &str, coll: &str) -> Result<Vec<IndexSpec>> {
        let mut guard = self.stream.lock().await;
        self.ensure_connected(&mut guard).await?;
        let Some(stream) = guard.as_mut() else {
            return Err(Error::CatalogUnavailable("backchannel not connected".into()));
        };

        let full_name = format!("{db}.system.indexes");
        let ns = format!("{db}.{coll}");
        // Negative limit: one batch, server closes the cursor
        let result = self
            .round_trip(stream, &full_name, -100, &doc! { "ns": ns })
            .await;

        let reply = match result {
            Ok(reply) => reply,
            Err(e) => {
                // Drop the cached connection so the next lookup redials
                *guard = None;
                return Err(e);
            }
        };
        if reply.response_flags & REPLY_FLAG_QUERY_FAILURE != 0 {
            return Err(Error::CatalogUnavailable(
                "server flagged the index lookup as failed".into(),
            ));
        }

        Ok(reply
            .documents
            .iter()
            .filter_map(index_spec_from_doc)
            .collect())
    }
}

/// Map one `system.indexes` document to an [`IndexSpec`]. The `key`
/// subdocument holds fields in index order with numeric direction values.
fn index_spec_from_doc(doc: &Document) -> Option<IndexSpec> {
    let key = doc.get_document("key").ok()?;
    let fields = key
        .iter()
        .map(|(name, direction)| {
            if is_descending(direction) {
                format!("-{name}")
            } else {
                name.clone()
            }
        })
        .collect();
    Some(IndexSpec { key: fields })
}

fn is_descending(value: &Bson) -> bool {
    match value {
        Bson::Int32(v) => *v < 0,
        Bson::Int64(v) => *v < 0,
        Bson::Double(v) => *v < 0.0,
        _ => false,
    }
}

fn command_ok(doc: &Document) -> bool {
    match doc.get("ok") {
        Some(Bson::Int32(v)) => *v == 1,
        Some(Bson::Int64(v)) => *v == 1,
        Some(Bson::Double(v)) => *v == 1.0,
        _ => false,
    }
}

fn md5_hex(input: &str) -> String {
    let mut hasher = Md5::new();
    hasher.update(input.as_bytes());
    hex::encode(hasher.finalize())
}
