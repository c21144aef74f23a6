//! Per-connection relay: one client socket, one upstream socket, sequential
//! request handling under an idle timeout and a per-message deadline.

use crate::catalog::Catalog;
use crate::error::{Error, Result};
use crate::oracle;
use crate::protocol::{self, MessageHeader, NO_INDEX_ERROR_CODE, OpCode};
use rand::Rng;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::time::{Instant, sleep, timeout, timeout_at};

const DIAL_ATTEMPTS: u32 = 7;
const DIAL_INITIAL_BACKOFF: Duration = Duration::from_millis(50);
const KEEPALIVE_PERIOD: Duration = Duration::from_secs(120);

/// Reserved suffix marking command pseudo-collections, which bypass the guard.
const CMD_COLLECTION_SUFFIX: &str = ".$cmd";

/// Bound on the full collection name; real namespaces are far shorter, this
/// only caps corrupt streams.
const MAX_COLLECTION_NAME_LEN: usize = 4096;

#[derive(Debug, Clone)]
pub struct SessionSettings {
    pub message_timeout: Duration,
    pub client_idle_timeout: Duration,
}

/// Dial one upstream, uniform random across the full list, with bounded
/// exponential-backoff retry.
pub async fn dial_upstream(addrs: &[String]) -> Result<TcpStream> {
    let mut backoff = DIAL_INITIAL_BACKOFF;
    let mut last_addr = "";
    for _ in 0..DIAL_ATTEMPTS {
        let addr = match addrs.len() {
            0 => {
                return Err(Error::UpstreamUnavailable {
                    addr: String::new(),
                });
            }
            1 => &addrs[0],
            len => &addrs[rand::thread_rng().gen_range(0..len)],
        };
        match TcpStream::connect(addr).await {
            Ok(stream) => return Ok(stream),
            Err(e) => {
                let retry_in_ms = backoff.as_millis() as u64;
                tracing::warn!(%addr, error = %e, retry_in_ms, "upstream dial failed");
                sleep(backoff).await;
                backoff *= 2;
                last_addr = addr.as_str();
            }
        }
    }
    Err(Error::UpstreamUnavailable {
        addr: last_addr.to_string(),
    })
}

/// Keep long-lived client connections from lingering dead.
pub fn enable_keepalive(stream: &TcpStream) -> std::io::Result<()> {
    let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_PERIOD);
    socket2::SockRef::from(stream).set_tcp_keepalive(&keepalive)
}

pub struct Session {
    client: TcpStream,
    upstream: TcpStream,
    catalog: Arc<dyn Catalog>,
    settings: SessionSettings,
}

impl Session {
    pub fn new(
        client: TcpStream,
        upstream: TcpStream,
        catalog: Arc<dyn Catalog>,
        settings: SessionSettings,
    ) -> Self {
        Self {
            client,
            upstream,
            catalog,
            settings,
        }
    }

    /// Pump requests until the client goes away or the session errors.
    /// A clean close before the next request header is a normal end.
    pub async fn run(mut self) -> Result<()> {
        loop {
            let header = match timeout(
                self.settings.client_idle_timeout,
                protocol::read_header(&mut self.client),
            )
            .await
            {
                Ok(Ok(header)) => header,
                Ok(Err(Error::PeerClosed)) => return Ok(()),
                Ok(Err(e)) => return Err(e),
                Err(_) => return Err(Error::ClientIdle),
            };

            // One absolute deadline covers the whole exchange on both sockets
            let deadline = Instant::now() + self.settings.message_timeout;
            match header.op() {
                OpCode::Query => deadlined(deadline, self.exchange_query(header)).await?,
                op => deadlined(deadline, self.exchange_passthrough(header, op)).await?,
            }
        }
    }

    async fn exchange_passthrough(&mut self, header: MessageHeader, op: OpCode) -> Result<()> {
        self.upstream.write_all(&header.to_wire()).await?;
        protocol::copy_exact(&mut self.client, &mut self.upstream, header.body_len()).await?;
        if op.has_response() {
            protocol::copy_frame(&mut self.upstream, &mut self.client).await?;
        }
        Ok(())
    }

    /// Buffer the query prefix, decide coverage, then either re-emit the
    /// buffered bytes upstream or answer the client in-band. Exactly one of
    /// the two sockets sees a frame for this request.
    async fn exchange_query(&mut self, header: MessageHeader) -> Result<()> {
        let mut parts: Vec<u8> = Vec::with_capacity(header.message_length as usize);
        parts.extend_from_slice(&header.to_wire());

        let mut flags = [0u8; 4];
        protocol::read_exact(&mut self.client, &mut flags).await?;
        parts.extend_from_slice(&flags);

        let name_raw =
            protocol::read_cstring(&mut self.client, MAX_COLLECTION_NAME_LEN).await?;
        parts.extend_from_slice(&name_raw);
        let full_name = std::str::from_utf8(&name_raw[..name_raw.len() - 1])
            .map_err(|_| Error::MalformedFrame("collection name is not utf-8".into()))?
            .to_string();

        let mut skip_and_return = [0u8; 8];
        protocol::read_exact(&mut self.client, &mut skip_and_return).await?;
        parts.extend_from_slice(&skip_and_return);

        let query = protocol::read_document(&mut self.client).await?;
        parts.extend_from_slice(&query.bytes);

        if parts.len() > header.message_length as usize {
            return Err(Error::MalformedFrame(format!(
                "query payload overruns declared length {}",
                header.message_length
            )));
        }
        let residual = header.message_length as usize - parts.len();

        if !self.should_forward(&full_name, &query.doc).await {
            // Discard what was not buffered (a trailing returnFieldsSelector),
            // then answer in-band; nothing reaches the upstream.
            protocol::drain_exact(&mut self.client, residual).await?;
            let (_, coll) = split_namespace(&full_name);
            let message = format!(
                "No index was found that could be used for your query try db.{coll}.getIndexes()"
            );
            let reply = protocol::encode_error_reply(&header, &message, NO_INDEX_ERROR_CODE);
            self.client.write_all(&reply).await?;
            tracing::info!(
                collection = %full_name,
                request_id = header.request_id,
                "rejected unindexed query"
            );
            return Ok(());
        }

        self.upstream.write_all(&parts).await?;
        protocol::copy_exact(&mut self.client, &mut self.upstream, residual).await?;
        protocol::copy_frame(&mut self.upstream, &mut self.client).await?;
        Ok(())
    }

    async fn should_forward(&self, full_name: &str, query: &bson::Document) -> bool {
        if full_name.ends_with(CMD_COLLECTION_SUFFIX) {
            return true;
        }
        let (db, coll) = split_namespace(full_name);
        oracle::query_is_covered(self.catalog.as_ref(), db, coll, query).await
    }
}

async fn deadlined<T>(deadline: Instant, fut: impl Future<Output = Result<T>>) -> Result<T> {
    match timeout_at(deadline, fut).await {
        Ok(res) => res,
        Err(_) => Err(Error::MessageTimeout),
    }
}

/// Split `database.collection`; the collection part may itself contain dots.
fn split_namespace(full_name: &str) -> (&str, &str) {
    match full_name.split_once('.') {
        Some((db, coll)) => (db, coll),
        None => (full_name, ""),
    }
}
