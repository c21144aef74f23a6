//! Shared fixtures: a stub upstream that records every byte it receives and
//! answers response-bearing ops with a canned reply, plus a scriptable
//! catalog. Each test file pulls this in via `#[path]`, so not every item is
//! used everywhere.
#![allow(dead_code)]

use async_trait::async_trait;
use bson::Document;
use indexguard::catalog::{Catalog, IndexSpec};
use indexguard::config::Config;
use indexguard::error::{Error, Result};
use indexguard::protocol::{HEADER_LEN, MessageHeader, OP_QUERY, OP_REPLY};
use indexguard::server;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;

pub struct StubCatalog {
    indexes: Vec<IndexSpec>,
    fail: bool,
}

impl StubCatalog {
    pub fn with_keys(keys: &[&[&str]]) -> Arc<Self> {
        Arc::new(Self {
            indexes: keys
                .iter()
                .map(|key| IndexSpec {
                    key: key.iter().map(|f| f.to_string()).collect(),
                })
                .collect(),
            fail: false,
        })
    }

    pub fn failing() -> Arc<Self> {
        Arc::new(Self {
            indexes: Vec::new(),
            fail: true,
        })
    }
}

#[async_trait]
impl Catalog for StubCatalog {
    async fn indexes(&self, _db: &str, _coll: &str) -> Result<Vec<IndexSpec>> {
        if self.fail {
            return Err(Error::CatalogUnavailable("stub outage".into()));
        }
        Ok(self.indexes.clone())
    }
}

/// Stub upstream: accepts connections, records the raw bytes of every frame
/// it receives, and answers response-bearing ops with one OP_REPLY carrying
/// `reply_docs`. Pass an empty doc list to leave requests unanswered.
pub struct StubUpstream {
    pub addr: SocketAddr,
    received: Arc<Mutex<Vec<u8>>>,
}

impl StubUpstream {
    pub async fn spawn(reply_docs: Vec<Document>) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(Vec::new()));

        let recorded = Arc::clone(&received);
        tokio::spawn(async move {
            loop {
                let Ok((socket, _)) = listener.accept().await else {
                    break;
                };
                let recorded = Arc::clone(&recorded);
                let reply_docs = reply_docs.clone();
                tokio::spawn(async move {
                    serve_upstream_conn(socket, recorded, reply_docs).await;
                });
            }
        });

        Self { addr, received }
    }

    pub fn received(&self) -> Vec<u8> {
        self.received.lock().unwrap().clone()
    }

    /// Poll until the upstream has recorded at least `n` bytes.
    pub async fn wait_for_bytes(&self, n: usize) -> Vec<u8> {
        for _ in 0..200 {
            let bytes = self.received();
            if bytes.len() >= n {
                return bytes;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!(
            "upstream received only {} of {n} expected bytes",
            self.received().len()
        );
    }
}

async fn serve_upstream_conn(
    mut socket: TcpStream,
    recorded: Arc<Mutex<Vec<u8>>>,
    reply_docs: Vec<Document>,
) {
    loop {
        let mut header_buf = [0u8; HEADER_LEN];
        if socket.read_exact(&mut header_buf).await.is_err() {
            break;
        }
        let Ok(header) = MessageHeader::parse(&header_buf) else {
            break;
        };
        let mut body = vec![0u8; header.body_len()];
        if socket.read_exact(&mut body).await.is_err() {
            break;
        }
        {
            let mut bytes = recorded.lock().unwrap();
            bytes.extend_from_slice(&header_buf);
            bytes.extend_from_slice(&body);
        }
        if header.op().has_response() && !reply_docs.is_empty() {
            let reply = encode_reply(header.request_id, &reply_docs);
            if socket.write_all(&reply).await.is_err() {
                break;
            }
        }
    }
}

/// Raw OP_REPLY: zero flags, no cursor, `docs` as the result batch.
pub fn encode_reply(response_to: i32, docs: &[Document]) -> Vec<u8> {
    let mut docs_buf = Vec::new();
    for doc in docs {
        docs_buf.extend_from_slice(&bson::to_vec(doc).unwrap());
    }
    let message_length = (HEADER_LEN + 20 + docs_buf.len()) as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    out.extend_from_slice(&message_length.to_le_bytes());
    out.extend_from_slice(&1000i32.to_le_bytes()); // request id
    out.extend_from_slice(&response_to.to_le_bytes());
    out.extend_from_slice(&OP_REPLY.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // response flags
    out.extend_from_slice(&0i64.to_le_bytes()); // cursor id
    out.extend_from_slice(&0i32.to_le_bytes()); // starting from
    out.extend_from_slice(&(docs.len() as i32).to_le_bytes());
    out.extend_from_slice(&docs_buf);
    out
}

/// Raw OP_QUERY as a driver would send it, with an optional
/// returnFieldsSelector after the query document.
pub fn encode_query(
    request_id: i32,
    full_collection_name: &str,
    query: &Document,
    selector: Option<&Document>,
) -> Vec<u8> {
    let query_bytes = bson::to_vec(query).unwrap();
    let selector_bytes = selector.map(|s| bson::to_vec(s).unwrap()).unwrap_or_default();
    let body_len = 4 + full_collection_name.len() + 1 + 8 + query_bytes.len() + selector_bytes.len();
    let message_length = (HEADER_LEN + body_len) as i32;

    let mut out = Vec::with_capacity(message_length as usize);
    out.extend_from_slice(&message_length.to_le_bytes());
    out.extend_from_slice(&request_id.to_le_bytes());
    out.extend_from_slice(&0i32.to_le_bytes()); // response to
    out.extend_from_slice(&OP_QUERY.to_le_bytes());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(full_collection_name.as_bytes());
    out.push(0u8);
    out.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
    out.extend_from_slice(&0i32.to_le_bytes()); // numberToReturn
    out.extend_from_slice(&query_bytes);
    out.extend_from_slice(&selector_bytes);
    out
}

/// Read one full frame off the stream.
pub async fn read_frame(stream: &mut TcpStream) -> (MessageHeader, Vec<u8>) {
    let mut header_buf = [0u8; HEADER_LEN];
    stream.read_exact(&mut header_buf).await.unwrap();
    let header = MessageHeader::parse(&header_buf).unwrap();
    let mut body = vec![0u8; header.body_len()];
    stream.read_exact(&mut body).await.unwrap();
    (header, body)
}

/// Proxy wired to the given upstream and catalog, on an ephemeral port.
pub async fn spawn_proxy(
    upstream_addr: SocketAddr,
    catalog: Arc<dyn Catalog>,
) -> (SocketAddr, oneshot::Sender<()>) {
    let mut cfg = Config::default();
    cfg.listen_addr = "127.0.0.1:0".into();
    cfg.upstream_addrs = vec![upstream_addr.to_string()];
    let (addr, shutdown, _handle) = server::spawn_with_shutdown(&cfg, catalog).await.unwrap();
    (addr, shutdown)
}
