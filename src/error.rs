use std::result::Result as StdResult;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// Clean EOF from the peer before the first byte of a request header.
    #[error("peer closed the connection")]
    PeerClosed,

    #[error("client idle timeout elapsed")]
    ClientIdle,

    #[error("per-message deadline exceeded")]
    MessageTimeout,

    /// EOF mid-header or mid-body. The framing of a binary stream cannot be
    /// resynchronized, so the session must close.
    #[error("stream truncated mid-frame")]
    Truncated,

    #[error("malformed frame: {0}")]
    MalformedFrame(String),

    #[error("malformed document: {0}")]
    MalformedDocument(String),

    #[error("no upstream reachable, last tried {addr}")]
    UpstreamUnavailable { addr: String },

    #[error("catalog unavailable: {0}")]
    CatalogUnavailable(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("{0}")]
    Msg(String),
}

pub type Result<T> = StdResult<T, Error>;
