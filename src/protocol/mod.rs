//! Legacy MongoDB wire protocol scaffolding.
//! - Message header parsing/emission
//! - Streaming reads of OP_QUERY body fields with byte-image retention
//! - OP_REPLY synthesis (query-failure rejections) and decoding

use crate::error::{Error, Result};
use bson::Document;
use bytes::Bytes;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

pub const HEADER_LEN: usize = 16;

/// Upper bound on a single document accepted off the wire. The server caps
/// BSON at 16 MB; the slack covers message envelopes.
pub const MAX_DOCUMENT_LEN: usize = 16 * 1024 * 1024 + 16 * 1024;

// Legacy wire op codes
pub const OP_REPLY: i32 = 1;
pub const OP_UPDATE: i32 = 2001;
pub const OP_INSERT: i32 = 2002;
pub const OP_QUERY: i32 = 2004;
pub const OP_GET_MORE: i32 = 2005;
pub const OP_DELETE: i32 = 2006;
pub const OP_KILL_CURSORS: i32 = 2007;
pub const OP_MSG: i32 = 2013;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpCode {
    Reply,
    Update,
    Insert,
    Query,
    GetMore,
    Delete,
    KillCursors,
    Msg,
    Other(i32),
}

impl OpCode {
    pub fn from_i32(code: i32) -> Self {
        match code {
            OP_REPLY => OpCode::Reply,
            OP_UPDATE => OpCode::Update,
            OP_INSERT => OpCode::Insert,
            OP_QUERY => OpCode::Query,
            OP_GET_MORE => OpCode::GetMore,
            OP_DELETE => OpCode::Delete,
            OP_KILL_CURSORS => OpCode::KillCursors,
            OP_MSG => OpCode::Msg,
            other => OpCode::Other(other),
        }
    }

    /// Whether a request with this op code elicits a reply frame that must be
    /// drained from the upstream back to the client.
    pub fn has_response(self) -> bool {
        matches!(self, OpCode::Query | OpCode::GetMore | OpCode::Msg)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MessageHeader {
    pub message_length: i32,
    pub request_id: i32,
    pub response_to: i32,
    pub op_code: i32,
}

impl MessageHeader {
    pub fn parse(buf: &[u8]) -> Result<Self> {
        if buf.len() < HEADER_LEN {
            return Err(Error::Truncated);
        }
        // Little-endian 32-bit fields
        let message_length = i32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]);
        let request_id = i32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        let response_to = i32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]);
        let op_code = i32::from_le_bytes([buf[12], buf[13], buf[14], buf[15]]);

        if message_length < HEADER_LEN as i32 {
            return Err(Error::MalformedFrame(format!(
                "message_length {message_length} shorter than header"
            )));
        }

        Ok(Self {
            message_length,
            request_id,
            response_to,
            op_code,
        })
    }

    pub fn to_wire(&self) -> [u8; HEADER_LEN] {
        let mut out = [0u8; HEADER_LEN];
        out[0..4].copy_from_slice(&self.message_length.to_le_bytes());
        out[4..8].copy_from_slice(&self.request_id.to_le_bytes());
        out[8..12].copy_from_slice(&self.response_to.to_le_bytes());
        out[12..16].copy_from_slice(&self.op_code.to_le_bytes());
        out
    }

    pub fn op(&self) -> OpCode {
        OpCode::from_i32(self.op_code)
    }

    /// Payload bytes following the header.
    pub fn body_len(&self) -> usize {
        self.message_length as usize - HEADER_LEN
    }
}

fn truncated_on_eof(e: std::io::Error) -> Error {
    if e.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Truncated
    } else {
        Error::Io(e)
    }
}

/// Read one message header. A clean EOF before the first byte is `PeerClosed`;
/// EOF partway through is `Truncated`.
pub async fn read_header<R: AsyncRead + Unpin>(src: &mut R) -> Result<MessageHeader> {
    let mut buf = [0u8; HEADER_LEN];
    let mut filled = 0usize;
    while filled < HEADER_LEN {
        let n = src.read(&mut buf[filled..]).await?;
        if n == 0 {
            return Err(if filled == 0 {
                Error::PeerClosed
            } else {
                Error::Truncated
            });
        }
        filled += n;
    }
    MessageHeader::parse(&buf)
}

/// Fill `buf` from the stream, mapping EOF to `Truncated`.
pub async fn read_exact<R: AsyncRead + Unpin>(src: &mut R, buf: &mut [u8]) -> Result<()> {
    src.read_exact(buf).await.map_err(truncated_on_eof)?;
    Ok(())
}

/// Read a NUL-terminated string, returning the raw bytes including the
/// terminator. `limit` bounds runaway names on a corrupt stream.
pub async fn read_cstring<R: AsyncRead + Unpin>(src: &mut R, limit: usize) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(64);
    loop {
        let b = src.read_u8().await.map_err(truncated_on_eof)?;
        out.push(b);
        if b == 0 {
            return Ok(out);
        }
        if out.len() > limit {
            return Err(Error::MalformedFrame("unterminated cstring".into()));
        }
    }
}

/// A document as read off the wire: the exact byte image plus the parsed,
/// insertion-ordered view. Forwarding always re-emits the image, never a
/// re-serialization of the view.
#[derive(Debug, Clone)]
pub struct RawDocument {
    pub bytes: Bytes,
    pub doc: Document,
}

/// Read one length-prefixed document, retaining its byte image.
pub async fn read_document<R: AsyncRead + Unpin>(src: &mut R) -> Result<RawDocument> {
    let mut len_buf = [0u8; 4];
    src.read_exact(&mut len_buf).await.map_err(truncated_on_eof)?;
    let len = i32::from_le_bytes(len_buf);
    if len < 5 || len as usize > MAX_DOCUMENT_LEN {
        return Err(Error::MalformedDocument(format!(
            "document length {len} out of range"
        )));
    }
    let mut buf = vec![0u8; len as usize];
    buf[0..4].copy_from_slice(&len_buf);
    src.read_exact(&mut buf[4..]).await.map_err(truncated_on_eof)?;
    let doc = parse_document(&buf)?;
    Ok(RawDocument {
        bytes: Bytes::from(buf),
        doc,
    })
}

/// Parse a complete document image into the ordered view.
pub fn parse_document(bytes: &[u8]) -> Result<Document> {
    Document::from_reader(&mut std::io::Cursor::new(bytes))
        .map_err(|e| Error::MalformedDocument(e.to_string()))
}

/// Stream exactly `remaining` payload bytes from `src` to `dst`.
pub async fn copy_exact<R, W>(src: &mut R, dst: &mut W, mut remaining: usize) -> Result<()>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let to_read = remaining.min(buf.len());
        let n = src.read(&mut buf[..to_read]).await?;
        if n == 0 {
            return Err(Error::Truncated);
        }
        dst.write_all(&buf[..n]).await?;
        remaining -= n;
    }
    Ok(())
}

/// Read and discard exactly `remaining` bytes.
pub async fn drain_exact<R: AsyncRead + Unpin>(src: &mut R, mut remaining: usize) -> Result<()> {
    let mut buf = [0u8; 8192];
    while remaining > 0 {
        let to_read = remaining.min(buf.len());
        let n = src.read(&mut buf[..to_read]).await?;
        if n == 0 {
            return Err(Error::Truncated);
        }
        remaining -= n;
    }
    Ok(())
}

/// Copy one complete frame (header plus body) from `src` to `dst`.
/// Returns the copied frame's header.
pub async fn copy_frame<R, W>(src: &mut R, dst: &mut W) -> Result<MessageHeader>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let header = read_header(src).await?;
    dst.write_all(&header.to_wire()).await?;
    copy_exact(src, dst, header.body_len()).await?;
    Ok(header)
}

/// OP_REPLY prelude signalling query failure: response flags, cursor id,
/// starting-from, number-returned. This is a wire constant carried verbatim;
/// it is never rebuilt from typed fields.
pub const QUERY_FAILURE_PRELUDE: [u8; 20] = [
    0, 0, 0, 1, // response flags
    0, 0, 0, 0, 0, 0, 0, 0, // cursor id
    0, 0, 0, 0, // starting from
    0, 0, 0, 1, // number returned
];

/// Error code carried in index-coverage rejection replies.
pub const NO_INDEX_ERROR_CODE: i32 = 17357;

/// Reply-flags bit set by the server when a query could not be run.
pub const REPLY_FLAG_QUERY_FAILURE: u32 = 1 << 1;

/// Encode an OP_REPLY carrying a query-failure error document, addressed to
/// `request`.
pub fn encode_error_reply(request: &MessageHeader, message: &str, code: i32) -> Vec<u8> {
    let error_doc = bson::doc! { "$err": message, "code": code };
    let doc_bytes = bson::to_vec(&error_doc).expect("bson encode");

    let message_length = (HEADER_LEN + QUERY_FAILURE_PRELUDE.len() + doc_bytes.len()) as i32;
    let header = MessageHeader {
        message_length,
        request_id: request.request_id,
        response_to: request.request_id,
        op_code: OP_REPLY,
    };

    let mut out = Vec::with_capacity(message_length as usize);
    out.extend_from_slice(&header.to_wire());
    out.extend_from_slice(&QUERY_FAILURE_PRELUDE);
    out.extend_from_slice(&doc_bytes);
    out
}

/// Encode an OP_QUERY against `full_collection_name` (e.g. "db.system.indexes").
pub fn encode_op_query(
    request_id: i32,
    full_collection_name: &str,
    number_to_return: i32,
    query: &Document,
) -> Vec<u8> {
    let doc_bytes = bson::to_vec(query).expect("bson encode");
    let body_len = 4 + full_collection_name.len() + 1 + 4 + 4 + doc_bytes.len();
    let header = MessageHeader {
        message_length: (HEADER_LEN + body_len) as i32,
        request_id,
        response_to: 0,
        op_code: OP_QUERY,
    };

    let mut out = Vec::with_capacity(HEADER_LEN + body_len);
    out.extend_from_slice(&header.to_wire());
    out.extend_from_slice(&0u32.to_le_bytes()); // flags
    out.extend_from_slice(full_collection_name.as_bytes());
    out.push(0u8);
    out.extend_from_slice(&0i32.to_le_bytes()); // numberToSkip
    out.extend_from_slice(&number_to_return.to_le_bytes());
    out.extend_from_slice(&doc_bytes);
    out
}

#[derive(Debug)]
pub struct ReplyBody {
    pub response_flags: u32,
    pub cursor_id: i64,
    pub documents: Vec<Document>,
}

/// Decode an OP_REPLY body: the 20-byte prelude followed by
/// `number_returned` documents.
pub fn decode_op_reply(body: &[u8]) -> Result<ReplyBody> {
    if body.len() < 20 {
        return Err(Error::MalformedFrame(
            "reply body shorter than prelude".into(),
        ));
    }
    let response_flags = u32::from_le_bytes([body[0], body[1], body[2], body[3]]);
    let cursor_id = i64::from_le_bytes([
        body[4], body[5], body[6], body[7], body[8], body[9], body[10], body[11],
    ]);
    let number_returned = i32::from_le_bytes([body[16], body[17], body[18], body[19]]);

    let mut documents = Vec::new();
    let mut off = 20usize;
    for _ in 0..number_returned {
        if off + 4 > body.len() {
            return Err(Error::MalformedDocument(
                "reply document overruns body".into(),
            ));
        }
        let len =
            i32::from_le_bytes([body[off], body[off + 1], body[off + 2], body[off + 3]]) as usize;
        if len < 5 || off + len > body.len() {
            return Err(Error::MalformedDocument(format!(
                "reply document length {len} out of range"
            )));
        }
        documents.push(parse_document(&body[off..off + len])?);
        off += len;
    }

    Ok(ReplyBody {
        response_flags,
        cursor_id,
        documents,
    })
}
