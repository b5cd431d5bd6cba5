use std::io::Cursor;

use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    message::{decompress_message, read_message_body},
    util,
};
use crate::error::{CommandError, ErrorKind, Result};

bitflags! {
    /// The bitwise flags of an OP_QUERY message.
    pub(crate) struct QueryFlags: i32 {
        const TAILABLE_CURSOR   = 0b_0000_0010;
        const SECONDARY_OK      = 0b_0000_0100;
        const NO_CURSOR_TIMEOUT = 0b_0001_0000;
        const AWAIT_DATA        = 0b_0010_0000;
        const EXHAUST           = 0b_0100_0000;
        const PARTIAL           = 0b_1000_0000;
    }
}

bitflags! {
    /// The bitwise flags of an OP_REPLY message.
    pub(crate) struct ReplyFlags: i32 {
        const CURSOR_NOT_FOUND   = 0b_0001;
        const QUERY_FAILURE      = 0b_0010;
        const SHARD_CONFIG_STALE = 0b_0100;
        const AWAIT_CAPABLE      = 0b_1000;
    }
}

bitflags! {
    /// The bitwise flags of an OP_INSERT message.
    pub(crate) struct InsertFlags: i32 {
        const CONTINUE_ON_ERROR = 0b_0001;
    }
}

bitflags! {
    /// The bitwise flags of an OP_UPDATE message.
    pub(crate) struct UpdateFlags: i32 {
        const UPSERT       = 0b_0001;
        const MULTI_UPDATE = 0b_0010;
    }
}

bitflags! {
    /// The bitwise flags of an OP_DELETE message.
    pub(crate) struct DeleteFlags: i32 {
        const SINGLE_REMOVE = 0b_0001;
    }
}

/// Serializes the trailing portion of a legacy message and writes the whole message out with a
/// fresh request id, which is returned.
async fn write_legacy<W: AsyncWrite + Unpin>(
    writer: &mut W,
    op_code: OpCode,
    request_id: Option<i32>,
    body: Vec<u8>,
) -> Result<i32> {
    let request_id = request_id.unwrap_or_else(util::next_request_id);

    let header = Header {
        length: (Header::LENGTH + body.len()) as i32,
        request_id,
        response_to: 0,
        op_code,
    };

    header.write_to(writer).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;

    Ok(request_id)
}

/// An OP_QUERY message. Commands are sent as queries against the `$cmd` pseudo-collection on
/// servers that predate OP_MSG.
#[derive(Debug)]
pub(crate) struct Query {
    pub(crate) flags: QueryFlags,
    pub(crate) full_collection_name: String,
    pub(crate) number_to_skip: i32,
    pub(crate) number_to_return: i32,
    pub(crate) query: Document,
    pub(crate) return_field_selector: Option<Document>,
    pub(crate) request_id: Option<i32>,
}

impl Query {
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<i32> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        util::write_cstring(&mut body, &self.full_collection_name)?;
        body.extend_from_slice(&self.number_to_skip.to_le_bytes());
        body.extend_from_slice(&self.number_to_return.to_le_bytes());
        self.query.to_writer(&mut body)?;
        if let Some(ref selector) = self.return_field_selector {
            selector.to_writer(&mut body)?;
        }

        write_legacy(writer, OpCode::Query, self.request_id, body).await
    }
}

/// An OP_GET_MORE message.
#[derive(Debug)]
pub(crate) struct GetMore {
    pub(crate) full_collection_name: String,
    pub(crate) number_to_return: i32,
    pub(crate) cursor_id: i64,
}

impl GetMore {
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<i32> {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        util::write_cstring(&mut body, &self.full_collection_name)?;
        body.extend_from_slice(&self.number_to_return.to_le_bytes());
        body.extend_from_slice(&self.cursor_id.to_le_bytes());

        write_legacy(writer, OpCode::GetMore, None, body).await
    }
}

/// An OP_KILL_CURSORS message. The server sends no reply.
#[derive(Debug)]
pub(crate) struct KillCursors {
    pub(crate) cursor_ids: Vec<i64>,
}

impl KillCursors {
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<i32> {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&(self.cursor_ids.len() as i32).to_le_bytes());
        for id in &self.cursor_ids {
            body.extend_from_slice(&id.to_le_bytes());
        }

        write_legacy(writer, OpCode::KillCursors, None, body).await
    }
}

/// An OP_INSERT message. The server sends no reply; acknowledgment requires a trailing
/// getLastError query on the same socket.
#[derive(Debug)]
pub(crate) struct Insert {
    pub(crate) flags: InsertFlags,
    pub(crate) full_collection_name: String,
    pub(crate) documents: Vec<Document>,
}

impl Insert {
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<i32> {
        let mut body = Vec::new();
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        util::write_cstring(&mut body, &self.full_collection_name)?;
        for document in &self.documents {
            document.to_writer(&mut body)?;
        }

        write_legacy(writer, OpCode::Insert, None, body).await
    }
}

/// An OP_UPDATE message.
#[derive(Debug)]
pub(crate) struct Update {
    pub(crate) full_collection_name: String,
    pub(crate) flags: UpdateFlags,
    pub(crate) selector: Document,
    pub(crate) update: Document,
}

impl Update {
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<i32> {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        util::write_cstring(&mut body, &self.full_collection_name)?;
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        self.selector.to_writer(&mut body)?;
        self.update.to_writer(&mut body)?;

        write_legacy(writer, OpCode::Update, None, body).await
    }
}

/// An OP_DELETE message.
#[derive(Debug)]
pub(crate) struct Delete {
    pub(crate) full_collection_name: String,
    pub(crate) flags: DeleteFlags,
    pub(crate) selector: Document,
}

impl Delete {
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<i32> {
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        util::write_cstring(&mut body, &self.full_collection_name)?;
        body.extend_from_slice(&self.flags.bits().to_le_bytes());
        self.selector.to_writer(&mut body)?;

        write_legacy(writer, OpCode::Delete, None, body).await
    }
}

/// An OP_REPLY message.
#[derive(Debug)]
pub(crate) struct Reply {
    pub(crate) response_to: i32,
    pub(crate) flags: ReplyFlags,
    pub(crate) cursor_id: i64,
    pub(crate) starting_from: i32,
    pub(crate) number_returned: i32,
    pub(crate) documents: Vec<Document>,
}

impl Reply {
    /// Reads bytes from `reader`, deserializing an OP_REPLY and transparently removing an
    /// OP_COMPRESSED envelope if one is present.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;

        match header.op_code {
            OpCode::Reply => {
                let body = read_message_body(reader, &header).await?;
                Self::from_slice(header.response_to, body.as_slice())
            }
            OpCode::Compressed => {
                let body = read_message_body(reader, &header).await?;
                let uncompressed = decompress_message(body.as_slice(), OpCode::Reply)?;
                Self::from_slice(header.response_to, uncompressed.as_slice())
            }
            other => Err(ErrorKind::InvalidResponse {
                message: format!(
                    "expected OP_REPLY or OP_COMPRESSED reply, instead got op code {:?}",
                    other
                ),
            }
            .into()),
        }
    }

    fn from_slice(response_to: i32, slice: &[u8]) -> Result<Self> {
        if slice.len() < 20 {
            return Err(ErrorKind::InvalidResponse {
                message: "OP_REPLY too short".to_string(),
            }
            .into());
        }

        let flags = ReplyFlags::from_bits_truncate(i32::from_le_bytes(
            slice[0..4].try_into().unwrap(),
        ));
        let cursor_id = i64::from_le_bytes(slice[4..12].try_into().unwrap());
        let starting_from = i32::from_le_bytes(slice[12..16].try_into().unwrap());
        let number_returned = i32::from_le_bytes(slice[16..20].try_into().unwrap());

        let mut cursor = Cursor::new(&slice[20..]);
        let mut documents = Vec::new();
        while (cursor.position() as usize) < slice.len() - 20 {
            let remaining = slice.len() - 20 - cursor.position() as usize;
            documents.push(util::read_document(&mut cursor, remaining)?);
        }

        if documents.len() != number_returned as usize {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "OP_REPLY advertised {} documents but contained {}",
                    number_returned,
                    documents.len()
                ),
            }
            .into());
        }

        Ok(Self {
            response_to,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        })
    }

    /// Extracts the command response document from a reply to a `$cmd` query, converting a
    /// QueryFailure flag into the equivalent command error.
    pub(crate) fn into_command_response(mut self) -> Result<Document> {
        if self.flags.contains(ReplyFlags::QUERY_FAILURE) {
            let error_doc = self.documents.pop().unwrap_or_default();
            let code = error_doc
                .get("code")
                .and_then(crate::bson_util::get_int)
                .unwrap_or(0);
            let message = error_doc
                .get_str("$err")
                .unwrap_or("query failure")
                .to_string();

            return Err(ErrorKind::Command(CommandError {
                code: code as i32,
                code_name: String::new(),
                message,
            })
            .into());
        }

        self.documents.pop().ok_or_else(|| {
            ErrorKind::InvalidResponse {
                message: "no response document received from server".to_string(),
            }
            .into()
        })
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    fn encoded_doc_len(doc: &Document) -> usize {
        let mut bytes = Vec::new();
        doc.to_writer(&mut bytes).unwrap();
        bytes.len()
    }

    #[tokio::test]
    async fn op_query_layout() {
        let query = Query {
            flags: QueryFlags::SECONDARY_OK,
            full_collection_name: "admin.$cmd".to_string(),
            number_to_skip: 0,
            number_to_return: -1,
            query: doc! { "isMaster": 1 },
            return_field_selector: None,
            request_id: Some(7),
        };

        let mut buffer = Vec::new();
        let request_id = query.write_to(&mut buffer).await.unwrap();
        assert_eq!(request_id, 7);

        let expected_len =
            Header::LENGTH + 4 + "admin.$cmd".len() + 1 + 4 + 4 + encoded_doc_len(&query.query);
        assert_eq!(buffer.len(), expected_len);

        // Header fields are little-endian: length, request id, response_to, op code.
        assert_eq!(
            i32::from_le_bytes(buffer[0..4].try_into().unwrap()),
            expected_len as i32
        );
        assert_eq!(i32::from_le_bytes(buffer[4..8].try_into().unwrap()), 7);
        assert_eq!(i32::from_le_bytes(buffer[12..16].try_into().unwrap()), 2004);
        // Flags follow the header.
        assert_eq!(
            i32::from_le_bytes(buffer[16..20].try_into().unwrap()),
            QueryFlags::SECONDARY_OK.bits()
        );
    }

    #[tokio::test]
    async fn op_kill_cursors_layout() {
        let kill = KillCursors {
            cursor_ids: vec![42, 43],
        };
        let mut buffer = Vec::new();
        kill.write_to(&mut buffer).await.unwrap();

        assert_eq!(
            i32::from_le_bytes(buffer[12..16].try_into().unwrap()),
            2007
        );
        // ZERO, then the cursor count.
        assert_eq!(i32::from_le_bytes(buffer[16..20].try_into().unwrap()), 0);
        assert_eq!(i32::from_le_bytes(buffer[20..24].try_into().unwrap()), 2);
        assert_eq!(i64::from_le_bytes(buffer[24..32].try_into().unwrap()), 42);
    }

    #[tokio::test]
    async fn op_reply_roundtrip() {
        let response = doc! { "ok": 1, "ismaster": true };
        let mut body = Vec::new();
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&1i32.to_le_bytes());
        response.to_writer(&mut body).unwrap();

        let mut buffer = Vec::new();
        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id: 1,
            response_to: 7,
            op_code: OpCode::Reply,
        };
        header.write_to(&mut buffer).await.unwrap();
        buffer.extend_from_slice(&body);

        let mut cursor = Cursor::new(buffer);
        let reply = Reply::read_from(&mut cursor).await.unwrap();
        assert_eq!(reply.response_to, 7);
        assert_eq!(reply.into_command_response().unwrap(), response);
    }

    #[tokio::test]
    async fn query_failure_becomes_command_error() {
        let error_doc = doc! { "$err": "not authorized", "code": 13 };
        let mut body = Vec::new();
        body.extend_from_slice(&ReplyFlags::QUERY_FAILURE.bits().to_le_bytes());
        body.extend_from_slice(&0i64.to_le_bytes());
        body.extend_from_slice(&0i32.to_le_bytes());
        body.extend_from_slice(&1i32.to_le_bytes());
        error_doc.to_writer(&mut body).unwrap();

        let mut buffer = Vec::new();
        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id: 1,
            response_to: 9,
            op_code: OpCode::Reply,
        };
        header.write_to(&mut buffer).await.unwrap();
        buffer.extend_from_slice(&body);

        let mut cursor = Cursor::new(buffer);
        let reply = Reply::read_from(&mut cursor).await.unwrap();
        let error = reply.into_command_response().unwrap_err();
        match error.kind.as_ref() {
            ErrorKind::Command(e) => {
                assert_eq!(e.code, 13);
                assert_eq!(e.message, "not authorized");
            }
            other => panic!("unexpected error kind: {:?}", other),
        }
    }
}
