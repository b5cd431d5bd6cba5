use std::io::{Cursor, Read};

use bitflags::bitflags;
use bson::Document;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use super::{
    header::{Header, OpCode},
    util,
};
use crate::{
    cmap::conn::command::Command,
    compression::{self, Compressor},
    error::{ErrorKind, Result},
};

/// The largest reply the driver will accept before assuming the stream is corrupt. Matches the
/// server's maxMessageSizeBytes default plus the compression envelope.
const MAX_MESSAGE_LENGTH: i32 = 48 * 1024 * 1024 + 16 * 1024;

/// Represents an OP_MSG wire protocol operation.
#[derive(Debug)]
pub(crate) struct Message {
    pub(crate) response_to: i32,
    pub(crate) flags: MessageFlags,
    pub(crate) body: Document,
    pub(crate) document_sequences: Vec<DocumentSequence>,
    pub(crate) checksum: Option<u32>,
    pub(crate) request_id: Option<i32>,
}

/// A payload type 1 section: a batch of documents streamed outside the command body, used for
/// the `documents`, `updates` and `deletes` arrays of write commands.
#[derive(Debug)]
pub(crate) struct DocumentSequence {
    pub(crate) identifier: String,
    pub(crate) documents: Vec<Document>,
}

impl Message {
    /// Creates a `Message` from a given `Command`. The database the command targets is pushed
    /// into the body as `$db` before framing.
    pub(crate) fn from_command(command: Command, request_id: Option<i32>) -> Self {
        let Command {
            target_db,
            mut body,
            document_sequences,
            ..
        } = command;
        body.insert("$db", target_db);

        let document_sequences = document_sequences
            .into_iter()
            .map(|sequence| DocumentSequence {
                identifier: sequence.identifier,
                documents: sequence.documents,
            })
            .collect();

        Self {
            response_to: 0,
            flags: MessageFlags::empty(),
            body,
            document_sequences,
            checksum: None,
            request_id,
        }
    }

    /// Gets this message's reply document. An OP_MSG reply is always a single body section.
    pub(crate) fn single_document_response(self) -> Result<Document> {
        Ok(self.body)
    }

    /// Reads bytes from `reader`, deserializing an OP_MSG reply and transparently removing an
    /// OP_COMPRESSED envelope if one is present.
    pub(crate) async fn read_from<R: AsyncRead + Unpin + Send>(reader: &mut R) -> Result<Self> {
        let header = Header::read_from(reader).await?;

        match header.op_code {
            OpCode::Message => {
                let body = read_message_body(reader, &header).await?;
                Self::from_slice(header.response_to, body.as_slice())
            }
            OpCode::Compressed => {
                let body = read_message_body(reader, &header).await?;
                let uncompressed = decompress_message(body.as_slice(), OpCode::Message)?;
                Self::from_slice(header.response_to, uncompressed.as_slice())
            }
            other => Err(ErrorKind::InvalidResponse {
                message: format!(
                    "expected OP_MSG or OP_COMPRESSED reply, instead got op code {:?}",
                    other
                ),
            }
            .into()),
        }
    }

    /// Parses the portion of an OP_MSG after the header.
    fn from_slice(response_to: i32, slice: &[u8]) -> Result<Self> {
        let total_length = slice.len();
        let mut cursor = Cursor::new(slice);

        let mut flag_bytes = [0u8; 4];
        std::io::Read::read_exact(&mut cursor, &mut flag_bytes)?;
        let flags = MessageFlags::from_bits_truncate(u32::from_le_bytes(flag_bytes));

        let trailing = if flags.contains(MessageFlags::CHECKSUM_PRESENT) {
            std::mem::size_of::<u32>()
        } else {
            0
        };

        let mut body: Option<Document> = None;
        let mut document_sequences = Vec::new();

        while (cursor.position() as usize) < total_length - trailing {
            let mut payload_type = [0u8; 1];
            std::io::Read::read_exact(&mut cursor, &mut payload_type)?;

            match payload_type[0] {
                0 => {
                    let remaining = total_length - trailing - cursor.position() as usize;
                    let document = util::read_document(&mut cursor, remaining)?;
                    if body.replace(document).is_some() {
                        return Err(ErrorKind::InvalidResponse {
                            message: "OP_MSG reply contained multiple body sections".to_string(),
                        }
                        .into());
                    }
                }
                1 => {
                    document_sequences.push(read_document_sequence(&mut cursor)?);
                }
                other => {
                    return Err(ErrorKind::InvalidResponse {
                        message: format!("invalid OP_MSG payload type: {}", other),
                    }
                    .into())
                }
            }
        }

        if cursor.position() as usize != total_length - trailing {
            return Err(ErrorKind::InvalidResponse {
                message: format!(
                    "The server indicated that the reply would be {} bytes long, but it instead \
                     was {}",
                    total_length,
                    cursor.position() as usize + trailing,
                ),
            }
            .into());
        }

        let checksum = if trailing > 0 {
            let mut checksum_bytes = [0u8; 4];
            std::io::Read::read_exact(&mut cursor, &mut checksum_bytes)?;
            Some(u32::from_le_bytes(checksum_bytes))
        } else {
            None
        };

        Ok(Self {
            response_to,
            flags,
            body: body.ok_or_else(|| ErrorKind::InvalidResponse {
                message: "no body section in OP_MSG reply".to_string(),
            })?,
            document_sequences,
            checksum,
            request_id: None,
        })
    }

    /// Serializes the flags and sections of this message (everything after the header).
    fn body_bytes(&self) -> Result<Vec<u8>> {
        let mut bytes = Vec::new();
        bytes.extend_from_slice(&self.flags.bits().to_le_bytes());

        // Payload type 0: the single body document.
        bytes.push(0);
        self.body.to_writer(&mut bytes)?;

        for sequence in &self.document_sequences {
            bytes.push(1);

            let mut section = Vec::new();
            util::write_cstring(&mut section, &sequence.identifier)?;
            for document in &sequence.documents {
                document.to_writer(&mut section)?;
            }

            let size = section.len() + std::mem::size_of::<i32>();
            bytes.extend_from_slice(&(size as i32).to_le_bytes());
            bytes.extend_from_slice(&section);
        }

        if let Some(checksum) = self.checksum {
            bytes.extend_from_slice(&checksum.to_le_bytes());
        }

        Ok(bytes)
    }

    /// Serializes the Message to bytes and writes them to `writer`, returning the request id
    /// used.
    pub(crate) async fn write_to<W: AsyncWrite + Unpin>(&self, writer: &mut W) -> Result<i32> {
        let body = self.body_bytes()?;
        let request_id = self.request_id.unwrap_or_else(util::next_request_id);

        let header = Header {
            length: (Header::LENGTH + body.len()) as i32,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Message,
        };

        header.write_to(writer).await?;
        writer.write_all(&body).await?;
        writer.flush().await?;

        Ok(request_id)
    }

    /// Serializes the Message, wraps it in an OP_COMPRESSED envelope using the given compressor,
    /// and writes it to `writer`, returning the request id used.
    pub(crate) async fn write_compressed_to<W: AsyncWrite + Unpin>(
        &self,
        writer: &mut W,
        compressor: &Compressor,
    ) -> Result<i32> {
        let body = self.body_bytes()?;
        let compressed = compressor.compress(body.as_slice())?;
        let request_id = self.request_id.unwrap_or_else(util::next_request_id);

        // OP_COMPRESSED: originalOpcode (i32), uncompressedSize (i32), compressorId (u8).
        let envelope_length = Header::LENGTH + 4 + 4 + 1 + compressed.len();

        let header = Header {
            length: envelope_length as i32,
            request_id,
            response_to: self.response_to,
            op_code: OpCode::Compressed,
        };

        header.write_to(writer).await?;
        writer
            .write_all(&(OpCode::Message as i32).to_le_bytes())
            .await?;
        writer.write_all(&(body.len() as i32).to_le_bytes()).await?;
        writer.write_all(&[compressor.id() as u8]).await?;
        writer.write_all(&compressed).await?;
        writer.flush().await?;

        Ok(request_id)
    }
}

/// Reads the remainder of a wire message (everything after the header) into a buffer.
pub(super) async fn read_message_body<R: AsyncRead + Unpin + Send>(
    reader: &mut R,
    header: &Header,
) -> Result<Vec<u8>> {
    if header.length < Header::LENGTH as i32 || header.length > MAX_MESSAGE_LENGTH {
        return Err(ErrorKind::InvalidResponse {
            message: format!("invalid wire message length: {}", header.length),
        }
        .into());
    }

    let mut body = vec![0u8; header.length as usize - Header::LENGTH];
    reader.read_exact(&mut body).await?;
    Ok(body)
}

/// Unwraps an OP_COMPRESSED payload, verifying that the envelope describes a message of the
/// expected op code and advertised uncompressed size.
pub(super) fn decompress_message(slice: &[u8], expected_op_code: OpCode) -> Result<Vec<u8>> {
    if slice.len() < 9 {
        return Err(ErrorKind::InvalidResponse {
            message: "OP_COMPRESSED reply too short".to_string(),
        }
        .into());
    }

    let original_op_code = i32::from_le_bytes(slice[0..4].try_into().unwrap());
    let uncompressed_size = i32::from_le_bytes(slice[4..8].try_into().unwrap());
    let compressor_id = slice[8];

    if OpCode::from_i32(original_op_code)? != expected_op_code {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "OP_COMPRESSED envelope contained unexpected op code {}",
                original_op_code
            ),
        }
        .into());
    }

    let uncompressed = compression::decompress(compressor_id, &slice[9..])?;

    if uncompressed.len() != uncompressed_size as usize {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "uncompressed message was {} bytes, but the envelope advertised {}",
                uncompressed.len(),
                uncompressed_size
            ),
        }
        .into());
    }

    Ok(uncompressed)
}

fn read_document_sequence(cursor: &mut Cursor<&[u8]>) -> Result<DocumentSequence> {
    let mut size_bytes = [0u8; 4];
    std::io::Read::read_exact(cursor, &mut size_bytes)?;
    let size = i32::from_le_bytes(size_bytes) as usize;

    let section_end = cursor.position() as usize + size - std::mem::size_of::<i32>();
    let identifier = util::read_cstring(cursor)?;

    let mut documents = Vec::new();
    while (cursor.position() as usize) < section_end {
        let remaining = section_end - cursor.position() as usize;
        documents.push(util::read_document(cursor, remaining)?);
    }

    if cursor.position() as usize != section_end {
        return Err(ErrorKind::InvalidResponse {
            message: format!(
                "document sequence advertised {} bytes but its documents overran the section",
                size
            ),
        }
        .into());
    }

    Ok(DocumentSequence {
        identifier,
        documents,
    })
}

bitflags! {
    /// Represents the bitwise flags for an OP_MSG as defined in the spec.
    pub(crate) struct MessageFlags: u32 {
        const CHECKSUM_PRESENT = 0b_0000_0000_0000_0000_0000_0000_0000_0001;
        const MORE_TO_COME     = 0b_0000_0000_0000_0000_0000_0000_0000_0010;
        const EXHAUST_ALLOWED  = 0b_0000_0000_0000_0001_0000_0000_0000_0000;
    }
}

#[cfg(test)]
mod test {
    use bson::doc;

    use super::*;

    fn example_message() -> Message {
        Message {
            response_to: 0,
            flags: MessageFlags::empty(),
            body: doc! { "insert": "coll", "$db": "test" },
            document_sequences: vec![DocumentSequence {
                identifier: "documents".to_string(),
                documents: vec![doc! { "_id": 1 }, doc! { "_id": 2 }],
            }],
            checksum: None,
            request_id: Some(42),
        }
    }

    #[tokio::test]
    async fn op_msg_roundtrip() {
        let message = example_message();
        let mut buffer = Vec::new();
        let request_id = message.write_to(&mut buffer).await.unwrap();
        assert_eq!(request_id, 42);

        let mut cursor = std::io::Cursor::new(buffer);
        let parsed = Message::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed.body.get_str("insert").unwrap(), "coll");
    }

    #[tokio::test]
    async fn op_compressed_roundtrip() {
        let message = example_message();
        let mut buffer = Vec::new();
        let compressor = Compressor::Zlib { level: Some(9) };
        let request_id = message
            .write_compressed_to(&mut buffer, &compressor)
            .await
            .unwrap();
        assert_eq!(request_id, 42);

        let mut cursor = std::io::Cursor::new(buffer);
        let parsed = Message::read_from(&mut cursor).await.unwrap();
        assert_eq!(parsed.body.get_str("insert").unwrap(), "coll");
    }

    #[tokio::test]
    async fn sequences_serialized_as_payload_type_one() {
        let message = example_message();
        let body = message.body_bytes().unwrap();

        // The body document section comes first; a payload type 1 byte must appear after it.
        let body_doc_len = {
            let mut bytes = Vec::new();
            message.body.to_writer(&mut bytes).unwrap();
            bytes.len()
        };
        assert_eq!(body[4], 0);
        assert_eq!(body[4 + 1 + body_doc_len], 1);
    }

    #[tokio::test]
    async fn mismatched_advertised_length_is_a_framing_error() {
        let message = example_message();
        let mut buffer = Vec::new();
        message.write_to(&mut buffer).await.unwrap();

        // Lie about the total length.
        let truncated_len = (buffer.len() as i32 - 3).to_le_bytes();
        buffer[..4].copy_from_slice(&truncated_len);

        let mut cursor = std::io::Cursor::new(buffer);
        let error = Message::read_from(&mut cursor).await.unwrap_err();
        assert!(matches!(
            error.kind.as_ref(),
            crate::error::ErrorKind::InvalidResponse { .. }
                | crate::error::ErrorKind::Io(_)
        ));
    }
}
