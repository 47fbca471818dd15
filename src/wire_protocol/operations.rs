//! Wire protocol operational client-server communication logic.
use crate::error::Error::{ArgumentError, ResponseError};
use crate::error::Result;
use crate::wire_protocol::flags::{OpQueryFlags, OpReplyFlags};
use crate::wire_protocol::header::{Header, OpCode};

use bson::{self, Document};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use std::io::{Read, Write};
use std::mem;

trait ByteLength {
    /// Calculates the number of bytes in the serialized version of the struct.
    fn byte_length(&self) -> Result<i32>;
}

impl ByteLength for Document {
    fn byte_length(&self) -> Result<i32> {
        let mut temp_buffer = vec![];
        bson::encode_document(&mut temp_buffer, self)?;
        Ok(temp_buffer.len() as i32)
    }
}

/// Represents a message in the MongoDB Wire Protocol.
pub enum Message {
    OpReply {
        /// The message header.
        header: Header,
        /// A bit vector of reply options.
        flags: OpReplyFlags,
        /// Uniquely identifies the cursor being returned.
        cursor_id: i64,
        /// The starting position for the cursor.
        starting_from: i32,
        /// The total number of documents being returned.
        number_returned: i32,
        /// The documents being returned.
        documents: Vec<Document>,
    },
    OpQuery {
        /// The message header.
        header: Header,
        /// A bit vector of query options.
        flags: OpQueryFlags,
        /// The full qualified name of the collection, beginning with the
        /// database name and a dot separator.
        namespace: String,
        /// The number of initial documents to skip over in the query results.
        number_to_skip: i32,
        /// The total number of documents that should be returned by the query.
        number_to_return: i32,
        /// Specifies which documents to return.
        query: Document,
        /// An optional projection of which fields should be present in the
        /// documents to be returned by the query.
        return_field_selector: Option<Document>,
    },
    OpGetMore {
        /// The message header.
        header: Header,
        // The wire protocol specifies that a 32-bit 0 field goes here
        /// The full qualified name of the collection, beginning with the
        /// database name and a dot separator.
        namespace: String,
        /// The total number of documents that should be returned by the query.
        number_to_return: i32,
        /// Uniquely identifies the cursor being continued.
        cursor_id: i64,
    },
    OpKillCursors {
        /// The message header.
        header: Header,
        // The wire protocol specifies that a 32-bit 0 field goes here
        /// The server-side cursors to discard.
        cursor_ids: Vec<i64>,
    },
}

impl Message {
    /// Constructs a new message for a reply.
    fn new_reply(
        header: Header,
        flags: i32,
        cursor_id: i64,
        starting_from: i32,
        number_returned: i32,
        documents: Vec<Document>,
    ) -> Message {
        Message::OpReply {
            header,
            flags: OpReplyFlags::from_bits_truncate(flags),
            cursor_id,
            starting_from,
            number_returned,
            documents,
        }
    }

    /// Constructs a new message request for a query.
    pub fn new_query(
        request_id: i32,
        flags: OpQueryFlags,
        namespace: String,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
        return_field_selector: Option<Document>,
    ) -> Result<Message> {
        let header_length = mem::size_of::<Header>() as i32;

        // There are three i32 fields in an OpQuery, since OpQueryFlags is
        // represented as a 32-bit vector in the wire protocol.
        let i32_length = 3 * mem::size_of::<i32>() as i32;

        // Add an extra byte after the string for null-termination.
        let string_length = namespace.len() as i32 + 1;

        let bson_length = query.byte_length()?;

        // Add the length of the optional BSON document only if it exists.
        let option_length = match return_field_selector {
            Some(ref bson) => bson.byte_length()?,
            None => 0,
        };

        let total_length = header_length + i32_length + string_length + bson_length + option_length;

        let header = Header::new_query(total_length, request_id);

        Ok(Message::OpQuery {
            header,
            flags,
            namespace,
            number_to_skip,
            number_to_return,
            query,
            return_field_selector,
        })
    }

    /// Constructs a new "get more" request message.
    pub fn new_get_more(
        request_id: i32,
        namespace: String,
        number_to_return: i32,
        cursor_id: i64,
    ) -> Message {
        let header_length = mem::size_of::<Header>() as i32;

        // There are two i32 fields because of the reserved "ZERO".
        let i32_length = 2 * mem::size_of::<i32>() as i32;

        // Add an extra byte after the string for null-termination.
        let string_length = namespace.len() as i32 + 1;

        let i64_length = mem::size_of::<i64>() as i32;
        let total_length = header_length + i32_length + string_length + i64_length;

        let header = Header::new_get_more(total_length, request_id);

        Message::OpGetMore {
            header,
            namespace,
            number_to_return,
            cursor_id,
        }
    }

    /// Constructs a new "kill cursors" request message.
    pub fn new_kill_cursors(request_id: i32, cursor_ids: Vec<i64>) -> Message {
        let header_length = mem::size_of::<Header>() as i32;

        // The reserved "ZERO" and the number of cursor ids.
        let i32_length = 2 * mem::size_of::<i32>() as i32;
        let ids_length = (cursor_ids.len() * mem::size_of::<i64>()) as i32;
        let total_length = header_length + i32_length + ids_length;

        let header = Header::new_kill_cursors(total_length, request_id);

        Message::OpKillCursors { header, cursor_ids }
    }

    /// Writes a serialized BSON document to a given buffer.
    fn write_bson_document<W: Write>(buffer: &mut W, bson: &Document) -> Result<()> {
        let mut temp_buffer = vec![];
        bson::encode_document(&mut temp_buffer, bson)?;
        buffer.write_all(&temp_buffer)?;
        Ok(())
    }

    /// Writes a serialized query message to a given buffer.
    fn write_query<W: Write>(
        buffer: &mut W,
        header: &Header,
        flags: OpQueryFlags,
        namespace: &str,
        number_to_skip: i32,
        number_to_return: i32,
        query: &Document,
        return_field_selector: &Option<Document>,
    ) -> Result<()> {
        header.write(buffer)?;
        buffer.write_i32::<LittleEndian>(flags.bits())?;

        for byte in namespace.bytes() {
            buffer.write_u8(byte)?;
        }

        // Writes the null terminator for the collection name string.
        buffer.write_u8(0)?;

        buffer.write_i32::<LittleEndian>(number_to_skip)?;
        buffer.write_i32::<LittleEndian>(number_to_return)?;
        Message::write_bson_document(buffer, query)?;

        if let Some(ref doc) = *return_field_selector {
            Message::write_bson_document(buffer, doc)?;
        }

        buffer.flush()?;
        Ok(())
    }

    /// Writes a serialized "get more" request to a given buffer.
    fn write_get_more<W: Write>(
        buffer: &mut W,
        header: &Header,
        namespace: &str,
        number_to_return: i32,
        cursor_id: i64,
    ) -> Result<()> {
        header.write(buffer)?;

        // Write ZERO field
        buffer.write_i32::<LittleEndian>(0)?;

        for byte in namespace.bytes() {
            buffer.write_u8(byte)?;
        }

        // Writes the null terminator for the collection name string.
        buffer.write_u8(0)?;

        buffer.write_i32::<LittleEndian>(number_to_return)?;
        buffer.write_i64::<LittleEndian>(cursor_id)?;

        buffer.flush()?;
        Ok(())
    }

    /// Writes a serialized "kill cursors" request to a given buffer.
    fn write_kill_cursors<W: Write>(
        buffer: &mut W,
        header: &Header,
        cursor_ids: &[i64],
    ) -> Result<()> {
        header.write(buffer)?;

        // Write ZERO field
        buffer.write_i32::<LittleEndian>(0)?;

        buffer.write_i32::<LittleEndian>(cursor_ids.len() as i32)?;
        for cursor_id in cursor_ids {
            buffer.write_i64::<LittleEndian>(*cursor_id)?;
        }

        buffer.flush()?;
        Ok(())
    }

    /// Attempts to write the serialized message to a buffer.
    pub fn write<W: Write>(&self, buffer: &mut W) -> Result<()> {
        match *self {
            // Only the server should send replies
            Message::OpReply { .. } => Err(ArgumentError(String::from(
                "OP_REPLY should not be sent to the client.",
            ))),
            Message::OpQuery {
                ref header,
                flags,
                ref namespace,
                number_to_skip,
                number_to_return,
                ref query,
                ref return_field_selector,
            } => Message::write_query(
                buffer,
                header,
                flags,
                namespace,
                number_to_skip,
                number_to_return,
                query,
                return_field_selector,
            ),
            Message::OpGetMore {
                ref header,
                ref namespace,
                number_to_return,
                cursor_id,
            } => Message::write_get_more(buffer, header, namespace, number_to_return, cursor_id),
            Message::OpKillCursors {
                ref header,
                ref cursor_ids,
            } => Message::write_kill_cursors(buffer, header, cursor_ids),
        }
    }

    /// Reads a serialized reply message from a buffer.
    fn read_reply<R: Read>(buffer: &mut R, header: Header) -> Result<Message> {
        let mut length = header.message_length - mem::size_of::<Header>() as i32;

        // Read flags
        let flags = buffer.read_i32::<LittleEndian>()?;
        length -= mem::size_of::<i32>() as i32;

        // Read cursor_id
        let cursor_id = buffer.read_i64::<LittleEndian>()?;
        length -= mem::size_of::<i64>() as i32;

        // Read starting_from
        let starting_from = buffer.read_i32::<LittleEndian>()?;
        length -= mem::size_of::<i32>() as i32;

        // Read number_returned
        let number_returned = buffer.read_i32::<LittleEndian>()?;
        length -= mem::size_of::<i32>() as i32;

        let mut documents = vec![];

        while length > 0 {
            let bson = bson::decode_document(buffer)?;
            length -= bson.byte_length()?;
            documents.push(bson);
        }

        Ok(Message::new_reply(
            header,
            flags,
            cursor_id,
            starting_from,
            number_returned,
            documents,
        ))
    }

    /// Attempts to read a serialized reply Message from a buffer.
    pub fn read<R: Read>(buffer: &mut R) -> Result<Message> {
        let header = Header::read(buffer)?;
        match header.op_code {
            OpCode::Reply => Message::read_reply(buffer, header),
            opcode => Err(ResponseError(format!(
                "Expected to read OpCode::Reply but instead found opcode {}",
                opcode
            ))),
        }
    }
}
