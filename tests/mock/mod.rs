//! An in-process server speaking enough of the wire protocol to script
//! cursor conversations and record what the driver sends.
use bson::{bson, doc, Document};
use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};

use std::collections::VecDeque;
use std::io::{self, Read, Write};
use std::net::{TcpListener, TcpStream};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

/// A scripted OP_REPLY for the next non-isMaster request.
#[derive(Clone, Debug)]
pub struct CannedReply {
    pub cursor_id: i64,
    pub flags: i32,
    pub documents: Vec<Document>,
}

/// Every non-isMaster operation the server received, in arrival order.
/// `conn_id` identifies the physical connection the operation arrived on.
#[derive(Clone, Debug)]
pub enum LoggedOp {
    Query {
        conn_id: usize,
        namespace: String,
        flags: i32,
        number_to_skip: i32,
        number_to_return: i32,
        query: Document,
    },
    GetMore {
        conn_id: usize,
        namespace: String,
        number_to_return: i32,
        cursor_id: i64,
    },
    KillCursors {
        conn_id: usize,
        cursor_ids: Vec<i64>,
    },
}

struct State {
    ismaster: Mutex<Document>,
    replies: Mutex<VecDeque<CannedReply>>,
    log: Mutex<Vec<LoggedOp>>,
    conn_counter: AtomicUsize,
}

pub struct MockServer {
    pub port: u16,
    state: Arc<State>,
}

impl MockServer {
    /// Starts a server that answers isMaster as a standalone mongod.
    pub fn standalone() -> MockServer {
        MockServer::with_ismaster(doc! { "ok": 1.0, "ismaster": true })
    }

    /// Starts a server answering isMaster with the given document.
    pub fn with_ismaster(ismaster: Document) -> MockServer {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();

        let state = Arc::new(State {
            ismaster: Mutex::new(ismaster),
            replies: Mutex::new(VecDeque::new()),
            log: Mutex::new(Vec::new()),
            conn_counter: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        thread::spawn(move || {
            for stream in listener.incoming() {
                match stream {
                    Ok(stream) => {
                        let state = accept_state.clone();
                        let conn_id = state.conn_counter.fetch_add(1, Ordering::SeqCst);
                        thread::spawn(move || handle_connection(stream, state, conn_id));
                    }
                    Err(_) => break,
                }
            }
        });

        MockServer { port, state }
    }

    pub fn address(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Replaces the isMaster response, e.g. to change advertised roles.
    pub fn set_ismaster(&self, ismaster: Document) {
        *self.state.ismaster.lock().unwrap() = ismaster;
    }

    /// Queues a reply for the next non-isMaster query or get-more. When
    /// the queue is empty, requests get `{ok: 1}` with cursor id 0.
    pub fn push_reply(&self, cursor_id: i64, flags: i32, documents: Vec<Document>) {
        self.state.replies.lock().unwrap().push_back(CannedReply {
            cursor_id,
            flags,
            documents,
        });
    }

    pub fn ops(&self) -> Vec<LoggedOp> {
        self.state.log.lock().unwrap().clone()
    }

    pub fn clear_ops(&self) {
        self.state.log.lock().unwrap().clear();
    }

    /// Waits until at least `count` operations have arrived, returning
    /// them. Panics after a couple of seconds; fire-and-forget operations
    /// like kill-cursors land asynchronously.
    pub fn wait_for_ops(&self, count: usize) -> Vec<LoggedOp> {
        let deadline = Instant::now() + Duration::from_secs(2);
        loop {
            let ops = self.ops();
            if ops.len() >= count {
                return ops;
            }
            if Instant::now() > deadline {
                panic!("expected {} ops, server saw {:?}", count, ops);
            }
            thread::sleep(Duration::from_millis(10));
        }
    }
}

fn default_reply() -> CannedReply {
    CannedReply {
        cursor_id: 0,
        flags: 0,
        documents: vec![doc! { "ok": 1.0 }],
    }
}

fn read_cstring(cursor: &mut io::Cursor<Vec<u8>>) -> String {
    let mut bytes = vec![];
    loop {
        let mut byte = [0u8; 1];
        cursor.read_exact(&mut byte).unwrap();
        if byte[0] == 0 {
            break;
        }
        bytes.push(byte[0]);
    }
    String::from_utf8(bytes).unwrap()
}

fn write_reply(
    stream: &mut TcpStream,
    response_to: i32,
    cursor_id: i64,
    flags: i32,
    documents: &[Document],
) {
    let mut docs_buf = vec![];
    for doc in documents {
        bson::encode_document(&mut docs_buf, doc).unwrap();
    }

    let message_length = 36 + docs_buf.len() as i32;
    let mut buf = vec![];
    buf.write_i32::<LittleEndian>(message_length).unwrap();
    buf.write_i32::<LittleEndian>(0).unwrap();
    buf.write_i32::<LittleEndian>(response_to).unwrap();
    buf.write_i32::<LittleEndian>(1).unwrap();
    buf.write_i32::<LittleEndian>(flags).unwrap();
    buf.write_i64::<LittleEndian>(cursor_id).unwrap();
    buf.write_i32::<LittleEndian>(0).unwrap();
    buf.write_i32::<LittleEndian>(documents.len() as i32)
        .unwrap();
    buf.extend_from_slice(&docs_buf);

    stream.write_all(&buf).unwrap();
    stream.flush().unwrap();
}

fn handle_connection(mut stream: TcpStream, state: Arc<State>, conn_id: usize) {
    loop {
        let mut header = [0u8; 16];
        if stream.read_exact(&mut header).is_err() {
            return;
        }

        let mut header_cursor = io::Cursor::new(header.to_vec());
        let message_length = header_cursor.read_i32::<LittleEndian>().unwrap();
        let request_id = header_cursor.read_i32::<LittleEndian>().unwrap();
        let _response_to = header_cursor.read_i32::<LittleEndian>().unwrap();
        let op_code = header_cursor.read_i32::<LittleEndian>().unwrap();

        let mut body = vec![0u8; (message_length - 16) as usize];
        if stream.read_exact(&mut body).is_err() {
            return;
        }
        let mut body = io::Cursor::new(body);

        match op_code {
            // OP_QUERY
            2004 => {
                let flags = body.read_i32::<LittleEndian>().unwrap();
                let namespace = read_cstring(&mut body);
                let number_to_skip = body.read_i32::<LittleEndian>().unwrap();
                let number_to_return = body.read_i32::<LittleEndian>().unwrap();
                let query = bson::decode_document(&mut body).unwrap();

                let is_ismaster = namespace.ends_with(".$cmd")
                    && query
                        .keys()
                        .next()
                        .map(|key| key.eq_ignore_ascii_case("ismaster"))
                        .unwrap_or(false);

                if is_ismaster {
                    let reply = state.ismaster.lock().unwrap().clone();
                    write_reply(&mut stream, request_id, 0, 0, &[reply]);
                } else {
                    state.log.lock().unwrap().push(LoggedOp::Query {
                        conn_id,
                        namespace,
                        flags,
                        number_to_skip,
                        number_to_return,
                        query,
                    });

                    let canned = state
                        .replies
                        .lock()
                        .unwrap()
                        .pop_front()
                        .unwrap_or_else(default_reply);
                    write_reply(
                        &mut stream,
                        request_id,
                        canned.cursor_id,
                        canned.flags,
                        &canned.documents,
                    );
                }
            }
            // OP_GET_MORE
            2005 => {
                let _zero = body.read_i32::<LittleEndian>().unwrap();
                let namespace = read_cstring(&mut body);
                let number_to_return = body.read_i32::<LittleEndian>().unwrap();
                let cursor_id = body.read_i64::<LittleEndian>().unwrap();

                state.log.lock().unwrap().push(LoggedOp::GetMore {
                    conn_id,
                    namespace,
                    number_to_return,
                    cursor_id,
                });

                let canned = state
                    .replies
                    .lock()
                    .unwrap()
                    .pop_front()
                    .unwrap_or_else(|| CannedReply {
                        cursor_id: 0,
                        flags: 0,
                        documents: vec![],
                    });
                write_reply(
                    &mut stream,
                    request_id,
                    canned.cursor_id,
                    canned.flags,
                    &canned.documents,
                );
            }
            // OP_KILL_CURSORS, which has no reply
            2007 => {
                let _zero = body.read_i32::<LittleEndian>().unwrap();
                let id_count = body.read_i32::<LittleEndian>().unwrap();
                let mut cursor_ids = vec![];
                for _ in 0..id_count {
                    cursor_ids.push(body.read_i64::<LittleEndian>().unwrap());
                }

                state
                    .log
                    .lock()
                    .unwrap()
                    .push(LoggedOp::KillCursors { conn_id, cursor_ids });
            }
            _ => return,
        }
    }
}
