//! Cursors: lazily streaming query results over the wire protocol.
//!
//! A `Cursor` is configured with builder-style setters, then frozen when
//! enumeration begins. The `CursorEnumerator` owns the live protocol
//! session: it sends the initial query, pages with get-more requests
//! pinned to the instance that served the first round-trip, and kills the
//! server-side cursor on early exit or disposal.
use crate::apm::{CommandResult, CommandStarted};
use crate::common::{ReadMode, ReadPreference};
use crate::error::Error::{self, StateError};
use crate::error::{CommandException, Result};
use crate::topology::server::{InstanceKind, ServerInstance};
use crate::wire_protocol::flags::{OpQueryFlags, OpReplyFlags};
use crate::wire_protocol::operations::Message;
use crate::{Client, ThreadedClient};

use bson::{bson, doc, Bson, Document};
use serde::de::DeserializeOwned;
use time;

use std::cmp;
use std::collections::vec_deque::VecDeque;
use std::marker::PhantomData;
use std::thread;
use std::time::Duration;

macro_rules! try_or_emit {
    ($client:expr, $cmd_name:expr, $req_id:expr, $connstring:expr, $result:expr) => {
        match $result {
            Ok(val) => val,
            Err(e) => {
                let hook_result = $client.run_completion_hooks(&CommandResult::Failure {
                    duration: 0,
                    command_name: $cmd_name.to_owned(),
                    failure: &e,
                    request_id: i64::from($req_id),
                    connection_string: $connstring.clone(),
                });

                return match hook_result {
                    Ok(_) => Err(e),
                    Err(_) => Err(Error::EventListenerError(Some(Box::new(e)))),
                };
            }
        }
    };
}

// numberToReturn for the initial query. A negative limit is sent as-is,
// telling the server to return a single batch and close the cursor.
fn initial_number_to_return(limit: i32, batch_size: i32) -> i32 {
    if limit < 0 {
        limit
    } else if limit == 0 {
        batch_size
    } else if batch_size == 0 {
        limit
    } else {
        cmp::min(limit, batch_size)
    }
}

// numberToReturn for a get-more, bounded by what a positive limit still
// allows. One enumerator is driven by one thread, so `count` cannot pass
// `positive_limit` between round-trips.
fn get_more_number_to_return(positive_limit: i32, batch_size: i32, count: i32) -> i32 {
    if positive_limit > 0 {
        let remaining = positive_limit - count;
        if batch_size == 0 {
            remaining
        } else {
            cmp::min(batch_size, remaining)
        }
    } else {
        batch_size
    }
}

// Builds the outgoing query document. The plain query is wrapped in a
// `$query` envelope when cursor options apply, or when the target is a
// shard router that must be told the read preference. `$readPreference`
// is omitted for secondaryPreferred with no tag sets, the server default.
fn wrap_query(
    query: &Document,
    options: &Document,
    instance_kind: InstanceKind,
    read_preference: &ReadPreference,
) -> Document {
    let needs_read_preference = instance_kind == InstanceKind::ShardRouter
        && read_preference.mode != ReadMode::Primary
        && !(read_preference.mode == ReadMode::SecondaryPreferred
            && read_preference.tag_sets.is_empty());

    if options.is_empty() && !needs_read_preference {
        return query.clone();
    }

    let mut wrapped = Document::new();
    wrapped.insert("$query", query.clone());

    for (key, value) in options.iter() {
        wrapped.insert(key.clone(), value.clone());
    }

    if needs_read_preference {
        wrapped.insert("$readPreference", read_preference.to_document());
    }

    wrapped
}

// Removes the verbose-only explain fields, including per-shard results
// in either their array or sub-document form.
fn strip_plan_details(explanation: &mut Document) {
    explanation.remove("allPlans");
    explanation.remove("oldPlan");

    if let Some(shards) = explanation.get_mut("shards") {
        match *shards {
            Bson::Array(ref mut shard_array) => {
                for shard in shard_array.iter_mut() {
                    if let Bson::Document(ref mut shard_doc) = *shard {
                        shard_doc.remove("allPlans");
                        shard_doc.remove("oldPlan");
                    }
                }
            }
            Bson::Document(ref mut shard_doc) => {
                shard_doc.remove("allPlans");
                shard_doc.remove("oldPlan");
            }
            _ => (),
        }
    }
}

fn unpack_reply(message: Message) -> Result<(OpReplyFlags, i64, Vec<Document>)> {
    match message {
        Message::OpReply {
            flags,
            cursor_id,
            documents,
            ..
        } => {
            if flags.contains(OpReplyFlags::CURSOR_NOT_FOUND) {
                return Err(Error::CursorNotFoundError);
            }

            if flags.contains(OpReplyFlags::QUERY_FAILURE) {
                let response = documents.into_iter().next().unwrap_or_else(Document::new);
                return Err(Error::CommandError(CommandException::from_response(
                    response,
                )));
            }

            Ok((flags, cursor_id, documents))
        }
        _ => Err(Error::CursorNotFoundError),
    }
}

/// A configurable, lazily-executed query, generic over the type its
/// result documents decode into.
pub struct Cursor<T = Document> {
    client: Client,
    namespace: String,
    query: Document,
    projection: Option<Document>,
    sort: Option<Document>,
    hint: Option<Bson>,
    min: Option<Document>,
    max: Option<Document>,
    snapshot: bool,
    show_disk_loc: bool,
    explain: bool,
    skip: i32,
    limit: i32,
    batch_size: i32,
    flags: OpQueryFlags,
    read_preference: ReadPreference,
    frozen: bool,
    _marker: PhantomData<fn() -> T>,
}

impl<T> Cursor<T> {
    /// Returns a new cursor over the given namespace, carrying the
    /// client's default read preference.
    pub fn new(client: Client, namespace: &str, query: Document) -> Cursor<T> {
        let preference = client.read_preference();
        Cursor::create(client, namespace, query, preference)
    }

    /// Returns a single-batch cursor for a database command, addressed to
    /// the command pseudo-collection.
    pub fn command(
        client: Client,
        database: &str,
        command: Document,
        read_preference: Option<ReadPreference>,
    ) -> Cursor<T> {
        let preference = read_preference.unwrap_or_else(|| client.read_preference());
        let namespace = format!("{}.$cmd", database);
        let mut cursor = Cursor::create(client, &namespace, command, preference);
        cursor.limit = -1;
        cursor
    }

    fn create(
        client: Client,
        namespace: &str,
        query: Document,
        preference: ReadPreference,
    ) -> Cursor<T> {
        let mut cursor = Cursor {
            client,
            namespace: namespace.to_owned(),
            query,
            projection: None,
            sort: None,
            hint: None,
            min: None,
            max: None,
            snapshot: false,
            show_disk_loc: false,
            explain: false,
            skip: 0,
            limit: 0,
            batch_size: 0,
            flags: OpQueryFlags::empty(),
            read_preference: ReadPreference::primary(),
            frozen: false,
            _marker: PhantomData,
        };
        cursor.apply_read_preference(preference);
        cursor
    }

    fn is_command_namespace(&self) -> bool {
        self.namespace.ends_with(".$cmd")
    }

    // An ineligible command addressed to the command pseudo-collection is
    // forced back to the primary.
    fn resolve_read_preference(&self, preference: ReadPreference) -> ReadPreference {
        if self.is_command_namespace()
            && preference.mode != ReadMode::Primary
            && !self.client.can_run_on_secondary(&self.query)
        {
            ReadPreference::primary()
        } else {
            preference
        }
    }

    fn apply_read_preference(&mut self, preference: ReadPreference) {
        let resolved = self.resolve_read_preference(preference);
        if resolved.mode == ReadMode::Primary {
            self.flags.remove(OpQueryFlags::SLAVE_OK);
        }
        self.read_preference = resolved;
    }

    fn assert_unfrozen(&self) -> Result<()> {
        if self.frozen {
            Err(StateError(
                "A cursor cannot be modified once it has been frozen.".to_owned(),
            ))
        } else {
            Ok(())
        }
    }

    /// Whether enumeration has begun and the cursor can no longer be
    /// modified.
    pub fn is_frozen(&self) -> bool {
        self.frozen
    }

    /// The read preference this cursor will resolve servers with.
    pub fn read_preference(&self) -> &ReadPreference {
        &self.read_preference
    }

    /// Sets the number of initial result documents the server skips.
    pub fn set_skip(&mut self, skip: i32) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.skip = skip;
        Ok(self)
    }

    /// Sets an upper bound on the number of documents returned. A negative
    /// limit requests a single batch of that many documents and tells the
    /// server to close the cursor immediately afterwards.
    pub fn set_limit(&mut self, limit: i32) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.limit = limit;
        Ok(self)
    }

    /// Sets the number of documents returned per batch.
    pub fn set_batch_size(&mut self, batch_size: i32) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        if batch_size < 0 {
            return Err(Error::ArgumentError(
                "Batch size cannot be negative.".to_owned(),
            ));
        }
        self.batch_size = batch_size;
        Ok(self)
    }

    /// Sets a projection of which fields appear in the result documents.
    pub fn set_projection(&mut self, projection: Document) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.projection = Some(projection);
        Ok(self)
    }

    /// Replaces the cursor's wire-protocol query flags.
    pub fn set_flags(&mut self, flags: OpQueryFlags) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.flags = flags;
        Ok(self)
    }

    /// Hints the index to use, as an index specification document.
    pub fn set_hint(&mut self, hint: Document) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.hint = Some(Bson::Document(hint));
        Ok(self)
    }

    /// Hints the index to use, by index name.
    pub fn set_hint_name(&mut self, index_name: &str) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.hint = Some(Bson::String(index_name.to_owned()));
        Ok(self)
    }

    /// Sets the inclusive lower index bound. Often combined with a hint.
    pub fn set_min(&mut self, min: Document) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.min = Some(min);
        Ok(self)
    }

    /// Sets the exclusive upper index bound. Often combined with a hint.
    pub fn set_max(&mut self, max: Document) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.max = Some(max);
        Ok(self)
    }

    /// Sets the sort order for the results.
    pub fn set_sort_order(&mut self, order: Document) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.sort = Some(order);
        Ok(self)
    }

    /// Asks the server for snapshot isolation over the scan.
    pub fn set_snapshot(&mut self) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.snapshot = true;
        Ok(self)
    }

    /// Asks the server to report each document's disk location.
    pub fn set_show_disk_loc(&mut self) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.show_disk_loc = true;
        Ok(self)
    }

    /// Sets the read preference used to resolve a server for this cursor.
    pub fn set_read_preference(&mut self, preference: ReadPreference) -> Result<&mut Cursor<T>> {
        self.assert_unfrozen()?;
        self.apply_read_preference(preference);
        Ok(self)
    }

    fn split_namespace(&self) -> (String, String) {
        match self.namespace.find('.') {
            Some(index) => (
                self.namespace[..index].to_owned(),
                self.namespace[index + 1..].to_owned(),
            ),
            None => (self.namespace.clone(), String::new()),
        }
    }

    // Copies the configuration into a cursor of another document type.
    fn retyped<U>(&self) -> Cursor<U> {
        Cursor {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            query: self.query.clone(),
            projection: self.projection.clone(),
            sort: self.sort.clone(),
            hint: self.hint.clone(),
            min: self.min.clone(),
            max: self.max.clone(),
            snapshot: self.snapshot,
            show_disk_loc: self.show_disk_loc,
            explain: self.explain,
            skip: self.skip,
            limit: self.limit,
            batch_size: self.batch_size,
            flags: self.flags,
            read_preference: self.read_preference.clone(),
            frozen: false,
            _marker: PhantomData,
        }
    }

    // The $-prefixed query modifiers derived from the cursor settings.
    fn build_options(&self) -> Document {
        let mut options = Document::new();
        if let Some(ref sort) = self.sort {
            options.insert("$orderby", sort.clone());
        }
        if let Some(ref hint) = self.hint {
            options.insert("$hint", hint.clone());
        }
        if let Some(ref min) = self.min {
            options.insert("$min", min.clone());
        }
        if let Some(ref max) = self.max {
            options.insert("$max", max.clone());
        }
        if self.snapshot {
            options.insert("$snapshot", true);
        }
        if self.show_disk_loc {
            options.insert("$showDiskLoc", true);
        }
        if self.explain {
            options.insert("$explain", true);
        }
        options
    }

    /// Begins enumeration, freezing the cursor and returning the live
    /// protocol session. The sequence is forward-only and non-restartable;
    /// a second call re-runs the query in a fresh session.
    pub fn iter(&mut self) -> CursorEnumerator<T> {
        self.frozen = true;

        // The eligibility override applies again here, independently of
        // its application when the cursor was created.
        let preference = self.resolve_read_preference(self.read_preference.clone());
        let mut flags = self.flags;
        if preference.mode == ReadMode::Primary {
            flags.remove(OpQueryFlags::SLAVE_OK);
        } else {
            flags.insert(OpQueryFlags::SLAVE_OK);
        }

        CursorEnumerator {
            client: self.client.clone(),
            namespace: self.namespace.clone(),
            query: self.query.clone(),
            projection: self.projection.clone(),
            options: self.build_options(),
            skip: self.skip,
            limit: self.limit,
            positive_limit: self.limit.abs(),
            batch_size: self.batch_size,
            flags,
            read_preference: preference,
            count: 0,
            buffer: VecDeque::new(),
            current: None,
            cursor_id: 0,
            instance: None,
            started: false,
            done: false,
            disposed: false,
            response_flags: OpReplyFlags::empty(),
        }
    }

    /// Runs a `count` command for the query, ignoring skip and limit
    /// (unlike `size`, which honors them). Freezes the cursor.
    pub fn count(&mut self) -> Result<i64> {
        self.frozen = true;
        let (database, collection) = self.split_namespace();

        let mut command = doc! { "count": collection };
        if !self.query.is_empty() {
            command.insert("query", self.query.clone());
        }

        let result =
            self.client
                .run_command(&database, command, Some(self.read_preference.clone()))?;
        extract_count(&result)
    }

    /// Runs a `count` command honoring skip and limit (unlike `count`,
    /// which ignores them). Freezes the cursor.
    pub fn size(&mut self) -> Result<i64> {
        self.frozen = true;
        let (database, collection) = self.split_namespace();

        let mut command = doc! { "count": collection };
        if !self.query.is_empty() {
            command.insert("query", self.query.clone());
        }
        if self.limit != 0 {
            command.insert("limit", self.limit);
        }
        if self.skip != 0 {
            command.insert("skip", self.skip);
        }

        let result =
            self.client
                .run_command(&database, command, Some(self.read_preference.clone()))?;
        extract_count(&result)
    }

    /// Runs the query with `$explain` on a single-batch clone and returns
    /// the server's explanation. Unless `verbose` is set, the verbose-only
    /// plan fields are stripped, including per-shard. Freezes the cursor.
    pub fn explain(&mut self, verbose: bool) -> Result<Document> {
        self.frozen = true;

        let mut clone: Cursor<Document> = self.retyped();
        clone.explain = true;
        clone.limit = if self.limit == 0 { -1 } else { -self.limit.abs() };

        let mut enumerator = clone.iter();
        let mut explanation = match enumerator.next() {
            Some(Ok(doc)) => doc,
            Some(Err(err)) => return Err(err),
            None => {
                return Err(Error::ResponseError(
                    "explain returned no response.".to_owned(),
                ));
            }
        };

        if !verbose {
            strip_plan_details(&mut explanation);
        }

        Ok(explanation)
    }
}

fn extract_count(result: &Document) -> Result<i64> {
    match result.get("n") {
        Some(&Bson::I32(n)) => Ok(i64::from(n)),
        Some(&Bson::I64(n)) => Ok(n),
        Some(&Bson::FloatingPoint(n)) => Ok(n as i64),
        _ => Err(Error::ResponseError(
            "count result does not contain `n`.".to_owned(),
        )),
    }
}

/// A live cursor session over the wire protocol.
///
/// The instance chosen for the first round-trip serves every later
/// round-trip of the session, so a paging sequence observes one member's
/// view of the data regardless of how the read preference would resolve
/// in the meantime.
pub struct CursorEnumerator<T = Document> {
    client: Client,
    namespace: String,
    query: Document,
    projection: Option<Document>,
    options: Document,
    skip: i32,
    limit: i32,
    positive_limit: i32,
    batch_size: i32,
    flags: OpQueryFlags,
    read_preference: ReadPreference,
    count: i32,
    buffer: VecDeque<Document>,
    current: Option<T>,
    cursor_id: i64,
    instance: Option<ServerInstance>,
    started: bool,
    done: bool,
    disposed: bool,
    response_flags: OpReplyFlags,
}

impl<T> CursorEnumerator<T> {
    fn database_name(&self) -> String {
        match self.namespace.find('.') {
            Some(index) => self.namespace[..index].to_owned(),
            None => self.namespace.clone(),
        }
    }

    fn is_tailable(&self) -> bool {
        self.flags.contains(OpQueryFlags::TAILABLE_CURSOR)
    }

    fn command_name(&self) -> String {
        if self.namespace.ends_with(".$cmd") {
            self.query
                .keys()
                .next()
                .cloned()
                .unwrap_or_else(|| String::from("command"))
        } else {
            String::from("find")
        }
    }

    /// The instance serving this session, once the first round-trip has
    /// pinned one.
    pub fn instance(&self) -> Option<&ServerInstance> {
        self.instance.as_ref()
    }

    /// How many documents the session has yielded so far.
    pub fn count(&self) -> i32 {
        self.count
    }

    // Sends the initial query and buffers the first reply. The chosen
    // instance becomes the pinned instance for the rest of the session.
    fn run_initial_query(&mut self) -> Result<()> {
        let req_id = self.client.get_req_id();
        let mut conn = self
            .client
            .acquire_connection(&self.database_name(), &self.read_preference)?;
        let instance = conn.instance().clone();

        let wrapped = wrap_query(
            &self.query,
            &self.options,
            instance.kind(),
            &self.read_preference,
        );
        let number_to_return = initial_number_to_return(self.limit, self.batch_size);

        let message = Message::new_query(
            req_id,
            self.flags,
            self.namespace.clone(),
            self.skip,
            number_to_return,
            wrapped.clone(),
            self.projection.clone(),
        )?;

        let command_name = self.command_name();
        let connstring = format!("{}", conn.peer_addr()?);

        let hook_result = self.client.run_start_hooks(&CommandStarted {
            command: wrapped,
            database_name: self.database_name(),
            command_name: command_name.clone(),
            request_id: i64::from(req_id),
            connection_string: connstring.clone(),
        });

        if hook_result.is_err() {
            return Err(Error::EventListenerError(None));
        }

        let init_time = time::precise_time_ns();

        try_or_emit!(
            self.client,
            command_name,
            req_id,
            connstring,
            message.write(conn.get_socket())
        );
        let reply = try_or_emit!(
            self.client,
            command_name,
            req_id,
            connstring,
            Message::read(conn.get_socket())
        );

        let fin_time = time::precise_time_ns();

        let (flags, cursor_id, documents) = try_or_emit!(
            self.client,
            command_name,
            req_id,
            connstring,
            unpack_reply(reply)
        );

        let _ = self.client.run_completion_hooks(&CommandResult::Success {
            duration: fin_time - init_time,
            reply: doc! { "cursorId": cursor_id, "numberReturned": documents.len() as i32 },
            command_name,
            request_id: i64::from(req_id),
            connection_string: connstring,
        });

        self.response_flags = flags;
        self.cursor_id = cursor_id;
        self.buffer = documents.into_iter().collect();
        self.instance = Some(instance);
        self.started = true;

        // An empty first reply exhausts a non-tailable session outright.
        if self.buffer.is_empty() && !self.is_tailable() {
            self.done = true;
        }

        Ok(())
    }

    // Fetches the next batch from the pinned instance.
    fn run_get_more(&mut self) -> Result<()> {
        let instance = match self.instance {
            Some(ref instance) => instance.clone(),
            None => {
                return Err(StateError(
                    "A get-more was attempted before the initial query.".to_owned(),
                ));
            }
        };

        let mut conn = self
            .client
            .acquire_connection_on(&self.database_name(), &instance)?;

        let req_id = self.client.get_req_id();
        let number_to_return =
            get_more_number_to_return(self.positive_limit, self.batch_size, self.count);

        let message = Message::new_get_more(
            req_id,
            self.namespace.clone(),
            number_to_return,
            self.cursor_id,
        );

        let command_name = String::from("get_more");
        let connstring = format!("{}", conn.peer_addr()?);

        let hook_result = self.client.run_start_hooks(&CommandStarted {
            command: doc! { "cursorId": self.cursor_id, "numberToReturn": number_to_return },
            database_name: self.database_name(),
            command_name: command_name.clone(),
            request_id: i64::from(req_id),
            connection_string: connstring.clone(),
        });

        if hook_result.is_err() {
            return Err(Error::EventListenerError(None));
        }

        let init_time = time::precise_time_ns();

        try_or_emit!(
            self.client,
            command_name,
            req_id,
            connstring,
            message.write(conn.get_socket())
        );
        let reply = try_or_emit!(
            self.client,
            command_name,
            req_id,
            connstring,
            Message::read(conn.get_socket())
        );

        let fin_time = time::precise_time_ns();

        let (flags, cursor_id, documents) = try_or_emit!(
            self.client,
            command_name,
            req_id,
            connstring,
            unpack_reply(reply)
        );

        let _ = self.client.run_completion_hooks(&CommandResult::Success {
            duration: fin_time - init_time,
            reply: doc! { "cursorId": cursor_id, "numberReturned": documents.len() as i32 },
            command_name,
            request_id: i64::from(req_id),
            connection_string: connstring,
        });

        self.response_flags = flags;
        self.cursor_id = cursor_id;
        self.buffer.extend(documents);
        Ok(())
    }

    // Tells the pinned instance to discard the open server-side cursor.
    // Best-effort: an unreachable instance means the server has likely
    // discarded the cursor already, so failures are swallowed. The id is
    // cleared regardless.
    fn kill_server_cursor(&mut self) {
        if self.cursor_id == 0 {
            return;
        }

        let cursor_id = self.cursor_id;
        self.cursor_id = 0;

        if let Some(instance) = self.instance.clone() {
            let _ = self.send_kill_cursors(&instance, cursor_id);
        }
    }

    fn send_kill_cursors(&self, instance: &ServerInstance, cursor_id: i64) -> Result<()> {
        let mut conn = self
            .client
            .acquire_connection_on(&self.database_name(), instance)?;

        let req_id = self.client.get_req_id();
        let message = Message::new_kill_cursors(req_id, vec![cursor_id]);
        let connstring = format!("{}", conn.peer_addr()?);
        let command_name = String::from("kill_cursors");

        let _ = self.client.run_start_hooks(&CommandStarted {
            command: doc! { "cursorId": cursor_id },
            database_name: self.database_name(),
            command_name: command_name.clone(),
            request_id: i64::from(req_id),
            connection_string: connstring.clone(),
        });

        let init_time = time::precise_time_ns();

        // OP_KILL_CURSORS has no reply.
        message.write(conn.get_socket())?;

        let fin_time = time::precise_time_ns();

        let _ = self.client.run_completion_hooks(&CommandResult::Success {
            duration: fin_time - init_time,
            reply: doc! {},
            command_name,
            request_id: i64::from(req_id),
            connection_string: connstring,
        });

        Ok(())
    }

    /// The current document, valid between a successful `advance` and the
    /// next call that moves or ends the session.
    pub fn current(&self) -> Result<&T> {
        if self.disposed {
            return Err(StateError("The enumerator has been disposed.".to_owned()));
        }
        if !self.started {
            return Err(StateError(
                "The enumerator is positioned before the first document; call advance first."
                    .to_owned(),
            ));
        }
        match self.current {
            Some(ref document) => Ok(document),
            None => Err(StateError(
                "The enumerator is positioned after the last document.".to_owned(),
            )),
        }
    }

    /// Releases the session, killing any open server-side cursor.
    /// Idempotent; called automatically on drop.
    pub fn dispose(&mut self) {
        if self.disposed {
            return;
        }

        self.kill_server_cursor();
        self.buffer.clear();
        self.current = None;
        self.done = true;
        self.disposed = true;
    }
}

impl<T: DeserializeOwned> CursorEnumerator<T> {
    /// Moves to the next document, fetching another batch from the pinned
    /// instance when the buffered one is spent. Returns false once the
    /// session is exhausted; a tailable session whose server-side cursor
    /// is still open may return true again on a later call.
    pub fn advance(&mut self) -> Result<bool> {
        if self.disposed {
            return Err(StateError("The enumerator has been disposed.".to_owned()));
        }

        if self.done {
            // A tailable cursor is never definitively done while the
            // server still holds it open.
            if self.is_tailable() && self.cursor_id != 0 {
                self.done = false;
            } else {
                return Ok(false);
            }
        }

        if !self.started {
            self.run_initial_query()?;
            if self.done {
                self.current = None;
                return Ok(false);
            }
        }

        let mut polled = false;
        loop {
            if self.positive_limit > 0 && self.count >= self.positive_limit {
                // Early exit: the limit is reached while the server still
                // holds the cursor open.
                self.kill_server_cursor();
                self.buffer.clear();
                self.current = None;
                self.done = true;
                return Ok(false);
            }

            if let Some(doc) = self.buffer.pop_front() {
                self.count += 1;
                self.current = Some(bson::from_bson(Bson::Document(doc))?);
                return Ok(true);
            }

            if self.cursor_id == 0 {
                self.current = None;
                self.done = true;
                return Ok(false);
            }

            if self.is_tailable() && polled {
                // Nothing new yet. Report the end of the current results
                // but leave the session resumable.
                if !self.response_flags.contains(OpReplyFlags::AWAIT_CAPABLE) {
                    thread::sleep(Duration::from_millis(100));
                }
                self.current = None;
                self.done = true;
                return Ok(false);
            }

            self.run_get_more()?;
            polled = true;
        }
    }
}

impl<T: DeserializeOwned> Iterator for CursorEnumerator<T> {
    type Item = Result<T>;

    fn next(&mut self) -> Option<Result<T>> {
        match self.advance() {
            Ok(true) => self.current.take().map(Ok),
            Ok(false) => None,
            Err(err) => Some(Err(err)),
        }
    }
}

impl<T> Drop for CursorEnumerator<T> {
    fn drop(&mut self) {
        self.dispose();
    }
}
