use crate::mock::{LoggedOp, MockServer};

use bson::{bson, doc, Document};
use bufstream::BufStream;
use mongodb_sync::auth::Authenticator;
use mongodb_sync::common::ReadPreference;
use mongodb_sync::pool::PoolOptions;
use mongodb_sync::stream::Stream;
use mongodb_sync::{Client, ClientOptions, Error, Result, ThreadedClient};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

fn connect(server: &MockServer) -> Client {
    ClientOptions::new()
        .connect("127.0.0.1", server.port)
        .expect("failed to connect to mock server")
}

fn query_command_names(ops: &[LoggedOp]) -> Vec<String> {
    ops.iter()
        .filter_map(|op| match op {
            LoggedOp::Query { query, .. } => query.keys().next().cloned(),
            _ => None,
        })
        .collect()
}

#[test]
fn run_command_returns_the_response_document() {
    let server = MockServer::standalone();
    let client = connect(&server);

    server.push_reply(0, 0, vec![doc! { "ok": 1.0, "version": "3.0.0" }]);

    let response = client
        .run_command("admin", doc! { "buildInfo": 1 }, None)
        .unwrap();
    assert_eq!(response.get_str("version").unwrap(), "3.0.0");

    let ops = server.wait_for_ops(1);
    match ops[0] {
        LoggedOp::Query {
            ref namespace,
            number_to_return,
            ..
        } => {
            assert_eq!(namespace, "admin.$cmd");
            // Commands run as single-batch cursors.
            assert_eq!(number_to_return, -1);
        }
        ref other => panic!("expected command query, saw {:?}", other),
    }
}

#[test]
fn failed_commands_carry_the_server_response() {
    let server = MockServer::standalone();
    let client = connect(&server);

    server.push_reply(
        0,
        0,
        vec![doc! { "ok": 0.0, "errmsg": "no such command", "code": 59 }],
    );

    match client.run_command("test", doc! { "frobnicate": 1 }, None) {
        Err(Error::CommandError(err)) => {
            assert_eq!(err.message, "no such command");
            assert_eq!(err.code, Some(59));
            assert_eq!(err.response.get_f64("ok").unwrap(), 0.0);
        }
        other => panic!("expected a command error, got {:?}", other.is_ok()),
    }
}

#[test]
fn drop_collection_treats_missing_namespaces_as_dropped() {
    let server = MockServer::standalone();
    let client = connect(&server);

    server.push_reply(0, 0, vec![doc! { "ok": 0.0, "errmsg": "ns not found" }]);
    client.drop_collection("app", "ghosts").unwrap();

    // Other failures still surface.
    server.push_reply(0, 0, vec![doc! { "ok": 0.0, "errmsg": "unauthorized", "code": 13 }]);
    match client.drop_collection("app", "locked") {
        Err(Error::CommandError(err)) => assert_eq!(err.code, Some(13)),
        other => panic!("expected a command error, got {:?}", other.is_ok()),
    }
}

#[test]
fn create_index_consults_the_cache() {
    let server = MockServer::standalone();
    let client = connect(&server);

    client
        .create_index("app", "users", "name_1", doc! { "name": 1 })
        .unwrap();
    client
        .create_index("app", "users", "name_1", doc! { "name": 1 })
        .unwrap();

    let names = query_command_names(&server.wait_for_ops(1));
    assert_eq!(
        names.iter().filter(|name| *name == "createIndexes").count(),
        1
    );

    // Dropping the collection invalidates the cached entry.
    client.drop_collection("app", "users").unwrap();
    client
        .create_index("app", "users", "name_1", doc! { "name": 1 })
        .unwrap();

    let names = query_command_names(&server.wait_for_ops(3));
    assert_eq!(
        names.iter().filter(|name| *name == "createIndexes").count(),
        2
    );
}

#[test]
fn drop_database_resets_the_cache_by_database() {
    let server = MockServer::standalone();
    let client = connect(&server);

    client
        .create_index("app", "users", "name_1", doc! { "name": 1 })
        .unwrap();
    client
        .create_index("reporting", "stats", "day_1", doc! { "day": 1 })
        .unwrap();

    client.drop_database("app").unwrap();

    assert!(!client.index_cache().contains("app", "users", "name_1").unwrap());
    assert!(client
        .index_cache()
        .contains("reporting", "stats", "day_1")
        .unwrap());
}

#[test]
fn requests_nest_and_over_release_is_an_error() {
    let server = MockServer::standalone();
    let client = connect(&server);

    assert_eq!(client.request_nesting_level(), 0);

    let outer = client
        .request_start("test", &ReadPreference::primary())
        .unwrap();
    assert_eq!(client.request_nesting_level(), 1);

    let inner = client
        .request_start("test", &ReadPreference::primary())
        .unwrap();
    assert_eq!(client.request_nesting_level(), 2);

    inner.done().unwrap();
    assert_eq!(client.request_nesting_level(), 1);

    outer.done().unwrap();
    assert_eq!(client.request_nesting_level(), 0);

    match client.request_done() {
        Err(Error::StateError(_)) => (),
        other => panic!("expected a not-in-request error, got {:?}", other.is_ok()),
    }
}

#[test]
fn requests_pin_operations_to_one_connection() {
    let server = MockServer::standalone();
    let client = connect(&server);

    let request = client
        .request_start("test", &ReadPreference::primary())
        .unwrap();
    client.run_command("test", doc! { "ping": 1 }, None).unwrap();
    client.run_command("test", doc! { "ping": 1 }, None).unwrap();
    request.done().unwrap();

    let ops = server.wait_for_ops(2);
    let conn_ids: Vec<usize> = ops
        .iter()
        .filter_map(|op| match op {
            LoggedOp::Query { conn_id, .. } => Some(*conn_id),
            _ => None,
        })
        .collect();

    assert_eq!(conn_ids.len(), 2);
    assert_eq!(conn_ids[0], conn_ids[1]);
}

#[test]
fn request_guard_releases_on_drop() {
    let server = MockServer::standalone();
    let client = connect(&server);

    {
        let _request = client
            .request_start("test", &ReadPreference::primary())
            .unwrap();
        assert_eq!(client.request_nesting_level(), 1);
    }

    assert_eq!(client.request_nesting_level(), 0);
}

#[test]
fn pool_acquisition_times_out_on_the_wait_queue() {
    let server = MockServer::standalone();

    let mut options = ClientOptions::new();
    options.pool_options = PoolOptions {
        max_pool_size: 1,
        wait_queue_timeout: Duration::from_millis(100),
        ..PoolOptions::default()
    };
    let client = options.connect("127.0.0.1", server.port).unwrap();

    let instance = client
        .topology()
        .choose_instance(&ReadPreference::primary())
        .unwrap();

    let _held = instance.acquire_connection("test").unwrap();
    match instance.acquire_connection("test") {
        Err(Error::WaitQueueTimeoutError) => (),
        other => panic!("expected a wait-queue timeout, got {:?}", other.is_ok()),
    }
}

#[test]
fn a_full_wait_queue_is_rejected_immediately() {
    let server = MockServer::standalone();

    let mut options = ClientOptions::new();
    options.pool_options = PoolOptions {
        max_pool_size: 1,
        max_wait_queue_len: 0,
        wait_queue_timeout: Duration::from_secs(30),
        ..PoolOptions::default()
    };
    let client = options.connect("127.0.0.1", server.port).unwrap();

    let instance = client
        .topology()
        .choose_instance(&ReadPreference::primary())
        .unwrap();

    let _held = instance.acquire_connection("test").unwrap();
    match instance.acquire_connection("test") {
        Err(Error::WaitQueueFullError) => (),
        other => panic!("expected a queue-full error, got {:?}", other.is_ok()),
    }
}

struct RecordingAuthenticator {
    calls: Mutex<Vec<String>>,
    fail_database: Option<String>,
}

impl Authenticator for RecordingAuthenticator {
    fn authenticate(&self, _socket: &mut BufStream<Stream>, database: &str) -> Result<()> {
        self.calls.lock().unwrap().push(database.to_owned());
        match self.fail_database {
            Some(ref fail) if fail == database => Err(Error::AuthenticationError(
                "credentials rejected".to_owned(),
            )),
            _ => Ok(()),
        }
    }
}

#[test]
fn connections_authenticate_once_per_database() {
    let server = MockServer::standalone();

    let authenticator = Arc::new(RecordingAuthenticator {
        calls: Mutex::new(Vec::new()),
        fail_database: None,
    });

    let mut options = ClientOptions::new();
    options.authenticator = Some(authenticator.clone() as Arc<dyn Authenticator>);
    let client = options.connect("127.0.0.1", server.port).unwrap();

    // Pin one connection so both commands reuse it.
    let request = client
        .request_start("app", &ReadPreference::primary())
        .unwrap();
    client.run_command("app", doc! { "ping": 1 }, None).unwrap();
    client.run_command("app", doc! { "ping": 1 }, None).unwrap();
    request.done().unwrap();

    assert_eq!(*authenticator.calls.lock().unwrap(), vec!["app".to_owned()]);
}

#[test]
fn authentication_failures_surface_to_the_caller() {
    let server = MockServer::standalone();

    let authenticator = Arc::new(RecordingAuthenticator {
        calls: Mutex::new(Vec::new()),
        fail_database: Some("secure".to_owned()),
    });

    let mut options = ClientOptions::new();
    options.authenticator = Some(authenticator.clone() as Arc<dyn Authenticator>);
    let client = options.connect("127.0.0.1", server.port).unwrap();

    match client.run_command("secure", doc! { "ping": 1 }, None) {
        Err(Error::AuthenticationError(_)) => (),
        other => panic!("expected an authentication error, got {:?}", other.is_ok()),
    }

    // Nothing reached the server on the unauthenticated connection.
    assert!(query_command_names(&server.ops()).is_empty());
}

static SAW_PING_COMPLETION: AtomicBool = AtomicBool::new(false);

fn record_ping(_client: Client, result: &mongodb_sync::CommandResult) {
    if let mongodb_sync::CommandResult::Success {
        ref command_name, ..
    } = *result
    {
        if command_name == "ping" {
            SAW_PING_COMPLETION.store(true, Ordering::SeqCst);
        }
    }
}

#[test]
fn completion_hooks_observe_round_trips() {
    let server = MockServer::standalone();
    let client = connect(&server);

    client.add_completion_hook(record_ping).unwrap();
    client.run_command("test", doc! { "ping": 1 }, None).unwrap();

    assert!(SAW_PING_COMPLETION.load(Ordering::SeqCst));
}

#[test]
fn count_result_documents_decode() {
    let server = MockServer::standalone();
    let client = connect(&server);

    server.push_reply(0, 0, vec![doc! { "ok": 1.0, "n": 7i64 }]);
    let response: Document = client
        .run_command("app", doc! { "count": "users" }, None)
        .unwrap();
    assert_eq!(response.get_i64("n").unwrap(), 7);
}
