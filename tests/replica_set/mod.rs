use crate::mock::{LoggedOp, MockServer};

use bson::{bson, doc, Bson, Document};
use mongodb_sync::common::{ReadMode, ReadPreference};
use mongodb_sync::connstring::Host;
use mongodb_sync::cursor::Cursor;
use mongodb_sync::wire_protocol::flags::OpQueryFlags;
use mongodb_sync::{Client, ClientOptions, Error, Result, ThreadedClient};

fn rs_ismaster(me: &str, primary_addr: &str, is_primary: bool, hosts: &[&str]) -> Document {
    let host_array: Vec<Bson> = hosts
        .iter()
        .map(|host| Bson::String((*host).to_owned()))
        .collect();

    doc! {
        "ok": 1.0,
        "ismaster": is_primary,
        "secondary": !is_primary,
        "setName": "rs0",
        "me": me,
        "primary": primary_addr,
        "hosts": Bson::Array(host_array),
    }
}

// Starts a primary/secondary pair and a client seeded with both.
fn rs_pair() -> (MockServer, MockServer, Client) {
    let primary = MockServer::with_ismaster(doc! { "ok": 1.0 });
    let secondary = MockServer::with_ismaster(doc! { "ok": 1.0 });

    let primary_addr = primary.address();
    let secondary_addr = secondary.address();
    let hosts = [primary_addr.as_str(), secondary_addr.as_str()];

    primary.set_ismaster(rs_ismaster(&primary_addr, &primary_addr, true, &hosts));
    secondary.set_ismaster(rs_ismaster(&secondary_addr, &primary_addr, false, &hosts));

    let client = ClientOptions::new()
        .connect_with_seeds(vec![
            Host::new(String::from("127.0.0.1"), primary.port),
            Host::new(String::from("127.0.0.1"), secondary.port),
        ])
        .expect("failed to connect to mock replica set");

    (primary, secondary, client)
}

#[test]
fn secondary_reads_pin_every_round_trip_to_one_member() {
    let (primary, secondary, client) = rs_pair();

    secondary.push_reply(5, 0, vec![doc! { "x": 1 }]);
    secondary.push_reply(5, 0, vec![doc! { "x": 2 }]);
    secondary.push_reply(0, 0, vec![]);

    let mut cursor: Cursor<Document> = Cursor::new(client.clone(), "test.items", doc! {});
    cursor
        .set_batch_size(1)
        .unwrap()
        .set_read_preference(ReadPreference::new(ReadMode::Secondary, None))
        .unwrap();

    let docs = cursor.iter().collect::<Result<Vec<Document>>>().unwrap();
    assert_eq!(docs.len(), 2);

    let ops = secondary.wait_for_ops(3);
    match ops[0] {
        LoggedOp::Query { flags, .. } => {
            assert_ne!(flags & OpQueryFlags::SLAVE_OK.bits(), 0);
        }
        ref other => panic!("expected initial query, saw {:?}", other),
    }
    match ops[1] {
        LoggedOp::GetMore { cursor_id, .. } => assert_eq!(cursor_id, 5),
        ref other => panic!("expected get-more, saw {:?}", other),
    }
    match ops[2] {
        LoggedOp::GetMore { cursor_id, .. } => assert_eq!(cursor_id, 5),
        ref other => panic!("expected get-more, saw {:?}", other),
    }

    // The paging sequence never touched the other member.
    assert!(primary.ops().is_empty());
}

#[test]
fn ineligible_commands_are_forced_to_the_primary() {
    let (primary, secondary, client) = rs_pair();
    let preference = ReadPreference::new(ReadMode::Secondary, None);

    client
        .run_command("test", doc! { "ping": 1 }, Some(preference.clone()))
        .unwrap();

    let ops = primary.wait_for_ops(1);
    match ops[0] {
        LoggedOp::Query {
            flags, ref query, ..
        } => {
            assert_eq!(query.keys().next().map(String::as_str), Some("ping"));
            // The secondary-ok bit is stripped along with the downgrade.
            assert_eq!(flags & OpQueryFlags::SLAVE_OK.bits(), 0);
        }
        ref other => panic!("expected command query, saw {:?}", other),
    }
    assert!(secondary.ops().is_empty());
}

#[test]
fn eligible_commands_stay_on_the_secondary() {
    let (primary, secondary, client) = rs_pair();
    let preference = ReadPreference::new(ReadMode::Secondary, None);

    client
        .run_command("test", doc! { "count": "items" }, Some(preference))
        .unwrap();

    let ops = secondary.wait_for_ops(1);
    match ops[0] {
        LoggedOp::Query {
            flags, ref query, ..
        } => {
            assert_eq!(query.keys().next().map(String::as_str), Some("count"));
            assert_ne!(flags & OpQueryFlags::SLAVE_OK.bits(), 0);
        }
        ref other => panic!("expected command query, saw {:?}", other),
    }
    assert!(primary.ops().is_empty());
}

#[test]
fn nested_requests_must_match_the_pinned_instance() {
    let (_primary, _secondary, client) = rs_pair();

    let secondary_pref = ReadPreference::new(ReadMode::Secondary, None);
    let request = client.request_start("test", &secondary_pref).unwrap();

    // A secondary cannot satisfy a nested primary-only request.
    match client.request_start("test", &ReadPreference::primary()) {
        Err(Error::StateError(_)) => (),
        other => panic!("expected a mismatch error, got {:?}", other.is_ok()),
    }
    assert_eq!(client.request_nesting_level(), 1);

    // A compatible nested request increments the nesting level.
    let nested = client.request_start("test", &secondary_pref).unwrap();
    assert_eq!(client.request_nesting_level(), 2);

    nested.done().unwrap();
    request.done().unwrap();
    assert_eq!(client.request_nesting_level(), 0);
}

#[test]
fn operations_inside_a_request_follow_the_pinned_member() {
    let (primary, secondary, client) = rs_pair();

    let request = client
        .request_start("test", &ReadPreference::new(ReadMode::Secondary, None))
        .unwrap();

    // An eligible command keeps a secondary-compatible preference, so it
    // runs on the pinned connection.
    client
        .run_command(
            "test",
            doc! { "count": "items" },
            Some(ReadPreference::new(ReadMode::Secondary, None)),
        )
        .unwrap();
    request.done().unwrap();

    assert_eq!(secondary.wait_for_ops(1).len(), 1);
    assert!(primary.ops().is_empty());
}
