//! End-to-end tests driving a real `Server` over real nanomsg sockets, the
//! way a genuine host/participant pair would talk to each other.

use std::sync::Arc;
use std::time::Duration;

use scaproust::{Session, Socket};
use scrivener::client::{Client, StdoutView};
use scrivener::config::AppConfig;
use scrivener::document::NullView;
use scrivener::protocol::{self, OpName, OperationRecord, Reply, SubscribeReplyEnvelope};
use scrivener::server::Server;
use scrivener::transport;

struct TestServer {
  server: Arc<Server>,
  interactive_port: u16,
  broadcast_port: u16,
  _doc: tempfile::NamedTempFile,
}

fn start_server(content: &str, cfg: AppConfig, interactive_port: u16, broadcast_port: u16) -> TestServer {
  use std::io::Write;
  let mut doc = tempfile::NamedTempFile::new().unwrap();
  write!(doc, "{content}").unwrap();

  let server = Arc::new(
    Server::bind(
      doc.path(),
      ("127.0.0.1", interactive_port),
      ("127.0.0.1", broadcast_port),
      &cfg,
    )
    .expect("server binds to its chosen ports"),
  );

  let run_server = server.clone();
  std::thread::spawn(move || {
    let _ = run_server.run(&cfg);
  });

  TestServer {
    server,
    interactive_port,
    broadcast_port,
    _doc: doc,
  }
}

impl Drop for TestServer {
  fn drop(&mut self) {
    self.server.stop();
  }
}

/// The request socket connects instantly, but the interactive loop needs a
/// moment to spin up; retry briefly rather than asserting on the first
/// attempt.
fn connect_interactive_with_retry(session: &Session, port: u16) -> Socket {
  let deadline = std::time::Instant::now() + Duration::from_secs(2);
  loop {
    match transport::connect_interactive(session, ("127.0.0.1", port), Duration::from_millis(500)) {
      Ok(socket) => return socket,
      Err(e) if std::time::Instant::now() < deadline => {
        let _ = e;
        std::thread::sleep(Duration::from_millis(20));
      }
      Err(e) => panic!("failed to connect interactive socket: {e}"),
    }
  }
}

fn raw_request(socket: &mut Socket, op: &OperationRecord) -> String {
  let reply = transport::send_request(socket, op.encode().as_bytes()).unwrap();
  String::from_utf8_lossy(&reply).into_owned()
}

fn decode_subscribed(reply_text: &str) -> SubscribeReplyEnvelope {
  serde_json::from_str(reply_text).unwrap()
}

#[test]
fn subscribe_round_trip_reports_file_and_assigns_a_cursor() {
  let ts = start_server("abc\ndef", AppConfig::default(), 19601, 19602);
  let session = transport::open_session().unwrap();
  let mut socket = connect_interactive_with_retry(&session, ts.interactive_port);

  let req = OperationRecord::control(protocol::unassigned_cursor_id(), OpName::Subscribe, vec![]);
  let reply_text = raw_request(&mut socket, &req);
  let envelope = decode_subscribed(&reply_text);

  assert_eq!(envelope.status, "subscribed");
  assert_eq!(
    envelope.other.file,
    vec!["abc\n".to_string(), "def".to_string()]
  );
  let uuid = envelope.other.uuid.to_string();
  let cursor = envelope.other.cursors.get(&uuid).unwrap();
  assert_eq!(cursor.cx, 0);
  assert_eq!(cursor.cy, 0);
}

#[test]
fn second_subscriber_sees_both_cursors_and_first_client_hears_the_announcement() {
  let ts = start_server("abc\ndef", AppConfig::default(), 19611, 19612);
  let session = transport::open_session().unwrap();

  let mut interactive_a = connect_interactive_with_retry(&session, ts.interactive_port);
  let req = OperationRecord::control(protocol::unassigned_cursor_id(), OpName::Subscribe, vec![]);
  let reply_a = raw_request(&mut interactive_a, &req);
  let uuid_a = decode_subscribed(&reply_a).other.uuid.to_string();

  // Connect A's broadcast socket only after A's own subscribe has already
  // been announced, so the one frame we read below is unambiguously B's.
  let mut broadcast_a =
    transport::connect_broadcast(&session, ("127.0.0.1", ts.broadcast_port), Duration::from_millis(200))
      .unwrap();
  std::thread::sleep(Duration::from_millis(100));

  let mut interactive_b = connect_interactive_with_retry(&session, ts.interactive_port);
  let reply_b = raw_request(&mut interactive_b, &req);
  let envelope_b = decode_subscribed(&reply_b);
  let uuid_b = envelope_b.other.uuid.to_string();

  assert_ne!(uuid_a, uuid_b);
  assert!(envelope_b.other.cursors.contains_key(&uuid_a));
  assert!(envelope_b.other.cursors.contains_key(&uuid_b));

  let frame = transport::try_read_frame(&mut broadcast_a)
    .unwrap()
    .expect("A should observe B's create_cursor broadcast");
  let batch = protocol::decode_batch(&String::from_utf8_lossy(&frame)).unwrap();
  assert_eq!(batch.len(), 1);
  assert_eq!(batch[0].name, "create_cursor");
  assert_eq!(batch[0].args, vec![uuid_b]);
}

#[test]
fn batch_is_emitted_sorted_by_time_regardless_of_arrival_order() {
  let cfg = AppConfig {
    initial_batch_delay: Duration::from_millis(100),
    ..AppConfig::default()
  };
  let ts = start_server("ac", cfg, 19621, 19622);
  let session = transport::open_session().unwrap();

  let mut broadcast =
    transport::connect_broadcast(&session, ("127.0.0.1", ts.broadcast_port), Duration::from_millis(200))
      .unwrap();
  std::thread::sleep(Duration::from_millis(100));

  let mut interactive = connect_interactive_with_retry(&session, ts.interactive_port);
  let subscribe = OperationRecord::control(protocol::unassigned_cursor_id(), OpName::Subscribe, vec![]);
  let reply = raw_request(&mut interactive, &subscribe);
  let cid = decode_subscribed(&reply).other.uuid.to_string();

  // Drain the subscribe-announcement batch before sending the edits we
  // actually want to inspect.
  let _ = transport::try_read_frame(&mut broadcast).unwrap();

  let now = scrivener::server::unix_now_secs();
  let later = OperationRecord::new(
    cid.clone(),
    OpName::InsertChar,
    vec![cid.clone(), "X".to_string()],
    Some(now + 10.0),
  );
  let earlier = OperationRecord::new(
    cid.clone(),
    OpName::InsertChar,
    vec![cid.clone(), "Y".to_string()],
    Some(now + 9.9),
  );
  // Send the later-timestamped edit first; the emitted batch must still
  // come out ordered by `time`, not by arrival order.
  raw_request(&mut interactive, &later);
  raw_request(&mut interactive, &earlier);

  let frame = transport::try_read_frame(&mut broadcast)
    .unwrap()
    .expect("batch should have been emitted by now");
  let batch = protocol::decode_batch(&String::from_utf8_lossy(&frame)).unwrap();
  assert_eq!(batch.len(), 2);
  assert_eq!(batch[0].args[1], "Y");
  assert_eq!(batch[1].args[1], "X");
}

#[test]
fn stale_edit_is_dropped_and_not_broadcast() {
  let cfg = AppConfig {
    initial_batch_delay: Duration::from_millis(50),
    ..AppConfig::default()
  };
  let ts = start_server("ac", cfg, 19631, 19632);
  let session = transport::open_session().unwrap();

  let mut broadcast =
    transport::connect_broadcast(&session, ("127.0.0.1", ts.broadcast_port), Duration::from_millis(200))
      .unwrap();
  std::thread::sleep(Duration::from_millis(100));
  let mut interactive = connect_interactive_with_retry(&session, ts.interactive_port);
  let subscribe = OperationRecord::control(protocol::unassigned_cursor_id(), OpName::Subscribe, vec![]);
  let reply = raw_request(&mut interactive, &subscribe);
  let cid = decode_subscribed(&reply).other.uuid.to_string();
  let _ = transport::try_read_frame(&mut broadcast).unwrap();

  let stale = OperationRecord::new(
    cid.clone(),
    OpName::InsertChar,
    vec![cid, "Z".to_string()],
    Some(scrivener::server::unix_now_secs() - 10.0),
  );
  let reply_text = raw_request(&mut interactive, &stale);
  assert_eq!(
    reply_text,
    Reply::Dropped.to_wire_string(),
    "stale edit should be acknowledged as dropped"
  );

  // Nothing should ever show up on the broadcast channel for it.
  std::thread::sleep(Duration::from_millis(200));
  assert!(transport::try_read_frame(&mut broadcast).unwrap().is_none());
}

#[test]
fn two_clients_converge_on_the_same_document_after_an_edit() {
  let cfg = AppConfig {
    initial_batch_delay: Duration::from_millis(50),
    server_poll_timeout: Duration::from_millis(50),
    client_poll_timeout: Duration::from_millis(50),
    ..AppConfig::default()
  };
  let ts = start_server("ac", cfg.clone(), 19641, 19642);

  let client_a = Client::connect(
    ("127.0.0.1", ts.interactive_port),
    ("127.0.0.1", ts.broadcast_port),
    Box::new(NullView),
    cfg.client_poll_timeout,
    Duration::from_secs(60),
  )
  .unwrap();
  client_a.subscribe().unwrap();

  let client_b = Client::connect(
    ("127.0.0.1", ts.interactive_port),
    ("127.0.0.1", ts.broadcast_port),
    Box::new(StdoutView),
    cfg.client_poll_timeout,
    Duration::from_secs(60),
  )
  .unwrap();
  client_b.subscribe().unwrap();

  // Let both clients settle on the post-join snapshot before editing.
  std::thread::sleep(Duration::from_millis(100));

  client_a.insert_char('X').unwrap();

  let deadline = std::time::Instant::now() + Duration::from_secs(2);
  loop {
    if client_a.document_text() == "Xac" && client_b.document_text() == "Xac" {
      break;
    }
    assert!(
      std::time::Instant::now() < deadline,
      "clients never converged: a={:?} b={:?}",
      client_a.document_text(),
      client_b.document_text()
    );
    std::thread::sleep(Duration::from_millis(20));
  }

  client_a.unsubscribe().unwrap();
  client_b.unsubscribe().unwrap();
}

#[test]
fn pausing_background_processing_holds_off_an_in_flight_broadcast_apply() {
  let cfg = AppConfig {
    initial_batch_delay: Duration::from_millis(50),
    server_poll_timeout: Duration::from_millis(50),
    client_poll_timeout: Duration::from_millis(50),
    ..AppConfig::default()
  };
  let ts = start_server("ac", cfg.clone(), 19651, 19652);

  let client_a = Client::connect(
    ("127.0.0.1", ts.interactive_port),
    ("127.0.0.1", ts.broadcast_port),
    Box::new(NullView),
    cfg.client_poll_timeout,
    Duration::from_secs(60),
  )
  .unwrap();
  client_a.subscribe().unwrap();

  let client_b = Client::connect(
    ("127.0.0.1", ts.interactive_port),
    ("127.0.0.1", ts.broadcast_port),
    Box::new(NullView),
    cfg.client_poll_timeout,
    Duration::from_secs(60),
  )
  .unwrap();
  client_b.subscribe().unwrap();
  std::thread::sleep(Duration::from_millis(100));

  let pause = client_b.pause_background();
  client_a.insert_char('X').unwrap();
  // Give the broadcast every chance to arrive at B while paused.
  std::thread::sleep(Duration::from_millis(300));
  assert_eq!(
    client_b.document_text(),
    "ac",
    "paused client must not apply a broadcast delivered during the pause"
  );
  pause.resume();

  let deadline = std::time::Instant::now() + Duration::from_secs(2);
  loop {
    if client_b.document_text() == "Xac" {
      break;
    }
    assert!(
      std::time::Instant::now() < deadline,
      "client never applied the held-off broadcast after resuming: b={:?}",
      client_b.document_text()
    );
    std::thread::sleep(Duration::from_millis(20));
  }

  client_a.unsubscribe().unwrap();
  client_b.unsubscribe().unwrap();
}
