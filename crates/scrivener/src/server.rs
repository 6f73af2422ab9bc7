//! Server coordinator: subscription lifecycle, staleness filtering, the
//! double-buffered batch queue, adaptive batch-delay tuning, and the
//! periodic snapshot.

use std::collections::HashMap;
use std::fs;
use std::panic::{self, AssertUnwindSafe};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::{Context, Result};
use log::{info, warn};
use parking_lot::Mutex;
use scaproust::{Session, Socket};
use uuid::Uuid;

use crate::config::AppConfig;
use crate::document::{Document, Direction};
use crate::protocol::{self, Batch, OpName, OperationRecord, Reply, SubscribedInfo, WireCursor};
use crate::transport;

/// Seconds since the UNIX epoch, used as the shared notion of "now" on
/// both ends of the wire (the clock-offset source is out of scope; see
/// [`crate::client`]'s `offset`, which is always `0.0`).
pub fn unix_now_secs() -> f64 {
  SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs_f64()
}

#[derive(Default)]
struct QueueState {
  active: u8,
  q1: Vec<OperationRecord>,
  q2: Vec<OperationRecord>,
}

impl QueueState {
  fn enqueue(&mut self, op: OperationRecord) {
    if self.active == 0 {
      self.q1.push(op);
    } else {
      self.q2.push(op);
    }
  }

  /// Atomically drain the active queue and flip `activeQ` to the other one.
  fn drain_and_swap(&mut self) -> Vec<OperationRecord> {
    let drained = if self.active == 0 {
      std::mem::take(&mut self.q1)
    } else {
      std::mem::take(&mut self.q2)
    };
    self.active = 1 - self.active;
    drained
  }
}

struct SharedState {
  document: Mutex<Document>,
  queues: Mutex<QueueState>,
  subscribers: Mutex<HashMap<String, ()>>,
  latencies: Mutex<HashMap<String, f64>>,
  batch_delay_bits: AtomicU64,
  batch_delay_margin: Duration,
  broadcast: Mutex<Socket>,
  snapshot_path: PathBuf,
  request_lock: Mutex<()>,
  done: AtomicBool,
}

impl SharedState {
  fn batch_delay(&self) -> Duration {
    Duration::from_secs_f64(f64::from_bits(self.batch_delay_bits.load(Ordering::Relaxed)))
  }

  fn set_batch_delay(&self, delay: Duration) {
    self
      .batch_delay_bits
      .store(delay.as_secs_f64().to_bits(), Ordering::Relaxed);
  }

  /// Publish a batch to every subscriber. A single broadcast-socket error
  /// is logged and otherwise ignored; nanomsg's `PUB` protocol has no
  /// notion of a single dead peer poisoning the socket.
  fn broadcast(&self, payload: &[u8]) {
    if let Err(e) = self.broadcast.lock().send(payload.to_vec()) {
      warn!("broadcast send failed: {e}");
    }
  }
}

pub struct Server {
  shared: Arc<SharedState>,
  /// Kept alive for the process's lifetime; every socket above was created
  /// from it. Wrapped in a `Mutex` (never contended — nothing ever locks
  /// it) purely so `Server` is `Sync` regardless of whether `Session`
  /// itself is, since a `Server` is shared across threads via `Arc`.
  _session: Mutex<Session>,
  interactive: Mutex<Socket>,
  interactive_endpoint: Mutex<Option<scaproust::Endpoint>>,
  broadcast_endpoint: Mutex<Option<scaproust::Endpoint>>,
  batcher_handle: Mutex<Option<JoinHandle<()>>>,
  snapshot_handle: Mutex<Option<JoinHandle<()>>>,
}

impl Server {
  pub fn bind(
    document_path: &Path,
    interactive_addr: (&str, u16),
    broadcast_addr: (&str, u16),
    cfg: &AppConfig,
  ) -> Result<Self> {
    let content = fs::read_to_string(document_path).unwrap_or_default();
    let lines = crate::document::lines_from_content(&content);
    let document = Document::new(lines);

    let session = transport::open_session().context("failed to open transport session")?;
    let interactive_bound = transport::bind_interactive(&session, interactive_addr, cfg.server_poll_timeout)
      .with_context(|| format!("failed to bind interactive socket on {interactive_addr:?}"))?;
    let broadcast_bound = transport::bind_broadcast(&session, broadcast_addr)
      .with_context(|| format!("failed to bind broadcast socket on {broadcast_addr:?}"))?;

    let shared = Arc::new(SharedState {
      document: Mutex::new(document),
      queues: Mutex::new(QueueState::default()),
      subscribers: Mutex::new(HashMap::new()),
      latencies: Mutex::new(HashMap::new()),
      batch_delay_bits: AtomicU64::new(cfg.initial_batch_delay.as_secs_f64().to_bits()),
      batch_delay_margin: cfg.batch_delay_margin,
      broadcast: Mutex::new(broadcast_bound.socket),
      snapshot_path: document_path.to_path_buf(),
      request_lock: Mutex::new(()),
      done: AtomicBool::new(false),
    });

    Ok(Self {
      shared,
      _session: Mutex::new(session),
      interactive: Mutex::new(interactive_bound.socket),
      interactive_endpoint: Mutex::new(Some(interactive_bound.endpoint)),
      broadcast_endpoint: Mutex::new(Some(broadcast_bound.endpoint)),
      batcher_handle: Mutex::new(None),
      snapshot_handle: Mutex::new(None),
    })
  }

  /// Flip the shutdown flag every loop in this process checks, unbind both
  /// sockets, and join the batcher and snapshot threads. The interactive
  /// loop itself runs on whichever thread called [`Server::run`]; like the
  /// original's `listenThread`, that thread is expected to belong to the
  /// caller, not to `stop`, so it is not joined here — it exits on its own
  /// once it next wakes from its bounded `recv` and observes `done`.
  pub fn stop(&self) {
    self.shared.done.store(true, Ordering::Relaxed);

    if let Some(endpoint) = self.interactive_endpoint.lock().take()
      && let Err(e) = endpoint.shutdown()
    {
      warn!("failed to unbind interactive socket: {e}");
    }
    if let Some(endpoint) = self.broadcast_endpoint.lock().take()
      && let Err(e) = endpoint.shutdown()
    {
      warn!("failed to unbind broadcast socket: {e}");
    }

    if let Some(handle) = self.batcher_handle.lock().take() {
      let _ = handle.join();
    }
    if let Some(handle) = self.snapshot_handle.lock().take() {
      let _ = handle.join();
    }
  }

  /// Run the server to completion: spawns the batcher and snapshot
  /// threads, then blocks the calling thread running the interactive
  /// request loop.
  pub fn run(&self, cfg: &AppConfig) -> Result<()> {
    let batcher_state = self.shared.clone();
    let batcher_handle = std::thread::Builder::new()
      .name("scrivener-batcher".to_string())
      .spawn(move || run_batcher(&batcher_state))
      .context("failed to spawn batcher thread")?;
    *self.batcher_handle.lock() = Some(batcher_handle);

    let snapshot_state = self.shared.clone();
    let snapshot_interval = cfg.snapshot_interval;
    let snapshot_handle = std::thread::Builder::new()
      .name("scrivener-snapshot".to_string())
      .spawn(move || run_snapshot_task(&snapshot_state, snapshot_interval))
      .context("failed to spawn snapshot thread")?;
    *self.snapshot_handle.lock() = Some(snapshot_handle);

    run_interactive_loop(self)
  }
}

/// A single request/reply socket serializes request handling: one
/// `recv`, dispatch, one `send`, repeat — matching the original's
/// single-threaded `continuouslyListen` poll loop exactly, rather than
/// spawning a thread per connection.
fn run_interactive_loop(server: &Server) -> Result<()> {
  while !server.shared.done.load(Ordering::Relaxed) {
    let mut socket = server.interactive.lock();
    match transport::try_read_frame(&mut socket) {
      Ok(Some(frame)) => {
        let reply = handle_request(&server.shared, &frame);
        if let Err(e) = socket.send(reply) {
          warn!("failed to send interactive reply: {e}");
        }
      }
      Ok(None) => {}
      Err(e) => warn!("interactive socket recv error: {e}"),
    }
  }
  Ok(())
}

/// Decode, dispatch, and reply to exactly one interactive-socket message.
/// Wrapped in `catch_unwind` so a panic anywhere in dispatch still
/// produces the one reply the socket's strict alternation requires.
fn handle_request(shared: &Arc<SharedState>, frame: &[u8]) -> Vec<u8> {
  let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
    let _guard = shared.request_lock.lock();
    process_request(shared, frame)
  }));
  let reply = outcome.unwrap_or_else(|_| {
    warn!("request handler panicked; replying with failure");
    Reply::failure("Internal error", "handler panicked")
  });
  reply.to_wire_string().into_bytes()
}

fn process_request(shared: &Arc<SharedState>, frame: &[u8]) -> Reply {
  let text = String::from_utf8_lossy(frame);
  let op = match OperationRecord::decode(&text) {
    Ok(op) => op,
    Err(e) => {
      warn!("malformed interactive message: {e}");
      return Reply::failure("Malformed message", &text);
    }
  };
  let Ok(name) = op.op_name() else {
    return Reply::Fail("No RPC matches this contract");
  };
  match name {
    OpName::Subscribe => handle_subscribe(shared),
    OpName::Unsubscribe => handle_unsubscribe(shared, &op),
    OpName::EchoResponse => handle_echo_response(shared, &op),
    OpName::MoveCursor | OpName::InsertChar => handle_edit(shared, op),
    OpName::CreateCursor | OpName::RemoveCursor => Reply::Fail("No RPC matches this contract"),
  }
}

fn handle_subscribe(shared: &Arc<SharedState>) -> Reply {
  // The cursor id has two wire representations derived from the same
  // 128-bit value: the decimal-string form used everywhere a cursor id
  // appears as a string (`args`, `OperationRecord.uuid`, `cursors`' map
  // keys), and the bare numeric form carried only in the subscribe
  // reply's `other.uuid` field (see `SubscribedInfo::uuid`).
  let cursor_uuid = Uuid::new_v4().as_u128();
  let new_id = cursor_uuid.to_string();
  let (file, cursors) = {
    let mut doc = shared.document.lock();
    doc.create(&new_id, 0, 0);
    let file = doc.lines().to_vec();
    let cursors = doc
      .cursors()
      .iter()
      .map(|(cid, c)| (cid.clone(), WireCursor { cx: c.col, cy: c.line }))
      .collect::<HashMap<_, _>>();
    (file, cursors)
  };
  shared.subscribers.lock().insert(new_id.clone(), ());
  info!("subscriber {new_id} joined");

  let announce: Batch = vec![OperationRecord::control(
    new_id.clone(),
    OpName::CreateCursor,
    vec![new_id.clone()],
  )];
  shared.broadcast(protocol::encode_batch(&announce).as_bytes());

  Reply::Subscribed(SubscribedInfo {
    uuid: cursor_uuid,
    file,
    cursors,
  })
}

fn handle_unsubscribe(shared: &Arc<SharedState>, op: &OperationRecord) -> Reply {
  let Some(uuid) = op.args.first() else {
    return Reply::Fail("No RPC matches this contract");
  };
  shared.document.lock().remove(uuid);
  shared.subscribers.lock().remove(uuid);
  shared.latencies.lock().remove(uuid);
  recompute_batch_delay(shared);
  info!("subscriber {uuid} left");

  let announce: Batch = vec![OperationRecord::control(
    uuid.clone(),
    OpName::RemoveCursor,
    vec![uuid.clone()],
  )];
  shared.broadcast(protocol::encode_batch(&announce).as_bytes());
  Reply::Null
}

/// Five timestamps, 10ms apart, re-aligned to their originating instant
/// and averaged into a round-trip latency estimate. The realignment term
/// `0.01 * (5 - i)` compensates for the fixed inter-sample spacing; this
/// is a known approximation, not re-derived here.
fn handle_echo_response(shared: &Arc<SharedState>, op: &OperationRecord) -> Reply {
  if op.args.len() != 5 {
    return Reply::Fail("No RPC matches this contract");
  }
  let samples: Option<Vec<f64>> = op.args.iter().map(|s| s.parse::<f64>().ok()).collect();
  let Some(samples) = samples else {
    return Reply::Fail("No RPC matches this contract");
  };
  let now = unix_now_secs();
  let sum: f64 = samples
    .iter()
    .enumerate()
    .map(|(i, t)| now - (t - 0.01 * (5 - i) as f64))
    .sum();
  let latency = sum / 5.0;
  shared.latencies.lock().insert(op.uuid.clone(), latency);
  recompute_batch_delay(shared);
  Reply::Null
}

fn recompute_batch_delay(shared: &Arc<SharedState>) {
  let latencies = shared.latencies.lock();
  let max = latencies
    .values()
    .copied()
    .fold(None::<f64>, |acc, v| Some(acc.map_or(v, |m| m.max(v))));
  if let Some(max) = max {
    shared.set_batch_delay(Duration::from_secs_f64(max) + shared.batch_delay_margin);
  }
}

fn handle_edit(shared: &Arc<SharedState>, op: OperationRecord) -> Reply {
  let Some(time) = op.time else {
    return Reply::failure("Malformed message", &op.encode());
  };
  let now = unix_now_secs();
  let batch_delay = shared.batch_delay().as_secs_f64();
  if time < now - batch_delay {
    return Reply::Dropped;
  }
  shared.queues.lock().enqueue(op);
  Reply::Null
}

fn run_batcher(shared: &Arc<SharedState>) {
  while !shared.done.load(Ordering::Relaxed) {
    std::thread::sleep(shared.batch_delay());
    let mut batch = shared.queues.lock().drain_and_swap();
    if batch.is_empty() {
      continue;
    }
    batch.sort_by(|a, b| {
      a.time
        .partial_cmp(&b.time)
        .unwrap_or(std::cmp::Ordering::Equal)
    });
    {
      let mut doc = shared.document.lock();
      for op in &batch {
        apply_edit_to_document(&mut doc, op);
      }
    }
    shared.broadcast(protocol::encode_batch(&batch).as_bytes());
  }
}

/// Replay one data-plane operation record onto `doc`. Shared between the
/// server's batcher and the client's inbound-batch application.
pub fn apply_edit_to_document(doc: &mut Document, op: &OperationRecord) {
  let Ok(name) = op.op_name() else { return };
  match name {
    OpName::MoveCursor => {
      if let [cid, dir] = &op.args[..]
        && let Ok(dir) = Direction::from_str(dir)
      {
        doc.move_cursor(cid, dir);
      }
    }
    OpName::InsertChar => {
      if let [cid, ch] = &op.args[..]
        && let Some(c) = ch.chars().next()
      {
        doc.insert_char(cid, c);
      }
    }
    OpName::CreateCursor => {
      if let [cid] = &op.args[..] {
        doc.create(cid, 0, 0);
      }
    }
    OpName::RemoveCursor => {
      if let [cid] = &op.args[..] {
        doc.remove(cid);
      }
    }
    OpName::Subscribe | OpName::Unsubscribe | OpName::EchoResponse => {}
  }
}

fn run_snapshot_task(shared: &Arc<SharedState>, interval: Duration) {
  while !shared.done.load(Ordering::Relaxed) {
    std::thread::sleep(interval);
    let content = shared.document.lock().to_content();
    if let Err(e) = fs::write(&shared.snapshot_path, content) {
      warn!(
        "failed to write snapshot to {}: {e}",
        shared.snapshot_path.display()
      );
    }
  }
}
