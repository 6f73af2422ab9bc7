//! Client coordinator: subscribe handshake, late-join buffering, inbound
//! batch application, outbound edit emission, and the echo probe that
//! feeds the server's adaptive batch-delay tuning.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use log::{info, warn};
use parking_lot::{Mutex, MutexGuard};
use scaproust::{Session, Socket};

use crate::document::{Cursor, Direction, Document, EditorView};
use crate::protocol::{self, Batch, OpName, OperationRecord, SubscribeReplyEnvelope, SubscribedInfo};
use crate::server::{apply_edit_to_document, unix_now_secs};
use crate::transport;

/// Prints each document-model callback to stdout. Stands in for the
/// terminal UI, which is out of scope.
#[derive(Default)]
pub struct StdoutView;

impl EditorView for StdoutView {
  fn add_line(&mut self, pos: usize, text: &str, cursor_cols: &[usize]) {
    println!("+{pos:>4} | {text}  (cursors at {cursor_cols:?})");
  }

  fn change_line(&mut self, pos: usize, text: &str, cursor_cols: &[usize]) {
    println!(" {pos:>4} | {text}  (cursors at {cursor_cols:?})");
  }

  fn delete_line(&mut self, pos: usize) {
    println!("-{pos:>4} |");
  }
}

#[derive(Default)]
struct LoadState {
  queue: VecDeque<Batch>,
  fully_loaded: bool,
}

/// Held while a caller is performing a multi-step local operation that
/// must not be interleaved with an inbound broadcast apply. Returned by
/// [`Client::pause_background`]; dropping it resumes background
/// processing, the same as calling [`BackgroundPause::resume`].
pub struct BackgroundPause<'a> {
  _guard: MutexGuard<'a, ()>,
}

impl BackgroundPause<'_> {
  /// Resume background processing. Equivalent to dropping this guard.
  pub fn resume(self) {}
}

pub struct Client {
  /// Kept alive for the process's lifetime; both sockets below were
  /// created from it. Wrapped in a `Mutex` (never contended — nothing
  /// ever locks it) purely so `Client` is `Sync` regardless of whether
  /// `Session` itself is, since a `Client` is shared across threads via
  /// `Arc`.
  _session: Mutex<Session>,
  interactive: Mutex<Socket>,
  document: Mutex<Document>,
  load_state: Mutex<LoadState>,
  my_cursor: Mutex<Option<String>>,
  /// Held by the inbound loop around each delivered message's decode and
  /// apply; a caller can acquire it via [`Client::pause_background`] to
  /// pause background processing while performing a multi-step local
  /// operation.
  background_pause: Mutex<()>,
  stopped: Arc<AtomicBool>,
  /// Scalar seconds between the local clock and a shared reference clock.
  /// Always `0.0` here (the offset source is out of scope) but still
  /// guarded by its own mutex so a real source could be substituted later.
  offset: Mutex<f64>,
  echo_interval: Duration,
}

impl Client {
  /// Connect both sockets and start the background inbound and echo-probe
  /// loops. Does not subscribe yet — call [`Client::subscribe`] next.
  pub fn connect(
    interactive_addr: (&str, u16),
    broadcast_addr: (&str, u16),
    view: Box<dyn EditorView>,
    poll_timeout: Duration,
    echo_interval: Duration,
  ) -> Result<Arc<Self>> {
    let session = transport::open_session().context("failed to open transport session")?;
    let interactive = transport::connect_interactive(&session, interactive_addr, poll_timeout)
      .with_context(|| format!("failed to connect interactive socket to {interactive_addr:?}"))?;
    let broadcast = transport::connect_broadcast(&session, broadcast_addr, poll_timeout)
      .with_context(|| format!("failed to connect broadcast socket to {broadcast_addr:?}"))?;

    let client = Arc::new(Self {
      _session: Mutex::new(session),
      interactive: Mutex::new(interactive),
      document: Mutex::new(Document::with_view(Vec::new(), view)),
      load_state: Mutex::new(LoadState::default()),
      my_cursor: Mutex::new(None),
      background_pause: Mutex::new(()),
      stopped: Arc::new(AtomicBool::new(false)),
      offset: Mutex::new(0.0),
      echo_interval,
    });

    let inbound_client = client.clone();
    std::thread::Builder::new()
      .name("scrivener-inbound".to_string())
      .spawn(move || run_inbound_loop(&inbound_client, broadcast))
      .context("failed to spawn inbound-loop thread")?;

    let echo_client = client.clone();
    std::thread::Builder::new()
      .name("scrivener-echo".to_string())
      .spawn(move || run_echo_task(&echo_client))
      .context("failed to spawn echo-probe thread")?;

    Ok(client)
  }

  /// Send `subscribe`, install the returned snapshot, then drain any
  /// broadcasts that arrived while the handshake was in flight.
  pub fn subscribe(&self) -> Result<String> {
    let request = OperationRecord::control(
      protocol::unassigned_cursor_id(),
      OpName::Subscribe,
      Vec::new(),
    );
    let reply_text = self.send_interactive(&request)?;
    let info = decode_subscribed_reply(&reply_text)?;
    let cursor_id = info.uuid.to_string();

    *self.my_cursor.lock() = Some(cursor_id.clone());
    install_snapshot(&self.document, &info);
    info!("subscribed as {cursor_id}");

    let mut state = self.load_state.lock();
    while let Some(batch) = state.queue.pop_front() {
      apply_batch(&self.document, &batch);
    }
    state.fully_loaded = true;
    drop(state);

    Ok(cursor_id)
  }

  pub fn unsubscribe(&self) -> Result<()> {
    self.stopped.store(true, Ordering::Relaxed);
    let Some(cid) = self.my_cursor.lock().clone() else {
      return Ok(());
    };
    let request = OperationRecord::control(cid.clone(), OpName::Unsubscribe, vec![cid]);
    let _ = self.send_interactive(&request);
    Ok(())
  }

  /// Pause background processing of inbound broadcasts, to atomically
  /// perform a multi-step local operation. The inbound loop holds this
  /// same lock around each delivered message's decode and apply, so it
  /// blocks until the current message (if any) finishes, then waits for
  /// the returned guard to be dropped — or resumed via
  /// [`BackgroundPause::resume`] — before applying the next one.
  #[must_use]
  pub fn pause_background(&self) -> BackgroundPause<'_> {
    BackgroundPause {
      _guard: self.background_pause.lock(),
    }
  }

  /// Emit a local cursor move. Does not touch the local document: it only
  /// advances once the broadcast echo of this operation comes back.
  pub fn move_cursor(&self, direction: Direction) -> Result<()> {
    let cid = self.require_cursor()?;
    let ltime = self.adjusted_now();
    let op = OperationRecord::new(
      cid.clone(),
      OpName::MoveCursor,
      vec![cid, direction.to_string()],
      Some(ltime),
    );
    self.emit(&op)
  }

  pub fn insert_char(&self, c: char) -> Result<()> {
    let cid = self.require_cursor()?;
    let ltime = self.adjusted_now();
    let op = OperationRecord::new(
      cid.clone(),
      OpName::InsertChar,
      vec![cid, c.to_string()],
      Some(ltime),
    );
    self.emit(&op)
  }

  #[must_use]
  pub fn document_text(&self) -> String {
    self.document.lock().to_content()
  }

  #[must_use]
  pub fn cursor_id(&self) -> Option<String> {
    self.my_cursor.lock().clone()
  }

  fn require_cursor(&self) -> Result<String> {
    self
      .my_cursor
      .lock()
      .clone()
      .ok_or_else(|| anyhow!("not subscribed yet"))
  }

  fn adjusted_now(&self) -> f64 {
    let offset = *self.offset.lock();
    unix_now_secs() - offset
  }

  fn emit(&self, op: &OperationRecord) -> Result<()> {
    match self.send_interactive(op) {
      Ok(reply) => {
        if reply.contains("\"dropped\"") || reply.starts_with("Failure") {
          warn!("edit not applied by server: {reply}");
        }
        Ok(())
      }
      Err(e) => {
        warn!("failed to send edit: {e}");
        Err(e)
      }
    }
  }

  fn send_interactive(&self, op: &OperationRecord) -> Result<String> {
    let mut stream = self.interactive.lock();
    let reply = transport::send_request(&mut stream, op.encode().as_bytes())
      .context("interactive socket request failed")?;
    Ok(String::from_utf8_lossy(&reply).into_owned())
  }
}

fn install_snapshot(document: &Mutex<Document>, info: &SubscribedInfo) {
  let cursors: HashMap<String, Cursor> = info
    .cursors
    .iter()
    .map(|(cid, w)| (cid.clone(), Cursor { line: w.cy, col: w.cx }))
    .collect();
  document.lock().install_snapshot(info.file.clone(), cursors);
}

/// Deserializes straight into [`SubscribeReplyEnvelope`] rather than a
/// generic `Value`, which is what lets `other.uuid` keep its full u128
/// precision instead of being downgraded to a lossy float along the way.
fn decode_subscribed_reply(text: &str) -> Result<SubscribedInfo> {
  if text.starts_with("Failure") {
    return Err(anyhow!("subscribe failed: {text}"));
  }
  let envelope: SubscribeReplyEnvelope =
    serde_json::from_str(text).context("subscribe reply was not valid JSON")?;
  if envelope.status != "subscribed" {
    return Err(anyhow!("subscribe failed: {text}"));
  }
  Ok(envelope.other)
}

fn apply_batch(document: &Mutex<Document>, batch: &Batch) {
  let mut doc = document.lock();
  for op in batch {
    apply_edit_to_document(&mut doc, op);
  }
}

fn run_inbound_loop(client: &Arc<Client>, mut broadcast: Socket) {
  while !client.stopped.load(Ordering::Relaxed) {
    // Not held across the blocking read itself — only a caller's pending
    // `pause_background` guard should delay delivery, not every idle poll.
    let frame = match transport::try_read_frame(&mut broadcast) {
      Ok(Some(bytes)) => bytes,
      Ok(None) => continue,
      Err(e) => {
        warn!("broadcast socket closed: {e}");
        break;
      }
    };

    // Held around this whole message's decode and apply, matching
    // `Client::pause_background`'s contract.
    let pause_guard = client.background_pause.lock();

    let text = String::from_utf8_lossy(&frame);
    let batch = match protocol::decode_batch(&text) {
      Ok(batch) => batch,
      Err(e) => {
        warn!("failed to decode broadcast batch: {e}");
        drop(pause_guard);
        continue;
      }
    };

    let mut state = client.load_state.lock();
    if state.fully_loaded && state.queue.is_empty() {
      drop(state);
      apply_batch(&client.document, &batch);
    } else {
      state.queue.push_back(batch);
    }
    drop(pause_guard);
  }
}

fn run_echo_task(client: &Arc<Client>) {
  while !client.stopped.load(Ordering::Relaxed) {
    sleep_checking_stopped(client, client.echo_interval);
    if client.stopped.load(Ordering::Relaxed) {
      break;
    }
    let Some(cid) = client.my_cursor.lock().clone() else {
      continue;
    };
    let mut samples = Vec::with_capacity(5);
    for _ in 0..5 {
      samples.push(client.adjusted_now().to_string());
      std::thread::sleep(Duration::from_millis(10));
    }
    let op = OperationRecord::control(cid, OpName::EchoResponse, samples);
    if let Err(e) = client.send_interactive(&op) {
      warn!("echo probe failed: {e}");
    }
  }
}

fn sleep_checking_stopped(client: &Arc<Client>, total: Duration) {
  let step = Duration::from_millis(100);
  let mut slept = Duration::ZERO;
  while slept < total {
    if client.stopped.load(Ordering::Relaxed) {
      return;
    }
    let this_step = step.min(total - slept);
    std::thread::sleep(this_step);
    slept += this_step;
  }
}
