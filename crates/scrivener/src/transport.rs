//! Transport endpoints: request/reply and publish/subscribe sockets built
//! on `scaproust`'s nanomsg scalability protocols, in place of bare TCP
//! sockets and a hand-rolled frame codec. Every send/recv here already
//! carries one whole message, so there is no length prefix to manage.

use std::io;
use std::time::Duration;

use scaproust::{Endpoint, Session, Socket, SocketOption, SocketType};

/// The broadcast channel carries no topic partitioning; subscribing to the
/// empty-string prefix matches every message a `PUB` socket sends.
const ALL_TOPICS: &str = "";

fn tcp_addr(addr: (&str, u16)) -> String {
  format!("tcp://{}:{}", addr.0, addr.1)
}

/// Opens the nanomsg session every socket on one side of the wire is
/// created from. One session is kept alive for the life of the process.
pub fn open_session() -> io::Result<Session> {
  Session::new()
}

/// A bound socket paired with the endpoint handle needed to unbind it.
pub struct BoundSocket {
  pub socket: Socket,
  pub endpoint: Endpoint,
}

impl BoundSocket {
  /// Unbind the listening endpoint, releasing the port.
  pub fn unbind(self) -> io::Result<()> {
    self.endpoint.shutdown()
  }
}

/// Binds the request/reply socket a host accepts interactive requests on.
/// `poll_timeout` bounds each `recv`, so the caller's loop can re-check a
/// shutdown flag instead of blocking forever.
pub fn bind_interactive(
  session: &Session,
  addr: (&str, u16),
  poll_timeout: Duration,
) -> io::Result<BoundSocket> {
  let mut socket = session.create_socket(SocketType::Rep)?;
  socket.set_recv_timeout(poll_timeout)?;
  let endpoint = socket.bind(&tcp_addr(addr))?;
  Ok(BoundSocket { socket, endpoint })
}

/// Binds the publish socket batches are broadcast on. Nanomsg's `PUB`
/// protocol fans a single `send` out to every connected subscriber, so
/// unlike a raw TCP listener this needs no accept loop or sink list.
pub fn bind_broadcast(session: &Session, addr: (&str, u16)) -> io::Result<BoundSocket> {
  let mut socket = session.create_socket(SocketType::Pub)?;
  let endpoint = socket.bind(&tcp_addr(addr))?;
  Ok(BoundSocket { socket, endpoint })
}

/// Connects a client's request socket to a host's interactive endpoint.
/// `poll_timeout` bounds each `recv`, so a request against an unreachable
/// or unresponsive host fails instead of blocking forever (nanomsg's `REQ`
/// socket connects asynchronously and does not itself surface a refused
/// connection as a `connect` error).
pub fn connect_interactive(session: &Session, addr: (&str, u16), poll_timeout: Duration) -> io::Result<Socket> {
  let mut socket = session.create_socket(SocketType::Req)?;
  socket.connect(&tcp_addr(addr))?;
  socket.set_recv_timeout(poll_timeout)?;
  Ok(socket)
}

/// Connects a client's subscribe socket to a host's broadcast endpoint,
/// subscribed to every topic, with `recv` bounded by `poll_timeout`.
pub fn connect_broadcast(
  session: &Session,
  addr: (&str, u16),
  poll_timeout: Duration,
) -> io::Result<Socket> {
  let mut socket = session.create_socket(SocketType::Sub)?;
  socket.connect(&tcp_addr(addr))?;
  socket.set_option(SocketOption::Subscribe(ALL_TOPICS.to_string()))?;
  socket.set_recv_timeout(poll_timeout)?;
  Ok(socket)
}

/// Send one request and block for the matching reply; the `REQ`/`REP`
/// pairing enforces one reply per request, so no correlation id is needed
/// on top of it.
pub fn send_request(socket: &mut Socket, payload: &[u8]) -> io::Result<Vec<u8>> {
  socket.send(payload.to_vec())?;
  socket.recv()
}

/// Poll a socket once for a frame, treating a timed-out read as "nothing
/// yet" so the caller's loop can check its shutdown flag and try again.
/// Used for both the server's interactive loop and a client's broadcast
/// loop.
pub fn try_read_frame(socket: &mut Socket) -> io::Result<Option<Vec<u8>>> {
  match socket.recv() {
    Ok(frame) => Ok(Some(frame)),
    Err(e) if e.kind() == io::ErrorKind::TimedOut => Ok(None),
    Err(e) => Err(e),
  }
}
