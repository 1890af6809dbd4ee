//! SSH transport for the remote event stream
//!
//! libssh2 is blocking, so session setup and the read loop run on the
//! blocking pool. The read loop polls with a short session timeout so it
//! can notice cancellation and send keepalives while the stream is quiet.

use async_trait::async_trait;
use parking_lot::Mutex;
use ssh2::Session;
use std::io::{BufRead, BufReader, ErrorKind};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};
use validator::Validate;

use events_core::config::ConnectSpec;
use events_core::{Component, ConnectionState, EventsError, Result};

use super::{ConnectionStatus, Transport};
use crate::watchdog::ActivityClock;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(30);
const POLL_INTERVAL_MS: u32 = 500;
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);

pub struct SshTransport {
    spec: ConnectSpec,
    clock: ActivityClock,
    status: ConnectionStatus,
    session: Mutex<Option<Session>>,
}

impl SshTransport {
    pub fn new(spec: ConnectSpec, clock: ActivityClock, status: ConnectionStatus) -> Self {
        Self {
            spec,
            clock,
            status,
            session: Mutex::new(None),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status.clone()
    }

    async fn open_session(&self) -> Result<Session> {
        let spec = self.spec.clone();
        tokio::task::spawn_blocking(move || connect(&spec))
            .await
            .map_err(|e| EventsError::Internal(e.to_string()))?
    }
}

fn ssh_error(context: &'static str) -> impl Fn(ssh2::Error) -> EventsError {
    move |e| EventsError::Connection(format!("{}: {}", context, e))
}

fn connect(spec: &ConnectSpec) -> Result<Session> {
    let ssh = &spec.ssh;
    let addr = (spec.hostname.as_str(), ssh.port)
        .to_socket_addrs()
        .map_err(|e| EventsError::Connection(format!("failed to resolve {}: {}", spec.hostname, e)))?
        .next()
        .ok_or_else(|| EventsError::Connection(format!("no address for {}", spec.hostname)))?;

    let tcp = TcpStream::connect_timeout(&addr, CONNECT_TIMEOUT)
        .map_err(|e| EventsError::Connection(format!("failed to dial {}: {}", addr, e)))?;

    let mut session = Session::new().map_err(ssh_error("failed to create session"))?;
    session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
    session.set_tcp_stream(tcp);
    session.handshake().map_err(ssh_error("handshake failed"))?;
    session
        .userauth_pubkey_file(
            &ssh.username,
            None,
            Path::new(&ssh.keyfile),
            ssh.passphrase(),
        )
        .map_err(ssh_error("authentication failed"))?;

    if !session.authenticated() {
        return Err(EventsError::Connection(format!(
            "authentication rejected for {}",
            ssh.username
        )));
    }

    session.set_keepalive(true, KEEPALIVE_INTERVAL.as_secs() as u32);
    Ok(session)
}

/// Strip the line terminator; blank lines carry no event.
///
/// Lines that are not UTF-8 are rejected rather than rewritten.
fn decode_line(raw: &[u8]) -> Result<Option<String>> {
    let line = std::str::from_utf8(raw)
        .map_err(|e| EventsError::Connection(format!("stream line is not UTF-8: {}", e)))?;
    let line = line.trim_end_matches(['\n', '\r']);
    if line.trim().is_empty() {
        Ok(None)
    } else {
        Ok(Some(line.to_string()))
    }
}

/// Callbacks driven by [`read_lines`]
trait StreamHooks {
    /// Bytes arrived from the peer
    fn progress(&mut self);

    fn line(&mut self, line: String) -> Result<()>;

    /// A poll timed out with nothing new to read
    fn idle(&mut self) -> Result<()>;

    fn stopped(&self) -> bool;
}

/// Split a polled byte stream into lines.
///
/// A partial line survives poll timeouts; a final unterminated line is
/// delivered at EOF.
fn read_lines<R: BufRead, H: StreamHooks>(reader: &mut R, hooks: &mut H) -> Result<()> {
    let mut buf = Vec::new();

    while !hooks.stopped() {
        let before = buf.len();
        let read = reader.read_until(b'\n', &mut buf);
        if buf.len() > before {
            hooks.progress();
        }

        match read {
            Ok(0) => {
                if let Some(line) = decode_line(&buf)? {
                    hooks.line(line)?;
                }
                info!("Remote event stream ended");
                break;
            }
            Ok(_) => {
                // Only EOF returns a line without its terminator.
                if buf.ends_with(b"\n") {
                    if let Some(line) = decode_line(&buf)? {
                        hooks.line(line)?;
                    }
                    buf.clear();
                }
            }
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                hooks.idle()?;
            }
            Err(e) if e.kind() == ErrorKind::Interrupted => {}
            Err(e) => {
                return Err(EventsError::Connection(format!("stream read failed: {}", e)));
            }
        }
    }

    Ok(())
}

struct KeepaliveTimer {
    interval: Duration,
    last: Instant,
}

impl KeepaliveTimer {
    fn new(interval: Duration, now: Instant) -> Self {
        Self { interval, last: now }
    }

    fn due(&mut self, now: Instant) -> bool {
        if now.duration_since(self.last) >= self.interval {
            self.last = now;
            true
        } else {
            false
        }
    }
}

/// Production hooks: forward lines to the sink and keep the session alive.
///
/// Only reads touch the activity clock. A keepalive that was merely written
/// says nothing about the peer.
struct SinkHooks<K> {
    sink: mpsc::Sender<String>,
    cancel: CancellationToken,
    clock: ActivityClock,
    timer: KeepaliveTimer,
    keepalive: K,
}

impl<K: FnMut() -> Result<()>> StreamHooks for SinkHooks<K> {
    fn progress(&mut self) {
        self.clock.touch();
    }

    fn line(&mut self, line: String) -> Result<()> {
        self.sink
            .blocking_send(line)
            .map_err(|_| EventsError::Queue("event sink closed".to_string()))
    }

    fn idle(&mut self) -> Result<()> {
        if self.timer.due(Instant::now()) {
            (self.keepalive)()?;
        }
        Ok(())
    }

    fn stopped(&self) -> bool {
        self.cancel.is_cancelled() || self.sink.is_closed()
    }
}

fn pump(
    session: Session,
    command: String,
    sink: mpsc::Sender<String>,
    cancel: CancellationToken,
    clock: ActivityClock,
) -> Result<()> {
    session.set_timeout(CONNECT_TIMEOUT.as_millis() as u32);
    let mut channel = session
        .channel_session()
        .map_err(ssh_error("failed to open channel"))?;
    channel
        .exec(&command)
        .map_err(ssh_error("failed to run remote command"))?;

    session.set_timeout(POLL_INTERVAL_MS);
    clock.touch();

    let mut hooks = SinkHooks {
        sink,
        cancel,
        clock,
        timer: KeepaliveTimer::new(KEEPALIVE_INTERVAL, Instant::now()),
        keepalive: || {
            session
                .keepalive_send()
                .map(|_| ())
                .map_err(ssh_error("keepalive failed"))
        },
    };

    let mut reader = BufReader::new(channel);
    let result = read_lines(&mut reader, &mut hooks);

    let mut channel = reader.into_inner();
    if let Err(e) = channel.close() {
        debug!(error = %e, "Failed to close channel");
    }
    result
}

fn disconnect(session: Session, reason: &str) {
    if let Err(e) = session.disconnect(None, reason, None) {
        debug!(error = %e, "SSH disconnect failed");
    }
}

#[async_trait]
impl Component for SshTransport {
    fn name(&self) -> &'static str {
        "ssh"
    }

    #[instrument(skip(self), fields(host = %self.spec.hostname, port = self.spec.ssh.port))]
    async fn init(&self) -> Result<()> {
        debug!("ssh: init");

        self.spec.validate()?;
        if !Path::new(&self.spec.ssh.keyfile).is_file() {
            return Err(EventsError::Config(format!(
                "keyfile {} not found",
                self.spec.ssh.keyfile
            )));
        }

        let session = self.open_session().await?;
        *self.session.lock() = Some(session);
        self.clock.touch();

        info!(user = %self.spec.ssh.username, "SSH session established");
        Ok(())
    }

    async fn deinit(&self) -> Result<()> {
        debug!("ssh: deinit");

        let session = self.session.lock().take();
        if let Some(session) = session {
            let _ = tokio::task::spawn_blocking(move || disconnect(session, "shutdown")).await;
        }
        self.status.set(ConnectionState::Disconnected);
        Ok(())
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn start(
        &self,
        command: &str,
        sink: mpsc::Sender<String>,
        cancel: CancellationToken,
    ) -> Result<()> {
        debug!(command, "ssh: start");

        let session = self
            .session
            .lock()
            .clone()
            .ok_or_else(|| EventsError::Connection("session is not established".to_string()))?;

        self.status.set(ConnectionState::Streaming);
        let command = command.to_string();
        let clock = self.clock.clone();
        let result = tokio::task::spawn_blocking(move || pump(session, command, sink, cancel, clock))
            .await
            .map_err(|e| EventsError::Internal(e.to_string()))
            .and_then(|r| r);
        self.status.set(ConnectionState::Disconnected);

        result
    }

    async fn reconnect(&self) -> Result<()> {
        debug!("ssh: reconnect");
        self.status.set(ConnectionState::Reconnecting);

        let stale = self.session.lock().take();
        if let Some(stale) = stale {
            let _ = tokio::task::spawn_blocking(move || disconnect(stale, "reconnect")).await;
        }

        let result = self.open_session().await;
        self.status.set(ConnectionState::Disconnected);

        let session = result.map_err(|e| {
            warn!(error = %e, "SSH reconnect failed");
            e
        })?;
        *self.session.lock() = Some(session);
        self.clock.touch();

        info!(host = %self.spec.hostname, "SSH session re-established");
        Ok(())
    }

    fn state(&self) -> ConnectionState {
        self.status.get()
    }
}
