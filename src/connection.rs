//! Connection lifecycle and query submission.
//!
//! One [`Connection`] owns one socket. Many caller tasks may submit queries
//! concurrently; exactly one reader task drains the socket and routes
//! responses to the waiters registered under their tokens. The write half is
//! guarded by an async mutex held only while a frame is emitted, so frames
//! from concurrent submitters never interleave.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{oneshot, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::debug;

use crate::codec::{self, Response, HEADER_LEN};
use crate::cursor::Cursor;
use crate::datum::Datum;
use crate::error::{ReqlDriverError, ReqlError, Result};
use crate::handshake::Handshake;
use crate::proto::{QueryType, ResponseType};
use crate::query::RunOptions;
use crate::term::Term;

const DEFAULT_HOST: &str = "localhost";
const DEFAULT_PORT: u16 = 28015;
const DEFAULT_USER: &str = "admin";
const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
type Waiter = oneshot::Sender<Result<Response>>;

/// TLS settings: the CA bundle used to verify the server certificate.
#[derive(Debug, Clone)]
pub struct TlsOptions {
  pub ca_certs: PathBuf,
}

/// Everything `connect` needs; no environment variables are consulted.
#[derive(Debug, Clone)]
pub struct ConnectOptions {
  pub host: String,
  pub port: u16,
  pub db: Option<String>,
  pub user: String,
  pub password: String,
  pub timeout: Duration,
  pub tls: Option<TlsOptions>,
}

impl Default for ConnectOptions {
  fn default() -> Self {
    Self {
      host: DEFAULT_HOST.to_string(),
      port: DEFAULT_PORT,
      db: None,
      user: DEFAULT_USER.to_string(),
      password: String::new(),
      timeout: DEFAULT_TIMEOUT,
      tls: None,
    }
  }
}

impl ConnectOptions {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn host(mut self, host: impl Into<String>) -> Self {
    self.host = host.into();
    self
  }

  pub fn port(mut self, port: u16) -> Self {
    self.port = port;
    self
  }

  /// Default database for unqualified `table(...)` terms.
  pub fn db(mut self, db: impl Into<String>) -> Self {
    self.db = Some(db.into());
    self
  }

  pub fn user(mut self, user: impl Into<String>) -> Self {
    self.user = user.into();
    self
  }

  pub fn password(mut self, password: impl Into<String>) -> Self {
    self.password = password.into();
    self
  }

  /// Wall-clock budget for DNS, TCP, TLS, and the full handshake.
  pub fn timeout(mut self, timeout: Duration) -> Self {
    self.timeout = timeout;
    self
  }

  pub fn tls(mut self, tls: TlsOptions) -> Self {
    self.tls = Some(tls);
    self
  }
}

/// Identity of the server behind a connection.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerInfo {
  pub id: String,
  pub name: String,
  #[serde(default)]
  pub proxy: bool,
}

/// What a successful run produced.
pub enum RunResult {
  /// A single decoded value.
  Atom(Datum),
  /// A streaming handle over a multi-batch sequence.
  Cursor(Cursor),
}

impl RunResult {
  pub fn atom(self) -> Option<Datum> {
    match self {
      RunResult::Atom(datum) => Some(datum),
      RunResult::Cursor(_) => None,
    }
  }

  pub fn cursor(self) -> Option<Cursor> {
    match self {
      RunResult::Atom(_) => None,
      RunResult::Cursor(cursor) => Some(cursor),
    }
  }
}

impl fmt::Debug for RunResult {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunResult::Atom(datum) => f.debug_tuple("Atom").field(datum).finish(),
      RunResult::Cursor(cursor) => f.debug_tuple("Cursor").field(cursor).finish(),
    }
  }
}

struct ConnectionInner {
  options: ConnectOptions,
  db: StdMutex<Option<String>>,
  next_token: AtomicU64,
  closed: AtomicBool,
  writer: Mutex<Option<BoxedWriter>>,
  waiters: StdMutex<HashMap<u64, Waiter>>,
  reader_handle: StdMutex<Option<JoinHandle<()>>>,
}

impl ConnectionInner {
  fn fail_all_waiters(&self) {
    let waiters: Vec<Waiter> = {
      let mut map = self.waiters.lock().unwrap();
      map.drain().map(|(_, tx)| tx).collect()
    };
    for tx in waiters {
      let _ = tx.send(Err(ReqlError::connection_closed()));
    }
  }
}

// Process-wide default connection registered by `Connection::repl`.
static REPL: StdMutex<Option<Connection>> = StdMutex::new(None);

pub(crate) fn repl_connection() -> Option<Connection> {
  REPL.lock().unwrap().clone()
}

/// A handle to one authenticated socket. Cheap to clone; all clones share
/// the socket, token allocator, and waiter registry.
#[derive(Clone)]
pub struct Connection {
  inner: Arc<ConnectionInner>,
}

impl fmt::Debug for Connection {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Connection")
      .field("host", &self.inner.options.host)
      .field("port", &self.inner.options.port)
      .field("open", &self.is_open())
      .finish()
  }
}

impl Connection {
  /// Open a TCP (and optionally TLS) stream, drive the handshake to
  /// completion, and spawn the reader task. The whole sequence must finish
  /// within `options.timeout`.
  pub async fn connect(options: ConnectOptions) -> Result<Self> {
    let (reader, writer) = match timeout(options.timeout, establish(&options)).await {
      Ok(result) => result?,
      Err(_) => {
        return Err(ReqlError::Driver(ReqlDriverError::timeout_at(
          &options.host,
          options.port,
        )))
      }
    };

    let db = options.db.clone();
    let conn = Connection {
      inner: Arc::new(ConnectionInner {
        options,
        db: StdMutex::new(db),
        next_token: AtomicU64::new(0),
        closed: AtomicBool::new(false),
        writer: Mutex::new(Some(writer)),
        waiters: StdMutex::new(HashMap::new()),
        reader_handle: StdMutex::new(None),
      }),
    };

    let handle = tokio::spawn(reader_loop(Arc::downgrade(&conn.inner), reader));
    *conn.inner.reader_handle.lock().unwrap() = Some(handle);
    debug!(host = %conn.inner.options.host, port = conn.inner.options.port, "connected");
    Ok(conn)
  }

  /// Whether the connection is still usable.
  pub fn is_open(&self) -> bool {
    !self.inner.closed.load(Ordering::Acquire)
  }

  fn check_open(&self) -> Result<()> {
    if self.is_open() {
      Ok(())
    } else {
      Err(ReqlError::connection_closed())
    }
  }

  /// Set the default database for subsequent runs.
  pub fn use_db(&self, name: impl Into<String>) {
    *self.inner.db.lock().unwrap() = Some(name.into());
  }

  /// Register this connection as the process-wide default used by
  /// [`crate::Term::run_repl`]. Handy when trying queries interactively.
  pub fn repl(&self) -> &Self {
    *REPL.lock().unwrap() = Some(self.clone());
    self
  }

  /// Close the connection. With `noreply_wait`, first waits until the
  /// server has settled every outstanding `noreply` write. All pending
  /// waiters fail with a connection-closed error.
  pub async fn close(&self, noreply_wait: bool) -> Result<()> {
    if !self.is_open() {
      return Ok(());
    }

    if noreply_wait {
      if let Err(e) = self.noreply_wait().await {
        debug!(error = %e, "noreply_wait barrier failed during close");
      }
    }

    self.inner.closed.store(true, Ordering::Release);
    self.inner.fail_all_waiters();

    {
      let mut writer = self.inner.writer.lock().await;
      if let Some(mut w) = writer.take() {
        let _ = w.shutdown().await;
      }
    }

    let handle = self.inner.reader_handle.lock().unwrap().take();
    if let Some(handle) = handle {
      handle.abort();
      let _ = handle.await;
    }
    debug!("connection closed");
    Ok(())
  }

  /// `close` followed by a fresh `connect` with the saved parameters,
  /// returning the new connection.
  pub async fn reconnect(
    &self,
    noreply_wait: bool,
    connect_timeout: Option<Duration>,
  ) -> Result<Connection> {
    self.close(noreply_wait).await?;
    let mut options = self.inner.options.clone();
    options.db = self.inner.db.lock().unwrap().clone();
    if let Some(t) = connect_timeout {
      options.timeout = t;
    }
    Connection::connect(options).await
  }

  /// Wait until the server has processed every outstanding `noreply` write
  /// on this connection.
  pub async fn noreply_wait(&self) -> Result<()> {
    self.check_open()?;
    let token = self.new_token()?;
    let rx = self.register_waiter(token);
    if let Err(e) = self
      .send_body(token, &codec::control_body(QueryType::NoreplyWait))
      .await
    {
      self.remove_waiter(token);
      return Err(e);
    }

    let response = await_waiter(rx).await?;
    match response.response_type {
      ResponseType::WaitComplete => Ok(()),
      ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError => {
        Err(response.make_error(None))
      }
      other => Err(ReqlError::driver(format!(
        "Unexpected response type {other:?} for NOREPLY_WAIT."
      ))),
    }
  }

  /// Ask the server who it is.
  pub async fn server(&self) -> Result<ServerInfo> {
    self.check_open()?;
    let token = self.new_token()?;
    let rx = self.register_waiter(token);
    if let Err(e) = self
      .send_body(token, &codec::control_body(QueryType::ServerInfo))
      .await
    {
      self.remove_waiter(token);
      return Err(e);
    }

    let response = await_waiter(rx).await?;
    match response.response_type {
      ResponseType::ServerInfo => {
        let payload = response.data.first().cloned().unwrap_or(Value::Null);
        serde_json::from_value(payload)
          .map_err(|e| ReqlError::driver(format!("Malformed SERVER_INFO payload: {e}.")))
      }
      ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError => {
        Err(response.make_error(None))
      }
      other => Err(ReqlError::driver(format!(
        "Unexpected response type {other:?} for SERVER_INFO."
      ))),
    }
  }

  /// Submit a START envelope for `term`. Returns `None` for `noreply` runs,
  /// otherwise an atom or a cursor.
  pub(crate) async fn start(&self, term: Term, opts: RunOptions) -> Result<Option<RunResult>> {
    self.check_open()?;

    let default_db = self.inner.db.lock().unwrap().clone();
    let optargs = opts.to_optargs(default_db.as_deref());
    let body = codec::start_body(&term, &optargs);
    let token = self.new_token()?;

    if opts.noreply {
      self.send_body(token, &body).await?;
      return Ok(None);
    }

    let rx = self.register_waiter(token);
    if let Err(e) = self.send_body(token, &body).await {
      self.remove_waiter(token);
      return Err(e);
    }

    let response = await_waiter(rx).await?;
    let formats = opts.format_options();
    match response.response_type {
      ResponseType::SuccessAtom => {
        let value = response.data.first().cloned().unwrap_or(Value::Null);
        let datum = Datum::from_wire(&value, &formats)?;
        Ok(Some(RunResult::Atom(attach_profile(
          datum,
          response.profile.as_ref(),
          &formats,
        )?)))
      }
      ResponseType::SuccessSequence | ResponseType::SuccessPartial => {
        let cursor = Cursor::new(self.clone(), token, term, formats, response)?;
        Ok(Some(RunResult::Cursor(cursor)))
      }
      ResponseType::WaitComplete => Ok(None),
      ResponseType::ServerInfo => {
        let value = response.data.first().cloned().unwrap_or(Value::Null);
        Ok(Some(RunResult::Atom(Datum::from_wire(&value, &formats)?)))
      }
      ResponseType::ClientError | ResponseType::CompileError | ResponseType::RuntimeError => {
        Err(response.make_error(Some(term)))
      }
    }
  }

  /// Strictly increasing per connection; never reused, overflow is fatal.
  fn new_token(&self) -> Result<u64> {
    let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
    if token == u64::MAX {
      // The counter would wrap on the next allocation and start handing out
      // tokens that may still be in flight. Poison the connection instead.
      self.inner.closed.store(true, Ordering::Release);
      self.inner.fail_all_waiters();
      return Err(ReqlError::driver("Token space exhausted on this connection."));
    }
    Ok(token)
  }

  pub(crate) fn register_waiter(&self, token: u64) -> oneshot::Receiver<Result<Response>> {
    let (tx, rx) = oneshot::channel();
    self.inner.waiters.lock().unwrap().insert(token, tx);
    rx
  }

  pub(crate) fn remove_waiter(&self, token: u64) {
    self.inner.waiters.lock().unwrap().remove(&token);
  }

  /// Emit one frame under the writer lock.
  async fn send_body(&self, token: u64, body: &[u8]) -> Result<()> {
    let frame = codec::encode_frame(token, body);
    let mut writer = self.inner.writer.lock().await;
    let writer = writer.as_mut().ok_or_else(ReqlError::connection_closed)?;
    writer.write_all(&frame).await?;
    writer.flush().await?;
    Ok(())
  }

  /// CONTINUE or STOP for a cursor's token.
  pub(crate) async fn send_control(&self, token: u64, query_type: QueryType) -> Result<()> {
    self.check_open()?;
    self.send_body(token, &codec::control_body(query_type)).await
  }
}

async fn await_waiter(rx: oneshot::Receiver<Result<Response>>) -> Result<Response> {
  match rx.await {
    Ok(result) => result,
    Err(_) => Err(ReqlError::connection_closed()),
  }
}

/// Fold profiling data into the returned value, mirroring the wire shape:
/// `{"value": ..., "profile": ...}`.
fn attach_profile(
  datum: Datum,
  profile: Option<&Value>,
  formats: &crate::datum::FormatOptions,
) -> Result<Datum> {
  match profile {
    Some(profile) => {
      let mut wrapped = std::collections::BTreeMap::new();
      wrapped.insert("value".to_string(), datum);
      wrapped.insert("profile".to_string(), Datum::from_wire(profile, formats)?);
      Ok(Datum::Object(wrapped))
    }
    None => Ok(datum),
  }
}

/// Open the stream and drive the handshake. Runs under the connect timeout.
async fn establish(options: &ConnectOptions) -> Result<(BoxedReader, BoxedWriter)> {
  let tcp = TcpStream::connect((options.host.as_str(), options.port))
    .await
    .map_err(|e| {
      ReqlError::driver(format!(
        "Could not connect to {}:{}. Error: {e}",
        options.host, options.port
      ))
    })?;
  tcp.set_nodelay(true)?;

  let (mut reader, mut writer): (BoxedReader, BoxedWriter) = match &options.tls {
    Some(tls) => {
      let stream = tls_connect(tcp, &options.host, tls).await?;
      let (r, w) = tokio::io::split(stream);
      (Box::new(r), Box::new(w))
    }
    None => {
      let (r, w) = tokio::io::split(tcp);
      (Box::new(r), Box::new(w))
    }
  };

  let mut handshake = Handshake::new(
    &options.host,
    options.port,
    &options.user,
    options.password.clone(),
  );
  let mut response: Option<Vec<u8>> = None;
  loop {
    match handshake.next_message(response.as_deref())? {
      Some(message) => {
        writer.write_all(&message).await?;
        writer.flush().await?;
      }
      None => break,
    }
    response = Some(read_until_nul(&mut reader).await?);
  }

  Ok((reader, writer))
}

async fn tls_connect(
  tcp: TcpStream,
  host: &str,
  tls: &TlsOptions,
) -> Result<tokio_rustls::client::TlsStream<TcpStream>> {
  let pem = std::fs::read(&tls.ca_certs)?;
  let certs = rustls_pemfile::certs(&mut pem.as_slice())
    .map_err(|e| ReqlError::driver(format!("Could not read CA bundle: {e}.")))?;

  let mut roots = rustls::RootCertStore::empty();
  for cert in certs {
    roots
      .add(&rustls::Certificate(cert))
      .map_err(|e| ReqlError::driver(format!("Invalid CA certificate: {e}.")))?;
  }

  let config = rustls::ClientConfig::builder()
    .with_safe_defaults()
    .with_root_certificates(roots)
    .with_no_client_auth();

  let name = rustls::ServerName::try_from(host)
    .map_err(|_| ReqlError::driver(format!("Invalid server name \"{host}\" for TLS.")))?;

  tokio_rustls::TlsConnector::from(Arc::new(config))
    .connect(name, tcp)
    .await
    .map_err(|e| ReqlError::driver(format!("TLS handshake failed: {e}.")))
}

/// Read one NUL-terminated handshake message, without the terminator.
async fn read_until_nul(reader: &mut BoxedReader) -> Result<Vec<u8>> {
  let mut buffer = Vec::new();
  loop {
    let byte = reader.read_u8().await?;
    if byte == 0 {
      return Ok(buffer);
    }
    buffer.push(byte);
  }
}

/// Background task: read framed responses and hand each to the waiter
/// registered under its token. Socket error or EOF closes the connection
/// and fails every outstanding waiter.
///
/// Holds only a weak handle on the connection state, so dropping the last
/// `Connection` releases the write half (sending FIN) instead of keeping
/// the socket alive through this task.
async fn reader_loop(inner: Weak<ConnectionInner>, mut reader: BoxedReader) {
  loop {
    let mut header = [0u8; HEADER_LEN];
    if let Err(e) = reader.read_exact(&mut header).await {
      if let Some(inner) = inner.upgrade() {
        if !inner.closed.load(Ordering::Acquire) {
          debug!(error = %e, "reader stopped");
        }
      }
      break;
    }
    let (token, length) = codec::decode_header(&header);

    let mut body = vec![0u8; length as usize];
    if reader.read_exact(&mut body).await.is_err() {
      break;
    }

    let Some(inner) = inner.upgrade() else {
      break;
    };
    let waiter = inner.waiters.lock().unwrap().remove(&token);
    match waiter {
      Some(tx) => {
        let _ = tx.send(Response::from_body(token, &body));
      }
      None => {
        // The submitter was cancelled or deregistered; drop the batch.
        debug!(token, "discarding response with no waiter");
      }
    }
  }

  if let Some(inner) = inner.upgrade() {
    inner.closed.store(true, Ordering::Release);
    inner.fail_all_waiters();
  }
}
