//! ASCII memcache protocol client used to drive servers under test.
//!
//! One request is in flight at a time. Every call writes its request and reads until
//! the response grammar of that command is complete, so the connection is always at a
//! request boundary between calls. When a response does not fit the grammar the
//! connection is dropped instead of guessing where the next response starts.

use crate::config::TimeoutConfig;
use crate::core::endpoint::Endpoint;
use crate::core::metrics::{CountersSnapshot, OperationCounters};
use crate::core::protocols::{AsciiCommand, AsciiResponse, StoreMode};
use std::collections::HashMap;
use std::io;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::net::TcpStream;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

/// Flags value the proxy reads as "replicate this write"
pub const REPLICATE_FLAG: u32 = 1024;

/// Largest value length accepted from a server
pub const MAX_PAYLOAD_LEN: usize = 64 * 1024 * 1024;

/// A value returned by `get`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub flags: u32,
    pub value: Vec<u8>,
}

impl Item {
    pub fn size(&self) -> usize {
        self.value.len()
    }

    pub fn value_str(&self) -> Option<&str> {
        std::str::from_utf8(&self.value).ok()
    }
}

/// A value returned by `lease-get`. A token is present only when the value is stale
/// (or missing) and the caller holds the lease to refill it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaseItem {
    pub value: Vec<u8>,
    pub flags: u32,
    pub token: Option<u64>,
}

impl LeaseItem {
    pub fn is_fresh(&self) -> bool {
        self.token.is_none()
    }
}

/// Reply of a read command: either the parsed result or a `SERVER_ERROR` line, which is
/// a legitimate protocol outcome rather than a client failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply<T> {
    Value(T),
    ServerError(String),
}

impl<T> Reply<T> {
    pub fn into_value(self) -> Option<T> {
        match self {
            Reply::Value(v) => Some(v),
            Reply::ServerError(_) => None,
        }
    }

    pub fn as_value(&self) -> Option<&T> {
        match self {
            Reply::Value(v) => Some(v),
            Reply::ServerError(_) => None,
        }
    }

    pub fn server_error(&self) -> Option<&str> {
        match self {
            Reply::Value(_) => None,
            Reply::ServerError(line) => Some(line),
        }
    }

    pub fn map<U>(self, f: impl FnOnce(T) -> U) -> Reply<U> {
        match self {
            Reply::Value(v) => Reply::Value(f(v)),
            Reply::ServerError(line) => Reply::ServerError(line),
        }
    }
}

/// Outcome of `lease-set`
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaseSetOutcome {
    Stored,
    /// Written, but an invalidation raced the lease
    StaleStored,
    /// Any other reply line
    NotStored(String),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StoreOptions {
    /// Send the replicate flag with the value
    pub replicate: bool,
    /// Ask the server not to answer
    pub noreply: bool,
}

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("Not connected to {0}")]
    NotConnected(Endpoint),
    #[error("Failed to connect to {endpoint}: {source}")]
    Connect {
        endpoint: Endpoint,
        #[source]
        source: io::Error,
    },
    #[error("Gave up connecting to {endpoint} after {waited:?}")]
    ConnectTimeout { endpoint: Endpoint, waited: Duration },
    #[error("Stopped waiting for {endpoint} to accept connections")]
    ConnectAborted { endpoint: Endpoint },
    #[error("Connection closed by server")]
    ConnectionClosed,
    #[error("Unexpected response \"{line}\" ({keys:?})")]
    UnexpectedResponse { line: String, keys: Vec<String> },
    #[error("IO error: {0}")]
    Io(#[from] io::Error),
}

/// Socket plus buffered reader, owned by exactly one client
#[derive(Debug)]
struct Connection {
    reader: BufReader<TcpStream>,
}

impl Connection {
    async fn open(endpoint: &Endpoint) -> io::Result<Self> {
        let stream = TcpStream::connect((endpoint.host(), endpoint.port())).await?;
        if let Err(e) = stream.set_nodelay(true) {
            debug!("Could not set TCP_NODELAY for {}: {}", endpoint, e);
        }
        Ok(Self {
            reader: BufReader::new(stream),
        })
    }

    async fn send(&mut self, bytes: &[u8]) -> io::Result<()> {
        let stream = self.reader.get_mut();
        stream.write_all(bytes).await?;
        stream.flush().await
    }

    /// Next line without its terminator
    async fn read_line(&mut self) -> Result<String, ClientError> {
        let mut buf = Vec::new();
        let n = self.reader.read_until(b'\n', &mut buf).await?;
        if n == 0 {
            return Err(ClientError::ConnectionClosed);
        }
        while matches!(buf.last(), Some(b'\n') | Some(b'\r')) {
            buf.pop();
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// `len` payload bytes and the CRLF after them. `None` if the terminator is wrong
    /// or the announced length exceeds [`MAX_PAYLOAD_LEN`].
    async fn read_payload(&mut self, len: usize) -> Result<Option<Vec<u8>>, ClientError> {
        let Some(total) = len.checked_add(2).filter(|_| len <= MAX_PAYLOAD_LEN) else {
            return Ok(None);
        };
        let mut data = vec![0u8; total];
        self.reader.read_exact(&mut data).await.map_err(|e| {
            if e.kind() == io::ErrorKind::UnexpectedEof {
                ClientError::ConnectionClosed
            } else {
                ClientError::Io(e)
            }
        })?;
        if &data[len..] != b"\r\n" {
            return Ok(None);
        }
        data.truncate(len);
        Ok(Some(data))
    }

    /// Wait up to `wait` for the server to start answering. End of stream counts as
    /// an answer so that the following read reports it.
    async fn wait_readable(&mut self, wait: Duration) -> Result<bool, ClientError> {
        match timeout(wait, self.reader.fill_buf()).await {
            Err(_) => Ok(false),
            Ok(Ok(_)) => Ok(true),
            Ok(Err(e)) => Err(e.into()),
        }
    }

    /// Try to read one byte for up to `wait`. True when nothing arrived.
    async fn probe_silence(&mut self, wait: Duration) -> Result<bool, ClientError> {
        let mut byte = [0u8; 1];
        match timeout(wait, self.reader.read(&mut byte)).await {
            Err(_) => Ok(true),
            Ok(Ok(_)) => Ok(false),
            Ok(Err(e)) => Err(e.into()),
        }
    }
}

/// Split on whitespace into exactly three fields, the last one keeping inner spaces
fn split_three(line: &str) -> Option<(&str, &str, &str)> {
    let (first, rest) = line.trim().split_once(char::is_whitespace)?;
    let (second, rest) = rest.trim_start().split_once(char::is_whitespace)?;
    let third = rest.trim_start();
    if third.is_empty() {
        return None;
    }
    Some((first, second, third))
}

fn owned_keys<K: AsRef<str>>(keys: &[K]) -> Vec<String> {
    keys.iter().map(|k| k.as_ref().to_string()).collect()
}

/// Client for one cache endpoint
#[derive(Debug)]
pub struct McClient {
    endpoint: Endpoint,
    timeouts: TimeoutConfig,
    connection: Option<Connection>,
    counters: OperationCounters,
}

impl McClient {
    pub fn new(endpoint: Endpoint) -> Self {
        Self::with_timeouts(endpoint, TimeoutConfig::default())
    }

    pub fn with_timeouts(endpoint: Endpoint, timeouts: TimeoutConfig) -> Self {
        Self {
            endpoint,
            timeouts,
            connection: None,
            counters: OperationCounters::new(),
        }
    }

    pub fn endpoint(&self) -> &Endpoint {
        &self.endpoint
    }

    pub fn timeouts(&self) -> &TimeoutConfig {
        &self.timeouts
    }

    pub fn is_connected(&self) -> bool {
        self.connection.is_some()
    }

    pub fn counters(&self) -> CountersSnapshot {
        self.counters.snapshot()
    }

    /// Open a new connection, replacing any existing one. Single attempt.
    pub async fn connect(&mut self) -> Result<(), ClientError> {
        self.connection = None;
        let connection =
            Connection::open(&self.endpoint)
                .await
                .map_err(|source| ClientError::Connect {
                    endpoint: self.endpoint.clone(),
                    source,
                })?;
        debug!("Connected to {}", self.endpoint);
        self.connection = Some(connection);
        Ok(())
    }

    /// Connect, retrying for as long as the server refuses connections
    pub async fn ensure_connected(&mut self) -> Result<(), ClientError> {
        self.ensure_connected_while(|| true).await
    }

    /// Like [`ensure_connected`](Self::ensure_connected), but after each refused attempt
    /// `keep_waiting` decides whether to try again.
    pub async fn ensure_connected_while(
        &mut self,
        mut keep_waiting: impl FnMut() -> bool,
    ) -> Result<(), ClientError> {
        let started = Instant::now();
        loop {
            match self.connect().await {
                Ok(()) => return Ok(()),
                Err(ClientError::Connect { source, .. })
                    if source.kind() == io::ErrorKind::ConnectionRefused => {}
                Err(e) => return Err(e),
            }

            if !keep_waiting() {
                return Err(ClientError::ConnectAborted {
                    endpoint: self.endpoint.clone(),
                });
            }
            if let Some(deadline) = self.timeouts.connect_deadline() {
                if started.elapsed() >= deadline {
                    return Err(ClientError::ConnectTimeout {
                        endpoint: self.endpoint.clone(),
                        waited: started.elapsed(),
                    });
                }
            }
            sleep(self.timeouts.connect_retry()).await;
        }
    }

    /// Drop the connection. Closing a socket cannot fail from the caller's view.
    pub fn disconnect(&mut self) {
        if self.connection.take().is_some() {
            debug!("Disconnected from {}", self.endpoint);
        }
    }

    fn conn(&mut self) -> Result<&mut Connection, ClientError> {
        match self.connection.as_mut() {
            Some(conn) => Ok(conn),
            None => Err(ClientError::NotConnected(self.endpoint.clone())),
        }
    }

    async fn send_command(&mut self, command: &AsciiCommand, data: &[u8]) -> Result<(), ClientError> {
        debug!("{} <- {:?}", self.endpoint, command);
        let bytes = command.encode(data);
        self.conn()?.send(&bytes).await?;
        Ok(())
    }

    async fn read_line(&mut self) -> Result<String, ClientError> {
        let line = self.conn()?.read_line().await?;
        debug!("{} -> {}", self.endpoint, line);
        Ok(line)
    }

    async fn read_payload(
        &mut self,
        len: usize,
        line: &str,
        keys: &[String],
    ) -> Result<Vec<u8>, ClientError> {
        match self.conn()?.read_payload(len).await? {
            Some(data) => Ok(data),
            None => Err(self.violation(line, keys)),
        }
    }

    /// Drop the connection and build the error for a response that broke the grammar
    fn violation(&mut self, line: &str, keys: &[String]) -> ClientError {
        warn!(
            "Unexpected response from {}: \"{}\" ({:?}), disconnecting",
            self.endpoint, line, keys
        );
        self.disconnect();
        ClientError::UnexpectedResponse {
            line: line.to_string(),
            keys: keys.to_vec(),
        }
    }

    /// Wait briefly for a reply that should not come.
    ///
    /// This is a heuristic: silence for the configured window is taken as proof that
    /// the server honoured `noreply`, but a slow server could still answer later.
    /// An answer leaves the connection mid-line, so it is replaced by a fresh one.
    pub async fn expect_no_reply(&mut self) -> Result<bool, ClientError> {
        let wait = self.timeouts.noreply_wait();
        if self.conn()?.probe_silence(wait).await? {
            return Ok(true);
        }
        warn!(
            "{} answered a noreply command, reconnecting to resynchronize",
            self.endpoint
        );
        self.connect().await?;
        Ok(false)
    }

    /// Fetch several keys. Every requested key is present in the map; missing ones map
    /// to `None`.
    pub async fn get_many<K: AsRef<str>>(
        &mut self,
        keys: &[K],
    ) -> Result<Reply<HashMap<String, Option<Item>>>, ClientError> {
        let keys = owned_keys(keys);
        self.counters.record_gets(keys.len());
        let mut items: HashMap<String, Option<Item>> =
            keys.iter().map(|k| (k.clone(), None)).collect();
        if keys.is_empty() {
            return Ok(Reply::Value(items));
        }

        self.send_command(&AsciiCommand::Get { keys: keys.clone() }, &[])
            .await?;

        loop {
            let line = self.read_line().await?;
            match AsciiResponse::parse(&line) {
                Ok(AsciiResponse::End) => return Ok(Reply::Value(items)),
                Ok(AsciiResponse::Value { key, flags, bytes }) if items.contains_key(&key) => {
                    let value = self.read_payload(bytes, &line, &keys).await?;
                    items.insert(key.clone(), Some(Item { key, flags, value }));
                }
                Ok(AsciiResponse::ServerError(line)) => return Ok(Reply::ServerError(line)),
                _ => return Err(self.violation(&line, &keys)),
            }
        }
    }

    /// Fetch one key
    pub async fn get(&mut self, key: &str) -> Result<Reply<Option<Item>>, ClientError> {
        let reply = self.get_many(&[key]).await?;
        Ok(reply.map(|mut items| items.remove(key).flatten()))
    }

    /// Proxy-side metadata for a key (age, exptime, origin server, ...)
    pub async fn metaget(&mut self, key: &str) -> Result<HashMap<String, String>, ClientError> {
        self.counters.record_gets(1);
        self.send_command(
            &AsciiCommand::MetaGet {
                key: key.to_string(),
            },
            &[],
        )
        .await?;

        let mut meta = HashMap::new();
        loop {
            let line = self.read_line().await?;
            match AsciiResponse::parse(&line) {
                Ok(AsciiResponse::End) => return Ok(meta),
                Ok(AsciiResponse::Meta { fields, .. }) => meta.extend(fields),
                _ => return Err(self.violation(&line, &[key.to_string()])),
            }
        }
    }

    /// Lease-get several keys. Fresh values carry no token, stale or missing ones do.
    pub async fn lease_get_many<K: AsRef<str>>(
        &mut self,
        keys: &[K],
    ) -> Result<Reply<HashMap<String, Option<LeaseItem>>>, ClientError> {
        let keys = owned_keys(keys);
        self.counters.record_gets(keys.len());
        let mut items: HashMap<String, Option<LeaseItem>> =
            keys.iter().map(|k| (k.clone(), None)).collect();
        if keys.is_empty() {
            return Ok(Reply::Value(items));
        }

        self.send_command(&AsciiCommand::LeaseGet { keys: keys.clone() }, &[])
            .await?;

        loop {
            let line = self.read_line().await?;
            let (key, flags, bytes, token) = match AsciiResponse::parse(&line) {
                Ok(AsciiResponse::End) => return Ok(Reply::Value(items)),
                Ok(AsciiResponse::Value { key, flags, bytes }) => (key, flags, bytes, None),
                Ok(AsciiResponse::LeaseValue {
                    key,
                    token,
                    flags,
                    bytes,
                }) => (key, flags, bytes, Some(token)),
                Ok(AsciiResponse::ServerError(line)) => return Ok(Reply::ServerError(line)),
                _ => return Err(self.violation(&line, &keys)),
            };
            if !items.contains_key(&key) {
                return Err(self.violation(&line, &keys));
            }
            let value = self.read_payload(bytes, &line, &keys).await?;
            items.insert(key, Some(LeaseItem { value, flags, token }));
        }
    }

    /// Lease-get one key
    pub async fn lease_get(&mut self, key: &str) -> Result<Reply<Option<LeaseItem>>, ClientError> {
        let reply = self.lease_get_many(&[key]).await?;
        Ok(reply.map(|mut items| items.remove(key).flatten()))
    }

    /// Refill a key under the lease `token` obtained from `lease-get`
    pub async fn lease_set(
        &mut self,
        key: &str,
        value: impl AsRef<[u8]>,
        token: u64,
    ) -> Result<LeaseSetOutcome, ClientError> {
        self.counters.record_set();
        let value = value.as_ref();
        let command = AsciiCommand::LeaseSet {
            key: key.to_string(),
            token,
            flags: 0,
            exptime: 0,
            bytes: value.len(),
        };
        self.send_command(&command, value).await?;

        let line = self.read_line().await?;
        if line.contains("ERROR") {
            self.resync(&line).await?;
            return Ok(LeaseSetOutcome::NotStored(line));
        }
        Ok(match AsciiResponse::parse(&line) {
            Ok(AsciiResponse::Stored) => LeaseSetOutcome::Stored,
            Ok(AsciiResponse::StaleStored) => LeaseSetOutcome::StaleStored,
            _ => LeaseSetOutcome::NotStored(line),
        })
    }

    /// After an `ERROR` the server may still be consuming our data block as commands,
    /// so start over on a fresh connection.
    async fn resync(&mut self, line: &str) -> Result<(), ClientError> {
        warn!(
            "{} answered \"{}\", reconnecting to resynchronize",
            self.endpoint, line
        );
        self.connect().await
    }

    /// Send a storage command. Without `noreply` the result is whether the server
    /// answered `STORED`; with it, whether the server stayed silent.
    pub async fn store(
        &mut self,
        mode: StoreMode,
        key: &str,
        value: impl AsRef<[u8]>,
        options: StoreOptions,
    ) -> Result<bool, ClientError> {
        self.counters.record_set();
        let value = value.as_ref();
        let command = AsciiCommand::Store {
            mode,
            key: key.to_string(),
            flags: if options.replicate { REPLICATE_FLAG } else { 0 },
            exptime: 0,
            bytes: value.len(),
            noreply: options.noreply,
        };
        self.send_command(&command, value).await?;

        if !command.expects_response() {
            return self.expect_no_reply().await;
        }

        let line = self.read_line().await?;
        if line.contains("ERROR") {
            self.resync(&line).await?;
            return Ok(false);
        }
        Ok(line.starts_with("STORED"))
    }

    pub async fn set(&mut self, key: &str, value: impl AsRef<[u8]>) -> Result<bool, ClientError> {
        self.store(StoreMode::Set, key, value, StoreOptions::default())
            .await
    }

    pub async fn add(&mut self, key: &str, value: impl AsRef<[u8]>) -> Result<bool, ClientError> {
        self.store(StoreMode::Add, key, value, StoreOptions::default())
            .await
    }

    pub async fn replace(
        &mut self,
        key: &str,
        value: impl AsRef<[u8]>,
    ) -> Result<bool, ClientError> {
        self.store(StoreMode::Replace, key, value, StoreOptions::default())
            .await
    }

    /// True when the key existed. `SERVER_ERROR` counts as not deleted.
    pub async fn delete(&mut self, key: &str) -> Result<bool, ClientError> {
        self.counters.record_delete();
        self.send_command(
            &AsciiCommand::Delete {
                key: key.to_string(),
                noreply: false,
            },
            &[],
        )
        .await?;

        let line = self.read_line().await?;
        match AsciiResponse::parse(&line) {
            Ok(AsciiResponse::Deleted) => Ok(true),
            Ok(AsciiResponse::NotFound) | Ok(AsciiResponse::ServerError(_)) => Ok(false),
            _ => Err(self.violation(&line, &[key.to_string()])),
        }
    }

    /// Delete with `noreply`; true when the server stayed silent
    pub async fn delete_noreply(&mut self, key: &str) -> Result<bool, ClientError> {
        self.counters.record_delete();
        self.send_command(
            &AsciiCommand::Delete {
                key: key.to_string(),
                noreply: true,
            },
            &[],
        )
        .await?;
        self.expect_no_reply().await
    }

    fn arith_command(incr: bool, key: &str, amount: u64, noreply: bool) -> AsciiCommand {
        let key = key.to_string();
        if incr {
            AsciiCommand::Incr {
                key,
                value: amount,
                noreply,
            }
        } else {
            AsciiCommand::Decr {
                key,
                value: amount,
                noreply,
            }
        }
    }

    async fn arith(&mut self, incr: bool, key: &str, amount: u64) -> Result<Option<u64>, ClientError> {
        self.counters.record_set();
        self.send_command(&Self::arith_command(incr, key, amount, false), &[])
            .await?;

        let line = self.read_line().await?;
        match AsciiResponse::parse(&line) {
            Ok(AsciiResponse::Number(n)) => Ok(Some(n)),
            Ok(AsciiResponse::NotFound) => Ok(None),
            _ => Err(self.violation(&line, &[key.to_string()])),
        }
    }

    async fn arith_noreply(&mut self, incr: bool, key: &str, amount: u64) -> Result<bool, ClientError> {
        self.counters.record_set();
        self.send_command(&Self::arith_command(incr, key, amount, true), &[])
            .await?;
        self.expect_no_reply().await
    }

    /// New value, or `None` if the key does not exist
    pub async fn incr(&mut self, key: &str, amount: u64) -> Result<Option<u64>, ClientError> {
        self.arith(true, key, amount).await
    }

    pub async fn decr(&mut self, key: &str, amount: u64) -> Result<Option<u64>, ClientError> {
        self.arith(false, key, amount).await
    }

    pub async fn incr_noreply(&mut self, key: &str, amount: u64) -> Result<bool, ClientError> {
        self.arith_noreply(true, key, amount).await
    }

    pub async fn decr_noreply(&mut self, key: &str, amount: u64) -> Result<bool, ClientError> {
        self.arith_noreply(false, key, amount).await
    }

    /// Server statistics, or `None` if nothing arrives within the stats wait window or
    /// the server rejects the request. Only three-field lines (`STAT <name> <value>`)
    /// are collected.
    pub async fn stats(
        &mut self,
        spec: Option<&str>,
    ) -> Result<Option<HashMap<String, String>>, ClientError> {
        self.counters.record_other();
        self.send_command(
            &AsciiCommand::Stats {
                args: spec.map(str::to_string),
            },
            &[],
        )
        .await?;

        let wait = self.timeouts.stats_wait();
        if !self.conn()?.wait_readable(wait).await? {
            debug!("No stats from {} within {:?}", self.endpoint, wait);
            return Ok(None);
        }

        let mut stats = HashMap::new();
        loop {
            let line = self.read_line().await?;
            if line.trim() == "END" {
                return Ok(Some(stats));
            }
            // ERROR, CLIENT_ERROR and SERVER_ERROR end the reply without an END
            if line.contains("ERROR") {
                debug!("{} rejected stats {:?}: {}", self.endpoint, spec, line);
                return Ok(None);
            }
            if let Some((_, name, value)) = split_three(&line) {
                stats.insert(name.to_string(), value.to_string());
            }
        }
    }

    pub async fn version(&mut self) -> Result<String, ClientError> {
        self.counters.record_other();
        self.send_command(&AsciiCommand::Version, &[]).await?;
        self.read_line().await
    }

    pub async fn shutdown(&mut self) -> Result<String, ClientError> {
        self.counters.record_other();
        self.send_command(&AsciiCommand::Shutdown, &[]).await?;
        self.read_line().await
    }

    /// Send raw bytes and return the first reply line
    pub async fn issue_command(&mut self, raw: &str) -> Result<String, ClientError> {
        self.counters.record_other();
        debug!("{} <- {:?}", self.endpoint, raw);
        self.conn()?.send(raw.as_bytes()).await?;
        self.read_line().await
    }
}
