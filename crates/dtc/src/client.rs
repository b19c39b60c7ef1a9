use feedhub_core::Tick;
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, trace, warn};

use crate::error::DtcError;
use crate::protocol::*;

/// Configuration for connecting to a DTC server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DtcConfig {
    /// Host address (e.g. "127.0.0.1").
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    /// Sent in the logon so the server can label this session.
    pub client_name: String,
    /// Advertised in the logon request. 0 tells the server not to expect heartbeats.
    pub heartbeat_interval_secs: u16,
    /// Bound on dial + logon, and on each subscription round trip.
    pub handshake_timeout_ms: u64,
}

impl Default for DtcConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 11099,
            username: String::new(),
            password: String::new(),
            client_name: "feedhub".to_string(),
            heartbeat_interval_secs: 0,
            handshake_timeout_ms: 5_000,
        }
    }
}

impl DtcConfig {
    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
}

type SubscriptionKey = (String, String);

/// One logged-on connection. Subscriptions live and die with it.
/// Inbound item: a frame, or the error that ended the reader.
type Inbound = Result<Frame, DtcError>;

struct Session {
    writer: OwnedWriteHalf,
    inbound: mpsc::Receiver<Inbound>,
    alive: Arc<AtomicBool>,
    reader: JoinHandle<()>,
    subscriptions: HashMap<SubscriptionKey, u32>,
    next_request_id: u32,
}

impl Session {
    fn start(stream: TcpStream) -> Self {
        let (read_half, writer) = stream.into_split();
        let (tx, inbound) = mpsc::channel(64);
        let alive = Arc::new(AtomicBool::new(true));
        let reader = tokio::spawn(read_loop(read_half, tx, alive.clone()));
        Self {
            writer,
            inbound,
            alive,
            reader,
            subscriptions: HashMap::new(),
            next_request_id: 1,
        }
    }

    fn is_alive(&self) -> bool {
        self.alive.load(Ordering::SeqCst)
    }

    async fn send(&mut self, msg: &Message) -> Result<(), DtcError> {
        write_message(&mut self.writer, msg).await
    }

    /// Return the request id for `(symbol, exchange)`, subscribing first if
    /// this connection hasn't seen the pair yet.
    async fn ensure_subscribed(
        &mut self,
        symbol: &str,
        exchange: &str,
        wait: Duration,
    ) -> Result<u32, DtcError> {
        let key = (symbol.to_string(), exchange.to_string());
        if let Some(&request_id) = self.subscriptions.get(&key) {
            return Ok(request_id);
        }
        self.discard_stale()?;

        let request_id = self.next_request_id;
        self.next_request_id = self.next_request_id.wrapping_add(1);

        self.send(&Message::MarketDataSubscribe(MarketDataSubscribe {
            request_id,
            symbol: symbol.to_string(),
            exchange: exchange.to_string(),
        }))
        .await?;

        let frame = timeout(wait, self.inbound.recv())
            .await
            .map_err(|_| DtcError::Timeout("subscription response"))?
            .ok_or(DtcError::ConnectionClosed)??;

        let response = match Message::decode(&frame)? {
            Message::SubscriptionResponse(r) => r,
            Message::Logoff(logoff) => {
                warn!(reason = %logoff.reason, "DTC server logged us off");
                return Err(DtcError::ConnectionClosed);
            }
            other => return Err(DtcError::UnexpectedMessage(other.message_type())),
        };

        if response.request_id != request_id {
            return Err(DtcError::CorrelationMismatch {
                expected: request_id,
                got: response.request_id,
            });
        }
        if response.result != SUBSCRIPTION_ACCEPTED {
            return Err(DtcError::SubscriptionRejected {
                symbol: symbol.to_string(),
                exchange: exchange.to_string(),
                reason: response.reason,
            });
        }

        debug!(%symbol, %exchange, request_id, "DTC subscription established");
        self.subscriptions.insert(key, request_id);
        Ok(request_id)
    }

    /// Drop frames nobody asked for, so the next response read is the one
    /// correlated with our request. A queued reader error is returned.
    fn discard_stale(&mut self) -> Result<(), DtcError> {
        let mut discarded = 0usize;
        while let Ok(item) = self.inbound.try_recv() {
            let frame = item?;
            trace!(message_type = frame.message_type, "discarding unsolicited DTC frame");
            discarded += 1;
        }
        if discarded > 0 {
            debug!(discarded, "discarded unsolicited DTC frames");
        }
        Ok(())
    }

    /// Why the reader stopped: its forwarded error, or a plain close.
    fn terminal_error(&mut self) -> DtcError {
        while let Ok(item) = self.inbound.try_recv() {
            if let Err(e) = item {
                return e;
            }
        }
        DtcError::ConnectionClosed
    }

    async fn send_batch(&mut self, ticks: &[Tick], wait: Duration) -> Result<(), DtcError> {
        if !self.is_alive() {
            return Err(self.terminal_error());
        }
        for tick in ticks {
            let request_id = self
                .ensure_subscribed(&tick.symbol, &tick.exchange, wait)
                .await?;
            self.send(&Message::TradeUpdate(trade_update(request_id, tick)))
                .await?;
        }
        Ok(())
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

/// Forwards inbound frames to the session. On EOF or error the session is
/// flagged dead and the error is forwarded as the last item.
async fn read_loop(mut reader: OwnedReadHalf, tx: mpsc::Sender<Inbound>, alive: Arc<AtomicBool>) {
    loop {
        match read_frame(&mut reader).await {
            Ok(frame) if frame.message_type == message_type::HEARTBEAT => {
                trace!("DTC heartbeat");
            }
            Ok(frame) => {
                let message_type = frame.message_type;
                if let Err(mpsc::error::TrySendError::Full(_)) = tx.try_send(Ok(frame)) {
                    warn!(message_type, "DTC inbound queue full, dropping frame");
                }
            }
            Err(e) => {
                warn!(error = %e, "DTC reader stopped");
                alive.store(false, Ordering::SeqCst);
                let _ = tx.try_send(Err(e));
                return;
            }
        }
    }
}

/// Clears the `Connecting` flag however the handshake ends, including
/// when the caller's future is dropped mid-handshake.
struct ConnectingGuard<'a>(&'a AtomicBool);

impl<'a> ConnectingGuard<'a> {
    fn set(flag: &'a AtomicBool) -> Self {
        flag.store(true, Ordering::SeqCst);
        Self(flag)
    }
}

impl Drop for ConnectingGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

fn trade_update(request_id: u32, tick: &Tick) -> TradeUpdate {
    TradeUpdate {
        request_id,
        symbol: tick.symbol.clone(),
        exchange: tick.exchange.clone(),
        price: tick.price.to_f64().unwrap_or_default(),
        size: tick.size.to_f64().unwrap_or_default(),
        timestamp: tick.timestamp.timestamp_micros() as f64 / 1_000_000.0,
    }
}

/// Persistent DTC client that republishes ticks as trade updates.
///
/// `connect_lock` serializes dial/logon/close. `session` is the send mutex:
/// every frame write happens while holding it, so request/response pairs
/// on the single connection never interleave.
pub struct DtcClient {
    config: DtcConfig,
    connect_lock: Mutex<()>,
    session: Mutex<Option<Session>>,
    connecting: AtomicBool,
}

impl DtcClient {
    pub fn new(config: DtcConfig) -> Self {
        Self {
            config,
            connect_lock: Mutex::new(()),
            session: Mutex::new(None),
            connecting: AtomicBool::new(false),
        }
    }

    pub fn config(&self) -> &DtcConfig {
        &self.config
    }

    pub async fn state(&self) -> ConnectionState {
        if self.connecting.load(Ordering::SeqCst) {
            return ConnectionState::Connecting;
        }
        match self.session.lock().await.as_ref() {
            Some(session) if session.is_alive() => ConnectionState::Connected,
            _ => ConnectionState::Disconnected,
        }
    }

    /// Number of subscriptions held on the current connection.
    pub async fn subscription_count(&self) -> usize {
        self.session
            .lock()
            .await
            .as_ref()
            .map_or(0, |s| s.subscriptions.len())
    }

    /// Dial and log on. No-op while a live connection exists.
    ///
    /// Any failure leaves the client disconnected; a rejected logon
    /// surfaces as [`DtcError::LogonRejected`].
    pub async fn connect(&self) -> Result<(), DtcError> {
        let _guard = self.connect_lock.lock().await;
        {
            let mut session = self.session.lock().await;
            match session.as_ref() {
                Some(s) if s.is_alive() => return Ok(()),
                Some(_) => {
                    debug!("Discarding dead DTC session");
                    *session = None;
                }
                None => {}
            }
        }

        let connecting = ConnectingGuard::set(&self.connecting);
        let result = timeout(self.config.handshake_timeout(), self.handshake()).await;
        drop(connecting);

        let session = match result {
            Ok(Ok(session)) => session,
            Ok(Err(e)) => {
                warn!(error = %e, "DTC logon failed");
                return Err(e);
            }
            Err(_) => {
                warn!("DTC logon timed out");
                return Err(DtcError::Timeout("logon response"));
            }
        };

        *self.session.lock().await = Some(session);
        Ok(())
    }

    async fn handshake(&self) -> Result<Session, DtcError> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        info!("Connecting to DTC server at {}", addr);

        let mut stream = TcpStream::connect(&addr).await?;
        stream.set_nodelay(true)?;

        write_message(
            &mut stream,
            &Message::LogonRequest(LogonRequest {
                protocol_version: PROTOCOL_VERSION,
                username: self.config.username.clone(),
                password: self.config.password.clone(),
                heartbeat_interval_secs: self.config.heartbeat_interval_secs,
                client_name: self.config.client_name.clone(),
            }),
        )
        .await?;

        let response = loop {
            let frame = read_frame(&mut stream).await?;
            match Message::decode(&frame)? {
                Message::Heartbeat(_) => continue,
                Message::LogonResponse(r) => break r,
                other => return Err(DtcError::UnexpectedMessage(other.message_type())),
            }
        };

        if response.result != LOGON_SUCCESS {
            let _ = stream.shutdown().await;
            return Err(DtcError::LogonRejected(response.result_text));
        }

        info!(
            server_version = response.protocol_version,
            "Logged on to DTC server at {}", addr
        );
        Ok(Session::start(stream))
    }

    /// Publish a batch of ticks as trade updates.
    ///
    /// Retry-once policy: a connection-level failure tears the session down,
    /// reconnects (new logon, fresh subscriptions) and resends the whole
    /// batch one time. A second failure is returned as-is.
    pub async fn publish_ticks(&self, ticks: &[Tick]) -> Result<(), DtcError> {
        if ticks.is_empty() {
            return Ok(());
        }
        match self.publish_once(ticks).await {
            Err(e) if e.is_connection_error() => {
                warn!(error = %e, ticks = ticks.len(), "DTC publish failed, reconnecting to retry once");
                self.teardown().await;
                self.publish_once(ticks).await
            }
            other => other,
        }
    }

    async fn publish_once(&self, ticks: &[Tick]) -> Result<(), DtcError> {
        self.connect().await?;

        let mut guard = self.session.lock().await;
        let result = match guard.as_mut() {
            Some(session) => {
                session
                    .send_batch(ticks, self.config.handshake_timeout())
                    .await
            }
            None => Err(DtcError::NotConnected),
        };

        if let Err(e) = &result {
            if e.is_connection_error() || e.is_protocol_violation() {
                guard.take();
            }
        }
        result
    }

    async fn teardown(&self) {
        let _guard = self.connect_lock.lock().await;
        self.session.lock().await.take();
    }

    /// Best-effort logoff, then drop the connection. Safe to call repeatedly.
    pub async fn close(&self) {
        let _guard = self.connect_lock.lock().await;
        let Some(mut session) = self.session.lock().await.take() else {
            return;
        };

        let logoff = Message::Logoff(Logoff {
            reason: "client closing".to_string(),
        });
        if let Err(e) = session.send(&logoff).await {
            debug!(error = %e, "DTC logoff not delivered");
        }
        let _ = session.writer.shutdown().await;
        info!("Disconnected from DTC server");
    }
}
