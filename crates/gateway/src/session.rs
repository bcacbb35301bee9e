//! A gateway session.
//!
//! [`Session`] is a cheap handle; clones share one connection. Connecting
//! runs the handshake inline and then hands the connection to a supervisor
//! task, which reconnects (resuming when it can) until the session is
//! disconnected or fails for good. [`Session::wait`] returns that outcome.

use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard},
    time::Duration,
};

use {
    async_trait::async_trait,
    futures::{
        SinkExt, StreamExt,
        stream::{SplitSink, SplitStream},
    },
    secrecy::ExposeSecret,
    serde::Serialize,
    tokio::{
        net::TcpStream,
        sync::{Mutex as AsyncMutex, oneshot},
    },
    tokio_tungstenite::{
        MaybeTlsStream, WebSocketStream,
        tungstenite::{
            Message,
            protocol::{CloseFrame, frame::coding::CloseCode as WsCloseCode},
        },
    },
    tokio_util::sync::CancellationToken,
    tracing::{debug, info, instrument, warn},
    url::Url,
};

#[cfg(feature = "metrics")]
use metrics::counter;

use {
    ferrule_config::ClientConfig,
    ferrule_protocol::{
        COMMAND_LIMIT, COMMAND_WINDOW, ENCODING, Event, Hello, IDENTIFY_WINDOW, Identify, Opcode,
        Payload, PresenceUpdate, RECONNECT_CLOSE_CODE, Ready, Resume, classify, events,
    },
    ferrule_ratelimit::{BucketTemplate, RateLimit, RequestKey},
    ferrule_rest::Dispatcher,
};

use crate::{
    error::{Error, Result},
    heartbeat::{self, Beater, Heartbeat},
    manager::{Manager, Signal},
    sink::EventSink,
};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type Writer = SplitSink<WsStream, Message>;
type Reader = SplitStream<WsStream>;

const NORMAL_CLOSE: u16 = 1000;

const IDENTIFY_ROUTE: &str = "gateway_identify";
const IDENTIFY_BUCKET_ID: &str = "gateway_identify";
const COMMAND_ROUTE: &str = "gateway_command";

// ── State ────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum SessionState {
    #[default]
    Disconnected,
    Connecting,
    AwaitingHello,
    Identifying,
    Resuming,
    Connected,
    Disconnecting,
    Reconnecting,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::AwaitingHello => "awaiting_hello",
            Self::Identifying => "identifying",
            Self::Resuming => "resuming",
            Self::Connected => "connected",
            Self::Disconnecting => "disconnecting",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Default)]
struct SessionData {
    id: String,
    sequence: u64,
    resume_url: String,
    state: SessionState,
}

impl SessionData {
    fn resumable(&self) -> bool {
        !self.id.is_empty() && !self.resume_url.is_empty() && self.sequence != 0
    }

    fn clear(&mut self) {
        self.id.clear();
        self.sequence = 0;
        self.resume_url.clear();
    }
}

/// How a handshake attempt ended without a hard error.
enum Handshake {
    Ready(Arc<Manager>),
    InvalidSession,
}

/// What the supervisor does after a connection's tasks have all returned.
enum Step {
    Finish(Result<()>),
    Reconnect(&'static str),
}

/// A single frame, classified.
enum Frame {
    Payload(Payload),
    Closed { code: u16, reason: String },
    Skip,
}

// ── Session ──────────────────────────────────────────────────────────

struct Inner {
    config: ClientConfig,
    rest: Arc<Dispatcher>,
    limiter: Arc<RateLimit>,
    sink: Arc<dyn EventSink>,
    data: Mutex<SessionData>,
    writer: AsyncMutex<Option<Writer>>,
    heartbeat: Mutex<Option<Arc<Heartbeat>>>,
    manager: Mutex<Option<Arc<Manager>>>,
    stop: Mutex<CancellationToken>,
    outcome: AsyncMutex<Option<oneshot::Receiver<Result<()>>>>,
    identify_key: RequestKey,
    command_key: RequestKey,
    command_bucket_id: String,
}

#[derive(Clone)]
pub struct Session {
    inner: Arc<Inner>,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let data = self.data();
        f.debug_struct("Session")
            .field("id", &data.id)
            .field("sequence", &data.sequence)
            .field("state", &data.state)
            .finish()
    }
}

impl Session {
    /// A disconnected session. Gateway commands are rate limited in the
    /// dispatcher's store, next to the REST buckets.
    pub fn new(config: ClientConfig, rest: Arc<Dispatcher>, sink: impl EventSink) -> Self {
        let limiter = Arc::clone(rest.rate_limit());
        let shard = config.gateway.shard.map_or(0, |[id, _]| id);
        let identify_key = RequestKey::new(IDENTIFY_ROUTE, "");
        let command_key = RequestKey::new(COMMAND_ROUTE, shard.to_string());
        let command_bucket_id = format!("{COMMAND_ROUTE}:{shard}");

        ensure_bucket(
            &limiter,
            &identify_key,
            IDENTIFY_BUCKET_ID,
            &BucketTemplate::new(2, IDENTIFY_WINDOW),
        );
        limiter.start_tx().insert_bucket(
            &command_key,
            &command_bucket_id,
            &BucketTemplate::new(COMMAND_LIMIT, COMMAND_WINDOW),
        );

        Self {
            inner: Arc::new(Inner {
                config,
                rest,
                limiter,
                sink: Arc::new(sink),
                data: Mutex::new(SessionData::default()),
                writer: AsyncMutex::new(None),
                heartbeat: Mutex::new(None),
                manager: Mutex::new(None),
                stop: Mutex::new(CancellationToken::new()),
                outcome: AsyncMutex::new(None),
                identify_key,
                command_key,
                command_bucket_id,
            }),
        }
    }

    pub fn state(&self) -> SessionState {
        self.data().state
    }

    /// Session ID assigned by the last `READY`.
    pub fn session_id(&self) -> Option<String> {
        let data = self.data();
        (!data.id.is_empty()).then(|| data.id.clone())
    }

    /// Last sequence number received, zero when none.
    pub fn sequence(&self) -> u64 {
        self.data().sequence
    }

    /// ACKs received since the last heartbeat went out.
    pub fn monitor(&self) -> u32 {
        self.heartbeat().map_or(0, |hb| hb.acks())
    }

    /// Open the connection and complete the handshake. The connection is
    /// then supervised in the background; see [`Session::wait`].
    #[instrument(skip(self), fields(shard = ?self.inner.config.gateway.shard))]
    pub async fn connect(&self) -> Result<()> {
        if self.manager().is_some() {
            return Err(Error::message("session is already connected"));
        }
        let stop = CancellationToken::new();
        *lock(&self.inner.stop) = stop.clone();

        let manager = match self.establish().await {
            Ok(manager) => manager,
            Err(err) => {
                self.teardown(None).await;
                return Err(Error::session(&self.label(), err));
            },
        };

        let (tx, rx) = oneshot::channel();
        *self.inner.outcome.lock().await = Some(rx);
        tokio::spawn(self.clone().supervise(manager, stop, tx));
        Ok(())
    }

    /// Close the connection with a normal close code and forget the
    /// session. A no-op when not connected.
    #[instrument(skip(self))]
    pub async fn disconnect(&self) -> Result<()> {
        let stop = lock(&self.inner.stop).clone();
        let manager = lock(&self.inner.manager).take();
        if manager.is_none() && self.state() == SessionState::Disconnected {
            debug!("disconnect: not connected");
            return Ok(());
        }
        self.set_state(SessionState::Disconnecting);
        if let Some(manager) = manager {
            manager.mark(Signal::Disconnect);
        }
        // Cancels the connection too. The supervisor leaves cleanup to us
        // once the lifecycle is stopped.
        stop.cancel();

        let closed = self.close(NORMAL_CLOSE, "disconnect").await;
        lock(&self.inner.heartbeat).take();
        *self.data() = SessionData::default();
        info!("gateway session disconnected");

        closed.map_err(|action| Error::Disconnect {
            provoking: None,
            action: Box::new(action),
        })
    }

    /// Drop the current connection and resume on a new one.
    pub fn reconnect(&self) {
        if let Some(manager) = self.manager() {
            info!("reconnect requested");
            manager.reconnect();
        }
    }

    /// Wait until the session ends: `Ok` after a disconnect, the fatal
    /// error otherwise. Returns immediately when there is nothing to wait
    /// for.
    pub async fn wait(&self) -> Result<()> {
        let outcome = self.inner.outcome.lock().await.take();
        match outcome {
            Some(rx) => rx
                .await
                .unwrap_or_else(|_| Err(Error::message("session supervisor stopped"))),
            None => Ok(()),
        }
    }

    /// Send a gateway command, subject to the connection's command limit.
    pub async fn send_command<T: Serialize>(&self, op: Opcode, data: &T) -> Result<()> {
        if self.state() != SessionState::Connected {
            return Err(Error::message("session is not connected"));
        }
        let payload = Payload::command(op, data).map_err(|source| Error::Event {
            name: format!("{op:?}"),
            source,
        })?;
        if op == Opcode::Identify {
            self.identify_frame(&payload).await
        } else {
            self.command_frame(&payload).await
        }
    }

    pub async fn update_presence(&self, presence: &PresenceUpdate) -> Result<()> {
        self.send_command(Opcode::PresenceUpdate, presence).await
    }

    // ── Handshake ────────────────────────────────────────────────────

    /// Connect and handshake, identifying once more after an invalid
    /// session.
    async fn establish(&self) -> Result<Arc<Manager>> {
        let mut retried = false;
        loop {
            match self.handshake().await? {
                Handshake::Ready(manager) => return Ok(manager),
                Handshake::InvalidSession if !retried => {
                    retried = true;
                    let cooldown = self.inner.config.gateway.invalid_session_cooldown();
                    warn!(
                        cooldown_ms = cooldown.as_millis() as u64,
                        "session invalidated during handshake, identifying again"
                    );
                    tokio::time::sleep(cooldown).await;
                    self.data().clear();
                },
                Handshake::InvalidSession => {
                    return Err(Error::protocol("session invalidated twice during handshake"));
                },
            }
        }
    }

    async fn handshake(&self) -> Result<Handshake> {
        self.set_state(SessionState::Connecting);
        let stop = lock(&self.inner.stop).clone();
        let manager = Arc::new(Manager::child_of(&stop));
        *lock(&self.inner.manager) = Some(Arc::clone(&manager));

        let mut reader = match self.open().await {
            Ok(reader) => reader,
            Err(err) => {
                self.abandon(&manager).await;
                return Err(err);
            },
        };

        match self.negotiate(&mut reader, &manager).await {
            Ok(Some(heartbeat)) => {
                manager.spawn(
                    "listener",
                    self.clone()
                        .listen(reader, heartbeat, Arc::clone(&manager)),
                );
                self.set_state(SessionState::Connected);
                Ok(Handshake::Ready(manager))
            },
            Ok(None) => {
                self.abandon(&manager).await;
                Ok(Handshake::InvalidSession)
            },
            Err(err) => {
                warn!(error = %err, "gateway handshake failed");
                self.abandon(&manager).await;
                Err(err)
            },
        }
    }

    async fn open(&self) -> Result<Reader> {
        let url = self.gateway_url().await?;
        info!(url = %url, "connecting to gateway");
        let (stream, _) = tokio_tungstenite::connect_async(url.as_str()).await?;
        let (writer, reader) = stream.split();
        *self.inner.writer.lock().await = Some(writer);
        Ok(reader)
    }

    /// Hello, heartbeat start, Identify or Resume, then read until the
    /// session is ready. `None` means the server invalidated the session.
    async fn negotiate(&self, reader: &mut Reader, manager: &Arc<Manager>) -> Result<Option<Arc<Heartbeat>>> {
        self.set_state(SessionState::AwaitingHello);
        let first = self.next_payload(reader, manager).await?;
        if first.op != Opcode::Hello {
            return Err(Error::protocol(format!("expected Hello, got {:?}", first.op)));
        }
        let hello: Hello = first.data().map_err(|source| Error::Event {
            name: "HELLO".into(),
            source,
        })?;

        let (heartbeat, pending) = Heartbeat::new(hello.interval(), self.inner.config.gateway.queue_capacity);
        self.configure_command_bucket(&heartbeat);
        *lock(&self.inner.heartbeat) = Some(Arc::clone(&heartbeat));
        let beater: Arc<dyn Beater> = Arc::new(self.clone());
        manager.spawn(
            "pulse",
            heartbeat::pulse(Arc::clone(&heartbeat), Arc::clone(&beater), Arc::clone(manager)),
        );
        manager.spawn(
            "beat",
            heartbeat::beat(Arc::clone(&heartbeat), beater, pending, Arc::clone(manager)),
        );

        let resume = {
            let data = self.data();
            data.resumable().then(|| Resume {
                token: self.inner.config.token.expose_secret().clone(),
                session_id: data.id.clone(),
                seq: data.sequence,
            })
        };
        match resume {
            Some(resume) => {
                self.set_state(SessionState::Resuming);
                info!(session_id = %resume.session_id, seq = resume.seq, "resuming session");
                self.command_frame(&Payload::command(Opcode::Resume, &resume)?).await?;
            },
            None => {
                self.set_state(SessionState::Identifying);
                self.identify_frame(&Payload::command(Opcode::Identify, &self.identify())?)
                    .await?;
            },
        }

        loop {
            let payload = self.next_payload(reader, manager).await?;
            match payload.op {
                Opcode::Dispatch => match payload.event_name() {
                    Some(events::READY) => {
                        let ready: Ready = payload.data().map_err(|source| Error::Event {
                            name: events::READY.into(),
                            source,
                        })?;
                        {
                            let mut data = self.data();
                            data.id = ready.session_id.clone();
                            data.resume_url = ready.resume_gateway_url;
                            data.sequence = payload.s.unwrap_or(0);
                        }
                        info!(session_id = %ready.session_id, "session ready");
                        self.forward(payload);
                        return Ok(Some(heartbeat));
                    },
                    Some(events::RESUMED) => {
                        self.observe(payload.s);
                        info!(seq = self.sequence(), "session resumed");
                        self.forward(payload);
                        return Ok(Some(heartbeat));
                    },
                    _ => {
                        self.observe(payload.s);
                        self.forward(payload);
                    },
                },
                Opcode::InvalidSession => return Ok(None),
                Opcode::HeartbeatAck => heartbeat.ack(),
                Opcode::Heartbeat => {
                    heartbeat.ack();
                    heartbeat.enqueue(self.sequence());
                },
                other => {
                    return Err(Error::protocol(format!("unexpected {other:?} during handshake")));
                },
            }
        }
    }

    /// Next payload during the handshake, skipping control frames and
    /// undecodable text.
    async fn next_payload(&self, reader: &mut Reader, manager: &Manager) -> Result<Payload> {
        let cancel = manager.token();
        let timeout = self.inner.config.gateway.handshake_timeout();
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => return Err(Error::message("connection cancelled during handshake")),
                message = tokio::time::timeout(timeout, reader.next()) => message,
            };
            let message = match message {
                Err(_) => return Err(Error::protocol("timed out waiting for the gateway")),
                Ok(None) => return Err(Error::protocol("gateway closed the stream during handshake")),
                Ok(Some(message)) => message?,
            };
            match decode_frame(message) {
                Ok(Frame::Payload(payload)) => return Ok(payload),
                Ok(Frame::Closed { code, reason }) => return Err(Error::Closed { code, reason }),
                Ok(Frame::Skip) => {},
                Err(err) => warn!(error = %err, "dropping undecodable payload"),
            }
        }
    }

    /// Gateway URL with the version query: the cached resume URL when the
    /// session can be resumed, a fresh one from the REST API otherwise.
    async fn gateway_url(&self) -> Result<Url> {
        let cached = {
            let data = self.data();
            (!data.id.is_empty() && !data.resume_url.is_empty()).then(|| data.resume_url.clone())
        };
        let base = match cached {
            Some(url) => url,
            None => {
                let bot = self.inner.rest.get_gateway_bot().await?;
                let limit = bot.session_start_limit;
                ensure_bucket(
                    &self.inner.limiter,
                    &self.inner.identify_key,
                    IDENTIFY_BUCKET_ID,
                    &BucketTemplate::new(i64::from(limit.max_concurrency) + 1, IDENTIFY_WINDOW),
                );
                if limit.remaining == 0 {
                    warn!(
                        reset_after_ms = limit.reset_after,
                        "session start limit exhausted, waiting"
                    );
                    tokio::time::sleep(Duration::from_millis(limit.reset_after)).await;
                }
                bot.url
            },
        };
        gateway_endpoint(&base, self.inner.config.api_version)
    }

    fn identify(&self) -> Identify {
        let gateway = &self.inner.config.gateway;
        Identify {
            token: self.inner.config.token.expose_secret().clone(),
            intents: gateway.intents,
            properties: gateway.properties.clone(),
            large_threshold: gateway.large_threshold,
            shard: gateway.shard,
            presence: None,
        }
    }

    /// Fresh command budget for a new connection, minus the heartbeats it
    /// will send.
    fn configure_command_bucket(&self, heartbeat: &Heartbeat) {
        let limit = (COMMAND_LIMIT - heartbeat.per_window(COMMAND_WINDOW)).max(1);
        debug!(limit, "gateway command budget");
        self.inner.limiter.start_tx().insert_bucket(
            &self.inner.command_key,
            &self.inner.command_bucket_id,
            &BucketTemplate::new(limit, COMMAND_WINDOW),
        );
    }

    // ── Steady state ─────────────────────────────────────────────────

    async fn listen(self, mut reader: Reader, heartbeat: Arc<Heartbeat>, manager: Arc<Manager>) -> Result<()> {
        let cancel = manager.token();
        loop {
            let message = tokio::select! {
                () = cancel.cancelled() => return Ok(()),
                message = reader.next() => message,
            };
            let message = match message {
                Some(Ok(message)) => message,
                Some(Err(err)) => {
                    warn!(error = %err, "gateway read failed, reconnecting");
                    manager.reconnect();
                    return Ok(());
                },
                None => {
                    warn!("gateway stream ended, reconnecting");
                    manager.reconnect();
                    return Ok(());
                },
            };
            let payload = match decode_frame(message) {
                Ok(Frame::Payload(payload)) => payload,
                Ok(Frame::Closed { code, reason }) => return Err(Error::Closed { code, reason }),
                Ok(Frame::Skip) => continue,
                Err(err) => {
                    warn!(error = %err, "dropping undecodable payload");
                    continue;
                },
            };

            match payload.op {
                Opcode::Dispatch => {
                    self.observe(payload.s);
                    self.forward(payload);
                },
                Opcode::Heartbeat => {
                    heartbeat.ack();
                    heartbeat.enqueue(self.sequence());
                },
                Opcode::HeartbeatAck => heartbeat.ack(),
                Opcode::Reconnect => {
                    info!("server requested a reconnect");
                    manager.reconnect();
                    return Ok(());
                },
                Opcode::InvalidSession => {
                    let resumable = payload.data::<bool>().unwrap_or(false);
                    warn!(resumable, "session invalidated");
                    if !resumable {
                        self.data().clear();
                        tokio::select! {
                            () = cancel.cancelled() => return Ok(()),
                            () = tokio::time::sleep(self.inner.config.gateway.invalid_session_cooldown()) => {},
                        }
                    }
                    manager.reconnect();
                    return Ok(());
                },
                other => debug!(op = ?other, "ignoring payload"),
            }
        }
    }

    // ── Supervision ──────────────────────────────────────────────────

    async fn supervise(self, mut manager: Arc<Manager>, stop: CancellationToken, outcome: oneshot::Sender<Result<()>>) {
        let result = loop {
            let joined = manager.join().await;
            if stop.is_cancelled() {
                break Ok(());
            }
            match self.next_step(&manager, joined).await {
                Step::Finish(result) => break result,
                Step::Reconnect(reason) => {
                    if stop.is_cancelled() {
                        break Ok(());
                    }
                    info!(reason, "reconnecting to gateway");
                    #[cfg(feature = "metrics")]
                    counter!("gateway_reconnects_total", "reason" => reason).increment(1);
                    self.set_state(SessionState::Reconnecting);
                    match self.establish().await {
                        Ok(next) => manager = next,
                        Err(_) if stop.is_cancelled() => break Ok(()),
                        Err(err) => break Err(Error::session(&self.label(), err)),
                    }
                },
            }
        };
        if let Err(ref err) = result {
            warn!(error = %err, "gateway session ended");
        }
        if !stop.is_cancelled() {
            self.teardown(Some(&manager)).await;
        } else if lock(&self.inner.stop).is_cancelled() {
            // A reconnect cut short by disconnect() may have moved the state
            // on after it was reset.
            self.set_state(SessionState::Disconnected);
        }
        if outcome.send(result).is_err() {
            debug!("nobody waiting on the session outcome");
        }
    }

    async fn next_step(&self, manager: &Manager, joined: Result<()>) -> Step {
        match manager.signal() {
            Some(Signal::Disconnect) => Step::Finish(Ok(())),
            Some(Signal::Reconnect) => {
                self.close_quietly(RECONNECT_CLOSE_CODE, "reconnecting").await;
                Step::Reconnect("requested")
            },
            None => match joined {
                Ok(()) => {
                    self.close_quietly(RECONNECT_CLOSE_CODE, "reconnecting").await;
                    Step::Reconnect("tasks ended")
                },
                Err(err @ Error::Disconnect { .. }) => Step::Finish(Err(err)),
                Err(Error::Tungstenite(err)) => {
                    warn!(error = %err, "gateway connection failed, reconnecting");
                    self.inner.writer.lock().await.take();
                    Step::Reconnect("transport error")
                },
                Err(Error::Closed { code, reason }) => {
                    self.inner.writer.lock().await.take();
                    let close = classify(code);
                    if close.is_self_initiated() {
                        debug!(code, "echo of our reconnect close");
                        Step::Finish(Ok(()))
                    } else if close.reconnect {
                        warn!(code, reason = %reason, description = close.description, "gateway closed the connection");
                        if close.invalidates_session {
                            self.data().clear();
                        }
                        Step::Reconnect(close.description)
                    } else {
                        warn!(code, reason = %reason, description = close.description, "gateway closed with a fatal code");
                        Step::Finish(Err(Error::session(&self.label(), Error::Closed { code, reason })))
                    }
                },
                Err(err) => {
                    self.close_quietly(NORMAL_CLOSE, "client error").await;
                    Step::Finish(Err(Error::session(&self.label(), err)))
                },
            },
        }
    }

    /// Tear down a half-open connection.
    async fn abandon(&self, manager: &Arc<Manager>) {
        manager.abort();
        {
            let mut slot = lock(&self.inner.manager);
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, manager)) {
                slot.take();
            }
        }
        self.close_quietly(NORMAL_CLOSE, "handshake failed").await;
        if let Err(err) = manager.join().await {
            debug!(error = %err, "heartbeat task error after failed handshake");
        }
    }

    /// Release connection resources, unless a newer connection owns them.
    async fn teardown(&self, finished: Option<&Arc<Manager>>) {
        {
            let mut slot = lock(&self.inner.manager);
            if let (Some(current), Some(finished)) = (slot.as_ref(), finished)
                && !Arc::ptr_eq(current, finished)
            {
                return;
            }
            if let Some(current) = slot.take() {
                current.abort();
            }
        }
        self.inner.writer.lock().await.take();
        lock(&self.inner.heartbeat).take();
        self.set_state(SessionState::Disconnected);
    }

    // ── I/O ──────────────────────────────────────────────────────────

    async fn write(&self, payload: &Payload) -> Result<()> {
        let text = serde_json::to_string(payload)?;
        let mut writer = self.inner.writer.lock().await;
        let Some(writer) = writer.as_mut() else {
            return Err(Error::message("gateway connection is not open"));
        };
        writer.send(Message::Text(text.into())).await?;
        Ok(())
    }

    async fn command_frame(&self, payload: &Payload) -> Result<()> {
        let key = &self.inner.command_key;
        self.inner.limiter.admit(key, key).await;
        let sent = self.write(payload).await;
        self.inner.limiter.settle(&[key], 1);
        sent
    }

    async fn identify_frame(&self, payload: &Payload) -> Result<()> {
        let (identify, command) = (&self.inner.identify_key, &self.inner.command_key);
        self.inner.limiter.admit(identify, command).await;
        let sent = self.write(payload).await;
        self.inner.limiter.settle(&[identify, command], 1);
        sent
    }

    async fn close(&self, code: u16, reason: &str) -> Result<()> {
        let Some(mut writer) = self.inner.writer.lock().await.take() else {
            return Ok(());
        };
        let frame = CloseFrame {
            code: WsCloseCode::from(code),
            reason: reason.into(),
        };
        writer.send(Message::Close(Some(frame))).await?;
        Ok(())
    }

    async fn close_quietly(&self, code: u16, reason: &str) {
        if let Err(err) = self.close(code, reason).await {
            debug!(code, error = %err, "close frame not sent");
        }
    }

    // ── Helpers ──────────────────────────────────────────────────────

    fn data(&self) -> MutexGuard<'_, SessionData> {
        lock(&self.inner.data)
    }

    fn set_state(&self, state: SessionState) {
        let mut data = self.data();
        if data.state != state {
            debug!(from = %data.state, to = %state, "session state");
            data.state = state;
        }
    }

    fn observe(&self, sequence: Option<u64>) {
        if let Some(sequence) = sequence {
            let mut data = self.data();
            data.sequence = data.sequence.max(sequence);
        }
    }

    fn forward(&self, payload: Payload) {
        match Event::from_payload(payload) {
            Some(event) => self.inner.sink.dispatch(event),
            None => warn!("dispatch without an event name dropped"),
        }
    }

    fn manager(&self) -> Option<Arc<Manager>> {
        lock(&self.inner.manager).clone()
    }

    fn heartbeat(&self) -> Option<Arc<Heartbeat>> {
        lock(&self.inner.heartbeat).clone()
    }

    fn label(&self) -> String {
        self.session_id().unwrap_or_else(|| "-".to_string())
    }
}

#[async_trait]
impl Beater for Session {
    fn sequence(&self) -> u64 {
        self.data().sequence
    }

    async fn send_heartbeat(&self, sequence: u64) -> Result<()> {
        self.write(&Payload::heartbeat((sequence != 0).then_some(sequence))).await
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// Point `key` at bucket `id` shaped like `template`, keeping the existing
/// bucket (and its counts) when it already has that shape.
fn ensure_bucket(limiter: &RateLimit, key: &RequestKey, id: &str, template: &BucketTemplate) {
    let mut tx = limiter.start_tx();
    if tx.bucket_id(key) == Some(id)
        && tx
            .get_bucket(key)
            .is_some_and(|bucket| bucket.limit() == template.limit && bucket.window() == template.window())
    {
        return;
    }
    tx.insert_bucket(key, id, template);
}

/// `base` with `?v=<version>&encoding=json`, replacing any query it had.
fn gateway_endpoint(base: &str, version: u8) -> Result<Url> {
    let mut url = Url::parse(base)?;
    url.query_pairs_mut()
        .clear()
        .append_pair("v", &version.to_string())
        .append_pair("encoding", ENCODING);
    Ok(url)
}

fn decode_frame(message: Message) -> Result<Frame> {
    let decode = |source| Error::Event {
        name: "payload".into(),
        source,
    };
    match message {
        Message::Text(text) => serde_json::from_str(text.as_str())
            .map(Frame::Payload)
            .map_err(decode),
        Message::Binary(bytes) => serde_json::from_slice(&bytes)
            .map(Frame::Payload)
            .map_err(decode),
        Message::Close(frame) => Ok(match frame {
            Some(frame) => Frame::Closed {
                code: u16::from(frame.code),
                reason: frame.reason.as_str().to_string(),
            },
            None => Frame::Closed {
                code: 1005,
                reason: String::new(),
            },
        }),
        Message::Ping(_) | Message::Pong(_) | Message::Frame(_) => Ok(Frame::Skip),
    }
}
