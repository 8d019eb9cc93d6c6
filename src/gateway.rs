// ====================================================================================
// src/gateway.rs - Discord 网关连接（在线状态推送端）
// ====================================================================================
use crate::{error::SinkError, models::PresenceLevel, sink::PresenceSink};
use futures_util::{future::BoxFuture, FutureExt, SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tokio::time::{self, Duration, Instant, Interval};
use tokio_tungstenite::{connect_async, tungstenite::Message, WebSocketStream};

const OP_DISPATCH: u8 = 0;
const OP_HEARTBEAT: u8 = 1;
const OP_IDENTIFY: u8 = 2;
const OP_PRESENCE_UPDATE: u8 = 3;
const OP_RECONNECT: u8 = 7;
const OP_INVALID_SESSION: u8 = 9;
const OP_HELLO: u8 = 10;
const OP_HEARTBEAT_ACK: u8 = 11;

const INTENT_GUILDS: u64 = 1;
const CUSTOM_STATUS_ACTIVITY: u8 = 4;
const CLOSE_TIMEOUT: Duration = Duration::from_secs(5);

const RECONNECT_BACKOFF_BASE: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_MAX: Duration = Duration::from_secs(60);

#[derive(Debug, Deserialize)]
struct GatewayPayload {
    op: u8,
    #[serde(default)]
    d: Value,
    #[serde(default)]
    s: Option<u64>,
    #[serde(default)]
    t: Option<String>,
}

#[derive(Debug, Deserialize)]
struct GatewayBotResponse {
    url: String,
}

#[derive(Debug, Deserialize)]
struct Hello {
    heartbeat_interval: u64,
}

#[derive(Debug, Deserialize)]
struct ReadyUser {
    username: String,
    #[serde(default)]
    discriminator: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Ready {
    user: ReadyUser,
}

// 网关生命周期事件；每次重连成功都会再收到一次 Ready
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayEvent {
    Ready { username: String, discriminator: String },
    Closed,
}

#[derive(Debug)]
enum Command {
    Send(Value),
    Close,
}

// 会话结束原因，决定是否重连以及退避是否重置
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
struct SessionEnd {
    ready: bool,
    fatal: bool,
}

// Discord 每次都需要完整的在线状态，所以缓存两部分
#[derive(Debug, Clone)]
struct PresenceFrame {
    activity: Option<String>,
    level: PresenceLevel,
}

pub struct GatewayClient {
    api_base: String,
    http: reqwest::Client,
    connected: Arc<AtomicBool>,
    presence: Mutex<PresenceFrame>,
    command_tx: Mutex<Option<mpsc::UnboundedSender<Command>>>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
    stopping: AtomicBool,
    stop: Notify,
    backoff_base: Duration,
    backoff_max: Duration,
}

impl GatewayClient {
    pub fn new(api_base: impl Into<String>) -> Self {
        Self {
            api_base: api_base.into(),
            http: reqwest::Client::new(),
            connected: Arc::new(AtomicBool::new(false)),
            presence: Mutex::new(PresenceFrame { activity: None, level: PresenceLevel::Online }),
            command_tx: Mutex::new(None),
            supervisor: Mutex::new(None),
            stopping: AtomicBool::new(false),
            stop: Notify::new(),
            backoff_base: RECONNECT_BACKOFF_BASE,
            backoff_max: RECONNECT_BACKOFF_MAX,
        }
    }

    #[cfg(test)]
    fn with_reconnect_backoff(mut self, base: Duration, max: Duration) -> Self {
        self.backoff_base = base;
        self.backoff_max = max;
        self
    }

    // 启动后台会话；断线后按指数退避自动重连，直到 disconnect
    pub fn start(self: &Arc<Self>, token: String) -> mpsc::UnboundedReceiver<GatewayEvent> {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let client = self.clone();
        let handle = tokio::spawn(async move { client.maintain(token, event_tx).await });
        *lock(&self.supervisor) = Some(handle);
        event_rx
    }

    // 先发送完已排队的状态更新，再关闭连接
    pub async fn disconnect(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        self.stop.notify_one();
        if let Some(tx) = lock(&self.command_tx).take() {
            let _ = tx.send(Command::Close);
        }
        let supervisor = lock(&self.supervisor).take();
        if let Some(mut handle) = supervisor {
            if time::timeout(CLOSE_TIMEOUT, &mut handle).await.is_err() {
                tracing::warn!("Discord gateway did not close within {:?}", CLOSE_TIMEOUT);
                handle.abort();
            }
        }
        self.connected.store(false, Ordering::SeqCst);
    }

    async fn maintain(&self, token: String, events: mpsc::UnboundedSender<GatewayEvent>) {
        let mut backoff = self.backoff_base;

        while !self.stopping.load(Ordering::SeqCst) {
            match self.connect(&token, events.clone()).await {
                Ok(connection) => {
                    let end = connection.await.unwrap_or_default();
                    if end.fatal {
                        tracing::error!("Discord rejected the gateway session, status updates disabled");
                        return;
                    }
                    if end.ready {
                        backoff = self.backoff_base;
                    }
                }
                Err(SinkError::Unauthorized) => {
                    tracing::error!("Discord rejected the bot token, status updates disabled");
                    return;
                }
                Err(e) => tracing::error!("Failed to connect to Discord: {}", e),
            }

            if self.stopping.load(Ordering::SeqCst) {
                break;
            }
            tracing::info!("Reconnecting to Discord in {:?}", backoff);
            tokio::select! {
                _ = time::sleep(backoff) => {}
                _ = self.stop.notified() => break,
            }
            backoff = (backoff * 2).min(self.backoff_max);
        }
    }

    async fn connect(
        &self,
        token: &str,
        events: mpsc::UnboundedSender<GatewayEvent>,
    ) -> Result<JoinHandle<SessionEnd>, SinkError> {
        let gateway_url = self.fetch_gateway_url(token).await?;
        let (ws, _) = connect_async(format!("{}/?v=10&encoding=json", gateway_url)).await?;
        tracing::info!("Discord gateway connected, identifying...");

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let session = Session::new(token.to_string(), self.connected.clone(), events);
        let handle = tokio::spawn(run_connection(ws, session, command_rx));

        // 连接期间可能已经开始关闭
        let mut slot = lock(&self.command_tx);
        if self.stopping.load(Ordering::SeqCst) {
            let _ = command_tx.send(Command::Close);
        } else {
            *slot = Some(command_tx);
        }
        Ok(handle)
    }

    async fn fetch_gateway_url(&self, token: &str) -> Result<String, SinkError> {
        let response = self
            .http
            .get(format!("{}/gateway/bot", self.api_base.trim_end_matches('/')))
            .header(reqwest::header::AUTHORIZATION, format!("Bot {}", token))
            .send()
            .await?;

        if response.status() == reqwest::StatusCode::UNAUTHORIZED {
            return Err(SinkError::Unauthorized);
        }

        let body: GatewayBotResponse = response.error_for_status()?.json().await?;
        Ok(body.url)
    }

    fn send_presence(&self, update: impl FnOnce(&mut PresenceFrame)) -> Result<(), SinkError> {
        if !self.is_connected() {
            return Err(SinkError::NotConnected);
        }
        let payload = {
            let mut frame = lock(&self.presence);
            update(&mut frame);
            presence_update_payload(&frame)
        };
        match lock(&self.command_tx).as_ref() {
            Some(tx) => tx.send(Command::Send(payload)).map_err(|_| SinkError::NotConnected),
            None => Err(SinkError::NotConnected),
        }
    }
}

impl PresenceSink for GatewayClient {
    fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    fn set_activity(&self, text: Option<String>) -> BoxFuture<'_, Result<(), SinkError>> {
        async move { self.send_presence(|frame| frame.activity = text) }.boxed()
    }

    fn set_presence_level(&self, level: PresenceLevel) -> BoxFuture<'_, Result<(), SinkError>> {
        async move { self.send_presence(|frame| frame.level = level) }.boxed()
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

fn presence_update_payload(frame: &PresenceFrame) -> Value {
    let activities: Vec<Value> = frame
        .activity
        .iter()
        .map(|text| json!({ "type": CUSTOM_STATUS_ACTIVITY, "name": "Custom Status", "state": text }))
        .collect();

    json!({
        "op": OP_PRESENCE_UPDATE,
        "d": {
            "since": null,
            "activities": activities,
            "status": frame.level.as_discord_status(),
            "afk": false
        }
    })
}

// 鉴权失败、分片或 intents 无效：重连也不会成功
fn is_fatal_close(code: u16) -> bool {
    matches!(code, 4004 | 4010..=4014)
}

// 单个网关会话的协议状态
struct Session {
    token: String,
    sequence: Option<u64>,
    heartbeat: Option<Interval>,
    awaiting_ack: bool,
    ready: bool,
    connected: Arc<AtomicBool>,
    events: mpsc::UnboundedSender<GatewayEvent>,
}

impl Session {
    fn new(token: String, connected: Arc<AtomicBool>, events: mpsc::UnboundedSender<GatewayEvent>) -> Self {
        Self {
            token,
            sequence: None,
            heartbeat: None,
            awaiting_ack: false,
            ready: false,
            connected,
            events,
        }
    }

    // 处理一帧入站消息，返回需要回复的内容
    fn on_frame(&mut self, text: &str) -> Result<Option<Value>, SinkError> {
        let payload: GatewayPayload =
            serde_json::from_str(text).map_err(|e| SinkError::Protocol(format!("malformed frame: {}", e)))?;
        if let Some(sequence) = payload.s {
            self.sequence = Some(sequence);
        }

        match payload.op {
            OP_HELLO => {
                let hello: Hello = serde_json::from_value(payload.d)
                    .map_err(|e| SinkError::Protocol(format!("malformed hello: {}", e)))?;
                let period = Duration::from_millis(hello.heartbeat_interval);
                self.heartbeat = Some(time::interval_at(Instant::now() + period, period));
                tracing::debug!("Discord heartbeat interval: {:?}", period);
                Ok(Some(self.identify_payload()))
            }
            OP_DISPATCH if payload.t.as_deref() == Some("READY") => {
                let ready: Ready = serde_json::from_value(payload.d)
                    .map_err(|e| SinkError::Protocol(format!("malformed ready: {}", e)))?;
                self.ready = true;
                self.connected.store(true, Ordering::SeqCst);
                let _ = self.events.send(GatewayEvent::Ready {
                    username: ready.user.username,
                    discriminator: ready.user.discriminator.unwrap_or_else(|| "0".to_string()),
                });
                Ok(None)
            }
            OP_DISPATCH => Ok(None),
            OP_HEARTBEAT => Ok(Some(self.heartbeat_payload())),
            OP_HEARTBEAT_ACK => {
                self.awaiting_ack = false;
                tracing::trace!("Discord heartbeat acknowledged");
                Ok(None)
            }
            OP_RECONNECT => Err(SinkError::Protocol("gateway requested reconnect".to_string())),
            OP_INVALID_SESSION => Err(SinkError::Protocol("invalid session".to_string())),
            other => {
                tracing::trace!("Ignoring gateway opcode {}", other);
                Ok(None)
            }
        }
    }

    // 上一次心跳未被确认说明连接已失效
    fn heartbeat_due(&mut self) -> Result<Value, SinkError> {
        if self.awaiting_ack {
            return Err(SinkError::Protocol("heartbeat was not acknowledged".to_string()));
        }
        self.awaiting_ack = true;
        Ok(self.heartbeat_payload())
    }

    fn heartbeat_payload(&self) -> Value {
        json!({ "op": OP_HEARTBEAT, "d": self.sequence })
    }

    fn identify_payload(&self) -> Value {
        json!({
            "op": OP_IDENTIFY,
            "d": {
                "token": self.token,
                "intents": INTENT_GUILDS,
                "properties": {
                    "os": std::env::consts::OS,
                    "browser": env!("CARGO_PKG_NAME"),
                    "device": env!("CARGO_PKG_NAME")
                }
            }
        })
    }
}

enum Step {
    Frame(String),
    Closed(Option<u16>),
    Heartbeat,
    Send(Value),
    Close,
    Stop,
}

async fn next_heartbeat(heartbeat: &mut Option<Interval>) {
    match heartbeat {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending::<()>().await,
    }
}

// 网关连接的读写循环
async fn run_connection<S>(
    ws: WebSocketStream<S>,
    mut session: Session,
    mut commands: mpsc::UnboundedReceiver<Command>,
) -> SessionEnd
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut write, mut read) = ws.split();
    let mut fatal = false;

    loop {
        let step = tokio::select! {
            frame = read.next() => match frame {
                Some(Ok(Message::Text(text))) => Step::Frame(text),
                Some(Ok(Message::Close(frame))) => Step::Closed(frame.map(|f| u16::from(f.code))),
                Some(Ok(_)) => continue,
                Some(Err(e)) => {
                    tracing::error!("Discord gateway read failed: {}", e);
                    Step::Stop
                }
                None => Step::Stop,
            },
            _ = next_heartbeat(&mut session.heartbeat) => Step::Heartbeat,
            command = commands.recv() => match command {
                Some(Command::Send(payload)) => Step::Send(payload),
                Some(Command::Close) | None => Step::Close,
            },
        };

        let outgoing = match step {
            Step::Frame(text) => match session.on_frame(&text) {
                Ok(reply) => reply,
                Err(e) => {
                    tracing::warn!("Discord gateway session ended: {}", e);
                    break;
                }
            },
            Step::Closed(code) => {
                tracing::warn!("Discord gateway closed the connection (code {:?})", code);
                fatal = code.is_some_and(is_fatal_close);
                break;
            }
            Step::Heartbeat => match session.heartbeat_due() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    tracing::warn!("Discord gateway session ended: {}", e);
                    break;
                }
            },
            Step::Send(payload) => Some(payload),
            Step::Close => {
                let _ = write.send(Message::Close(None)).await;
                break;
            }
            Step::Stop => break,
        };

        if let Some(payload) = outgoing {
            if let Err(e) = write.send(Message::Text(payload.to_string())).await {
                tracing::error!("Discord gateway write failed: {}", e);
                break;
            }
        }
    }

    session.connected.store(false, Ordering::SeqCst);
    let _ = session.events.send(GatewayEvent::Closed);
    tracing::info!("Discord gateway disconnected");
    SessionEnd { ready: session.ready, fatal }
}
