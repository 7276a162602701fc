// Realtime Ingest Channel
// One authenticated websocket per instance feeding the entity cache, reconnecting with backoff

pub mod protocol;
pub mod reconcile;

pub use reconcile::{reconcile_once, run_reconciliation, ReconcileStats};

use crate::config::WebsocketConfig;
use crate::error::{MedicError, MedicResult};
use crate::network::backoff_delay;
use crate::state::EntityCache;
use futures::{SinkExt, StreamExt};
use protocol::{CallServiceData, Inbound, StateChangedData, EVENT_CALL_SERVICE, EVENT_STATE_CHANGED};
use serde::Serialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Instance status published by the ingest channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum InstanceHealth {
    Starting,
    Connected,
    Reconnecting { attempt: u32 },
    /// Realtime disabled; reconciliation only
    Polling,
    /// Realtime monitoring stopped for good; reconciliation keeps running
    Degraded(String),
    Stopped,
}

/// Why the channel loop returned
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelExit {
    Cancelled,
    AuthFailed(String),
    Exhausted { attempts: u32 },
}

/// Websocket endpoint for a controller base url
pub fn websocket_url(base_url: &str) -> MedicResult<String> {
    let base = base_url.trim_end_matches('/');
    let ws = if let Some(rest) = base.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = base.strip_prefix("http://") {
        format!("ws://{rest}")
    } else {
        return Err(MedicError::Config(format!("unsupported controller url '{base_url}'")));
    };
    Ok(format!("{ws}/api/websocket"))
}

/// Per-instance realtime channel
pub struct RealtimeChannel {
    instance_id: String,
    ws_url: String,
    token: String,
    config: WebsocketConfig,
    cache: Arc<EntityCache>,
    status_tx: watch::Sender<InstanceHealth>,

    /// Signals the supervisor that a reload service ran
    refresh_tx: Option<mpsc::Sender<()>>,
}

impl RealtimeChannel {
    pub fn new(
        instance_id: impl Into<String>,
        base_url: &str,
        token: impl Into<String>,
        config: WebsocketConfig,
        cache: Arc<EntityCache>,
        status_tx: watch::Sender<InstanceHealth>,
    ) -> MedicResult<Self> {
        Ok(Self {
            instance_id: instance_id.into(),
            ws_url: websocket_url(base_url)?,
            token: token.into(),
            config,
            cache,
            status_tx,
            refresh_tx: None,
        })
    }

    /// Enable discovery-refresh signalling on reload service calls
    pub fn with_refresh(mut self, refresh_tx: mpsc::Sender<()>) -> Self {
        if self.config.discovery_refresh {
            self.refresh_tx = Some(refresh_tx);
        }
        self
    }

    pub fn ws_url(&self) -> &str {
        &self.ws_url
    }

    /// Connect, stream and reconnect until cancelled, rejected or out of attempts
    #[instrument(skip(self, token), fields(instance = %self.instance_id))]
    pub async fn run(&self, token: CancellationToken) -> ChannelExit {
        let base = Duration::from_millis(self.config.reconnect_base_ms);
        let max_delay = Duration::from_millis(self.config.reconnect_max_delay_ms);
        let mut attempt: u32 = 0;

        loop {
            if token.is_cancelled() {
                self.publish(InstanceHealth::Stopped);
                return ChannelExit::Cancelled;
            }

            match self.session(&token, &mut attempt).await {
                Ok(()) => {
                    self.publish(InstanceHealth::Stopped);
                    return ChannelExit::Cancelled;
                }
                Err(MedicError::Auth(message)) => {
                    warn!(error = %message, "controller rejected credentials - realtime channel stopped");
                    self.publish(InstanceHealth::Degraded(format!("authentication failed: {message}")));
                    return ChannelExit::AuthFailed(message);
                }
                Err(e) => {
                    attempt += 1;
                    if attempt > self.config.max_reconnect_attempts {
                        warn!(error = %e, attempts = attempt - 1, "reconnect attempts exhausted - realtime channel stopped");
                        self.publish(InstanceHealth::Degraded(format!(
                            "reconnect attempts exhausted after {} tries: {e}",
                            attempt - 1
                        )));
                        return ChannelExit::Exhausted { attempts: attempt - 1 };
                    }

                    let delay = backoff_delay(attempt, base, max_delay);
                    warn!(error = %e, attempt, delay_ms = delay.as_millis() as u64, "realtime channel lost - reconnecting");
                    self.publish(InstanceHealth::Reconnecting { attempt });

                    tokio::select! {
                        _ = token.cancelled() => {
                            self.publish(InstanceHealth::Stopped);
                            return ChannelExit::Cancelled;
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }
    }

    /// One connection lifetime; Ok only when cancelled
    async fn session(&self, token: &CancellationToken, attempt: &mut u32) -> MedicResult<()> {
        let handshake_timeout = self.config.handshake_timeout();

        let (mut ws, _) = tokio::time::timeout(handshake_timeout, connect_async(self.ws_url.as_str()))
            .await
            .map_err(|_| MedicError::Connection("websocket connect timed out".into()))?
            .map_err(|e| MedicError::Connection(e.to_string()))?;

        tokio::time::timeout(handshake_timeout, self.authenticate(&mut ws))
            .await
            .map_err(|_| MedicError::Connection("authentication timed out".into()))??;

        let mut next_id = tokio::time::timeout(handshake_timeout, self.subscribe(&mut ws))
            .await
            .map_err(|_| MedicError::Connection("subscription acknowledgement timed out".into()))??;

        *attempt = 0;
        self.publish(InstanceHealth::Connected);
        info!(url = %self.ws_url, "realtime channel subscribed");

        let receive_timeout = self.config.receive_timeout();
        let mut idle_strikes = 0u32;

        loop {
            let frame = tokio::select! {
                _ = token.cancelled() => None,
                frame = tokio::time::timeout(receive_timeout, ws.next()) => Some(frame),
            };

            let Some(frame) = frame else {
                let _ = ws.close(None).await;
                return Ok(());
            };

            match frame {
                Err(_) => {
                    idle_strikes += 1;
                    if idle_strikes >= 2 {
                        return Err(MedicError::Connection("no traffic within receive timeout".into()));
                    }
                    debug!("channel idle - sending ping");
                    send_text(&mut ws, protocol::ping(next_id)).await?;
                    next_id += 1;
                }
                Ok(None) => return Err(MedicError::Connection("stream ended".into())),
                Ok(Some(Err(e))) => return Err(MedicError::Connection(e.to_string())),
                Ok(Some(Ok(message))) => {
                    idle_strikes = 0;
                    match message {
                        Message::Text(text) => self.handle_text(&text),
                        Message::Close(frame) => {
                            let reason = frame.map(|f| f.reason.to_string()).unwrap_or_default();
                            return Err(MedicError::Connection(format!("closed by server {reason}")));
                        }
                        _ => {}
                    }
                }
            }
        }
    }

    async fn authenticate(&self, ws: &mut WsStream) -> MedicResult<()> {
        expect_message(ws, |m| matches!(m, Inbound::AuthRequired), "auth_required").await?;
        send_text(ws, protocol::auth(&self.token)).await?;

        loop {
            for message in read_messages(ws).await? {
                match message {
                    Inbound::AuthOk => return Ok(()),
                    Inbound::AuthInvalid { message } => {
                        return Err(MedicError::Auth(message.unwrap_or_else(|| "auth_invalid".into())));
                    }
                    other => debug!(?other, "ignoring message during authentication"),
                }
            }
        }
    }

    /// Subscribe and wait for every acknowledgement; returns the next free message id
    async fn subscribe(&self, ws: &mut WsStream) -> MedicResult<u64> {
        let mut event_types = vec![EVENT_STATE_CHANGED];
        if self.refresh_tx.is_some() {
            event_types.push(EVENT_CALL_SERVICE);
        }

        let mut pending = BTreeSet::new();
        let mut next_id = 1u64;
        for event_type in event_types {
            send_text(ws, protocol::subscribe_events(next_id, event_type)).await?;
            pending.insert(next_id);
            next_id += 1;
        }

        while !pending.is_empty() {
            for message in read_messages(ws).await? {
                match message {
                    Inbound::Result { id, success: true, .. } => {
                        pending.remove(&id);
                    }
                    Inbound::Result { id, success: false, error } => {
                        let detail = error.and_then(|e| e.message).unwrap_or_default();
                        return Err(MedicError::Protocol(format!("subscription {id} rejected: {detail}")));
                    }
                    event @ Inbound::Event { .. } => self.handle_message(event),
                    _ => {}
                }
            }
        }
        Ok(next_id)
    }

    fn handle_text(&self, text: &str) {
        match protocol::parse_frame(text) {
            Ok(messages) => messages.into_iter().for_each(|m| self.handle_message(m)),
            Err(e) => warn!(error = %e, "dropping malformed message"),
        }
    }

    fn handle_message(&self, message: Inbound) {
        match message {
            Inbound::Event { event, .. } if event.event_type == EVENT_STATE_CHANGED => {
                match serde_json::from_value::<StateChangedData>(event.data) {
                    Ok(StateChangedData {
                        new_state: Some(state),
                        ..
                    }) => {
                        self.cache.put(state);
                    }
                    Ok(StateChangedData {
                        entity_id,
                        new_state: None,
                    }) => {
                        self.cache.remove(&entity_id);
                    }
                    Err(e) => warn!(error = %e, "dropping malformed state_changed event"),
                }
            }
            Inbound::Event { event, .. } if event.event_type == EVENT_CALL_SERVICE => {
                let Some(refresh_tx) = &self.refresh_tx else {
                    return;
                };
                match serde_json::from_value::<CallServiceData>(event.data) {
                    Ok(call) if call.is_reload() => {
                        debug!(domain = %call.domain, service = %call.service, "reload observed - requesting discovery refresh");
                        // A refresh already queued covers this one
                        let _ = refresh_tx.try_send(());
                    }
                    Ok(_) => {}
                    Err(e) => debug!(error = %e, "ignoring malformed call_service event"),
                }
            }
            Inbound::Result { id, success: false, error } => {
                let detail = error.and_then(|e| e.message).unwrap_or_default();
                warn!(id, error = %detail, "command rejected by controller");
            }
            Inbound::Pong { .. } => debug!("pong"),
            _ => {}
        }
    }

    fn publish(&self, health: InstanceHealth) {
        self.status_tx.send_replace(health);
    }
}

async fn send_text(ws: &mut WsStream, payload: String) -> MedicResult<()> {
    ws.send(Message::Text(payload))
        .await
        .map_err(|e| MedicError::Connection(e.to_string()))
}

/// Next batch of protocol messages; control frames yield an empty batch
async fn read_messages(ws: &mut WsStream) -> MedicResult<Vec<Inbound>> {
    match ws.next().await {
        Some(Ok(Message::Text(text))) => {
            protocol::parse_frame(&text).map_err(|e| MedicError::Protocol(e.to_string()))
        }
        Some(Ok(Message::Close(_))) | None => Err(MedicError::Connection("closed during handshake".into())),
        Some(Ok(_)) => Ok(Vec::new()),
        Some(Err(e)) => Err(MedicError::Connection(e.to_string())),
    }
}

async fn expect_message<F>(ws: &mut WsStream, accept: F, expected: &str) -> MedicResult<()>
where
    F: Fn(&Inbound) -> bool,
{
    loop {
        let messages = read_messages(ws).await?;
        if let Some(first) = messages.first() {
            if accept(first) {
                return Ok(());
            }
            return Err(MedicError::Protocol(format!("expected {expected}, got {first:?}")));
        }
    }
}
