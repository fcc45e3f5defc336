//! Per-connection duplex loops on top of the hub.
//!
//! Inbound reads control frames under an idle deadline. Outbound drains
//! the mailbox, coalescing queued frames, and pings on a fixed period
//! whether or not data is flowing. The two
//! share nothing but the mailbox and a session-scoped cancel token.

use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::api::health::MetricsSink;
use crate::config::{WS_MAX_COALESCE, WS_PING_PERIOD_SECS, WS_PONG_WAIT_SECS, WS_WRITE_WAIT_SECS};
use crate::ws::hub::{ClientId, Frame, Hub, Registration};
use crate::ws::messages::{parse_client_message, ClientCommand, ServerMessage};

#[derive(Debug, Clone, Copy)]
pub struct SessionSettings {
    pub write_wait: Duration,
    pub pong_wait: Duration,
    pub ping_period: Duration,
    pub max_coalesce: usize,
}

impl Default for SessionSettings {
    fn default() -> Self {
        Self {
            write_wait: Duration::from_secs(WS_WRITE_WAIT_SECS),
            pong_wait: Duration::from_secs(WS_PONG_WAIT_SECS),
            ping_period: Duration::from_secs(WS_PING_PERIOD_SECS),
            max_coalesce: WS_MAX_COALESCE,
        }
    }
}

/// Drive one upgraded socket until either side ends or `shutdown` fires.
pub async fn run_session(
    socket: WebSocket,
    hub: Arc<Hub>,
    metrics: Arc<dyn MetricsSink>,
    settings: SessionSettings,
    shutdown: CancellationToken,
) {
    let Registration { id, rx, accepted } = hub.register();
    let (sink, stream) = socket.split();
    let cancel = shutdown.child_token();

    if !accepted {
        // Mailbox already holds the capacity error and is closed;
        // outbound delivers it and then closes the socket.
        outbound(id, sink, rx, settings, metrics, cancel).await;
        return;
    }

    let writer = tokio::spawn(outbound(id, sink, rx, settings, metrics, cancel.clone()));
    inbound(id, stream, &hub, settings, &cancel).await;

    cancel.cancel();
    hub.unregister(id);
    let _ = writer.await;
    debug!(client_id = id, "session closed");
}

async fn inbound(
    id: ClientId,
    mut stream: SplitStream<WebSocket>,
    hub: &Hub,
    settings: SessionSettings,
    cancel: &CancellationToken,
) {
    loop {
        // Any frame, pongs included, renews the deadline.
        let next = tokio::select! {
            _ = cancel.cancelled() => break,
            r = timeout(settings.pong_wait, stream.next()) => r,
        };

        match next {
            Err(_) => {
                info!(client_id = id, "client idle past read deadline");
                break;
            }
            Ok(None) => break,
            Ok(Some(Err(e))) => {
                debug!(client_id = id, "read error: {e}");
                break;
            }
            Ok(Some(Ok(Message::Text(text)))) => handle_text(id, hub, &text),
            Ok(Some(Ok(Message::Binary(_)))) => {
                hub.send_to(id, &ServerMessage::error("binary frames are not supported"));
            }
            Ok(Some(Ok(Message::Close(_)))) => break,
            Ok(Some(Ok(Message::Ping(_)))) | Ok(Some(Ok(Message::Pong(_)))) => {}
        }
    }
}

fn handle_text(id: ClientId, hub: &Hub, text: &str) {
    match parse_client_message(text) {
        Ok(ClientCommand::Subscribe(topic)) => {
            if hub.subscribe(id, topic) {
                hub.send_to(id, &ServerMessage::status(format!("subscribed to {topic}")));
            }
        }
        Ok(ClientCommand::Unsubscribe(topic)) => {
            if let Some(left) = hub.unsubscribe(id, topic) {
                hub.send_to(id, &ServerMessage::status(format!("unsubscribed from {left}")));
            }
        }
        Ok(ClientCommand::Ping) => {
            hub.send_to(id, &ServerMessage::pong());
        }
        Err(reason) => {
            debug!(client_id = id, %reason, "rejected client message");
            hub.send_to(id, &ServerMessage::error(reason));
        }
    }
}

async fn outbound(
    id: ClientId,
    mut sink: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Frame>,
    settings: SessionSettings,
    metrics: Arc<dyn MetricsSink>,
    cancel: CancellationToken,
) {
    // Data frames do not reset the ticker; a listen-only client only
    // renews its read deadline by answering these pings.
    let mut keepalive = interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    keepalive.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = timeout(settings.write_wait, sink.send(Message::Close(None))).await;
                break;
            }

            maybe = rx.recv() => {
                let Some(first) = maybe else {
                    // Hub dropped the sender: evicted, rejected, or unregistered.
                    let _ = timeout(settings.write_wait, sink.send(Message::Close(None))).await;
                    break;
                };

                let (payload, count) = coalesce(first, &mut rx, settings.max_coalesce);
                let bytes = payload.len() as u64;
                match timeout(settings.write_wait, sink.send(Message::Text(payload))).await {
                    Ok(Ok(())) => {
                        metrics.messages_sent(count, bytes);
                    }
                    Ok(Err(e)) => {
                        metrics.message_failed();
                        debug!(client_id = id, "write error: {e}");
                        break;
                    }
                    Err(_) => {
                        metrics.message_failed();
                        warn!(client_id = id, "write deadline exceeded");
                        break;
                    }
                }
            }

            _ = keepalive.tick() => {
                if !matches!(
                    timeout(settings.write_wait, sink.send(Message::Ping(Vec::new()))).await,
                    Ok(Ok(()))
                ) {
                    debug!(client_id = id, "keepalive ping failed");
                    break;
                }
            }
        }
    }

    // Wakes the inbound loop so it runs the unregister path.
    cancel.cancel();
}

/// Join whatever is already queued behind `first`, newline-delimited.
fn coalesce(first: Frame, rx: &mut mpsc::Receiver<Frame>, max: usize) -> (String, u64) {
    let mut payload = String::from(&*first);
    let mut count = 1u64;
    while (count as usize) < max.max(1) {
        match rx.try_recv() {
            Ok(next) => {
                payload.push('\n');
                payload.push_str(&next);
                count += 1;
            }
            Err(_) => break,
        }
    }
    (payload, count)
}
