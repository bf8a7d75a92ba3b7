use futures::{SinkExt, StreamExt};
use serde_json::Value;
use std::future::Future;
use std::time::{Duration, Instant};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

use super::messages::{
    candle_subscription, parse_business, parse_event, parse_private, private_subscription,
    PrivateEvent,
};
use crate::config::{BotConfig, Credentials, WsSettings};
use crate::error::ExchangeError;
use crate::exchange::signing::ws_login_frame;
use crate::execution::TriggerBook;
use crate::models::Candle;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(15);
const LOGIN_TIMEOUT: Duration = Duration::from_secs(10);
const INITIAL_BACKOFF: Duration = Duration::from_secs(1);

/// How a session ended without an error
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SessionEnd {
    /// Stop flag raised or the consumer went away; do not reconnect
    Stopped,
    /// Server closed the socket; reconnect
    Closed,
}

fn stop_requested(stop: &watch::Receiver<bool>) -> bool {
    *stop.borrow()
}

/// Next reconnect delay: doubled, capped
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Run `session` until the stop flag is raised, reconnecting with doubling backoff
async fn reconnect_loop<F, Fut>(
    name: &'static str,
    settings: WsSettings,
    mut stop: watch::Receiver<bool>,
    mut session: F,
) where
    F: FnMut(watch::Receiver<bool>) -> Fut,
    Fut: Future<Output = Result<SessionEnd, ExchangeError>>,
{
    let max_delay = Duration::from_secs(settings.reconnect_max_delay_secs.max(1));
    let mut delay = INITIAL_BACKOFF;

    while !stop_requested(&stop) {
        let started = Instant::now();
        match session(stop.clone()).await {
            Ok(SessionEnd::Stopped) => break,
            Ok(SessionEnd::Closed) => tracing::warn!(stream = name, "connection closed by server"),
            Err(e) => tracing::error!(stream = name, error = %e, "stream error"),
        }

        // A session that stayed up for a while resets the backoff
        if started.elapsed() > max_delay {
            delay = INITIAL_BACKOFF;
        }
        tracing::info!(stream = name, delay_secs = delay.as_secs(), "reconnecting");
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            changed = stop.changed() => {
                if changed.is_err() || stop_requested(&stop) {
                    break;
                }
            }
        }
        delay = next_backoff(delay, max_delay);
    }
    tracing::info!(stream = name, "stream stopped");
}

async fn connect(url: &str) -> Result<WsStream, ExchangeError> {
    let (ws, _) = tokio::time::timeout(CONNECT_TIMEOUT, connect_async(url))
        .await
        .map_err(|_| ExchangeError::Timeout)?
        .map_err(|e| ExchangeError::Network(e.to_string()))?;
    Ok(ws)
}

async fn send_json<S>(sink: &mut S, frame: &Value) -> Result<(), ExchangeError>
where
    S: futures::Sink<Message, Error = tokio_tungstenite::tungstenite::Error> + Unpin,
{
    sink.send(Message::Text(frame.to_string()))
        .await
        .map_err(|e| ExchangeError::Network(e.to_string()))
}

/// Send the login frame and wait for its acknowledgement
async fn login(ws: &mut WsStream, credentials: &Credentials) -> Result<(), ExchangeError> {
    let frame = ws_login_frame(credentials, chrono::Utc::now().timestamp())?;
    send_json(ws, &frame).await?;

    let deadline = tokio::time::Instant::now() + LOGIN_TIMEOUT;
    loop {
        let msg = tokio::time::timeout_at(deadline, ws.next())
            .await
            .map_err(|_| ExchangeError::Timeout)?;
        match msg {
            Some(Ok(Message::Text(text))) => {
                let Some(event) = parse_event(&text) else {
                    continue;
                };
                if event.is_error() {
                    return Err(ExchangeError::Api {
                        code: event.code,
                        msg: event.msg,
                    });
                }
                if event.event == "login" {
                    tracing::info!("private stream logged in");
                    return Ok(());
                }
            }
            Some(Ok(Message::Ping(payload))) => {
                ws.send(Message::Pong(payload))
                    .await
                    .map_err(|e| ExchangeError::Network(e.to_string()))?;
            }
            Some(Ok(Message::Close(_))) | None => {
                return Err(ExchangeError::Network("closed during login".into()));
            }
            Some(Ok(_)) => {}
            Some(Err(e)) => return Err(ExchangeError::Network(e.to_string())),
        }
    }
}

/// Read frames until stop, close or silence
///
/// Sends a text `ping` every `ping_interval_secs`; if nothing at all has
/// been received for `recv_timeout_secs` the session fails so the caller
/// reconnects. Parsed items are forwarded in arrival order.
async fn drive<T, P>(
    ws: WsStream,
    settings: &WsSettings,
    stop: &mut watch::Receiver<bool>,
    tx: &mpsc::Sender<T>,
    mut parse: P,
) -> Result<SessionEnd, ExchangeError>
where
    P: FnMut(&str) -> Vec<T>,
{
    let (mut write, mut read) = ws.split();
    let recv_timeout = Duration::from_secs(settings.recv_timeout_secs.max(1));
    let mut ping = interval(Duration::from_secs(settings.ping_interval_secs.max(1)));
    ping.tick().await;
    let mut last_recv = Instant::now();

    loop {
        tokio::select! {
            msg = read.next() => {
                let Some(msg) = msg else {
                    return Ok(SessionEnd::Closed);
                };
                last_recv = Instant::now();
                match msg {
                    Ok(Message::Text(text)) => {
                        if let Some(event) = parse_event(&text) {
                            if event.is_error() {
                                tracing::warn!(code = %event.code, msg = %event.msg, "stream error event");
                            } else {
                                tracing::debug!(event = %event.event, "stream event");
                            }
                            continue;
                        }
                        for item in parse(&text) {
                            if tx.send(item).await.is_err() {
                                return Ok(SessionEnd::Stopped);
                            }
                        }
                    }
                    Ok(Message::Ping(payload)) => {
                        write
                            .send(Message::Pong(payload))
                            .await
                            .map_err(|e| ExchangeError::Network(e.to_string()))?;
                    }
                    Ok(Message::Close(_)) => return Ok(SessionEnd::Closed),
                    Ok(_) => {}
                    Err(e) => return Err(ExchangeError::Network(e.to_string())),
                }
            }
            _ = ping.tick() => {
                if last_recv.elapsed() >= recv_timeout {
                    return Err(ExchangeError::Timeout);
                }
                write
                    .send(Message::Text("ping".to_string()))
                    .await
                    .map_err(|e| ExchangeError::Network(e.to_string()))?;
            }
            changed = stop.changed() => {
                if changed.is_err() || stop_requested(stop) {
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(SessionEnd::Stopped);
                }
            }
        }
    }
}

/// Closed candles for the configured instrument and bar
pub fn spawn_candle_stream(
    config: &BotConfig,
    tx: mpsc::Sender<Candle>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let url = config.exchange.ws_business_url.clone();
    let subscription = candle_subscription(&config.exchange.bar, &config.exchange.inst_id);
    let settings = config.ws.clone();

    tokio::spawn(reconnect_loop("candles", settings.clone(), stop, move |mut stop| {
        let url = url.clone();
        let subscription = subscription.clone();
        let settings = settings.clone();
        let tx = tx.clone();
        async move {
            let mut ws = connect(&url).await?;
            send_json(&mut ws, &subscription).await?;
            tracing::info!(url = %url, "candle stream subscribed");
            drive(ws, &settings, &mut stop, &tx, parse_business).await
        }
    }))
}

/// Order and algo-order updates for the account
///
/// An `effective` algo update for a pending entry trigger marks the trigger
/// book as soon as the frame is read, before the event is queued.
pub fn spawn_private_stream(
    config: &BotConfig,
    triggers: TriggerBook,
    tx: mpsc::Sender<PrivateEvent>,
    stop: watch::Receiver<bool>,
) -> JoinHandle<()> {
    let url = config.exchange.ws_private_url.clone();
    let credentials = config.credentials.clone();
    let settings = config.ws.clone();

    tokio::spawn(reconnect_loop("private", settings.clone(), stop, move |mut stop| {
        let url = url.clone();
        let credentials = credentials.clone();
        let settings = settings.clone();
        let triggers = triggers.clone();
        let tx = tx.clone();
        async move {
            let mut ws = connect(&url).await?;
            login(&mut ws, &credentials).await?;
            send_json(&mut ws, &private_subscription()).await?;
            tracing::info!(url = %url, "private stream subscribed");
            drive(ws, &settings, &mut stop, &tx, |text| {
                let events = parse_private(text);
                mark_fired_triggers(&triggers, &events);
                events
            })
            .await
        }
    }))
}

fn mark_fired_triggers(triggers: &TriggerBook, events: &[PrivateEvent]) {
    for event in events {
        if let PrivateEvent::AlgoUpdate {
            algo_id,
            state,
            size,
            ..
        } = event
        {
            if state == "effective" {
                if let Some(direction) = triggers.mark_algo_effective(algo_id, *size) {
                    tracing::info!(direction = %direction, algo_id = %algo_id, "trigger fired");
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Direction;
    use crate::persistence::PendingTriggers;

    #[test]
    fn test_backoff_doubles_and_caps() {
        let max = Duration::from_secs(120);
        let mut d = INITIAL_BACKOFF;
        let mut seen = Vec::new();
        for _ in 0..9 {
            seen.push(d.as_secs());
            d = next_backoff(d, max);
        }
        assert_eq!(seen, vec![1, 2, 4, 8, 16, 32, 64, 120, 120]);
    }

    #[test]
    fn test_effective_trigger_marked_on_receipt() {
        let book = TriggerBook::new(PendingTriggers::default());
        book.set_pending(Direction::Long, "trig-1".into());

        let events = vec![
            PrivateEvent::AlgoUpdate {
                algo_id: "sl-9".into(),
                state: "effective".into(),
                side: "sell".into(),
                size: 1.0,
            },
            PrivateEvent::AlgoUpdate {
                algo_id: "trig-1".into(),
                state: "effective".into(),
                side: "buy".into(),
                size: 1.5,
            },
        ];
        mark_fired_triggers(&book, &events);

        let marker = book.triggered().unwrap();
        assert_eq!(marker.direction, Direction::Long);
        assert_eq!(marker.algo_id, "trig-1");
        assert!(book.entry_active());
    }

    #[test]
    fn test_live_state_does_not_mark() {
        let book = TriggerBook::new(PendingTriggers::default());
        book.set_pending(Direction::Short, "trig-2".into());
        mark_fired_triggers(
            &book,
            &[PrivateEvent::AlgoUpdate {
                algo_id: "trig-2".into(),
                state: "live".into(),
                side: "sell".into(),
                size: 1.0,
            }],
        );
        assert!(book.triggered().is_none());
    }
}
