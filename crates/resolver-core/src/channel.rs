//! Control channel between the host and a sandboxed script
//!
//! The transport is plain HTTP over loopback. The sandbox listens on the control
//! port; the host polls `GET /` until the listener answers, then posts the
//! `start` event to `POST /`. The reply body is the script's terminal event.
//!
//! Sends never fail synchronously. Replies and transport failures are delivered
//! in order through the stream returned by [`ControlChannel::events`], so one
//! failed request cannot unwind the caller's event loop.

use futures_util::Stream;
use std::pin::Pin;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::errors::ChannelError;
use crate::ipc::{decode_event, Decoded, IpcEvent};

/// One item of the inbound event stream.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Event(IpcEvent),
    /// Event with an action this host does not understand.
    Unknown(String),
    Error(ChannelError),
}

pub struct ControlChannel {
    base_url: String,
    client: reqwest::Client,
    poll_interval: Duration,
    probe_timeout: Duration,
    closed: CancellationToken,
    in_flight: Arc<AtomicUsize>,
    tx: mpsc::UnboundedSender<ChannelEvent>,
    rx: Mutex<Option<mpsc::UnboundedReceiver<ChannelEvent>>>,
}

impl ControlChannel {
    pub fn new(host: &str, port: u16, poll_interval: Duration, probe_timeout: Duration) -> Self {
        let client = reqwest::Client::builder()
            .no_proxy()
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());
        let (tx, rx) = mpsc::unbounded_channel();
        Self {
            base_url: format!("http://{}:{}", host, port),
            client,
            poll_interval,
            probe_timeout,
            closed: CancellationToken::new(),
            in_flight: Arc::new(AtomicUsize::new(0)),
            tx,
            rx: Mutex::new(Some(rx)),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Polls the liveness probe until it answers, `timeout` elapses, or the
    /// channel is closed.
    pub async fn connect(&self, timeout: Duration) -> Result<(), ChannelError> {
        let deadline = Instant::now() + timeout;
        let mut connected = false;
        while !connected && !self.closed.is_cancelled() && Instant::now() < deadline {
            connected = tokio::select! {
                _ = self.closed.cancelled() => false,
                ok = self.probe() => ok,
            };
            if connected {
                log::debug!("Connected to sandbox control server at {}", self.base_url);
            } else {
                tokio::select! {
                    _ = self.closed.cancelled() => {}
                    _ = tokio::time::sleep_until(deadline.min(Instant::now() + self.poll_interval)) => {}
                }
            }
        }

        // Closed before the handshake could complete
        if self.closed.is_cancelled() {
            return Err(ChannelError::Disconnected);
        }
        if !connected {
            return Err(ChannelError::ConnectTimeout {
                timeout_ms: timeout.as_millis() as u64,
            });
        }
        Ok(())
    }

    async fn probe(&self) -> bool {
        match self
            .client
            .get(format!("{}/", self.base_url))
            .timeout(self.probe_timeout)
            .send()
            .await
        {
            Ok(res) => res.status() == reqwest::StatusCode::OK,
            Err(_) => false,
        }
    }

    /// Transmits one event. The reply, or the failure, arrives on the event stream.
    pub fn send(&self, event: IpcEvent) {
        if self.closed.is_cancelled() {
            let _ = self.tx.send(ChannelEvent::Error(ChannelError::Disconnected));
            return;
        }

        log::debug!("Sending {} event to {}", event.action(), self.base_url);
        self.in_flight.fetch_add(1, Ordering::SeqCst);
        let client = self.client.clone();
        let url = format!("{}/", self.base_url);
        let closed = self.closed.clone();
        let tx = self.tx.clone();
        let in_flight = self.in_flight.clone();

        tokio::spawn(async move {
            let reply = tokio::select! {
                _ = closed.cancelled() => Err(ChannelError::Disconnected),
                reply = Self::post(&client, &url, &event) => reply,
            };
            let item = match reply {
                Ok(body) => match decode_event(&body) {
                    Ok(Decoded::Event(event)) => {
                        log::debug!("Received {} event", event.action());
                        ChannelEvent::Event(event)
                    }
                    Ok(Decoded::Unknown(action)) => ChannelEvent::Unknown(action),
                    Err(e) => {
                        log::debug!("Error parsing message: {}", e);
                        ChannelEvent::Error(ChannelError::Decode(e.to_string()))
                    }
                },
                Err(e) => ChannelEvent::Error(e),
            };
            // Publish before releasing the in-flight slot; `in_flight() == 0`
            // then implies every reply is already buffered.
            let _ = tx.send(item);
            in_flight.fetch_sub(1, Ordering::SeqCst);
        });
    }

    async fn post(
        client: &reqwest::Client,
        url: &str,
        event: &IpcEvent,
    ) -> Result<Vec<u8>, ChannelError> {
        let response = client
            .post(url)
            .json(event)
            .send()
            .await
            .and_then(|res| res.error_for_status())
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        let body = response
            .bytes()
            .await
            .map_err(|e| ChannelError::Transport(e.to_string()))?;
        Ok(body.to_vec())
    }

    /// Inbound events for the lifetime of the channel. The stream is handed out
    /// once; later calls get an already finished stream.
    pub fn events(&self) -> EventStream {
        let mut slot = self.rx.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        match slot.take() {
            Some(rx) => EventStream { rx },
            None => {
                let (_, rx) = mpsc::unbounded_channel();
                EventStream { rx }
            }
        }
    }

    /// Number of sends whose reply has not been published yet.
    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Marks the channel inactive. Pending handshakes and sends abort promptly.
    pub fn close(&self) {
        if !self.closed.is_cancelled() {
            log::debug!("Closing control channel {}", self.base_url);
            self.closed.cancel();
        }
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.closed.cancel();
    }
}

/// Lazy sequence of inbound events.
pub struct EventStream {
    rx: mpsc::UnboundedReceiver<ChannelEvent>,
}

impl EventStream {
    /// Next already buffered event, without waiting.
    pub fn try_next(&mut self) -> Option<ChannelEvent> {
        self.rx.try_recv().ok()
    }
}

impl Stream for EventStream {
    type Item = ChannelEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}
