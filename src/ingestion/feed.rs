use super::{FeedConfig, Ingestor};
use crate::exchange::{ExchangeAdapter, FeedEvent, FeedKind};
use crate::registry::Registries;
use futures_util::{Sink, SinkExt, StreamExt};
use rand::Rng;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio::time::{sleep, Duration, MissedTickBehavior};
use tokio_tungstenite::{connect_async, tungstenite::Message};

/// Single-slot restart request for one feed
#[derive(Clone)]
pub struct RestartHandle {
    feed: FeedKind,
    tx: mpsc::Sender<()>,
}

impl RestartHandle {
    /// Returns `false` when a restart is already pending
    pub fn request(&self) -> bool {
        match self.tx.try_send(()) {
            Ok(()) => true,
            Err(_) => {
                tracing::debug!(feed = %self.feed, "Restart already pending");
                false
            }
        }
    }

    pub fn feed(&self) -> FeedKind {
        self.feed
    }
}

enum SessionEnd {
    /// External restart request, resubscribe right away
    Restart,
    /// No subscription, wait for a restart request
    Idle,
    /// Connection or decode failure, back off first
    Failed,
    /// Every restart handle dropped, stop the task
    Shutdown,
}

async fn close_quietly<S>(feed: FeedKind, write: &mut S)
where
    S: Sink<Message> + Unpin,
    S::Error: std::fmt::Display,
{
    if let Err(e) = write.close().await {
        tracing::debug!(feed = %feed, error = %e, "Close handshake failed");
    }
}

/// Long-lived stream consumer for one feed kind of one exchange
pub struct FeedTask {
    feed: FeedKind,
    adapter: Arc<dyn ExchangeAdapter>,
    ingestor: Ingestor,
    registries: Registries,
    restart_rx: mpsc::Receiver<()>,
    backoff: Duration,
    jitter_secs: u64,
}

impl FeedTask {
    pub fn new(
        feed: FeedKind,
        adapter: Arc<dyn ExchangeAdapter>,
        ingestor: Ingestor,
        registries: Registries,
        config: &FeedConfig,
    ) -> (Self, RestartHandle) {
        let (tx, restart_rx) = mpsc::channel(1);
        let restart = RestartHandle { feed, tx };

        let task = Self {
            feed,
            adapter,
            ingestor,
            registries,
            restart_rx,
            backoff: Duration::from_secs(config.reconnect_backoff_secs),
            jitter_secs: config.reconnect_jitter_secs,
        };

        (task, restart)
    }

    fn enabled_pairs(&self) -> Vec<String> {
        self.registries
            .enabled_markets(self.adapter.name())
            .into_iter()
            .map(|m| m.pair)
            .collect()
    }

    /// Fixed backoff plus random jitter; a restart request cuts it short
    ///
    /// Returns `false` once every restart handle is gone.
    async fn back_off(&mut self) -> bool {
        let jitter_ms = if self.jitter_secs > 0 {
            rand::thread_rng().gen_range(0..=self.jitter_secs * 1000)
        } else {
            0
        };
        let delay = self.backoff + Duration::from_millis(jitter_ms);

        tracing::warn!(feed = %self.feed, "Reconnecting in {:.1}s", delay.as_secs_f64());
        tokio::select! {
            _ = sleep(delay) => true,
            restart = self.restart_rx.recv() => restart.is_some(),
        }
    }

    pub async fn run(mut self) {
        let exchange = self.adapter.name().to_string();
        tracing::info!(feed = %self.feed, exchange = %exchange, "Feed task started");

        loop {
            let pairs = self.enabled_pairs();

            let end = match self.adapter.stream_url(self.feed, &pairs).await {
                Ok(Some(url)) => self.session(&url).await,
                Ok(None) => {
                    tracing::info!(feed = %self.feed, exchange = %exchange, "Nothing to subscribe, idling");
                    SessionEnd::Idle
                }
                Err(e) => {
                    tracing::error!(feed = %self.feed, error = %e, "Failed to build stream URL");
                    SessionEnd::Failed
                }
            };

            let keep_running = match end {
                SessionEnd::Restart => true,
                SessionEnd::Failed => self.back_off().await,
                SessionEnd::Idle => self.restart_rx.recv().await.is_some(),
                SessionEnd::Shutdown => false,
            };
            if !keep_running {
                break;
            }
        }

        tracing::info!(feed = %self.feed, exchange = %exchange, "Feed task stopped");
    }

    async fn session(&mut self, url: &str) -> SessionEnd {
        let (ws, _) = match connect_async(url).await {
            Ok(conn) => conn,
            Err(e) => {
                tracing::error!(feed = %self.feed, error = %e, "WebSocket connect failed");
                return SessionEnd::Failed;
            }
        };

        tracing::info!(feed = %self.feed, "📡 Connected to {}", self.adapter.name());
        let (mut write, mut read) = ws.split();

        loop {
            tokio::select! {
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => match self.adapter.decode(self.feed, &text) {
                        Ok(events) => {
                            for event in events {
                                if event == FeedEvent::StreamExpired {
                                    tracing::warn!(feed = %self.feed, "Stream credentials expired, resubscribing");
                                    close_quietly(self.feed, &mut write).await;
                                    return SessionEnd::Restart;
                                }
                                self.ingestor.apply(event);
                            }
                        }
                        Err(e) => {
                            tracing::error!(feed = %self.feed, error = %e, "Failed to decode message");
                            return SessionEnd::Failed;
                        }
                    },
                    Some(Ok(Message::Ping(payload))) => {
                        if let Err(e) = write.send(Message::Pong(payload)).await {
                            tracing::error!(feed = %self.feed, error = %e, "Failed to answer ping");
                            return SessionEnd::Failed;
                        }
                    }
                    Some(Ok(Message::Close(frame))) => {
                        tracing::warn!(feed = %self.feed, ?frame, "Stream closed by server");
                        return SessionEnd::Failed;
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::error!(feed = %self.feed, error = %e, "WebSocket error");
                        return SessionEnd::Failed;
                    }
                    None => {
                        tracing::warn!(feed = %self.feed, "Stream ended");
                        return SessionEnd::Failed;
                    }
                },
                restart = self.restart_rx.recv() => {
                    close_quietly(self.feed, &mut write).await;
                    return match restart {
                        Some(()) => {
                            tracing::info!(feed = %self.feed, "Restarting subscription");
                            SessionEnd::Restart
                        }
                        None => SessionEnd::Shutdown,
                    };
                }
            }
        }
    }
}

/// Periodically refresh the account stream credentials
///
/// A failed refresh restarts the account feed so it subscribes with fresh ones.
pub async fn keep_alive_loop(adapter: Arc<dyn ExchangeAdapter>, account: RestartHandle, every: Duration) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    // First tick fires immediately
    ticker.tick().await;

    loop {
        ticker.tick().await;
        if let Err(e) = adapter.keep_alive().await {
            tracing::warn!(exchange = adapter.name(), error = %e, "Keep-alive failed, resubscribing");
            account.request();
        }
    }
}
