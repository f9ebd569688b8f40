//! MQTT session over rumqttc
//!
//! Each connect builds a fresh client and event loop authenticated with the
//! current credential. The event loop task never reconnects on its own: when
//! the link drops it marks the session dead and exits, leaving retry policy to
//! the connection supervisor.

use super::connection::{configure_mqtt_options, TopicBuilder};
use super::message_handler::{EventRoute, MessageCallback, MessageHandler};
use crate::config::BrokerSettings;
use crate::credential::{Credential, DeviceIdentity};
use crate::error::{ConnectError, PublishError};
use crate::session_span;
use crate::transport::TransportSession;
use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{AsyncClient, EventLoop, QoS};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;
use tokio::sync::{oneshot, Mutex, Notify};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn, Instrument};

/// Request channel capacity between the client handle and the event loop
const REQUEST_CHANNEL_CAPACITY: usize = 10;

/// Liveness of one link, written by its event loop task
#[derive(Debug)]
struct LinkHealth {
    created: Instant,
    alive: AtomicBool,
    last_seen_ms: AtomicU64,
    died: Notify,
}

impl LinkHealth {
    fn new() -> Self {
        Self {
            created: Instant::now(),
            alive: AtomicBool::new(false),
            last_seen_ms: AtomicU64::new(0),
            died: Notify::new(),
        }
    }

    fn touch(&self) {
        let elapsed = self.created.elapsed().as_millis() as u64;
        self.last_seen_ms.store(elapsed, Ordering::Relaxed);
    }

    fn mark_alive(&self) {
        self.touch();
        self.alive.store(true, Ordering::Release);
    }

    fn mark_dead(&self) {
        self.alive.store(false, Ordering::Release);
        self.died.notify_waiters();
    }

    /// Resolves once the link is marked dead
    async fn dead(&self) {
        let died = self.died.notified();
        tokio::pin!(died);
        died.as_mut().enable();
        if !self.alive.load(Ordering::Acquire) {
            return;
        }
        died.await;
    }

    /// Alive and heard from the broker within `max_silence`
    fn is_alive(&self, max_silence: Duration) -> bool {
        if !self.alive.load(Ordering::Acquire) {
            return false;
        }
        let last_seen = Duration::from_millis(self.last_seen_ms.load(Ordering::Relaxed));
        self.created.elapsed().saturating_sub(last_seen) <= max_silence
    }
}

struct Link {
    client: AsyncClient,
    event_task: JoinHandle<()>,
    topics: TopicBuilder,
}

/// [`TransportSession`] backed by an MQTT 3.1.1 connection
pub struct MqttSession {
    settings: BrokerSettings,
    on_message: Option<MessageCallback>,
    link: Mutex<Option<Link>>,
    health: StdMutex<Option<Arc<LinkHealth>>>,
}

impl MqttSession {
    pub fn new(settings: BrokerSettings) -> Self {
        Self {
            settings,
            on_message: None,
            link: Mutex::new(None),
            health: StdMutex::new(None),
        }
    }

    /// Deliver inbound config and command messages to `callback`
    pub fn with_message_callback(mut self, callback: MessageCallback) -> Self {
        self.on_message = Some(callback);
        self
    }

    pub fn settings(&self) -> &BrokerSettings {
        &self.settings
    }

    /// Longest silence tolerated before the link counts as dead
    fn max_silence(&self) -> Duration {
        self.settings.keep_alive * 2
    }

    fn replace_health(&self, health: Option<Arc<LinkHealth>>) {
        if let Ok(mut current) = self.health.lock() {
            if let Some(previous) = current.take() {
                previous.mark_dead();
            }
            *current = health;
        }
    }

    async fn subscribe_all(client: &AsyncClient, topics: &TopicBuilder) -> Result<(), ConnectError> {
        for (topic, qos) in topics.subscriptions() {
            debug!("Subscribing to {} ({:?})", topic, qos);
            client
                .subscribe(topic, qos)
                .await
                .map_err(|e| ConnectError::Transport(format!("subscribe failed: {e}")))?;
        }
        Ok(())
    }
}

#[async_trait]
impl TransportSession for MqttSession {
    async fn connect(
        &self,
        identity: &DeviceIdentity,
        credential: &Credential,
    ) -> Result<(), ConnectError> {
        self.disconnect().await;

        let client_id = identity.client_id();
        info!(
            "Connecting to {}:{} as {}",
            self.settings.host, self.settings.port, client_id
        );

        let options = configure_mqtt_options(identity, credential, &self.settings);
        let (client, event_loop) = AsyncClient::new(options, REQUEST_CHANNEL_CAPACITY);
        let topics = TopicBuilder::new(&identity.device_id);
        let health = Arc::new(LinkHealth::new());
        let (ack_tx, ack_rx) = oneshot::channel();

        let event_task = tokio::spawn(
            drive_event_loop(
                event_loop,
                Arc::clone(&health),
                ack_tx,
                topics.clone(),
                self.on_message.clone(),
            )
            .instrument(session_span!(client_id = %client_id)),
        );

        // Stored before the ack so a cancelled connect is still torn down
        *self.link.lock().await = Some(Link {
            client: client.clone(),
            event_task,
            topics: topics.clone(),
        });
        self.replace_health(Some(health));

        let connect_timeout = self.settings.connect_timeout;
        let acknowledged = match tokio::time::timeout(connect_timeout, ack_rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectError::Transport(
                "event loop exited before acknowledgement".to_string(),
            )),
            Err(_) => Err(ConnectError::Timeout(connect_timeout)),
        };

        if let Err(e) = acknowledged {
            self.disconnect().await;
            return Err(e);
        }

        if let Err(e) = Self::subscribe_all(&client, &topics).await {
            self.disconnect().await;
            return Err(e);
        }

        info!("MQTT session established");
        Ok(())
    }

    async fn publish(&self, topic: Option<&str>, payload: Bytes) -> Result<(), PublishError> {
        if !self.is_alive() {
            return Err(PublishError::NotConnected);
        }

        let (client, topic) = {
            let link = self.link.lock().await;
            match link.as_ref() {
                Some(link) => (link.client.clone(), link.topics.events(topic)),
                None => return Err(PublishError::NotConnected),
            }
        };

        let operation_timeout = self.settings.operation_timeout;
        match tokio::time::timeout(
            operation_timeout,
            client.publish_bytes(topic, QoS::AtMostOnce, false, payload),
        )
        .await
        {
            Ok(Ok(())) => Ok(()),
            Ok(Err(e)) => Err(PublishError::Transport(e.to_string())),
            Err(_) => Err(PublishError::Timeout(operation_timeout)),
        }
    }

    fn is_alive(&self) -> bool {
        let max_silence = self.max_silence();
        self.health
            .lock()
            .map(|health| {
                health
                    .as_ref()
                    .is_some_and(|health| health.is_alive(max_silence))
            })
            .unwrap_or(false)
    }

    async fn link_lost(&self) {
        let health = self
            .health
            .lock()
            .ok()
            .and_then(|health| health.as_ref().map(Arc::clone));
        if let Some(health) = health {
            health.dead().await;
        }
    }

    async fn disconnect(&self) {
        let link = self.link.lock().await.take();
        self.replace_health(None);

        let Some(mut link) = link else {
            return;
        };

        // Best effort: let the event loop flush DISCONNECT before aborting it
        let operation_timeout = self.settings.operation_timeout;
        if tokio::time::timeout(operation_timeout, link.client.disconnect())
            .await
            .is_ok()
        {
            let _ = tokio::time::timeout(operation_timeout, &mut link.event_task).await;
        }
        link.event_task.abort();
        debug!("MQTT session released");
    }
}

/// Poll one event loop until the link ends
async fn drive_event_loop(
    mut event_loop: EventLoop,
    health: Arc<LinkHealth>,
    ack_tx: oneshot::Sender<Result<(), ConnectError>>,
    topics: TopicBuilder,
    on_message: Option<MessageCallback>,
) {
    let mut ack_tx = Some(ack_tx);

    loop {
        match event_loop.poll().await {
            Ok(event) => {
                health.touch();
                match MessageHandler::route_event(&event) {
                    EventRoute::ConnectionAccepted => {
                        health.mark_alive();
                        if let Some(tx) = ack_tx.take() {
                            let _ = tx.send(Ok(()));
                        }
                    }
                    EventRoute::ConnectionRefused(reason) => {
                        health.mark_dead();
                        if let Some(tx) = ack_tx.take() {
                            let _ = tx.send(Err(ConnectError::Refused(reason)));
                        }
                        break;
                    }
                    EventRoute::MessageReceived { topic, payload } => {
                        MessageHandler::dispatch(&topics, on_message.as_ref(), &topic, &payload);
                    }
                    EventRoute::Disconnected => {
                        debug!("Disconnect observed on event loop");
                        health.mark_dead();
                        break;
                    }
                    EventRoute::Activity => {}
                }
            }
            Err(e) => {
                health.mark_dead();
                let error = match MessageHandler::classify_error(&e) {
                    EventRoute::ConnectionRefused(reason) => ConnectError::Refused(reason),
                    _ => ConnectError::Transport(e.to_string()),
                };
                match ack_tx.take() {
                    Some(tx) => {
                        let _ = tx.send(Err(error));
                    }
                    None => warn!("MQTT link lost: {}", e),
                }
                break;
            }
        }
    }

    debug!("MQTT event loop stopped");
}
