use anyhow::{anyhow, Context, Result};
use bytes::Bytes;
use rumqttc::{AsyncClient, ConnectReturnCode, Event, Incoming, MqttOptions, Outgoing, QoS};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);
const REQUEST_CHANNEL_CAPACITY: usize = 64;

/// Identifies one handed-off record until the broker confirms it.
pub type DeliveryTag = u64;

/// The transport the publisher drives. Connection attempts are cheap to
/// start; `is_connected` reports whether the broker accepted the session.
///
/// A successful `send` only means the record left this process. It is
/// delivered once its tag comes back from `acknowledged`. Tags still
/// outstanding when the session ends are never confirmed.
pub trait Broker: Send {
    fn connect(&mut self) -> impl Future<Output = Result<()>> + Send;

    fn is_connected(&self) -> bool;

    fn send(
        &mut self,
        topic: &str,
        payload: Bytes,
    ) -> impl Future<Output = Result<DeliveryTag>> + Send;

    /// Tags confirmed since the previous call.
    fn acknowledged(&mut self) -> Vec<DeliveryTag>;
}

#[derive(Debug, Clone)]
pub struct MqttSettings {
    pub host: String,
    pub port: u16,
    pub username: Option<String>,
    pub password: Option<String>,
    pub client_id: String,
    pub keep_alive: Duration,
}

/// Maps QoS 1 packet ids back to delivery tags. The event loop takes
/// publishes off the request channel in order, so each outgoing publish
/// belongs to the oldest tag that has not been given a packet id yet.
#[derive(Debug, Default)]
struct AckTracker {
    unassigned: VecDeque<DeliveryTag>,
    in_flight: HashMap<u16, DeliveryTag>,
    acked: Vec<DeliveryTag>,
}

impl AckTracker {
    fn outgoing(&mut self, pkid: u16) {
        match self.unassigned.pop_front() {
            Some(tag) => {
                self.in_flight.insert(pkid, tag);
            }
            None => tracing::debug!(pkid, "outgoing publish without a pending tag"),
        }
    }

    fn puback(&mut self, pkid: u16) {
        if let Some(tag) = self.in_flight.remove(&pkid) {
            self.acked.push(tag);
        }
    }

    fn withdraw(&mut self, tag: DeliveryTag) {
        self.unassigned.retain(|pending| *pending != tag);
    }
}

type SharedTracker = Arc<Mutex<AckTracker>>;

fn with_tracker<R>(tracker: &SharedTracker, f: impl FnOnce(&mut AckTracker) -> R) -> R {
    let mut guard = tracker.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
    f(&mut guard)
}

pub struct MqttBroker {
    settings: MqttSettings,
    client: Option<AsyncClient>,
    connected: Arc<AtomicBool>,
    tracker: SharedTracker,
    next_tag: DeliveryTag,
    poller: Option<JoinHandle<()>>,
}

impl MqttBroker {
    pub fn new(settings: MqttSettings) -> Self {
        Self {
            settings,
            client: None,
            connected: Arc::new(AtomicBool::new(false)),
            tracker: SharedTracker::default(),
            next_tag: 1,
            poller: None,
        }
    }

    /// Drops the session. The client state holding unconfirmed publishes
    /// goes with it, so their tags are forgotten too.
    fn teardown(&mut self) {
        if let Some(poller) = self.poller.take() {
            poller.abort();
        }
        self.client = None;
        self.connected.store(false, Ordering::SeqCst);
        self.tracker = SharedTracker::default();
    }
}

impl Drop for MqttBroker {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl Broker for MqttBroker {
    async fn connect(&mut self) -> Result<()> {
        self.teardown();
        let (client, eventloop) =
            AsyncClient::new(mqtt_options(&self.settings), REQUEST_CHANNEL_CAPACITY);
        self.poller = Some(spawn_poller(
            eventloop,
            self.connected.clone(),
            self.tracker.clone(),
        ));
        self.client = Some(client);
        tracing::debug!(
            host = %self.settings.host,
            port = self.settings.port,
            "MQTT connection attempt started"
        );
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.is_some() && self.connected.load(Ordering::SeqCst)
    }

    async fn send(&mut self, topic: &str, payload: Bytes) -> Result<DeliveryTag> {
        if !self.is_connected() {
            return Err(anyhow!("MQTT session not established"));
        }
        let client = self
            .client
            .as_ref()
            .ok_or_else(|| anyhow!("MQTT client missing"))?;
        let tag = self.next_tag;
        self.next_tag += 1;
        // Registered before the request is queued so the poller cannot see
        // the outgoing publish first.
        with_tracker(&self.tracker, |tracker| tracker.unassigned.push_back(tag));
        let sent = tokio::time::timeout(
            SEND_TIMEOUT,
            client.publish_bytes(topic, QoS::AtLeastOnce, false, payload),
        )
        .await
        .context("MQTT publish timed out")
        .and_then(|res| res.with_context(|| format!("publish to {topic}")));
        if let Err(err) = sent {
            with_tracker(&self.tracker, |tracker| tracker.withdraw(tag));
            return Err(err);
        }
        Ok(tag)
    }

    fn acknowledged(&mut self) -> Vec<DeliveryTag> {
        with_tracker(&self.tracker, |tracker| std::mem::take(&mut tracker.acked))
    }
}

fn spawn_poller(
    mut eventloop: rumqttc::EventLoop,
    connected: Arc<AtomicBool>,
    tracker: SharedTracker,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(ack))) => {
                    let accepted = ack.code == ConnectReturnCode::Success;
                    if !accepted {
                        tracing::warn!(code = ?ack.code, "MQTT broker refused the session");
                    }
                    connected.store(accepted, Ordering::SeqCst);
                    if !accepted {
                        return;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Publish(pkid))) => {
                    with_tracker(&tracker, |tracker| tracker.outgoing(pkid));
                }
                Ok(Event::Incoming(Incoming::PubAck(ack))) => {
                    with_tracker(&tracker, |tracker| tracker.puback(ack.pkid));
                }
                Ok(Event::Incoming(Incoming::Disconnect)) => {
                    connected.store(false, Ordering::SeqCst);
                    tracing::warn!("MQTT broker sent disconnect");
                    return;
                }
                Ok(_) => {}
                Err(err) => {
                    connected.store(false, Ordering::SeqCst);
                    tracing::warn!(error = %err, "MQTT connection dropped");
                    return;
                }
            }
        }
    })
}

fn mqtt_options(settings: &MqttSettings) -> MqttOptions {
    let mut mqttoptions =
        MqttOptions::new(settings.client_id.clone(), settings.host.clone(), settings.port);
    if let Some(username) = &settings.username {
        mqttoptions.set_credentials(username.clone(), settings.password.clone().unwrap_or_default());
    }
    mqttoptions.set_keep_alive(settings.keep_alive);
    mqttoptions
}

/// A single-connection MQTT listener on 127.0.0.1 speaking just enough of
/// the protocol to accept a session and take one QoS 1 publish.
#[cfg(test)]
pub mod loopback {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::{TcpListener, TcpStream};
    use tokio::task::JoinHandle;

    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum AfterPublish {
        /// Confirm the publish and keep the session open.
        Ack,
        /// Close the socket without confirming.
        Hangup,
    }

    /// Returns the bound port and a handle resolving to the publish payload.
    pub async fn spawn(after: AfterPublish) -> (u16, JoinHandle<Vec<u8>>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let handle = tokio::spawn(async move {
            let (mut stream, _) = listener.accept().await.unwrap();
            let (kind, _) = read_packet(&mut stream).await.unwrap();
            assert_eq!(kind >> 4, 1, "expected CONNECT");
            stream.write_all(&[0x20, 0x02, 0x00, 0x00]).await.unwrap();

            let body = loop {
                let (kind, body) = read_packet(&mut stream).await.unwrap();
                if kind >> 4 == 3 {
                    break body;
                }
            };
            let topic_len = u16::from_be_bytes([body[0], body[1]]) as usize;
            let pkid = [body[2 + topic_len], body[3 + topic_len]];
            let payload = body[4 + topic_len..].to_vec();

            if after == AfterPublish::Ack {
                stream.write_all(&[0x40, 0x02, pkid[0], pkid[1]]).await.unwrap();
                while read_packet(&mut stream).await.is_ok() {}
            }
            payload
        });
        (port, handle)
    }

    async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
        let kind = stream.read_u8().await?;
        let mut len = 0usize;
        let mut shift = 0;
        loop {
            let byte = stream.read_u8().await?;
            len |= ((byte & 0x7f) as usize) << shift;
            if byte & 0x80 == 0 {
                break;
            }
            shift += 7;
        }
        let mut body = vec![0u8; len];
        stream.read_exact(&mut body).await?;
        Ok((kind, body))
    }
}

#[cfg(test)]
mod tests {
    use super::loopback::{self, AfterPublish};
    use super::*;

    fn settings(port: u16) -> MqttSettings {
        MqttSettings {
            host: "127.0.0.1".to_string(),
            port,
            username: None,
            password: None,
            client_id: "field-node-test".to_string(),
            keep_alive: Duration::from_secs(15),
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..300 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 3s");
    }

    #[tokio::test]
    async fn send_without_session_fails_fast() {
        let mut broker = MqttBroker::new(settings(1));
        assert!(!broker.is_connected());
        assert!(broker.send("sensors/sets", Bytes::from_static(b"{}")).await.is_err());

        broker.connect().await.unwrap();
        assert!(!broker.is_connected());
        assert!(broker.send("sensors/sets", Bytes::from_static(b"{}")).await.is_err());
    }

    #[test]
    fn options_use_configured_identity() {
        let options = mqtt_options(&settings(1));
        assert_eq!(options.client_id(), "field-node-test");
        assert_eq!(options.broker_address(), ("127.0.0.1".to_string(), 1));
        assert_eq!(options.keep_alive(), Duration::from_secs(15));
    }

    #[test]
    fn tracker_pairs_packet_ids_with_tags_in_order() {
        let mut tracker = AckTracker::default();
        tracker.unassigned.extend([1, 2, 3]);
        tracker.withdraw(3);
        tracker.outgoing(7);
        tracker.outgoing(8);
        tracker.puback(8);
        tracker.puback(99);
        assert_eq!(tracker.acked, vec![2]);
        assert_eq!(tracker.in_flight.get(&7), Some(&1));
        assert!(tracker.unassigned.is_empty());
    }

    #[tokio::test]
    async fn puback_confirms_the_tag() {
        let (port, server) = loopback::spawn(AfterPublish::Ack).await;
        let mut broker = MqttBroker::new(settings(port));
        broker.connect().await.unwrap();
        eventually(|| broker.is_connected()).await;

        let tag = broker
            .send("sensors/sets", Bytes::from_static(b"{\"n\":1}"))
            .await
            .unwrap();
        let mut confirmed = Vec::new();
        eventually(|| {
            confirmed.extend(broker.acknowledged());
            confirmed.contains(&tag)
        })
        .await;
        assert!(broker.is_connected());

        drop(broker);
        assert_eq!(server.await.unwrap(), b"{\"n\":1}".to_vec());
    }

    #[tokio::test]
    async fn hangup_before_puback_never_confirms() {
        let (port, server) = loopback::spawn(AfterPublish::Hangup).await;
        let mut broker = MqttBroker::new(settings(port));
        broker.connect().await.unwrap();
        eventually(|| broker.is_connected()).await;

        broker
            .send("sensors/sets", Bytes::from_static(b"{}"))
            .await
            .unwrap();
        server.await.unwrap();
        eventually(|| !broker.is_connected()).await;
        assert!(broker.acknowledged().is_empty());
    }
}
