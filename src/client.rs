//! One benchmark client: connect, single publish/subscribe operations that
//! wait for the broker to complete them, and best-effort disconnect.
//!
//! [`Connector`] and [`Session`] are the seam between the driver and the
//! protocol library. [`MqttConnector`] is the rumqttc backed implementation.

use std::{fs, io, time::Duration};

use async_trait::async_trait;
use bytes::Bytes;
use rumqttc::{
    AsyncClient, ConnectReturnCode, ConnectionError, Event, EventLoop, Incoming, MqttOptions,
    Outgoing, QoS, SubscribeReasonCode, Transport,
};
use tokio::time;

use crate::cli::{BenchOptions, Broker};

/// Upper bound on how long a disconnect may spend flushing DISCONNECT
const DISCONNECT_GRACE: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error("IO error = {0:?}")]
    Io(#[from] io::Error),
    #[error("Connection error = {0:?}")]
    Connection(#[from] ConnectionError),
    #[error("Connection refused = {0:?}")]
    Refused(ConnectReturnCode),
    #[error("Wrong packet = {0:?}")]
    WrongPacket(Incoming),
    #[error("Client error = {0:?}")]
    Client(#[from] rumqttc::ClientError),
    #[error("Subscription rejected = {0}")]
    SubscribeRejected(String),
    #[error("Session closed")]
    Closed,
}

/// Opens sessions against the broker of a run.
#[async_trait]
pub trait Connector: Send + Sync {
    type Session: Session;

    /// Connect one client with the given identity and wait for the broker
    /// to accept it.
    async fn connect(&self, id: &str) -> Result<Self::Session, ClientError>;
}

/// A live session, owned by exactly one worker at a time.
#[async_trait]
pub trait Session: Send + 'static {
    fn id(&self) -> &str;

    /// Send one message and wait for its completion at `qos`
    async fn publish(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), ClientError>;

    /// Subscribe to one topic and wait for the SUBACK
    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ClientError>;

    /// Close the session. Never fails, errors are only logged.
    async fn disconnect(&mut self);
}

pub struct MqttConnector {
    broker: Broker,
    keep_alive: Duration,
    max_inflight: u16,
    conn_timeout: u64,
    ca: Option<Vec<u8>>,
}

impl MqttConnector {
    /// Reads the CA file once so that every client shares the same bytes.
    pub fn new(config: &BenchOptions) -> io::Result<MqttConnector> {
        let ca = match &config.ca_file {
            Some(ca_file) => Some(fs::read(ca_file)?),
            None => None,
        };

        Ok(MqttConnector {
            broker: config.broker.clone(),
            keep_alive: config.keep_alive,
            max_inflight: config.max_inflight,
            conn_timeout: config.conn_timeout,
            ca,
        })
    }

    fn options(&self, id: &str) -> MqttOptions {
        let mut options = MqttOptions::new(id, &self.broker.host, self.broker.port);
        options.set_keep_alive(self.keep_alive);
        options.set_inflight(self.max_inflight);
        options.set_clean_session(true);

        if let Some(ca) = &self.ca {
            options.set_transport(Transport::tls(ca.clone(), None, None));
        }

        options
    }
}

#[async_trait]
impl Connector for MqttConnector {
    type Session = MqttSession;

    async fn connect(&self, id: &str) -> Result<MqttSession, ClientError> {
        let (client, mut eventloop) = AsyncClient::new(self.options(id), 10);
        eventloop
            .network_options
            .set_connection_timeout(self.conn_timeout);

        // waiting for connection
        let connack = loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Incoming::ConnAck(connack))) => break connack,
                Ok(Event::Incoming(incoming)) => {
                    let e = ClientError::WrongPacket(incoming);
                    error!("Id = {}, {}", id, e);
                    return Err(e);
                }
                Ok(Event::Outgoing(_)) => continue,
                Err(e) => {
                    error!("Id = {}, Connection error = {:?}", id, e);
                    return Err(match e {
                        ConnectionError::ConnectionRefused(code) => ClientError::Refused(code),
                        ConnectionError::NotConnAck(packet) => ClientError::WrongPacket(packet),
                        e => e.into(),
                    });
                }
            }
        };

        if connack.code != ConnectReturnCode::Success {
            error!("Id = {}, Connection refused = {:?}", id, connack.code);
            return Err(ClientError::Refused(connack.code));
        }

        debug!("Id = {}, connected", id);
        Ok(MqttSession {
            id: id.to_owned(),
            client,
            eventloop: Some(eventloop),
        })
    }
}

pub struct MqttSession {
    id: String,
    client: AsyncClient,
    /// `None` once the connection failed or was closed. rumqttc reconnects
    /// and replays in-flight packets on the next poll after an error, so a
    /// failed event loop is never polled again.
    eventloop: Option<EventLoop>,
}

impl MqttSession {
    /// Drive the event loop until `done` accepts an event. Events that
    /// don't complete the pending operation are skipped.
    async fn poll_until<F>(&mut self, mut done: F) -> Result<(), ClientError>
    where
        F: FnMut(&Event) -> Result<bool, ClientError> + Send,
    {
        let eventloop = self.eventloop.as_mut().ok_or(ClientError::Closed)?;
        loop {
            let event = match eventloop.poll().await {
                Ok(event) => event,
                Err(e) => {
                    self.eventloop = None;
                    return Err(e.into());
                }
            };

            trace!("Id = {}, {:?}", self.id, event);
            if done(&event)? {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl Session for MqttSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn publish(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), ClientError> {
        if self.eventloop.is_none() {
            return Err(ClientError::Closed);
        }
        self.client.publish_bytes(topic, qos, false, payload).await?;

        // packet id rumqttc assigned to this publish. 0 for QoS 0
        let mut sent = None;
        self.poll_until(|event| {
            Ok(match (event, sent) {
                (Event::Outgoing(Outgoing::Publish(pkid)), None) => {
                    sent = Some(*pkid);
                    qos == QoS::AtMostOnce
                }
                (Event::Incoming(Incoming::PubAck(ack)), Some(pkid)) => {
                    qos == QoS::AtLeastOnce && ack.pkid == pkid
                }
                (Event::Incoming(Incoming::PubComp(comp)), Some(pkid)) => {
                    qos == QoS::ExactlyOnce && comp.pkid == pkid
                }
                _ => false,
            })
        })
        .await
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        if self.eventloop.is_none() {
            return Err(ClientError::Closed);
        }
        self.client.subscribe(topic, qos).await?;

        let mut sent = None;
        self.poll_until(|event| match (event, sent) {
            (Event::Outgoing(Outgoing::Subscribe(pkid)), None) => {
                sent = Some(*pkid);
                Ok(false)
            }
            (Event::Incoming(Incoming::SubAck(ack)), Some(pkid)) if ack.pkid == pkid => {
                let rejected = ack
                    .return_codes
                    .iter()
                    .any(|code| matches!(code, SubscribeReasonCode::Failure));
                if rejected {
                    Err(ClientError::SubscribeRejected(topic.to_owned()))
                } else {
                    Ok(true)
                }
            }
            _ => Ok(false),
        })
        .await
    }

    async fn disconnect(&mut self) {
        if self.eventloop.is_none() {
            debug!("Id = {}, already closed", self.id);
            return;
        }

        if let Err(e) = self.client.disconnect().await {
            debug!("Id = {}, disconnect request failed = {:?}", self.id, e);
            return;
        }

        // rumqttc only writes DISCONNECT while the event loop is polled
        let flushed = time::timeout(
            DISCONNECT_GRACE,
            self.poll_until(|event| Ok(matches!(event, Event::Outgoing(Outgoing::Disconnect)))),
        )
        .await;

        match flushed {
            Ok(Ok(())) => debug!("Id = {}, disconnected", self.id),
            Ok(Err(e)) => debug!("Id = {}, disconnect error = {:?}", self.id, e),
            Err(_) => debug!("Id = {}, disconnect timed out", self.id),
        }

        // dropping the event loop closes the socket
        self.eventloop = None;
    }
}
