//! Driver tests against an in-process client that records every call.

use std::collections::{HashMap, HashSet};
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use mqtt_bench::bench::{run, BenchError};
use mqtt_bench::cli::{Action, BenchOptions};
use mqtt_bench::client::{ClientError, Connector, Session};
use rumqttc::QoS;

#[derive(Debug, Clone, PartialEq)]
enum Call {
    Publish { topic: String, qos: QoS, payload: Bytes },
    Subscribe { topic: String, qos: QoS },
}

#[derive(Default)]
struct Journal {
    connects: Vec<String>,
    calls: HashMap<String, Vec<Call>>,
    disconnects: Vec<String>,
}

#[derive(Clone, Default)]
struct SharedJournal(Arc<Mutex<Journal>>);

impl SharedJournal {
    fn connects(&self) -> Vec<String> {
        self.0.lock().unwrap().connects.clone()
    }

    fn calls(&self, id: &str) -> Vec<Call> {
        self.0.lock().unwrap().calls.get(id).cloned().unwrap_or_default()
    }

    fn total_calls(&self) -> usize {
        self.0.lock().unwrap().calls.values().map(Vec::len).sum()
    }

    fn disconnects(&self) -> Vec<String> {
        let mut disconnects = self.0.lock().unwrap().disconnects.clone();
        disconnects.sort();
        disconnects
    }
}

#[derive(Default)]
struct MockConnector {
    journal: SharedJournal,
    /// index of the connect attempt that gets refused
    refuse_at: Option<usize>,
    /// clients whose every operation fails
    failing: HashSet<String>,
    op_delay: Duration,
}

#[async_trait]
impl Connector for MockConnector {
    type Session = MockSession;

    async fn connect(&self, id: &str) -> Result<MockSession, ClientError> {
        let attempt = {
            let mut journal = self.journal.0.lock().unwrap();
            journal.connects.push(id.to_owned());
            journal.connects.len() - 1
        };

        if self.refuse_at == Some(attempt) {
            return Err(io::Error::new(io::ErrorKind::ConnectionRefused, "broker down").into());
        }

        Ok(MockSession {
            id: id.to_owned(),
            journal: self.journal.clone(),
            failing: self.failing.contains(id),
            op_delay: self.op_delay,
        })
    }
}

struct MockSession {
    id: String,
    journal: SharedJournal,
    failing: bool,
    op_delay: Duration,
}

impl MockSession {
    async fn record(&mut self, call: Call) {
        if !self.op_delay.is_zero() {
            tokio::time::sleep(self.op_delay).await;
        }

        let mut journal = self.journal.0.lock().unwrap();
        journal.calls.entry(self.id.clone()).or_default().push(call);
    }
}

#[async_trait]
impl Session for MockSession {
    fn id(&self) -> &str {
        &self.id
    }

    async fn publish(&mut self, topic: &str, qos: QoS, payload: Bytes) -> Result<(), ClientError> {
        let topic = topic.to_owned();
        self.record(Call::Publish { topic, qos, payload }).await;
        if self.failing {
            return Err(io::Error::new(io::ErrorKind::BrokenPipe, "publish lost").into());
        }
        Ok(())
    }

    async fn subscribe(&mut self, topic: &str, qos: QoS) -> Result<(), ClientError> {
        self.record(Call::Subscribe {
            topic: topic.to_owned(),
            qos,
        })
        .await;
        if self.failing {
            return Err(ClientError::SubscribeRejected(topic.to_owned()));
        }
        Ok(())
    }

    async fn disconnect(&mut self) {
        let mut journal = self.journal.0.lock().unwrap();
        journal.disconnects.push(self.id.clone());
    }
}

fn options(clients: usize, count: usize, size: usize, qos: QoS) -> BenchOptions {
    BenchOptions {
        broker: "tcp://localhost:1883".parse().unwrap(),
        clients,
        count,
        size,
        qos,
        keep_alive: Duration::from_secs(10),
        max_inflight: 100,
        conn_timeout: 10,
        settle: Duration::ZERO,
        ca_file: None,
    }
}

fn ids(range: std::ops::Range<usize>) -> Vec<String> {
    range.map(|i| format!("mqtt-bench-{i:05}")).collect()
}

#[tokio::test]
async fn publish_run_attempts_every_operation() {
    let connector = MockConnector {
        op_delay: Duration::from_millis(1),
        ..Default::default()
    };
    let options = options(2, 5, 0, QoS::AtMostOnce);

    let result = run(&connector, Action::Publish, &options).await.unwrap();

    assert_eq!(result.total(), 10);
    assert_eq!(result.failures, 0);
    assert_eq!(connector.journal.total_calls(), 10);
    for id in ids(0..2) {
        assert_eq!(connector.journal.calls(&id).len(), 5);
    }

    assert!(result.elapsed > Duration::ZERO);
    let expected = 10.0 / result.elapsed.as_secs_f64();
    assert!((result.throughput() - expected).abs() < 1e-9);
    assert_eq!(connector.journal.disconnects(), ids(0..2));
}

#[tokio::test]
async fn workers_run_their_iterations_in_order() {
    let connector = MockConnector::default();
    let options = options(3, 4, 13, QoS::ExactlyOnce);

    run(&connector, Action::Publish, &options).await.unwrap();

    for (index, id) in ids(0..3).iter().enumerate() {
        let expected: Vec<_> = (0..4)
            .map(|iteration| Call::Publish {
                topic: format!("/mqtt-bench/benchmark/{index}/{iteration}"),
                qos: QoS::ExactlyOnce,
                payload: Bytes::from_static(b"0123456789012"),
            })
            .collect();
        assert_eq!(connector.journal.calls(id), expected);
    }
}

#[tokio::test]
async fn subscribe_run_uses_disjoint_topics() {
    let connector = MockConnector::default();
    let options = options(4, 6, 1024, QoS::AtLeastOnce);

    let result = run(&connector, Action::Subscribe, &options).await.unwrap();
    assert_eq!(result.total(), 24);

    let mut topics = HashSet::new();
    for id in ids(0..4) {
        for call in connector.journal.calls(&id) {
            match call {
                Call::Subscribe { topic, qos } => {
                    assert_eq!(qos, QoS::AtLeastOnce);
                    assert!(topics.insert(topic));
                }
                call => panic!("unexpected call {call:?}"),
            }
        }
    }
    assert_eq!(topics.len(), 24);
}

#[tokio::test]
async fn refused_connect_aborts_and_cleans_up() {
    let connector = MockConnector {
        refuse_at: Some(3),
        ..Default::default()
    };
    let options = options(5, 10, 16, QoS::AtMostOnce);

    let err = run(&connector, Action::Publish, &options).await.unwrap_err();

    match err {
        BenchError::Connect { id, source } => {
            assert_eq!(id, "mqtt-bench-00003");
            assert!(matches!(source, ClientError::Io(_)));
        }
        err => panic!("unexpected error {err:?}"),
    }

    // no client past the failed one is attempted
    assert_eq!(connector.journal.connects(), ids(0..4));
    assert_eq!(connector.journal.total_calls(), 0);
    assert_eq!(connector.journal.disconnects(), ids(0..3));
}

#[tokio::test]
async fn refused_first_connect_has_nothing_to_disconnect() {
    let connector = MockConnector {
        refuse_at: Some(0),
        ..Default::default()
    };
    let options = options(3, 10, 16, QoS::AtMostOnce);

    assert!(run(&connector, Action::Subscribe, &options).await.is_err());
    assert_eq!(connector.journal.total_calls(), 0);
    assert!(connector.journal.disconnects().is_empty());
}

#[tokio::test]
async fn failed_operations_still_count() {
    let connector = MockConnector {
        failing: ids(0..1).into_iter().collect(),
        ..Default::default()
    };
    let options = options(2, 5, 8, QoS::AtLeastOnce);

    let result = run(&connector, Action::Publish, &options).await.unwrap();

    assert_eq!(result.total(), 10);
    assert_eq!(result.failures, 5);
    // the failing client kept going, and so did its sibling
    assert_eq!(connector.journal.calls("mqtt-bench-00000").len(), 5);
    assert_eq!(connector.journal.calls("mqtt-bench-00001").len(), 5);
    assert_eq!(connector.journal.disconnects(), ids(0..2));
}

#[tokio::test]
async fn failed_subscribes_still_count() {
    let connector = MockConnector {
        failing: ids(0..3).into_iter().collect(),
        ..Default::default()
    };
    let options = options(3, 2, 0, QoS::AtMostOnce);

    let result = run(&connector, Action::Subscribe, &options).await.unwrap();

    assert_eq!(result.total(), 6);
    assert_eq!(result.failures, 6);
    assert_eq!(connector.journal.total_calls(), 6);
    assert_eq!(connector.journal.disconnects(), ids(0..3));
}

#[tokio::test]
async fn settle_delay_is_outside_the_timed_window() {
    let connector = MockConnector::default();
    let mut options = options(2, 3, 0, QoS::AtMostOnce);
    options.settle = Duration::from_millis(300);

    let started = std::time::Instant::now();
    let result = run(&connector, Action::Publish, &options).await.unwrap();

    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(result.elapsed < Duration::from_millis(300));
}
