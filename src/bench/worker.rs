use bytes::Bytes;
use rumqttc::QoS;

use crate::{
    client::Session,
    common::{topic, OpStats},
};

/// What every iteration of a worker does
#[derive(Debug, Clone)]
pub(crate) enum Operation {
    Publish(Bytes),
    Subscribe,
}

pub(crate) struct Worker<S> {
    index: usize,
    session: S,
    operation: Operation,
    qos: QoS,
    count: usize,
}

impl<S: Session> Worker<S> {
    pub(crate) fn new(index: usize, session: S, operation: Operation, qos: QoS, count: usize) -> Self {
        Worker {
            index,
            session,
            operation,
            qos,
            count,
        }
    }

    /// Runs `count` operations back to back. A failed operation is logged and
    /// counted, the loop moves on. Hands the session back for disconnection.
    pub(crate) async fn start(mut self) -> (S, OpStats) {
        let mut stats = OpStats::default();

        for iteration in 0..self.count {
            let topic = topic(self.index, iteration);
            let outcome = match &self.operation {
                Operation::Publish(payload) => {
                    self.session.publish(&topic, self.qos, payload.clone()).await
                }
                Operation::Subscribe => self.session.subscribe(&topic, self.qos).await,
            };

            stats.attempts += 1;
            if let Err(e) = outcome {
                stats.failures += 1;
                let kind = match self.operation {
                    Operation::Publish(_) => "Publish",
                    Operation::Subscribe => "Subscribe",
                };
                error!("Id = {}, {} error: {}", self.session.id(), kind, e);
            }
        }

        debug!(
            "Id = {}, done. attempts = {}, failures = {}",
            self.session.id(),
            stats.attempts,
            stats.failures
        );
        (self.session, stats)
    }
}
