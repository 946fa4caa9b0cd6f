use std::{fmt, io, time::Duration};

use futures::future::join_all;
use indicatif::ProgressBar;
use serde::Serialize;
use tokio::{
    task::JoinSet,
    time::{self, Instant},
};

use crate::{
    cli::{Action, BenchOptions},
    client::{ClientError, Connector, MqttConnector, Session},
    common::{client_id, fixed_size_message, OpStats, PROGRESS_STYLE},
};

mod worker;

use worker::{Operation, Worker};

#[derive(thiserror::Error, Debug)]
pub enum BenchError {
    #[error("Connected error: Id = {id}, {source}")]
    Connect {
        id: String,
        #[source]
        source: ClientError,
    },
    #[error("IO error = {0:?}")]
    Io(#[from] io::Error),
}

#[tokio::main(flavor = "multi_thread")]
pub async fn start(action: Action, options: BenchOptions) -> Result<RunResult, BenchError> {
    let connector = MqttConnector::new(&options)?;
    run(&connector, action, &options).await
}

/// One full benchmark: connect every client, let the sessions settle, run one
/// worker per client inside the timed window, then disconnect everyone.
///
/// A single failed connect aborts the run before anything is timed. Sessions
/// connected up to that point are disconnected first.
pub async fn run<C: Connector>(
    connector: &C,
    action: Action,
    options: &BenchOptions,
) -> Result<RunResult, BenchError> {
    let operation = match action {
        Action::Publish => Operation::Publish(fixed_size_message(options.size)),
        Action::Subscribe => Operation::Subscribe,
    };

    info!(
        "Connecting {} clients to {}",
        options.clients, options.broker
    );
    let sessions = connect_all(connector, options.clients).await?;

    if !options.settle.is_zero() {
        debug!("Settling for {:?}", options.settle);
        time::sleep(options.settle).await;
    }

    info!("{} started: {} x {}", action, options.clients, options.count);
    let test_start_time = Instant::now();

    let mut handles = JoinSet::new();
    for (index, session) in sessions.into_iter().enumerate() {
        let worker = Worker::new(
            index,
            session,
            operation.clone(),
            options.qos,
            options.count,
        );
        handles.spawn(worker.start());
    }

    let mut sessions = Vec::with_capacity(options.clients);
    let mut aggregate_stats = OpStats::default();
    while let Some(joined) = handles.join_next().await {
        match joined {
            Ok((session, stats)) => {
                aggregate_stats += stats;
                sessions.push(session);
            }
            // the session was dropped with the task, which closes its socket
            Err(e) => error!("Worker task failed = {:?}", e),
        }
    }

    let elapsed = test_start_time.elapsed();
    info!("{} finished in {:?}", action, elapsed);

    disconnect_all(sessions).await;

    if aggregate_stats.failures > 0 {
        warn!(
            "{} of {} operations failed",
            aggregate_stats.failures, aggregate_stats.attempts
        );
    }

    Ok(RunResult {
        action,
        broker: options.broker.uri.clone(),
        clients: options.clients,
        count: options.count,
        elapsed,
        failures: aggregate_stats.failures,
    })
}

async fn connect_all<C: Connector>(
    connector: &C,
    clients: usize,
) -> Result<Vec<C::Session>, BenchError> {
    let bar = ProgressBar::new(clients as u64)
        .with_prefix("Clients Connected:")
        .with_style((*PROGRESS_STYLE).clone());
    bar.enable_steady_tick(Duration::from_secs_f64(0.1));

    let mut sessions = Vec::with_capacity(clients);
    for index in 0..clients {
        let id = client_id(index);
        bar.set_message(format!("connecting {id}"));

        match connector.connect(&id).await {
            Ok(session) => {
                sessions.push(session);
                bar.inc(1);
            }
            Err(source) => {
                bar.abandon_with_message(format!("{id} failed"));
                warn!(
                    "Aborting run, disconnecting {} connected clients",
                    sessions.len()
                );
                disconnect_all(sessions).await;
                return Err(BenchError::Connect { id, source });
            }
        }
    }

    bar.finish_with_message("Done!");
    Ok(sessions)
}

/// Best effort, errors are swallowed by [`Session::disconnect`]
async fn disconnect_all<S: Session>(sessions: Vec<S>) {
    join_all(sessions.into_iter().map(|mut session| async move {
        session.disconnect().await;
    }))
    .await;
}

/// Outcome of a completed run. The operation total counts attempts, failed
/// operations included.
#[derive(Debug, Clone)]
pub struct RunResult {
    pub action: Action,
    pub broker: String,
    pub clients: usize,
    pub count: usize,
    pub elapsed: Duration,
    pub failures: u64,
}

impl RunResult {
    pub fn total(&self) -> usize {
        self.clients * self.count
    }

    /// messages/sec
    pub fn throughput(&self) -> f64 {
        self.total() as f64 / self.elapsed.as_secs_f64()
    }

    pub fn summary(&self) -> Summary<'_> {
        Summary {
            action: self.action,
            broker: &self.broker,
            clients: self.clients,
            count: self.count,
            total: self.total(),
            duration_ms: self.elapsed.as_millis() as u64,
            throughput: self.throughput(),
            failures: self.failures,
        }
    }
}

impl fmt::Display for RunResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} result : broker={}, clients={}, count={}, duration={}ms, throughput={:.2}messages/sec",
            self.action,
            self.broker,
            self.clients,
            self.count,
            self.elapsed.as_millis(),
            self.throughput()
        )
    }
}

/// Machine readable form of [`RunResult`]
#[derive(Debug, Serialize)]
pub struct Summary<'a> {
    pub action: Action,
    pub broker: &'a str,
    pub clients: usize,
    pub count: usize,
    pub total: usize,
    pub duration_ms: u64,
    pub throughput: f64,
    pub failures: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(action: Action, elapsed: Duration) -> RunResult {
        RunResult {
            action,
            broker: "tcp://localhost:1883".to_owned(),
            clients: 2,
            count: 5,
            elapsed,
            failures: 0,
        }
    }

    #[test]
    fn summary_line() {
        let result = sample(Action::Publish, Duration::from_millis(2000));
        assert_eq!(result.total(), 10);
        assert_eq!(
            result.to_string(),
            "Publish result : broker=tcp://localhost:1883, clients=2, count=5, duration=2000ms, throughput=5.00messages/sec"
        );

        let result = sample(Action::Subscribe, Duration::from_micros(1500));
        assert!(result.to_string().starts_with("Subscribe result : "));
        assert!(result.to_string().ends_with("duration=1ms, throughput=6666.67messages/sec"));
    }

    #[test]
    fn throughput_uses_sub_millisecond_time() {
        let result = sample(Action::Publish, Duration::from_micros(500));
        assert!((result.throughput() - 20_000.0).abs() < 1e-6);
    }

    #[test]
    fn json_summary() {
        let mut result = sample(Action::Subscribe, Duration::from_millis(250));
        result.failures = 3;

        let json = serde_json::to_value(result.summary()).unwrap();
        assert_eq!(json["action"], "subscribe");
        assert_eq!(json["broker"], "tcp://localhost:1883");
        assert_eq!(json["total"], 10);
        assert_eq!(json["duration_ms"], 250);
        assert_eq!(json["throughput"], 40.0);
        assert_eq!(json["failures"], 3);
    }
}
