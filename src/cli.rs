use std::ffi::OsString;
use std::fmt::{self, Display};
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use clap::Parser;
use rumqttc::QoS;
use serde::Serialize;

use crate::common::get_qos;

pub const BROKER_PLACEHOLDER: &str = "tcp://{host}:{port}";
pub const ACTION_PLACEHOLDER: &str = "p/pub/publish or s/sub/subscribe";

#[derive(Debug, Parser)]
#[command(
    name = "mqtt-bench",
    about = "Spawns concurrent mqtt clients that publish or subscribe a fixed number of times and reports throughput.",
    version
)]
pub struct Cli {
    /// URI of MQTT broker (required)
    #[arg(long, default_value = BROKER_PLACEHOLDER, value_name = "URI")]
    pub broker: String,

    /// Publish or Subscribe (required)
    #[arg(long, default_value = ACTION_PLACEHOLDER)]
    pub action: String,

    /// Number of clients
    #[arg(long, default_value = "10", allow_negative_numbers = true, value_name = "NUM")]
    pub clients: i64,

    /// Number of loops
    #[arg(long, default_value = "100", allow_negative_numbers = true, value_name = "NUM")]
    pub count: i64,

    /// Message size per publish (byte)
    #[arg(long, default_value = "1024", allow_negative_numbers = true, value_name = "BYTES")]
    pub size: i64,

    /// MQTT QoS(0/1/2)
    #[arg(long, default_value = "0", allow_negative_numbers = true, value_name = "QoS")]
    pub qos: i64,

    /// Keep alive interval (seconds)
    #[arg(long, default_value = "10")]
    pub keep_alive: u64,

    #[arg(long, default_value = "100")]
    pub max_inflight: u16,

    /// Connection timeout (seconds, at least 1)
    #[arg(long, default_value = "10")]
    pub conn_timeout: u64,

    /// Seconds to let sessions settle between connecting and starting the timer.
    /// Must be shorter than -keep-alive, no pings are sent while settling.
    #[arg(long, default_value = "3")]
    pub settle: u64,

    /// CA certificate used to verify the broker. Enables TLS.
    #[arg(long, value_name = "FILE")]
    pub ca_file: Option<PathBuf>,

    /// Print the result as json
    #[arg(long, default_value = "false")]
    pub json: bool,
}

/// Accept go style single dash long flags (`-broker tcp://..`, `-qos=1`) by
/// rewriting them to the double dash form clap expects. Short flags and
/// negative numbers are left alone.
pub fn normalize_args<I, T>(args: I) -> Vec<OsString>
where
    I: IntoIterator<Item = T>,
    T: Into<OsString>,
{
    args.into_iter()
        .map(Into::into)
        .enumerate()
        .map(|(position, arg)| {
            if position == 0 {
                return arg;
            }

            match arg.to_str() {
                Some(s) if is_single_dash_long(s) => OsString::from(format!("-{s}")),
                _ => arg,
            }
        })
        .collect()
}

fn is_single_dash_long(arg: &str) -> bool {
    let Some(rest) = arg.strip_prefix('-') else {
        return false;
    };

    let name = rest.split('=').next().unwrap_or_default();
    name.len() > 1 && name.starts_with(|c: char| c.is_ascii_alphabetic())
}

#[derive(thiserror::Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("Invalid argument : -broker -> {0}")]
    Broker(String),
    #[error("Invalid argument : -action -> {0}")]
    Action(String),
    #[error("Invalid argument : -clients -> {0}")]
    Clients(i64),
    #[error("Invalid argument : -count -> {0}")]
    Count(i64),
    #[error("Invalid argument : -size -> {0}")]
    Size(i64),
    #[error("Invalid argument : -qos -> {0}")]
    Qos(i64),
    #[error("Invalid argument : -keep-alive -> {0}")]
    KeepAlive(u64),
    #[error("Invalid argument : -max-inflight -> {0}")]
    MaxInflight(u16),
    #[error("Invalid argument : -conn-timeout -> {0}")]
    ConnTimeout(u64),
    #[error("Invalid argument : -settle -> {0} (must be shorter than -keep-alive {1})")]
    Settle(u64, u64),
    #[error("Invalid argument : -ca-file is required for {0}")]
    MissingCaFile(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Publish,
    Subscribe,
}

impl FromStr for Action {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "p" | "pub" | "publish" => Ok(Action::Publish),
            "s" | "sub" | "subscribe" => Ok(Action::Subscribe),
            other => Err(ConfigError::Action(other.to_owned())),
        }
    }
}

impl Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Publish => f.write_str("Publish"),
            Self::Subscribe => f.write_str("Subscribe"),
        }
    }
}

/// Parsed broker uri. `uri` keeps the text the user gave for reporting.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Broker {
    pub uri: String,
    pub host: String,
    pub port: u16,
    pub tls: bool,
}

impl FromStr for Broker {
    type Err = ConfigError;

    fn from_str(uri: &str) -> Result<Self, Self::Err> {
        let invalid = || ConfigError::Broker(uri.to_owned());
        if uri.is_empty() || uri == BROKER_PLACEHOLDER {
            return Err(invalid());
        }

        let (scheme, authority) = uri.split_once("://").unwrap_or(("tcp", uri));
        let tls = match scheme {
            "tcp" | "mqtt" => false,
            "ssl" | "tls" | "mqtts" => true,
            _ => return Err(invalid()),
        };

        let authority = authority.trim_end_matches('/');
        let (host, port) = match authority.rsplit_once(':') {
            // bracketed ipv6 without a port, eg. [::1]
            Some((_, tail)) if tail.ends_with(']') => (authority, None),
            Some((host, port)) => (host, Some(port.parse::<u16>().map_err(|_| invalid())?)),
            None => (authority, None),
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        if host.is_empty() || host.contains('/') {
            return Err(invalid());
        }

        let port = port.unwrap_or(if tls { 8883 } else { 1883 });
        Ok(Broker {
            uri: uri.to_owned(),
            host: host.to_owned(),
            port,
            tls,
        })
    }
}

impl Display for Broker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.uri)
    }
}

/// Validated configuration of a single run. Built once, never mutated.
#[derive(Debug, Clone)]
pub struct BenchOptions {
    pub broker: Broker,
    pub clients: usize,
    pub count: usize,
    pub size: usize,
    pub qos: QoS,
    pub keep_alive: Duration,
    pub max_inflight: u16,
    pub conn_timeout: u64,
    pub settle: Duration,
    pub ca_file: Option<PathBuf>,
}

impl Cli {
    /// Check every argument and build the options of the run. Nothing is
    /// validated again past this point.
    pub fn validate(self) -> Result<(Action, BenchOptions), ConfigError> {
        let broker: Broker = self.broker.parse()?;
        let action: Action = self.action.parse()?;

        if broker.tls && self.ca_file.is_none() {
            return Err(ConfigError::MissingCaFile(broker.uri));
        }

        let clients = match usize::try_from(self.clients) {
            Ok(n) if n > 0 => n,
            _ => return Err(ConfigError::Clients(self.clients)),
        };
        let count = match usize::try_from(self.count) {
            Ok(n) if n > 0 => n,
            _ => return Err(ConfigError::Count(self.count)),
        };
        let size = usize::try_from(self.size).map_err(|_| ConfigError::Size(self.size))?;
        let qos = get_qos(self.qos).ok_or(ConfigError::Qos(self.qos))?;

        // rumqttc asserts on these instead of returning errors
        if self.keep_alive < 5 {
            return Err(ConfigError::KeepAlive(self.keep_alive));
        }
        if self.max_inflight == 0 {
            return Err(ConfigError::MaxInflight(self.max_inflight));
        }
        if self.conn_timeout == 0 {
            return Err(ConfigError::ConnTimeout(self.conn_timeout));
        }
        // event loops aren't polled while settling, so no PINGREQ goes out
        if self.settle >= self.keep_alive {
            return Err(ConfigError::Settle(self.settle, self.keep_alive));
        }

        let options = BenchOptions {
            broker,
            clients,
            count,
            size,
            qos,
            keep_alive: Duration::from_secs(self.keep_alive),
            max_inflight: self.max_inflight,
            conn_timeout: self.conn_timeout,
            settle: Duration::from_secs(self.settle),
            ca_file: self.ca_file,
        };

        Ok((action, options))
    }
}
