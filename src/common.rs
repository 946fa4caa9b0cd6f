use bytes::Bytes;
use indicatif::ProgressStyle;
use once_cell::sync::Lazy;
use rumqttc::QoS;

/// Prefix of every client id handed to the broker
pub const CLIENT_ID_PREFIX: &str = "mqtt-bench";
/// Root of the per-client, per-iteration topic tree
pub const TOPIC_PREFIX: &str = "/mqtt-bench/benchmark";

pub static PROGRESS_STYLE: Lazy<indicatif::ProgressStyle> = Lazy::new(|| {
    ProgressStyle::with_template(
        "{spinner:.bold.bright.yellow} {prefix:>22} {pos:>7}/{len:7} {bar:40.cyan/blue} {msg}",
    )
    .expect("progress style template should be correct")
    .progress_chars("##-")
});

/// Per worker tallies. `attempts` counts every operation issued, whether the
/// broker confirmed it or not.
#[derive(Default, Debug, Clone, Copy, PartialEq, Eq)]
pub struct OpStats {
    pub attempts: u64,
    pub failures: u64,
}

impl std::ops::AddAssign for OpStats {
    fn add_assign(&mut self, other: Self) {
        self.attempts += other.attempts;
        self.failures += other.failures;
    }
}

/// Build the payload shared by every publish of a run: `size` ascii digits
/// cycling from '0' to '9'.
pub fn fixed_size_message(size: usize) -> Bytes {
    (0..size).map(|i| b'0' + (i % 10) as u8).collect()
}

pub fn client_id(index: usize) -> String {
    format!("{CLIENT_ID_PREFIX}-{index:05}")
}

/// Topic used by client `index` on its `iteration`th operation. Indices are
/// separated by '/', so no two pairs map to the same topic.
pub fn topic(index: usize, iteration: usize) -> String {
    format!("{TOPIC_PREFIX}/{index}/{iteration}")
}

/// get QoS level. `None` for anything outside 0..=2.
pub fn get_qos(qos: i64) -> Option<QoS> {
    match qos {
        0 => Some(QoS::AtMostOnce),
        1 => Some(QoS::AtLeastOnce),
        2 => Some(QoS::ExactlyOnce),
        _ => None,
    }
}
