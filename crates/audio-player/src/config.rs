use std::time::Duration;

/// Render engine tuning.
#[derive(Clone, Debug)]
pub struct EngineConfig {
    /// Seconds before a buffer's end at which a queued successor takes over.
    pub guard_interval_seconds: f64,
    /// Rate of `TimeUpdate` events.
    pub time_update_hz: u32,
    /// Maximum queued scheduled switches; storage is reserved up front.
    pub schedule_capacity: usize,
    pub command_capacity: usize,
    pub event_capacity: usize,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            guard_interval_seconds: 0.75,
            time_update_hz: 10,
            schedule_capacity: 16,
            command_capacity: 64,
            event_capacity: 256,
        }
    }
}

/// Output device selection and sample-rate watch.
#[derive(Clone, Debug)]
pub struct OutputConfig {
    /// Case-insensitive substring of the device name; default device when unset.
    pub device: Option<String>,
    /// Preferred stream rate; highest supported rate when unset.
    pub target_rate: Option<u32>,
    /// Poll the device default rate as a fallback for hosts that do not report changes.
    pub poll_sample_rate: bool,
    pub poll_interval: Duration,
}

impl Default for OutputConfig {
    fn default() -> Self {
        Self {
            device: None,
            target_rate: None,
            poll_sample_rate: true,
            poll_interval: Duration::from_secs(1),
        }
    }
}
