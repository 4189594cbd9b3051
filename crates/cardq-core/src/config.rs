use crate::error::{QueueError, QueueResult};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Staging size used when a single-segment host needs bouncing.
pub const DEFAULT_BOUNCE_SIZE: usize = 65536;
pub const DEFAULT_BLOCK_SIZE: usize = 512;

/// Transfer limits advertised by the host controller.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct HostLimits {
    /// Segments the controller can address in one transfer.
    pub max_hw_segs: usize,
    /// Segments the request may be built from before remapping.
    pub max_phys_segs: usize,
    /// Largest transfer in bytes.
    pub max_req_size: usize,
    /// Largest single segment in bytes.
    pub max_seg_size: usize,
    /// Largest transfer in blocks.
    pub max_blk_count: usize,
}

impl Default for HostLimits {
    fn default() -> Self {
        Self {
            max_hw_segs: 128,
            max_phys_segs: 128,
            max_req_size: 524288,
            max_seg_size: 65536,
            max_blk_count: 1024,
        }
    }
}

impl HostLimits {
    pub fn validate(&self) -> QueueResult<()> {
        let fields = [
            ("max_hw_segs", self.max_hw_segs),
            ("max_phys_segs", self.max_phys_segs),
            ("max_req_size", self.max_req_size),
            ("max_seg_size", self.max_seg_size),
            ("max_blk_count", self.max_blk_count),
        ];
        for (name, value) in fields {
            if value == 0 {
                return Err(QueueError::InvalidLimits(format!("{name} must be positive")));
            }
        }
        Ok(())
    }
}

/// Tunables for a card queue.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Upper bound for the bounce region.
    pub bounce_size: usize,
    pub block_size: usize,
    /// Pause after a failed post-transfer status query.
    pub removal_cooldown_ms: u64,
    /// Query card status after every successful transfer.
    pub status_check: bool,
    /// Poll the card until ready before the first request after a resume.
    pub paranoid_resume: bool,
    pub paranoid_retries: u32,
    pub paranoid_retry_delay_ms: u64,
    /// Prefix for the worker thread name.
    pub thread_prefix: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            bounce_size: DEFAULT_BOUNCE_SIZE,
            block_size: DEFAULT_BLOCK_SIZE,
            removal_cooldown_ms: 500,
            status_check: true,
            paranoid_resume: false,
            paranoid_retries: 3,
            paranoid_retry_delay_ms: 5,
            thread_prefix: "cardq".to_string(),
        }
    }
}

impl QueueConfig {
    pub fn validate(&self) -> QueueResult<()> {
        if self.block_size == 0 || !self.block_size.is_power_of_two() {
            return Err(QueueError::InvalidConfig(format!(
                "block size {} is not a power of two",
                self.block_size
            )));
        }
        if self.bounce_size == 0 {
            return Err(QueueError::InvalidConfig(
                "bounce size must be positive".to_string(),
            ));
        }
        Ok(())
    }

    pub fn removal_cooldown(&self) -> Duration {
        Duration::from_millis(self.removal_cooldown_ms)
    }

    pub fn paranoid_retry_delay(&self) -> Duration {
        Duration::from_millis(self.paranoid_retry_delay_ms)
    }
}
