use anyhow::{Context, Result, ensure};
use cardq_core::{HostLimits, QueueConfig};
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};

const PROFILE_VERSION: u32 = 0;

/// Host description loaded from a JSON file.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Profile {
    pub version: u32,
    pub limits: HostLimits,
    pub queue: QueueConfig,
}

impl Profile {
    pub fn load(path: &Path) -> Result<Self> {
        let data = fs::read(path).with_context(|| format!("read profile {}", path.display()))?;
        let profile: Profile = serde_json::from_slice(&data).context("decode profile")?;
        ensure!(
            profile.version == PROFILE_VERSION,
            "unsupported profile version {}",
            profile.version
        );
        Ok(profile)
    }
}
