use std::{
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::{memory::USER_SPACE_SIZE, serial::PollConfig};

/// Machine description, usually loaded from JSON.
///
/// ```json
/// {
///   "ram_size": 65536,
///   "slots": [{ "slot": 1, "kind": "ram_bank", "banks": 4 }],
///   "disks": [{ "port": 0, "root": "assets/disk0" }]
/// }
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    pub ram_size: u32,
    pub strict_addressing: bool,
    pub slots: Vec<SlotConfig>,
    pub disks: Vec<DiskConfig>,
    pub serial: PollConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: USER_SPACE_SIZE,
            strict_addressing: false,
            slots: Vec::new(),
            disks: Vec::new(),
            serial: PollConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SlotConfig {
    pub slot: usize,
    #[serde(flatten)]
    pub kind: SlotKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SlotKind {
    Empty,
    RamBank {
        #[serde(default = "default_banks")]
        banks: u32,
    },
    RomBank {
        path: PathBuf,
        #[serde(default = "default_banks")]
        banks: u32,
    },
}

fn default_banks() -> u32 {
    2
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiskConfig {
    pub port: usize,
    pub root: PathBuf,
    #[serde(default)]
    pub name: Option<String>,
}

impl MachineConfig {
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)
            .with_context(|| format!("reading machine config {}", path.display()))?;
        Self::from_json(&text).with_context(|| format!("parsing machine config {}", path.display()))
    }

    pub fn from_json(text: &str) -> anyhow::Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        if config.ram_size > USER_SPACE_SIZE {
            tracing::warn!(
                "[Config] ram_size {} exceeds the user space, capping to {}",
                config.ram_size,
                USER_SPACE_SIZE
            );
        }
        Ok(config)
    }

    pub fn to_json(&self) -> anyhow::Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }
}
