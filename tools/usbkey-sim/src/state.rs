//! Simulator state persisted between runs.

use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use log::{debug, info};
use serde::{Deserialize, Serialize};
use tpm_usbkey::sim::SimState;

/// Bumped when the file layout changes
const STATE_VERSION: u32 = 1;

/// On-disk wrapper around the simulator's NV contents
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateFile {
    pub version: u32,
    pub tpm: SimState,
}

impl Default for StateFile {
    fn default() -> Self {
        Self {
            version: STATE_VERSION,
            tpm: SimState::default(),
        }
    }
}

impl StateFile {
    /// Load `path`, or start from an empty module if it does not exist
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if !path.exists() {
            info!("No state at {}, starting with an empty module", path.display());
            return Ok(Self::default());
        }

        let text = fs::read_to_string(path)
            .with_context(|| format!("Failed to read state file {}", path.display()))?;
        let state: StateFile = toml::from_str(&text)
            .with_context(|| format!("Failed to parse state file {}", path.display()))?;

        if state.version != STATE_VERSION {
            bail!(
                "State file {} has version {}, expected {}",
                path.display(),
                state.version,
                STATE_VERSION
            );
        }
        debug!("Loaded {} NV spaces from {}", state.tpm.spaces.len(), path.display());
        Ok(state)
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let text = toml::to_string_pretty(self).context("Failed to serialize simulator state")?;
        fs::write(path, text)
            .with_context(|| format!("Failed to write state file {}", path.display()))?;
        debug!("Saved {} NV spaces to {}", self.tpm.spaces.len(), path.display());
        Ok(())
    }
}
