//! Kernel settings loaded from TOML or JSON with environment overrides.
//!
//! ```toml
//! [device]
//! compute_units = 16
//!
//! [attention]
//! split_kv = "auto"        # or "never", or { force = 4 }
//!
//! [layer_norm]
//! forward_resident_max = 8192
//! backward_fused_max = 5120
//!
//! [philox]
//! seed = 0
//! ```

use std::{env, fs, path::Path};

use serde::Deserialize;

use crate::device::DeviceProfile;
use crate::error::{Result, RuntimeError};

/// Widest row the whole-row-resident forward kernel accepts.
pub const DEFAULT_FORWARD_RESIDENT_MAX: usize = 8192;
/// Widest row handled by the fused backward kernel.
pub const DEFAULT_BACKWARD_FUSED_MAX: usize = 5120;

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct KernelSettings {
    pub device: DeviceSettings,
    pub attention: AttentionSettings,
    pub layer_norm: LayerNormSettings,
    pub philox: PhiloxSettings,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct DeviceSettings {
    /// Overrides the detected parallel-unit count.
    pub compute_units: Option<usize>,
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct AttentionSettings {
    pub split_kv: SplitKvPolicy,
}

/// How the flash forward pass decides on key/value splitting.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SplitKvPolicy {
    /// Use the occupancy heuristic.
    #[default]
    Auto,
    /// Always run the single-pass kernel.
    Never,
    /// Use exactly this many splits whenever splitting is permitted.
    Force(usize),
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct LayerNormSettings {
    pub forward_resident_max: usize,
    pub backward_fused_max: usize,
}

impl Default for LayerNormSettings {
    fn default() -> Self {
        Self {
            forward_resident_max: DEFAULT_FORWARD_RESIDENT_MAX,
            backward_fused_max: DEFAULT_BACKWARD_FUSED_MAX,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct PhiloxSettings {
    pub seed: u64,
}

impl KernelSettings {
    /// Loads settings, choosing the parser from the file extension.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let settings: KernelSettings = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(RuntimeError::ConfigFormat(format!(
                    "unsupported settings extension '{other}'"
                )))
            }
        };
        settings.validate()?;
        Ok(settings)
    }

    pub fn from_toml_str(contents: &str) -> Result<Self> {
        let settings: KernelSettings = toml::from_str(contents)?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<()> {
        let mut errors = Vec::new();
        if self.device.compute_units == Some(0) {
            errors.push("device.compute_units must be greater than 0".to_string());
        }
        if self.attention.split_kv == SplitKvPolicy::Force(0) {
            errors.push("attention.split_kv force count must be greater than 0".to_string());
        }
        if self.layer_norm.forward_resident_max == 0 {
            errors.push("layer_norm.forward_resident_max must be greater than 0".to_string());
        }
        if self.layer_norm.backward_fused_max == 0 {
            errors.push("layer_norm.backward_fused_max must be greater than 0".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(RuntimeError::Validation(errors))
        }
    }

    /// Applies `GEMS_*` environment variables on top of the loaded values.
    pub fn apply_env_overrides(&mut self) {
        if let Some(units) = env_parse::<usize>("GEMS_COMPUTE_UNITS") {
            self.device.compute_units = Some(units.max(1));
        }
        if let Ok(raw) = env::var("GEMS_SPLIT_KV") {
            match parse_split_policy(&raw) {
                Some(policy) => self.attention.split_kv = policy,
                None => log::warn!("ignoring GEMS_SPLIT_KV={raw:?}: expected auto, never or a count"),
            }
        }
        if let Some(seed) = env_parse::<u64>("GEMS_PHILOX_SEED") {
            self.philox.seed = seed;
        }
        if let Some(width) = env_parse::<usize>("GEMS_LN_FORWARD_RESIDENT_MAX") {
            self.layer_norm.forward_resident_max = width.max(1);
        }
        if let Some(width) = env_parse::<usize>("GEMS_LN_BACKWARD_FUSED_MAX") {
            self.layer_norm.backward_fused_max = width.max(1);
        }
    }

    /// Device profile after applying the `compute_units` override.
    pub fn device_profile(&self) -> DeviceProfile {
        let profile = DeviceProfile::host();
        match self.device.compute_units {
            Some(units) => profile.with_compute_units(units),
            None => profile,
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(value) => Some(value),
        Err(_) => {
            log::warn!("ignoring {key}={raw:?}: not a valid number");
            None
        }
    }
}

fn parse_split_policy(raw: &str) -> Option<SplitKvPolicy> {
    match raw.trim().to_lowercase().as_str() {
        "auto" => Some(SplitKvPolicy::Auto),
        "never" | "off" | "0" => Some(SplitKvPolicy::Never),
        other => other.parse().ok().map(SplitKvPolicy::Force),
    }
}
