//! Tiled attention and layer normalisation kernels over Candle tensors.
//!
//! The kernel families live in their own crates and are re-exported here:
//! [`runtime`] (launch grid, strided views, Philox, settings), [`attention`]
//! (SDPA and flash forward) and [`layers`] (layer norm forward/backward).
//! [`Gems`] ties them to one set of [`KernelSettings`] and one shared Philox
//! counter so that consecutive dropout launches never reuse random numbers.

pub use attention;
pub use layers;
pub use runtime;

use std::path::Path;
use std::sync::Arc;

use candle_core::Tensor;
use thiserror::Error;

pub use attention::flash::{FlashOutput, FlashParams, FlashStrategy};
pub use attention::{AttentionError, Config};
pub use layers::{LayerError, LayerNormGrads, LayerNormOutput};
pub use runtime::{DeviceProfile, KernelSettings, PhiloxState, RuntimeError, SplitKvPolicy};

use attention::flash::FlashAttention;
use attention::{Attention, TiledAttention};
use layers::LayerNormKernels;

#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Layer(#[from] LayerError),
    #[error(transparent)]
    Runtime(#[from] RuntimeError),
}

pub type Result<T> = std::result::Result<T, Error>;

/// Installs `env_logger` with an `info` default filter. Safe to call more
/// than once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .try_init();
}

/// Host context owning the settings, device profile, tile tables and the
/// shared Philox counter.
#[derive(Debug)]
pub struct Gems {
    settings: KernelSettings,
    device: DeviceProfile,
    philox: Arc<PhiloxState>,
    sdpa: TiledAttention,
    flash: FlashAttention,
    layer_norm: LayerNormKernels,
}

impl Gems {
    pub fn new(settings: KernelSettings) -> Result<Self> {
        settings.validate()?;
        let device = settings.device_profile();
        let philox = Arc::new(PhiloxState::new(settings.philox.seed));
        log::info!(
            "gems context device={} compute_units={} split_kv={:?} seed={}",
            device.name,
            device.compute_units,
            settings.attention.split_kv,
            settings.philox.seed
        );
        Ok(Self {
            sdpa: TiledAttention::new()?,
            flash: FlashAttention::new(device.clone()),
            layer_norm: LayerNormKernels::new(settings.layer_norm.clone(), device.clone())?,
            settings,
            device,
            philox,
        })
    }

    /// Loads settings from a TOML or JSON file and applies `GEMS_*`
    /// environment overrides on top.
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self> {
        let mut settings = KernelSettings::from_path(path)?;
        settings.apply_env_overrides();
        Self::new(settings)
    }

    /// Default settings with environment overrides applied.
    pub fn from_env() -> Result<Self> {
        let mut settings = KernelSettings::default();
        settings.apply_env_overrides();
        Self::new(settings)
    }

    pub fn settings(&self) -> &KernelSettings {
        &self.settings
    }

    pub fn device(&self) -> &DeviceProfile {
        &self.device
    }

    /// Handle to the Philox counter consumed by dropout launches.
    pub fn philox(&self) -> Arc<PhiloxState> {
        Arc::clone(&self.philox)
    }

    /// Scaled dot-product attention over `(batch, heads, seq, head_dim)`
    /// tensors. `config` carries the causal flag (top-left aligned), the
    /// softmax scale and the dropout probability, which must be zero.
    pub fn attention(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mask: Option<&Tensor>,
        config: &Config,
    ) -> Result<Tensor> {
        Ok(self.sdpa.attend(query, key, value, mask, config)?)
    }

    /// Flash forward over `(batch, seq, heads, head_dim)` tensors.
    ///
    /// A request left on [`SplitKvPolicy::Auto`] picks up the configured
    /// split policy.
    pub fn flash_attention_forward(
        &self,
        query: &Tensor,
        key: &Tensor,
        value: &Tensor,
        mut params: FlashParams,
    ) -> Result<FlashOutput> {
        if params.split_kv == SplitKvPolicy::Auto {
            params.split_kv = self.settings.attention.split_kv;
        }
        Ok(self
            .flash
            .forward(query, key, value, &params, &self.philox)?)
    }

    pub fn layer_norm_forward(
        &self,
        x: &Tensor,
        normalized_shape: &[usize],
        weight: Option<&Tensor>,
        bias: Option<&Tensor>,
        eps: f64,
    ) -> Result<LayerNormOutput> {
        Ok(self
            .layer_norm
            .forward(x, normalized_shape, weight, bias, eps)?)
    }

    pub fn layer_norm_backward(
        &self,
        d_output: &Tensor,
        x: &Tensor,
        normalized_shape: &[usize],
        weight: Option<&Tensor>,
        mean: &Tensor,
        rstd: &Tensor,
    ) -> Result<LayerNormGrads> {
        Ok(self
            .layer_norm
            .backward(d_output, x, normalized_shape, weight, mean, rstd)?)
    }

    pub fn layer_norm_kernels(&self) -> &LayerNormKernels {
        &self.layer_norm
    }
}
