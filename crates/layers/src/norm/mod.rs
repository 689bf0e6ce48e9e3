//! Layer normalisation over the trailing `normalized_shape` axes.
//!
//! An input of shape `(*, *normalized_shape)` is viewed as an `(M, N)`
//! matrix with `N = prod(normalized_shape)`. Statistics are returned as `f32`
//! tensors of shape `(M,)`; outputs and gradients keep the dtype of the
//! tensor they mirror.

mod backward;
mod forward;
pub mod heuristics;

use std::sync::OnceLock;

use candle_core::{DType, Device, Tensor};
use runtime::settings::LayerNormSettings;
use runtime::{AtomicF32Buffer, ConfigStrategy, DeviceProfile, HostTensor, StridedView};

use crate::checks;
use crate::dtypes::{PrecisionPolicy, NORM_DTYPES};
use crate::LayerError;

use backward::{run_fused, run_input_grad, run_weight_bias_grad, GradBlock, GradInputs};
use forward::{run_looped, run_resident, NormInputs, NormalizedBlock};
use heuristics::{
    backward_fused_table, backward_tile_table, forward_loop_table, forward_resident_table,
    NormKey, RowBlockTable, RowTileTable,
};

/// Forward kernel variant, chosen by row width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardVariant {
    /// Whole rows resident in a persistent program.
    Resident,
    /// Column-tiled loops over each row.
    Looped,
}

/// Backward kernel variant, chosen by row width.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackwardVariant {
    /// One persistent launch; weight/bias partials folded without atomics.
    Fused,
    /// Separate input and weight/bias launches; the latter accumulates
    /// atomically.
    Decomposed,
}

#[derive(Debug, Clone)]
pub struct LayerNormOutput {
    /// Normalised input, same shape and dtype as `x`.
    pub output: Tensor,
    /// `(M,)` row means, `f32`.
    pub mean: Tensor,
    /// `(M,)` reciprocal standard deviations, `f32`.
    pub rstd: Tensor,
}

#[derive(Debug, Clone)]
pub struct LayerNormGrads {
    pub d_input: Tensor,
    /// Shaped like `normalized_shape`, in the weight dtype (or the input
    /// dtype when there is no weight).
    pub d_weight: Tensor,
    pub d_bias: Tensor,
}

/// Tile tables, variant thresholds and the device profile for the layer
/// norm kernels.
#[derive(Debug)]
pub struct LayerNormKernels {
    settings: LayerNormSettings,
    device: DeviceProfile,
    resident: RowBlockTable,
    looped: RowTileTable,
    fused_backward: RowBlockTable,
    backward_tiles: RowTileTable,
    first_call: OnceLock<()>,
}

impl LayerNormKernels {
    pub fn new(settings: LayerNormSettings, device: DeviceProfile) -> Result<Self, LayerError> {
        Ok(Self {
            settings,
            device,
            resident: forward_resident_table()?,
            looped: forward_loop_table()?,
            fused_backward: backward_fused_table()?,
            backward_tiles: backward_tile_table()?,
            first_call: OnceLock::new(),
        })
    }

    /// Default thresholds on the host rayon pool.
    pub fn host() -> Result<Self, LayerError> {
        Self::new(LayerNormSettings::default(), DeviceProfile::host())
    }

    pub fn settings(&self) -> &LayerNormSettings {
        &self.settings
    }

    pub fn device(&self) -> &DeviceProfile {
        &self.device
    }

    pub fn forward_variant(&self, cols: usize) -> ForwardVariant {
        if cols <= self.settings.forward_resident_max {
            ForwardVariant::Resident
        } else {
            ForwardVariant::Looped
        }
    }

    pub fn backward_variant(&self, cols: usize) -> BackwardVariant {
        if cols <= self.settings.backward_fused_max {
            BackwardVariant::Fused
        } else {
            BackwardVariant::Decomposed
        }
    }

    fn log_init(&self) {
        if self.first_call.set(()).is_ok() {
            log::info!(
                "layers::layer_norm init device={} compute_units={} resident_max={} fused_backward_max={}",
                self.device.name,
                self.device.compute_units,
                self.settings.forward_resident_max,
                self.settings.backward_fused_max
            );
        }
    }

    /// Normalises `x` over its trailing `normalized_shape` axes.
    ///
    /// Missing `weight` and `bias` act as ones and zeros.
    pub fn forward(
        &self,
        x: &Tensor,
        normalized_shape: &[usize],
        weight: Option<&Tensor>,
        bias: Option<&Tensor>,
        eps: f64,
    ) -> Result<LayerNormOutput, LayerError> {
        checks::expect_dtype_in("layer_norm.input", x, &NORM_DTYPES)?;
        let (rows, cols) = checks::expect_trailing_shape("layer_norm.input", x, normalized_shape)?;
        expect_affine("layer_norm.weight", weight, x, normalized_shape)?;
        expect_affine("layer_norm.bias", bias, x, normalized_shape)?;
        if !eps.is_finite() || eps < 0.0 {
            return Err(LayerError::unsupported(format!(
                "layer_norm eps must be finite and non-negative, got {eps}"
            )));
        }
        self.log_init();

        let policy = PrecisionPolicy::from_parameter_dtype(x.dtype());
        let x_host = HostTensor::from_tensor(x)?;
        let weight_host = weight.map(HostTensor::from_tensor).transpose()?;
        let bias_host = bias.map(HostTensor::from_tensor).transpose()?;
        let inputs = NormInputs {
            x: StridedView::contiguous(x_host.data(), [rows, cols])?,
            weight: weight_host.as_ref().map(HostTensor::data),
            bias: bias_host.as_ref().map(HostTensor::data),
        };

        let key = NormKey { rows, cols };
        let variant = self.forward_variant(cols);
        let blocks = match variant {
            ForwardVariant::Resident => {
                let config = self.resident.choose_config(&key);
                log::debug!("layers::layer_norm forward rows={rows} cols={cols} variant={variant:?} config={config:?}");
                run_resident(&inputs, eps as f32, &config, self.device.compute_units)
            }
            ForwardVariant::Looped => {
                let config = self.looped.choose_config(&key);
                log::debug!("layers::layer_norm forward rows={rows} cols={cols} variant={variant:?} config={config:?}");
                run_looped(&inputs, eps as f32, &config)
            }
        };

        let mut y = vec![0.0f32; rows * cols];
        let mut mean = vec![0.0f32; rows];
        let mut rstd = vec![0.0f32; rows];
        for NormalizedBlock {
            row_start,
            y: block_y,
            mean: block_mean,
            rstd: block_rstd,
        } in blocks
        {
            let start = row_start * cols;
            y[start..start + block_y.len()].copy_from_slice(&block_y);
            mean[row_start..row_start + block_mean.len()].copy_from_slice(&block_mean);
            rstd[row_start..row_start + block_rstd.len()].copy_from_slice(&block_rstd);
        }

        let device = x.device();
        Ok(LayerNormOutput {
            output: to_tensor(y, x.dims().to_vec(), policy.storage(), device)?,
            mean: to_tensor(mean, vec![rows], policy.reduction(), device)?,
            rstd: to_tensor(rstd, vec![rows], policy.reduction(), device)?,
        })
    }

    /// Gradients of [`LayerNormKernels::forward`] given the saved input,
    /// weight and statistics.
    pub fn backward(
        &self,
        d_output: &Tensor,
        x: &Tensor,
        normalized_shape: &[usize],
        weight: Option<&Tensor>,
        mean: &Tensor,
        rstd: &Tensor,
    ) -> Result<LayerNormGrads, LayerError> {
        checks::expect_dtype_in("layer_norm.input", x, &NORM_DTYPES)?;
        checks::expect_dtype_in("layer_norm.d_output", d_output, &NORM_DTYPES)?;
        let (rows, cols) = checks::expect_trailing_shape("layer_norm.input", x, normalized_shape)?;
        checks::expect_shape("layer_norm.d_output", d_output, x.dims())?;
        checks::expect_same_device("layer_norm.d_output", d_output, x)?;
        expect_affine("layer_norm.weight", weight, x, normalized_shape)?;
        for (name, stat) in [("layer_norm.mean", mean), ("layer_norm.rstd", rstd)] {
            checks::expect_elem_count(name, stat, rows)?;
            checks::expect_dtype_in(name, stat, &NORM_DTYPES)?;
            checks::expect_same_device(name, stat, x)?;
        }
        self.log_init();

        let dy_host = HostTensor::from_tensor(d_output)?;
        let x_host = HostTensor::from_tensor(x)?;
        let weight_host = weight.map(HostTensor::from_tensor).transpose()?;
        let mean_host = HostTensor::from_tensor(mean)?;
        let rstd_host = HostTensor::from_tensor(rstd)?;
        let inputs = GradInputs {
            dy: StridedView::contiguous(dy_host.data(), [rows, cols])?,
            x: StridedView::contiguous(x_host.data(), [rows, cols])?,
            weight: weight_host.as_ref().map(HostTensor::data),
            mean: mean_host.data(),
            rstd: rstd_host.data(),
        };

        let key = NormKey { rows, cols };
        let variant = self.backward_variant(cols);
        let mut dx = vec![0.0f32; rows * cols];
        let mut scatter = |blocks: &[GradBlock]| {
            for block in blocks {
                let start = block.row_start * cols;
                dx[start..start + block.dx.len()].copy_from_slice(&block.dx);
            }
        };
        let (dw, db) = match variant {
            BackwardVariant::Fused => {
                let config = self.fused_backward.choose_config(&key);
                log::debug!("layers::layer_norm backward rows={rows} cols={cols} variant={variant:?} config={config:?}");
                let mut dw = vec![0.0f32; cols];
                let mut db = vec![0.0f32; cols];
                for partial in run_fused(&inputs, &config, self.device.compute_units) {
                    scatter(&partial.blocks);
                    for (acc, v) in dw.iter_mut().zip(&partial.dw) {
                        *acc += v;
                    }
                    for (acc, v) in db.iter_mut().zip(&partial.db) {
                        *acc += v;
                    }
                }
                (dw, db)
            }
            BackwardVariant::Decomposed => {
                let config = self.backward_tiles.choose_config(&key);
                log::debug!("layers::layer_norm backward rows={rows} cols={cols} variant={variant:?} config={config:?}");
                scatter(&run_input_grad(&inputs, &config, self.device.compute_units));
                let dw = AtomicF32Buffer::zeroed(cols);
                let db = AtomicF32Buffer::zeroed(cols);
                run_weight_bias_grad(&inputs, &config, &dw, &db);
                (dw.into_vec(), db.into_vec())
            }
        };

        let device = x.device();
        let param_dtype = weight.map_or(x.dtype(), Tensor::dtype);
        Ok(LayerNormGrads {
            d_input: to_tensor(dx, x.dims().to_vec(), x.dtype(), device)?,
            d_weight: to_tensor(dw, normalized_shape.to_vec(), param_dtype, device)?,
            d_bias: to_tensor(db, normalized_shape.to_vec(), param_dtype, device)?,
        })
    }
}

fn expect_affine(
    name: &str,
    param: Option<&Tensor>,
    x: &Tensor,
    normalized_shape: &[usize],
) -> Result<(), LayerError> {
    if let Some(param) = param {
        checks::expect_shape(name, param, normalized_shape)?;
        checks::expect_dtype_in(name, param, &NORM_DTYPES)?;
        checks::expect_same_device(name, param, x)?;
    }
    Ok(())
}

fn to_tensor(data: Vec<f32>, dims: Vec<usize>, dtype: DType, device: &Device) -> Result<Tensor, LayerError> {
    Ok(HostTensor::from_vec(data, dims, dtype, device.clone())?.to_tensor()?)
}

/// Layer norm forward with the default thresholds on the host pool.
pub fn layer_norm_forward(
    x: &Tensor,
    normalized_shape: &[usize],
    weight: Option<&Tensor>,
    bias: Option<&Tensor>,
    eps: f64,
) -> Result<LayerNormOutput, LayerError> {
    LayerNormKernels::host()?.forward(x, normalized_shape, weight, bias, eps)
}

/// Layer norm backward with the default thresholds on the host pool.
pub fn layer_norm_backward(
    d_output: &Tensor,
    x: &Tensor,
    normalized_shape: &[usize],
    weight: Option<&Tensor>,
    mean: &Tensor,
    rstd: &Tensor,
) -> Result<LayerNormGrads, LayerError> {
    LayerNormKernels::host()?.backward(d_output, x, normalized_shape, weight, mean, rstd)
}

/// Configuration of a [`LayerNorm`] layer.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    pub normalized_shape: Vec<usize>,
    /// Numeric stabiliser added to the variance.
    pub epsilon: f64,
    /// Whether the layer carries learnable scale (and optionally bias).
    pub elementwise_affine: bool,
}

impl NormConfig {
    pub fn new(normalized_shape: impl Into<Vec<usize>>) -> Self {
        Self {
            normalized_shape: normalized_shape.into(),
            epsilon: 1e-5,
            elementwise_affine: true,
        }
    }
}

/// LayerNorm layer holding its parameters.
#[derive(Debug, Clone)]
pub struct LayerNorm {
    config: NormConfig,
    weight: Option<Tensor>,
    bias: Option<Tensor>,
}

impl LayerNorm {
    /// Constructs a LayerNorm with learnable scale and bias parameters.
    pub fn new(weight: Tensor, bias: Tensor, mut config: NormConfig) -> Result<Self, LayerError> {
        config.elementwise_affine = true;
        Self::build(config, Some(weight), Some(bias))
    }

    /// Constructs a LayerNorm with an affine scale but no bias.
    pub fn with_scale(weight: Tensor, mut config: NormConfig) -> Result<Self, LayerError> {
        config.elementwise_affine = true;
        Self::build(config, Some(weight), None)
    }

    /// Constructs a LayerNorm without affine parameters (scale = 1, bias = 0).
    pub fn without_affine(mut config: NormConfig) -> Result<Self, LayerError> {
        config.elementwise_affine = false;
        Self::build(config, None, None)
    }

    fn build(config: NormConfig, weight: Option<Tensor>, bias: Option<Tensor>) -> Result<Self, LayerError> {
        for (name, param) in [("norm.weight", &weight), ("norm.bias", &bias)] {
            if let Some(param) = param {
                checks::expect_shape(name, param, &config.normalized_shape)?;
                checks::expect_dtype_in(name, param, &NORM_DTYPES)?;
            }
        }
        if let (Some(weight), Some(bias)) = (&weight, &bias) {
            checks::expect_same_device("norm.bias", bias, weight)?;
        }
        Ok(Self { config, weight, bias })
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    pub fn weight(&self) -> Option<&Tensor> {
        self.weight.as_ref()
    }

    pub fn bias(&self) -> Option<&Tensor> {
        self.bias.as_ref()
    }

    pub fn forward(&self, kernels: &LayerNormKernels, x: &Tensor) -> Result<LayerNormOutput, LayerError> {
        kernels.forward(
            x,
            &self.config.normalized_shape,
            self.weight.as_ref(),
            self.bias.as_ref(),
            self.config.epsilon,
        )
    }

    /// Gradients for `d_output` given the input and the saved forward
    /// statistics. `d_weight`/`d_bias` are returned even for non-affine
    /// layers, as gradients with respect to the implicit unit scale and zero
    /// shift.
    pub fn backward(
        &self,
        kernels: &LayerNormKernels,
        d_output: &Tensor,
        x: &Tensor,
        saved: &LayerNormOutput,
    ) -> Result<LayerNormGrads, LayerError> {
        kernels.backward(
            d_output,
            x,
            &self.config.normalized_shape,
            self.weight.as_ref(),
            &saved.mean,
            &saved.rstd,
        )
    }
}
