//! Correctness harness comparing the tiled kernels against dense Candle ops.
//! Run with: `cargo bench -p attention correctness`

#[path = "common/mod.rs"]
mod util;

use std::error::Error;

use attention::flash::{FlashAttention, FlashParams};
use attention::reference::ExactAttention;
use attention::{Attention, Config, TiledAttention};
use candle_core::{DType, Device, Tensor};
use runtime::{DeviceProfile, PhiloxState, SplitKvPolicy};
use util::{format_markdown_table, update_results};

const ABS_TOL: f32 = 5e-3;
const REL_TOL: f32 = 5e-2;

#[derive(Clone, Copy)]
struct Case {
    batch: usize,
    heads: usize,
    seq_len: usize,
    head_dim: usize,
    dtype: DType,
}

fn main() {
    if let Err(err) = run() {
        eprintln!("correctness harness failed: {err}");
        std::process::exit(1);
    }
}

fn run() -> Result<(), Box<dyn Error>> {
    let device = Device::Cpu;
    let seq_lengths = [32usize, 128, 512, 2048];
    let head_dims = [64usize, 128];
    let dtypes = [DType::F32, DType::BF16, DType::F16];

    let reference = ExactAttention::new();
    let tiled = TiledAttention::new()?;
    let flash = FlashAttention::new(DeviceProfile::host());
    let philox = PhiloxState::default();
    let config = Config::causal();

    let mut rows = Vec::new();
    for &seq_len in &seq_lengths {
        for &head_dim in &head_dims {
            for &dtype in &dtypes {
                let case = Case {
                    batch: 1,
                    heads: 4,
                    seq_len,
                    head_dim,
                    dtype,
                };
                let (q, k, v) = build_inputs(&device, &case)?;
                let expected = reference.attend(&q, &k, &v, None, &config)?;

                let sdpa = tiled.attend(&q, &k, &v, None, &config)?;
                let (abs, rel) = compare(&sdpa, &expected)?;
                check("sdpa", &case, abs, rel)?;
                rows.push(report("sdpa", &case, abs, rel));

                // Square problems: top-left and bottom-right causal coincide.
                let seq_major = |t: &Tensor| t.transpose(1, 2).and_then(|t| t.contiguous());
                let (fq, fk, fv) = (seq_major(&q)?, seq_major(&k)?, seq_major(&v)?);
                for (label, policy) in [("flash", SplitKvPolicy::Never), ("flash split-kv", SplitKvPolicy::Force(4))] {
                    let params = FlashParams::causal().with_split_kv(policy);
                    let out = flash.forward(&fq, &fk, &fv, &params, &philox)?;
                    let out = out.output.transpose(1, 2)?;
                    let (abs, rel) = compare(&out, &expected)?;
                    check(label, &case, abs, rel)?;
                    rows.push(report(label, &case, abs, rel));
                }
            }
        }
    }

    let table = format_markdown_table(&["kernel", "shape", "dtype", "max abs", "max rel"], &rows);

    println!("\nCorrectness summary:\n{table}");
    update_results("Correctness", &table)?;

    Ok(())
}

fn compare(actual: &Tensor, expected: &Tensor) -> Result<(f32, f32), Box<dyn Error>> {
    let actual = actual.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let expected = expected.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let mut max_abs = 0.0f32;
    let mut max_rel = 0.0f32;
    for (a, e) in actual.iter().zip(expected.iter()) {
        let abs = (a - e).abs();
        max_abs = max_abs.max(abs);
        max_rel = max_rel.max(abs / e.abs().max(1e-5));
    }
    Ok((max_abs, max_rel))
}

fn check(kernel: &str, case: &Case, max_abs: f32, max_rel: f32) -> Result<(), Box<dyn Error>> {
    // Reduced precision outputs are rounded after the f32 accumulation.
    let scale = if case.dtype == DType::F32 { 1.0 } else { 4.0 };
    if max_abs > ABS_TOL * scale && max_rel > REL_TOL * scale {
        return Err(format!(
            "{kernel}: tolerance breach for seq_len={} head_dim={} dtype={:?}: abs={:.3e} rel={:.3e}",
            case.seq_len, case.head_dim, case.dtype, max_abs, max_rel
        )
        .into());
    }
    Ok(())
}

fn report(kernel: &str, case: &Case, max_abs: f32, max_rel: f32) -> Vec<String> {
    vec![
        kernel.to_string(),
        format!("({},{},{},{})", case.batch, case.heads, case.seq_len, case.head_dim),
        format!("{:?}", case.dtype),
        format!("{:.2e}", max_abs),
        format!("{:.2e}", max_rel),
    ]
}

fn build_inputs(device: &Device, case: &Case) -> Result<(Tensor, Tensor, Tensor), Box<dyn Error>> {
    let shape = (case.batch, case.heads, case.seq_len, case.head_dim);
    let q = Tensor::rand(0.0f32, 1.0, shape, device)?.to_dtype(case.dtype)?;
    let k = Tensor::rand(0.0f32, 1.0, shape, device)?.to_dtype(case.dtype)?;
    let v = Tensor::rand(0.0f32, 1.0, shape, device)?.to_dtype(case.dtype)?;
    Ok((q, k, v))
}
