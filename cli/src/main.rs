use std::path::PathBuf;
use std::time::Instant;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Tensor};
use clap::{Args, Parser, Subcommand};
use gems::attention::reference::ExactAttention;
use gems::attention::Attention;
use gems::layers::LayerNormKernels;
use gems::runtime::settings::LayerNormSettings;
use gems::{Config, FlashParams, Gems, SplitKvPolicy};

fn main() {
    gems::init_logging();
    if let Err(err) = run() {
        eprintln!("gems failed: {err:#}");
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Parity checks and micro-benchmarks for the gems kernels", long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Compare the kernels against dense references on random inputs.
    Check(CommonArgs),
    /// Time the kernels over a grid of shapes.
    Bench {
        #[command(flatten)]
        common: CommonArgs,

        #[arg(long, default_value_t = 5, help = "Timed iterations per shape")]
        iters: usize,
    },
}

#[derive(Args, Debug)]
struct CommonArgs {
    #[arg(
        short,
        long,
        value_name = "PATH",
        help = "Path to a TOML or JSON settings file"
    )]
    config: Option<PathBuf>,
}

impl CommonArgs {
    fn context(&self) -> Result<Gems> {
        let gems = match &self.config {
            Some(path) => Gems::from_path(path)
                .with_context(|| format!("failed to load settings from {}", path.display()))?,
            None => Gems::from_env()?,
        };
        Ok(gems)
    }
}

fn run() -> Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Command::Check(common) => check(&common.context()?),
        Command::Bench { common, iters } => bench(&common.context()?, iters.max(1)),
    }
}

struct Outcome {
    property: &'static str,
    shape: String,
    error: f32,
    tolerance: f32,
}

impl Outcome {
    fn passed(&self) -> bool {
        self.error <= self.tolerance
    }
}

fn check(gems: &Gems) -> Result<()> {
    let device = Device::Cpu;
    let mut outcomes = Vec::new();

    // SDPA against the dense reference, causal and not.
    let (q, k, v) = random_qkv((2, 4, 96, 64), &device)?;
    for (property, config) in [
        ("sdpa == exact", Config::default()),
        ("sdpa causal == exact", Config::causal()),
    ] {
        let out = gems.attention(&q, &k, &v, None, &config)?;
        let expected = ExactAttention::new().attend(&q, &k, &v, None, &config)?;
        outcomes.push(Outcome {
            property,
            shape: "(2,4,96,64)".into(),
            error: max_abs_diff(&out, &expected)?,
            tolerance: 1e-4,
        });
    }

    // Flash (seq-major) against the same reference.
    let seq_major = |t: &Tensor| t.transpose(1, 2).and_then(|t| t.contiguous());
    let (fq, fk, fv) = (seq_major(&q)?, seq_major(&k)?, seq_major(&v)?);
    let expected = ExactAttention::new().attend(&q, &k, &v, None, &Config::default())?;
    let single = gems.flash_attention_forward(
        &fq,
        &fk,
        &fv,
        FlashParams::default().with_split_kv(SplitKvPolicy::Never),
    )?;
    outcomes.push(Outcome {
        property: "flash == exact",
        shape: "(2,96,4,64)".into(),
        error: max_abs_diff(&single.output.transpose(1, 2)?, &expected)?,
        tolerance: 1e-4,
    });

    for n_splits in [1usize, 2, 4] {
        let split = gems.flash_attention_forward(
            &fq,
            &fk,
            &fv,
            FlashParams::default().with_split_kv(SplitKvPolicy::Force(n_splits)),
        )?;
        let error = max_abs_diff(&split.output, &single.output)?
            .max(max_abs_diff(&split.lse, &single.lse)?);
        outcomes.push(Outcome {
            property: match n_splits {
                1 => "split(1) == single pass",
                2 => "split(2) == single pass",
                _ => "split(4) == single pass",
            },
            shape: "(2,96,4,64)".into(),
            error,
            tolerance: 1e-4,
        });
    }

    outcomes.push(causal_prefix(gems, &device)?);
    outcomes.push(dropout_keep_ratio(gems, &device)?);
    outcomes.extend(layer_norm_checks(gems, &device)?);

    let rows: Vec<Vec<String>> = outcomes
        .iter()
        .map(|o| {
            vec![
                o.property.to_string(),
                o.shape.clone(),
                format!("{:.2e}", o.error),
                format!("{:.0e}", o.tolerance),
                if o.passed() { "ok" } else { "FAIL" }.to_string(),
            ]
        })
        .collect();
    println!(
        "{}",
        markdown_table(&["property", "shape", "error", "tolerance", "status"], &rows)
    );

    let failed = outcomes.iter().filter(|o| !o.passed()).count();
    if failed > 0 {
        bail!("{failed} of {} checks failed", outcomes.len());
    }
    Ok(())
}

/// Causal output row `i` must not change when keys/values after `i` do.
fn causal_prefix(gems: &Gems, device: &Device) -> Result<Outcome> {
    let (q, k, v) = random_qkv((1, 4, 1, 16), device)?;
    let params = FlashParams::causal();
    let base = gems.flash_attention_forward(&q, &k, &v, params.clone())?;

    let mut error = 0.0f32;
    for row in 0..3 {
        let tail = 3 - row;
        let perturb = |t: &Tensor| -> Result<Tensor> {
            let noise = Tensor::randn(0f32, 1.0, (1, tail, 1, 16), device)?;
            Ok(Tensor::cat(&[&t.narrow(1, 0, row + 1)?, &noise], 1)?)
        };
        let out = gems.flash_attention_forward(&q, &perturb(&k)?, &perturb(&v)?, params.clone())?;
        let kept = max_abs_diff(
            &out.output.narrow(1, 0, row + 1)?,
            &base.output.narrow(1, 0, row + 1)?,
        )?;
        error = error.max(kept);
    }
    Ok(Outcome {
        property: "causal row i sees keys 0..=i",
        shape: "(1,4,1,16)".into(),
        error,
        tolerance: 1e-6,
    })
}

/// Fraction of dropped probabilities, read off the sign of the debug output.
fn dropout_keep_ratio(gems: &Gems, device: &Device) -> Result<Outcome> {
    const P: f32 = 0.3;
    let (q, k, v) = random_qkv((1, 128, 4, 32), device)?;
    let out = gems.flash_attention_forward(
        &q,
        &k,
        &v,
        FlashParams::default().with_dropout(P).with_debug_probs(),
    )?;
    let probs = out
        .debug_probs
        .context("debug probabilities were requested but not returned")?
        .narrow(2, 0, 128)?
        .narrow(3, 0, 128)?
        .to_dtype(DType::F32)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    let dropped = probs.iter().filter(|p| **p < 0.0).count() as f32 / probs.len() as f32;
    Ok(Outcome {
        property: "dropout drop ratio ~ p",
        shape: "(1,128,4,32)".into(),
        error: (dropped - P).abs(),
        tolerance: 0.02,
    })
}

fn layer_norm_checks(gems: &Gems, device: &Device) -> Result<Vec<Outcome>> {
    let mut outcomes = Vec::new();

    let x = (Tensor::randn(0f32, 1.0, (2, 8), device)? * 3.0)?;
    let ones = Tensor::ones(8, DType::F32, device)?;
    let zeros = Tensor::zeros(8, DType::F32, device)?;
    let saved = gems.layer_norm_forward(&x, &[8], Some(&ones), Some(&zeros), 1e-5)?;
    let mean = saved.output.mean_keepdim(1)?.abs()?.max(0)?.flatten_all()?.to_vec1::<f32>()?;
    let var = (saved.output.sqr()?.mean_keepdim(1)? - 1.0)?
        .abs()?
        .max(0)?
        .flatten_all()?
        .to_vec1::<f32>()?;
    outcomes.push(Outcome {
        property: "layer norm mean 0 / var 1",
        shape: "(2,8)".into(),
        error: mean[0].max(var[0]),
        tolerance: 1e-3,
    });

    // Narrow thresholds force the looped forward and the decomposed backward.
    let narrow = LayerNormKernels::new(
        LayerNormSettings {
            forward_resident_max: 64,
            backward_fused_max: 64,
        },
        gems.device().clone(),
    )?;
    let wide = gems.layer_norm_kernels();
    let cols = 1536;
    let x = Tensor::randn(0f32, 1.0, (33, cols), device)?;
    let weight = Tensor::randn(1f32, 0.1, cols, device)?;
    let bias = Tensor::randn(0f32, 0.1, cols, device)?;
    let dy = Tensor::randn(0f32, 1.0, (33, cols), device)?;

    let resident = wide.forward(&x, &[cols], Some(&weight), Some(&bias), 1e-5)?;
    let looped = narrow.forward(&x, &[cols], Some(&weight), Some(&bias), 1e-5)?;
    outcomes.push(Outcome {
        property: "resident == looped forward",
        shape: format!("(33,{cols})"),
        error: max_abs_diff(&resident.output, &looped.output)?,
        tolerance: 1e-4,
    });

    let fused = wide.backward(&dy, &x, &[cols], Some(&weight), &resident.mean, &resident.rstd)?;
    let decomposed = narrow.backward(&dy, &x, &[cols], Some(&weight), &resident.mean, &resident.rstd)?;
    let error = max_abs_diff(&fused.d_input, &decomposed.d_input)?
        .max(max_abs_diff(&fused.d_weight, &decomposed.d_weight)?)
        .max(max_abs_diff(&fused.d_bias, &decomposed.d_bias)?);
    outcomes.push(Outcome {
        property: "fused == atomic backward",
        shape: format!("(33,{cols})"),
        error,
        tolerance: 1e-3,
    });

    Ok(outcomes)
}

fn bench(gems: &Gems, iters: usize) -> Result<()> {
    let device = Device::Cpu;
    let mut rows = Vec::new();

    let causal = Config::causal();
    for seq_len in [128usize, 512, 1024] {
        let shape = (1, 8, seq_len, 64);
        let (q, k, v) = random_qkv(shape, &device)?;
        let sdpa = time(iters, || {
            gems.attention(&q, &k, &v, None, &causal)?;
            Ok(())
        })?;
        rows.push(bench_row("sdpa causal", format!("{shape:?}"), sdpa));

        let seq_major = |t: &Tensor| t.transpose(1, 2).and_then(|t| t.contiguous());
        let (fq, fk, fv) = (seq_major(&q)?, seq_major(&k)?, seq_major(&v)?);
        for (label, policy) in [
            ("flash causal", SplitKvPolicy::Never),
            ("flash causal split-kv", SplitKvPolicy::Auto),
        ] {
            let elapsed = time(iters, || {
                gems.flash_attention_forward(
                    &fq,
                    &fk,
                    &fv,
                    FlashParams::causal().with_split_kv(policy),
                )?;
                Ok(())
            })?;
            rows.push(bench_row(label, format!("(1,{seq_len},8,64)"), elapsed));
        }
    }

    for cols in [1024usize, 4096, 10240] {
        let x = Tensor::randn(0f32, 1.0, (256, cols), &device)?;
        let weight = Tensor::ones(cols, DType::F32, &device)?;
        let bias = Tensor::zeros(cols, DType::F32, &device)?;
        let dy = Tensor::randn(0f32, 1.0, (256, cols), &device)?;
        let saved = gems.layer_norm_forward(&x, &[cols], Some(&weight), Some(&bias), 1e-5)?;

        let forward = time(iters, || {
            gems.layer_norm_forward(&x, &[cols], Some(&weight), Some(&bias), 1e-5)?;
            Ok(())
        })?;
        rows.push(bench_row("layer norm forward", format!("(256,{cols})"), forward));

        let backward = time(iters, || {
            gems.layer_norm_backward(&dy, &x, &[cols], Some(&weight), &saved.mean, &saved.rstd)?;
            Ok(())
        })?;
        rows.push(bench_row("layer norm backward", format!("(256,{cols})"), backward));
    }

    println!("{}", markdown_table(&["kernel", "shape", "mean ms"], &rows));
    Ok(())
}

/// Mean wall time in milliseconds after one warm-up call.
fn time<F>(iters: usize, mut f: F) -> Result<f64>
where
    F: FnMut() -> Result<()>,
{
    f()?;
    let start = Instant::now();
    for _ in 0..iters {
        f()?;
    }
    Ok(start.elapsed().as_secs_f64() * 1e3 / iters as f64)
}

fn bench_row(kernel: &str, shape: String, ms: f64) -> Vec<String> {
    vec![kernel.to_string(), shape, format!("{ms:.3}")]
}

fn random_qkv(
    dims: (usize, usize, usize, usize),
    device: &Device,
) -> Result<(Tensor, Tensor, Tensor)> {
    let q = Tensor::randn(0f32, 1.0, dims, device)?;
    let k = Tensor::randn(0f32, 1.0, dims, device)?;
    let v = Tensor::randn(0f32, 1.0, dims, device)?;
    Ok((q, k, v))
}

fn max_abs_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    let a = a.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    let b = b.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
    if a.len() != b.len() {
        bail!("compared tensors hold {} and {} elements", a.len(), b.len());
    }
    Ok(a.iter()
        .zip(b.iter())
        .map(|(x, y)| if x == y { 0.0 } else { (x - y).abs() })
        .fold(0.0f32, f32::max))
}

fn markdown_table(headers: &[&str], rows: &[Vec<String>]) -> String {
    let mut out = format!("| {} |\n", headers.join(" | "));
    out.push_str(&format!(
        "|{}|\n",
        headers.iter().map(|_| "---").collect::<Vec<_>>().join("|")
    ));
    for row in rows {
        out.push_str(&format!("| {} |\n", row.join(" | ")));
    }
    out
}
