//! Runs one TMAC forward pass on synthetic inputs.
//!
//! # Usage
//!
//! ```bash
//! cargo run --release -p tmac-soft --bin tmac-forward -- \
//!   --config tmac.json --batch 4 --tokens 12 --seed 7
//! ```
//!
//! Without `--config` the default configuration is used. `--height` and
//! `--width` default to the configured feature map size.

use std::path::PathBuf;
use std::time::Instant;

use candle_core::{DType, Device, Tensor};
use candle_nn::VarMap;
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal};
use tmac_soft::tmac_core::TmacConfig;
use tmac_soft::{Question, Tmac};
use tracing_subscriber::EnvFilter;

fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = std::env::args().collect();
    let cli = parse_args(&args);

    let config = match &cli.config {
        Some(path) => TmacConfig::from_json_file(path).unwrap_or_else(|e| {
            eprintln!("ERROR: failed to load config: {e}");
            std::process::exit(1);
        }),
        None => TmacConfig::default(),
    };
    let [channels, default_h, default_w] = config.feature_dim;
    let height = cli.height.unwrap_or(default_h);
    let width = cli.width.unwrap_or(default_w);
    let dim = config.module_dim;

    let device = Device::cuda_if_available(0).unwrap_or(Device::Cpu);
    tracing::info!(?device, batch = cli.batch, height, width, tokens = cli.tokens, "tmac-forward");

    let var_map = VarMap::new();
    let model = Tmac::new(config, &var_map, &device).unwrap_or_else(|e| {
        eprintln!("ERROR: failed to build model: {e}");
        std::process::exit(1);
    });
    eprintln!("{model:?}");
    let params = model.param_count().unwrap_or_else(|e| {
        eprintln!("ERROR: failed to count parameters: {e}");
        std::process::exit(1);
    });
    eprintln!("Parameters: {params}");

    let mut rng = StdRng::seed_from_u64(cli.seed);
    let image = random_tensor(&mut rng, &[cli.batch, channels, height, width], &device);
    let context = random_tensor(&mut rng, &[cli.batch, cli.tokens, dim], &device);
    let pooled = random_tensor(&mut rng, &[cli.batch, dim], &device);
    // Example i keeps its first `tokens - i` tokens (at least one).
    let mask: Vec<f32> = (0..cli.batch)
        .flat_map(|i| {
            let valid = cli.tokens.saturating_sub(i).max(1);
            (0..cli.tokens).map(move |l| if l < valid { 1.0 } else { 0.0 })
        })
        .collect();
    let mask = Tensor::from_vec(mask, (cli.batch, cli.tokens), &device).unwrap_or_else(|e| {
        eprintln!("ERROR: failed to build mask: {e}");
        std::process::exit(1);
    });
    let question = Question::new(context, pooled, mask);

    let start = Instant::now();
    let logits = model.forward(&image, &question, false).unwrap_or_else(|e| {
        eprintln!("ERROR: forward pass failed: {e}");
        std::process::exit(1);
    });
    tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "forward pass done");

    println!("logits shape: {:?}", logits.dims());
    let answers = logits
        .argmax(1)
        .and_then(|t| t.to_dtype(DType::U32))
        .and_then(|t| t.to_vec1::<u32>())
        .unwrap_or_else(|e| {
            eprintln!("ERROR: failed to read logits: {e}");
            std::process::exit(1);
        });
    for (i, answer) in answers.iter().enumerate() {
        println!("example {i}: answer {answer}");
    }
}

fn random_tensor(rng: &mut StdRng, shape: &[usize], device: &Device) -> Tensor {
    let normal = Normal::new(0.0f32, 1.0).unwrap_or_else(|e| {
        eprintln!("ERROR: {e}");
        std::process::exit(1);
    });
    let count: usize = shape.iter().product();
    let data: Vec<f32> = (0..count).map(|_| normal.sample(rng)).collect();
    Tensor::from_vec(data, shape, device).unwrap_or_else(|e| {
        eprintln!("ERROR: failed to build input tensor: {e}");
        std::process::exit(1);
    })
}

struct CliConfig {
    config: Option<PathBuf>,
    batch: usize,
    height: Option<usize>,
    width: Option<usize>,
    tokens: usize,
    seed: u64,
}

fn parse_args(args: &[String]) -> CliConfig {
    let mut config = CliConfig {
        config: None,
        batch: 2,
        height: None,
        width: None,
        tokens: 8,
        seed: 42,
    };

    let mut i = 1;
    while i < args.len() {
        let flag = args[i].as_str();
        i += 1;
        let value = match args.get(i) {
            Some(value) => value.as_str(),
            None if flag == "--help" || flag == "-h" => "",
            None => {
                eprintln!("ERROR: missing value for {flag}");
                std::process::exit(1);
            }
        };
        match flag {
            "--config" => config.config = Some(PathBuf::from(value)),
            "--batch" => config.batch = parse_number(flag, value),
            "--height" => config.height = Some(parse_number(flag, value)),
            "--width" => config.width = Some(parse_number(flag, value)),
            "--tokens" => config.tokens = parse_number(flag, value),
            "--seed" => config.seed = parse_number(flag, value),
            "--help" | "-h" => {
                eprintln!("Usage: tmac-forward [--config PATH] [--batch N] [--height H] [--width W] [--tokens L] [--seed S]");
                std::process::exit(0);
            }
            other => {
                eprintln!("ERROR: unknown argument '{other}'");
                std::process::exit(1);
            }
        }
        i += 1;
    }

    if config.batch == 0 || config.tokens == 0 {
        eprintln!("ERROR: --batch and --tokens must be positive");
        std::process::exit(1);
    }
    config
}

fn parse_number<T: std::str::FromStr>(flag: &str, value: &str) -> T {
    value.parse().unwrap_or_else(|_| {
        eprintln!("ERROR: invalid {flag} value '{value}'");
        std::process::exit(1);
    })
}
