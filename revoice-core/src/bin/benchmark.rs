//! Offline conversion latency benchmark.
//!
//! Feeds WAV fixtures through the chunk processor block by block, the
//! same way the stream scheduler would, and reports per-block latency
//! against the real-time deadline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;

use anyhow::{bail, Context};
use serde::Serialize;

use revoice_core::audio::resample::RateConverter;
use revoice_core::engine::processor::ChunkProcessor;
use revoice_core::session::stub::StubBackend;
use revoice_core::session::ResourceSession;
use revoice_core::{ConversionSettings, FEATURE_RATE};

#[derive(Debug)]
struct Args {
    fixtures_dir: PathBuf,
    block_size: usize,
    model: Option<PathBuf>,
    index: Option<PathBuf>,
    models_dir: Option<PathBuf>,
    output: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
struct FileResult {
    file: String,
    sample_rate: u32,
    blocks: usize,
    p50_latency_ms: f64,
    p95_latency_ms: f64,
    max_latency_ms: f64,
    deadline_ms: f64,
    deadline_misses: usize,
    output_peak: f32,
}

#[derive(Debug, Clone, Serialize)]
struct Summary {
    fixtures_dir: String,
    backend: String,
    block_size: usize,
    total_blocks: usize,
    p50_latency_ms: f64,
    p95_latency_ms: f64,
    deadline_miss_rate: f64,
    files: Vec<FileResult>,
}

const USAGE: &str = "Usage: benchmark --fixtures <dir> [--block-size <n>] \
[--output <file.json>] [--model <gen.onnx> --models-dir <dir> [--index <file>]]
The --model form requires building with the onnx feature.";

fn parse_args() -> anyhow::Result<Args> {
    let mut args = Args {
        fixtures_dir: PathBuf::from("benchmarks/fixtures"),
        block_size: 1024,
        model: None,
        index: None,
        models_dir: None,
        output: None,
    };

    let mut it = std::env::args().skip(1);
    while let Some(arg) = it.next() {
        let mut value = |name: &str| -> anyhow::Result<String> {
            it.next().with_context(|| format!("missing value for {name}"))
        };
        match arg.as_str() {
            "--fixtures" => args.fixtures_dir = PathBuf::from(value("--fixtures")?),
            "--block-size" => {
                args.block_size = value("--block-size")?
                    .parse::<usize>()
                    .context("invalid --block-size")?
                    .clamp(256, 8192);
            }
            "--model" => args.model = Some(PathBuf::from(value("--model")?)),
            "--index" => args.index = Some(PathBuf::from(value("--index")?)),
            "--models-dir" => args.models_dir = Some(PathBuf::from(value("--models-dir")?)),
            "--output" => args.output = Some(PathBuf::from(value("--output")?)),
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }
    Ok(args)
}

/// Recursively gather `.wav` paths under `root`, sorted for stable output.
fn collect_wavs(root: &Path) -> anyhow::Result<Vec<PathBuf>> {
    let mut stack = vec![root.to_path_buf()];
    let mut wavs = Vec::new();
    while let Some(dir) = stack.pop() {
        for entry in std::fs::read_dir(&dir)
            .with_context(|| format!("reading {}", dir.display()))?
        {
            let path = entry?.path();
            if path.is_dir() {
                stack.push(path);
            } else if path
                .extension()
                .is_some_and(|e| e.eq_ignore_ascii_case("wav"))
            {
                wavs.push(path);
            }
        }
    }
    wavs.sort();
    Ok(wavs)
}

/// Decode a WAV fixture to mono f32, averaging channels.
fn read_wav_mono_f32(path: &Path) -> anyhow::Result<(Vec<f32>, u32)> {
    let mut reader =
        hound::WavReader::open(path).with_context(|| format!("opening {}", path.display()))?;
    let spec = reader.spec();
    let channels = usize::from(spec.channels.max(1));

    let interleaved: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Float => {
            reader.samples::<f32>().collect::<Result<_, _>>()?
        }
        hound::SampleFormat::Int => {
            let scale = 1.0 / ((1_i64 << (spec.bits_per_sample - 1)) - 1) as f32;
            reader
                .samples::<i32>()
                .map(|s| s.map(|v| v as f32 * scale))
                .collect::<Result<_, _>>()?
        }
    };

    if channels == 1 {
        return Ok((interleaved, spec.sample_rate));
    }
    let mono = interleaved
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / channels as f32)
        .collect();
    Ok((mono, spec.sample_rate))
}

fn percentile(sorted: &[f64], p: f64) -> f64 {
    match sorted.len() {
        0 => 0.0,
        n => sorted[(((n - 1) as f64) * p.clamp(0.0, 1.0)).round() as usize],
    }
}

fn sorted(values: &[f64]) -> Vec<f64> {
    let mut v = values.to_vec();
    v.sort_by(f64::total_cmp);
    v
}

fn build_session(args: &Args) -> anyhow::Result<(ResourceSession, &'static str)> {
    if let (Some(model), Some(models_dir)) = (&args.model, &args.models_dir) {
        #[cfg(feature = "onnx")]
        {
            let backend = revoice_core::OnnxBackend::new(models_dir.clone());
            let mut session = ResourceSession::new(Arc::new(backend));
            session.load_all(model, args.index.as_deref(), 0, "contentvec")?;
            return Ok((session, "onnx"));
        }
        #[cfg(not(feature = "onnx"))]
        {
            let _ = (model, models_dir);
            bail!("--model requires building with the onnx feature");
        }
    }
    let mut session = ResourceSession::new(Arc::new(StubBackend::new()));
    session.load_all(Path::new("stub.onnx"), None, 0, "contentvec")?;
    Ok((session, "stub"))
}

fn run() -> anyhow::Result<()> {
    let args = parse_args()?;
    let wav_files = collect_wavs(&args.fixtures_dir)
        .with_context(|| format!("scanning {}", args.fixtures_dir.display()))?;
    if wav_files.is_empty() {
        bail!("no .wav fixtures under {}", args.fixtures_dir.display());
    }

    let (mut session, backend_name) = build_session(&args)?;
    let snapshot = session
        .snapshot()
        .context("session did not become ready")?;
    let settings = ConversionSettings::default();
    let mut processor = ChunkProcessor::new();

    println!(
        "revoice benchmark: {} fixtures, backend={backend_name}, block_size={}",
        wav_files.len(),
        args.block_size
    );

    let mut files = Vec::new();
    let mut all_latencies = Vec::new();
    let mut total_misses = 0usize;
    for wav in &wav_files {
        let (samples, sample_rate) = read_wav_mono_f32(wav)?;
        let deadline_ms = args.block_size as f64 / sample_rate as f64 * 1000.0;
        let mut converter = RateConverter::new(sample_rate, FEATURE_RATE, args.block_size)?;

        let mut latencies = Vec::new();
        let mut misses = 0usize;
        let mut peak = 0f32;
        for block in samples.chunks(args.block_size) {
            let started = Instant::now();
            let feature_input = converter.process(block);
            if !feature_input.is_empty() {
                let out = processor.process(&snapshot, &settings, &feature_input);
                peak = out.iter().fold(peak, |m, s| m.max(s.abs()));
            }
            let latency_ms = started.elapsed().as_secs_f64() * 1000.0;
            misses += usize::from(latency_ms > deadline_ms);
            latencies.push(latency_ms);
        }

        let name = wav
            .strip_prefix(&args.fixtures_dir)
            .unwrap_or(wav)
            .display()
            .to_string();
        let by_rank = sorted(&latencies);
        println!(
            "{name}: {} blocks p50={:.2}ms p95={:.2}ms deadline={:.2}ms misses={misses}",
            latencies.len(),
            percentile(&by_rank, 0.50),
            percentile(&by_rank, 0.95),
            deadline_ms
        );

        total_misses += misses;
        all_latencies.extend_from_slice(&latencies);
        files.push(FileResult {
            file: name,
            sample_rate,
            blocks: latencies.len(),
            p50_latency_ms: percentile(&by_rank, 0.50),
            p95_latency_ms: percentile(&by_rank, 0.95),
            max_latency_ms: by_rank.last().copied().unwrap_or(0.0),
            deadline_ms,
            deadline_misses: misses,
            output_peak: peak,
        });
    }

    let by_rank = sorted(&all_latencies);
    let summary = Summary {
        fixtures_dir: args.fixtures_dir.display().to_string(),
        backend: backend_name.to_string(),
        block_size: args.block_size,
        total_blocks: all_latencies.len(),
        p50_latency_ms: percentile(&by_rank, 0.50),
        p95_latency_ms: percentile(&by_rank, 0.95),
        deadline_miss_rate: if all_latencies.is_empty() {
            0.0
        } else {
            total_misses as f64 / all_latencies.len() as f64
        },
        files,
    };

    println!(
        "done: blocks={} p50={:.2}ms p95={:.2}ms miss_rate={:.1}%",
        summary.total_blocks,
        summary.p50_latency_ms,
        summary.p95_latency_ms,
        summary.deadline_miss_rate * 100.0
    );

    let json = serde_json::to_string_pretty(&summary)?;
    match args.output {
        Some(out) => {
            if let Some(parent) = out.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&out, json)?;
            println!("report written to {}", out.display());
        }
        None => println!("{json}"),
    }
    Ok(())
}

fn main() {
    if let Err(e) = run() {
        eprintln!("benchmark failed: {e:#}");
        std::process::exit(1);
    }
}
