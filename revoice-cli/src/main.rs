//! Terminal host for the revoice engine.
//!
//! `revoice devices` prints the audio device inventory as JSON.
//! `revoice run --model <gen.onnx> ...` loads a model bundle, opens the
//! duplex stream and converts live until Enter is pressed.
//!
//! Built without the `onnx` feature the run command uses the built-in
//! stub backend, which is only useful for latency smoke tests.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use tracing::info;
use tracing_subscriber::EnvFilter;

use revoice_core::audio::device;
use revoice_core::session::backend::ConversionBackend;
use revoice_core::{
    ConversionSettings, PitchMethod, RevoiceEngine, StreamConfig,
};

#[derive(Debug)]
struct RunArgs {
    model: PathBuf,
    index: Option<PathBuf>,
    models_dir: PathBuf,
    embedder: String,
    speaker: u32,
    stream: StreamConfig,
    settings: ConversionSettings,
}

const USAGE: &str = "Usage:
  revoice devices
  revoice run --model <gen.onnx> [options]

Options for run:
  --index <file>          retrieval index file
  --models-dir <dir>      directory with embedder/pitch models (default: models)
  --embedder <name>       embedder model stem (default: contentvec)
  --speaker <n>           speaker id (default: 0)
  --input <name>          input device name
  --output <name>         output device name
  --sample-rate <hz>      device sample rate (default: 48000)
  --block-size <n>        device block size (default: 1024)
  --pitch <semitones>     pitch shift, -24..24 (default: 0)
  --method <m>            pitch method: rmvpe | fcpe | zero (default: rmvpe)
  --index-rate <r>        retrieval blend rate 0..1 (default: 0.75)
  --protect <r>           voiceless protection 0..0.5 (default: 0.33)
  --autotune              enable autotune
  --no-vad                disable the voice activity gate";

fn parse_run_args(mut it: std::env::Args) -> anyhow::Result<RunArgs> {
    let mut model: Option<PathBuf> = None;
    let mut index: Option<PathBuf> = None;
    let mut models_dir = PathBuf::from("models");
    let mut embedder = "contentvec".to_string();
    let mut speaker = 0u32;
    let mut stream = StreamConfig::default();
    let mut settings = ConversionSettings::default();

    while let Some(arg) = it.next() {
        let mut value = |name: &str| -> anyhow::Result<String> {
            it.next().with_context(|| format!("missing value for {name}"))
        };
        match arg.as_str() {
            "--model" => model = Some(PathBuf::from(value("--model")?)),
            "--index" => index = Some(PathBuf::from(value("--index")?)),
            "--models-dir" => models_dir = PathBuf::from(value("--models-dir")?),
            "--embedder" => embedder = value("--embedder")?,
            "--speaker" => speaker = value("--speaker")?.parse().context("invalid --speaker")?,
            "--input" => stream.input_device = Some(value("--input")?),
            "--output" => stream.output_device = Some(value("--output")?),
            "--sample-rate" => {
                stream.sample_rate = value("--sample-rate")?
                    .parse()
                    .context("invalid --sample-rate")?
            }
            "--block-size" => {
                stream.block_size = value("--block-size")?
                    .parse()
                    .context("invalid --block-size")?
            }
            "--pitch" => {
                settings.pitch_shift = value("--pitch")?.parse().context("invalid --pitch")?
            }
            "--method" => settings.pitch_method = PitchMethod::from_name(&value("--method")?),
            "--index-rate" => {
                settings.index_rate = value("--index-rate")?
                    .parse()
                    .context("invalid --index-rate")?
            }
            "--protect" => {
                settings.protect = value("--protect")?.parse().context("invalid --protect")?
            }
            "--autotune" => settings.autotune = true,
            "--no-vad" => settings.vad_enabled = false,
            "--help" | "-h" => {
                println!("{USAGE}");
                std::process::exit(0);
            }
            other => bail!("unknown argument: {other}"),
        }
    }

    let model = model.context("--model is required")?;
    Ok(RunArgs {
        model,
        index,
        models_dir,
        embedder,
        speaker,
        stream,
        settings,
    })
}

#[cfg(feature = "onnx")]
fn backend(models_dir: &std::path::Path) -> Arc<dyn ConversionBackend> {
    Arc::new(revoice_core::OnnxBackend::new(models_dir.to_path_buf()))
}

#[cfg(not(feature = "onnx"))]
fn backend(_models_dir: &std::path::Path) -> Arc<dyn ConversionBackend> {
    tracing::warn!("built without the onnx feature, using the stub backend");
    Arc::new(revoice_core::session::stub::StubBackend::new())
}

fn print_devices() -> anyhow::Result<()> {
    let mut devices = device::list_input_devices();
    devices.extend(device::list_output_devices());
    println!("{}", serde_json::to_string_pretty(&devices)?);
    Ok(())
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let engine = Arc::new(RevoiceEngine::new(
        args.stream.clone(),
        backend(&args.models_dir),
    ));
    engine.update_settings(args.settings.clone())?;

    info!(model = %args.model.display(), speaker = args.speaker, "loading resources");
    engine.load_resources(
        &args.model,
        args.index.as_deref(),
        args.speaker,
        &args.embedder,
    )?;

    let mut status_rx = engine.subscribe_status();
    tokio::spawn(async move {
        while let Ok(event) = status_rx.recv().await {
            if let Ok(json) = serde_json::to_string(&event) {
                println!("{json}");
            }
        }
    });

    engine.start()?;
    println!("converting — press Enter to stop");

    // Block on stdin off the async runtime.
    tokio::task::spawn_blocking(|| {
        let mut line = String::new();
        let _ = std::io::stdin().read_line(&mut line);
    })
    .await?;

    engine.stop()?;
    let snap = engine.diagnostics_snapshot();
    info!(
        blocks_in = snap.blocks_in,
        blocks_converted = snap.blocks_converted,
        blocks_gated = snap.blocks_gated,
        session_busy = snap.session_busy,
        "session summary"
    );
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut args = std::env::args();
    let _bin = args.next();
    match args.next().as_deref() {
        Some("devices") => print_devices(),
        Some("run") => run(parse_run_args(args)?).await,
        _ => {
            println!("{USAGE}");
            Ok(())
        }
    }
}
