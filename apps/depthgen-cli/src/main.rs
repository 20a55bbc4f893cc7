use std::collections::BTreeMap;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use depthgen_core::{
    resolve_runtime_config, run_prediction_with_telemetry, ExecutionProvider, GenerationBackend, GpuBackendPreference,
    OnnxVariant, PredictRequest, RuntimeConfig, TelemetryEvent, TelemetryEventType, TelemetrySink, DEFAULT_CONDITION_SCALE,
    DEFAULT_NUM_INFERENCE_STEPS, DEFAULT_PROMPT, DEFAULT_SEED,
};
use depthgen_image::resolve_resolution;
use depthgen_installer::{install_models, models_installed, verify_models, InstallRequest};
use depthgen_model_registry::KnownModel;
use depthgen_runtime_ort::{placeholder_fallback_allowed, OrtPipeline, PipelineConfig, PlaceholderBackend};
use depthgen_telemetry::sink_from_env;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[derive(Parser, Debug)]
#[command(name = "depthgen", version, about = "Depth-conditioned SDXL image generation")]
struct Cli {
    /// Enable debug logging.
    #[arg(long, short = 'v', global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: TopLevelCommand,
}

#[derive(Subcommand, Debug)]
enum TopLevelCommand {
    /// Generate an image from a depth map and a prompt.
    Predict(PredictArgs),
    /// Print the output resolution an input size snaps to.
    Snap(SnapArgs),
    Models(ModelsCommand),
}

#[derive(Args, Debug)]
struct ModelsCommand {
    #[command(subcommand)]
    command: ModelsSubcommand,
}

#[derive(Subcommand, Debug)]
enum ModelsSubcommand {
    Install(InstallArgs),
    List(CommonModelArgs),
    Verify(CommonModelArgs),
    Update(UpdateArgs),
}

#[derive(Args, Debug)]
struct CommonModelArgs {
    #[arg(long)]
    model_dir: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct InstallArgs {
    #[arg(long)]
    all: bool,
    #[arg(long = "model")]
    models: Vec<String>,
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long, default_value = "HF_TOKEN")]
    hf_token_env: String,
    /// `NAME=REVISION`, e.g. `sdxl=main`.
    #[arg(long = "revision")]
    revisions: Vec<String>,
    /// `NAME=REPO` to download an ONNX export instead of the canonical repository.
    #[arg(long = "repo")]
    repos: Vec<String>,
    #[arg(long)]
    verify_only: bool,
    #[arg(long, default_value = "fp16")]
    onnx_variant: String,
}

#[derive(Args, Debug)]
struct UpdateArgs {
    #[arg(long = "model")]
    models: Vec<String>,
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long, default_value = "HF_TOKEN")]
    hf_token_env: String,
    #[arg(long = "repo")]
    repos: Vec<String>,
    #[arg(long, default_value = "fp16")]
    onnx_variant: String,
}

#[derive(Args, Debug)]
struct PredictArgs {
    /// Depth image used as the ControlNet conditioning.
    #[arg(long, short = 'i')]
    image: PathBuf,
    #[arg(long, short = 'p', default_value = DEFAULT_PROMPT)]
    prompt: String,
    #[arg(long, short = 'n', default_value_t = DEFAULT_NUM_INFERENCE_STEPS)]
    num_inference_steps: u32,
    #[arg(long, short = 'c', default_value_t = DEFAULT_CONDITION_SCALE)]
    condition_scale: f32,
    /// Zero or negative picks a random seed.
    #[arg(long, short = 's', default_value_t = DEFAULT_SEED, allow_negative_numbers = true)]
    seed: i64,
    /// Output PNG path (defaults to `output.png` in the system temp directory).
    #[arg(long, short = 'o')]
    output: Option<PathBuf>,
    /// Derive the depth map from the input photo instead of using the input as-is.
    #[arg(long)]
    estimate_depth: bool,
    #[arg(long)]
    model_dir: Option<PathBuf>,
    #[arg(long)]
    execution_provider: Option<String>,
    #[arg(long)]
    gpu_backend: Option<String>,
    #[arg(long)]
    onnx_variant: Option<String>,
    /// `NAME=REPO` used when missing models are installed before generating.
    #[arg(long = "repo")]
    repos: Vec<String>,
    #[arg(long)]
    profile: bool,
}

#[derive(Args, Debug)]
struct SnapArgs {
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    width: u32,
    #[arg(long, value_parser = clap::value_parser!(u32).range(1..))]
    height: u32,
}

fn main() -> ExitCode {
    let cli = Cli::parse();

    let log_level = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| log_level.into()))
        .with(
            tracing_subscriber::fmt::layer()
                .with_target(false)
                .with_writer(std::io::stderr),
        )
        .init();

    if let Err(err) = run(cli.command) {
        tracing::error!("{err:#}");
        return ExitCode::FAILURE;
    }
    ExitCode::SUCCESS
}

fn run(command: TopLevelCommand) -> Result<()> {
    match command {
        TopLevelCommand::Predict(args) => predict(args),
        TopLevelCommand::Snap(args) => {
            let snapped = resolve_resolution(args.width, args.height);
            println!(
                "{}",
                serde_json::json!({ "width": snapped.width, "height": snapped.height })
            );
            Ok(())
        }
        TopLevelCommand::Models(models) => match models.command {
            ModelsSubcommand::Install(args) => {
                let report = install_models(&InstallRequest {
                    model_dir: args.model_dir,
                    install_all: args.all,
                    models: parse_models_for_install(&args.models)?,
                    hf_token_env: args.hf_token_env,
                    revisions: parse_model_pairs("--revision", &args.revisions)?,
                    repos: parse_model_pairs("--repo", &args.repos)?,
                    verify_only: args.verify_only,
                    onnx_variant: parse_onnx_variant(&args.onnx_variant)?,
                    force: false,
                })?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
            ModelsSubcommand::List(args) => {
                let lock = verify_models(args.model_dir)?;
                println!("{}", serde_json::to_string_pretty(&lock.models)?);
                Ok(())
            }
            ModelsSubcommand::Verify(args) => {
                let lock = verify_models(args.model_dir)?;
                println!("{}", serde_json::to_string_pretty(&lock)?);
                Ok(())
            }
            ModelsSubcommand::Update(args) => {
                let report = install_models(&update_install_request(args)?)?;
                println!("{}", serde_json::to_string_pretty(&report)?);
                Ok(())
            }
        },
    }
}

/// `models update` re-downloads at `main`, replacing whatever is installed.
fn update_install_request(args: UpdateArgs) -> Result<InstallRequest> {
    let parsed = parse_models_for_install(&args.models)?;
    Ok(InstallRequest {
        model_dir: args.model_dir,
        install_all: parsed.is_empty() || args.models.iter().any(|m| m.eq_ignore_ascii_case("all")),
        models: parsed,
        hf_token_env: args.hf_token_env,
        revisions: BTreeMap::new(),
        repos: parse_model_pairs("--repo", &args.repos)?,
        verify_only: false,
        onnx_variant: parse_onnx_variant(&args.onnx_variant)?,
        force: true,
    })
}

fn predict(args: PredictArgs) -> Result<()> {
    let total_start = Instant::now();
    set_ort_dylib_path_if_available();

    let output = args.output.clone().unwrap_or_else(|| std::env::temp_dir().join("output.png"));
    validate_output_extension(&output)?;

    let runtime_cfg = resolve_runtime_config(
        RuntimeConfig::from_env(),
        RuntimeConfig {
            onnx_variant: args.onnx_variant.clone().unwrap_or_default(),
            execution_provider: args.execution_provider.clone().unwrap_or_default(),
            gpu_backend: args.gpu_backend.clone().unwrap_or_default(),
            model_dir: args.model_dir.as_ref().map(|path| path.display().to_string()),
        },
    );
    let pipeline_cfg = PipelineConfig {
        model_dir: runtime_cfg.model_dir.clone().map(PathBuf::from),
        onnx_variant: parse_onnx_variant(&runtime_cfg.onnx_variant)?,
        execution_provider: parse_execution_provider(&runtime_cfg.execution_provider)?,
        gpu_backend: parse_gpu_backend(&runtime_cfg.gpu_backend)?,
        ..PipelineConfig::default()
    };
    let repos = parse_model_pairs("--repo", &args.repos)?;

    let source = std::fs::read(&args.image).with_context(|| format!("failed to read input {}", args.image.display()))?;
    let (width, height) = image::ImageReader::new(Cursor::new(&source))
        .with_guessed_format()?
        .into_dimensions()
        .with_context(|| format!("failed to decode input {}", args.image.display()))?;
    let read_done = Instant::now();

    let telemetry = sink_from_env();
    let telemetry_ref = telemetry.as_ref().map(|sink| sink.as_ref());
    let backend = load_backend(&pipeline_cfg, &repos, telemetry_ref)?;
    let setup_done = Instant::now();

    let request = PredictRequest {
        input_path: Some(args.image.clone()),
        input_bytes: Some(source),
        width,
        height,
        prompt: args.prompt,
        num_inference_steps: args.num_inference_steps,
        condition_scale: args.condition_scale,
        seed: args.seed,
        estimate_depth: args.estimate_depth,
    };
    let result = run_prediction_with_telemetry(backend.as_ref(), &request, telemetry_ref)?;
    let inference_done = Instant::now();

    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(&output, &result.image_png).with_context(|| format!("failed to write {}", output.display()))?;
    let done = Instant::now();

    let timings = args.profile.then(|| {
        serde_json::json!({
            "readInput": read_done.duration_since(total_start).as_millis(),
            "setup": setup_done.duration_since(read_done).as_millis(),
            "inference": inference_done.duration_since(setup_done).as_millis(),
            "writeOutput": done.duration_since(inference_done).as_millis(),
            "total": done.duration_since(total_start).as_millis(),
        })
    });
    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "outputPath": output,
            "seed": result.seed.value,
            "seedRandomized": result.seed.randomized,
            "sourceWidth": result.source_width,
            "sourceHeight": result.source_height,
            "width": result.width,
            "height": result.height,
            "providerSelected": result.execution_provider_selected,
            "backendSelected": result.gpu_backend_selected,
            "fallbackUsed": result.fallback_used,
            "timingsMs": timings,
        }))?
    );
    Ok(())
}

/// Installs missing models, then loads every session once. With `DEPTHGEN_ALLOW_PLACEHOLDER`
/// set, a missing or unloadable model set falls back to the placeholder backend instead.
fn load_backend(
    config: &PipelineConfig,
    repos: &BTreeMap<KnownModel, String>,
    telemetry: Option<&dyn TelemetrySink>,
) -> Result<Box<dyn GenerationBackend>> {
    let start = Instant::now();
    emit(telemetry, TelemetryEventType::SetupStart, None, None);

    let placeholder_allowed = placeholder_fallback_allowed();
    let loaded = if placeholder_allowed && !models_installed(config.model_dir.as_deref(), &KnownModel::all())? {
        Err(anyhow!("models are not installed"))
    } else {
        ensure_models_for_predict(config, repos).and_then(|_| OrtPipeline::load(config))
    };

    match loaded {
        Ok(pipeline) => {
            let (provider, backend) = pipeline.provider().report_labels();
            emit(
                telemetry,
                TelemetryEventType::SetupSuccess,
                Some(start.elapsed().as_millis() as u64),
                Some(format!("provider={},backend={}", provider, backend.unwrap_or_else(|| "none".to_string()))),
            );
            Ok(Box::new(pipeline))
        }
        Err(err) if placeholder_allowed => {
            tracing::warn!(error = %format!("{err:#}"), "using placeholder backend");
            emit(
                telemetry,
                TelemetryEventType::SetupSuccess,
                Some(start.elapsed().as_millis() as u64),
                Some("provider=placeholder".to_string()),
            );
            Ok(Box::new(PlaceholderBackend))
        }
        Err(err) => {
            emit(
                telemetry,
                TelemetryEventType::SetupError,
                Some(start.elapsed().as_millis() as u64),
                Some(format!("{err:#}")),
            );
            Err(err)
        }
    }
}

fn emit(telemetry: Option<&dyn TelemetrySink>, event_type: TelemetryEventType, duration_ms: Option<u64>, detail: Option<String>) {
    if let Some(sink) = telemetry {
        sink.emit(TelemetryEvent {
            event_type,
            duration_ms,
            detail,
        });
    }
}

fn ensure_models_for_predict(config: &PipelineConfig, repos: &BTreeMap<KnownModel, String>) -> Result<()> {
    let required = KnownModel::all();
    if models_installed(config.model_dir.as_deref(), &required)? {
        return Ok(());
    }
    tracing::info!("installing required models before prediction");
    let report = install_models(&predict_install_request(config, repos)).context(
        "automatic model install failed; run `depthgen models install --repo NAME=REPO` with ONNX exports of each model",
    )?;
    tracing::info!(installed = report.installed.len(), skipped = report.skipped.len(), "model install step completed");
    Ok(())
}

fn predict_install_request(config: &PipelineConfig, repos: &BTreeMap<KnownModel, String>) -> InstallRequest {
    InstallRequest {
        model_dir: config.model_dir.clone(),
        install_all: false,
        models: KnownModel::all().to_vec(),
        hf_token_env: "HF_TOKEN".to_string(),
        revisions: BTreeMap::new(),
        repos: repos.clone(),
        verify_only: false,
        onnx_variant: config.onnx_variant,
        force: false,
    }
}

fn set_ort_dylib_path_if_available() {
    if std::env::var("ORT_DYLIB_PATH").is_ok() {
        return;
    }
    let lib_name = if cfg!(target_os = "windows") {
        "onnxruntime.dll"
    } else if cfg!(target_os = "macos") || cfg!(target_os = "ios") {
        "libonnxruntime.dylib"
    } else {
        "libonnxruntime.so"
    };
    if let Some(exe_candidate) = discover_ort_next_to_executable(lib_name) {
        std::env::set_var("ORT_DYLIB_PATH", exe_candidate);
        return;
    }
    if let Some(path) = std::env::var_os("PATH") {
        for dir in std::env::split_paths(&path) {
            if cfg!(target_os = "windows") && dir.to_string_lossy().to_ascii_lowercase().contains("windows\\system32") {
                continue;
            }
            let candidate = dir.join(lib_name);
            if candidate.exists() {
                tracing::debug!(path = %candidate.display(), "using onnxruntime from PATH");
                std::env::set_var("ORT_DYLIB_PATH", candidate);
                break;
            }
        }
    }
}

fn discover_ort_next_to_executable(lib_name: &str) -> Option<PathBuf> {
    let exe = std::env::current_exe().ok()?;
    let candidate = exe.parent()?.join(lib_name);
    candidate.exists().then_some(candidate)
}

fn parse_model_name(value: &str) -> Result<Option<KnownModel>> {
    let parsed = match value.trim().to_ascii_lowercase().as_str() {
        "controlnet" | "controlnet-depth" => KnownModel::ControlNetDepth,
        "vae" => KnownModel::VaeFp16Fix,
        "sdxl" | "base" => KnownModel::SdxlBase,
        "depth-estimator" | "dpt" | "feature" => KnownModel::DptHybridMidas,
        "all" => return Ok(None),
        other => {
            return Err(anyhow!(
                "unknown model '{}'; expected one of: controlnet, vae, sdxl, depth-estimator, all",
                other
            ))
        }
    };
    Ok(Some(parsed))
}

fn parse_models_for_install(models: &[String]) -> Result<Vec<KnownModel>> {
    let mut out = Vec::with_capacity(models.len());
    for model in models {
        if let Some(parsed) = parse_model_name(model)? {
            if !out.contains(&parsed) {
                out.push(parsed);
            }
        }
    }
    Ok(out)
}

/// Parses repeated `NAME=VALUE` flags keyed by model name.
fn parse_model_pairs(flag: &str, values: &[String]) -> Result<BTreeMap<KnownModel, String>> {
    let mut out = BTreeMap::new();
    for raw in values {
        let (name, value) = raw
            .split_once('=')
            .ok_or_else(|| anyhow!("{} expects NAME=VALUE (received: '{}')", flag, raw))?;
        let value = value.trim();
        if value.is_empty() {
            return Err(anyhow!("{} has an empty value for '{}'", flag, name));
        }
        match parse_model_name(name)? {
            Some(model) => {
                out.insert(model, value.to_string());
            }
            None => {
                for model in KnownModel::all() {
                    out.insert(model, value.to_string());
                }
            }
        }
    }
    Ok(out)
}

fn parse_onnx_variant(value: &str) -> Result<OnnxVariant> {
    match value.to_ascii_lowercase().as_str() {
        "fp16" => Ok(OnnxVariant::Fp16),
        "fp32" => Ok(OnnxVariant::Fp32),
        "quantized" | "q8" => Ok(OnnxVariant::Quantized),
        "auto" => Ok(OnnxVariant::Auto),
        other => Err(anyhow!(
            "unknown onnx variant '{}'; expected one of: fp16, fp32, quantized, auto",
            other
        )),
    }
}

fn parse_execution_provider(value: &str) -> Result<ExecutionProvider> {
    match value.to_ascii_lowercase().as_str() {
        "auto" => Ok(ExecutionProvider::Auto),
        "gpu" => Ok(ExecutionProvider::Gpu),
        "cpu" => Ok(ExecutionProvider::Cpu),
        other => Err(anyhow!(
            "unknown execution provider '{}'; expected one of: auto, gpu, cpu",
            other
        )),
    }
}

fn parse_gpu_backend(value: &str) -> Result<GpuBackendPreference> {
    match value.to_ascii_lowercase().as_str() {
        "auto" => Ok(GpuBackendPreference::Auto),
        "directml" => Ok(GpuBackendPreference::DirectML),
        "cuda" => Ok(GpuBackendPreference::Cuda),
        "coreml" => Ok(GpuBackendPreference::CoreML),
        "metal" => Ok(GpuBackendPreference::Metal),
        other => Err(anyhow!(
            "unknown gpu backend '{}'; expected one of: auto, directml, cuda, coreml, metal",
            other
        )),
    }
}

fn validate_output_extension(path: &Path) -> Result<()> {
    let is_png = path
        .extension()
        .and_then(|e| e.to_str())
        .map(|e| e.eq_ignore_ascii_case("png"))
        .unwrap_or(false);
    if !is_png {
        return Err(anyhow!("output must be a .png file (received: '{}')", path.display()));
    }
    Ok(())
}
