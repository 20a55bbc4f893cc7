use std::ops::RangeInclusive;
use std::path::PathBuf;
use std::time::Instant;

use depthgen_image::{resolve_resolution, Resolution};
use rand::{Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DEFAULT_PROMPT: &str = "isometric restaurant interior, table and chairs at the centre with a tea set, plants hung from the walls, arched window on the right. Art deco. Glamorous, Luxurious, Elegant, Stylish, gold trim, scallop motifs, antique, 20th century decor, 20s style";
pub const DEFAULT_NUM_INFERENCE_STEPS: u32 = 30;
pub const NUM_INFERENCE_STEPS_RANGE: RangeInclusive<u32> = 1..=100;
pub const DEFAULT_CONDITION_SCALE: f32 = 0.5;
pub const CONDITION_SCALE_RANGE: RangeInclusive<f32> = 0.0..=1.0;
pub const DEFAULT_SEED: i64 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum OnnxVariant {
    Fp16,
    Fp32,
    Quantized,
    Auto,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ExecutionProvider {
    Auto,
    Gpu,
    Cpu,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum GpuBackendPreference {
    Auto,
    DirectML,
    Cuda,
    CoreML,
    Metal,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PredictRequest {
    pub input_path: Option<PathBuf>,
    pub input_bytes: Option<Vec<u8>>,
    pub width: u32,
    pub height: u32,
    pub prompt: String,
    pub num_inference_steps: u32,
    pub condition_scale: f32,
    pub seed: i64,
    pub estimate_depth: bool,
}

impl Default for PredictRequest {
    fn default() -> Self {
        Self {
            input_path: None,
            input_bytes: None,
            width: 0,
            height: 0,
            prompt: DEFAULT_PROMPT.to_string(),
            num_inference_steps: DEFAULT_NUM_INFERENCE_STEPS,
            condition_scale: DEFAULT_CONDITION_SCALE,
            seed: DEFAULT_SEED,
            estimate_depth: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedSeed {
    pub value: u64,
    pub randomized: bool,
}

/// Everything a backend needs to render one image, with the seed and output size already decided.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub prompt: String,
    pub num_inference_steps: u32,
    pub condition_scale: f32,
    pub seed: u64,
    pub resolution: Resolution,
    pub estimate_depth: bool,
}

#[derive(Debug, Clone)]
pub struct GeneratedImage {
    pub png: Vec<u8>,
    pub width: u32,
    pub height: u32,
    pub execution_provider_selected: String,
    pub gpu_backend_selected: Option<String>,
    pub fallback_used: bool,
}

#[derive(Debug, Clone)]
pub struct PredictionResult {
    pub seed: ResolvedSeed,
    pub source_width: u32,
    pub source_height: u32,
    pub width: u32,
    pub height: u32,
    pub image_png: Vec<u8>,
    pub execution_provider_selected: String,
    pub gpu_backend_selected: Option<String>,
    pub fallback_used: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TelemetryEventType {
    SetupStart,
    SetupSuccess,
    SetupError,
    PredictionStart,
    PredictionSuccess,
    PredictionError,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryEvent {
    pub event_type: TelemetryEventType,
    pub duration_ms: Option<u64>,
    pub detail: Option<String>,
}

pub trait TelemetrySink: Send + Sync {
    fn emit(&self, event: TelemetryEvent);
}

pub trait GenerationBackend: Send + Sync {
    fn generate(&self, request: &PredictRequest, job: &GenerationJob) -> Result<GeneratedImage, CoreError>;
}

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("invalid parameter {name}: {reason}")]
    InvalidParameter { name: &'static str, reason: String },
    #[error("missing input bytes and input path")]
    MissingInput,
    #[error("input image has no pixels ({width}x{height})")]
    EmptyImage { width: u32, height: u32 },
    #[error("backend error: {0}")]
    Backend(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimeConfig {
    pub onnx_variant: String,
    pub execution_provider: String,
    pub gpu_backend: String,
    pub model_dir: Option<String>,
}

impl Default for RuntimeConfig {
    fn default() -> Self {
        Self {
            onnx_variant: "fp16".to_string(),
            execution_provider: "auto".to_string(),
            gpu_backend: "auto".to_string(),
            model_dir: None,
        }
    }
}

impl RuntimeConfig {
    /// Defaults overlaid with any `DEPTHGEN_*` variables set in the environment.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let overrides = RuntimeConfig {
            onnx_variant: lookup("DEPTHGEN_ONNX_VARIANT").unwrap_or_default(),
            execution_provider: lookup("DEPTHGEN_EXECUTION_PROVIDER").unwrap_or_default(),
            gpu_backend: lookup("DEPTHGEN_GPU_BACKEND").unwrap_or_default(),
            model_dir: lookup("DEPTHGEN_MODEL_DIR").filter(|v| !v.trim().is_empty()),
        };
        resolve_runtime_config(RuntimeConfig::default(), overrides)
    }
}

pub fn resolve_runtime_config(base: RuntimeConfig, overrides: RuntimeConfig) -> RuntimeConfig {
    let mut cfg = base;
    if !overrides.onnx_variant.trim().is_empty() {
        cfg.onnx_variant = overrides.onnx_variant;
    }
    if !overrides.execution_provider.trim().is_empty() {
        cfg.execution_provider = overrides.execution_provider;
    }
    if !overrides.gpu_backend.trim().is_empty() {
        cfg.gpu_backend = overrides.gpu_backend;
    }
    if overrides.model_dir.is_some() {
        cfg.model_dir = overrides.model_dir;
    }
    cfg
}

pub fn validate_request(request: &PredictRequest) -> Result<(), CoreError> {
    if request.input_bytes.is_none() && request.input_path.is_none() {
        return Err(CoreError::MissingInput);
    }
    if request.width == 0 || request.height == 0 {
        return Err(CoreError::EmptyImage {
            width: request.width,
            height: request.height,
        });
    }
    if !NUM_INFERENCE_STEPS_RANGE.contains(&request.num_inference_steps) {
        return Err(CoreError::InvalidParameter {
            name: "num_inference_steps",
            reason: format!(
                "must be between {} and {} (got {})",
                NUM_INFERENCE_STEPS_RANGE.start(),
                NUM_INFERENCE_STEPS_RANGE.end(),
                request.num_inference_steps
            ),
        });
    }
    if !CONDITION_SCALE_RANGE.contains(&request.condition_scale) {
        return Err(CoreError::InvalidParameter {
            name: "condition_scale",
            reason: format!(
                "must be between {:.1} and {:.1} (got {})",
                CONDITION_SCALE_RANGE.start(),
                CONDITION_SCALE_RANGE.end(),
                request.condition_scale
            ),
        });
    }
    Ok(())
}

/// Non-positive seeds are replaced with a fresh 16-bit value from OS entropy.
pub fn resolve_seed(seed: i64) -> ResolvedSeed {
    if seed > 0 {
        return ResolvedSeed {
            value: seed as u64,
            randomized: false,
        };
    }
    let mut rng = rand::rngs::StdRng::from_os_rng();
    resolve_seed_with(seed, &mut rng)
}

pub fn resolve_seed_with<R: Rng + ?Sized>(seed: i64, rng: &mut R) -> ResolvedSeed {
    if seed > 0 {
        ResolvedSeed {
            value: seed as u64,
            randomized: false,
        }
    } else {
        ResolvedSeed {
            value: u64::from(rng.random_range(1..=u16::MAX)),
            randomized: true,
        }
    }
}

pub fn run_prediction(backend: &dyn GenerationBackend, request: &PredictRequest) -> Result<PredictionResult, CoreError> {
    run_prediction_with_telemetry(backend, request, None)
}

pub fn run_prediction_with_telemetry(
    backend: &dyn GenerationBackend,
    request: &PredictRequest,
    telemetry: Option<&dyn TelemetrySink>,
) -> Result<PredictionResult, CoreError> {
    validate_request(request)?;
    let start = Instant::now();
    if let Some(sink) = telemetry {
        sink.emit(TelemetryEvent {
            event_type: TelemetryEventType::PredictionStart,
            duration_ms: None,
            detail: None,
        });
    }

    let seed = resolve_seed(request.seed);
    tracing::info!(seed = seed.value, randomized = seed.randomized, "using seed");
    let resolution = resolve_resolution(request.width, request.height);
    let aspect_ratio = request.width as f64 / request.height as f64;
    tracing::info!(
        source_width = request.width,
        source_height = request.height,
        aspect_ratio = %format!("{aspect_ratio:.2}"),
        width = resolution.width,
        height = resolution.height,
        "snapped output resolution"
    );

    let job = GenerationJob {
        prompt: request.prompt.clone(),
        num_inference_steps: request.num_inference_steps,
        condition_scale: request.condition_scale,
        seed: seed.value,
        resolution,
        estimate_depth: request.estimate_depth,
    };

    match backend.generate(request, &job) {
        Ok(image) => {
            if let Some(sink) = telemetry {
                sink.emit(TelemetryEvent {
                    event_type: TelemetryEventType::PredictionSuccess,
                    duration_ms: Some(start.elapsed().as_millis() as u64),
                    detail: Some(format!(
                        "seed={},size={}x{},provider={},backend={},fallback={}",
                        seed.value,
                        image.width,
                        image.height,
                        image.execution_provider_selected,
                        image.gpu_backend_selected.clone().unwrap_or_else(|| "none".to_string()),
                        image.fallback_used
                    )),
                });
            }
            Ok(PredictionResult {
                seed,
                source_width: request.width,
                source_height: request.height,
                width: image.width,
                height: image.height,
                image_png: image.png,
                execution_provider_selected: image.execution_provider_selected,
                gpu_backend_selected: image.gpu_backend_selected,
                fallback_used: image.fallback_used,
            })
        }
        Err(err) => {
            if let Some(sink) = telemetry {
                sink.emit(TelemetryEvent {
                    event_type: TelemetryEventType::PredictionError,
                    duration_ms: Some(start.elapsed().as_millis() as u64),
                    detail: Some(err.to_string()),
                });
            }
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;

    #[derive(Default)]
    struct RecordingBackend {
        jobs: Mutex<Vec<GenerationJob>>,
    }

    impl GenerationBackend for RecordingBackend {
        fn generate(&self, _request: &PredictRequest, job: &GenerationJob) -> Result<GeneratedImage, CoreError> {
            self.jobs.lock().expect("jobs lock").push(job.clone());
            Ok(GeneratedImage {
                png: vec![1, 2, 3],
                width: job.resolution.width,
                height: job.resolution.height,
                execution_provider_selected: "cpu".to_string(),
                gpu_backend_selected: None,
                fallback_used: false,
            })
        }
    }

    struct FailingBackend;

    impl GenerationBackend for FailingBackend {
        fn generate(&self, _request: &PredictRequest, _job: &GenerationJob) -> Result<GeneratedImage, CoreError> {
            Err(CoreError::Backend("out of device memory".to_string()))
        }
    }

    #[derive(Default)]
    struct CollectingSink {
        events: Mutex<Vec<TelemetryEventType>>,
    }

    impl TelemetrySink for CollectingSink {
        fn emit(&self, event: TelemetryEvent) {
            self.events.lock().expect("events lock").push(event.event_type);
        }
    }

    fn request(width: u32, height: u32) -> PredictRequest {
        PredictRequest {
            input_path: Some(PathBuf::from("depth.png")),
            width,
            height,
            ..PredictRequest::default()
        }
    }

    #[test]
    fn defaults_match_predictor_inputs() {
        let req = PredictRequest::default();
        assert_eq!(req.num_inference_steps, 30);
        assert_eq!(req.condition_scale, 0.5);
        assert_eq!(req.seed, 0);
        assert!(req.prompt.starts_with("isometric restaurant interior"));
    }

    #[test]
    fn validation_rejects_out_of_range_parameters() {
        let mut req = request(512, 512);
        req.num_inference_steps = 0;
        assert!(matches!(
            validate_request(&req),
            Err(CoreError::InvalidParameter { name: "num_inference_steps", .. })
        ));
        req.num_inference_steps = 101;
        assert!(validate_request(&req).is_err());
        req.num_inference_steps = 100;
        assert!(validate_request(&req).is_ok());

        for scale in [-0.1f32, 1.1, f32::NAN] {
            req.condition_scale = scale;
            assert!(matches!(
                validate_request(&req),
                Err(CoreError::InvalidParameter { name: "condition_scale", .. })
            ));
        }
        req.condition_scale = 1.0;
        assert!(validate_request(&req).is_ok());
        req.condition_scale = 0.0;
        assert!(validate_request(&req).is_ok());
    }

    #[test]
    fn validation_rejects_missing_or_empty_input() {
        let mut req = request(0, 512);
        assert!(matches!(validate_request(&req), Err(CoreError::EmptyImage { .. })));
        req.width = 512;
        req.input_path = None;
        assert!(matches!(validate_request(&req), Err(CoreError::MissingInput)));
    }

    #[test]
    fn positive_seed_is_kept() {
        let seed = resolve_seed(42);
        assert_eq!(seed, ResolvedSeed { value: 42, randomized: false });
    }

    #[test]
    fn non_positive_seed_is_randomized_and_non_zero() {
        for requested in [0i64, -1, i64::MIN] {
            for _ in 0..64 {
                let seed = resolve_seed(requested);
                assert!(seed.randomized);
                assert!(seed.value >= 1 && seed.value <= u64::from(u16::MAX));
            }
        }
    }

    #[test]
    fn seeded_entropy_gives_repeatable_randomized_seed() {
        let mut a = rand::rngs::StdRng::seed_from_u64(7);
        let mut b = rand::rngs::StdRng::seed_from_u64(7);
        assert_eq!(resolve_seed_with(0, &mut a), resolve_seed_with(0, &mut b));
    }

    #[test]
    fn prediction_passes_snapped_resolution_and_seed() {
        let backend = RecordingBackend::default();
        let mut req = request(1920, 1080);
        req.seed = 1234;
        let result = run_prediction(&backend, &req).expect("prediction should succeed");
        assert_eq!((result.width, result.height), (1344, 768));
        assert_eq!((result.source_width, result.source_height), (1920, 1080));
        assert_eq!(result.seed.value, 1234);

        let jobs = backend.jobs.lock().expect("jobs lock");
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].seed, 1234);
        assert_eq!(jobs[0].resolution, Resolution::new(1344, 768));
        assert_eq!(jobs[0].num_inference_steps, DEFAULT_NUM_INFERENCE_STEPS);
    }

    #[test]
    fn invalid_request_never_reaches_backend() {
        let backend = RecordingBackend::default();
        let mut req = request(512, 512);
        req.num_inference_steps = 0;
        assert!(run_prediction(&backend, &req).is_err());
        assert!(backend.jobs.lock().expect("jobs lock").is_empty());
    }

    #[test]
    fn backend_errors_propagate_and_emit_telemetry() {
        let sink = CollectingSink::default();
        let err = run_prediction_with_telemetry(&FailingBackend, &request(640, 480), Some(&sink))
            .expect_err("backend failure should propagate");
        assert!(err.to_string().contains("out of device memory"));
        let events = sink.events.lock().expect("events lock");
        assert_eq!(
            *events,
            vec![TelemetryEventType::PredictionStart, TelemetryEventType::PredictionError]
        );
    }

    #[test]
    fn runtime_config_prefers_non_blank_overrides() {
        let base = RuntimeConfig::from_lookup(|key| match key {
            "DEPTHGEN_EXECUTION_PROVIDER" => Some("cpu".to_string()),
            "DEPTHGEN_MODEL_DIR" => Some("/models".to_string()),
            _ => None,
        });
        assert_eq!(base.execution_provider, "cpu");
        assert_eq!(base.onnx_variant, "fp16");
        assert_eq!(base.model_dir.as_deref(), Some("/models"));

        let merged = resolve_runtime_config(
            base,
            RuntimeConfig {
                onnx_variant: "fp32".to_string(),
                execution_provider: " ".to_string(),
                gpu_backend: String::new(),
                model_dir: None,
            },
        );
        assert_eq!(merged.onnx_variant, "fp32");
        assert_eq!(merged.execution_provider, "cpu");
        assert_eq!(merged.gpu_backend, "auto");
        assert_eq!(merged.model_dir.as_deref(), Some("/models"));
    }
}
