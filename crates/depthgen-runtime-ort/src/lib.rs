mod control;
mod provider;
mod scheduler;
mod session;
mod text;

use std::env;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{anyhow, Context, Result};
use depthgen_core::{
    CoreError, ExecutionProvider, GeneratedImage, GenerationBackend, GenerationJob, GpuBackendPreference, OnnxVariant,
    PredictRequest,
};
use depthgen_image::Resolution;
use depthgen_model_registry::{locked_revision_dir, read_lockfile, resolve_model_paths, KnownModel};
use image::{DynamicImage, RgbImage};
use indicatif::{ProgressBar, ProgressStyle};
use ndarray::{concatenate, Array1, ArrayD, Axis, IxDyn};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use walkdir::WalkDir;

pub use control::{control_tensor, load_image};
pub use provider::{candidate_providers, ProviderChoice};
pub use scheduler::{seeded_noise, EulerDiscreteScheduler};

use session::{ModelSession, NamedInput};
use text::{PromptEncoder, SdxlTextEncoders};

pub const DEFAULT_GUIDANCE_SCALE: f32 = 5.0;
pub const VAE_SCALING_FACTOR: f32 = 0.13025;
const LATENT_CHANNELS: usize = 4;

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub model_dir: Option<PathBuf>,
    pub onnx_variant: OnnxVariant,
    pub execution_provider: ExecutionProvider,
    pub gpu_backend: GpuBackendPreference,
    pub guidance_scale: f32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            model_dir: None,
            onnx_variant: OnnxVariant::Fp16,
            execution_provider: ExecutionProvider::Auto,
            gpu_backend: GpuBackendPreference::Auto,
            guidance_scale: DEFAULT_GUIDANCE_SCALE,
        }
    }
}

/// ONNX graphs and tokenizer files of one installed model set.
#[derive(Debug, Clone)]
pub struct ModelFiles {
    pub text_encoder: PathBuf,
    pub text_encoder_2: PathBuf,
    pub tokenizer: PathBuf,
    pub tokenizer_2: PathBuf,
    pub unet: PathBuf,
    pub controlnet: PathBuf,
    pub vae_decoder: PathBuf,
    pub depth_estimator: PathBuf,
}

impl ModelFiles {
    pub fn locate(model_dir: Option<&Path>, onnx_variant: OnnxVariant) -> Result<Self> {
        let paths = resolve_model_paths(model_dir)?;
        let lock = read_lockfile(&paths).context("no model lockfile found; run `depthgen models install`")?;
        let revision_dir = |model: KnownModel| {
            locked_revision_dir(&paths, &lock, model)
                .ok_or_else(|| anyhow!("model not found in lockfile: {}", model.model_id()))
        };

        let sdxl = revision_dir(KnownModel::SdxlBase)?;
        let vae = revision_dir(KnownModel::VaeFp16Fix)?;
        let controlnet = revision_dir(KnownModel::ControlNetDepth)?;
        let depth = revision_dir(KnownModel::DptHybridMidas)?;

        Ok(Self {
            text_encoder: component_graph(&sdxl, "text_encoder", onnx_variant)?,
            text_encoder_2: component_graph(&sdxl, "text_encoder_2", onnx_variant)?,
            tokenizer: tokenizer_file(&sdxl, "tokenizer")?,
            tokenizer_2: tokenizer_file(&sdxl, "tokenizer_2")?,
            unet: component_graph(&sdxl, "unet", onnx_variant)?,
            controlnet: component_graph(&controlnet, "", onnx_variant)?,
            vae_decoder: component_graph(&vae, "vae_decoder", onnx_variant)?,
            depth_estimator: component_graph(&depth, "", onnx_variant)?,
        })
    }
}

fn component_graph(revision_dir: &Path, component: &str, onnx_variant: OnnxVariant) -> Result<PathBuf> {
    let component_dir = revision_dir.join(component);
    let base = if !component.is_empty() && component_dir.is_dir() {
        component_dir
    } else {
        revision_dir.to_path_buf()
    };
    find_preferred_onnx_file(&base, onnx_variant).ok_or_else(|| {
        anyhow!(
            "no .onnx file found for {} in {}",
            if component.is_empty() { "model" } else { component },
            base.display()
        )
    })
}

fn tokenizer_file(revision_dir: &Path, component: &str) -> Result<PathBuf> {
    let path = revision_dir.join(component).join("tokenizer.json");
    if path.is_file() {
        Ok(path)
    } else {
        Err(anyhow!("missing {}; the SDXL export must ship tokenizer.json files", path.display()))
    }
}

fn find_preferred_onnx_file(base_dir: &Path, onnx_variant: OnnxVariant) -> Option<PathBuf> {
    let mut candidates: Vec<PathBuf> = WalkDir::new(base_dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().map(|e| e == "onnx").unwrap_or(false))
        .collect();
    candidates.sort_by_key(|p| {
        let name = p
            .file_name()
            .map(|n| n.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        let fp16 = name.contains("fp16");
        let quantized = name.contains("quantized") || name.contains("q8") || name.contains("int8");
        let rank = match onnx_variant {
            OnnxVariant::Fp16 | OnnxVariant::Auto => match (fp16, quantized) {
                (true, _) => 0,
                (false, false) => 1,
                (false, true) => 2,
            },
            OnnxVariant::Fp32 => match (fp16, quantized) {
                (false, false) => 0,
                (true, _) => 1,
                (false, true) => 2,
            },
            OnnxVariant::Quantized => match (fp16, quantized) {
                (_, true) => 0,
                (true, false) => 1,
                (false, false) => 2,
            },
        };
        (rank, p.components().count(), p.clone())
    });
    candidates.into_iter().next()
}

pub fn placeholder_fallback_allowed() -> bool {
    match env::var("DEPTHGEN_ALLOW_PLACEHOLDER") {
        Ok(value) => {
            let normalized = value.trim().to_ascii_lowercase();
            normalized == "1" || normalized == "true" || normalized == "yes"
        }
        Err(_) => false,
    }
}

/// SDXL + depth ControlNet + VAE decoder (+ DPT for `--estimate-depth`), all on one execution provider.
pub struct OrtPipeline {
    text: SdxlTextEncoders,
    unet: ModelSession,
    controlnet: ModelSession,
    vae_decoder: ModelSession,
    depth_estimator: ModelSession,
    provider: ProviderChoice,
    fallback_used: bool,
    guidance_scale: f32,
}

impl OrtPipeline {
    pub fn load(config: &PipelineConfig) -> Result<Self> {
        let start = Instant::now();
        let files = ModelFiles::locate(config.model_dir.as_deref(), config.onnx_variant)?;
        let candidates = candidate_providers(config.execution_provider, config.gpu_backend);
        let preferred = *candidates
            .first()
            .ok_or_else(|| anyhow!("no execution providers available"))?;

        let mut errors = Vec::new();
        for provider in candidates {
            match Self::load_on(&files, provider, config.guidance_scale) {
                Ok(mut pipeline) => {
                    pipeline.fallback_used = provider != preferred;
                    tracing::info!(
                        provider = provider.label(),
                        fallback = pipeline.fallback_used,
                        elapsed_ms = start.elapsed().as_millis() as u64,
                        "setup took"
                    );
                    return Ok(pipeline);
                }
                Err(err) => {
                    tracing::warn!(provider = provider.label(), error = %format!("{err:#}"), "provider failed to load pipeline");
                    errors.push(format!("{}: {:#}", provider.label(), err));
                }
            }
        }
        Err(anyhow!("all providers failed: {}", errors.join(" | ")))
    }

    fn load_on(files: &ModelFiles, provider: ProviderChoice, guidance_scale: f32) -> Result<Self> {
        let text = SdxlTextEncoders {
            first: PromptEncoder::new(
                &files.tokenizer,
                ModelSession::load("text_encoder", &files.text_encoder, provider)?,
                "<|endoftext|>",
            )?,
            second: PromptEncoder::new(
                &files.tokenizer_2,
                ModelSession::load("text_encoder_2", &files.text_encoder_2, provider)?,
                "!",
            )?,
        };
        let unet = ModelSession::load("unet", &files.unet, provider)?;
        let controlnet = ModelSession::load("controlnet", &files.controlnet, provider)?;
        if !controlnet.output_names().iter().any(|name| unet.has_input(name)) {
            return Err(anyhow!(
                "unet {} takes none of the controlnet residual outputs; install a ControlNet-enabled SDXL export",
                files.unet.display()
            ));
        }
        let vae_decoder = ModelSession::load("vae_decoder", &files.vae_decoder, provider)?;
        let depth_estimator = ModelSession::load("depth_estimator", &files.depth_estimator, provider)?;
        Ok(Self {
            text,
            unet,
            controlnet,
            vae_decoder,
            depth_estimator,
            provider,
            fallback_used: false,
            guidance_scale,
        })
    }

    pub fn provider(&self) -> ProviderChoice {
        self.provider
    }

    fn generate_image(&self, image: &DynamicImage, job: &GenerationJob) -> Result<(Vec<u8>, u32, u32)> {
        let resolution = job.resolution;
        let control_image = if job.estimate_depth {
            control::estimate_depth(&self.depth_estimator, image, resolution)?
        } else {
            image.clone()
        };
        let control = batch2(&control_tensor(&control_image, resolution))?;

        // Classifier-free guidance with an all-zero negative embedding, as SDXL does for an empty negative prompt.
        let prompt = self.text.encode(&job.prompt)?;
        let encoder_hidden_states = concatenate(
            Axis(0),
            &[ArrayD::zeros(prompt.hidden.raw_dim()).view(), prompt.hidden.view()],
        )?;
        let text_embeds = concatenate(
            Axis(0),
            &[ArrayD::zeros(prompt.pooled.raw_dim()).view(), prompt.pooled.view()],
        )?;
        let time_ids = batch2(&time_ids(resolution)?)?;

        let scheduler = EulerDiscreteScheduler::new(job.num_inference_steps as usize);
        let (latent_w, latent_h) = resolution.latent_size();
        let mut latents = seeded_noise(job.seed, &[1, LATENT_CHANNELS, latent_h, latent_w])? * scheduler.init_noise_sigma();

        let progress = ProgressBar::new(scheduler.timesteps().len() as u64);
        progress.set_style(
            ProgressStyle::with_template("{spinner} denoising [{bar:30}] {pos}/{len} ({elapsed})")
                .unwrap_or_else(|_| ProgressStyle::default_bar()),
        );
        for (step_index, &timestep) in scheduler.timesteps().iter().enumerate() {
            let sample = scheduler.scale_model_input(&batch2(&latents)?, step_index);
            let residuals = self.controlnet_residuals(&sample, timestep, &encoder_hidden_states, &control, &text_embeds, &time_ids, job.condition_scale)?;

            let mut inputs = self.conditioning_inputs(&self.unet, &sample, timestep, &encoder_hidden_states, &text_embeds, &time_ids)?;
            for (name, residual) in residuals {
                inputs.push(self.unet.input(name, residual)?);
            }
            let noise = self.unet.run_first(inputs)?;
            let guided = apply_guidance(&noise, self.guidance_scale)?;
            latents = scheduler.step(&guided, step_index, &latents);
            progress.inc(1);
        }
        progress.finish_and_clear();

        let decoded = self
            .vae_decoder
            .run_first(vec![self.vae_decoder.input("latent_sample", latents / VAE_SCALING_FACTOR)?])?;
        control::decoded_to_png(&decoded)
    }

    fn conditioning_inputs(
        &self,
        session: &ModelSession,
        sample: &ArrayD<f32>,
        timestep: f32,
        encoder_hidden_states: &ArrayD<f32>,
        text_embeds: &ArrayD<f32>,
        time_ids: &ArrayD<f32>,
    ) -> Result<Vec<NamedInput>> {
        Ok(vec![
            session.input("sample", sample.clone())?,
            session.input("timestep", Array1::from_elem(1, timestep).into_dyn())?,
            session.input("encoder_hidden_states", encoder_hidden_states.clone())?,
            session.input("text_embeds", text_embeds.clone())?,
            session.input("time_ids", time_ids.clone())?,
        ])
    }

    /// ControlNet outputs the UNet accepts, already multiplied by the conditioning scale.
    #[allow(clippy::too_many_arguments)]
    fn controlnet_residuals(
        &self,
        sample: &ArrayD<f32>,
        timestep: f32,
        encoder_hidden_states: &ArrayD<f32>,
        control: &ArrayD<f32>,
        text_embeds: &ArrayD<f32>,
        time_ids: &ArrayD<f32>,
        condition_scale: f32,
    ) -> Result<Vec<(String, ArrayD<f32>)>> {
        let mut inputs = self.conditioning_inputs(&self.controlnet, sample, timestep, encoder_hidden_states, text_embeds, time_ids)?;
        inputs.push(self.controlnet.input("controlnet_cond", control.clone())?);

        let names: Vec<&str> = self
            .controlnet
            .output_names()
            .iter()
            .map(String::as_str)
            .filter(|name| self.unet.has_input(name))
            .collect();
        let outputs = self.controlnet.run(inputs, &names)?;
        scale_residuals(&names, outputs, condition_scale)
    }
}

impl GenerationBackend for OrtPipeline {
    fn generate(&self, request: &PredictRequest, job: &GenerationJob) -> Result<GeneratedImage, CoreError> {
        let image = load_image(request)?;
        let start = Instant::now();
        let (png, width, height) = self
            .generate_image(&image, job)
            .map_err(|e| CoreError::Backend(format!("{e:#}")))?;
        tracing::info!(elapsed_ms = start.elapsed().as_millis() as u64, "inference took");
        let (execution_provider_selected, gpu_backend_selected) = self.provider.report_labels();
        Ok(GeneratedImage {
            png,
            width,
            height,
            execution_provider_selected,
            gpu_backend_selected,
            fallback_used: self.fallback_used,
        })
    }
}

/// SDXL micro-conditioning: original size, crop offset, target size.
fn time_ids(resolution: Resolution) -> Result<ArrayD<f32>> {
    let (h, w) = (resolution.height as f32, resolution.width as f32);
    Ok(ArrayD::from_shape_vec(IxDyn(&[1, 6]), vec![h, w, 0.0, 0.0, h, w])?)
}

/// Classifier-free guidance over a `[2, ...]` prediction batched as (unconditional, conditional):
/// `uncond + scale * (cond - uncond)`, returned with a leading batch axis of 1.
fn apply_guidance(noise: &ArrayD<f32>, scale: f32) -> Result<ArrayD<f32>> {
    if noise.ndim() == 0 || noise.shape()[0] != 2 {
        return Err(anyhow!("expected a batch of 2 noise predictions, got shape {:?}", noise.shape()));
    }
    let uncond = noise.index_axis(Axis(0), 0);
    let cond = noise.index_axis(Axis(0), 1);
    let guided = &uncond + &((&cond - &uncond) * scale);
    Ok(guided.insert_axis(Axis(0)))
}

/// Pairs each residual with its output name and multiplies it by the conditioning scale.
fn scale_residuals(names: &[&str], outputs: Vec<ArrayD<f32>>, condition_scale: f32) -> Result<Vec<(String, ArrayD<f32>)>> {
    if names.len() != outputs.len() {
        return Err(anyhow!(
            "controlnet returned {} residuals for {} requested outputs",
            outputs.len(),
            names.len()
        ));
    }
    Ok(names
        .iter()
        .zip(outputs)
        .map(|(name, residual)| (name.to_string(), residual * condition_scale))
        .collect())
}

fn batch2(array: &ArrayD<f32>) -> Result<ArrayD<f32>> {
    Ok(concatenate(Axis(0), &[array.view(), array.view()])?)
}

/// Model-free stand-in used when `DEPTHGEN_ALLOW_PLACEHOLDER` is set: the conditioning image at the
/// output size blended with seeded noise, so equal seeds give identical bytes.
#[derive(Debug, Default, Clone)]
pub struct PlaceholderBackend;

impl GenerationBackend for PlaceholderBackend {
    fn generate(&self, request: &PredictRequest, job: &GenerationJob) -> Result<GeneratedImage, CoreError> {
        let image = load_image(request)?;
        let control = control_tensor(&image, job.resolution);
        let mut rng = StdRng::seed_from_u64(job.seed);
        let (w, h) = (job.resolution.width, job.resolution.height);
        let mut rgb = RgbImage::new(w, h);
        for (x, y, pixel) in rgb.enumerate_pixels_mut() {
            for c in 0..3 {
                let base = control[[0, c, y as usize, x as usize]] * job.condition_scale;
                let noise: f32 = rng.random();
                pixel[c] = ((base + noise * (1.0 - job.condition_scale)).clamp(0.0, 1.0) * 255.0).round() as u8;
            }
        }
        let png = control::encode_png(DynamicImage::ImageRgb8(rgb)).map_err(|e| CoreError::Backend(e.to_string()))?;
        Ok(GeneratedImage {
            png,
            width: w,
            height: h,
            execution_provider_selected: "placeholder".to_string(),
            gpu_backend_selected: None,
            fallback_used: true,
        })
    }
}
