use ndarray::{ArrayD, IxDyn, ShapeError};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

const NUM_TRAIN_TIMESTEPS: usize = 1000;
const BETA_START: f64 = 0.00085;
const BETA_END: f64 = 0.012;
const STEPS_OFFSET: usize = 1;

/// Euler discrete scheduler with the SDXL base configuration
/// (scaled-linear betas, "leading" timestep spacing, epsilon prediction).
#[derive(Debug, Clone)]
pub struct EulerDiscreteScheduler {
    timesteps: Vec<f32>,
    sigmas: Vec<f32>,
}

impl EulerDiscreteScheduler {
    pub fn new(num_inference_steps: usize) -> Self {
        let num_inference_steps = num_inference_steps.clamp(1, NUM_TRAIN_TIMESTEPS);

        let start = BETA_START.sqrt();
        let end = BETA_END.sqrt();
        let mut alphas_cumprod = Vec::with_capacity(NUM_TRAIN_TIMESTEPS);
        let mut cumprod = 1.0f64;
        for i in 0..NUM_TRAIN_TIMESTEPS {
            let beta = start + (end - start) * i as f64 / (NUM_TRAIN_TIMESTEPS - 1) as f64;
            cumprod *= 1.0 - beta * beta;
            alphas_cumprod.push(cumprod);
        }
        let train_sigmas: Vec<f64> = alphas_cumprod.iter().map(|a| ((1.0 - a) / a).sqrt()).collect();

        let step_ratio = NUM_TRAIN_TIMESTEPS / num_inference_steps;
        let timesteps: Vec<usize> = (0..num_inference_steps)
            .rev()
            .map(|i| (i * step_ratio + STEPS_OFFSET).min(NUM_TRAIN_TIMESTEPS - 1))
            .collect();

        let mut sigmas: Vec<f32> = timesteps.iter().map(|&t| train_sigmas[t] as f32).collect();
        sigmas.push(0.0);

        Self {
            timesteps: timesteps.into_iter().map(|t| t as f32).collect(),
            sigmas,
        }
    }

    pub fn timesteps(&self) -> &[f32] {
        &self.timesteps
    }

    pub fn sigmas(&self) -> &[f32] {
        &self.sigmas
    }

    pub fn init_noise_sigma(&self) -> f32 {
        let max = self.sigmas.iter().copied().fold(0.0f32, f32::max);
        (max * max + 1.0).sqrt()
    }

    pub fn scale_model_input(&self, sample: &ArrayD<f32>, step_index: usize) -> ArrayD<f32> {
        let sigma = self.sigmas[step_index];
        sample / (sigma * sigma + 1.0).sqrt()
    }

    /// One Euler step from `sigmas[step_index]` to `sigmas[step_index + 1]`.
    pub fn step(&self, noise_pred: &ArrayD<f32>, step_index: usize, sample: &ArrayD<f32>) -> ArrayD<f32> {
        let dt = self.sigmas[step_index + 1] - self.sigmas[step_index];
        sample + &(noise_pred * dt)
    }
}

/// Standard normal latents drawn from a seeded generator, so a seed always gives the same noise.
pub fn seeded_noise(seed: u64, shape: &[usize]) -> Result<ArrayD<f32>, ShapeError> {
    let mut rng = StdRng::seed_from_u64(seed);
    let len: usize = shape.iter().product();
    let mut values = Vec::with_capacity(len);
    while values.len() < len {
        let u1: f64 = rng.random::<f64>().max(f64::MIN_POSITIVE);
        let u2: f64 = rng.random();
        let radius = (-2.0 * u1.ln()).sqrt();
        let theta = 2.0 * std::f64::consts::PI * u2;
        values.push((radius * theta.cos()) as f32);
        if values.len() < len {
            values.push((radius * theta.sin()) as f32);
        }
    }
    ArrayD::from_shape_vec(IxDyn(shape), values)
}
