use std::path::Path;
#[cfg(target_os = "windows")]
use std::path::PathBuf;

use anyhow::Result;
use depthgen_core::{ExecutionProvider, GpuBackendPreference};
use ort::session::Session;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProviderChoice {
    Cpu,
    DirectML,
    Cuda,
    CoreML,
}

impl ProviderChoice {
    pub fn label(self) -> &'static str {
        match self {
            ProviderChoice::Cpu => "cpu",
            ProviderChoice::DirectML => "directml",
            ProviderChoice::Cuda => "cuda",
            ProviderChoice::CoreML => "coreml",
        }
    }

    /// `(execution provider, gpu backend)` as reported back to callers.
    pub fn report_labels(self) -> (String, Option<String>) {
        match self {
            ProviderChoice::Cpu => ("cpu".to_string(), None),
            other => ("gpu".to_string(), Some(other.label().to_string())),
        }
    }
}

pub fn candidate_providers(execution_provider: ExecutionProvider, gpu_backend: GpuBackendPreference) -> Vec<ProviderChoice> {
    let mut out = Vec::new();
    match execution_provider {
        ExecutionProvider::Cpu => out.push(ProviderChoice::Cpu),
        ExecutionProvider::Gpu | ExecutionProvider::Auto => {
            out.extend(gpu_candidates(gpu_backend));
            out.push(ProviderChoice::Cpu);
        }
    }
    dedup_providers(out)
}

fn gpu_candidates(pref: GpuBackendPreference) -> Vec<ProviderChoice> {
    let mut providers = Vec::new();
    match pref {
        GpuBackendPreference::DirectML => providers.push(ProviderChoice::DirectML),
        GpuBackendPreference::Cuda => providers.push(ProviderChoice::Cuda),
        GpuBackendPreference::CoreML | GpuBackendPreference::Metal => providers.push(ProviderChoice::CoreML),
        GpuBackendPreference::Auto => {
            #[cfg(target_os = "windows")]
            {
                if cuda_likely_available() {
                    providers.push(ProviderChoice::Cuda);
                }
                providers.push(ProviderChoice::DirectML);
            }
            #[cfg(target_os = "linux")]
            {
                if cuda_likely_available() {
                    providers.push(ProviderChoice::Cuda);
                }
            }
            #[cfg(any(target_os = "macos", target_os = "ios"))]
            {
                providers.push(ProviderChoice::CoreML);
            }
        }
    }
    providers
}

fn cuda_likely_available() -> bool {
    #[cfg(target_os = "windows")]
    {
        let system32 = std::env::var("WINDIR")
            .ok()
            .map(|d| PathBuf::from(d).join("System32").join("nvcuda.dll"));
        if let Some(candidate) = system32 {
            if candidate.exists() {
                return true;
            }
        }
        if let Some(path) = std::env::var_os("PATH") {
            for dir in std::env::split_paths(&path) {
                if dir.join("nvcuda.dll").exists() {
                    return true;
                }
            }
        }
        return false;
    }
    #[cfg(target_os = "linux")]
    {
        let candidates = [
            "/usr/lib/x86_64-linux-gnu/libcuda.so.1",
            "/usr/lib64/libcuda.so.1",
            "/usr/lib/wsl/lib/libcuda.so.1",
        ];
        return candidates.iter().any(|p| Path::new(p).exists());
    }
    #[cfg(not(any(target_os = "windows", target_os = "linux")))]
    {
        false
    }
}

fn dedup_providers(list: Vec<ProviderChoice>) -> Vec<ProviderChoice> {
    let mut out = Vec::new();
    for provider in list {
        if !out.contains(&provider) {
            out.push(provider);
        }
    }
    out
}

pub(crate) fn build_session_for_provider(model_file: &Path, provider: ProviderChoice) -> Result<Session> {
    match provider {
        ProviderChoice::Cpu => Session::builder()?.commit_from_file(model_file).map_err(Into::into),
        ProviderChoice::DirectML => {
            #[cfg(feature = "directml")]
            {
                Session::builder()?
                    .with_execution_providers([ort::execution_providers::DirectMLExecutionProvider::default().build()])?
                    .commit_from_file(model_file)
                    .map_err(Into::into)
            }
            #[cfg(not(feature = "directml"))]
            {
                Err(anyhow::anyhow!("directml feature not enabled"))
            }
        }
        ProviderChoice::Cuda => {
            #[cfg(feature = "cuda")]
            {
                Session::builder()?
                    .with_execution_providers([ort::execution_providers::CUDAExecutionProvider::default().build()])?
                    .commit_from_file(model_file)
                    .map_err(Into::into)
            }
            #[cfg(not(feature = "cuda"))]
            {
                Err(anyhow::anyhow!("cuda feature not enabled"))
            }
        }
        ProviderChoice::CoreML => {
            #[cfg(feature = "coreml")]
            {
                Session::builder()?
                    .with_execution_providers([ort::execution_providers::CoreMLExecutionProvider::default().build()])?
                    .commit_from_file(model_file)
                    .map_err(Into::into)
            }
            #[cfg(not(feature = "coreml"))]
            {
                Err(anyhow::anyhow!("coreml feature not enabled"))
            }
        }
    }
}
