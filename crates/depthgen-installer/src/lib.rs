use std::collections::BTreeMap;
use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use anyhow::{anyhow, Context, Result};
use depthgen_core::OnnxVariant;
use depthgen_model_registry::{
    ensure_layout, merge_lock_models, model_revision_dir, read_lockfile, resolve_model_paths,
    write_lockfile, KnownModel, LockFileEntry, LockModel, ModelLock, ModelPaths, DEFAULT_REVISION,
};
use indicatif::{ProgressBar, ProgressStyle};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION, RANGE, USER_AGENT};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tempfile::Builder;
use walkdir::WalkDir;

const METADATA_FILES: [&str; 9] = [
    "config.json",
    "preprocessor_config.json",
    "model_index.json",
    "scheduler_config.json",
    "tokenizer.json",
    "tokenizer_config.json",
    "special_tokens_map.json",
    "vocab.json",
    "merges.txt",
];

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallRequest {
    pub model_dir: Option<PathBuf>,
    pub install_all: bool,
    pub models: Vec<KnownModel>,
    pub hf_token_env: String,
    /// Per-model revision; models not listed use `main`.
    pub revisions: BTreeMap<KnownModel, String>,
    /// Per-model repository to download from instead of the canonical id, e.g. an ONNX export.
    pub repos: BTreeMap<KnownModel, String>,
    pub verify_only: bool,
    pub onnx_variant: OnnxVariant,
    /// Download again even when the revision directory already holds a matching install.
    pub force: bool,
}

impl InstallRequest {
    pub fn revision_for(&self, model: KnownModel) -> &str {
        self.revisions
            .get(&model)
            .map(String::as_str)
            .unwrap_or(DEFAULT_REVISION)
    }

    pub fn repo_for(&self, model: KnownModel) -> &str {
        self.repos
            .get(&model)
            .map(String::as_str)
            .unwrap_or_else(|| model.model_id())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InstallReport {
    pub model_dir: PathBuf,
    pub installed: Vec<String>,
    pub skipped: Vec<String>,
    pub lockfile_written: bool,
}

pub fn install_models(request: &InstallRequest) -> Result<InstallReport> {
    let paths = resolve_model_paths(request.model_dir.as_deref())?;
    ensure_layout(&paths)?;

    let mut targets = request.models.clone();
    if request.install_all || targets.is_empty() {
        targets = KnownModel::all().to_vec();
    }

    let token = env::var(&request.hf_token_env).ok().filter(|s| !s.trim().is_empty());
    let existing_lock = read_lockfile(&paths).ok();

    let mut lock_models = Vec::new();
    let mut installed = Vec::new();
    let mut skipped = Vec::new();

    for model in targets {
        let revision = request.revision_for(model);
        let repo = request.repo_for(model);
        let model_id = model.model_id().to_string();
        let rev_dir = model_revision_dir(&paths, model, revision);

        let locked_source = existing_lock
            .as_ref()
            .and_then(|lock| lock.entry(model))
            .filter(|entry| entry.revision == revision)
            .map(|entry| entry.source.as_str());
        if !request.force && can_reuse_revision_dir(&rev_dir, model, repo, locked_source)? {
            tracing::info!(model = %model_id, revision, "model already present, skipping download");
            skipped.push(model_id.clone());
            lock_models.push(lock_from_existing_dir(&model_id, repo, revision, &rev_dir)?);
            continue;
        }
        let downloaded = download_model_to_revision(
            &paths.cache_downloads_dir,
            model,
            repo,
            revision,
            token.as_deref(),
            &rev_dir,
            request.onnx_variant,
        )?;
        installed.push(model_id);
        lock_models.push(downloaded);
    }

    let mut lockfile_written = false;
    if !request.verify_only {
        validate_lock_models(&paths, &lock_models)?;
        let generated_at = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs().to_string())
            .unwrap_or_else(|_| "0".to_string());
        let lock = merge_lock_models(existing_lock, lock_models, generated_at);
        write_lockfile(&paths, &lock)?;
        lockfile_written = true;
    }

    Ok(InstallReport {
        model_dir: paths.root,
        installed,
        skipped,
        lockfile_written,
    })
}

pub fn verify_models(model_dir: Option<PathBuf>) -> Result<ModelLock> {
    let paths = resolve_model_paths(model_dir.as_deref())?;
    let lock = read_lockfile(&paths)?;
    for model in &lock.models {
        let model_kind = KnownModel::from_model_id(&model.model_id)
            .ok_or_else(|| anyhow!("unknown model id in lockfile: {}", model.model_id))?;
        let revision_dir = model_revision_dir(&paths, model_kind, &model.revision);
        for file in &model.files {
            let file_path = revision_dir.join(&file.path);
            if !file_path.exists() {
                return Err(anyhow!(
                    "missing file for {}@{}: {}",
                    model.model_id,
                    model.revision,
                    file.path
                ));
            }
            let metadata = fs::metadata(&file_path)?;
            if metadata.len() != file.size {
                return Err(anyhow!(
                    "size mismatch for {}@{} {}: expected {}, got {}",
                    model.model_id,
                    model.revision,
                    file.path,
                    file.size,
                    metadata.len()
                ));
            }
            let digest = sha256_file(&file_path)?;
            if digest != file.sha256 {
                return Err(anyhow!(
                    "checksum mismatch for {}@{} {}",
                    model.model_id,
                    model.revision,
                    file.path
                ));
            }
        }
    }
    Ok(lock)
}

/// True when every model has a lockfile entry whose revision directory still holds an ONNX graph.
pub fn models_installed(model_dir: Option<&Path>, models: &[KnownModel]) -> Result<bool> {
    let paths = resolve_model_paths(model_dir)?;
    let lock = match read_lockfile(&paths) {
        Ok(lock) => lock,
        Err(_) => return Ok(false),
    };
    for model in models {
        let Some(entry) = lock.entry(*model) else {
            return Ok(false);
        };
        let rev_dir = model_revision_dir(&paths, *model, &entry.revision);
        if !rev_dir.exists() || !has_onnx_file(&rev_dir)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn has_onnx_file(revision_dir: &Path) -> Result<bool> {
    for entry in WalkDir::new(revision_dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        if entry
            .path()
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.eq_ignore_ascii_case("onnx"))
            .unwrap_or(false)
        {
            return Ok(true);
        }
    }
    Ok(false)
}

/// A populated revision directory is kept only when it came from `repo`: either the lockfile
/// records that source, or nothing is locked and `repo` is the canonical repository.
fn can_reuse_revision_dir(revision_dir: &Path, model: KnownModel, repo: &str, locked_source: Option<&str>) -> Result<bool> {
    if !revision_dir.exists() || !has_onnx_file(revision_dir)? {
        return Ok(false);
    }
    Ok(match locked_source {
        Some(source) => source == lock_source(repo),
        None => repo == model.model_id(),
    })
}

fn validate_repo_id(repo: &str) -> Result<()> {
    let valid = match repo.split_once('/') {
        Some((owner, name)) => {
            !owner.is_empty()
                && !name.is_empty()
                && !name.contains('/')
                && repo
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | '/'))
        }
        None => false,
    };
    if valid {
        Ok(())
    } else {
        Err(anyhow!("invalid Hugging Face repository id: {:?}", repo))
    }
}

fn lock_source(repo: &str) -> String {
    format!("huggingface:{}", repo)
}

/// Stable location of an in-flight download, so an interrupted install resumes where it stopped.
fn partial_download_path(cache_downloads_dir: &Path, repo: &str, revision: &str, relative_path: &str) -> PathBuf {
    partial_download_dir(cache_downloads_dir, repo, revision).join(format!("{}.part", relative_path))
}

fn partial_download_dir(cache_downloads_dir: &Path, repo: &str, revision: &str) -> PathBuf {
    cache_downloads_dir.join(repo.replace('/', "__")).join(revision)
}

fn download_model_to_revision(
    cache_downloads_dir: &Path,
    model: KnownModel,
    repo: &str,
    revision: &str,
    token: Option<&str>,
    final_revision_dir: &Path,
    onnx_variant: OnnxVariant,
) -> Result<LockModel> {
    validate_repo_id(repo)?;
    let client = hf_client(token)?;
    let files = list_model_files(&client, model, repo, revision, onnx_variant)?;
    if !files.iter().any(|f| f.ends_with(".onnx")) {
        return Err(anyhow!(
            "{}@{} has no ONNX graphs for {}; pass --repo {}=<onnx export>",
            repo,
            revision,
            model,
            model.label()
        ));
    }

    fs::create_dir_all(
        final_revision_dir
            .parent()
            .ok_or_else(|| anyhow!("invalid final revision directory"))?,
    )?;

    let tempdir = Builder::new()
        .prefix("depthgen-download-")
        .tempdir_in(cache_downloads_dir)?;
    let temp_path = tempdir.path().to_path_buf();

    tracing::info!(model = %model, repo, revision, files = files.len(), "downloading model");
    let mut lock_entries = Vec::with_capacity(files.len());
    for relative_path in files {
        let local_path = temp_path.join(&relative_path);
        let partial_path = partial_download_path(cache_downloads_dir, repo, revision, &relative_path);
        for dir in [local_path.parent(), partial_path.parent()].into_iter().flatten() {
            fs::create_dir_all(dir)?;
        }
        let (size, sha256) = download_file(&client, repo, revision, &relative_path, &partial_path, &local_path)?;
        lock_entries.push(LockFileEntry {
            path: relative_path,
            size,
            sha256,
        });
    }

    if final_revision_dir.exists() {
        fs::remove_dir_all(final_revision_dir)?;
    }
    let kept = tempdir.keep();
    fs::rename(&kept, final_revision_dir).or_else(|err| {
        let _ = fs::remove_dir_all(&kept);
        Err(err)
    })?;
    let _ = fs::remove_dir_all(partial_download_dir(cache_downloads_dir, repo, revision));

    Ok(LockModel {
        model_id: model.model_id().to_string(),
        revision: revision.to_string(),
        source: lock_source(repo),
        files: lock_entries,
    })
}

fn lock_from_existing_dir(model_id: &str, repo: &str, revision: &str, revision_dir: &Path) -> Result<LockModel> {
    let mut files = Vec::new();
    for entry in WalkDir::new(revision_dir)
        .into_iter()
        .filter_map(std::result::Result::ok)
        .filter(|e| e.file_type().is_file())
    {
        let full_path = entry.path();
        let rel = full_path
            .strip_prefix(revision_dir)
            .context("failed to strip revision dir prefix")?
            .to_string_lossy()
            .replace('\\', "/");
        let metadata = fs::metadata(full_path)?;
        files.push(LockFileEntry {
            path: rel,
            size: metadata.len(),
            sha256: sha256_file(full_path)?,
        });
    }
    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(LockModel {
        model_id: model_id.to_string(),
        revision: revision.to_string(),
        source: lock_source(repo),
        files,
    })
}

fn hf_client(token: Option<&str>) -> Result<Client> {
    let mut headers = HeaderMap::new();
    headers.insert(USER_AGENT, HeaderValue::from_static("depthgen-installer/0.1"));
    if let Some(token) = token {
        let value = format!("Bearer {}", token);
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&value).context("invalid token for authorization header")?,
        );
    }
    // No overall timeout: UNet weights are several gigabytes.
    Ok(Client::builder().default_headers(headers).timeout(None).build()?)
}

#[derive(Debug, Deserialize)]
struct HfTreeEntry {
    path: String,
    #[serde(rename = "type")]
    kind: String,
}

fn list_model_files(
    client: &Client,
    model: KnownModel,
    repo: &str,
    revision: &str,
    onnx_variant: OnnxVariant,
) -> Result<Vec<String>> {
    let url = format!("https://huggingface.co/api/models/{}/tree/{}?recursive=1", repo, revision);
    let response = client.get(url).send()?;
    if !response.status().is_success() {
        return Err(anyhow!(
            "failed to list files for {}@{}: {}",
            repo,
            revision,
            response.status()
        ));
    }
    let entries: Vec<HfTreeEntry> = response.json()?;
    let all_files: Vec<String> = entries
        .into_iter()
        .filter(|entry| entry.kind == "file")
        .map(|entry| entry.path)
        .collect();
    Ok(filter_model_files_for_variant(model, &all_files, onnx_variant))
}

fn parent_dir(path: &str) -> &str {
    path.rsplit_once('/').map(|(dir, _)| dir).unwrap_or("")
}

fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map(|(_, name)| name).unwrap_or(path)
}

/// One ONNX graph per directory (by variant preference) plus its external-data sidecars and
/// the tokenizer/config files the runtime reads.
fn filter_model_files_for_variant(model: KnownModel, all_files: &[String], onnx_variant: OnnxVariant) -> Vec<String> {
    let wanted: Vec<&String> = all_files.iter().filter(|f| model.wants_path(f)).collect();

    let mut onnx_by_dir: BTreeMap<&str, Vec<&String>> = BTreeMap::new();
    for file in &wanted {
        if file.ends_with(".onnx") {
            onnx_by_dir.entry(parent_dir(file)).or_default().push(*file);
        }
    }

    let mut out = Vec::new();
    for (dir, mut onnx_files) in onnx_by_dir {
        onnx_files.sort();
        let pick = |needle: &str| {
            onnx_files
                .iter()
                .find(|f| file_name(f).to_ascii_lowercase().contains(needle))
                .map(|f| (*f).clone())
        };
        let preferred = match onnx_variant {
            OnnxVariant::Fp16 | OnnxVariant::Auto => pick("fp16")
                .or_else(|| pick("model.onnx"))
                .or_else(|| onnx_files.first().map(|f| (*f).clone())),
            OnnxVariant::Fp32 => pick("model.onnx")
                .or_else(|| pick("fp16"))
                .or_else(|| onnx_files.first().map(|f| (*f).clone())),
            OnnxVariant::Quantized => pick("quantized")
                .or_else(|| pick("q8"))
                .or_else(|| onnx_files.first().map(|f| (*f).clone())),
        };
        let Some(graph) = preferred else {
            continue;
        };
        let graph_name = file_name(&graph).to_string();
        for sidecar in wanted.iter().filter(|f| parent_dir(f) == dir && !f.ends_with(".onnx")) {
            let name = file_name(sidecar);
            if (name.starts_with(&graph_name) && name != graph_name) || name == "weights.pb" {
                out.push((*sidecar).clone());
            }
        }
        out.push(graph);
    }

    for file in &wanted {
        if METADATA_FILES.contains(&file_name(file)) && !out.contains(*file) {
            out.push((*file).clone());
        }
    }
    out
}

fn download_file(
    client: &Client,
    repo: &str,
    revision: &str,
    file_path: &str,
    partial_path: &Path,
    destination: &Path,
) -> Result<(u64, String)> {
    let url = format!("https://huggingface.co/{}/resolve/{}/{}", repo, revision, file_path);
    let (mut hasher, mut resume_from) = resume_state(partial_path)?;
    let mut response = if resume_from > 0 {
        tracing::debug!(file = file_path, offset = resume_from, "resuming download");
        client
            .get(url.clone())
            .header(RANGE, format!("bytes={}-", resume_from))
            .send()?
    } else {
        client.get(url.clone()).send()?
    };
    if resume_from > 0 {
        match response.status().as_u16() {
            // Range ignored: the body is the whole file.
            200 => {
                hasher = Sha256::new();
                resume_from = 0;
            }
            416 => {
                fs::remove_file(partial_path)?;
                hasher = Sha256::new();
                resume_from = 0;
                response = client.get(url).send()?;
            }
            _ => {}
        }
    }
    if !response.status().is_success() {
        return Err(anyhow!(
            "failed downloading {} for {}@{}: {}",
            file_path,
            repo,
            revision,
            response.status()
        ));
    }

    let mut file = if resume_from > 0 {
        fs::OpenOptions::new().append(true).open(partial_path)?
    } else {
        File::create(partial_path)?
    };

    let total = response.content_length().map(|len| len + resume_from).unwrap_or(0);
    let progress = ProgressBar::new(total);
    progress.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} {msg} [{bar:40.cyan/blue}] {bytes}/{total_bytes} ({eta})")
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-"),
    );
    progress.set_message(file_path.to_string());
    progress.set_position(resume_from);

    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = response.read(&mut buf)?;
        if read == 0 {
            break;
        }
        file.write_all(&buf[..read])?;
        hasher.update(&buf[..read]);
        progress.inc(read as u64);
    }
    file.flush()?;
    progress.finish_and_clear();
    fs::rename(partial_path, destination)?;
    let total_size = fs::metadata(destination)?.len();
    let digest = hex::encode(hasher.finalize());
    Ok((total_size, digest))
}

/// Hash state and byte count of a partial download left by an earlier run; empty when there is none.
fn resume_state(partial_path: &Path) -> Result<(Sha256, u64)> {
    let mut hasher = Sha256::new();
    let mut file = match File::open(partial_path) {
        Ok(file) => file,
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok((hasher, 0)),
        Err(err) => return Err(err.into()),
    };
    let mut read_total = 0u64;
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
        read_total += read as u64;
    }
    Ok((hasher, read_total))
}

fn sha256_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 16 * 1024];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}

fn validate_lock_models(paths: &ModelPaths, models: &[LockModel]) -> Result<()> {
    for model in models {
        if model.files.is_empty() {
            return Err(anyhow!("model {} has no tracked files", model.model_id));
        }
        let kind = KnownModel::from_model_id(&model.model_id)
            .ok_or_else(|| anyhow!("unknown model id in lock entries: {}", model.model_id))?;
        let revision_dir = model_revision_dir(paths, kind, &model.revision);
        if !has_onnx_file(&revision_dir)? {
            return Err(anyhow!(
                "revision {} for {} has no onnx file",
                model.revision,
                model.model_id
            ));
        }
        for entry in &model.files {
            let full = revision_dir.join(&entry.path);
            if !full.exists() {
                return Err(anyhow!("missing file before lock write: {}", full.display()));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn files(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sdxl_filter_keeps_one_graph_per_component_with_sidecars() {
        let all = files(&[
            "model_index.json",
            "unet/config.json",
            "unet/model.onnx",
            "unet/model.onnx_data",
            "unet/diffusion_pytorch_model.safetensors",
            "text_encoder/model.onnx",
            "text_encoder/config.json",
            "text_encoder_2/model.onnx",
            "text_encoder_2/model.onnx_data",
            "tokenizer/tokenizer.json",
            "tokenizer/vocab.json",
            "tokenizer_2/merges.txt",
            "vae_decoder/model.onnx",
            "vae_encoder/model.onnx",
        ]);
        let picked = filter_model_files_for_variant(KnownModel::SdxlBase, &all, OnnxVariant::Fp16);

        assert!(picked.contains(&"unet/model.onnx".to_string()));
        assert!(picked.contains(&"unet/model.onnx_data".to_string()));
        assert!(picked.contains(&"text_encoder/model.onnx".to_string()));
        assert!(picked.contains(&"text_encoder_2/model.onnx_data".to_string()));
        assert!(picked.contains(&"tokenizer/tokenizer.json".to_string()));
        assert!(picked.contains(&"tokenizer_2/merges.txt".to_string()));
        assert!(!picked.iter().any(|f| f.starts_with("vae_")));
        assert!(!picked.iter().any(|f| f.ends_with(".safetensors")));
        assert!(!picked.contains(&"model_index.json".to_string()));
    }

    #[test]
    fn variant_preference_selects_matching_graph_and_its_sidecar() {
        let all = files(&[
            "onnx/model.onnx",
            "onnx/model.onnx_data",
            "onnx/model_fp16.onnx",
            "onnx/model_fp16.onnx_data",
            "onnx/model_quantized.onnx",
            "config.json",
        ]);

        let fp16 = filter_model_files_for_variant(KnownModel::ControlNetDepth, &all, OnnxVariant::Fp16);
        assert_eq!(
            fp16,
            files(&["onnx/model_fp16.onnx_data", "onnx/model_fp16.onnx", "config.json"])
        );

        let fp32 = filter_model_files_for_variant(KnownModel::ControlNetDepth, &all, OnnxVariant::Fp32);
        assert_eq!(fp32, files(&["onnx/model.onnx_data", "onnx/model.onnx", "config.json"]));

        let quantized = filter_model_files_for_variant(KnownModel::DptHybridMidas, &all, OnnxVariant::Quantized);
        assert_eq!(quantized, files(&["onnx/model_quantized.onnx", "config.json"]));
    }

    #[test]
    fn repository_without_onnx_yields_only_metadata() {
        let all = files(&["config.json", "diffusion_pytorch_model.fp16.safetensors"]);
        let picked = filter_model_files_for_variant(KnownModel::ControlNetDepth, &all, OnnxVariant::Fp16);
        assert_eq!(picked, files(&["config.json"]));
    }

    #[test]
    fn request_overrides_fall_back_to_defaults() {
        let mut request = InstallRequest {
            model_dir: None,
            install_all: true,
            models: vec![],
            hf_token_env: "HF_TOKEN".to_string(),
            revisions: BTreeMap::new(),
            repos: BTreeMap::new(),
            verify_only: false,
            onnx_variant: OnnxVariant::Fp16,
            force: false,
        };
        request.revisions.insert(KnownModel::SdxlBase, "v2".to_string());
        request.repos.insert(KnownModel::ControlNetDepth, "someone/controlnet-depth-onnx".to_string());

        assert_eq!(request.revision_for(KnownModel::SdxlBase), "v2");
        assert_eq!(request.revision_for(KnownModel::VaeFp16Fix), "main");
        assert_eq!(request.repo_for(KnownModel::ControlNetDepth), "someone/controlnet-depth-onnx");
        assert_eq!(request.repo_for(KnownModel::DptHybridMidas), "Intel/dpt-hybrid-midas");
    }

    #[test]
    fn existing_revision_dir_is_hashed_into_lock_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        fs::create_dir_all(dir.path().join("unet"))?;
        fs::write(dir.path().join("unet").join("model.onnx"), b"graph")?;
        fs::write(dir.path().join("config.json"), b"{}")?;

        let lock = lock_from_existing_dir("stabilityai/stable-diffusion-xl-base-1.0", "mirror/sdxl-onnx", "main", dir.path())?;
        assert_eq!(lock.source, "huggingface:mirror/sdxl-onnx");
        let paths: Vec<&str> = lock.files.iter().map(|f| f.path.as_str()).collect();
        assert_eq!(paths, vec!["config.json", "unet/model.onnx"]);
        assert_eq!(lock.files[1].size, 5);
        assert_eq!(lock.files[1].sha256, sha256_file(&dir.path().join("unet").join("model.onnx"))?);
        assert!(has_onnx_file(dir.path())?);
        Ok(())
    }

    fn populated_revision_dir() -> Result<tempfile::TempDir> {
        let dir = tempfile::tempdir()?;
        fs::write(dir.path().join("model.onnx"), b"old-graph")?;
        Ok(dir)
    }

    #[test]
    fn revision_dir_from_another_repo_is_downloaded_again() -> Result<()> {
        let dir = populated_revision_dir()?;
        let model = KnownModel::ControlNetDepth;
        let canonical = lock_source(model.model_id());

        assert!(!can_reuse_revision_dir(dir.path(), model, "someone/new-controlnet-onnx", Some(&canonical))?);
        assert!(!can_reuse_revision_dir(dir.path(), model, "someone/new-controlnet-onnx", None)?);
        Ok(())
    }

    #[test]
    fn revision_dir_from_the_same_repo_is_reused() -> Result<()> {
        let dir = populated_revision_dir()?;
        let model = KnownModel::ControlNetDepth;
        let mirror = "someone/controlnet-onnx";

        assert!(can_reuse_revision_dir(dir.path(), model, mirror, Some(&lock_source(mirror)))?);
        assert!(can_reuse_revision_dir(dir.path(), model, model.model_id(), None)?);

        let empty = tempfile::tempdir()?;
        assert!(!can_reuse_revision_dir(empty.path(), model, mirror, Some(&lock_source(mirror)))?);
        Ok(())
    }

    #[test]
    fn forced_install_skips_nothing() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let paths = resolve_model_paths(Some(dir.path()))?;
        let model = KnownModel::DptHybridMidas;
        // Malformed on purpose: a forced download fails before any request is sent.
        let repo = "not a valid repo id";
        let rev_dir = model_revision_dir(&paths, model, DEFAULT_REVISION);
        fs::create_dir_all(&rev_dir)?;
        fs::write(rev_dir.join("model.onnx"), b"old-graph")?;
        let locked = lock_from_existing_dir(model.model_id(), repo, DEFAULT_REVISION, &rev_dir)?;
        write_lockfile(&paths, &merge_lock_models(None, vec![locked], "1".to_string()))?;

        let request = |force| {
            let mut repos = BTreeMap::new();
            repos.insert(model, repo.to_string());
            InstallRequest {
                model_dir: Some(dir.path().to_path_buf()),
                install_all: false,
                models: vec![model],
                hf_token_env: "DEPTHGEN_TEST_UNSET_TOKEN".to_string(),
                revisions: BTreeMap::new(),
                repos,
                verify_only: false,
                onnx_variant: OnnxVariant::Fp16,
                force,
            }
        };

        let report = install_models(&request(false))?;
        assert_eq!(report.skipped, vec![model.model_id().to_string()]);
        assert!(report.installed.is_empty());

        assert!(install_models(&request(true)).is_err());
        assert_eq!(fs::read(rev_dir.join("model.onnx"))?, b"old-graph");
        let lock = read_lockfile(&paths)?;
        assert_eq!(lock.entry(model).map(|e| e.source.as_str()), Some("huggingface:not a valid repo id"));
        Ok(())
    }

    #[test]
    fn repo_ids_need_owner_and_name() {
        for model in KnownModel::all() {
            assert!(validate_repo_id(model.model_id()).is_ok());
        }
        assert!(validate_repo_id("someone/sdxl-1.0_onnx").is_ok());
        assert!(validate_repo_id("sdxl").is_err());
        assert!(validate_repo_id("a/b/c").is_err());
        assert!(validate_repo_id("/name").is_err());
        assert!(validate_repo_id("not a valid repo id").is_err());
    }

    #[test]
    fn partial_downloads_have_stable_distinct_paths() {
        let cache = Path::new("/models/cache/downloads");
        let graph = partial_download_path(cache, "someone/sdxl-onnx", "main", "unet/model.onnx");
        let data = partial_download_path(cache, "someone/sdxl-onnx", "main", "unet/model.onnx_data");

        assert_eq!(graph, cache.join("someone__sdxl-onnx").join("main").join("unet/model.onnx.part"));
        assert_ne!(graph, data);
        assert_eq!(graph, partial_download_path(cache, "someone/sdxl-onnx", "main", "unet/model.onnx"));
        assert_ne!(graph, partial_download_path(cache, "other/sdxl-onnx", "main", "unet/model.onnx"));
    }

    #[test]
    fn resume_continues_hash_of_partial_bytes() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let partial = dir.path().join("model.onnx.part");

        let (_, offset) = resume_state(&partial)?;
        assert_eq!(offset, 0);

        fs::write(&partial, b"hello ")?;
        let (mut hasher, offset) = resume_state(&partial)?;
        assert_eq!(offset, 6);
        hasher.update(b"world");

        fs::write(dir.path().join("whole"), b"hello world")?;
        assert_eq!(hex::encode(hasher.finalize()), sha256_file(&dir.path().join("whole"))?);
        Ok(())
    }

    #[test]
    fn installed_check_requires_lock_entries() -> Result<()> {
        let dir = tempfile::tempdir()?;
        assert!(!models_installed(Some(dir.path()), &KnownModel::all())?);
        Ok(())
    }
}
