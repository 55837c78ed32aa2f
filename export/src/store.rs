//! Model stores: where pretrained models come from.
//!
//! A store turns a model identifier into a [`LoadedModel`]: local files plus
//! the parsed `config.json` and `preprocessor_config.json`. Every failure is
//! fatal for the run.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::config::HubConfig;
use crate::error::ExportError;
use crate::model::{EncoderConfig, LoadedModel, PreprocessorConfig};
use crate::paths::Paths;

const MODEL_CONFIG: &str = "config.json";
const PREPROCESSOR_CONFIG: &str = "preprocessor_config.json";

/// Resolves model identifiers to local model files.
pub trait ModelStore {
    /// Loads `id`. The model comes back in training mode.
    fn load(&self, id: &str) -> Result<LoadedModel, ExportError>;
}

/// Reads pre-staged models from `<root>/<id>`, never touching the network.
#[derive(Debug, Clone)]
pub struct DirStore {
    root: PathBuf,
}

impl DirStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }
}

impl ModelStore for DirStore {
    fn load(&self, id: &str) -> Result<LoadedModel, ExportError> {
        let dir = model_dir(&self.root, id)?;
        if !dir.is_dir() {
            return Err(ExportError::load(id, format!("{dir:?} is not a directory")));
        }
        load_from_dir(id, &dir)
    }
}

/// Downloads models from a Hugging Face style hub into a local cache.
///
/// Files are fetched from `<endpoint>/<id>/resolve/<revision>/<file>`.
/// Files already in the cache are not fetched again.
pub struct HubStore {
    endpoint: String,
    revision: String,
    files: Vec<String>,
    cache_dir: PathBuf,
    agent: ureq::Agent,
}

impl HubStore {
    /// Builds a store from hub settings. Without an explicit cache
    /// directory, `~/.speechport/export/cache/hub` is used.
    pub fn new(cfg: &HubConfig) -> Result<Self, ExportError> {
        let cache_dir = match &cfg.cache_dir {
            Some(dir) => dir.clone(),
            None => Paths::new("export")
                .map_err(|e| ExportError::Config(format!("hub cache: {e}")))?
                .hub_cache_dir(),
        };
        let agent: ureq::Agent = ureq::Agent::config_builder()
            .timeout_global(Some(Duration::from_secs(cfg.timeout_secs.max(1))))
            .build()
            .into();
        Ok(Self {
            endpoint: cfg.endpoint.trim_end_matches('/').to_string(),
            revision: cfg.revision.clone(),
            files: cfg.files.clone(),
            cache_dir,
            agent,
        })
    }

    pub fn cache_dir(&self) -> &Path {
        &self.cache_dir
    }

    /// URL of one model file.
    pub fn file_url(&self, id: &str, file: &str) -> String {
        format!("{}/{}/resolve/{}/{}", self.endpoint, id, self.revision, file)
    }

    fn fetch(&self, id: &str, file: &str, dest: &Path) -> Result<(), ExportError> {
        let url = self.file_url(id, file);
        info!("Downloading {url}");

        let resp = self
            .agent
            .get(&url)
            .call()
            .map_err(|e| ExportError::load(id, format!("GET {url}: {e}")))?;

        let part = dest.with_file_name(format!("{file}.part"));
        let mut out = fs::File::create(&part).map_err(|e| ExportError::io(&part, e))?;
        let mut body = resp.into_body().into_reader();
        let written = io::copy(&mut body, &mut out)
            .map_err(|e| ExportError::load(id, format!("GET {url}: {e}")))?;
        drop(out);
        fs::rename(&part, dest).map_err(|e| ExportError::io(dest, e))?;

        debug!(file, bytes = written, "cached");
        Ok(())
    }
}

impl ModelStore for HubStore {
    fn load(&self, id: &str) -> Result<LoadedModel, ExportError> {
        let dir = model_dir(&self.cache_dir, id)?;
        fs::create_dir_all(&dir).map_err(|e| ExportError::io(&dir, e))?;

        for file in &self.files {
            let dest = dir.join(file);
            if dest.is_file() {
                debug!(file = %file, "already cached");
                continue;
            }
            self.fetch(id, file, &dest)?;
        }
        load_from_dir(id, &dir)
    }
}

/// `<root>/<id>`, refusing identifiers that would escape `root`.
fn model_dir(root: &Path, id: &str) -> Result<PathBuf, ExportError> {
    let id_path = Path::new(id);
    let plain = !id.is_empty()
        && id_path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)));
    if !plain {
        return Err(ExportError::load(id, "invalid model identifier"));
    }
    Ok(root.join(id_path))
}

/// Loads a model from a directory holding `config.json` and, optionally,
/// `preprocessor_config.json`.
pub fn load_from_dir(id: &str, dir: &Path) -> Result<LoadedModel, ExportError> {
    let encoder: EncoderConfig = read_json(id, &dir.join(MODEL_CONFIG))?;
    encoder
        .validate()
        .map_err(|e| ExportError::load(id, format!("{MODEL_CONFIG}: {e}")))?;

    let pre_path = dir.join(PREPROCESSOR_CONFIG);
    let preprocessor = if pre_path.is_file() {
        read_json(id, &pre_path)?
    } else {
        debug!(model = id, "no {PREPROCESSOR_CONFIG}, using defaults");
        PreprocessorConfig::default()
    };

    let mut files = fs::read_dir(dir)
        .map_err(|e| ExportError::io(dir, e))?
        .filter_map(|entry| entry.ok().map(|e| e.path()))
        .filter(|p| p.is_file() && p.extension().is_none_or(|ext| ext != "part"))
        .collect::<Vec<_>>();
    files.sort();

    info!(
        model = id,
        hidden_size = encoder.hidden_size,
        layers = encoder.conv_kernel.len(),
        files = files.len(),
        "model loaded"
    );
    Ok(LoadedModel::new(id, dir, files, encoder, preprocessor))
}

fn read_json<T: DeserializeOwned>(id: &str, path: &Path) -> Result<T, ExportError> {
    let data = fs::read(path).map_err(|e| ExportError::load(id, format!("{path:?}: {e}")))?;
    serde_json::from_slice(&data).map_err(|e| ExportError::load(id, format!("{path:?}: {e}")))
}
