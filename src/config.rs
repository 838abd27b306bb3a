use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use crate::models::{DocumentType, FieldTemplate, TemplateSet};
use crate::processing::ocr::BackendKind;
use crate::utils::{ExtractError, Result};

/// Location checked when no configuration file is given explicitly.
pub const DEFAULT_CONFIG_PATH: &str = "config/idscan.toml";

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub ocr: OcrConfig,
    pub preprocess: PreprocessConfig,
    pub tesseract: TesseractConfig,
    pub cloud_vision: RemoteConfig,
    pub llm: LlmConfig,
    pub templates: BTreeMap<DocumentType, FieldTemplate>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OcrConfig {
    pub default_backend: BackendKind,
    /// Tesseract-style language hint, e.g. `eng+ind`.
    pub language: String,
}

impl Default for OcrConfig {
    fn default() -> Self {
        OcrConfig {
            default_backend: BackendKind::Local,
            language: "eng+ind".to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PreprocessConfig {
    pub max_width: u32,
    pub max_height: u32,
    pub max_file_size: usize,
    pub quality: u8,
    pub min_quality: u8,
    pub quality_step: u8,
    pub binarize: bool,
    pub clahe: ClaheConfig,
}

impl Default for PreprocessConfig {
    fn default() -> Self {
        PreprocessConfig {
            max_width: 2000,
            max_height: 2000,
            max_file_size: 4 * 1024 * 1024,
            quality: 90,
            min_quality: 30,
            quality_step: 10,
            binarize: true,
            clahe: ClaheConfig::default(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClaheConfig {
    pub enabled: bool,
    pub clip_limit: f32,
    pub tiles: u32,
}

impl Default for ClaheConfig {
    fn default() -> Self {
        ClaheConfig {
            enabled: false,
            clip_limit: 2.0,
            tiles: 8,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TesseractConfig {
    /// Executable; discovered on `PATH` when unset.
    pub path: Option<PathBuf>,
    /// Tessdata directory, used by the in-process engine only.
    pub datapath: Option<PathBuf>,
}

/// Connection settings shared by the remote backends. Defaults target Cloud Vision.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteConfig {
    pub endpoint: String,
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    /// Image sent as the warm-up request instead of a blank canvas.
    pub warmup_image: Option<PathBuf>,
}

impl Default for RemoteConfig {
    fn default() -> Self {
        RemoteConfig {
            endpoint: "https://vision.googleapis.com".to_string(),
            api_key_env: Some("GOOGLE_VISION_API_KEY".to_string()),
            api_key: None,
            timeout_secs: 30,
            max_retries: 3,
            warmup_image: None,
        }
    }
}

impl RemoteConfig {
    /// API key from the configured environment variable, else the literal key.
    pub fn resolve_api_key(&self, backend: &str) -> Result<String> {
        let from_env = self
            .api_key_env
            .as_deref()
            .and_then(|name| std::env::var(name).ok())
            .filter(|key| !key.trim().is_empty());

        from_env
            .or_else(|| self.api_key.clone().filter(|key| !key.trim().is_empty()))
            .ok_or_else(|| {
                let hint = match &self.api_key_env {
                    Some(name) => format!("export {} or set api_key in the [{}] section", name, backend),
                    None => format!("set api_key in the [{}] section", backend),
                };
                ExtractError::engine_unavailable(backend, "no API key configured", hint)
            })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LlmConfig {
    pub endpoint: String,
    pub model: String,
    pub api_key_env: Option<String>,
    pub api_key: Option<String>,
    pub timeout_secs: u64,
    pub max_retries: u32,
    pub warmup_image: Option<PathBuf>,
    /// Prompt overrides keyed by document type name or `default`.
    pub prompts: BTreeMap<String, String>,
}

impl Default for LlmConfig {
    fn default() -> Self {
        LlmConfig {
            endpoint: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            model: "gemini-2.5-flash".to_string(),
            api_key_env: Some("GEMINI_API_KEY".to_string()),
            api_key: None,
            timeout_secs: 30,
            max_retries: 3,
            warmup_image: None,
            prompts: BTreeMap::new(),
        }
    }
}

impl LlmConfig {
    pub fn remote(&self) -> RemoteConfig {
        RemoteConfig {
            endpoint: self.endpoint.clone(),
            api_key_env: self.api_key_env.clone(),
            api_key: self.api_key.clone(),
            timeout_secs: self.timeout_secs,
            max_retries: self.max_retries,
            warmup_image: self.warmup_image.clone(),
        }
    }
}

impl Config {
    pub fn from_toml_str(content: &str) -> Result<Config> {
        let config: Config = toml::from_str(content)
            .map_err(|e| ExtractError::Config(format!("failed to parse configuration: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn load(path: &Path) -> Result<Config> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            ExtractError::Config(format!("failed to read {}: {}", path.display(), e))
        })?;
        log::debug!("loading configuration from {}", path.display());
        Self::from_toml_str(&content)
    }

    /// Explicit path, else `DEFAULT_CONFIG_PATH` when present, else built-in defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Config> {
        match path {
            Some(path) => Self::load(path),
            None => {
                let default_path = Path::new(DEFAULT_CONFIG_PATH);
                if default_path.is_file() {
                    Self::load(default_path)
                } else {
                    Ok(Config::default())
                }
            }
        }
    }

    pub fn validate(&self) -> Result<()> {
        let p = &self.preprocess;
        if p.max_width == 0 || p.max_height == 0 {
            return Err(ExtractError::Config(
                "preprocess.max_width and max_height must be positive".to_string(),
            ));
        }
        if p.max_file_size == 0 {
            return Err(ExtractError::Config(
                "preprocess.max_file_size must be positive".to_string(),
            ));
        }
        if p.min_quality == 0 || p.min_quality > p.quality || p.quality > 100 {
            return Err(ExtractError::Config(format!(
                "preprocess quality bounds must satisfy 1 <= min_quality ({}) <= quality ({}) <= 100",
                p.min_quality, p.quality
            )));
        }
        if p.quality_step == 0 {
            return Err(ExtractError::Config(
                "preprocess.quality_step must be positive".to_string(),
            ));
        }
        if p.clahe.tiles == 0 || p.clahe.clip_limit <= 0.0 {
            return Err(ExtractError::Config(
                "preprocess.clahe tiles and clip_limit must be positive".to_string(),
            ));
        }
        if self.ocr.language.trim().is_empty() {
            return Err(ExtractError::Config("ocr.language must not be empty".to_string()));
        }
        if self.cloud_vision.timeout_secs == 0 || self.llm.timeout_secs == 0 {
            return Err(ExtractError::Config(
                "remote backend timeouts must be positive".to_string(),
            ));
        }
        self.template_set()?;
        Ok(())
    }

    pub fn template_set(&self) -> Result<TemplateSet> {
        TemplateSet::new(&self.templates)
    }
}
