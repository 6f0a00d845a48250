//! TOML configuration file loading
//!
//! Supports `~/.config/omni/beacon-voice/config.toml` as a persistent config
//! source. All fields are optional, the file is a partial overlay on top of
//! defaults.

use std::path::{Path, PathBuf};

use serde::Deserialize;

use super::OptionBag;
use crate::generation::ToolDefinition;
use crate::{Error, Result};

/// Top-level TOML configuration file schema
#[derive(Debug, Default, Deserialize)]
pub struct VoiceConfigFile {
    /// Device edge
    #[serde(default)]
    pub server: ServerFileConfig,

    /// Device authentication
    #[serde(default)]
    pub auth: AuthFileConfig,

    /// Segmentation windows and classifier threshold
    #[serde(default)]
    pub vad: VadFileConfig,

    /// Utterance buffer sizing
    #[serde(default)]
    pub buffer: BufferFileConfig,

    /// Stage deadlines
    #[serde(default)]
    pub session: SessionFileConfig,

    /// Speech recognition backend
    #[serde(default)]
    pub recognition: RecognitionFileConfig,

    /// Language model backend
    #[serde(default)]
    pub generation: GenerationFileConfig,
}

/// Device edge configuration
#[derive(Debug, Default, Deserialize)]
pub struct ServerFileConfig {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub sample_rate: Option<u32>,
    pub channels: Option<u16>,
    pub publish_timeout_ms: Option<u64>,
}

/// Authentication configuration
#[derive(Debug, Default, Deserialize)]
pub struct AuthFileConfig {
    /// "open" or "token"
    pub mode: Option<String>,
    pub token: Option<String>,
    pub allow_local_bypass: Option<bool>,
}

/// Segmentation configuration
#[derive(Debug, Default, Deserialize)]
pub struct VadFileConfig {
    pub energy_threshold: Option<f32>,
    pub onset_ms: Option<u32>,
    pub end_window_ms: Option<u32>,
    pub min_utterance_ms: Option<u32>,
    pub max_utterance_ms: Option<u32>,
    pub preroll_ms: Option<u32>,
}

/// Utterance buffer configuration
#[derive(Debug, Default, Deserialize)]
pub struct BufferFileConfig {
    pub chunk_ms: Option<u32>,
    pub capacity_ms: Option<u32>,
}

/// Session deadline configuration
#[derive(Debug, Default, Deserialize)]
pub struct SessionFileConfig {
    pub recognition_timeout_ms: Option<u64>,
    pub generation_timeout_ms: Option<u64>,
    pub idle_timeout_ms: Option<u64>,
    pub cancel_grace_ms: Option<u64>,
}

/// Recognition backend selection
#[derive(Debug, Default, Deserialize)]
pub struct RecognitionFileConfig {
    /// Backend variant ("funasr", "whisper")
    pub provider: Option<String>,

    /// Backend-specific options, loosely typed
    #[serde(default)]
    pub options: OptionBag,
}

/// Generation backend selection
#[derive(Debug, Default, Deserialize)]
pub struct GenerationFileConfig {
    /// Backend variant ("openai", "ollama")
    pub provider: Option<String>,
    pub system_prompt: Option<String>,
    pub max_history: Option<usize>,
    pub tools_enabled: Option<bool>,

    /// Tools offered to the model
    #[serde(default)]
    pub tools: Vec<ToolDefinition>,

    /// Backend-specific options, loosely typed
    #[serde(default)]
    pub options: OptionBag,
}

/// Load the TOML config file from the standard path
///
/// Returns `VoiceConfigFile::default()` if the file doesn't exist or can't be parsed.
pub fn load_config_file() -> VoiceConfigFile {
    let Some(path) = config_file_path() else {
        return VoiceConfigFile::default();
    };

    if !path.exists() {
        return VoiceConfigFile::default();
    }

    match read_config_file(&path) {
        Ok(config) => config,
        Err(e) => {
            tracing::warn!(
                path = %path.display(),
                error = %e,
                "failed to load config file, using defaults"
            );
            VoiceConfigFile::default()
        }
    }
}

/// Read and parse a specific config file
///
/// # Errors
///
/// Returns error if the file cannot be read or is not valid TOML
pub fn read_config_file(path: &Path) -> Result<VoiceConfigFile> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| Error::Config(format!("failed to read {}: {e}", path.display())))?;
    let config = toml::from_str(&content)?;
    tracing::info!(path = %path.display(), "loaded config file");
    Ok(config)
}

/// Return the config file path: `~/.config/omni/beacon-voice/config.toml`
pub fn config_file_path() -> Option<PathBuf> {
    directories::BaseDirs::new().map(|d| {
        d.config_dir()
            .join("omni")
            .join("beacon-voice")
            .join("config.toml")
    })
}
