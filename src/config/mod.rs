//! Configuration management for the voice gateway
//!
//! Values are layered env > toml > default. Backend-specific options stay
//! loosely typed in an [`OptionBag`] until a router turns them into a
//! validated backend config.

pub mod file;
mod options;

pub use options::OptionBag;

use std::path::Path;

use serde::Serialize;

use crate::audio::{DEFAULT_CHANNELS, DEFAULT_SAMPLE_RATE};
use crate::generation::ToolDefinition;
use crate::security::{AuthConfig, AuthMode};
use crate::vad::DEFAULT_ENERGY_THRESHOLD;
use crate::{Error, Result};

/// Default device edge port
pub const DEFAULT_PORT: u16 = 18791;

/// Voice gateway configuration
#[derive(Debug, Clone, Default, Serialize)]
pub struct Config {
    /// Device edge
    pub server: ServerConfig,

    /// Device authentication
    pub auth: AuthConfig,

    /// Voice activity detection
    pub vad: VadConfig,

    /// Utterance buffering
    pub buffer: BufferConfig,

    /// Stage deadlines
    pub session: SessionConfig,

    /// Speech recognition backend selection
    pub recognition: RecognitionSettings,

    /// Language model backend selection
    pub generation: GenerationSettings,
}

/// Device edge configuration
#[derive(Debug, Clone, Serialize)]
pub struct ServerConfig {
    /// Bind address
    pub host: String,

    /// Port to listen on
    pub port: u16,

    /// Sample rate of inbound device audio
    pub sample_rate: u32,

    /// Channel count of inbound device audio
    pub channels: u16,

    /// Bound on a single device publish
    pub publish_timeout_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: DEFAULT_PORT,
            sample_rate: DEFAULT_SAMPLE_RATE,
            channels: DEFAULT_CHANNELS,
            publish_timeout_ms: 1_000,
        }
    }
}

/// Voice activity detection configuration
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct VadConfig {
    /// RMS level above which a frame counts as speech
    pub energy_threshold: f32,

    /// Consecutive speech needed to open an utterance
    pub onset_ms: u32,

    /// Consecutive silence needed to close an utterance
    pub end_window_ms: u32,

    /// Shorter utterances are discarded
    pub min_utterance_ms: u32,

    /// Utterances are force-closed at this length
    pub max_utterance_ms: u32,

    /// Audio kept from before the onset
    pub preroll_ms: u32,
}

impl Default for VadConfig {
    fn default() -> Self {
        Self {
            energy_threshold: DEFAULT_ENERGY_THRESHOLD,
            onset_ms: 200,
            end_window_ms: 800,
            min_utterance_ms: 100,
            max_utterance_ms: 30_000,
            preroll_ms: 300,
        }
    }
}

/// Utterance buffer configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BufferConfig {
    /// Duration of each chunk handed to the recognizer
    pub chunk_ms: u32,

    /// Audio that may queue ahead of the recognizer before overflow
    pub capacity_ms: u32,
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            chunk_ms: 200,
            capacity_ms: 10_000,
        }
    }
}

/// Session deadlines
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct SessionConfig {
    /// Recognition deadline, measured from the utterance end
    pub recognition_timeout_ms: u64,

    /// Deadline for one generation call, fallback included
    pub generation_timeout_ms: u64,

    /// Close a session that hears no speech for this long
    pub idle_timeout_ms: u64,

    /// Time cancelled stages get to release their connections
    pub cancel_grace_ms: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            recognition_timeout_ms: 10_000,
            generation_timeout_ms: 30_000,
            idle_timeout_ms: 120_000,
            cancel_grace_ms: 2_000,
        }
    }
}

/// Recognition backend selection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RecognitionSettings {
    /// Backend variant
    pub provider: String,

    /// Backend options
    pub options: OptionBag,
}

impl Default for RecognitionSettings {
    fn default() -> Self {
        Self {
            provider: "funasr".to_string(),
            options: OptionBag::new(),
        }
    }
}

/// Generation backend selection
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GenerationSettings {
    /// Backend variant
    pub provider: String,

    /// System prompt prepended to every request
    pub system_prompt: Option<String>,

    /// Dialogue messages kept per session
    pub max_history: usize,

    /// Offer `tools` to the model
    pub tools_enabled: bool,

    /// Tools the model may call
    pub tools: Vec<ToolDefinition>,

    /// Backend options
    pub options: OptionBag,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            system_prompt: None,
            max_history: 20,
            tools_enabled: true,
            tools: Vec::new(),
            options: OptionBag::new(),
        }
    }
}

impl GenerationSettings {
    /// Tools to send with each request
    #[must_use]
    pub fn active_tools(&self) -> Vec<ToolDefinition> {
        if self.tools_enabled {
            self.tools.clone()
        } else {
            Vec::new()
        }
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// With `path`, that file must exist and parse. Without it the standard
    /// config path is used when present.
    ///
    /// # Errors
    ///
    /// Returns error if an explicit config file cannot be loaded or the
    /// resulting configuration is invalid
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let fc = match path {
            Some(path) => file::read_config_file(path)?,
            None => file::load_config_file(),
        };

        let config = Self::from_sources(fc, |key| std::env::var(key).ok());
        config.validate()?;
        Ok(config)
    }

    /// Merge a parsed config file with an environment lookup
    #[must_use]
    pub fn from_sources(fc: file::VoiceConfigFile, env: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        // Server config (env > toml > default)
        let server = ServerConfig {
            host: env("BEACON_VOICE_HOST")
                .or(fc.server.host)
                .unwrap_or(defaults.server.host),
            port: env("BEACON_VOICE_PORT")
                .and_then(|s| s.parse().ok())
                .or(fc.server.port)
                .unwrap_or(defaults.server.port),
            sample_rate: fc.server.sample_rate.unwrap_or(defaults.server.sample_rate),
            channels: fc.server.channels.unwrap_or(defaults.server.channels),
            publish_timeout_ms: fc
                .server
                .publish_timeout_ms
                .unwrap_or(defaults.server.publish_timeout_ms),
        };

        // Auth config (env > toml > default)
        let auth = AuthConfig {
            mode: env("BEACON_VOICE_AUTH_MODE")
                .or(fc.auth.mode)
                .map(|s| AuthMode::from_str(&s))
                .unwrap_or(defaults.auth.mode),
            token: env("BEACON_VOICE_AUTH_TOKEN").or(fc.auth.token),
            allow_local_bypass: fc
                .auth
                .allow_local_bypass
                .unwrap_or(defaults.auth.allow_local_bypass),
        };

        let vad = VadConfig {
            energy_threshold: fc.vad.energy_threshold.unwrap_or(defaults.vad.energy_threshold),
            onset_ms: fc.vad.onset_ms.unwrap_or(defaults.vad.onset_ms),
            end_window_ms: fc.vad.end_window_ms.unwrap_or(defaults.vad.end_window_ms),
            min_utterance_ms: fc.vad.min_utterance_ms.unwrap_or(defaults.vad.min_utterance_ms),
            max_utterance_ms: fc.vad.max_utterance_ms.unwrap_or(defaults.vad.max_utterance_ms),
            preroll_ms: fc.vad.preroll_ms.unwrap_or(defaults.vad.preroll_ms),
        };

        let buffer = BufferConfig {
            chunk_ms: fc.buffer.chunk_ms.unwrap_or(defaults.buffer.chunk_ms),
            capacity_ms: fc.buffer.capacity_ms.unwrap_or(defaults.buffer.capacity_ms),
        };

        let session = SessionConfig {
            recognition_timeout_ms: fc
                .session
                .recognition_timeout_ms
                .unwrap_or(defaults.session.recognition_timeout_ms),
            generation_timeout_ms: fc
                .session
                .generation_timeout_ms
                .unwrap_or(defaults.session.generation_timeout_ms),
            idle_timeout_ms: fc
                .session
                .idle_timeout_ms
                .unwrap_or(defaults.session.idle_timeout_ms),
            cancel_grace_ms: fc
                .session
                .cancel_grace_ms
                .unwrap_or(defaults.session.cancel_grace_ms),
        };

        // Backend selection (env > toml > default)
        let mut recognition = RecognitionSettings {
            provider: env("BEACON_VOICE_ASR_PROVIDER")
                .or(fc.recognition.provider)
                .unwrap_or(defaults.recognition.provider)
                .to_lowercase(),
            options: fc.recognition.options,
        };

        let mut generation = GenerationSettings {
            provider: env("BEACON_VOICE_LLM_PROVIDER")
                .or(fc.generation.provider)
                .unwrap_or(defaults.generation.provider)
                .to_lowercase(),
            system_prompt: fc.generation.system_prompt,
            max_history: fc
                .generation
                .max_history
                .unwrap_or(defaults.generation.max_history),
            tools_enabled: fc
                .generation
                .tools_enabled
                .unwrap_or(defaults.generation.tools_enabled),
            tools: fc.generation.tools,
            options: fc.generation.options,
        };

        if let Some(model) = env("BEACON_VOICE_LLM_MODEL") {
            generation.options.insert("model_name", model);
        }

        // Shared OpenAI key fills in whichever backends talk to OpenAI
        if let Some(key) = env("OPENAI_API_KEY") {
            if recognition.provider == "whisper" && !recognition.options.contains("api_key") {
                recognition.options.insert("api_key", key.clone());
            }
            if generation.provider == "openai" && !generation.options.contains("api_key") {
                generation.options.insert("api_key", key);
            }
        }

        Self {
            server,
            auth,
            vad,
            buffer,
            session,
            recognition,
            generation,
        }
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` naming the first invalid field
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(Error::Config(msg.to_string()));

        if self.server.sample_rate == 0 {
            return invalid("server.sample_rate must be positive");
        }
        if self.vad.onset_ms == 0 || self.vad.end_window_ms == 0 {
            return invalid("vad.onset_ms and vad.end_window_ms must be positive");
        }
        if self.vad.max_utterance_ms <= self.vad.onset_ms {
            return invalid("vad.max_utterance_ms must exceed vad.onset_ms");
        }
        if self.buffer.chunk_ms == 0 {
            return invalid("buffer.chunk_ms must be positive");
        }
        if self.buffer.capacity_ms < self.buffer.chunk_ms {
            return invalid("buffer.capacity_ms must hold at least one chunk");
        }
        if self.auth.mode == AuthMode::Token && self.auth.token.is_none() {
            return invalid("auth.mode = \"token\" requires auth.token");
        }
        Ok(())
    }

    /// Copy with secrets masked, for display
    #[must_use]
    pub fn redacted(&self) -> Self {
        let mut shown = self.clone();
        if shown.auth.token.is_some() {
            shown.auth.token = Some("***".to_string());
        }
        shown.recognition.options = self.recognition.options.redacted();
        shown.generation.options = self.generation.options.redacted();
        shown
    }
}
