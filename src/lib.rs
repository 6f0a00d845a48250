//! Beacon Voice - real-time voice front-end for AI assistant gateways
//!
//! Devices stream raw audio; the gateway finds the utterances in it, sends
//! each one to a speech recognizer, and streams the language model's answer
//! back to the device as it is generated.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │              Device edge (api/)                      │
//! │   WebSocket /voice/{device}  │  /health  │  status   │
//! └────────────────────┬────────────────────────────────┘
//!                      │ frames            ▲ payloads
//! ┌────────────────────▼───────────────────┴────────────┐
//! │           Session coordinator (session/)             │
//! │   VAD → Utterance buffer → Recognition → Driver      │
//! └──────────┬──────────────────────────────┬───────────┘
//!            │                              │
//! ┌──────────▼───────────┐      ┌───────────▼───────────┐
//! │ Recognition backends │      │  Generation backends  │
//! │   FunASR │ Whisper   │      │   OpenAI │ Ollama     │
//! └──────────────────────┘      └───────────────────────┘
//! ```

pub mod api;
pub mod audio;
pub mod config;
pub mod error;
pub mod generation;
pub mod recognition;
pub mod security;
pub mod session;
pub mod transport;
pub mod utterance;
pub mod vad;

pub use config::Config;
pub use error::{Error, ErrorKind, Result};
pub use session::{SessionCoordinator, SessionManager};
