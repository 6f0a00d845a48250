//! Device access control

pub mod auth;

pub use auth::{AuthConfig, AuthMode, Authenticator, Credentials};
