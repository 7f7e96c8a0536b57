//! # Gemini Relay
//!
//! Load-balancing proxy in front of the Gemini API. Fans requests out
//! across pools of upstream API keys under per-key, per-model RPM
//! ceilings, disables keys that keep failing, and retries transient
//! failures with key rotation.
//!
//! ## Quick Start
//! ```bash
//! cargo run --bin gemini-relay
//! ```
//!
//! ## Endpoints
//! - `POST /v1beta/models/{model}:generateContent` (and
//!   `:streamGenerateContent`, `:countTokens`) - proxy surface
//! - `GET /api/rpm-status` - scheduler snapshot
//! - `GET /health`, `GET /ready`, `GET /metrics` - operations

mod config;
pub mod dispatch;
mod error;
mod handlers;
mod metrics;
mod middleware;
pub mod observability;
mod response;
mod router;
pub mod scheduler;
mod state;
pub mod upstream;

pub use config::Config;
pub use error::Error;
pub use router::create as create_router;
pub use state::AppState;
