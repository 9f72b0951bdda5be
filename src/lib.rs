#![deny(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]
#![allow(clippy::missing_errors_doc)]
#![allow(clippy::missing_panics_doc)]
#![allow(clippy::doc_markdown)]
#![allow(clippy::too_many_lines)]
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_precision_loss)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::unused_async)]
#![allow(clippy::redundant_closure_for_method_calls)]

//! clipd library — exposes the capture engine's building blocks.
//!
//! - `store` — durable, time-indexed storage for the three event streams
//! - `capture` — tap event ingestion and normalization
//! - `buffer` — age horizon and byte cap enforcement
//! - `clip` — HAR assembly, sanitization, and upload routing
//! - `uploader` — remote object-store client
//! - `config` — static config and reactive runtime settings
//! - `routes` — REST control-plane handlers
//! - `ws` — tap WebSocket transport
//! - `auth` — API key authentication middleware

pub mod auth;
pub mod buffer;
pub mod capture;
pub mod clip;
pub mod config;
pub mod routes;
pub mod state;
pub mod store;
pub mod uploader;
pub mod ws;

// Re-export key types at crate root for convenience.
pub use buffer::BufferManager;
pub use capture::CapturePipeline;
pub use clip::ClipBuilder;
pub use config::{Config, Settings, SettingsHandle};
pub use state::AppState;
pub use store::Store;
