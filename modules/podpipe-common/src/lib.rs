//! Domain types and cross-cutting concerns shared by every service in the
//! podcast transcription pipeline: episode/summary records, the typed event
//! enum carried on the event bus, SSRF-safe URL validation, and environment
//! configuration loading.

pub mod config;
pub mod episode;
pub mod error;
pub mod event;
pub mod security;
pub mod transcript;

pub use config::AppConfig;
pub use episode::{Episode, EpisodeMetadata, EpisodeStatus, Summary, SummaryContent};
pub use error::{ConfigError, DomainError};
pub use event::{BatchTranscribed, Event, EpisodeSummarized, EpisodeTranscribed, TranscriptionJob};
pub use security::{SecurityError, UrlValidator};
