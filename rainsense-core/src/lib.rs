//! Core library for the `rainsense` precipitation monitor.
//!
//! This crate defines:
//! - Configuration & credentials handling
//! - Abstraction over weather providers and the fallback chain
//! - Location resolution with a persistent cache
//! - The hysteresis-gated decision engines and the polling scheduler
//!
//! It is used by `rainsense-daemon`, but can also be reused by other
//! binaries or services.

pub mod chain;
pub mod config;
pub mod decision;
pub mod error;
pub mod hysteresis;
pub mod location;
pub mod model;
pub mod provider;
pub mod scheduler;

pub use chain::{ChainOptions, ProviderChain};
pub use config::{Config, LocationSettings, ProviderConfig};
pub use decision::{DecisionEngine, Diagnostics, QuietWindow, SensorConfig};
pub use error::{ChainError, ProviderError};
pub use hysteresis::HysteresisGate;
pub use location::LocationResolver;
pub use model::{Coordinate, ForecastSlice, LocationSource, Nowcast, PrecipKind, ResolvedLocation};
pub use provider::{ProviderId, WeatherProvider, providers_from_config};
pub use scheduler::Scheduler;
