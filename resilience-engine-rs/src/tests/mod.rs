//! End-to-end tests for the engine
//!
//! These drive `ResilienceEngine::handle` the way a web layer would.

pub mod admin_tests;

use crate::config::EngineConfig;
use crate::handler::ResilienceEngine;

pub(crate) fn production_engine() -> ResilienceEngine {
    ResilienceEngine::new(EngineConfig::default())
}

pub(crate) fn development_engine() -> ResilienceEngine {
    ResilienceEngine::new(EngineConfig::development())
}
