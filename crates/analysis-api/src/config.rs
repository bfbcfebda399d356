//! Binary-level configuration (bind address, database URL) layered on top
//! of [`analysis_core::AnalysisConfig`], following the same
//! `Config::from_env()` convention as the teacher's server binary.

use std::env;

use analysis_core::AnalysisConfig;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiConfigError {
    #[error("missing required environment variable {0}")]
    MissingEnv(&'static str),
    #[error(transparent)]
    Core(#[from] analysis_core::ConfigError),
}

#[derive(Debug, Clone)]
pub struct ApiConfig {
    pub database_url: String,
    pub bind_addr: String,
    pub engine: AnalysisConfig,
}

impl ApiConfig {
    pub fn from_env() -> Result<Self, ApiConfigError> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| ApiConfigError::MissingEnv("DATABASE_URL"))?;
        let bind_addr = env::var("ANALYSIS_BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string());
        let engine = AnalysisConfig::from_env()?;
        Ok(ApiConfig {
            database_url,
            bind_addr,
            engine,
        })
    }
}
