//! API configuration.

use std::path::PathBuf;
use std::time::Duration;

use crate::gateway::GatewayConfig;

/// Content types accepted by the upload endpoint.
pub const DEFAULT_UPLOAD_CONTENT_TYPES: &[&str] = &[
    "video/mp4",
    "video/quicktime",
    "video/x-msvideo",
    "video/x-ms-wmv",
    "video/x-matroska",
];

/// API server configuration.
#[derive(Debug, Clone)]
pub struct ApiConfig {
    /// Server host
    pub host: String,
    /// Server port
    pub port: u16,
    /// CORS origins
    pub cors_origins: Vec<String>,
    /// Request timeout
    pub request_timeout: Duration,
    /// Max request body size outside the upload route
    pub max_body_size: usize,
    /// Max size of one uploaded source file
    pub max_upload_size: usize,
    /// Content types accepted for uploads
    pub upload_content_types: Vec<String>,
    /// Where uploads are spooled before going to the object store
    pub upload_tmp_dir: PathBuf,
    /// Environment (development/production)
    pub environment: String,
    pub metrics_enabled: bool,
    pub gateway: GatewayConfig,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            port: 8000,
            cors_origins: vec!["*".to_string()],
            request_timeout: Duration::from_secs(30),
            max_body_size: 1024 * 1024, // 1MB
            max_upload_size: 500 * 1024 * 1024, // 500MB
            upload_content_types: DEFAULT_UPLOAD_CONTENT_TYPES
                .iter()
                .map(|s| s.to_string())
                .collect(),
            upload_tmp_dir: std::env::temp_dir(),
            environment: "development".to_string(),
            metrics_enabled: true,
            gateway: GatewayConfig::default(),
        }
    }
}

impl ApiConfig {
    /// Create config from environment variables.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            host: std::env::var("API_HOST").unwrap_or(defaults.host),
            port: std::env::var("API_PORT")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.port),
            cors_origins: std::env::var("CORS_ORIGINS")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.cors_origins),
            request_timeout: std::env::var("REQUEST_TIMEOUT")
                .ok()
                .and_then(|s| s.parse().ok())
                .map(Duration::from_secs)
                .unwrap_or(defaults.request_timeout),
            max_body_size: std::env::var("MAX_BODY_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_body_size),
            max_upload_size: std::env::var("MAX_UPLOAD_SIZE")
                .ok()
                .and_then(|s| s.parse().ok())
                .unwrap_or(defaults.max_upload_size),
            upload_content_types: std::env::var("UPLOAD_CONTENT_TYPES")
                .map(|s| s.split(',').map(|s| s.trim().to_string()).collect())
                .unwrap_or(defaults.upload_content_types),
            upload_tmp_dir: std::env::var("UPLOAD_TMP_DIR")
                .map(PathBuf::from)
                .unwrap_or(defaults.upload_tmp_dir),
            environment: std::env::var("ENVIRONMENT").unwrap_or(defaults.environment),
            metrics_enabled: std::env::var("METRICS_ENABLED")
                .map(|v| v == "true" || v == "1")
                .unwrap_or(defaults.metrics_enabled),
            gateway: GatewayConfig::from_env(),
        }
    }

    /// Check if running in production mode.
    pub fn is_production(&self) -> bool {
        self.environment.to_lowercase() == "production"
    }

    pub fn accepts_upload_type(&self, content_type: &str) -> bool {
        self.upload_content_types.iter().any(|t| t == content_type)
    }
}
