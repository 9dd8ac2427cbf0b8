//! Application configuration for docsink.
//!
//! User config lives at `~/.docsink/docsink.toml`.
//! CLI flags override config file values, which override defaults.
//! Secrets are referenced by environment-variable name and read from the
//! environment, never stored in the file.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DocsinkError, Result};

/// Default configuration file name.
const CONFIG_FILE_NAME: &str = "docsink.toml";

/// Default config directory name under the user's home.
const CONFIG_DIR_NAME: &str = ".docsink";

// ---------------------------------------------------------------------------
// Config structs (matching docsink.toml schema)
// ---------------------------------------------------------------------------

/// Top-level application config, deserialized from TOML.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    /// Global defaults.
    #[serde(default)]
    pub defaults: DefaultsConfig,

    /// Crawl and fetch policies.
    #[serde(default)]
    pub crawl: CrawlConfig,

    /// Image pipeline settings.
    #[serde(default)]
    pub images: ImagesConfig,

    /// Object-storage (bucket) settings.
    #[serde(default)]
    pub object_store: ObjectStoreConfig,

    /// Target-site credential settings.
    #[serde(default)]
    pub site: SiteConfig,

    /// Job store settings.
    #[serde(default)]
    pub jobs: JobsConfig,
}

/// `[defaults]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DefaultsConfig {
    /// Database file path.
    #[serde(default = "default_db_path")]
    pub db_path: String,
}

impl Default for DefaultsConfig {
    fn default() -> Self {
        Self {
            db_path: default_db_path(),
        }
    }
}

fn default_db_path() -> String {
    "~/.docsink/docsink.db".into()
}

/// `[crawl]` section. Doubles as the runtime crawl configuration once
/// CLI flags have been merged in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlConfig {
    /// Minimum ms between page fetches.
    #[serde(default = "default_rate_limit")]
    pub rate_limit_ms: u64,

    /// Per-request timeout for page fetches.
    #[serde(default = "default_fetch_timeout")]
    pub timeout_secs: u64,

    /// URL path include patterns (glob). Empty means base-path scoping only.
    #[serde(default)]
    pub include_patterns: Vec<String>,

    /// URL path exclude patterns (glob).
    #[serde(default)]
    pub exclude_patterns: Vec<String>,

    /// Body-text phrases that mark a login wall.
    #[serde(default = "default_login_markers")]
    pub login_markers: Vec<String>,

    /// Maximum characters kept from whole-document fallback extraction.
    #[serde(default = "default_max_content_len")]
    pub max_content_len: usize,
}

impl Default for CrawlConfig {
    fn default() -> Self {
        Self {
            rate_limit_ms: default_rate_limit(),
            timeout_secs: default_fetch_timeout(),
            include_patterns: Vec::new(),
            exclude_patterns: Vec::new(),
            login_markers: default_login_markers(),
            max_content_len: default_max_content_len(),
        }
    }
}

fn default_rate_limit() -> u64 {
    200
}
fn default_fetch_timeout() -> u64 {
    30
}
fn default_login_markers() -> Vec<String> {
    vec![
        "log in to continue".into(),
        "sign in to continue".into(),
        "please log in".into(),
    ]
}
fn default_max_content_len() -> usize {
    20_000
}

/// `[images]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ImagesConfig {
    /// Maximum output dimension; larger images are downscaled, smaller
    /// ones are never upscaled.
    #[serde(default = "default_max_dimension")]
    pub max_dimension: u32,

    /// JPEG re-encode quality (1–100).
    #[serde(default = "default_jpeg_quality")]
    pub jpeg_quality: u8,

    /// File extensions rejected before download.
    #[serde(default = "default_exclude_formats")]
    pub exclude_formats: Vec<String>,

    /// Per-download timeout.
    #[serde(default = "default_image_timeout")]
    pub timeout_secs: u64,

    /// Host suffixes whose query strings are signed-URL noise to strip.
    #[serde(default = "default_strip_suffixes")]
    pub strip_query_suffixes: Vec<String>,

    /// Host first-label prefixes treated the same way (`cdn.` etc).
    #[serde(default = "default_strip_prefixes")]
    pub strip_query_prefixes: Vec<String>,
}

impl Default for ImagesConfig {
    fn default() -> Self {
        Self {
            max_dimension: default_max_dimension(),
            jpeg_quality: default_jpeg_quality(),
            exclude_formats: default_exclude_formats(),
            timeout_secs: default_image_timeout(),
            strip_query_suffixes: default_strip_suffixes(),
            strip_query_prefixes: default_strip_prefixes(),
        }
    }
}

fn default_max_dimension() -> u32 {
    1600
}
fn default_jpeg_quality() -> u8 {
    80
}
fn default_exclude_formats() -> Vec<String> {
    vec!["svg".into(), "gif".into()]
}
fn default_image_timeout() -> u64 {
    20
}
fn default_strip_suffixes() -> Vec<String> {
    vec![
        "amazonaws.com".into(),
        "storage.googleapis.com".into(),
        "supabase.co".into(),
        "cloudfront.net".into(),
        "azureedge.net".into(),
    ]
}
fn default_strip_prefixes() -> Vec<String> {
    vec![
        "cdn.".into(),
        "static.".into(),
        "media.".into(),
        "assets.".into(),
    ]
}

/// `[object_store]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ObjectStoreConfig {
    /// Storage API base URL (e.g. `https://xyz.supabase.co`).
    #[serde(default)]
    pub endpoint: String,

    /// Bucket to upload page images into.
    #[serde(default = "default_bucket")]
    pub bucket: String,

    /// Env var holding the service (highest-privilege) key.
    #[serde(default = "default_service_key_env")]
    pub service_key_env: String,

    /// Env var holding the anon/public key (fallback sign-in).
    #[serde(default = "default_anon_key_env")]
    pub anon_key_env: String,

    /// Env vars for the fallback upload account.
    #[serde(default = "default_store_email_env")]
    pub login_email_env: String,
    #[serde(default = "default_store_password_env")]
    pub login_password_env: String,
}

impl Default for ObjectStoreConfig {
    fn default() -> Self {
        Self {
            endpoint: String::new(),
            bucket: default_bucket(),
            service_key_env: default_service_key_env(),
            anon_key_env: default_anon_key_env(),
            login_email_env: default_store_email_env(),
            login_password_env: default_store_password_env(),
        }
    }
}

fn default_bucket() -> String {
    "page-images".into()
}
fn default_service_key_env() -> String {
    "DOCSINK_SERVICE_KEY".into()
}
fn default_anon_key_env() -> String {
    "DOCSINK_ANON_KEY".into()
}
fn default_store_email_env() -> String {
    "DOCSINK_STORE_EMAIL".into()
}
fn default_store_password_env() -> String {
    "DOCSINK_STORE_PASSWORD".into()
}

/// `[site]` section: credentials for login-walled documentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SiteConfig {
    /// Env var holding a session cookie for static fetches.
    #[serde(default = "default_site_cookie_env")]
    pub cookie_env: String,

    /// Env vars for browser-rendered login.
    #[serde(default = "default_site_email_env")]
    pub login_email_env: String,
    #[serde(default = "default_site_password_env")]
    pub login_password_env: String,
}

impl Default for SiteConfig {
    fn default() -> Self {
        Self {
            cookie_env: default_site_cookie_env(),
            login_email_env: default_site_email_env(),
            login_password_env: default_site_password_env(),
        }
    }
}

fn default_site_cookie_env() -> String {
    "DOCSINK_SITE_COOKIE".into()
}
fn default_site_email_env() -> String {
    "DOCSINK_SITE_EMAIL".into()
}
fn default_site_password_env() -> String {
    "DOCSINK_SITE_PASSWORD".into()
}

/// `[jobs]` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobsConfig {
    /// Lower bound on the advisory result TTL returned to pollers.
    #[serde(default = "default_ttl_min")]
    pub ttl_min_secs: u64,

    /// Upper bound on the advisory result TTL.
    #[serde(default = "default_ttl_max")]
    pub ttl_max_secs: u64,

    /// TTL used when the caller does not request one.
    #[serde(default = "default_ttl")]
    pub ttl_default_secs: u64,

    /// How often a running worker re-reads the cancellation flag.
    #[serde(default = "default_cancel_poll")]
    pub cancel_poll_ms: u64,
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            ttl_min_secs: default_ttl_min(),
            ttl_max_secs: default_ttl_max(),
            ttl_default_secs: default_ttl(),
            cancel_poll_ms: default_cancel_poll(),
        }
    }
}

fn default_ttl_min() -> u64 {
    60
}
fn default_ttl_max() -> u64 {
    86_400
}
fn default_ttl() -> u64 {
    3_600
}
fn default_cancel_poll() -> u64 {
    500
}

impl JobsConfig {
    /// Clamp a requested TTL into the configured window.
    ///
    /// Advisory metadata for pollers; nothing is evicted on expiry.
    pub fn effective_ttl(&self, requested: Option<u64>) -> u64 {
        requested
            .unwrap_or(self.ttl_default_secs)
            .clamp(self.ttl_min_secs, self.ttl_max_secs)
    }
}

// ---------------------------------------------------------------------------
// Config loading
// ---------------------------------------------------------------------------

/// Get the path to the config directory (`~/.docsink/`).
pub fn config_dir() -> Result<PathBuf> {
    let home = dirs::home_dir()
        .ok_or_else(|| DocsinkError::config("could not determine home directory"))?;
    Ok(home.join(CONFIG_DIR_NAME))
}

/// Get the path to the config file (`~/.docsink/docsink.toml`).
pub fn config_file_path() -> Result<PathBuf> {
    Ok(config_dir()?.join(CONFIG_FILE_NAME))
}

/// Load the application config from disk. Returns defaults if the file does not exist.
pub fn load_config() -> Result<AppConfig> {
    let path = config_file_path()?;

    if !path.exists() {
        tracing::debug!(?path, "config file not found, using defaults");
        return Ok(AppConfig::default());
    }

    load_config_from(&path)
}

/// Load the application config from a specific file path.
pub fn load_config_from(path: &Path) -> Result<AppConfig> {
    let content = std::fs::read_to_string(path).map_err(|e| DocsinkError::io(path, e))?;

    toml::from_str(&content)
        .map_err(|e| DocsinkError::config(format!("failed to parse {}: {e}", path.display())))
}

/// Create the config directory and write a default config file.
/// Returns the path to the created file.
pub fn init_config() -> Result<PathBuf> {
    let dir = config_dir()?;
    std::fs::create_dir_all(&dir).map_err(|e| DocsinkError::io(&dir, e))?;

    let path = dir.join(CONFIG_FILE_NAME);
    let config = AppConfig::default();
    let content =
        toml::to_string_pretty(&config).map_err(|e| DocsinkError::config(e.to_string()))?;

    std::fs::write(&path, content).map_err(|e| DocsinkError::io(&path, e))?;
    tracing::info!(?path, "created default config file");

    Ok(path)
}

/// Check that object storage is usable before any work begins.
///
/// A missing endpoint or service key is a fatal configuration error
/// surfaced to the caller synchronously; no partial run is attempted.
pub fn validate_object_store(config: &AppConfig) -> Result<()> {
    if config.object_store.endpoint.is_empty() {
        return Err(DocsinkError::config(
            "object_store.endpoint is not set. Add it to docsink.toml.",
        ));
    }

    let var_name = &config.object_store.service_key_env;
    match std::env::var(var_name) {
        Ok(val) if !val.is_empty() => Ok(()),
        _ => Err(DocsinkError::config(format!(
            "storage service key not found. Set the {var_name} environment variable."
        ))),
    }
}
