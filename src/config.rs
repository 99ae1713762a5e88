use serde::Deserialize;
use std::collections::BTreeSet;
use std::env;
use std::fs;
use std::path::Path;

/// Application configuration
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub upload: UploadConfig,
    #[serde(default)]
    pub scan: ScanConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

/// Which physical backend owns the blob bytes. The commit protocol never
/// looks inside `location`; only the selected backend interprets it.
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_backend")]
    pub backend: String,
    #[serde(default = "default_local_path")]
    pub local_path: String,
    #[serde(default)]
    pub remote: RemoteStorageConfig,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct RemoteStorageConfig {
    #[serde(default)]
    pub endpoint: String,
    #[serde(default)]
    pub bucket: String,
    #[serde(default = "default_remote_prefix")]
    pub prefix: String,
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UploadConfig {
    /// Per-file size ceiling in bytes.
    #[serde(default = "default_max_size")]
    pub max_size: u64,
    /// Global physical storage ceiling in bytes.
    #[serde(default = "default_total_limit")]
    pub total_limit: u64,
    #[serde(default = "default_temp_dir")]
    pub temp_dir: String,
    #[serde(default = "default_blocked_extensions")]
    pub blocked_extensions: Vec<String>,
    /// Empty means any extension not in the blocked list.
    #[serde(default)]
    pub allowed_extensions: Vec<String>,
    /// Empty means any MIME type.
    #[serde(default)]
    pub allowed_mime_types: Vec<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScanConfig {
    #[serde(default = "default_scan_enabled")]
    pub enabled: bool,
    #[serde(default = "default_scan_extensions")]
    pub extensions: Vec<String>,
    #[serde(default = "default_scan_max_bytes")]
    pub max_bytes: u64,
    #[serde(default = "default_scan_max_text_chars")]
    pub max_text_chars: usize,
    #[serde(default = "default_scan_max_pdf_pages")]
    pub max_pdf_pages: u32,
    /// Age a `pending` blob row must reach before the reconciliation sweep
    /// may reclaim it.
    #[serde(default = "default_pending_grace_secs")]
    pub pending_grace_secs: u64,
}

// Default values
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    1608
}

fn default_db_path() -> String {
    "data/securevault.db".to_string()
}

fn default_backend() -> String {
    "local".to_string()
}

fn default_local_path() -> String {
    "data/media".to_string()
}

fn default_remote_prefix() -> String {
    "secure-vault".to_string()
}

fn default_max_size() -> u64 {
    50 * 1024 * 1024
}

fn default_total_limit() -> u64 {
    200 * 1024 * 1024
}

fn default_temp_dir() -> String {
    "data/tmp".to_string()
}

fn default_blocked_extensions() -> Vec<String> {
    ["exe", "bat", "cmd", "com", "scr", "msi", "jar", "sh", "php"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_scan_enabled() -> bool {
    true
}

fn default_scan_extensions() -> Vec<String> {
    ["pdf", "txt", "doc", "docx", "rtf"]
        .iter()
        .map(|s| s.to_string())
        .collect()
}

fn default_scan_max_bytes() -> u64 {
    2 * 1024 * 1024
}

fn default_scan_max_text_chars() -> usize {
    400_000
}

fn default_scan_max_pdf_pages() -> u32 {
    25
}

fn default_pending_grace_secs() -> u64 {
    3600
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            local_path: default_local_path(),
            remote: RemoteStorageConfig::default(),
        }
    }
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            total_limit: default_total_limit(),
            temp_dir: default_temp_dir(),
            blocked_extensions: default_blocked_extensions(),
            allowed_extensions: Vec::new(),
            allowed_mime_types: Vec::new(),
        }
    }
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            enabled: default_scan_enabled(),
            extensions: default_scan_extensions(),
            max_bytes: default_scan_max_bytes(),
            max_text_chars: default_scan_max_text_chars(),
            max_pdf_pages: default_scan_max_pdf_pages(),
            pending_grace_secs: default_pending_grace_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig::default(),
            storage: StorageConfig::default(),
            upload: UploadConfig::default(),
            scan: ScanConfig::default(),
        }
    }
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load() -> anyhow::Result<Self> {
        let mut config = Self::load_from_file()?;
        config.apply_env_overrides();
        config.ensure_directories()?;
        Ok(config)
    }

    /// Load configuration from conf.ini or config.toml
    fn load_from_file() -> anyhow::Result<Self> {
        let config_paths = ["conf.ini", "config.toml", "data/conf.ini", "data/config.toml"];

        for path in config_paths {
            if Path::new(path).exists() {
                let content = fs::read_to_string(path)?;
                let config: Config = toml::from_str(&content)?;
                tracing::info!("Loaded configuration from {}", path);
                return Ok(config);
            }
        }

        tracing::info!("No configuration file found, using defaults");
        Ok(Config::default())
    }

    /// Apply environment variable overrides
    /// Format: SV_CONF_<SECTION>_<KEY>
    fn apply_env_overrides(&mut self) {
        // Server overrides
        if let Ok(val) = env::var("SV_CONF_SERVER_HOST") {
            self.server.host = val;
        }
        if let Ok(val) = env::var("SV_CONF_SERVER_PORT") {
            if let Ok(port) = val.parse() {
                self.server.port = port;
            }
        }

        // Database overrides
        if let Ok(val) = env::var("SV_CONF_DATABASE_PATH") {
            self.database.path = val;
        }

        // Storage overrides
        if let Ok(val) = env::var("SV_CONF_STORAGE_BACKEND") {
            self.storage.backend = val;
        }
        if let Ok(val) = env::var("SV_CONF_STORAGE_LOCAL_PATH") {
            self.storage.local_path = val;
        }
        if let Ok(val) = env::var("SV_CONF_STORAGE_REMOTE_ENDPOINT") {
            self.storage.remote.endpoint = val;
        }
        if let Ok(val) = env::var("SV_CONF_STORAGE_REMOTE_BUCKET") {
            self.storage.remote.bucket = val;
        }
        if let Ok(val) = env::var("SV_CONF_STORAGE_REMOTE_ACCESS_KEY") {
            self.storage.remote.access_key = val;
        }
        if let Ok(val) = env::var("SV_CONF_STORAGE_REMOTE_SECRET_KEY") {
            self.storage.remote.secret_key = val;
        }

        // Upload overrides
        if let Ok(val) = env::var("SV_CONF_UPLOAD_MAX_SIZE") {
            if let Ok(v) = val.parse() {
                self.upload.max_size = v;
            }
        }
        if let Ok(val) = env::var("SV_CONF_UPLOAD_TOTAL_LIMIT") {
            if let Ok(v) = val.parse() {
                self.upload.total_limit = v;
            }
        }
        if let Ok(val) = env::var("SV_CONF_UPLOAD_TEMP_DIR") {
            self.upload.temp_dir = val;
        }
        if let Ok(val) = env::var("SV_CONF_UPLOAD_BLOCKED_EXTENSIONS") {
            self.upload.blocked_extensions = split_list(&val);
        }
        if let Ok(val) = env::var("SV_CONF_UPLOAD_ALLOWED_EXTENSIONS") {
            self.upload.allowed_extensions = split_list(&val);
        }
        if let Ok(val) = env::var("SV_CONF_UPLOAD_ALLOWED_MIME_TYPES") {
            self.upload.allowed_mime_types = split_list(&val);
        }

        // Scan overrides
        if let Ok(val) = env::var("SV_CONF_SCAN_ENABLED") {
            if let Ok(v) = val.parse() {
                self.scan.enabled = v;
            }
        }
        if let Ok(val) = env::var("SV_CONF_SCAN_EXTENSIONS") {
            self.scan.extensions = split_list(&val);
        }
        if let Ok(val) = env::var("SV_CONF_SCAN_MAX_BYTES") {
            if let Ok(v) = val.parse() {
                self.scan.max_bytes = v;
            }
        }
        if let Ok(val) = env::var("SV_CONF_SCAN_MAX_TEXT_CHARS") {
            if let Ok(v) = val.parse() {
                self.scan.max_text_chars = v;
            }
        }
        if let Ok(val) = env::var("SV_CONF_SCAN_MAX_PDF_PAGES") {
            if let Ok(v) = val.parse() {
                self.scan.max_pdf_pages = v;
            }
        }
        if let Ok(val) = env::var("SV_CONF_SCAN_PENDING_GRACE_SECS") {
            if let Ok(v) = val.parse() {
                self.scan.pending_grace_secs = v;
            }
        }
    }

    /// Ensure required directories exist
    fn ensure_directories(&self) -> anyhow::Result<()> {
        if let Some(parent) = Path::new(&self.database.path).parent() {
            fs::create_dir_all(parent)?;
        }
        fs::create_dir_all(&self.upload.temp_dir)?;
        if self.storage.backend == "local" {
            fs::create_dir_all(&self.storage.local_path)?;
        }
        Ok(())
    }
}

impl ScanConfig {
    /// Normalized set of extensions the scanner will look at.
    pub fn supported_extensions(&self) -> BTreeSet<String> {
        let set: BTreeSet<String> = self
            .extensions
            .iter()
            .map(|e| e.trim().trim_start_matches('.').to_lowercase())
            .filter(|e| !e.is_empty())
            .collect();
        if set.is_empty() {
            default_scan_extensions().into_iter().collect()
        } else {
            set
        }
    }
}

fn split_list(val: &str) -> Vec<String> {
    val.split(',')
        .map(|s| s.trim())
        .filter(|s| !s.is_empty())
        .map(|s| s.to_string())
        .collect()
}
