use std::path::PathBuf;

/// Application-level constants
pub const APP_NAME: &str = "Assessmap";
pub const APP_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Overrides the data directory (database, exports).
pub const DATA_DIR_ENV: &str = "ASSESSMAP_DATA_DIR";
/// Overrides the model endpoint base URL.
pub const MODEL_URL_ENV: &str = "ASSESSMAP_MODEL_URL";
/// Overrides the model name sent to the endpoint.
pub const MODEL_NAME_ENV: &str = "ASSESSMAP_MODEL";

pub const DEFAULT_MODEL_URL: &str = "http://localhost:11434";
pub const DEFAULT_MODEL_NAME: &str = "llama3.1:8b";

const DATABASE_FILE: &str = "assessmap.db";

/// Get the application data directory.
/// `$ASSESSMAP_DATA_DIR` if set, otherwise `<local data dir>/assessmap`,
/// falling back to the working directory when the platform has none.
pub fn app_data_dir() -> PathBuf {
    if let Some(dir) = std::env::var_os(DATA_DIR_ENV) {
        return PathBuf::from(dir);
    }
    dirs::data_local_dir()
        .or_else(dirs::home_dir)
        .unwrap_or_else(|| PathBuf::from("."))
        .join("assessmap")
}

/// Path of the SQLite database holding cache, sessions, reviews and audit trail.
pub fn database_path() -> PathBuf {
    app_data_dir().join(DATABASE_FILE)
}

/// Directory for rendered export documents.
pub fn exports_dir() -> PathBuf {
    app_data_dir().join("exports")
}

pub fn model_base_url() -> String {
    std::env::var(MODEL_URL_ENV).unwrap_or_else(|_| DEFAULT_MODEL_URL.to_string())
}

pub fn model_name() -> String {
    std::env::var(MODEL_NAME_ENV).unwrap_or_else(|_| DEFAULT_MODEL_NAME.to_string())
}

/// Filter used when `RUST_LOG` is not set.
pub fn default_log_filter() -> &'static str {
    "info,assessmap=debug,reqwest=warn,hyper=warn"
}
