use std::path::PathBuf;

pub const DEFAULT_LOG_FILTER: &str = "examd=info";

#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// `tracing_subscriber::EnvFilter` directives.
    pub log_filter: String,
    /// Workspace opened before the first request, if any.
    pub workspace: Option<PathBuf>,
}

impl Config {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        Self {
            log_filter: non_empty("EXAMD_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
            workspace: non_empty("EXAMD_WORKSPACE").map(PathBuf::from),
        }
    }
}
