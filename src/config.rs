use serde::Deserialize;

/// Local emulator address used when no store URL is configured.
pub const EMULATOR_STORE_URL: &str = "http://127.0.0.1:8080";

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Base URL of the document store. Set via STUDYMATE_STORE_URL.
    pub store_url: String,
    pub api_key: Option<String>,
    /// Collection holding notification documents.
    /// Set via STUDYMATE_NOTIFICATIONS_COLLECTION. Default: "notifications".
    pub collection: String,
    /// Cap on notifications materialized per feed. None = unbounded.
    pub feed_limit: Option<usize>,
    /// Timeout for one-shot pulls and updates. Default: 10.
    pub request_timeout_secs: u64,
}

impl Config {
    pub fn is_emulator(&self) -> bool {
        let host = url::Url::parse(&self.store_url)
            .ok()
            .and_then(|u| u.host_str().map(str::to_string));
        matches!(host.as_deref(), Some("127.0.0.1") | Some("localhost") | Some("[::1]"))
    }
}

pub fn load() -> anyhow::Result<Config> {
    dotenvy::dotenv().ok();
    from_lookup(|key| std::env::var(key).ok())
}

/// Build a config from an arbitrary variable source.
pub fn from_lookup<F>(var: F) -> anyhow::Result<Config>
where
    F: Fn(&str) -> Option<String>,
{
    let store_url = var("STUDYMATE_STORE_URL")
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| EMULATOR_STORE_URL.into());

    let feed_limit = match var("STUDYMATE_FEED_LIMIT") {
        Some(v) if !v.trim().is_empty() => {
            let limit: usize = v
                .trim()
                .parse()
                .map_err(|_| anyhow::anyhow!("STUDYMATE_FEED_LIMIT must be a positive integer, got '{}'", v))?;
            if limit == 0 {
                anyhow::bail!("STUDYMATE_FEED_LIMIT must be greater than zero");
            }
            Some(limit)
        }
        _ => None,
    };

    let cfg = Config {
        store_url,
        api_key: var("STUDYMATE_API_KEY").filter(|v| !v.is_empty()),
        collection: var("STUDYMATE_NOTIFICATIONS_COLLECTION")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "notifications".into()),
        feed_limit,
        request_timeout_secs: var("STUDYMATE_REQUEST_TIMEOUT_SECS")
            .and_then(|v| v.parse().ok())
            .unwrap_or(10),
    };

    if cfg.is_emulator() {
        let env_mode = var("STUDYMATE_ENV")
            .or_else(|| var("RUST_ENV"))
            .unwrap_or_default();
        if env_mode == "production" {
            anyhow::bail!(
                "STUDYMATE_STORE_URL points at a local emulator ({}). \
                 Set the hosted store URL before running in production.",
                cfg.store_url
            );
        }
        tracing::debug!(url = %cfg.store_url, "using local document store emulator");
    }

    Ok(cfg)
}
