use std::env;

use crate::queue;

pub const MAX_UPLOAD_SIZE: usize = 50 * 1024 * 1024;
pub const MAX_TIMEOUT_SECS: u64 = 120;
pub const DEFAULT_TIMEOUT_SECS: u64 = 60;

const DEFAULT_ALLOWED_ORIGIN: &str = "https://betterleaf.micwilk.com";

pub struct Config {
    pub api_secret: String,
    pub allowed_origin: String,
    pub bind_addr: String,
    pub max_concurrent: usize,
    pub max_queue_size: usize,
    pub convex: Option<ConvexConfig>,
}

pub struct ConvexConfig {
    pub url: String,
    pub deploy_key: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let api_secret = env::var("LATEX_API_SECRET")
            .ok()
            .filter(|secret| !secret.is_empty())
            .ok_or_else(|| anyhow::anyhow!("LATEX_API_SECRET env var must be set"))?;

        let allowed_origin =
            env::var("ALLOWED_ORIGIN").unwrap_or_else(|_| DEFAULT_ALLOWED_ORIGIN.to_string());
        let bind_addr = env::var("LATEX_BIND").unwrap_or_else(|_| "0.0.0.0:8000".to_string());

        let convex = match (env::var("CONVEX_URL"), env::var("CONVEX_DEPLOY_KEY")) {
            (Ok(url), Ok(deploy_key)) if !url.is_empty() && !deploy_key.is_empty() => {
                Some(ConvexConfig { url, deploy_key })
            }
            _ => {
                tracing::warn!(
                    "CONVEX_URL / CONVEX_DEPLOY_KEY not set — project compilation unavailable"
                );
                None
            }
        };

        Ok(Self {
            api_secret,
            allowed_origin,
            bind_addr,
            max_concurrent: env_usize("LATEX_MAX_CONCURRENT", queue::MAX_CONCURRENT),
            max_queue_size: env_usize("LATEX_MAX_QUEUE_SIZE", queue::MAX_QUEUE_SIZE),
            convex,
        })
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env::var(name)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}
