use std::time::Duration;

/// Engine tuning knobs, loaded from the environment.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Wall-clock budget for one whole pipeline run, subdivided across
    /// retrieval attempts.
    pub global_deadline: Duration,
    /// First retry delay after a timeout; doubles per retry.
    pub retry_base_delay: Duration,
    /// Extra attempts allowed after a first timeout.
    pub max_retries: u32,
    /// Passages requested per entity from the retrieval backend.
    pub top_k: usize,
    /// Minimum relevance score a passage must reach to be kept.
    pub score_threshold: f64,
    /// TTL for cached complete results (hours-scale, bounded).
    pub result_cache_ttl: Duration,
    /// Shorter TTL for cached partial results, so a comparison degraded
    /// by a transient failure is re-attempted sooner (minutes-scale).
    pub partial_cache_ttl: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            global_deadline: Duration::from_secs(30),
            retry_base_delay: Duration::from_millis(250),
            max_retries: 2,
            top_k: 5,
            score_threshold: 0.35,
            result_cache_ttl: Duration::from_secs(2 * 3600),
            partial_cache_ttl: Duration::from_secs(5 * 60),
        }
    }
}

impl EngineConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let defaults = Self::default();
        Ok(Self {
            global_deadline: Duration::from_millis(env_parse(
                "ENGINE_GLOBAL_DEADLINE_MS",
                defaults.global_deadline.as_millis() as u64,
            )?),
            retry_base_delay: Duration::from_millis(env_parse(
                "ENGINE_RETRY_BASE_DELAY_MS",
                defaults.retry_base_delay.as_millis() as u64,
            )?),
            max_retries: env_parse("ENGINE_MAX_RETRIES", defaults.max_retries)?,
            top_k: env_parse("ENGINE_TOP_K", defaults.top_k)?,
            score_threshold: env_parse("ENGINE_SCORE_THRESHOLD", defaults.score_threshold)?,
            result_cache_ttl: Duration::from_secs(env_parse(
                "ENGINE_RESULT_CACHE_TTL_SECS",
                defaults.result_cache_ttl.as_secs(),
            )?),
            partial_cache_ttl: Duration::from_secs(env_parse(
                "ENGINE_PARTIAL_CACHE_TTL_SECS",
                defaults.partial_cache_ttl.as_secs(),
            )?),
        })
    }

    /// Total retrieval attempts allowed per entity task.
    pub fn max_attempts(&self) -> u32 {
        self.max_retries + 1
    }
}

fn env_parse<T: std::str::FromStr>(key: &str, default: T) -> anyhow::Result<T>
where
    T::Err: std::fmt::Display,
{
    match std::env::var(key) {
        Ok(val) => val
            .parse::<T>()
            .map_err(|e| anyhow::anyhow!("Failed to parse env var {key}={val}: {e}")),
        Err(_) => Ok(default),
    }
}
