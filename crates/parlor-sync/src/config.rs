use std::time::Duration;

/// Tunables for the sync engine.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// How many recent messages a room's backfill fetches.
    pub backfill_limit: u32,
    /// How long a typing signal keeps its sender in the presence set.
    pub typing_ttl: Duration,
    /// Minimum gap between two outgoing typing broadcasts.
    pub typing_throttle: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            backfill_limit: 100,
            typing_ttl: Duration::from_secs(3),
            typing_throttle: Duration::from_secs(3),
        }
    }
}

impl EngineConfig {
    /// Reads `PARLOR_BACKFILL_LIMIT`, `PARLOR_TYPING_TTL_MS` and
    /// `PARLOR_TYPING_THROTTLE_MS`, keeping the default for anything unset
    /// or unparsable.
    pub fn from_env() -> Self {
        let defaults = Self::default();

        Self {
            backfill_limit: env_parse("PARLOR_BACKFILL_LIMIT").unwrap_or(defaults.backfill_limit),
            typing_ttl: env_parse("PARLOR_TYPING_TTL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.typing_ttl),
            typing_throttle: env_parse("PARLOR_TYPING_THROTTLE_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.typing_throttle),
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|v| v.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_three_second_window() {
        let config = EngineConfig::default();
        assert_eq!(config.backfill_limit, 100);
        assert_eq!(config.typing_ttl, Duration::from_secs(3));
        assert_eq!(config.typing_throttle, config.typing_ttl);
    }
}
