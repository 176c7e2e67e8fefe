use super::{types::Config, ConfigError};

/// Deepest shard nesting allowed; each level consumes two of the 32 hex digest characters.
pub const MAX_PATH_LEVELS: usize = 8;

/// Validate configuration
/// Currently validates:
/// - Server port is not 0
/// - Shard depth and cache limits are usable
/// - Peer URLs are http(s)
/// - Jitter range is ordered
pub fn validate_config(config: &Config) -> Result<(), ConfigError> {
    if config.server.port == 0 {
        return Err(ConfigError::ValidationError(
            "server.port cannot be 0".to_string(),
        ));
    }

    if config.storage.path_levels > MAX_PATH_LEVELS {
        return Err(ConfigError::ValidationError(format!(
            "storage.path_levels cannot exceed {}",
            MAX_PATH_LEVELS
        )));
    }

    if config.cache.max_open_writers == 0 {
        return Err(ConfigError::ValidationError(
            "cache.max_open_writers cannot be 0".to_string(),
        ));
    }

    if config.cache.drop_take == 0 {
        return Err(ConfigError::ValidationError(
            "cache.drop_take cannot be 0".to_string(),
        ));
    }

    if config.merge.max_concurrent_buckets == 0 {
        return Err(ConfigError::ValidationError(
            "merge.max_concurrent_buckets cannot be 0".to_string(),
        ));
    }

    for peer in &config.sync.peers {
        if !peer.url.starts_with("http://") && !peer.url.starts_with("https://") {
            return Err(ConfigError::ValidationError(format!(
                "sync peer url must start with http:// or https://: {}",
                peer.url
            )));
        }
    }

    if config.sync.jitter_min_secs > config.sync.jitter_max_secs {
        return Err(ConfigError::ValidationError(
            "sync.jitter_min_secs cannot exceed sync.jitter_max_secs".to_string(),
        ));
    }

    if config.publish.page_size == 0 || config.publish.v1_take == 0 {
        return Err(ConfigError::ValidationError(
            "publish.page_size and publish.v1_take must be positive".to_string(),
        ));
    }

    Ok(())
}
