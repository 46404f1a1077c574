use crate::config::types::{
    Config, CrawlerConfig, PageMapping, StorageConfig, TransformSpec, UserAgentConfig,
};
use crate::ConfigError;
use std::collections::HashSet;
use url::Url;

/// One week
const MAX_RETRY_AFTER_CEILING: u64 = 604_800;

/// Validates the entire configuration
pub fn validate(config: &Config) -> Result<(), ConfigError> {
    validate_crawler_config(&config.crawler)?;
    validate_user_agent_config(&config.user_agent)?;
    validate_storage_config(&config.storage)?;
    validate_mappings(&config.mappings)?;
    validate_seeds(config)?;
    Ok(())
}

/// Validates crawler configuration
fn validate_crawler_config(config: &CrawlerConfig) -> Result<(), ConfigError> {
    if config.max_concurrent_fetches < 1 || config.max_concurrent_fetches > 256 {
        return Err(ConfigError::Validation(format!(
            "max_concurrent_fetches must be between 1 and 256, got {}",
            config.max_concurrent_fetches
        )));
    }

    if config.timeout_ms == 0 {
        return Err(ConfigError::Validation("timeout_ms must be > 0".to_string()));
    }

    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "max_attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.base_backoff_ms > config.max_backoff_ms {
        return Err(ConfigError::Validation(format!(
            "base_backoff_ms ({}) must not exceed max_backoff_ms ({})",
            config.base_backoff_ms, config.max_backoff_ms
        )));
    }

    if config.max_retry_after_secs == 0 || config.max_retry_after_secs > MAX_RETRY_AFTER_CEILING {
        return Err(ConfigError::Validation(format!(
            "max_retry_after_secs must be between 1 and {}, got {}",
            MAX_RETRY_AFTER_CEILING, config.max_retry_after_secs
        )));
    }

    if config.jitter_percent > 100 {
        return Err(ConfigError::Validation(format!(
            "jitter_percent must be <= 100, got {}",
            config.jitter_percent
        )));
    }

    Ok(())
}

/// Validates user agent configuration
fn validate_user_agent_config(config: &UserAgentConfig) -> Result<(), ConfigError> {
    if config.crawler_name.is_empty() {
        return Err(ConfigError::Validation(
            "crawler_name cannot be empty".to_string(),
        ));
    }

    if !config
        .crawler_name
        .chars()
        .all(|c| c.is_alphanumeric() || c == '-')
    {
        return Err(ConfigError::Validation(format!(
            "crawler_name must contain only alphanumeric characters and hyphens, got '{}'",
            config.crawler_name
        )));
    }

    Url::parse(&config.contact_url)
        .map_err(|e| ConfigError::InvalidUrl(format!("Invalid contact_url: {}", e)))?;

    validate_email(&config.contact_email)?;

    Ok(())
}

/// Validates storage configuration
fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.database_path.is_empty() {
        return Err(ConfigError::Validation(
            "database_path cannot be empty".to_string(),
        ));
    }

    if config.pool_size < 1 {
        return Err(ConfigError::Validation(format!(
            "pool_size must be >= 1, got {}",
            config.pool_size
        )));
    }

    if config.max_attempts < 1 {
        return Err(ConfigError::Validation(format!(
            "storage max_attempts must be >= 1, got {}",
            config.max_attempts
        )));
    }

    if config.max_consecutive_failures < 1 {
        return Err(ConfigError::Validation(
            "max_consecutive_failures must be >= 1".to_string(),
        ));
    }

    Ok(())
}

/// Validates mapping definitions: unique names, known field references, and
/// selectors/patterns that compile
fn validate_mappings(mappings: &[PageMapping]) -> Result<(), ConfigError> {
    let mut names = HashSet::new();
    for mapping in mappings {
        if !names.insert(mapping.name.as_str()) {
            return Err(ConfigError::Validation(format!(
                "Duplicate mapping name '{}'",
                mapping.name
            )));
        }
    }

    for mapping in mappings {
        if mapping.fields.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Mapping '{}' must declare at least one field",
                mapping.name
            )));
        }

        if mapping.identity_fields.is_empty() {
            return Err(ConfigError::Validation(format!(
                "Mapping '{}' must declare at least one identity field",
                mapping.name
            )));
        }

        let mut field_names = HashSet::new();
        for field in &mapping.fields {
            if !field_names.insert(field.name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Mapping '{}' declares field '{}' twice",
                    mapping.name, field.name
                )));
            }
            validate_selector(&field.selector)?;
            if let Some(TransformSpec::Regex(pattern)) = &field.transform {
                regex::Regex::new(pattern).map_err(|e| {
                    ConfigError::InvalidPattern(format!("'{}' in field '{}': {}", pattern, field.name, e))
                })?;
            }
        }

        for name in mapping.identity_fields.iter().chain(&mapping.tracked_fields) {
            if !field_names.contains(name.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Mapping '{}' references undeclared field '{}'",
                    mapping.name, name
                )));
            }
        }

        if let Some(selector) = &mapping.record_selector {
            validate_selector(selector)?;
        }
        if let Some(selector) = &mapping.ready_selector {
            validate_selector(selector)?;
        }

        for rule in &mapping.follow {
            validate_selector(&rule.selector)?;
            if !names.contains(rule.mapping.as_str()) {
                return Err(ConfigError::Validation(format!(
                    "Follow rule in '{}' references unknown mapping '{}'",
                    mapping.name, rule.mapping
                )));
            }
        }
    }

    Ok(())
}

/// Validates seed entries
fn validate_seeds(config: &Config) -> Result<(), ConfigError> {
    for seed in &config.seeds {
        let url = Url::parse(&seed.url)
            .map_err(|e| ConfigError::InvalidUrl(format!("Invalid seed URL '{}': {}", seed.url, e)))?;

        if url.scheme() != "http" && url.scheme() != "https" {
            return Err(ConfigError::Validation(format!(
                "Seed URL '{}' must use http or https",
                seed.url
            )));
        }

        if config.mapping(&seed.mapping).is_none() {
            return Err(ConfigError::Validation(format!(
                "Seed '{}' references unknown mapping '{}'",
                seed.url, seed.mapping
            )));
        }
    }
    Ok(())
}

fn validate_selector(selector: &str) -> Result<(), ConfigError> {
    scraper::Selector::parse(selector)
        .map(|_| ())
        .map_err(|e| ConfigError::InvalidSelector {
            selector: selector.to_string(),
            message: format!("{:?}", e),
        })
}

/// Basic email validation
fn validate_email(email: &str) -> Result<(), ConfigError> {
    if email.is_empty() {
        return Err(ConfigError::Validation(
            "contact_email cannot be empty".to_string(),
        ));
    }

    let parts: Vec<&str> = email.split('@').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(ConfigError::Validation(format!(
            "Invalid email format: '{}'",
            email
        )));
    }

    if !parts[1].contains('.') {
        return Err(ConfigError::Validation(format!(
            "Invalid email domain: '{}'",
            email
        )));
    }

    Ok(())
}
