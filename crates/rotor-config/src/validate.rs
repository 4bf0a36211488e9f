use anyhow::Result;
use rotor_core::RotorError;

use crate::config::{RetryConfig, RotorConfig};

/// Validate a loaded configuration.
/// Returns Ok(()) if valid, or `RotorError::InvalidConfig` naming the first bad field.
pub fn validate_config(config: &RotorConfig) -> Result<()> {
    validate_retry("retry", &config.retry)?;
    validate_retry("key_pool.exhaustion_retry", &config.key_pool.exhaustion_retry)?;
    validate_retry("vault.retry", &config.vault.retry)?;
    validate_breaker(config)?;
    validate_queue(config)?;
    validate_key_pool(config)?;
    validate_ip_rotation(config)?;
    validate_coordinator(config)?;
    validate_providers(config)?;
    Ok(())
}

fn invalid(message: String) -> anyhow::Error {
    RotorError::InvalidConfig(message).into()
}

fn validate_retry(section: &str, retry: &RetryConfig) -> Result<()> {
    if retry.max_attempts == 0 {
        return Err(invalid(format!("{section}.max_attempts must be >= 1 (got 0)")));
    }
    if !(0.0..=1.0).contains(&retry.jitter) {
        return Err(invalid(format!(
            "{section}.jitter must be within [0, 1] (got {})",
            retry.jitter
        )));
    }
    if retry.max_delay_ms < retry.base_delay_ms {
        return Err(invalid(format!(
            "{section}.max_delay_ms ({}) must be >= base_delay_ms ({})",
            retry.max_delay_ms, retry.base_delay_ms
        )));
    }
    Ok(())
}

fn validate_breaker(config: &RotorConfig) -> Result<()> {
    let breaker = &config.circuit_breaker;
    if breaker.failure_threshold == 0 {
        return Err(invalid(
            "circuit_breaker.failure_threshold must be >= 1 (got 0)".to_string(),
        ));
    }
    if breaker.success_threshold == 0 {
        return Err(invalid(
            "circuit_breaker.success_threshold must be >= 1 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_queue(config: &RotorConfig) -> Result<()> {
    if config.queue.max_retries == 0 {
        return Err(invalid("queue.max_retries must be >= 1 (got 0)".to_string()));
    }
    if config.queue.visibility_timeout_ms == 0 {
        return Err(invalid(
            "queue.visibility_timeout_ms must be > 0 (got 0)".to_string(),
        ));
    }
    Ok(())
}

fn validate_key_pool(config: &RotorConfig) -> Result<()> {
    let pool = &config.key_pool;
    if pool.name.trim().is_empty() {
        return Err(invalid("key_pool.name cannot be empty".to_string()));
    }
    if pool.max_requests_per_key == Some(0) {
        return Err(invalid(
            "key_pool.max_requests_per_key must be >= 1 when set (got 0)".to_string(),
        ));
    }
    if pool.max_consecutive_errors == 0 {
        return Err(invalid(
            "key_pool.max_consecutive_errors must be >= 1 (got 0)".to_string(),
        ));
    }
    if let Some(fallback) = &pool.fallback_slot {
        if pool.slots.iter().any(|slot| slot == fallback) {
            return Err(invalid(format!(
                "key_pool.fallback_slot '{fallback}' is also listed in key_pool.slots"
            )));
        }
    }
    Ok(())
}

fn validate_ip_rotation(config: &RotorConfig) -> Result<()> {
    let ip = &config.ip_rotation;
    if ip.min_requests_before_rotation == 0 {
        return Err(invalid(
            "ip_rotation.min_requests_before_rotation must be >= 1 (got 0)".to_string(),
        ));
    }
    if ip.max_requests_before_rotation < ip.min_requests_before_rotation {
        return Err(invalid(format!(
            "ip_rotation.max_requests_before_rotation ({}) must be >= min_requests_before_rotation ({})",
            ip.max_requests_before_rotation, ip.min_requests_before_rotation
        )));
    }
    if ip.max_pause_minutes < ip.min_pause_minutes {
        return Err(invalid(format!(
            "ip_rotation.max_pause_minutes ({}) must be >= min_pause_minutes ({})",
            ip.max_pause_minutes, ip.min_pause_minutes
        )));
    }
    Ok(())
}

fn validate_coordinator(config: &RotorConfig) -> Result<()> {
    let coordinator = &config.coordinator;
    if coordinator.process_id.trim().is_empty() {
        return Err(invalid("coordinator.process_id cannot be empty".to_string()));
    }
    if coordinator.process_id.contains(['/', '\\']) {
        return Err(invalid(format!(
            "coordinator.process_id '{}' must not contain path separators",
            coordinator.process_id
        )));
    }
    if coordinator.rotation_lock_timeout_ms == 0 {
        return Err(invalid(
            "coordinator.rotation_lock_timeout_ms must be > 0 (got 0)".to_string(),
        ));
    }
    // The identity pause and the session restore both run with the lock held.
    let held_ms = config
        .ip_rotation
        .max_pause_minutes
        .saturating_mul(60_000)
        .saturating_add(coordinator.session_restore_timeout_ms);
    if coordinator.rotation_lock_timeout_ms <= held_ms {
        return Err(invalid(format!(
            "coordinator.rotation_lock_timeout_ms ({}) must exceed ip_rotation.max_pause_minutes * 60000 + session_restore_timeout_ms ({held_ms})",
            coordinator.rotation_lock_timeout_ms
        )));
    }
    if coordinator.rotation_interval_min_ms == 0 {
        return Err(invalid(
            "coordinator.rotation_interval_min_ms must be > 0 (got 0)".to_string(),
        ));
    }
    if coordinator.rotation_interval_max_ms < coordinator.rotation_interval_min_ms {
        return Err(invalid(format!(
            "coordinator.rotation_interval_max_ms ({}) must be >= rotation_interval_min_ms ({})",
            coordinator.rotation_interval_max_ms, coordinator.rotation_interval_min_ms
        )));
    }
    Ok(())
}

fn validate_providers(config: &RotorConfig) -> Result<()> {
    let providers = &config.providers;
    if !providers.preference_weight.is_finite() || providers.preference_weight < 0.0 {
        return Err(invalid(format!(
            "providers.preference_weight must be a non-negative number (got {})",
            providers.preference_weight
        )));
    }
    for (field, value) in [
        ("consensus_min_confidence", providers.consensus_min_confidence),
        ("consensus_min_agreement", providers.consensus_min_agreement),
    ] {
        if !(0.0..=1.0).contains(&value) {
            return Err(invalid(format!(
                "providers.{field} must be within [0, 1] (got {value})"
            )));
        }
    }
    Ok(())
}
