use std::fmt::Write as _;
use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rotor_core::OutputFormat;
use rotor_scheduler::{KeyPoolManager, KeyStatus};
use rotor_session::{FileStateStore, StateStore};
use rotor_vault::{CredentialSource, SecretStore};
use serde::Serialize;

use crate::config_cmds::CommandContext;

#[derive(Debug, Serialize)]
struct PoolReport {
    pool: String,
    source: CredentialSource,
    current: Option<String>,
    eligible: usize,
    keys: Vec<KeyStatus>,
}

pub(crate) async fn handle_keys_status(ctx: &CommandContext, format: OutputFormat) -> Result<()> {
    let config = ctx.load_config()?;
    let secrets = SecretStore::from_config(&config.vault)?;
    let bundle = secrets.load_keys().await?;
    let store: Arc<dyn StateStore> = Arc::new(FileStateStore::new(ctx.state_dir.join("state")));
    let pool = KeyPoolManager::from_bundle(config.key_pool.clone(), &bundle)?
        .with_state_store(store)
        .await?;

    let report = build_report(&pool, bundle.source);
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_report(&report)),
    }
    Ok(())
}

fn build_report(pool: &KeyPoolManager, source: CredentialSource) -> PoolReport {
    PoolReport {
        pool: pool.name().to_string(),
        source,
        current: pool.current_key(),
        eligible: pool.eligible_count(),
        keys: pool.metrics(),
    }
}

fn render_report(report: &PoolReport) -> String {
    let now = Utc::now();
    let mut out = String::new();
    let _ = writeln!(
        out,
        "Pool '{}' ({:?}): {}/{} eligible, current {}",
        report.pool,
        report.source,
        report.eligible,
        report.keys.len(),
        report.current.as_deref().unwrap_or("-")
    );
    let _ = writeln!(
        out,
        "{:<16} {:<18} {:<9} {:>8} {:>8} {:>6}  NOTE",
        "KEY", "FINGERPRINT", "ELIGIBLE", "TOTAL", "FAILED", "429S"
    );
    for key in &report.keys {
        let m = &key.metrics;
        let note = if m.is_rate_limited_at(now) {
            m.rate_limited_until
                .map(|t| format!("limited until {}", t.to_rfc3339()))
                .unwrap_or_default()
        } else if !m.healthy {
            "unhealthy".to_string()
        } else {
            m.last_error.clone().unwrap_or_default()
        };
        let _ = writeln!(
            out,
            "{:<16} {:<18} {:<9} {:>8} {:>8} {:>6}  {}",
            key.id,
            key.fingerprint,
            if key.eligible { "yes" } else { "no" },
            m.total_requests,
            m.failed_requests,
            m.rate_limit_count,
            note
        );
    }
    out
}
