use std::fmt::Write as _;
use std::path::Path;

use anyhow::Result;
use rotor_core::OutputFormat;
use rotor_scheduler::{
    IdentityBinding, PoolSnapshot, RotationState, SyncCoordinatorState, bindings_path,
    force_unlock, load_coordinator_state, load_pool_snapshot, load_rotation_state, read_bindings,
};
use rotor_session::{FileStateStore, StateStore};
use serde::Serialize;

use crate::config_cmds::CommandContext;

/// Everything persisted for one process.
#[derive(Debug, Serialize)]
struct StateReport {
    process_id: String,
    coordinator: Option<SyncCoordinatorState>,
    identity: Option<RotationState>,
    key_pool: Option<PoolSnapshot>,
}

/// The CLI always reads the on-disk store, whatever backend the engine runs.
fn open_store(state_dir: &Path) -> FileStateStore {
    FileStateStore::new(state_dir.join("state"))
}

async fn collect(store: &dyn StateStore, process_id: &str, pool: &str) -> Result<StateReport> {
    Ok(StateReport {
        process_id: process_id.to_string(),
        coordinator: load_coordinator_state(store, process_id).await?,
        identity: load_rotation_state(store, process_id).await?,
        key_pool: load_pool_snapshot(store, pool).await?,
    })
}

pub(crate) async fn handle_state_show(
    ctx: &CommandContext,
    process_id: Option<String>,
    format: OutputFormat,
) -> Result<()> {
    let config = ctx.load_config()?;
    let process_id = process_id.unwrap_or(config.coordinator.process_id);
    let store = open_store(&ctx.state_dir);
    let report = collect(&store, &process_id, &config.key_pool.name).await?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&report)?),
        OutputFormat::Text => print!("{}", render_report(&report)),
    }
    Ok(())
}

fn render_report(report: &StateReport) -> String {
    let mut out = String::new();
    let _ = writeln!(out, "Process: {}", report.process_id);

    match &report.coordinator {
        Some(state) => {
            let lock = if state.rotation_in_progress {
                format!(
                    "held by {} since {}",
                    state.rotation_id.as_deref().unwrap_or("?"),
                    state
                        .rotation_started_at
                        .map(|t| t.to_rfc3339())
                        .unwrap_or_else(|| "?".to_string())
                )
            } else {
                "free".to_string()
            };
            let _ = writeln!(out, "Rotation lock: {lock}");
            let _ = writeln!(
                out,
                "Rotations: {} completed, {} failed",
                state.total_rotations, state.failed_rotations
            );
            if let Some(at) = state.last_rotation_at {
                let reason = state
                    .last_rotation_reason
                    .map(|r| r.as_str())
                    .unwrap_or("-");
                let _ = writeln!(out, "Last rotation: {} ({reason})", at.to_rfc3339());
            }
            let _ = writeln!(out, "Requests since rotation: {}", state.request_count);
            if let Some(err) = &state.last_error {
                let _ = writeln!(out, "Last error: {err}");
            }
        }
        None => {
            let _ = writeln!(out, "Coordinator: no state recorded");
        }
    }

    if let Some(identity) = &report.identity {
        let _ = writeln!(
            out,
            "Identity: {} ({}/{} requests, {} rotations)",
            identity.current_identity.as_deref().unwrap_or("-"),
            identity.request_count,
            identity.rotation_threshold,
            identity.total_rotations
        );
    }

    if let Some(pool) = &report.key_pool {
        let _ = writeln!(
            out,
            "Current key: {}",
            pool.current.as_deref().unwrap_or("-")
        );
    }
    out
}

pub(crate) async fn handle_state_unlock(
    ctx: &CommandContext,
    process_id: Option<String>,
) -> Result<()> {
    let process_id = match process_id {
        Some(id) => id,
        None => ctx.load_config()?.coordinator.process_id,
    };
    let store = open_store(&ctx.state_dir);
    match force_unlock(&store, &process_id).await? {
        Some(rotation_id) => eprintln!("Cleared rotation lock {rotation_id} for '{process_id}'"),
        None => eprintln!("No rotation lock held for '{process_id}'"),
    }
    Ok(())
}

pub(crate) fn handle_state_bindings(
    ctx: &CommandContext,
    limit: Option<usize>,
    format: OutputFormat,
) -> Result<()> {
    let bindings = last_bindings(&ctx.state_dir, limit)?;
    match format {
        OutputFormat::Json => println!("{}", serde_json::to_string_pretty(&bindings)?),
        OutputFormat::Text => {
            if bindings.is_empty() {
                eprintln!("No identity bindings recorded");
            }
            for b in &bindings {
                println!(
                    "{}  {:<12} {} -> {}  ({}, #{})",
                    b.ts.to_rfc3339(),
                    b.process_id,
                    b.previous.as_deref().unwrap_or("-"),
                    b.current,
                    b.reason,
                    b.total_rotations
                );
            }
        }
    }
    Ok(())
}

fn last_bindings(state_dir: &Path, limit: Option<usize>) -> Result<Vec<IdentityBinding>> {
    let mut bindings = read_bindings(&bindings_path(state_dir))?;
    if let Some(limit) = limit {
        let skip = bindings.len().saturating_sub(limit);
        bindings.drain(..skip);
    }
    Ok(bindings)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;
    use rotor_core::RotationReason;
    use rotor_scheduler::BindingAuditLog;
    use rotor_session::update_typed;

    #[tokio::test]
    async fn test_collect_reads_persisted_records() {
        let tmp = tempfile::tempdir().unwrap();
        let store = open_store(tmp.path());
        update_typed::<SyncCoordinatorState, _, _>(&store, "coordinator/edge", |state| {
            state.rotation_in_progress = true;
            state.rotation_id = Some("01ROTATION".to_string());
            state.rotation_started_at = Some(Utc::now());
            state.total_rotations = 4;
            Ok(())
        })
        .await
        .unwrap();

        let report = collect(&store, "edge", "primary").await.unwrap();
        assert_eq!(report.coordinator.as_ref().unwrap().total_rotations, 4);
        assert!(report.identity.is_none());
        assert!(report.key_pool.is_none());

        let text = render_report(&report);
        assert!(text.contains("held by 01ROTATION"), "{text}");
        assert!(text.contains("4 completed, 0 failed"), "{text}");

        assert_eq!(
            force_unlock(&store, "edge").await.unwrap().as_deref(),
            Some("01ROTATION")
        );
        let report = collect(&store, "edge", "primary").await.unwrap();
        assert!(render_report(&report).contains("Rotation lock: free"));
    }

    #[test]
    fn test_empty_state_renders() {
        let report = StateReport {
            process_id: "default".to_string(),
            coordinator: None,
            identity: None,
            key_pool: None,
        };
        assert!(render_report(&report).contains("no state recorded"));
    }

    #[tokio::test]
    async fn test_last_bindings_limit_keeps_newest() {
        let tmp = tempfile::tempdir().unwrap();
        let log = BindingAuditLog::new(bindings_path(tmp.path()));
        for n in 1..=3u64 {
            log.append(&IdentityBinding {
                v: 1,
                ts: Utc::now(),
                process_id: "edge".to_string(),
                previous: None,
                current: format!("203.0.113.{n}"),
                reason: RotationReason::Threshold,
                total_rotations: n,
            })
            .await
            .unwrap();
        }

        let last = last_bindings(tmp.path(), Some(2)).unwrap();
        let current: Vec<&str> = last.iter().map(|b| b.current.as_str()).collect();
        assert_eq!(current, vec!["203.0.113.2", "203.0.113.3"]);
        assert_eq!(last_bindings(tmp.path(), None).unwrap().len(), 3);
        assert!(last_bindings(&tmp.path().join("missing"), Some(5)).unwrap().is_empty());
    }
}
