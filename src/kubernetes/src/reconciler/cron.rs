use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use notify::{RecursiveMode, Watcher};
use tokio::sync::watch;

use crate::config::IPAMConfig;
use crate::context::Context;
use crate::error::Error;
use crate::reconciler::Reconciler;

/// Accepts the standard 5-field form as well as the 6-field form with a
/// leading seconds field.
pub fn parse_schedule(expr: &str) -> Result<Schedule, Error> {
    let expr = expr.trim();
    let normalized = if expr.split_whitespace().count() == 5 {
        format!("0 {expr}")
    } else {
        expr.to_string()
    };
    Schedule::from_str(&normalized)
        .map_err(|e| Error::InvalidCronExpression(format!("{expr}: {e}")))
}

/// Runs sweeps on the schedule. When a configuration file is given, its
/// `reconciler_cron_expression` is re-read on every write and the schedule
/// re-armed. A single task runs the sweeps, so two never overlap.
pub async fn run(ctx: Arc<Context>, schedule: Schedule, config_file: Option<PathBuf>) {
    let (tx, mut rx) = watch::channel(schedule);
    // without a watcher the sender must stay alive to keep the channel open
    let _keepalive = match config_file {
        Some(path) => {
            spawn_config_watcher(path, tx);
            None
        }
        None => Some(tx),
    };

    let reconciler = Reconciler::new(ctx.clone());
    // once the sender side is gone the schedule can no longer change; the
    // loop keeps sweeping on the last known one
    let mut watch_open = true;
    loop {
        let next = { rx.borrow().upcoming(Utc).next() };
        let Some(next) = next else {
            tracing::warn!("cron schedule yields no future runs, waiting for a new one");
            if !watch_open || rx.changed().await.is_err() {
                return;
            }
            continue;
        };

        let wait = (next - Utc::now()).to_std().unwrap_or(Duration::ZERO);
        if !watch_open {
            tokio::time::sleep(wait).await;
            sweep(&reconciler, &ctx).await;
            continue;
        }
        tokio::select! {
            _ = tokio::time::sleep(wait) => {
                sweep(&reconciler, &ctx).await;
            }
            changed = rx.changed() => {
                match changed {
                    Ok(()) => tracing::info!("reconciler schedule updated"),
                    Err(_) => watch_open = false,
                }
            }
        }
    }
}

async fn sweep(reconciler: &Reconciler, ctx: &Arc<Context>) {
    match reconciler.run_once().await {
        Ok(report) => {
            ctx.diagnostics.write().await.last_sweep = Utc::now();
            tracing::info!(
                cleaned = report.cleaned_ips.len(),
                overlaps_removed = report.overlaps_removed.len(),
                "reconciler sweep finished"
            );
        }
        Err(e) => tracing::error!(error = %e, "reconciler sweep failed"),
    }
}

// notify delivers on its own thread; bridge updates into the async world
// through the watch channel.
fn spawn_config_watcher(path: PathBuf, tx: watch::Sender<Schedule>) {
    std::thread::spawn(move || {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel();
        let mut watcher = match notify::recommended_watcher(raw_tx) {
            Ok(watcher) => watcher,
            Err(e) => {
                tracing::error!(error = %e, "failed to create the configuration watcher");
                return;
            }
        };
        // watch the directory: configmap mounts swap symlinks instead of
        // writing the file in place
        let dir = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or(Path::new("."));
        if let Err(e) = watcher.watch(dir, RecursiveMode::NonRecursive) {
            tracing::error!(error = %e, dir = %dir.display(), "failed to watch the configuration");
            return;
        }
        tracing::info!(path = %path.display(), "watching configuration for cron changes");

        for event in raw_rx {
            let relevant = matches!(
                &event,
                Ok(ev) if matches!(
                    ev.kind,
                    notify::EventKind::Create(_) | notify::EventKind::Modify(_)
                )
            );
            if !relevant {
                continue;
            }
            match IPAMConfig::from_flatfile(&path) {
                Ok(conf) => match parse_schedule(&conf.reconciler_cron_expression) {
                    Ok(schedule) => {
                        if tx.send(schedule).is_err() {
                            return;
                        }
                    }
                    Err(e) => tracing::warn!(error = %e, "ignoring configuration update"),
                },
                Err(e) => tracing::warn!(error = %e, "failed to re-read configuration"),
            }
        }
    });
}
