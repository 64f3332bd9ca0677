//! Notify-based rule seed hot-reload watcher.
//!
//! - Watches a single JSON file using notify::RecommendedWatcher.
//! - On create/modify events, reloads and validates the file and upserts its
//!   rules. A bad file is logged and skipped; rules already in the store stay.

use crate::config::loader::{apply_rule_seed, load_rule_seed_from_file};
use crate::decision::DecisionService;
use crate::errors::RateLimitError;
use crate::limiter::BucketStore;
use crate::rules::RuleStore;
use notify::{Event, RecommendedWatcher, RecursiveMode, Watcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Watch the rule seed file and re-apply it whenever it changes.
pub async fn watch_rules_file<R, B>(
    path: PathBuf,
    service: Arc<DecisionService<R, B>>,
) -> Result<(), notify::Error>
where
    R: RuleStore + 'static,
    B: BucketStore + 'static,
{
    // Bridges the watcher's callback thread into this task.
    let (tx, mut rx) = mpsc::channel(1);

    let mut watcher = RecommendedWatcher::new(
        move |res: Result<Event, notify::Error>| {
            if let Err(e) = tx.blocking_send(res) {
                debug!("Failed to send rule file event: {}", e);
            }
        },
        notify::Config::default(),
    )?;

    watcher.watch(&path, RecursiveMode::NonRecursive)?;
    info!("Watching rule seed file for changes: {}", path.display());

    while let Some(res) = rx.recv().await {
        match res {
            Ok(event) => {
                if should_reload(&event) {
                    info!(
                        "Rule seed file change detected. Event: {:?}. Triggering reload.",
                        event.kind
                    );
                    reload_rules(&path, &service).await;
                } else {
                    debug!("Ignoring irrelevant filesystem event: {:?}", event.kind);
                }
            }
            Err(e) => {
                crate::metrics::record_config_reload(false);
                error!("Error watching rule seed file: {}", e);
            }
        }
    }

    warn!("Rule seed watcher task is shutting down.");
    Ok(())
}

fn should_reload(event: &Event) -> bool {
    matches!(
        event.kind,
        notify::EventKind::Modify(_) | notify::EventKind::Create(_)
    )
}

/// Reload the file and upsert its rules; returns whether it was applied.
pub async fn reload_rules<R, B>(path: &Path, service: &DecisionService<R, B>) -> bool
where
    R: RuleStore,
    B: BucketStore,
{
    let seed = match load_rule_seed_from_file(path).await {
        Ok(seed) => seed,
        Err(e) => {
            crate::metrics::record_config_reload(false);
            match e {
                RateLimitError::FileSystemError(io_err) => error!(
                    "Failed to read rule seed file '{}': {}. Keeping stored rules.",
                    path.display(),
                    io_err
                ),
                RateLimitError::JsonError(json_err) => error!(
                    "Failed to parse JSON from '{}': {}. Keeping stored rules.",
                    path.display(),
                    json_err
                ),
                other => error!(
                    "Rule seed file '{}' is invalid: {}. Keeping stored rules.",
                    path.display(),
                    other
                ),
            }
            return false;
        }
    };

    match apply_rule_seed(service, &seed).await {
        Ok(count) => {
            crate::metrics::record_config_reload(true);
            info!("Rule seed hot-reloaded ({} rules upserted).", count);
            true
        }
        Err(e) => {
            crate::metrics::record_config_reload(false);
            error!("Failed to upsert reloaded rules: {}", e);
            false
        }
    }
}
