mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use token_keeper::clock::{ManualClock, SharedClock};
use token_keeper::domain::TokenData;
use token_keeper::maintenance::{JobExecutor, JobName, MaintenanceConfig, MaintenanceScheduler};
use token_keeper::services::{CredentialServices, ServiceOptions};
use token_keeper::vault::{DeleteMode, VaultError};

use common::{FakeProvider, HOUR_MS, Reply, START_MS, TokioClock};

/// Takes 15 seconds per run and records how many runs overlap.
#[derive(Default)]
struct SlowExecutor {
    active: AtomicUsize,
    max_active: AtomicUsize,
    runs: AtomicUsize,
}

#[async_trait]
impl JobExecutor for SlowExecutor {
    async fn execute(&self, _job: JobName) -> token_keeper::Result<String> {
        let active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(active, Ordering::SeqCst);
        self.runs.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(15)).await;
        self.active.fetch_sub(1, Ordering::SeqCst);
        Ok("done".into())
    }
}

#[tokio::test(start_paused = true)]
async fn long_running_job_skips_overlapping_ticks() {
    let config = MaintenanceConfig {
        cleanup_cron: "*/10 * * * * *".into(),
        rotation_cron: "0 0 0 1 1 *".into(),
        sweep_cron: "0 0 0 1 1 *".into(),
        ..Default::default()
    };
    let executor = Arc::new(SlowExecutor::default());
    let clock: SharedClock = Arc::new(TokioClock::new(START_MS));
    let scheduler =
        Arc::new(MaintenanceScheduler::new(config, executor.clone(), clock).unwrap());

    scheduler.start().unwrap();
    // Ticks at 10s, 20s, 30s, 40s and 50s. Each run takes 15s, so the
    // ticks at 20s and 40s land while a run is active.
    tokio::time::sleep(Duration::from_secs(55)).await;
    assert_eq!(scheduler.current_job(), Some(JobName::VaultCleanup));
    scheduler.shutdown().await;

    assert_eq!(executor.max_active.load(Ordering::SeqCst), 1);
    assert_eq!(executor.runs.load(Ordering::SeqCst), 3);

    let history = scheduler.recent_runs(20);
    let executed = history.iter().filter(|r| !r.skipped).count();
    let skipped: Vec<_> = history.iter().filter(|r| r.skipped).collect();
    assert_eq!(executed, 3);
    assert_eq!(skipped.len(), 2);
    assert!(skipped.iter().all(|r| r.job == JobName::VaultCleanup && !r.success));
    assert!(history.iter().filter(|r| !r.skipped).all(|r| r.success));
    assert_eq!(scheduler.current_job(), None);
}

fn services(provider: Arc<FakeProvider>, clock: Arc<ManualClock>) -> CredentialServices {
    CredentialServices::in_memory(provider, clock, ServiceOptions::default()).unwrap()
}

#[tokio::test]
async fn sweep_refreshes_only_tokens_inside_the_window() {
    // Refreshed tokens last three days, past the 24h sweep window.
    let provider = FakeProvider::new(Reply::Issue {
        expires_in: 3 * 24 * 3600,
    });
    let clock = Arc::new(ManualClock::new(START_MS));
    let services = services(provider.clone(), clock);

    for (principal, expires_in_hours) in [("soon", 2), ("tonight", 20), ("later", 48)] {
        services
            .store_user_secret(
                principal,
                TokenData::new("old", format!("r-{principal}"), START_MS + expires_in_hours * HOUR_MS),
            )
            .await
            .unwrap();
    }

    let run = services.run_job("token_refresh_sweep").await.unwrap();
    assert!(run.success, "{:?}", run.error);
    assert!(run.summary.unwrap().contains("refreshed 2"));
    assert_eq!(provider.calls(), 2);

    let mut seen = provider.seen_refresh_tokens();
    seen.sort();
    assert_eq!(seen, vec!["r-soon", "r-tonight"]);
    assert!(services.vault.get("soon").await.unwrap().access_token.starts_with("access-"));
    assert_eq!(services.vault.get("later").await.unwrap().access_token, "old");

    // Nothing left to do on a second pass.
    let again = services.run_job("token_refresh_sweep").await.unwrap();
    assert!(again.summary.unwrap().contains("refreshed 0"));
    assert_eq!(provider.calls(), 2);
}

#[tokio::test]
async fn cleanup_purges_soft_deleted_secrets_after_retention() {
    let provider = FakeProvider::new(Reply::Issue { expires_in: 3600 });
    let clock = Arc::new(ManualClock::new(START_MS));
    let services = services(provider, clock.clone());

    services
        .store_user_secret("gone", TokenData::new("a", "r", START_MS + HOUR_MS))
        .await
        .unwrap();
    services
        .delete_user_secret("gone", DeleteMode::Soft, Some("account closed"))
        .await
        .unwrap();

    let run = services.run_job("vault_cleanup").await.unwrap();
    assert!(run.summary.unwrap().contains("purged 0"));
    assert_eq!(services.vault.deleted_records("gone").await.unwrap().len(), 1);

    clock.advance(Duration::from_secs(31 * 24 * 3600));
    let run = services.run_job("vault_cleanup").await.unwrap();
    assert!(run.success);
    assert!(run.summary.unwrap().contains("purged 1"));
    assert!(matches!(
        services.vault.restore("gone").await,
        Err(VaultError::NotFound(_))
    ));

    let recent = services.scheduler.recent_runs(10);
    assert_eq!(recent.len(), 2);
    assert!(recent.iter().all(|r| r.job == JobName::VaultCleanup));
}
