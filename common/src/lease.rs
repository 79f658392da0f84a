// Instance lease with fencing tokens
//
// Replicas compete for one row per duty slot. The holder proves ownership
// by heartbeating with its token; a heartbeat that matches no row means the
// slot was taken over and ownership is dropped at once.

use crate::clock::Clock;
use crate::config::LeaseConfig;
use crate::db::repositories::JobServiceManagementRepository;
use crate::errors::StorageError;
use crate::models::JobServiceManagementInfo;
use crate::telemetry;
use chrono::{DateTime, Duration, Utc};
use std::sync::{Arc, Mutex};
use tokio::sync::{broadcast, watch};
use tokio::time::{interval, MissedTickBehavior};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Whether a lease row may be claimed by a new holder at `now`
pub fn is_claimable(info: &JobServiceManagementInfo, now: DateTime<Utc>, expiry: Duration) -> bool {
    match (&info.token, info.last_heartbeat) {
        (None, _) => true,
        (Some(_), None) => true,
        (Some(_), Some(heartbeat)) => heartbeat + expiry < now,
    }
}

pub struct InstanceLeaseManager {
    repository: Arc<dyn JobServiceManagementRepository>,
    clock: Arc<dyn Clock>,
    config: LeaseConfig,
    token: String,
    owner_tx: watch::Sender<bool>,
    last_confirmed: Mutex<Option<DateTime<Utc>>>,
}

impl InstanceLeaseManager {
    pub fn new(
        repository: Arc<dyn JobServiceManagementRepository>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
    ) -> Self {
        Self::with_token(repository, clock, config, Uuid::new_v4().to_string())
    }

    /// Manager presenting a fixed fencing token
    pub fn with_token(
        repository: Arc<dyn JobServiceManagementRepository>,
        clock: Arc<dyn Clock>,
        config: LeaseConfig,
        token: impl Into<String>,
    ) -> Self {
        let (owner_tx, _owner_rx) = watch::channel(false);
        Self {
            repository,
            clock,
            config,
            token: token.into(),
            owner_tx,
            last_confirmed: Mutex::new(None),
        }
    }

    pub fn token(&self) -> &str {
        &self.token
    }

    /// Receiver of ownership changes
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.owner_tx.subscribe()
    }

    pub fn is_owner(&self) -> bool {
        *self.owner_tx.borrow()
    }

    fn info(&self) -> JobServiceManagementInfo {
        JobServiceManagementInfo::new(self.config.slot.clone(), self.token.clone())
    }

    fn set_owner(&self, owner: bool) {
        let changed = self.owner_tx.send_if_modified(|current| {
            if *current == owner {
                false
            } else {
                *current = owner;
                true
            }
        });
        if changed {
            telemetry::set_lease_owner(owner);
            if owner {
                info!(slot = %self.config.slot, "Lease acquired");
            } else {
                warn!(slot = %self.config.slot, "Lease lost");
            }
        }
    }

    /// Claim the slot if it is free or expired, then confirm with a
    /// heartbeat
    #[instrument(skip(self), fields(slot = %self.config.slot))]
    pub async fn try_acquire(&self) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let expiry = self.config.expiry();
        let token = self.token.clone();

        let claim = move |current: JobServiceManagementInfo| {
            if current.is_held_by(&token) || is_claimable(&current, now, expiry) {
                JobServiceManagementInfo {
                    id: current.id,
                    token: Some(token.clone()),
                    last_heartbeat: Some(now),
                }
            } else {
                current
            }
        };

        let updated = self
            .repository
            .get_and_update(&self.config.slot, &claim)
            .await?;

        match updated {
            None => {
                debug!("Lease slot missing, creating it");
                self.repository.set(&self.info()).await?;
            }
            Some(row) if !row.is_held_by(&self.token) => {
                debug!("Lease held by another instance");
                self.set_owner(false);
                return Ok(false);
            }
            Some(_) => {}
        }

        self.heartbeat_once().await
    }

    /// Refresh the heartbeat; ownership drops when the token no longer
    /// matches
    #[instrument(skip(self), fields(slot = %self.config.slot))]
    pub async fn heartbeat_once(&self) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let confirmed = self
            .repository
            .heartbeat(&self.info(), now)
            .await?
            .is_some();
        if confirmed {
            *self.last_confirmed.lock().unwrap_or_else(|e| e.into_inner()) = Some(now);
        }
        self.set_owner(confirmed);
        Ok(confirmed)
    }

    /// One lease cycle: owners heartbeat, others try to acquire
    pub async fn tick(&self) -> bool {
        let result = if self.is_owner() {
            self.heartbeat_once().await
        } else {
            self.try_acquire().await
        };

        match result {
            Ok(owner) => owner,
            Err(e) => {
                warn!(error = %e, "Lease store unavailable");
                // keep ownership only while the last confirmation is fresh
                let now = self.clock.now();
                let fresh = self
                    .last_confirmed
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .is_some_and(|at| at + self.config.expiry() >= now);
                if !fresh {
                    self.set_owner(false);
                }
                self.is_owner()
            }
        }
    }

    /// Run lease cycles every heartbeat interval until shutdown, then
    /// release the slot
    pub async fn run(self: Arc<Self>, mut shutdown_rx: broadcast::Receiver<()>) {
        info!(
            slot = %self.config.slot,
            token = %self.token,
            heartbeat_interval_seconds = self.config.heartbeat_interval_seconds,
            "Starting lease manager"
        );

        let mut ticker = interval(self.config.heartbeat_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick().await;
                }
                _ = shutdown_rx.recv() => {
                    info!("Shutdown signal received, stopping lease manager");
                    break;
                }
            }
        }

        if let Err(e) = self.release().await {
            warn!(error = %e, "Failed to release lease on shutdown");
        }
    }

    /// Give up the slot if this instance holds it
    #[instrument(skip(self), fields(slot = %self.config.slot))]
    pub async fn release(&self) -> Result<(), StorageError> {
        if !self.is_owner() {
            return Ok(());
        }

        let released = self.repository.release(&self.info()).await?;
        if released.is_none() {
            debug!("Lease already taken over");
        }
        self.set_owner(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::db::repositories::InMemoryJobServiceManagementRepository;
    use chrono::TimeZone;

    fn config() -> LeaseConfig {
        LeaseConfig {
            slot: "reconciler".to_string(),
            heartbeat_interval_seconds: 10,
            expiry_seconds: 30,
        }
    }

    fn setup() -> (
        Arc<ManualClock>,
        Arc<InMemoryJobServiceManagementRepository>,
    ) {
        let clock = Arc::new(ManualClock::new(
            Utc.with_ymd_and_hms(2026, 3, 1, 8, 0, 0).unwrap(),
        ));
        let repo = Arc::new(InMemoryJobServiceManagementRepository::new());
        (clock, repo)
    }

    #[test]
    fn test_claimable_rules() {
        let now = Utc::now();
        let expiry = Duration::seconds(30);
        let mut info = JobServiceManagementInfo {
            id: "slot".to_string(),
            token: None,
            last_heartbeat: Some(now),
        };
        assert!(is_claimable(&info, now, expiry));

        info.token = Some("a".to_string());
        assert!(!is_claimable(&info, now, expiry));
        assert!(is_claimable(&info, now + Duration::seconds(31), expiry));

        info.last_heartbeat = None;
        assert!(is_claimable(&info, now, expiry));
    }

    #[tokio::test]
    async fn test_stale_token_heartbeat_is_fenced() {
        let (clock, repo) = setup();
        let a = JobServiceManagementInfo::new("slot", "a");
        let b = JobServiceManagementInfo::new("slot", "b");

        repo.set(&a).await.unwrap();
        repo.set(&b).await.unwrap();

        assert!(repo.heartbeat(&a, clock.now()).await.unwrap().is_none());
        let confirmed = repo.heartbeat(&b, clock.now()).await.unwrap().unwrap();
        assert_eq!(confirmed.token.as_deref(), Some("b"));
        assert_eq!(confirmed.last_heartbeat, Some(clock.now()));
    }

    #[tokio::test]
    async fn test_claim_and_heartbeat_share_the_manager_clock() {
        let (clock, repo) = setup();
        let manager = InstanceLeaseManager::with_token(repo.clone(), clock.clone(), config(), "a");

        assert!(manager.try_acquire().await.unwrap());
        let claimed_at = clock.now();
        assert_eq!(repo.row("reconciler").unwrap().last_heartbeat, Some(claimed_at));

        // the row never sees the host time, only the manager's clock
        clock.advance(Duration::seconds(25));
        assert!(manager.heartbeat_once().await.unwrap());
        assert_eq!(
            repo.row("reconciler").unwrap().last_heartbeat,
            Some(claimed_at + Duration::seconds(25))
        );

        let b = InstanceLeaseManager::with_token(repo.clone(), clock.clone(), config(), "b");
        clock.advance(Duration::seconds(30));
        assert!(!b.try_acquire().await.unwrap());
        clock.advance(Duration::seconds(1));
        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test]
    async fn test_first_instance_acquires_missing_slot() {
        let (clock, repo) = setup();
        let manager = InstanceLeaseManager::with_token(repo.clone(), clock, config(), "a");
        let mut ownership = manager.subscribe();

        assert!(manager.try_acquire().await.unwrap());
        assert!(manager.is_owner());
        assert!(ownership.has_changed().unwrap());
        assert!(*ownership.borrow_and_update());
        assert!(repo.row("reconciler").unwrap().is_held_by("a"));
    }

    #[tokio::test]
    async fn test_second_instance_waits_for_expiry() {
        let (clock, repo) = setup();
        let a = InstanceLeaseManager::with_token(repo.clone(), clock.clone(), config(), "a");
        let b = InstanceLeaseManager::with_token(repo.clone(), clock.clone(), config(), "b");

        assert!(a.try_acquire().await.unwrap());
        assert!(!b.try_acquire().await.unwrap());

        clock.advance(Duration::seconds(20));
        assert!(a.tick().await);
        assert!(!b.tick().await);

        // a stops heartbeating
        clock.advance(Duration::seconds(31));
        assert!(b.tick().await);
        assert!(repo.row("reconciler").unwrap().is_held_by("b"));

        // a's next heartbeat is fenced and it steps down
        assert!(!a.tick().await);
        assert!(!a.is_owner());
    }

    #[tokio::test]
    async fn test_release_frees_slot_for_others() {
        let (clock, repo) = setup();
        let a = InstanceLeaseManager::with_token(repo.clone(), clock.clone(), config(), "a");
        let b = InstanceLeaseManager::with_token(repo.clone(), clock, config(), "b");

        assert!(a.try_acquire().await.unwrap());
        a.release().await.unwrap();
        assert!(!a.is_owner());
        assert!(repo.row("reconciler").unwrap().token.is_none());

        assert!(b.try_acquire().await.unwrap());
    }

    #[tokio::test(start_paused = true)]
    async fn test_run_releases_on_shutdown() {
        let (clock, repo) = setup();
        let manager = Arc::new(InstanceLeaseManager::with_token(
            repo.clone(),
            clock,
            config(),
            "a",
        ));
        let mut ownership = manager.subscribe();
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let task = tokio::spawn(manager.clone().run(shutdown_rx));

        ownership.changed().await.unwrap();
        assert!(*ownership.borrow());

        shutdown_tx.send(()).unwrap();
        task.await.unwrap();
        assert!(!manager.is_owner());
        assert!(repo.row("reconciler").unwrap().token.is_none());
    }
}
