//! Distributed transaction coordinator.
//!
//! A small two-phase-commit transaction manager: resources enlisted in the
//! ambient transaction are prepared, a commit decision is persisted to the
//! [`log::TxLog`] and the resources are then committed. In-doubt
//! transactions left behind by a crash are resolved by the background
//! recovery sweep in [`recovery`], using presumed-abort semantics: a logged
//! decision means commit, everything else rolls back.

pub mod log;
pub mod recovery;

use std::fmt;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::{DrainError, Result};

use self::log::TxLog;
use self::recovery::RecoveryModule;

/// Distributed transaction identifier.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Xid(Uuid);

impl Xid {
    /// Generate a fresh transaction identifier.
    pub fn generate() -> Self {
        Xid(Uuid::new_v4())
    }

    /// Parse an identifier from its string form.
    pub fn parse(s: &str) -> Result<Self> {
        let uuid = Uuid::parse_str(s)
            .map_err(|e| DrainError::Transaction(format!("invalid xid '{}': {}", s, e)))?;
        Ok(Xid(uuid))
    }
}

impl fmt::Display for Xid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A resource manager's vote during phase 1.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Vote {
    /// The resource can commit the transaction's work.
    Commit,
    /// The resource cannot commit; the whole transaction must roll back.
    Abort,
}

/// Final outcome of a distributed transaction, passed to post-commit hooks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxOutcome {
    Committed,
    RolledBack,
}

/// Hook invoked after a transaction reaches its terminal state.
pub type PostCommitHook = Box<dyn FnOnce(TxOutcome) + Send>;

/// A resource manager participating in two-phase commit.
///
/// Implemented by broker connections; one resource per broker. The same
/// resource may be enlisted through several sessions — the coordinator
/// deduplicates by [`resource_id`](Self::resource_id).
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Stable resource-manager identity (typically the broker URL).
    fn resource_id(&self) -> &str;

    /// Phase 1: vote on whether the work staged under `xid` can commit.
    /// After a `Commit` vote the work is in-doubt until phase 2.
    async fn prepare(&self, xid: &Xid) -> Result<Vote>;

    /// Phase 2: make the work staged under `xid` durable and visible.
    /// Must be idempotent and must succeed for an unknown `xid`.
    async fn commit(&self, xid: &Xid) -> Result<()>;

    /// Discard the work staged under `xid`, restoring consumed messages.
    /// Must be idempotent and must succeed for an unknown `xid`.
    async fn rollback(&self, xid: &Xid) -> Result<()>;

    /// In-doubt (prepared but unresolved) xids at this resource manager.
    async fn recover(&self) -> Result<Vec<Xid>>;
}

struct ActiveTx {
    xid: Xid,
    resources: Vec<Arc<dyn XaResource>>,
    hooks: Vec<PostCommitHook>,
}

/// Two-phase-commit coordinator.
///
/// At most one transaction is active at a time (the orchestrator drives
/// destinations sequentially). Constructed once and passed by reference to
/// every component that needs it; never a process-wide global.
pub struct TxCoordinator {
    log: TxLog,
    active: Mutex<Option<ActiveTx>>,
    /// Xid being begun/committed/rolled back right now. Unlike `active`,
    /// this stays set through the whole commit/rollback body so the
    /// recovery sweep never touches a transaction this process is still
    /// resolving itself.
    in_flight: Mutex<Option<Xid>>,
    recovery: tokio::sync::Mutex<Vec<Box<dyn RecoveryModule>>>,
}

impl TxCoordinator {
    /// Create a coordinator whose decision log lives under `store_dir`.
    pub fn new(store_dir: impl Into<std::path::PathBuf>) -> Result<Self> {
        Ok(Self {
            log: TxLog::open(store_dir)?,
            active: Mutex::new(None),
            in_flight: Mutex::new(None),
            recovery: tokio::sync::Mutex::new(Vec::new()),
        })
    }

    /// Begin a new distributed transaction.
    pub fn begin(&self) -> Result<Xid> {
        let mut active = self.active.lock().expect("tx state poisoned");
        if active.is_some() {
            return Err(DrainError::Transaction(
                "begin: a transaction is already active".into(),
            ));
        }
        let xid = Xid::generate();
        debug!("tx begin: {}", xid);
        *active = Some(ActiveTx {
            xid: xid.clone(),
            resources: Vec::new(),
            hooks: Vec::new(),
        });
        *self.in_flight.lock().expect("tx state poisoned") = Some(xid.clone());
        Ok(xid)
    }

    /// Whether a transaction is currently active.
    pub fn is_active(&self) -> bool {
        self.active.lock().expect("tx state poisoned").is_some()
    }

    /// The active transaction's xid, if any.
    pub fn current_xid(&self) -> Option<Xid> {
        self.active
            .lock()
            .expect("tx state poisoned")
            .as_ref()
            .map(|tx| tx.xid.clone())
    }

    /// Enlist a resource in the active transaction.
    ///
    /// Enlisting the same resource manager twice is a no-op.
    pub fn enlist(&self, resource: Arc<dyn XaResource>) -> Result<()> {
        let mut active = self.active.lock().expect("tx state poisoned");
        let tx = active
            .as_mut()
            .ok_or_else(|| DrainError::Transaction("enlist: no active transaction".into()))?;
        if !tx
            .resources
            .iter()
            .any(|r| r.resource_id() == resource.resource_id())
        {
            debug!("tx {}: enlisted resource '{}'", tx.xid, resource.resource_id());
            tx.resources.push(resource);
        }
        Ok(())
    }

    /// Register a hook to run after the active transaction terminates.
    pub fn register_post_commit(&self, hook: PostCommitHook) -> Result<()> {
        let mut active = self.active.lock().expect("tx state poisoned");
        let tx = active.as_mut().ok_or_else(|| {
            DrainError::Transaction("register_post_commit: no active transaction".into())
        })?;
        tx.hooks.push(hook);
        Ok(())
    }

    fn take_active(&self) -> Option<ActiveTx> {
        self.active.lock().expect("tx state poisoned").take()
    }

    fn clear_in_flight(&self) {
        *self.in_flight.lock().expect("tx state poisoned") = None;
    }

    fn in_flight_xid(&self) -> Option<Xid> {
        self.in_flight.lock().expect("tx state poisoned").clone()
    }

    /// Two-phase commit of the active transaction.
    ///
    /// Any abort vote or prepare failure rolls everything back and raises
    /// [`DrainError::TransactionAborted`]. The commit decision is persisted
    /// before phase 2; a resource that fails *after* the decision is left
    /// in-doubt for the recovery sweep, and the transaction still counts
    /// as committed.
    pub async fn commit(&self) -> Result<()> {
        let result = self.commit_inner().await;
        self.clear_in_flight();
        result
    }

    async fn commit_inner(&self) -> Result<()> {
        let ActiveTx {
            xid,
            resources,
            hooks,
        } = self
            .take_active()
            .ok_or_else(|| DrainError::Transaction("commit: no active transaction".into()))?;

        // Phase 1: collect votes.
        for resource in &resources {
            let vote = match resource.prepare(&xid).await {
                Ok(vote) => vote,
                Err(e) => {
                    Self::rollback_resources(&xid, &resources).await;
                    run_hooks(hooks, TxOutcome::RolledBack);
                    return Err(DrainError::TransactionAborted(format!(
                        "prepare failed at '{}': {}",
                        resource.resource_id(),
                        e
                    )));
                }
            };
            if vote == Vote::Abort {
                Self::rollback_resources(&xid, &resources).await;
                run_hooks(hooks, TxOutcome::RolledBack);
                return Err(DrainError::TransactionAborted(format!(
                    "resource '{}' voted abort",
                    resource.resource_id()
                )));
            }
        }

        // Decision point: once the record is durable the transaction commits.
        if let Err(e) = self.log.record(&xid) {
            Self::rollback_resources(&xid, &resources).await;
            run_hooks(hooks, TxOutcome::RolledBack);
            return Err(DrainError::TransactionAborted(format!(
                "could not persist commit decision for {}: {}",
                xid, e
            )));
        }

        // Phase 2.
        let mut in_doubt = false;
        for resource in &resources {
            if let Err(e) = resource.commit(&xid).await {
                in_doubt = true;
                warn!(
                    "tx {}: commit left in doubt at '{}': {} (recovery will resolve it)",
                    xid,
                    resource.resource_id(),
                    e
                );
            }
        }
        if in_doubt {
            // The decision record stays so the sweep can finish the job.
        } else if let Err(e) = self.log.clear(&xid) {
            warn!("tx {}: could not clear decision record: {}", xid, e);
        }

        debug!("tx commit: {}", xid);
        run_hooks(hooks, TxOutcome::Committed);
        Ok(())
    }

    /// Roll back the active transaction.
    pub async fn rollback(&self) -> Result<()> {
        let ActiveTx {
            xid,
            resources,
            hooks,
        } = self
            .take_active()
            .ok_or_else(|| DrainError::Transaction("rollback: no active transaction".into()))?;
        debug!("tx rollback: {}", xid);
        Self::rollback_resources(&xid, &resources).await;
        run_hooks(hooks, TxOutcome::RolledBack);
        self.clear_in_flight();
        Ok(())
    }

    /// Terminate the active transaction if one is still open.
    ///
    /// Called unconditionally on every pipeline exit path: after a
    /// successful `commit` it is a no-op, after an error it rolls back, so
    /// no `begin` can leak an open transaction.
    pub async fn end(&self) {
        if self.is_active() {
            match self.rollback().await {
                Ok(()) => debug!("tx end: rolled back open transaction"),
                Err(e) => warn!("tx end: rollback failed: {}", e),
            }
        }
    }

    async fn rollback_resources(xid: &Xid, resources: &[Arc<dyn XaResource>]) {
        for resource in resources {
            if let Err(e) = resource.rollback(xid).await {
                warn!(
                    "tx {}: rollback failed at '{}': {} (recovery will resolve it)",
                    xid,
                    resource.resource_id(),
                    e
                );
            }
        }
    }

    /// Register recovery modules; queried by the background sweep.
    pub async fn register_recovery(&self, modules: Vec<Box<dyn RecoveryModule>>) {
        let mut recovery = self.recovery.lock().await;
        recovery.extend(modules);
    }

    /// Spawn the periodic background recovery sweep.
    ///
    /// Runs until `cancel` fires. Unreachable resource managers are logged
    /// and retried on the next sweep, never fatal.
    pub fn spawn_recovery_sweep(
        self: Arc<Self>,
        interval: Duration,
        cancel: CancellationToken,
    ) -> JoinHandle<()> {
        let coordinator = self;
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(interval) => {}
                }
                coordinator.run_recovery_pass().await;
            }
        })
    }

    /// One full recovery pass over all registered modules.
    ///
    /// Resolves every in-doubt xid reported by a reachable resource manager:
    /// commit if the decision log holds its record, roll back otherwise.
    /// Decision records with no remaining in-doubt owner are garbage
    /// collected, but only when every resource manager could be scanned.
    pub async fn run_recovery_pass(&self) {
        let mut modules = self.recovery.lock().await;
        let mut all_reachable = true;
        let mut still_in_doubt: Vec<Xid> = Vec::new();

        for module in modules.iter_mut() {
            while module.has_more().await {
                let resource = match module.resource().await {
                    Ok(resource) => resource,
                    Err(e) => {
                        all_reachable = false;
                        debug!("recovery: target unreachable, retrying next sweep: {}", e);
                        continue;
                    }
                };
                match self.resolve_in_doubt(resource.as_ref()).await {
                    Ok(unresolved) => still_in_doubt.extend(unresolved),
                    Err(e) => {
                        all_reachable = false;
                        debug!(
                            "recovery: scan of '{}' failed, retrying next sweep: {}",
                            resource.resource_id(),
                            e
                        );
                    }
                }
            }
        }

        if all_reachable {
            self.gc_decision_records(&still_in_doubt);
        }
    }

    /// Resolve in-doubt xids at one resource manager. Returns the xids that
    /// could not be resolved in this pass.
    async fn resolve_in_doubt(&self, resource: &dyn XaResource) -> Result<Vec<Xid>> {
        let mut unresolved = Vec::new();
        let busy = self.in_flight_xid();
        for xid in resource.recover().await? {
            // Never touch a transaction this process is still resolving.
            if busy.as_ref() == Some(&xid) {
                unresolved.push(xid);
                continue;
            }
            let outcome = if self.log.contains(&xid) {
                info!(
                    "recovery: committing in-doubt transaction {} at '{}'",
                    xid,
                    resource.resource_id()
                );
                resource.commit(&xid).await
            } else {
                info!(
                    "recovery: rolling back in-doubt transaction {} at '{}'",
                    xid,
                    resource.resource_id()
                );
                resource.rollback(&xid).await
            };
            if let Err(e) = outcome {
                warn!("recovery: could not resolve {}: {}", xid, e);
                unresolved.push(xid);
            }
        }
        Ok(unresolved)
    }

    fn gc_decision_records(&self, still_in_doubt: &[Xid]) {
        let recorded = match self.log.list() {
            Ok(recorded) => recorded,
            Err(e) => {
                warn!("recovery: could not list decision records: {}", e);
                return;
            }
        };
        let busy = self.in_flight_xid();
        for xid in recorded {
            if busy.as_ref() == Some(&xid) {
                continue;
            }
            if !still_in_doubt.contains(&xid) {
                debug!("recovery: clearing resolved decision record {}", xid);
                if let Err(e) = self.log.clear(&xid) {
                    warn!("recovery: could not clear record {}: {}", xid, e);
                }
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn decision_log(&self) -> &TxLog {
        &self.log
    }
}

fn run_hooks(hooks: Vec<PostCommitHook>, outcome: TxOutcome) {
    for hook in hooks {
        hook(outcome);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    /// Scripted resource for coordinator tests.
    struct ScriptedResource {
        id: String,
        vote: Vote,
        in_doubt: Mutex<Vec<Xid>>,
        prepared: AtomicUsize,
        committed: AtomicUsize,
        rolled_back: AtomicUsize,
    }

    impl ScriptedResource {
        fn new(id: &str, vote: Vote) -> Arc<Self> {
            Arc::new(Self {
                id: id.into(),
                vote,
                in_doubt: Mutex::new(Vec::new()),
                prepared: AtomicUsize::new(0),
                committed: AtomicUsize::new(0),
                rolled_back: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl XaResource for ScriptedResource {
        fn resource_id(&self) -> &str {
            &self.id
        }

        async fn prepare(&self, _xid: &Xid) -> Result<Vote> {
            self.prepared.fetch_add(1, Ordering::SeqCst);
            Ok(self.vote)
        }

        async fn commit(&self, _xid: &Xid) -> Result<()> {
            self.committed.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn rollback(&self, _xid: &Xid) -> Result<()> {
            self.rolled_back.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        async fn recover(&self) -> Result<Vec<Xid>> {
            Ok(self.in_doubt.lock().unwrap().clone())
        }
    }

    /// Module handing out one fixed resource per sweep.
    struct StaticModule {
        resource: Arc<ScriptedResource>,
        served: bool,
    }

    #[async_trait]
    impl RecoveryModule for StaticModule {
        async fn has_more(&mut self) -> bool {
            if self.served {
                self.served = false;
                false
            } else {
                self.served = true;
                true
            }
        }

        async fn resource(&mut self) -> Result<Arc<dyn XaResource>> {
            Ok(self.resource.clone())
        }
    }

    fn coordinator() -> (TxCoordinator, tempfile::TempDir) {
        let dir = tempfile::tempdir().unwrap();
        let coordinator = TxCoordinator::new(dir.path()).unwrap();
        (coordinator, dir)
    }

    #[tokio::test]
    async fn test_commit_runs_both_phases() {
        let (tx, _dir) = coordinator();
        let a = ScriptedResource::new("a", Vote::Commit);
        let b = ScriptedResource::new("b", Vote::Commit);

        tx.begin().unwrap();
        tx.enlist(a.clone()).unwrap();
        tx.enlist(b.clone()).unwrap();
        tx.commit().await.unwrap();

        assert_eq!(a.prepared.load(Ordering::SeqCst), 1);
        assert_eq!(b.committed.load(Ordering::SeqCst), 1);
        assert!(!tx.is_active());
    }

    #[tokio::test]
    async fn test_abort_vote_rolls_back_everything() {
        let (tx, _dir) = coordinator();
        let a = ScriptedResource::new("a", Vote::Commit);
        let b = ScriptedResource::new("b", Vote::Abort);

        tx.begin().unwrap();
        tx.enlist(a.clone()).unwrap();
        tx.enlist(b.clone()).unwrap();
        let err = tx.commit().await.unwrap_err();

        assert!(matches!(err, DrainError::TransactionAborted(_)));
        assert_eq!(a.committed.load(Ordering::SeqCst), 0);
        assert_eq!(a.rolled_back.load(Ordering::SeqCst), 1);
        assert_eq!(b.rolled_back.load(Ordering::SeqCst), 1);
        assert!(!tx.is_active());
    }

    #[tokio::test]
    async fn test_post_commit_hooks_see_outcome() {
        let (tx, _dir) = coordinator();
        let outcome = Arc::new(Mutex::new(None));

        tx.begin().unwrap();
        let seen = Arc::clone(&outcome);
        tx.register_post_commit(Box::new(move |o| {
            *seen.lock().unwrap() = Some(o);
        }))
        .unwrap();
        tx.commit().await.unwrap();
        assert_eq!(*outcome.lock().unwrap(), Some(TxOutcome::Committed));

        tx.begin().unwrap();
        let seen = Arc::clone(&outcome);
        tx.register_post_commit(Box::new(move |o| {
            *seen.lock().unwrap() = Some(o);
        }))
        .unwrap();
        tx.rollback().await.unwrap();
        assert_eq!(*outcome.lock().unwrap(), Some(TxOutcome::RolledBack));
    }

    #[tokio::test]
    async fn test_end_rolls_back_open_transaction() {
        let (tx, _dir) = coordinator();
        let a = ScriptedResource::new("a", Vote::Commit);

        tx.begin().unwrap();
        tx.enlist(a.clone()).unwrap();
        tx.end().await;

        assert!(!tx.is_active());
        assert_eq!(a.rolled_back.load(Ordering::SeqCst), 1);

        // And a no-op when nothing is open.
        tx.end().await;
        assert_eq!(a.rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_double_begin_rejected() {
        let (tx, _dir) = coordinator();
        tx.begin().unwrap();
        assert!(matches!(tx.begin(), Err(DrainError::Transaction(_))));
        tx.end().await;
    }

    #[tokio::test]
    async fn test_enlist_deduplicates_by_resource_id() {
        let (tx, _dir) = coordinator();
        let a = ScriptedResource::new("a", Vote::Commit);

        tx.begin().unwrap();
        tx.enlist(a.clone()).unwrap();
        tx.enlist(a.clone()).unwrap();
        tx.commit().await.unwrap();

        assert_eq!(a.prepared.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_never_touches_the_in_flight_transaction() {
        let (tx, _dir) = coordinator();
        let resource = ScriptedResource::new("a", Vote::Commit);

        let xid = tx.begin().unwrap();
        tx.enlist(resource.clone()).unwrap();
        // The broker already reports the open transaction as in-doubt
        // (as it would between prepare and phase 2).
        resource.in_doubt.lock().unwrap().push(xid.clone());
        tx.register_recovery(vec![Box::new(StaticModule {
            resource: resource.clone(),
            served: false,
        }) as Box<dyn RecoveryModule>])
        .await;

        tx.run_recovery_pass().await;
        assert_eq!(resource.rolled_back.load(Ordering::SeqCst), 0);
        assert_eq!(resource.committed.load(Ordering::SeqCst), 0);

        // Once the transaction is finished the sweep may resolve leftovers.
        tx.commit().await.unwrap();
        tx.run_recovery_pass().await;
        assert_eq!(resource.rolled_back.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_decision_record_cleared_after_clean_commit() {
        let (tx, _dir) = coordinator();
        let a = ScriptedResource::new("a", Vote::Commit);

        tx.begin().unwrap();
        tx.enlist(a).unwrap();
        tx.commit().await.unwrap();

        assert!(tx.decision_log().list().unwrap().is_empty());
    }
}
