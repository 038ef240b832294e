//! Resource Accounter (C2): multi-view allocation bookkeeping with
//! commit/rollback of trial schedules.
//!
//! Views are copy-on-write snapshots identified by an opaque token. View 0
//! is always the committed view; at most one working view may be open per
//! scheduling round.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::Mutex;
use tracing::{debug, warn};

use crate::error::{Result, RtrmError};
use crate::res::path::ResourcePath;
use crate::res::tree::ResourceTree;

pub const COMMITTED_VIEW: u64 = 0;

/// Per-resource, per-view usage state.
///
/// Invariant: `used == apps.values().sum()`, enforced by every mutator in
/// this module — there is no public API that can desynchronize the two.
#[derive(Debug, Clone, Default)]
struct ViewState {
    used: u64,
    apps: HashMap<u64, u64>,
}

impl ViewState {
    fn acquired_by(&self, uid: u64) -> u64 {
        self.apps.get(&uid).copied().unwrap_or(0)
    }
}

/// One view's full per-path state. Entries are created lazily: a path with
/// no entry is equivalent to a fresh `ViewState::default()`.
#[derive(Debug, Clone, Default)]
struct ViewSnapshot {
    nodes: HashMap<String, ViewState>,
}

struct Inner {
    tree: ResourceTree,
    views: HashMap<u64, ViewSnapshot>,
    /// The single owner of the one permitted working view, if any.
    working_owner: Option<String>,
}

/// Multi-view resource accounter. Not `Clone` itself — guards its state
/// behind a plain `Mutex<Inner>`, and callers share one instance across
/// tasks by wrapping it in an external `Arc`.
pub struct ResourceAccounter {
    inner: Mutex<Inner>,
    next_token: AtomicU64,
}

impl ResourceAccounter {
    pub fn new(tree: ResourceTree) -> Self {
        let mut views = HashMap::new();
        views.insert(COMMITTED_VIEW, ViewSnapshot::default());
        Self {
            inner: Mutex::new(Inner {
                tree,
                views,
                working_owner: None,
            }),
            // View 0 is reserved for the committed view.
            next_token: AtomicU64::new(1),
        }
    }

    /// Allocate a new working view. At most one working view may exist at a
    /// time; requesting a second one while the first is
    /// still open is a programming error in the caller — the Scheduler Driver
    /// is the only legitimate caller.
    pub async fn get_view(&self, owner: &str) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        if let Some(existing) = &inner.working_owner {
            return Err(RtrmError::ConfigInvalid(format!(
                "a working view is already owned by {existing}"
            )));
        }
        let token = self.next_token.fetch_add(1, Ordering::SeqCst);
        inner.views.insert(token, ViewSnapshot::default());
        inner.working_owner = Some(owner.to_string());
        debug!(token, owner, "working view allocated");
        Ok(token)
    }

    /// `Available(path, view, exc?)`: `total - reserved - view.used +
    /// (exc ? view.apps[uid] : 0)`. Including the requester's own usage is
    /// mandatory so a scheduler can count a resource it already holds as
    /// available to itself.
    pub async fn available(&self, path: &ResourcePath, view: u64, exc_uid: Option<u64>) -> Result<u64> {
        let inner = self.inner.lock().await;
        let node = inner.tree.get(path)?;
        if !node.is_online() {
            return Ok(0);
        }
        let state = self.read_state(&inner, path, view);
        let already_held = exc_uid.map(|uid| state.acquired_by(uid)).unwrap_or(0);
        let nominal = node.nominal_available();
        Ok(nominal.saturating_sub(state.used).saturating_add(already_held))
    }

    fn read_state(&self, inner: &Inner, path: &ResourcePath, view: u64) -> ViewState {
        let key = path.to_dotted();
        if let Some(snap) = inner.views.get(&view) {
            if let Some(state) = snap.nodes.get(&key) {
                return state.clone();
            }
        }
        // Lazily fall back to the committed view's state.
        if view != COMMITTED_VIEW {
            if let Some(committed) = inner.views.get(&COMMITTED_VIEW) {
                if let Some(state) = committed.nodes.get(&key) {
                    return state.clone();
                }
            }
        }
        ViewState::default()
    }

    /// `Acquire`: returns `min(amount, available)` unless `strict`, in which
    /// case insufficient remainder fails with `AccountingOverCommit` and no
    /// partial state is recorded for this call.
    pub async fn acquire(
        &self,
        exc_uid: u64,
        path: &ResourcePath,
        amount: u64,
        view: u64,
        strict: bool,
    ) -> Result<u64> {
        let mut inner = self.inner.lock().await;
        let node = inner.tree.get(path)?;
        if !node.is_online() {
            if strict && amount > 0 {
                return Err(RtrmError::AccountingOverCommit {
                    view,
                    path: path.to_dotted(),
                    short: amount,
                });
            }
            return Ok(0);
        }
        let nominal = node.nominal_available();
        let mut state = self.read_state(&inner, path, view);
        let already_held = state.acquired_by(exc_uid);
        let available = nominal.saturating_sub(state.used).saturating_add(already_held);

        let acquired = amount.min(available);
        if strict && acquired < amount {
            return Err(RtrmError::AccountingOverCommit {
                view,
                path: path.to_dotted(),
                short: amount - acquired,
            });
        }
        if acquired == 0 {
            return Ok(0);
        }

        *state.apps.entry(exc_uid).or_insert(0) += acquired;
        state.used = state.apps.values().sum();

        let snap = inner.views.entry(view).or_default();
        snap.nodes.insert(path.to_dotted(), state);
        debug!(uid = exc_uid, path = %path.to_dotted(), acquired, view, "resource acquired");
        Ok(acquired)
    }

    /// `Release`: decrements `view.used` by `view.apps[uid]` and removes the
    /// entry entirely.
    pub async fn release(&self, exc_uid: u64, path: &ResourcePath, view: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let mut state = self.read_state(&inner, path, view);
        state.apps.remove(&exc_uid);
        state.used = state.apps.values().sum();
        let snap = inner.views.entry(view).or_default();
        snap.nodes.insert(path.to_dotted(), state);
        debug!(uid = exc_uid, path = %path.to_dotted(), view, "resource released");
        Ok(())
    }

    /// Release every acquisition this EXC holds on `view`, across all paths.
    /// Used by transactional multi-path Acquire call sites to roll back a
    /// partially satisfied request.
    pub async fn release_all(&self, exc_uid: u64, view: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        let paths: Vec<String> = inner
            .views
            .get(&view)
            .map(|s| s.nodes.keys().cloned().collect())
            .unwrap_or_default();
        for key in paths {
            if let Some(snap) = inner.views.get_mut(&view) {
                if let Some(state) = snap.nodes.get_mut(&key) {
                    if state.apps.remove(&exc_uid).is_some() {
                        state.used = state.apps.values().sum();
                    }
                }
            }
        }
        Ok(())
    }

    /// Atomically promote `view` to the committed view: every path touched
    /// by `view` overrides the committed state, and every path the working
    /// view never touched carries over unchanged from the old committed
    /// view. Any other outstanding working view is discarded.
    ///
    /// A working view is a lazy, sparse overlay (see `read_state`), so a
    /// naive swap-in-the-whole-snapshot commit would silently drop every
    /// untouched resource's usage; the merge below is required for that
    /// reason, not just as a performance nicety.
    pub async fn commit(&self, view: u64) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if view == COMMITTED_VIEW {
            return Ok(());
        }
        let working = inner
            .views
            .remove(&view)
            .ok_or_else(|| RtrmError::NotFound(format!("view {view}")))?;
        let mut merged = inner.views.remove(&COMMITTED_VIEW).unwrap_or_default();
        for (path, state) in working.nodes {
            merged.nodes.insert(path, state);
        }
        inner.views.retain(|token, _| *token == COMMITTED_VIEW);
        inner.views.insert(COMMITTED_VIEW, merged);
        inner.working_owner = None;
        debug!(view, "view committed");
        Ok(())
    }

    /// Discard a working view. No-op for view 0.
    pub async fn delete_view(&self, view: u64) {
        if view == COMMITTED_VIEW {
            return;
        }
        let mut inner = self.inner.lock().await;
        inner.views.remove(&view);
        inner.working_owner = None;
        debug!(view, "view discarded");
    }

    /// Move `exc_uid`'s holdings on `view` from `old` paths to `new` paths:
    /// release every `old` entry, then transactionally acquire every `new`
    /// entry. If `new` cannot be fully satisfied, `old` is best-effort
    /// re-acquired before the error is returned, so a failed rebind leaves
    /// the EXC's accounting as it was.
    pub async fn rebind(
        &self,
        exc_uid: u64,
        old: &[(ResourcePath, u64)],
        new: &[(ResourcePath, u64)],
        view: u64,
    ) -> Result<()> {
        for (path, _) in old {
            self.release(exc_uid, path, view).await?;
        }
        match acquire_transactional(self, exc_uid, view, new).await {
            Ok(_) => Ok(()),
            Err(e) => {
                for (path, amount) in old {
                    let _ = self.acquire(exc_uid, path, *amount, view, false).await;
                }
                Err(e)
            }
        }
    }

    /// Current usage of `path` in `view`, for status reporting.
    pub async fn used(&self, path: &ResourcePath, view: u64) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(self.read_state(&inner, path, view).used)
    }

    pub async fn total(&self, path: &ResourcePath) -> Result<u64> {
        let inner = self.inner.lock().await;
        Ok(inner.tree.get(path)?.total)
    }

    /// Run a closure with exclusive mutable access to the underlying tree,
    /// e.g. for the Platform Proxy's `Refresh()` online/offline transitions.
    pub async fn with_tree_mut<R>(&self, f: impl FnOnce(&mut ResourceTree) -> R) -> R {
        let mut inner = self.inner.lock().await;
        f(&mut inner.tree)
    }

    pub async fn with_tree<R>(&self, f: impl FnOnce(&ResourceTree) -> R) -> R {
        let inner = self.inner.lock().await;
        f(&inner.tree)
    }
}

/// Transactional multi-path acquire: tries each `(path, amount)` in order on
/// `view`; if any fails to satisfy in full, every partial acquisition made
/// by this call is released before returning the error.
pub async fn acquire_transactional(
    accounter: &ResourceAccounter,
    exc_uid: u64,
    view: u64,
    requests: &[(ResourcePath, u64)],
) -> Result<Vec<(ResourcePath, u64)>> {
    let mut acquired = Vec::with_capacity(requests.len());
    for (path, amount) in requests {
        match accounter.acquire(exc_uid, path, *amount, view, true).await {
            Ok(got) => acquired.push((path.clone(), got)),
            Err(e) => {
                warn!(uid = exc_uid, path = %path.to_dotted(), "transactional acquire failed, rolling back");
                for (p, _) in &acquired {
                    let _ = accounter.release(exc_uid, p, view).await;
                }
                return Err(e);
            }
        }
    }
    Ok(acquired)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn p(s: &str) -> ResourcePath {
        ResourcePath::parse(s).unwrap()
    }

    async fn fresh() -> ResourceAccounter {
        let mut tree = ResourceTree::new();
        tree.register(p("sys0.cpu0.pe0"), 100).unwrap();
        tree.register(p("sys0.mem0"), 1024).unwrap();
        ResourceAccounter::new(tree)
    }

    #[tokio::test]
    async fn acquire_then_release_restores_view() {
        let acc = fresh().await;
        let view = acc.get_view("sched").await.unwrap();
        let before = acc.available(&p("sys0.cpu0.pe0"), view, None).await.unwrap();
        acc.acquire(42, &p("sys0.cpu0.pe0"), 40, view, true).await.unwrap();
        acc.release(42, &p("sys0.cpu0.pe0"), view).await.unwrap();
        let after = acc.available(&p("sys0.cpu0.pe0"), view, None).await.unwrap();
        assert_eq!(before, after);
    }

    #[tokio::test]
    async fn includes_own_usage_in_availability() {
        let acc = fresh().await;
        let view = acc.get_view("sched").await.unwrap();
        acc.acquire(1, &p("sys0.cpu0.pe0"), 100, view, true).await.unwrap();
        // The same EXC should see the full 100 still "available to it".
        let avail = acc.available(&p("sys0.cpu0.pe0"), view, Some(1)).await.unwrap();
        assert_eq!(avail, 100);
        // A different EXC sees 0.
        let avail_other = acc.available(&p("sys0.cpu0.pe0"), view, Some(2)).await.unwrap();
        assert_eq!(avail_other, 0);
    }

    #[tokio::test]
    async fn strict_acquire_over_commit_fails() {
        let acc = fresh().await;
        let view = acc.get_view("sched").await.unwrap();
        let err = acc.acquire(1, &p("sys0.cpu0.pe0"), 200, view, true).await;
        assert!(matches!(err, Err(RtrmError::AccountingOverCommit { .. })));
    }

    #[tokio::test]
    async fn non_strict_acquire_clamps() {
        let acc = fresh().await;
        let view = acc.get_view("sched").await.unwrap();
        let got = acc.acquire(1, &p("sys0.cpu0.pe0"), 200, view, false).await.unwrap();
        assert_eq!(got, 100);
    }

    #[tokio::test]
    async fn commit_promotes_view_and_discards_old_committed() {
        let acc = fresh().await;
        let view = acc.get_view("sched").await.unwrap();
        acc.acquire(1, &p("sys0.mem0"), 256, view, true).await.unwrap();
        acc.commit(view).await.unwrap();
        let used = acc.used(&p("sys0.mem0"), COMMITTED_VIEW).await.unwrap();
        assert_eq!(used, 256);
    }

    #[tokio::test]
    async fn delete_view_drops_trial_state() {
        let acc = fresh().await;
        let committed_before = acc.used(&p("sys0.cpu0.pe0"), COMMITTED_VIEW).await.unwrap();
        let view = acc.get_view("sched").await.unwrap();
        acc.acquire(1, &p("sys0.cpu0.pe0"), 40, view, true).await.unwrap();
        acc.delete_view(view).await;
        let committed_after = acc.used(&p("sys0.cpu0.pe0"), COMMITTED_VIEW).await.unwrap();
        assert_eq!(committed_before, committed_after);
    }

    #[tokio::test]
    async fn transactional_acquire_rolls_back_partial_failure() {
        let acc = fresh().await;
        let view = acc.get_view("sched").await.unwrap();
        let requests = vec![(p("sys0.cpu0.pe0"), 50), (p("sys0.mem0"), 4096)];
        let err = acquire_transactional(&acc, 7, view, &requests).await;
        assert!(err.is_err());
        let used = acc.used(&p("sys0.cpu0.pe0"), view).await.unwrap();
        assert_eq!(used, 0);
    }

    #[tokio::test]
    async fn commit_preserves_paths_the_working_view_never_touched() {
        let acc = fresh().await;
        let view0 = acc.get_view("sched-0").await.unwrap();
        acc.acquire(1, &p("sys0.mem0"), 256, view0, true).await.unwrap();
        acc.commit(view0).await.unwrap();

        // A later round that only touches cpu0 must not erase mem0's usage.
        let view1 = acc.get_view("sched-1").await.unwrap();
        acc.acquire(2, &p("sys0.cpu0.pe0"), 10, view1, true).await.unwrap();
        acc.commit(view1).await.unwrap();

        let mem_used = acc.used(&p("sys0.mem0"), COMMITTED_VIEW).await.unwrap();
        assert_eq!(mem_used, 256);
        let cpu_used = acc.used(&p("sys0.cpu0.pe0"), COMMITTED_VIEW).await.unwrap();
        assert_eq!(cpu_used, 10);
    }

    #[tokio::test]
    async fn rebind_moves_holdings_between_paths() {
        let acc = fresh().await;
        let view = acc.get_view("sched").await.unwrap();
        acc.acquire(1, &p("sys0.mem0"), 128, view, true).await.unwrap();
        acc.rebind(1, &[(p("sys0.mem0"), 128)], &[(p("sys0.cpu0.pe0"), 10)], view)
            .await
            .unwrap();
        assert_eq!(acc.used(&p("sys0.mem0"), view).await.unwrap(), 0);
        assert_eq!(acc.used(&p("sys0.cpu0.pe0"), view).await.unwrap(), 10);
    }

    #[tokio::test]
    async fn rebind_restores_old_holdings_on_failure() {
        let acc = fresh().await;
        let view = acc.get_view("sched").await.unwrap();
        acc.acquire(1, &p("sys0.mem0"), 128, view, true).await.unwrap();
        let err = acc
            .rebind(1, &[(p("sys0.mem0"), 128)], &[(p("sys0.mem0"), 4096)], view)
            .await;
        assert!(err.is_err());
        assert_eq!(acc.used(&p("sys0.mem0"), view).await.unwrap(), 128);
    }

    #[tokio::test]
    async fn offline_resource_reports_zero_availability() {
        let acc = fresh().await;
        acc.with_tree_mut(|t| t.set_offline(&p("sys0.mem0"))).await.unwrap();
        let avail = acc.available(&p("sys0.mem0"), COMMITTED_VIEW, None).await.unwrap();
        assert_eq!(avail, 0);
    }
}
