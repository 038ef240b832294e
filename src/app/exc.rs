//! The EXC (execution context) state machine.

use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::app::recipe::Recipe;
use crate::error::{Result, RtrmError};

/// `uid = (pid << K) | exc_id` — see [`make_uid`].
pub const EXC_ID_BITS: u32 = 8;

pub fn make_uid(pid: u32, exc_id: u8) -> u64 {
    ((pid as u64) << EXC_ID_BITS) | exc_id as u64
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExcState {
    Disabled,
    Ready,
    Sync,
    Running,
    Finished,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SyncState {
    Starting,
    Reconf,
    Migrec,
    Migrate,
    Blocked,
    None,
}

/// Legal transitions of the lifecycle graph. Returns
/// `Ok(())` if `from -> to` is legal, otherwise a `Lifecycle` error.
fn check_transition(uid: u64, from: ExcState, to: ExcState) -> Result<()> {
    use ExcState::*;
    let legal = matches!(
        (from, to),
        (Disabled, Ready)
            | (Ready, Sync)
            | (Sync, Running)
            | (Sync, Ready) // rollback on sync failure/timeout
            | (Running, Sync)
            | (Running, Finished)
            | (Running, Disabled)
            | (Sync, Disabled) // platform-fatal during sync
            | (Finished, Disabled) // re-registration after restart
    );
    if legal {
        Ok(())
    } else {
        Err(RtrmError::Lifecycle {
            uid,
            from: format!("{from:?}"),
            to: format!("{to:?}"),
        })
    }
}

/// Application-supplied flags.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct ExcFlags {
    pub remote: bool,
    pub has_platform_data: bool,
}

/// One execution context belonging to a registered application.
#[derive(Debug, Clone)]
pub struct Exc {
    pub uid: u64,
    pub name: String,
    pub priority: u8,
    pub state: ExcState,
    pub sync_state: SyncState,
    pub current_awm: Option<u32>,
    pub next_awm: Option<u32>,
    pub recipe: Arc<Recipe>,
    pub flags: ExcFlags,
}

impl Exc {
    pub fn new(uid: u64, name: impl Into<String>, priority: u8, recipe: Arc<Recipe>) -> Self {
        Self {
            uid,
            name: name.into(),
            priority,
            state: ExcState::Disabled,
            sync_state: SyncState::None,
            current_awm: None,
            next_awm: None,
            recipe,
            flags: ExcFlags::default(),
        }
    }

    /// Transition this EXC to `to`, validating the lifecycle graph and the
    /// `CurrentAWM`/`NextAWM` invariants that must hold in each state.
    pub fn transition(&mut self, to: ExcState) -> Result<()> {
        check_transition(self.uid, self.state, to)?;
        self.state = to;
        match to {
            ExcState::Ready | ExcState::Disabled | ExcState::Finished => {
                self.next_awm = None;
                if matches!(to, ExcState::Disabled | ExcState::Finished) {
                    self.current_awm = None;
                }
            }
            ExcState::Sync => {}
            ExcState::Running => {
                if let Some(next) = self.next_awm.take() {
                    self.current_awm = Some(next);
                }
            }
        }
        self.sync_state = SyncState::None;
        Ok(())
    }

    pub fn begin_sync(&mut self, next_awm: u32, sync_state: SyncState) -> Result<()> {
        check_transition(self.uid, self.state, ExcState::Sync)?;
        self.state = ExcState::Sync;
        self.next_awm = Some(next_awm);
        self.sync_state = sync_state;
        Ok(())
    }

    /// Roll back a failed/timed-out sync to the previous AWM and state.
    pub fn rollback_sync(&mut self) -> Result<()> {
        self.next_awm = None;
        self.sync_state = SyncState::None;
        self.state = if self.current_awm.is_some() {
            ExcState::Running
        } else {
            ExcState::Ready
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::app::recipe::Constraints;

    fn recipe() -> Arc<Recipe> {
        Arc::new(Recipe {
            name: "r".into(),
            awms: vec![],
            constraints: Constraints::default(),
        })
    }

    #[test]
    fn uid_packs_pid_and_exc_id() {
        let uid = make_uid(7, 2);
        assert_eq!(uid, (7u64 << EXC_ID_BITS) | 2);
    }

    #[test]
    fn full_lifecycle_happy_path() {
        let mut exc = Exc::new(1, "e1", 10, recipe());
        exc.transition(ExcState::Ready).unwrap();
        exc.begin_sync(0, SyncState::Starting).unwrap();
        assert_eq!(exc.state, ExcState::Sync);
        assert_eq!(exc.next_awm, Some(0));
        exc.transition(ExcState::Running).unwrap();
        assert_eq!(exc.state, ExcState::Running);
        assert_eq!(exc.current_awm, Some(0));
        assert_eq!(exc.next_awm, None);
    }

    #[test]
    fn illegal_transition_rejected() {
        let mut exc = Exc::new(1, "e1", 10, recipe());
        let err = exc.transition(ExcState::Running);
        assert!(matches!(err, Err(RtrmError::Lifecycle { .. })));
    }

    #[test]
    fn rollback_returns_to_running_if_had_current_awm() {
        let mut exc = Exc::new(1, "e1", 10, recipe());
        exc.transition(ExcState::Ready).unwrap();
        exc.begin_sync(0, SyncState::Starting).unwrap();
        exc.transition(ExcState::Running).unwrap();
        exc.begin_sync(1, SyncState::Reconf).unwrap();
        exc.rollback_sync().unwrap();
        assert_eq!(exc.state, ExcState::Running);
        assert_eq!(exc.current_awm, Some(0));
    }

    #[test]
    fn rollback_returns_to_ready_if_no_current_awm() {
        let mut exc = Exc::new(1, "e1", 10, recipe());
        exc.transition(ExcState::Ready).unwrap();
        exc.begin_sync(0, SyncState::Starting).unwrap();
        exc.rollback_sync().unwrap();
        assert_eq!(exc.state, ExcState::Ready);
        assert_eq!(exc.current_awm, None);
    }
}
