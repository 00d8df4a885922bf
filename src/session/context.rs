use crate::error::StoreError;
use std::panic::{self, AssertUnwindSafe};
use tracing::warn;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionStatus {
    Active,
    Failed,
    Disposed,
    DisposedWithFailure,
}

impl SessionStatus {
    pub fn is_disposed(self) -> bool {
        matches!(self, Self::Disposed | Self::DisposedWithFailure)
    }

    pub fn is_failed(self) -> bool {
        matches!(self, Self::Failed | Self::DisposedWithFailure)
    }
}

/// Failure bookkeeping for one session. Every session operation runs
/// through [`ExecutionContext::try_op`], so an error escaping any of them
/// leaves the session failed.
#[derive(Debug)]
pub struct ExecutionContext {
    session_id: Uuid,
    status: SessionStatus,
    aborted: bool,
}

impl ExecutionContext {
    pub fn new(session_id: Uuid) -> Self {
        Self {
            session_id,
            status: SessionStatus::Active,
            aborted: false,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn status(&self) -> SessionStatus {
        self.status
    }

    pub fn is_aborted(&self) -> bool {
        self.aborted
    }

    /// Suppresses every further operation and the final commit without
    /// marking the session failed.
    pub fn abort(&mut self) {
        self.aborted = true;
    }

    /// Returns whether this call moved the session from Active to Failed.
    pub fn mark_as_failed(&mut self, reason: &str) -> bool {
        if self.status != SessionStatus::Active {
            return false;
        }
        warn!(session_id = %self.session_id, reason, "session marked as failed");
        self.status = SessionStatus::Failed;
        true
    }

    pub fn ensure_not_disposed(&self) -> Result<(), StoreError> {
        if self.status.is_disposed() {
            return Err(StoreError::SessionDisposed {
                session_id: self.session_id,
            });
        }
        Ok(())
    }

    /// Runs `op` on behalf of the session. An aborted session yields
    /// `T::default()` without running it, a failed one refuses it. Errors
    /// and panics escaping `op` fail the session and are passed on as is.
    pub fn try_op<T, F>(&mut self, op: F) -> Result<T, StoreError>
    where
        T: Default,
        F: FnOnce() -> Result<T, StoreError>,
    {
        self.ensure_not_disposed()?;
        if self.aborted {
            return Ok(T::default());
        }
        if self.status == SessionStatus::Failed {
            return Err(StoreError::SessionAlreadyFailed {
                session_id: self.session_id,
            });
        }
        match panic::catch_unwind(AssertUnwindSafe(op)) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => {
                self.mark_as_failed(err.code_str());
                Err(err)
            }
            Err(payload) => {
                self.mark_as_failed("operation panicked");
                panic::resume_unwind(payload)
            }
        }
    }

    /// First half of disposal. Fails when the session was already disposed,
    /// otherwise reports whether the session had failed.
    pub fn begin_dispose(&self) -> Result<bool, StoreError> {
        if self.status.is_disposed() {
            return Err(StoreError::SessionAlreadyDisposed {
                session_id: self.session_id,
            });
        }
        Ok(self.status == SessionStatus::Failed)
    }

    pub fn finish_dispose(&mut self, with_failure: bool) {
        self.status = if with_failure {
            SessionStatus::DisposedWithFailure
        } else {
            SessionStatus::Disposed
        };
    }
}
