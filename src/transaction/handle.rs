use std::fmt;
use std::time::{Duration, Instant};

use crate::error::SprocError;
use crate::pool::PooledConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Idle,
    Active,
    Committed,
    RolledBack,
}

impl fmt::Display for TransactionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            TransactionState::Idle => "idle",
            TransactionState::Active => "active",
            TransactionState::Committed => "committed",
            TransactionState::RolledBack => "rolled back",
        };
        f.write_str(name)
    }
}

/// One transaction of a unit of work.
///
/// The connection is held exactly while the state is `Active`.
#[derive(Debug)]
pub struct TransactionHandle {
    state: TransactionState,
    conn: Option<PooledConnection>,
    began_at: Option<Instant>,
}

impl TransactionHandle {
    pub(crate) fn idle() -> Self {
        Self {
            state: TransactionState::Idle,
            conn: None,
            began_at: None,
        }
    }

    pub(crate) fn active(conn: PooledConnection) -> Self {
        Self {
            state: TransactionState::Active,
            conn: Some(conn),
            began_at: Some(Instant::now()),
        }
    }

    #[must_use]
    pub fn state(&self) -> TransactionState {
        self.state
    }

    #[must_use]
    pub fn is_active(&self) -> bool {
        self.state == TransactionState::Active
    }

    /// Time since `begin`, while the transaction is active.
    #[must_use]
    pub fn elapsed(&self) -> Option<Duration> {
        self.began_at
            .filter(|_| self.is_active())
            .map(|at| at.elapsed())
    }

    pub(crate) fn connection_mut(&mut self) -> Option<&mut PooledConnection> {
        if self.is_active() {
            self.conn.as_mut()
        } else {
            None
        }
    }

    /// Move to `outcome` and hand back the connection for the final statement.
    pub(crate) fn close(
        &mut self,
        outcome: TransactionState,
        operation: &str,
    ) -> Result<PooledConnection, SprocError> {
        if !self.is_active() {
            return Err(SprocError::InvalidState(format!(
                "cannot {operation}: transaction is {}",
                self.state
            )));
        }
        self.state = outcome;
        self.conn.take().ok_or_else(|| {
            SprocError::InvalidState(format!("cannot {operation}: connection already released"))
        })
    }

    pub(crate) fn set_state(&mut self, state: TransactionState) {
        self.state = state;
    }

    /// Take the connection of a still-active transaction, leaving the handle rolled back.
    pub(crate) fn abandon(&mut self) -> Option<PooledConnection> {
        if self.is_active() {
            self.state = TransactionState::RolledBack;
            self.conn.take()
        } else {
            None
        }
    }
}
