//! Mockable time source for the OAuth mocks.
//!
//! Every `exp` claim a mock OAuth server mints is computed from its
//! [`Clock`], never from wall time directly, so scenarios can age tokens
//! deterministically via `test_advance_oauth_clock`.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::error::OAuthError;

/// A time source: real system time or a shiftable mock.
#[derive(Debug, Clone)]
pub enum Clock {
    /// Wall-clock time.
    System,
    /// Mock time, advanced explicitly by tests.
    Mock(Arc<MockClock>),
}

impl Clock {
    /// Creates a mock clock starting at the current wall time.
    #[must_use]
    pub fn mock() -> Self {
        Self::Mock(Arc::new(MockClock::new()))
    }

    /// The current time according to this clock.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        match self {
            Self::System => Utc::now(),
            Self::Mock(mock) => mock.now(),
        }
    }

    /// Whether this clock can be advanced.
    #[must_use]
    pub const fn is_mock(&self) -> bool {
        matches!(self, Self::Mock(_))
    }

    /// Shifts a mock clock forward by `delta`.
    ///
    /// # Errors
    ///
    /// Returns [`OAuthError::NoMockClock`] on a system clock.
    pub fn advance(&self, delta: Duration) -> Result<(), OAuthError> {
        match self {
            Self::System => Err(OAuthError::NoMockClock),
            Self::Mock(mock) => {
                mock.advance(delta);
                Ok(())
            }
        }
    }
}

/// Shiftable clock state.
#[derive(Debug)]
pub struct MockClock {
    now: Mutex<DateTime<Utc>>,
}

impl MockClock {
    /// Creates a mock clock anchored at the current wall time.
    #[must_use]
    pub fn new() -> Self {
        Self {
            now: Mutex::new(Utc::now()),
        }
    }

    /// The current mock time.
    ///
    /// # Panics
    ///
    /// Panics if the clock mutex is poisoned.
    #[must_use]
    pub fn now(&self) -> DateTime<Utc> {
        *self.now.lock().expect("mock clock mutex poisoned")
    }

    /// Shifts the clock forward.
    ///
    /// # Panics
    ///
    /// Panics if the clock mutex is poisoned.
    pub fn advance(&self, delta: Duration) {
        let mut now = self.now.lock().expect("mock clock mutex poisoned");
        *now += chrono::TimeDelta::from_std(delta).unwrap_or(chrono::TimeDelta::MAX);
    }
}

impl Default for MockClock {
    fn default() -> Self {
        Self::new()
    }
}
