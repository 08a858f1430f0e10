//! Atomic reservation of TCP ports from a contiguous pool.
//!
//! A single mutex guards the reservation map and a monotonic search
//! offset, so no two live instances ever hold the same port. Probing by
//! binding a listener narrows (but cannot eliminate) the race against
//! foreign processes; callers are expected to start their listener
//! promptly after reserving.

use std::collections::HashMap;
use std::net::TcpListener;
use std::sync::Mutex;

use tracing::{debug, trace};

use crate::error::PortError;

/// Number of candidate ports scanned per reservation.
const CANDIDATES: u16 = 100;

#[derive(Debug, Default)]
struct BrokerState {
    reservations: HashMap<u16, String>,
    offset: u16,
}

/// Port broker over a contiguous pool starting at `base`.
#[derive(Debug)]
pub struct PortBroker {
    base: u16,
    state: Mutex<BrokerState>,
}

impl PortBroker {
    /// Creates a broker with the given pool base.
    #[must_use]
    pub fn new(base: u16) -> Self {
        Self {
            base,
            state: Mutex::new(BrokerState::default()),
        }
    }

    /// Reserves a free port for `instance_id`.
    ///
    /// Scans up to 100 candidates starting past the last reservation,
    /// skipping ports already held and ports that fail a bind probe.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::Exhausted`] after 100 misses.
    ///
    /// # Panics
    ///
    /// Panics if the broker mutex is poisoned.
    pub fn reserve(&self, instance_id: &str) -> Result<u16, PortError> {
        let mut state = self.state.lock().expect("port broker mutex poisoned");
        for step in 0..CANDIDATES {
            // Pool window: base..base+width, offset wraps within it.
            let port = self.base + (state.offset + step) % pool_width(self.base);
            if state.reservations.contains_key(&port) {
                trace!(port, "candidate already reserved");
                continue;
            }
            if !probe(port) {
                trace!(port, "candidate failed bind probe");
                continue;
            }
            state.reservations.insert(port, instance_id.to_string());
            state.offset = (port - self.base + 1) % pool_width(self.base);
            debug!(port, instance_id, "port reserved");
            return Ok(port);
        }
        Err(PortError::Exhausted {
            base: self.base,
            candidates: CANDIDATES,
        })
    }

    /// Releases `port` if and only if `instance_id` holds the reservation.
    ///
    /// # Errors
    ///
    /// Returns [`PortError::NotOwner`] if the reservation is held by
    /// someone else (or nobody).
    ///
    /// # Panics
    ///
    /// Panics if the broker mutex is poisoned.
    pub fn release(&self, port: u16, instance_id: &str) -> Result<(), PortError> {
        let mut state = self.state.lock().expect("port broker mutex poisoned");
        match state.reservations.get(&port) {
            Some(owner) if owner == instance_id => {
                state.reservations.remove(&port);
                debug!(port, instance_id, "port released");
                Ok(())
            }
            _ => Err(PortError::NotOwner {
                port,
                instance_id: instance_id.to_string(),
            }),
        }
    }

    /// Number of ports currently reserved.
    ///
    /// # Panics
    ///
    /// Panics if the broker mutex is poisoned.
    #[must_use]
    pub fn reserved_count(&self) -> usize {
        self.state
            .lock()
            .expect("port broker mutex poisoned")
            .reservations
            .len()
    }
}

/// Usable pool width: the candidate window, clamped so `base + width`
/// stays within u16.
fn pool_width(base: u16) -> u16 {
    CANDIDATES.min(u16::MAX - base)
}

/// Probes a port by binding and immediately closing a listener.
fn probe(port: u16) -> bool {
    TcpListener::bind(("0.0.0.0", port)).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_and_release_round_trip() {
        let broker = PortBroker::new(29100);
        let port = broker.reserve("inst-a").unwrap();
        assert!((29100..29200).contains(&port));
        assert_eq!(broker.reserved_count(), 1);
        broker.release(port, "inst-a").unwrap();
        assert_eq!(broker.reserved_count(), 0);
    }

    #[test]
    fn reservations_are_unique() {
        let broker = PortBroker::new(29200);
        let a = broker.reserve("a").unwrap();
        let b = broker.reserve("b").unwrap();
        let c = broker.reserve("c").unwrap();
        assert_ne!(a, b);
        assert_ne!(b, c);
        assert_ne!(a, c);
    }

    #[test]
    fn release_by_non_owner_is_rejected() {
        let broker = PortBroker::new(29300);
        let port = broker.reserve("owner").unwrap();
        let err = broker.release(port, "intruder").unwrap_err();
        assert!(matches!(err, PortError::NotOwner { .. }));
        broker.release(port, "owner").unwrap();
    }

    #[test]
    fn release_of_unreserved_port_is_rejected() {
        let broker = PortBroker::new(29400);
        assert!(broker.release(29400, "nobody").is_err());
    }

    #[test]
    fn bound_ports_are_skipped() {
        let broker = PortBroker::new(29500);
        // Occupy the first candidate externally.
        let _blocker = TcpListener::bind(("0.0.0.0", 29500));
        let port = broker.reserve("a").unwrap();
        if _blocker.is_ok() {
            assert_ne!(port, 29500);
        }
    }

    #[test]
    fn concurrent_reservations_never_collide() {
        use std::sync::Arc;
        let broker = Arc::new(PortBroker::new(29600));
        let handles: Vec<_> = (0..8)
            .map(|i| {
                let broker = Arc::clone(&broker);
                std::thread::spawn(move || broker.reserve(&format!("inst-{i}")).unwrap())
            })
            .collect();
        let mut ports: Vec<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        ports.sort_unstable();
        ports.dedup();
        assert_eq!(ports.len(), 8, "duplicate port handed out");
    }
}
