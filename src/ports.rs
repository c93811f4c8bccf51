//! Per-device automation port assignment.
//!
//! Each device running concurrently needs its own server port. Ports come
//! from a reserved inclusive range; the lowest free port is always handed
//! out first so that freed ports are recycled.

use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use tracing::debug;

use crate::error::{OrchestratorError, OrchestratorResult};

/// Port returned for devices without an assignment.
pub const DEFAULT_PORT: u16 = 4723;

/// Assigns unique ports to devices.
pub struct PortAllocator {
    start: u16,
    end: u16,
    default_port: u16,
    assigned: Mutex<HashMap<String, u16>>,
}

impl PortAllocator {
    /// Creates an allocator over `start..=end`.
    pub fn new(start: u16, end: u16) -> Self {
        Self {
            start,
            end,
            default_port: DEFAULT_PORT,
            assigned: Mutex::new(HashMap::new()),
        }
    }

    /// Overrides the port reported for unassigned devices.
    pub fn with_default_port(mut self, port: u16) -> Self {
        self.default_port = port;
        self
    }

    /// Assigns the lowest free port to `device_id`.
    ///
    /// A device that already holds a port gets the same port back.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::PortAllocationExhausted`] when every port in the
    /// range is held by another device.
    pub fn assign(&self, device_id: &str) -> OrchestratorResult<u16> {
        let mut assigned = self.lock();
        if let Some(port) = assigned.get(device_id) {
            return Ok(*port);
        }

        let used: std::collections::HashSet<u16> = assigned.values().copied().collect();
        let port = (self.start..=self.end)
            .find(|p| !used.contains(p))
            .ok_or_else(|| OrchestratorError::PortAllocationExhausted {
                device_id: device_id.to_string(),
                start: self.start,
                end: self.end,
            })?;

        assigned.insert(device_id.to_string(), port);
        debug!("Assigned port {} to device {}", port, device_id);
        Ok(port)
    }

    /// Frees the port held by `device_id`. Releasing twice is a no-op.
    pub fn release(&self, device_id: &str) -> Option<u16> {
        let port = self.lock().remove(device_id);
        if let Some(port) = port {
            debug!("Released port {} from device {}", port, device_id);
        }
        port
    }

    /// The device's port, or the default port if it has none.
    pub fn port_for(&self, device_id: &str) -> u16 {
        self.lock()
            .get(device_id)
            .copied()
            .unwrap_or(self.default_port)
    }

    /// Snapshot of current assignments, ordered by device id.
    pub fn assignments(&self) -> BTreeMap<String, u16> {
        self.lock()
            .iter()
            .map(|(id, port)| (id.clone(), *port))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, u16>> {
        self.assigned.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;

    use super::*;

    #[test]
    fn test_assigns_distinct_lowest_ports() {
        let ports = PortAllocator::new(4724, 4730);
        assert_eq!(ports.assign("sim-A").unwrap(), 4724);
        assert_eq!(ports.assign("sim-B").unwrap(), 4725);
        assert_eq!(ports.len(), 2);
    }

    #[test]
    fn test_reassign_returns_same_port() {
        let ports = PortAllocator::new(4724, 4730);
        let first = ports.assign("sim-A").unwrap();
        assert_eq!(ports.assign("sim-A").unwrap(), first);
        assert_eq!(ports.len(), 1);
    }

    #[test]
    fn test_released_port_is_recycled() {
        let ports = PortAllocator::new(4724, 4730);
        ports.assign("sim-A").unwrap();
        ports.assign("sim-B").unwrap();

        assert_eq!(ports.release("sim-A"), Some(4724));
        assert_eq!(ports.assign("emulator-5554").unwrap(), 4724);
    }

    #[test]
    fn test_release_is_idempotent() {
        let ports = PortAllocator::new(4724, 4730);
        ports.assign("sim-A").unwrap();
        assert_eq!(ports.release("sim-A"), Some(4724));
        assert_eq!(ports.release("sim-A"), None);
        assert!(ports.is_empty());
    }

    #[test]
    fn test_exhausted_range() {
        let ports = PortAllocator::new(4724, 4725);
        ports.assign("a").unwrap();
        ports.assign("b").unwrap();

        let err = ports.assign("c").unwrap_err();
        assert!(matches!(
            err,
            OrchestratorError::PortAllocationExhausted {
                start: 4724,
                end: 4725,
                ..
            }
        ));
    }

    #[test]
    fn test_port_for_falls_back_to_default() {
        let ports = PortAllocator::new(4724, 4730);
        assert_eq!(ports.port_for("unknown"), DEFAULT_PORT);

        let ports = PortAllocator::new(4724, 4730).with_default_port(5000);
        assert_eq!(ports.port_for("unknown"), 5000);
        ports.assign("sim-A").unwrap();
        assert_eq!(ports.port_for("sim-A"), 4724);
    }

    #[test]
    fn test_concurrent_assignments_are_unique() {
        let ports = Arc::new(PortAllocator::new(4724, 4823));
        let handles: Vec<_> = (0..32)
            .map(|i| {
                let ports = ports.clone();
                std::thread::spawn(move || ports.assign(&format!("device-{}", i)).unwrap())
            })
            .collect();

        let assigned: HashSet<u16> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert_eq!(assigned.len(), 32);
        assert_eq!(ports.assignments().len(), 32);
    }
}
