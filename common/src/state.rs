use std::{sync::Arc, time::Duration};

use log::warn;

use crate::{config::SERVO_DEFAULT_ANGLE, lock::BoundedLock};

pub const SENSOR_MAX: u16 = 4_095;

/// Live device values shared between the request path and the sampling task.
///
/// Range invariants on `pwm_value`/`servo_angle` are enforced by the callers
/// that write them, never here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceState {
    pub relay_state: bool,
    pub sensor_value: u16,
    pub wifi_clients: u32,
    pub ip_address: String,
    pub pwm_value: u8,
    pub servo_angle: u8,
}

impl Default for DeviceState {
    fn default() -> Self {
        Self {
            relay_state: false,
            sensor_value: 0,
            wifi_clients: 0,
            ip_address: String::new(),
            pwm_value: 0,
            servo_angle: SERVO_DEFAULT_ANGLE,
        }
    }
}

pub type DeviceStateSnapshot = DeviceState;

/// Cloneable handle onto the single process-wide [`DeviceState`].
#[derive(Debug, Clone)]
pub struct StateStore {
    inner: Arc<BoundedLock<DeviceState>>,
    timeout: Duration,
}

impl StateStore {
    pub fn new(timeout: Duration) -> Self {
        Self::with_state(DeviceState::default(), timeout)
    }

    pub fn with_state(state: DeviceState, timeout: Duration) -> Self {
        Self {
            inner: Arc::new(BoundedLock::new(state)),
            timeout,
        }
    }

    /// Copies the record out. `None` means the lock was not obtained within
    /// the bound; callers degrade rather than fail.
    pub fn read(&self) -> Option<DeviceStateSnapshot> {
        match self.inner.lock_within(self.timeout) {
            Some(guard) => Some(guard.clone()),
            None => {
                warn!("device state read skipped: lock busy for {:?}", self.timeout);
                None
            }
        }
    }

    /// Applies `mutator` under the lock. Returns `false` when the mutation
    /// was dropped because the lock stayed busy.
    pub fn update<F>(&self, mutator: F) -> bool
    where
        F: FnOnce(&mut DeviceState),
    {
        match self.inner.lock_within(self.timeout) {
            Some(mut guard) => {
                mutator(&mut guard);
                true
            }
            None => {
                warn!("device state update dropped: lock busy for {:?}", self.timeout);
                false
            }
        }
    }

    #[cfg(test)]
    pub(crate) fn raw_lock(&self) -> Arc<BoundedLock<DeviceState>> {
        self.inner.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::{sync::mpsc, thread};

    fn hold_lock(store: &StateStore) -> (mpsc::Sender<()>, thread::JoinHandle<()>) {
        let lock = store.raw_lock();
        let (held_tx, held_rx) = mpsc::channel();
        let (release_tx, release_rx) = mpsc::channel::<()>();
        let handle = thread::spawn(move || {
            let _guard = lock.lock_within(Duration::from_secs(1)).unwrap();
            held_tx.send(()).unwrap();
            release_rx.recv().unwrap();
        });
        held_rx.recv().unwrap();
        (release_tx, handle)
    }

    #[test]
    fn starts_with_documented_defaults() {
        let store = StateStore::new(Duration::from_millis(10));
        let snapshot = store.read().unwrap();

        assert_eq!(snapshot.servo_angle, 90);
        assert_eq!(snapshot.pwm_value, 0);
        assert!(!snapshot.relay_state);
    }

    #[test]
    fn update_is_visible_to_other_handles() {
        let store = StateStore::new(Duration::from_millis(10));
        let sampler = store.clone();

        assert!(sampler.update(|state| {
            state.sensor_value = 2_048;
            state.ip_address = "10.0.0.7".to_string();
        }));

        let snapshot = store.read().unwrap();
        assert_eq!(snapshot.sensor_value, 2_048);
        assert_eq!(snapshot.ip_address, "10.0.0.7");
    }

    #[test]
    fn busy_lock_degrades_read_and_drops_write() {
        let store = StateStore::new(Duration::from_millis(15));
        let (release, holder) = hold_lock(&store);

        assert!(store.read().is_none());
        assert!(!store.update(|state| state.relay_state = true));

        release.send(()).unwrap();
        holder.join().unwrap();

        // The dropped mutation never lands.
        assert!(!store.read().unwrap().relay_state);
    }
}
