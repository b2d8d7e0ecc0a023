//! Connectivity and resource signals consumed by the engine.
//!
//! The platform glue owns a [`SignalController`] and flips it as the
//! network comes and goes; the engine only reads through
//! [`NetworkSignals`]. Signals never touch persisted task state.

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// Current environment as seen by the engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct NetworkState {
    pub online: bool,
    /// Battery saver, metered link or similar: run one chunk at a time.
    pub constrained: bool,
}

impl Default for NetworkState {
    fn default() -> Self {
        Self {
            online: true,
            constrained: false,
        }
    }
}

/// Creates a controller/reader pair starting online and unconstrained.
pub fn channel() -> (SignalController, NetworkSignals) {
    let (tx, rx) = watch::channel(NetworkState::default());
    (SignalController { tx }, NetworkSignals { rx })
}

/// Write side of the signals.
pub struct SignalController {
    tx: watch::Sender<NetworkState>,
}

impl SignalController {
    pub fn set_online(&self, online: bool) {
        self.tx.send_if_modified(|s| {
            let changed = s.online != online;
            s.online = online;
            changed
        });
    }

    pub fn set_constrained(&self, constrained: bool) {
        self.tx.send_if_modified(|s| {
            let changed = s.constrained != constrained;
            s.constrained = constrained;
            changed
        });
    }

    pub fn signals(&self) -> NetworkSignals {
        NetworkSignals {
            rx: self.tx.subscribe(),
        }
    }
}

/// Read side of the signals, cheap to clone.
#[derive(Clone)]
pub struct NetworkSignals {
    rx: watch::Receiver<NetworkState>,
}

impl NetworkSignals {
    /// Signals for an environment that never changes: always online.
    pub fn always_online() -> Self {
        let (_tx, rx) = watch::channel(NetworkState::default());
        Self { rx }
    }

    pub fn current(&self) -> NetworkState {
        *self.rx.borrow()
    }

    pub fn is_online(&self) -> bool {
        self.current().online
    }

    pub fn is_constrained(&self) -> bool {
        self.current().constrained
    }

    /// Waits until the network is online.
    ///
    /// Returns `false` if `cancel` fires first. A dropped controller
    /// freezes the last state, which is then treated as online.
    pub async fn wait_online(&self, cancel: &CancellationToken) -> bool {
        let mut rx = self.rx.clone();
        loop {
            let online = rx.borrow_and_update().online;
            if online {
                return true;
            }
            tokio::select! {
                biased;
                _ = cancel.cancelled() => return false,
                changed = rx.changed() => {
                    if changed.is_err() {
                        return true;
                    }
                }
            }
        }
    }

    /// Resolves when the network goes offline; never if the controller is gone.
    pub async fn wait_offline(&self) {
        let mut rx = self.rx.clone();
        loop {
            let online = rx.borrow_and_update().online;
            if !online {
                return;
            }
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

impl Default for NetworkSignals {
    fn default() -> Self {
        Self::always_online()
    }
}
