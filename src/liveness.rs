//! Heartbeat and inactivity supervision
//!
//! One pattern, used twice: a sender thread periodically asks its target to
//! emit a heartbeat, and a verifier thread periodically sweeps the target,
//! evicting whatever stayed silent for a whole window. The multicast
//! subgroup uses it for local peers; [`LinkSupervisor`] uses it for remote
//! links.

use crossbeam_channel::{bounded, select, tick, Receiver, Sender};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crate::config::HeartbeatConfig;
use crate::remote::link::{LinkId, RemoteLink};

/// Activity flag: set on every inbound message, consumed by each sweep
#[derive(Debug)]
pub struct Activity {
    active: AtomicBool,
}

impl Activity {
    /// New flags start active so a fresh peer survives its first sweep
    pub fn new() -> Self {
        Self {
            active: AtomicBool::new(true),
        }
    }

    pub fn touch(&self) {
        self.active.store(true, Ordering::Relaxed);
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Relaxed)
    }

    /// Sweep step. Returns `false` when nothing was seen since the previous
    /// sweep (the owner should be evicted), otherwise clears the flag.
    pub fn sweep(&self) -> bool {
        self.active.swap(false, Ordering::AcqRel)
    }
}

impl Default for Activity {
    fn default() -> Self {
        Self::new()
    }
}

/// Something that can be kept alive by a [`LivenessSupervisor`]
pub trait LivenessTarget: Send + Sync + 'static {
    /// Emit one round of heartbeats
    fn send_heartbeat(&self);

    /// Evict everything that stayed inactive for a whole window
    fn sweep(&self);
}

/// Sender + verifier thread pair driving one [`LivenessTarget`]
pub struct LivenessSupervisor {
    name: String,
    stop_tx: Option<Sender<()>>,
    handles: Vec<JoinHandle<()>>,
}

impl LivenessSupervisor {
    /// Start both threads. They hold only a weak reference, so the target
    /// may own its supervisor; both threads exit once the target is dropped.
    pub fn start<T: LivenessTarget>(
        name: &str,
        target: Weak<T>,
        config: &HeartbeatConfig,
    ) -> std::io::Result<Self> {
        let (stop_tx, stop_rx) = bounded::<()>(0);

        let sender = spawn_periodic(
            format!("{name}-heartbeat"),
            config.send_interval(),
            stop_rx.clone(),
            target.clone(),
            |t: &T| t.send_heartbeat(),
        )?;
        let verifier = spawn_periodic(
            format!("{name}-verifier"),
            config.inactivity_window(),
            stop_rx,
            target,
            |t: &T| t.sweep(),
        )?;

        tracing::debug!(
            "{} liveness started: heartbeat every {:?}, sweep every {:?}",
            name,
            config.send_interval(),
            config.inactivity_window()
        );

        Ok(Self {
            name: name.to_string(),
            stop_tx: Some(stop_tx),
            handles: vec![sender, verifier],
        })
    }

    /// Stop both threads
    pub fn stop(&mut self) {
        // Disconnecting the stop channel wakes both loops
        self.stop_tx.take();
        let current = thread::current().id();
        for handle in self.handles.drain(..) {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
        tracing::debug!("{} liveness stopped", self.name);
    }
}

impl Drop for LivenessSupervisor {
    fn drop(&mut self) {
        self.stop();
    }
}

fn spawn_periodic<T, F>(
    name: String,
    period: Duration,
    stop_rx: Receiver<()>,
    target: Weak<T>,
    action: F,
) -> std::io::Result<JoinHandle<()>>
where
    T: LivenessTarget,
    F: Fn(&T) + Send + 'static,
{
    thread::Builder::new().name(name).spawn(move || {
        let ticker = tick(period);
        loop {
            select! {
                recv(stop_rx) -> _ => break,
                recv(ticker) -> _ => match target.upgrade() {
                    Some(target) => action(&target),
                    None => break,
                },
            }
        }
    })
}

/// Process-wide registry of open remote links, kept alive by heartbeats.
///
/// Constructed explicitly by whoever opens the first connection and handed
/// to everything that opens more.
pub struct LinkSupervisor {
    links: Mutex<Vec<Arc<dyn RemoteLink>>>,
    supervisor: Mutex<Option<LivenessSupervisor>>,
}

impl LinkSupervisor {
    pub fn start(config: &HeartbeatConfig) -> std::io::Result<Arc<Self>> {
        let this = Arc::new(Self {
            links: Mutex::new(Vec::new()),
            supervisor: Mutex::new(None),
        });
        let supervisor = LivenessSupervisor::start("remote-link", Arc::downgrade(&this), config)?;
        *this.supervisor.lock() = Some(supervisor);
        Ok(this)
    }

    pub fn register(&self, link: Arc<dyn RemoteLink>) {
        let mut links = self.links.lock();
        if !links.iter().any(|l| l.id() == link.id()) {
            tracing::debug!("supervising link {}", link.id());
            links.push(link);
        }
    }

    pub fn deregister(&self, id: LinkId) {
        self.links.lock().retain(|l| l.id() != id);
    }

    pub fn len(&self) -> usize {
        self.links.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn stop(&self) {
        if let Some(mut supervisor) = self.supervisor.lock().take() {
            supervisor.stop();
        }
        self.links.lock().clear();
    }
}

impl LivenessTarget for LinkSupervisor {
    fn send_heartbeat(&self) {
        let links: Vec<_> = self.links.lock().clone();
        for link in links.iter().filter(|l| l.is_open()) {
            if let Err(e) = link.send_heartbeat() {
                tracing::debug!("heartbeat on link {} failed: {}", link.id(), e);
            }
        }
    }

    fn sweep(&self) {
        let mut expired = Vec::new();
        self.links.lock().retain(|link| {
            if !link.is_open() {
                return false;
            }
            if link.activity().sweep() {
                true
            } else {
                expired.push(link.clone());
                false
            }
        });
        // Closing reports connection-lost through the link's own sink
        for link in expired {
            tracing::warn!("link {} to {} inactive, closing", link.id(), link.peer_address());
            link.close();
        }
    }
}
