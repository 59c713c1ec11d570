//! Typed broadcast bus connecting the service loops.
//!
//! Every topic is a named, buffered, multi-subscriber channel. Sends never
//! block: a subscriber whose queue is full loses the payload and the
//! watchdog is invoked with the topic name. The 5 s `docker:state`
//! re-assertion makes this safe, dropped events are ground truth that will
//! be published again.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tracing::warn;

use crate::shared::addr::ContainerAddr;

/// Buffer size shared by every topic.
pub const TOPIC_BUFFER: usize = 5;

/// Invoked with the topic name whenever a payload is dropped because a
/// subscriber queue was full.
pub type Watchdog = Arc<dyn Fn(&str) + Send + Sync>;

fn default_watchdog() -> Watchdog {
    Arc::new(|topic| {
        warn!(topic, "broadcast subscriber queue full, payload dropped");
    })
}

pub struct Topic<T> {
    name: &'static str,
    capacity: usize,
    watchdog: Watchdog,
    subscribers: Mutex<Vec<mpsc::Sender<T>>>,
}

impl<T: Clone> Topic<T> {
    pub fn new(name: &'static str) -> Self {
        Self::with_watchdog(name, default_watchdog())
    }

    pub fn with_watchdog(name: &'static str, watchdog: Watchdog) -> Self {
        Self {
            name,
            capacity: TOPIC_BUFFER,
            watchdog,
            subscribers: Mutex::new(Vec::new()),
        }
    }

    /// Attach a new subscriber with its own buffered queue.
    pub fn subscribe(&self) -> mpsc::Receiver<T> {
        let (tx, rx) = mpsc::channel(self.capacity);
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(tx);
        rx
    }

    /// Fan the payload out to every live subscriber without blocking.
    pub fn broadcast(&self, payload: T) {
        let mut subscribers = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        subscribers.retain(|tx| !tx.is_closed());
        for tx in subscribers.iter() {
            if let Err(TrySendError::Full(_)) = tx.try_send(payload.clone()) {
                (self.watchdog)(self.name);
            }
        }
    }

    #[cfg(test)]
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }
}

/// All topics of the process, one field per topic so publishers and
/// subscribers are typed at compile time.
pub struct Bus {
    /// Instance is up and routable.
    pub docker_ready: Topic<ContainerAddr>,
    /// Instance has been destroyed.
    pub docker_stop: Topic<ContainerAddr>,
    /// Full snapshot of living instances, emitted every reconciliation tick.
    pub docker_state: Topic<HashSet<ContainerAddr>>,
    /// Request to provision one new instance.
    pub session_request: Topic<()>,
    /// Request to destroy one specific instance.
    pub session_stop: Topic<ContainerAddr>,

    // Observed by the metrics collector only.
    pub session_metric_start: Topic<()>,
    pub docker_metric_project_size: Topic<usize>,
    pub docker_metric_state: Topic<usize>,
    pub proxy_metric_time: Topic<Duration>,
}

impl Bus {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            docker_ready: Topic::new("docker:ready"),
            docker_stop: Topic::new("docker:stop"),
            docker_state: Topic::new("docker:state"),
            session_request: Topic::new("session:request"),
            session_stop: Topic::new("session:stop"),
            session_metric_start: Topic::new("session:metric:start"),
            docker_metric_project_size: Topic::new("docker:metric:project-size"),
            docker_metric_state: Topic::new("docker:metric:state"),
            proxy_metric_time: Topic::new("proxy:metric:time"),
        })
    }
}
