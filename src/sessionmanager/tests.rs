use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::request::{self, SessionError, SessionHandle};
use super::SessionManager;
use crate::broadcast::Bus;
use crate::shared::addr::ContainerAddr;
use crate::shared::config::Config;
use crate::supervisor::Service;

fn test_config(pool: usize, timeout_secs: u64) -> Config {
    Config::from_yaml(&format!(
        r#"
reverseproxy:
  session:
    salt: test-salt
    timeout: {timeout_secs}
  pool: {pool}
mgmt:
  key: test-key
docker:
  container-name: proxy
"#
    ))
    .expect("test config must parse")
}

fn addr(id: u64) -> ContainerAddr {
    ContainerAddr::new("web", id, 8080)
}

struct Harness {
    bus: Arc<Bus>,
    handle: SessionHandle,
    shutdown: CancellationToken,
    task: JoinHandle<anyhow::Result<()>>,
    session_request: mpsc::Receiver<()>,
    session_stop: mpsc::Receiver<ContainerAddr>,
}

impl Harness {
    fn spawn(pool: usize, timeout_secs: u64) -> Self {
        let config = test_config(pool, timeout_secs);
        let bus = Bus::new();
        let session_request = bus.session_request.subscribe();
        let session_stop = bus.session_stop.subscribe();
        let (handle, commands) = request::channel(8);
        let manager = SessionManager::new(&config, bus.clone(), commands);
        let shutdown = CancellationToken::new();
        let task = tokio::spawn(Box::new(manager).run(shutdown.clone()));
        Self {
            bus,
            handle,
            shutdown,
            task,
            session_request,
            session_stop,
        }
    }

    /// Feed the bootstrap state snapshot and wait until the loop has
    /// consumed it (observable through the refill requests it emits).
    async fn bootstrap(&mut self, instances: &[ContainerAddr], expected_requests: usize) {
        self.bus
            .docker_state
            .broadcast(instances.iter().cloned().collect::<HashSet<_>>());
        for _ in 0..expected_requests {
            self.expect_session_request().await;
        }
        // One extra scheduler pass so the loop is idle again.
        tokio::task::yield_now().await;
    }

    async fn expect_session_request(&mut self) {
        tokio::time::timeout(Duration::from_secs(2), self.session_request.recv())
            .await
            .expect("expected a session:request event")
            .expect("session:request topic closed");
    }

    async fn expect_session_stop(&mut self) -> ContainerAddr {
        tokio::time::timeout(Duration::from_secs(2), self.session_stop.recv())
            .await
            .expect("expected a session:stop event")
            .expect("session:stop topic closed")
    }

    async fn assert_no_session_request(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            self.session_request.try_recv().is_err(),
            "unexpected session:request event"
        );
    }

    async fn assert_no_session_stop(&mut self) {
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(
            self.session_stop.try_recv().is_err(),
            "unexpected session:stop event"
        );
    }

    async fn finish(mut self) {
        self.shutdown.cancel();
        self.task
            .await
            .expect("session manager panicked")
            .expect("session manager failed");
        // Drain leftover events so assertions cannot leak across tests.
        while self.session_request.try_recv().is_ok() {}
        while self.session_stop.try_recv().is_ok() {}
    }
}

#[tokio::test(start_paused = true)]
async fn bootstrap_requests_the_shortfall() {
    let mut h = Harness::spawn(2, 300);
    h.bootstrap(&[], 2).await;
    h.assert_no_session_request().await;
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn bootstrap_stops_the_excess() {
    let mut h = Harness::spawn(1, 300);
    h.bus
        .docker_state
        .broadcast(HashSet::from([addr(1), addr(2), addr(3)]));

    let mut stopped = vec![h.expect_session_stop().await, h.expect_session_stop().await];
    stopped.sort();
    assert_eq!(stopped, vec![addr(2), addr(3)]);
    h.assert_no_session_request().await;

    // The remaining instance is the pool; a match leases it directly.
    let leased = h
        .handle
        .match_container("abc".to_string(), "hash-abc".to_string())
        .await
        .unwrap();
    assert_eq!(leased, addr(1));
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn match_leases_from_the_pool_and_asks_for_a_refill() {
    let mut h = Harness::spawn(1, 300);
    h.bootstrap(&[addr(1)], 0).await;

    let leased = h
        .handle
        .match_container("abc".to_string(), "hash-abc".to_string())
        .await
        .unwrap();
    assert_eq!(leased, addr(1));
    h.expect_session_request().await;

    let sessions = h.handle.sessions().await.unwrap();
    assert_eq!(sessions.len(), 1);
    assert_eq!(sessions["hash-abc"].session_id, "abc");
    assert_eq!(sessions["hash-abc"].addr, addr(1));
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_match_reuses_the_binding() {
    let mut h = Harness::spawn(1, 300);
    h.bootstrap(&[addr(1)], 0).await;

    let first = h
        .handle
        .match_container("abc".to_string(), "hash-abc".to_string())
        .await
        .unwrap();
    h.expect_session_request().await;

    let before = h.handle.sessions().await.unwrap()["hash-abc"].expires_on;
    tokio::time::advance(Duration::from_secs(2)).await;

    let second = h
        .handle
        .match_container("abc".to_string(), "hash-abc".to_string())
        .await
        .unwrap();
    assert_eq!(first, second);
    // Renewal only; no new instance is requested.
    h.assert_no_session_request().await;

    let after = h.handle.sessions().await.unwrap()["hash-abc"].expires_on;
    assert!(after >= before, "expiry must be renewed on every match");
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn match_parks_until_an_instance_is_ready() {
    let mut h = Harness::spawn(1, 300);
    h.bootstrap(&[], 1).await;

    let handle = h.handle.clone();
    let waiter = tokio::spawn(async move {
        handle
            .match_container("def".to_string(), "hash-def".to_string())
            .await
    });

    // The parked request still asks for its own refill.
    h.expect_session_request().await;
    assert!(!waiter.is_finished());

    h.bus.docker_ready.broadcast(addr(7));
    let leased = waiter.await.unwrap().unwrap();
    assert_eq!(leased, addr(7));

    let sessions = h.handle.sessions().await.unwrap();
    assert_eq!(sessions["hash-def"].addr, addr(7));
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn ready_instances_pool_when_nobody_waits() {
    let mut h = Harness::spawn(2, 300);
    h.bootstrap(&[], 2).await;

    h.bus.docker_ready.broadcast(addr(1));
    h.bus.docker_ready.broadcast(addr(2));
    tokio::task::yield_now().await;

    // FIFO: the first ready instance is leased first.
    let leased = h
        .handle
        .match_container("abc".to_string(), "hash-abc".to_string())
        .await
        .unwrap();
    assert_eq!(leased, addr(1));
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn lost_instance_drops_the_session_and_refills() {
    let mut h = Harness::spawn(2, 300);
    h.bootstrap(&[addr(1), addr(2)], 0).await;

    let leased = h
        .handle
        .match_container("abc".to_string(), "hash-abc".to_string())
        .await
        .unwrap();
    h.expect_session_request().await;

    // The assigned instance dies underneath the session.
    h.bus.docker_stop.broadcast(leased.clone());
    // Pool holds one instance, so one more request restores the target.
    h.expect_session_request().await;

    let sessions = h.handle.sessions().await.unwrap();
    assert!(sessions.is_empty(), "session must die with its instance");
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn delete_releases_the_instance() {
    let mut h = Harness::spawn(1, 300);
    h.bootstrap(&[addr(1)], 0).await;

    h.handle
        .match_container("abc".to_string(), "hash-abc".to_string())
        .await
        .unwrap();
    h.expect_session_request().await;

    assert!(h.handle.delete("hash-abc".to_string()).await.unwrap());
    assert_eq!(h.expect_session_stop().await, addr(1));
    assert!(h.handle.sessions().await.unwrap().is_empty());

    // Deleting again is a no-op.
    assert!(!h.handle.delete("hash-abc".to_string()).await.unwrap());
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn sessions_expire_after_the_timeout() {
    let mut h = Harness::spawn(1, 1);
    h.bootstrap(&[addr(1)], 0).await;

    h.handle
        .match_container("abc".to_string(), "hash-abc".to_string())
        .await
        .unwrap();
    h.expect_session_request().await;

    // One TTL plus one sweep tick later the session is gone.
    tokio::time::advance(Duration::from_secs(6)).await;
    assert_eq!(h.expect_session_stop().await, addr(1));
    assert!(h.handle.sessions().await.unwrap().is_empty());
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn reconciler_orders_unknown_instances_stopped_once() {
    let mut h = Harness::spawn(1, 300);
    h.bootstrap(&[addr(1)], 0).await;

    let ghost = addr(9);
    h.bus
        .docker_state
        .broadcast(HashSet::from([addr(1), ghost.clone()]));
    assert_eq!(h.expect_session_stop().await, ghost);

    // The same snapshot again: RecentlyRemoved suppresses a second order.
    h.bus
        .docker_state
        .broadcast(HashSet::from([addr(1), ghost.clone()]));
    h.assert_no_session_stop().await;
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn reconciler_purges_instances_missing_from_the_engine() {
    let mut h = Harness::spawn(1, 300);
    h.bootstrap(&[addr(1)], 0).await;

    // External drift: the pooled instance vanished.
    h.bus.docker_state.broadcast(HashSet::new());
    h.expect_session_request().await;

    // The pool entry is gone: the next match parks instead of leasing.
    let handle = h.handle.clone();
    let waiter = tokio::spawn(async move {
        handle
            .match_container("abc".to_string(), "hash-abc".to_string())
            .await
    });
    h.expect_session_request().await;
    assert!(!waiter.is_finished());

    h.bus.docker_ready.broadcast(addr(2));
    assert_eq!(waiter.await.unwrap().unwrap(), addr(2));
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn identical_snapshots_converge_after_the_dedup_window() {
    let mut h = Harness::spawn(1, 300);
    h.bootstrap(&[addr(1)], 0).await;

    let ghost = addr(9);
    let snapshot = HashSet::from([addr(1), ghost.clone()]);
    h.bus.docker_state.broadcast(snapshot.clone());
    assert_eq!(h.expect_session_stop().await, ghost);

    // Once the dedup window decays the ghost is ordered stopped again;
    // repeated stop orders are the documented eventual-consistency
    // behavior, not an error.
    tokio::time::advance(Duration::from_secs(61)).await;
    // Let the sweep ticks that prune the dedup set run first.
    tokio::time::sleep(Duration::from_millis(10)).await;
    h.bus.docker_state.broadcast(snapshot);
    assert_eq!(h.expect_session_stop().await, ghost);
    h.finish().await;
}

#[tokio::test(start_paused = true)]
async fn shutdown_cancels_parked_requests() {
    let mut h = Harness::spawn(1, 300);
    h.bootstrap(&[], 1).await;

    let handle = h.handle.clone();
    let waiter = tokio::spawn(async move {
        handle
            .match_container("abc".to_string(), "hash-abc".to_string())
            .await
    });
    h.expect_session_request().await;

    h.shutdown.cancel();
    assert_eq!(waiter.await.unwrap(), Err(SessionError::ShuttingDown));
    h.task
        .await
        .expect("session manager panicked")
        .expect("session manager failed");
}

#[tokio::test(start_paused = true)]
async fn empty_hash_is_a_regular_session() {
    let mut h = Harness::spawn(1, 300);
    h.bootstrap(&[addr(1)], 0).await;

    let leased = h
        .handle
        .match_container(String::new(), "none".to_string())
        .await
        .unwrap();
    assert_eq!(leased, addr(1));

    let sessions = h.handle.sessions().await.unwrap();
    assert_eq!(sessions["none"].session_id, "");
    h.finish().await;
}
