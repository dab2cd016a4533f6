//! The coordination primitives through the client, against a three server group

use actix::prelude::*;
use cp_raft::client::Cluster;
use cp_raft::cluster::{ClusterRunner, ClusterStatus, SetReachable};
use cp_raft::node::Role;
use cp_raft::*;
use std::cell::RefCell;
use std::rc::Rc;
use std::time::Duration;
use tokio::time::sleep;

fn client_config(name: &str) -> ClientConfig {
    ClientConfig {
        instance_name: name.to_string(),
        session_heartbeat_interval_ms: 100,
        session_ttl_ms: 600,
        request_timeout_ms: 500,
        max_attempts: 20,
        retry_backoff_initial_ms: 20,
        retry_backoff_max_ms: 200,
        wait_poll_interval_ms: 20,
    }
}

async fn cluster() -> Cluster {
    let cluster = ClusterRunner::start(&ClusterConfig::default(), |_| CpStateMachine::default());
    // let the first election settle
    sleep(Duration::from_millis(800)).await;
    cluster
}

async fn leader(cluster: &Cluster) -> ServerId {
    for _ in 0..50 {
        let statuses = cluster.send(ClusterStatus).await.unwrap();
        let term = statuses.iter().map(|s| s.term).max().unwrap_or(0);
        if let Some(leader) = statuses.iter().find(|s| s.term == term && s.role == Role::Leader) {
            return leader.id;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("no leader elected");
}

async fn client(cluster: &Cluster, name: &str) -> CpClient {
    CpClient::connect(cluster.clone(), client_config(name))
        .await
        .unwrap()
}

#[test]
fn mutual_exclusion_and_fences() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let b = client(&cluster, "b").await;
        let a_lock = a.get_lock("lock");
        let b_lock = b.get_lock("lock");

        assert_eq!(a_lock.get_fence().await.unwrap(), FencingToken(0));
        let first = a_lock.lock_and_get_fence().await.unwrap();
        assert_eq!(first, FencingToken(1));
        assert!(!b_lock.try_lock(Duration::from_millis(100)).await.unwrap());
        assert!(!b_lock.try_lock(Duration::ZERO).await.unwrap());
        assert!(a_lock.is_locked_by_current_session().await.unwrap());
        assert!(!b_lock.is_locked_by_current_session().await.unwrap());

        a_lock.unlock().await.unwrap();
        let second = b_lock.lock_and_get_fence().await.unwrap();
        assert!(second > first);
        assert_eq!(b_lock.get_fence().await.unwrap(), second);
        assert!(!a_lock.is_locked_by_current_session().await.unwrap());
        let status = b_lock.status().await.unwrap();
        assert_eq!(status.waiters, 0, "the timed out tries left the queue");
    });
}

#[test]
fn reentrant_holds_keep_their_fence() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let lock = a.get_lock("lock");
        let fence = lock.lock_and_get_fence().await.unwrap();
        assert_eq!(lock.lock_and_get_fence().await.unwrap(), fence);
        assert_eq!(lock.get_lock_count().await.unwrap(), 2);

        lock.unlock().await.unwrap();
        assert!(lock.is_locked().await.unwrap());
        lock.unlock().await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
        assert!(matches!(lock.unlock().await, Err(CpError::NotOwner { .. })));
    });
}

#[test]
fn waiters_are_granted_in_request_order() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let a_lock = a.get_lock("lock");
        a_lock.lock().await.unwrap();

        let order = Rc::new(RefCell::new(vec![]));
        let mut waiters = vec![];
        for name in ["b", "c", "d"] {
            let lock = client(&cluster, name).await.get_lock("lock");
            let order = order.clone();
            waiters.push(actix::spawn(async move {
                let fence = lock.lock_and_get_fence().await.unwrap();
                order.borrow_mut().push((name, fence));
                sleep(Duration::from_millis(50)).await;
                lock.unlock().await.unwrap();
            }));
            // queue strictly one after the other
            sleep(Duration::from_millis(100)).await;
        }
        assert_eq!(a_lock.status().await.unwrap().waiters, 3);
        a_lock.unlock().await.unwrap();
        for waiter in waiters {
            waiter.await.unwrap();
        }
        assert_eq!(
            *order.borrow(),
            vec![("b", FencingToken(2)), ("c", FencingToken(3)), ("d", FencingToken(4))]
        );
    });
}

#[test]
fn dropped_wait_is_resumed_not_doubled() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let b = client(&cluster, "b").await;
        let a_lock = a.get_lock("lock");
        let b_lock = b.get_lock("lock");
        a_lock.lock().await.unwrap();

        assert!(tokio::time::timeout(Duration::from_millis(150), b_lock.lock())
            .await
            .is_err());
        let waiting = actix::spawn(async move {
            let fence = b_lock.lock_and_get_fence().await.unwrap();
            (b_lock, fence)
        });
        sleep(Duration::from_millis(100)).await;
        assert_eq!(a_lock.status().await.unwrap().waiters, 1, "the second wait took over the first request");

        a_lock.unlock().await.unwrap();
        let (b_lock, fence) = waiting.await.unwrap();
        assert_eq!(fence, FencingToken(2));
        assert_eq!(b_lock.get_lock_count().await.unwrap(), 1);
        b_lock.unlock().await.unwrap();
        let status = b_lock.status().await.unwrap();
        assert_eq!(status.holder, None);
        assert_eq!(status.waiters, 0);
    });
}

#[test]
fn unreachable_leader_is_routed_around() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let config = ClientConfig {
            // outlive the election that follows
            session_ttl_ms: 5_000,
            ..client_config("a")
        };
        let a = CpClient::connect(cluster.clone(), config).await.unwrap();
        let lock = a.get_lock("lock");
        let photo: AtomicReference<Photo> = a.get_atomic_reference("photo");
        let fence = lock.lock_and_get_fence().await.unwrap();
        assert_eq!(photo.set(&Photo::new(1, "cat1.png")).await.unwrap(), 1);

        let old = leader(&cluster).await;
        cluster.do_send(SetReachable {
            server: old,
            reachable: false,
        });
        // proposed while the group fails over, applied exactly once
        assert_eq!(photo.set(&Photo::new(2, "cat2.png")).await.unwrap(), 2);
        assert_ne!(leader(&cluster).await, old);

        let current = photo.get_versioned().await.unwrap();
        assert_eq!(current.generation, 2);
        assert_eq!(current.value, Some(Photo::new(2, "cat2.png")));
        assert_eq!(lock.get_fence().await.unwrap(), fence);
        assert!(lock.is_locked_by_current_session().await.unwrap());
        lock.unlock().await.unwrap();
        assert!(!lock.is_locked().await.unwrap());
    });
}

#[test]
fn unlock_by_non_holder_changes_nothing() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let b = client(&cluster, "b").await;
        let a_lock = a.get_lock("lock");
        a_lock.lock().await.unwrap();
        let before = a_lock.status().await.unwrap();

        let err = b.get_lock("lock").unlock().await.unwrap_err();
        assert!(matches!(err, CpError::NotOwner { ref name } if name == "lock"));
        assert!(err.is_fatal());
        assert_eq!(a_lock.status().await.unwrap(), before);
    });
}

#[test]
fn expired_session_loses_the_lock() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let b = client(&cluster, "b").await;
        let photo: AtomicReference<Photo> = a.get_atomic_reference("photo");
        let a_lock = a.get_lock("lock");
        let b_lock = b.get_lock("lock");

        let stale = a_lock.lock_and_get_fence().await.unwrap();
        a.abandon_session().await;
        // a's heartbeats stop, the leader expires the session and hands the lock on
        let fresh = b_lock
            .try_lock_and_get_fence(Duration::from_secs(5))
            .await
            .unwrap()
            .expect("granted after expiry");
        assert!(fresh > stale);

        let err = photo
            .compare_and_set_fenced(0, &Photo::new(1, "cat1.png"), &a_lock, stale)
            .await
            .unwrap_err();
        assert!(matches!(err, CpError::StaleFence { presented, current, .. } if presented == stale.0 && current == fresh.0));
        assert_eq!(photo.get().await.unwrap(), None);
    });
}

#[test]
fn closing_the_session_releases_immediately() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let b = client(&cluster, "b").await;
        a.get_lock("lock").lock().await.unwrap();
        let closed = a.session_id().await.unwrap();
        a.close_session().await.unwrap();
        assert!(b.get_lock("lock").try_lock(Duration::from_millis(300)).await.unwrap());
        // a new session for a
        assert_ne!(a.session().await.unwrap(), closed);
    });
}

#[test]
fn atomic_reference_generations() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let r: AtomicReference<Photo> = a.get_atomic_reference("photo");
        assert_eq!(
            r.get_versioned().await.unwrap(),
            Versioned {
                value: None,
                generation: 0
            }
        );
        assert_eq!(r.set(&Photo::new(1, "dog3.png")).await.unwrap(), 1);
        assert_eq!(r.get().await.unwrap(), Some(Photo::new(1, "dog3.png")));
        assert_eq!(r.clear().await.unwrap(), 2);
        assert_eq!(r.get().await.unwrap(), None);
        assert!(!r.compare_and_set(1, &Photo::new(2, "dog1.png")).await.unwrap());
        assert!(r.compare_and_set(2, &Photo::new(2, "dog1.png")).await.unwrap());
        assert_eq!(r.get_versioned().await.unwrap().generation, 3);
    });
}

#[test]
fn one_of_many_cas_wins() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let mut refs = vec![];
        for name in ["a", "b", "c", "d"] {
            refs.push(client(&cluster, name).await.get_atomic_reference::<u64>("counter"));
        }
        let values: Vec<u64> = (0..refs.len()).map(|i| i as u64).collect();
        let attempts = refs.iter().zip(&values).map(|(r, v)| r.compare_and_set(0, v));
        let results = futures::future::join_all(attempts).await;
        let won = results.into_iter().map(Result::unwrap).filter(|&won| won).count();
        assert_eq!(won, 1);
        let current = refs[0].get_versioned().await.unwrap();
        assert_eq!(current.generation, 1);
        assert!(current.value.is_some());
    });
}

#[test]
fn latch_releases_all_waiters_once() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let latch = a.get_count_down_latch("notifier");
        assert!(latch.try_set_count(1).await.unwrap());
        let round = latch.get_round().await.unwrap();
        // an armed latch is not reset
        assert!(!latch.try_set_count(1).await.unwrap());
        assert_eq!(latch.get_round().await.unwrap(), round);

        let mut waiters = vec![];
        for name in ["w1", "w2"] {
            let latch = client(&cluster, name).await.get_count_down_latch("notifier");
            waiters.push(actix::spawn(async move { latch.await_zero(Duration::from_secs(3)).await.unwrap() }));
        }
        sleep(Duration::from_millis(100)).await;
        latch.count_down().await.unwrap();
        // re-arming straight away must not strand the waiters
        assert!(latch.try_set_count(1).await.unwrap());
        for waiter in waiters {
            assert!(waiter.await.unwrap());
        }
        assert_eq!(latch.get_count().await.unwrap(), 1);
        assert_eq!(latch.get_round().await.unwrap(), round + 1);
    });
}

#[test]
fn latch_await_times_out() {
    System::new().block_on(async {
        let cluster = cluster().await;
        let a = client(&cluster, "a").await;
        let latch = a.get_count_down_latch("notifier");
        assert!(latch.await_zero(Duration::from_millis(50)).await.unwrap(), "a spent latch does not block");
        latch.try_set_count(2).await.unwrap();
        latch.count_down().await.unwrap();
        assert!(!latch.await_zero(Duration::from_millis(200)).await.unwrap());
        assert!(matches!(latch.try_set_count(0).await, Err(CpError::Validation(_))));
    });
}

#[test]
fn unavailable_after_bounded_attempts() {
    System::new().block_on(async {
        let cluster = cluster().await;
        for server in 0..3 {
            cluster.do_send(SetReachable {
                server,
                reachable: false,
            });
        }
        let config = ClientConfig {
            max_attempts: 3,
            ..client_config("a")
        };
        let a = CpClient::connect(cluster.clone(), config).await.unwrap();
        let err = a.get_lock("lock").get_fence().await.unwrap_err();
        assert!(matches!(err, CpError::Unavailable { attempts: 3 }));
        assert!(err.is_retryable());
    });
}
