use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use rust_asyncpool::{PoolConfig, PoolError, WorkerPool};
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

/// Poll `check` until it holds or `limit` passes.
async fn eventually(limit: Duration, check: impl Fn() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        sleep(Duration::from_millis(5)).await;
    }
    check()
}

#[tokio::test]
async fn test_worker_limit() {
    let (release_tx, release_rx) = watch::channel(false);
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    let pool = WorkerPool::new(
        move |param: u32| {
            let calls = calls_clone.clone();
            let mut release = release_rx.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                assert_eq!(param, 5);
                let _ = release.wait_for(|released| *released).await;
                Ok(())
            }
        },
        PoolConfig::new(5, "worker-limit"),
    )
    .unwrap();
    pool.start();

    // Five running plus five queued.
    for _ in 0..10 {
        timeout(Duration::from_millis(200), pool.push(5))
            .await
            .expect("push within capacity should not wait")
            .unwrap();
    }

    // With every worker stuck the eleventh push cannot get in.
    let blocked = timeout(Duration::from_millis(200), pool.push(5)).await;
    assert!(blocked.is_err());
    assert_eq!(pool.total_queued(), 10);
    assert_eq!(calls.load(Ordering::SeqCst), 5);
    assert_eq!(pool.in_flight(), 5);
    assert_eq!(pool.queued(), 5);
    assert!(pool.queued() + pool.in_flight() <= pool.total_capacity());

    release_tx.send(true).unwrap();

    timeout(Duration::from_millis(500), pool.push(5))
        .await
        .expect("push after release should be admitted")
        .unwrap();
    assert!(eventually(Duration::from_secs(1), || calls.load(Ordering::SeqCst) == 11).await);
    assert_eq!(pool.total_queued(), 11);

    pool.join().await.unwrap();
    assert!(!pool.has_exceptions());
}

#[tokio::test]
async fn test_load_factor() {
    let (release_tx, release_rx) = watch::channel(false);
    let pool = WorkerPool::new(
        move |_: u32| {
            let mut release = release_rx.clone();
            async move {
                let _ = release.wait_for(|released| *released).await;
                Ok(())
            }
        },
        PoolConfig::new(5, "load-factor").with_load_factor(2),
    )
    .unwrap();
    pool.start();
    assert_eq!(pool.total_capacity(), 15);

    // Five in flight plus ten queued.
    for _ in 0..15 {
        timeout(Duration::from_millis(200), pool.push(5))
            .await
            .expect("push within capacity should not wait")
            .unwrap();
    }

    let blocked = timeout(Duration::from_millis(200), pool.push(5)).await;
    assert!(blocked.is_err());
    assert_eq!(pool.available_capacity(), 0);

    release_tx.send(true).unwrap();

    timeout(Duration::from_millis(500), pool.push(5))
        .await
        .expect("push after release should be admitted")
        .unwrap();
    pool.join().await.unwrap();
    assert_eq!(pool.total_queued(), 16);
    assert!(!pool.has_exceptions());
}

#[tokio::test]
async fn test_task_timeout() {
    let pool = WorkerPool::new(
        |_: u32| async move {
            std::future::pending::<()>().await;
            Ok(())
        },
        PoolConfig::new(5, "task-timeout")
            .with_max_task_time(Duration::from_millis(50))
            .with_return_futures(true),
    )
    .unwrap();
    pool.start();

    let handle = timeout(Duration::from_millis(200), pool.push(5))
        .await
        .unwrap()
        .unwrap()
        .expect("return_futures yields a handle");

    let result = handle.wait_timeout(Duration::from_secs(1)).await;
    assert_eq!(result, Err(PoolError::Timeout(Duration::from_millis(50))));
    assert!(pool.has_exceptions());

    let exceptions = pool.exceptions();
    assert_eq!(exceptions.len(), 1);
    assert_eq!(exceptions[0].payload, "5");

    // The timed out job freed its worker for the next one.
    assert!(eventually(Duration::from_secs(1), || pool.in_flight() == 0).await);
    pool.join().await.unwrap();
}

#[tokio::test]
async fn test_join() {
    let key = "blah";
    let pool = WorkerPool::new(
        |param: &'static str| async move {
            sleep(Duration::from_millis(100)).await;
            Ok(param)
        },
        PoolConfig::new(5, "join").with_return_futures(true),
    )
    .unwrap();
    pool.start();

    let mut handle = timeout(Duration::from_millis(50), pool.push(key))
        .await
        .unwrap()
        .unwrap()
        .expect("return_futures yields a handle");
    assert!(!handle.is_resolved());

    pool.join().await.unwrap();

    assert!(handle.is_resolved());
    assert_eq!(handle.wait().await, Ok(key));
}

#[tokio::test]
async fn test_abandoned_push_has_no_side_effect() {
    let (release_tx, release_rx) = watch::channel(false);
    let calls = Arc::new(AtomicUsize::new(0));
    let calls_clone = calls.clone();

    let pool = WorkerPool::new(
        move |_: u32| {
            let calls = calls_clone.clone();
            let mut release = release_rx.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                let _ = release.wait_for(|released| *released).await;
                Ok(())
            }
        },
        PoolConfig::new(1, "abandon").with_load_factor(0),
    )
    .unwrap();
    pool.start();

    pool.push(1).await.unwrap();
    assert!(timeout(Duration::from_millis(100), pool.push(2)).await.is_err());
    assert!(timeout(Duration::from_millis(100), pool.push(3)).await.is_err());
    assert_eq!(pool.total_queued(), 1);

    release_tx.send(true).unwrap();
    pool.join().await.unwrap();

    // Only the admitted job ever ran.
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_capacity_never_exceeded() {
    let pool = Arc::new(
        WorkerPool::new(
            |n: u64| async move {
                sleep(Duration::from_millis(n % 7)).await;
                Ok(n)
            },
            PoolConfig::new(3, "capacity").with_load_factor(2),
        )
        .unwrap(),
    );
    pool.start();

    let producers: Vec<_> = (0..4)
        .map(|p| {
            let pool = pool.clone();
            tokio::spawn(async move {
                for i in 0..25 {
                    pool.push(p * 100 + i).await.unwrap();
                    assert!(pool.queued() <= pool.total_capacity());
                }
            })
        })
        .collect();

    let mut last_total = 0;
    while !producers.iter().all(|p| p.is_finished()) {
        let total = pool.total_queued();
        assert!(total >= last_total);
        assert!(pool.in_flight() <= 3);
        last_total = total;
        sleep(Duration::from_millis(1)).await;
    }
    for producer in producers {
        producer.await.unwrap();
    }

    pool.join().await.unwrap();
    assert_eq!(pool.total_queued(), 100);
    assert!(!pool.has_exceptions());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_every_future_resolved_once_on_multi_thread_runtime() {
    let config = PoolConfig::new(4, "multi").with_return_futures(true);
    let pool = WorkerPool::new(
        |n: u32| async move {
            tokio::task::yield_now().await;
            if n % 10 == 0 {
                Err(PoolError::JobFailed(format!("{} is round", n)))
            } else {
                Ok(n * 2)
            }
        },
        config,
    )
    .unwrap();
    pool.start();

    let mut handles = Vec::new();
    for n in 1..=50 {
        handles.push((n, pool.push(n).await.unwrap().unwrap()));
    }
    pool.join().await.unwrap();

    for (n, handle) in handles {
        match handle.await {
            Ok(doubled) => assert_eq!(doubled, n * 2),
            Err(PoolError::JobFailed(msg)) => assert_eq!(msg, format!("{} is round", n)),
            Err(other) => panic!("unexpected outcome for {}: {}", n, other),
        }
    }
    assert_eq!(pool.exceptions().len(), 5);
}
