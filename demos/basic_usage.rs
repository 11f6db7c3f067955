use rust_asyncpool::{PoolConfig, WorkerPool};
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_asyncpool=info".into()),
        )
        .init();

    // Four workers, four more jobs buffered, a result handle per job
    let config = PoolConfig::new(4, "basic")
        .with_max_task_time(Duration::from_secs(5))
        .with_return_futures(true);

    let pool = WorkerPool::new(
        |n: u32| async move {
            println!("Processing job with input: {}", n);
            tokio::time::sleep(Duration::from_millis(100)).await;
            Ok(n * 2)
        },
        config,
    )?;
    pool.start();

    println!("Pool created with capacity: {}", pool.total_capacity());

    // Submit jobs to the pool; push waits whenever eight jobs are outstanding
    let mut handles = Vec::new();
    for i in 0..10 {
        println!("Submitting job with input: {}", i);
        if let Some(handle) = pool.push(i).await? {
            handles.push(handle);
        }
    }

    // Wait for all jobs to complete
    for (i, handle) in handles.into_iter().enumerate() {
        match handle.wait().await {
            Ok(result) => println!("Job {} completed with result: {}", i, result),
            Err(err) => println!("Job {} failed with error: {}", i, err),
        }
    }

    println!("Shutting down the pool after {} jobs", pool.total_queued());
    pool.join().await?;

    Ok(())
}
