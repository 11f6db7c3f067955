use rust_asyncpool::{PoolConfig, PoolError, WorkerPool};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rust_asyncpool=debug".into()),
        )
        .init();

    // A small pool with a deep buffer and a per-job deadline
    let config = PoolConfig::new(2, "advanced")
        .with_load_factor(3)
        .with_max_task_time(Duration::from_millis(500))
        .with_progress_log(5, Some(16));

    // Create a counter to track completed jobs
    let completed_jobs = Arc::new(AtomicUsize::new(0));
    let completed_jobs_clone = completed_jobs.clone();

    let handler = move |input: i32| {
        let counter = completed_jobs_clone.clone();

        async move {
            match input {
                // Successful fast job
                n if (0..5).contains(&n) => {
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(n * 2)
                }
                // Slow job that runs into the deadline
                n if (5..10).contains(&n) => {
                    tokio::time::sleep(Duration::from_millis(600)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(n * 2)
                }
                // Job that returns an error
                n if n < 0 => Err(PoolError::JobFailed(format!(
                    "Negative input not allowed: {}",
                    n
                ))),
                _ => {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    counter.fetch_add(1, Ordering::SeqCst);
                    Ok(input * 3)
                }
            }
        }
    };

    // The scope starts the pool, runs the body, then drains and joins it
    let submitted = WorkerPool::scope(handler, config, |pool| async move {
        println!("Pool created with total capacity: {}", pool.total_capacity());

        println!("\n--- Submitting a mix of jobs ---");
        for input in [0, 1, 2, 3, -1, 7, 10, 11, 12, 13, 14, 15, 16, 17, -2, 8] {
            let started = tokio::time::Instant::now();
            match pool.push(input).await {
                Ok(_) => println!(
                    "Submitted job {} after waiting {:?} (available capacity: {})",
                    input,
                    started.elapsed(),
                    pool.available_capacity()
                ),
                Err(err) => println!("Failed to submit job {}: {}", input, err),
            }
        }

        println!("\n--- Failures so far ---");
        for failure in pool.exceptions() {
            println!("{}", failure);
        }
        pool.total_queued()
    })
    .await?;

    println!("\n--- Statistics ---");
    println!("Total jobs submitted: {}", submitted);
    println!("Total jobs completed: {}", completed_jobs.load(Ordering::SeqCst));

    Ok(())
}
