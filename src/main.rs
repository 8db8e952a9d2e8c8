use std::{
    thread,
    time::{Duration, Instant},
};
use tracing::info;
use workpool::{logging, BoxError, Pool};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    logging::init_default();

    let pool = Pool::new(4)?;
    let now = Instant::now();

    let jobs: Vec<_> = (0..10u64)
        .map(|i| {
            pool.queue(move |_| {
                thread::sleep(Duration::from_millis(200));
                Ok::<_, BoxError>(i * i)
            })
        })
        .collect();

    let mut sum = 0;
    for job in &jobs {
        job.wait();
        match job.outcome() {
            Some(Ok(v)) => sum += v,
            Some(Err(err)) => info!(job_id = job.id(), %err, "job did not complete"),
            None => {}
        }
    }
    info!(sum, elapsed = ?now.elapsed(), "batch finished");

    // cancel mid-batch, then reuse the pool
    let slow: Vec<_> = (0..20)
        .map(|_| {
            pool.queue(|job| {
                thread::sleep(Duration::from_millis(100));
                if job.is_cancelled() {
                    return Ok(0);
                }
                Ok::<_, BoxError>(1)
            })
        })
        .collect();
    thread::sleep(Duration::from_millis(150));
    pool.cancel();

    let cancelled = slow
        .iter()
        .inspect(|job| job.wait())
        .filter(|job| job.error().is_some())
        .count();
    info!(cancelled, total = slow.len(), "pool cancelled");

    pool.reset();
    let job = pool.queue(|_| Ok::<_, BoxError>("after reset"));
    job.wait();
    info!(value = ?job.value(), metrics = ?pool.metrics(), "pool reset");

    pool.close();
    Ok(())
}
