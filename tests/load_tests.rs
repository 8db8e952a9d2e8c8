#[cfg(test)]
mod tests {
    use crossbeam::channel;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };
    use workpool::{BoxError, Config, Job, JobError, Pool};

    fn measure<T>(name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        println!("✓ {}: {:?}", name, start.elapsed());
        result
    }

    fn sleeper(d: Duration) -> impl FnOnce(&Job<u32>) -> Result<u32, BoxError> + Send + 'static {
        move |_: &Job<u32>| {
            thread::sleep(d);
            Ok(1)
        }
    }

    #[test]
    fn load_test_1_ten_sleeping_jobs() {
        println!("\n=== LOAD TEST 1: 10 jobs x 1s on 4 workers ===");
        let pool = Pool::new(4).unwrap();

        let jobs: Vec<_> = (0..10)
            .map(|_| {
                pool.queue(|_| {
                    thread::sleep(Duration::from_secs(1));
                    Ok::<_, BoxError>(())
                })
            })
            .collect();

        let count = measure("10 jobs", || {
            let mut count = 0;
            for job in &jobs {
                job.wait();
                assert!(job.error().is_none());
                assert_eq!(job.value(), Some(&()));
                count += 1;
            }
            count
        });
        assert_eq!(count, 10);

        pool.close();
        // closing twice is fine
        pool.close();
    }

    #[test]
    fn load_test_2_cancel_staggered_submissions() {
        println!("\n=== LOAD TEST 2: 40 staggered jobs, cancel after 1s ===");
        let pool = Pool::new(4).unwrap();
        let (tx, rx) = channel::unbounded();

        let producers: Vec<_> = (0..40u64)
            .map(|i| {
                let pool = pool.clone();
                let tx = tx.clone();
                thread::spawn(move || {
                    thread::sleep(Duration::from_millis(i * 40));
                    let _ = tx.send(pool.queue(sleeper(Duration::from_secs(1))));
                })
            })
            .collect();
        drop(tx);

        thread::sleep(Duration::from_secs(1));
        measure("pool cancel", || pool.cancel());

        for p in producers {
            p.join().unwrap();
        }

        let mut count = 0;
        let mut cancelled = 0;
        for job in rx.iter() {
            job.wait();
            match job.error() {
                None => count += *job.value().unwrap(),
                Some(JobError::Cancelled) => {
                    assert_eq!(job.error().unwrap().to_string(), "job cancelled");
                    cancelled += 1;
                }
                Some(JobError::PoolClosed) => cancelled += 1,
                Some(other) => panic!("unexpected error: {:?}", other),
            }
        }
        println!("  completed: {}, cancelled/rejected: {}", count, cancelled);
        assert!(count < 40);
        assert_eq!(count as usize + cancelled, 40);

        // reset and use again
        pool.reset();
        let job = pool.queue(sleeper(Duration::from_millis(300)));
        job.wait();
        assert_eq!(job.value(), Some(&1));

        let job = pool.queue(sleeper(Duration::from_millis(300)));
        thread::sleep(Duration::from_secs(1));
        job.cancel();
        // does not hang after a late cancel
        job.wait();
        assert!(job.error().is_none());

        pool.reset();
        pool.close();
    }

    #[test]
    fn load_test_3_commit_cancel_races() {
        println!("\n=== LOAD TEST 3: 1k jobs with racing cancels ===");
        let pool = Pool::with_config(Config::new(8).with_queue_capacity(1024)).unwrap();

        let jobs: Vec<_> = (0..1_000u32)
            .map(|i| {
                let committed = Arc::new(AtomicBool::new(false));
                let flag = committed.clone();
                let job = pool.queue(move |job| {
                    if i % 2 == 0 {
                        thread::yield_now();
                    }
                    if job.is_cancelled() {
                        return Ok(0);
                    }
                    flag.store(true, Ordering::SeqCst);
                    Ok::<_, BoxError>(i)
                });
                if i % 3 == 0 {
                    job.cancel();
                }
                (job, committed)
            })
            .collect();

        let cancellers: Vec<_> = jobs
            .iter()
            .filter(|(job, _)| job.id() % 3 == 1)
            .map(|(job, _)| {
                let job = job.clone();
                thread::spawn(move || job.cancel())
            })
            .collect();
        for c in cancellers {
            c.join().unwrap();
        }

        let (mut completed, mut cancelled) = (0, 0);
        for (i, (job, committed)) in jobs.iter().enumerate() {
            job.wait();
            match job.outcome().expect("resolved after wait") {
                Ok(v) => {
                    assert_eq!(*v, i as u32);
                    completed += 1;
                }
                Err(err) => {
                    assert!(err.is_cancelled(), "unexpected error: {:?}", err);
                    assert!(!committed.load(Ordering::SeqCst), "committed job lost its result");
                    cancelled += 1;
                }
            }
        }
        println!("  completed: {}, cancelled: {}", completed, cancelled);
        assert_eq!(completed + cancelled, jobs.len());
        assert!(cancelled > 0);
    }

    #[test]
    fn load_test_4_panic_storm_keeps_capacity() {
        println!("\n=== LOAD TEST 4: every 5th of 200 jobs panics ===");
        let pool = Pool::new(4).unwrap();

        let jobs: Vec<_> = (0..200u32)
            .map(|i| {
                pool.queue(move |_| {
                    if i % 5 == 0 {
                        panic!("job {} panicked", i);
                    }
                    Ok::<_, BoxError>(i)
                })
            })
            .collect();

        let mut recovered = 0;
        for (i, job) in jobs.iter().enumerate() {
            job.wait();
            if i % 5 == 0 {
                assert!(job.error().is_some_and(JobError::is_recovery));
                recovered += 1;
            } else {
                assert_eq!(job.value(), Some(&(i as u32)));
            }
        }
        assert_eq!(recovered, 40);

        let deadline = Instant::now() + Duration::from_secs(2);
        while pool.metrics().live_workers != 4 && Instant::now() < deadline {
            thread::sleep(Duration::from_millis(10));
        }
        let metrics = pool.metrics();
        println!("  metrics: {:?}", metrics);
        assert_eq!(metrics.live_workers, 4);
        assert_eq!(metrics.workers_replaced, 40);
        assert_eq!(metrics.panicked, 40);
    }

    #[test]
    fn load_test_5_concurrent_submitters_with_close() {
        println!("\n=== LOAD TEST 5: 8 submitters x 100 jobs, close midway ===");
        let pool = Pool::new(4).unwrap();

        let submitters: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                thread::spawn(move || {
                    (0..100u32)
                        .map(|i| {
                            if i % 50 == 0 {
                                thread::sleep(Duration::from_millis(5));
                            }
                            pool.queue(move |_| {
                                thread::sleep(Duration::from_micros(200));
                                Ok::<_, BoxError>(i)
                            })
                        })
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        thread::sleep(Duration::from_millis(10));
        pool.close();

        let jobs: Vec<_> = submitters
            .into_iter()
            .flat_map(|s| s.join().unwrap())
            .collect();

        let resolved = measure("wait 800 jobs", || {
            jobs.iter()
                .filter(|job| {
                    job.wait();
                    match job.outcome() {
                        Some(Ok(_)) => true,
                        Some(Err(err)) => {
                            assert!(err.is_pool_closed(), "unexpected error: {:?}", err);
                            true
                        }
                        None => false,
                    }
                })
                .count()
        });
        assert_eq!(resolved, 800);

        let metrics = pool.metrics();
        println!("  metrics: {:?}", metrics);
        assert_eq!(metrics.submitted, 800);
        assert!(metrics.rejected + metrics.drained > 0);
    }
}
