use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use gamestats_cache::config::Config;
use gamestats_cache::{GamesStatsCache, metric};
use sentry::SentryFutureExt;
use sketches_ddsketch::DDSketch;
use tokio::sync::Semaphore;

use crate::workloads::{OpStats, PreparedWorkload, WorkloadsConfig, prepare_workload};

struct WorkloadReport {
    durations: DDSketch,
    stats: OpStats,
    invalidated: usize,
}

pub async fn perform_stresstest(
    config: Config,
    workloads: WorkloadsConfig,
    duration: Duration,
) -> Result<()> {
    // both apps share one cache, like they share one process
    let cache = GamesStatsCache::new(&config.cache);

    let workloads = workloads
        .workloads
        .into_iter()
        .enumerate()
        .map(|(i, workload)| {
            prepare_workload(workload)
                .map(Arc::new)
                .with_context(|| format!("invalid workload {i}"))
        })
        .collect::<Result<Vec<_>>>()?;

    // warmup: run each workload once so the cache starts out populated
    {
        let start = Instant::now();

        let futures = workloads.iter().map(|workload| {
            let cache = cache.clone();
            let workload = Arc::clone(workload);
            tokio::spawn(async move { workload.run_once(&cache).await })
        });

        let _results = futures::future::join_all(futures).await;

        println!("Warmup: {:?}", start.elapsed());
    };
    println!();

    // run the workloads concurrently
    let start = Instant::now();
    let deadline = tokio::time::Instant::from_std(start + duration);
    let mut tasks = Vec::with_capacity(workloads.len());
    for workload in &workloads {
        let cache = cache.clone();
        let workload = Arc::clone(workload);

        let task = tokio::spawn(async move {
            let invalidator = workload.invalidate_every.map(|every| {
                let cache = cache.clone();
                let workload = Arc::clone(&workload);
                tokio::spawn(async move {
                    let mut invalidated = 0;
                    let start = tokio::time::Instant::now() + every;
                    let mut interval = tokio::time::interval_at(start, every);
                    loop {
                        tokio::select! {
                            _ = interval.tick() => invalidated += workload.invalidate_some(&cache),
                            _ = tokio::time::sleep_until(deadline) => break,
                        }
                    }
                    invalidated
                })
            });

            let concurrency = workload.concurrency;
            let task_durations = Arc::new(Mutex::new(DDSketch::default()));
            let op_stats = Arc::new(Mutex::new(OpStats::default()));
            let semaphore = Arc::new(Semaphore::new(concurrency));

            // See <https://docs.rs/tokio/latest/tokio/time/struct.Sleep.html#examples>
            let sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(sleep);

            loop {
                if deadline.elapsed() > Duration::ZERO {
                    break;
                }
                tokio::select! {
                    permit = semaphore.clone().acquire_owned() => {
                        let Ok(permit) = permit else { break };
                        let cache = cache.clone();
                        let workload = Arc::clone(&workload);
                        let task_durations = Arc::clone(&task_durations);
                        let op_stats = Arc::clone(&op_stats);
                        let task_start = Instant::now();

                        let hub = sentry::Hub::new_from_top(sentry::Hub::current());
                        let ctx = sentry::TransactionContext::new("stresstest", workload.app.as_str());
                        let transaction = hub.start_transaction(ctx);

                        let future = async move {
                            let stats = workload.run_once(&cache).await;

                            transaction.finish();

                            let elapsed = task_start.elapsed();
                            metric!(timer("gamestats.stress.op") = elapsed, "app" => workload.app.as_str());
                            task_durations
                                .lock()
                                .unwrap_or_else(PoisonError::into_inner)
                                .add(elapsed.as_secs_f64());
                            *op_stats.lock().unwrap_or_else(PoisonError::into_inner) += stats;

                            drop(permit);
                        };
                        tokio::spawn(future.bind_hub(hub));
                    }
                    _ = &mut sleep => {
                        break;
                    }
                }
            }

            // by acquiring *all* the permits, we essentially wait for all outstanding tasks to finish
            let _permits = semaphore.acquire_many(concurrency as u32).await;

            let invalidated = match invalidator {
                Some(task) => task.await.unwrap_or_default(),
                None => 0,
            };
            let durations = std::mem::take(
                &mut *task_durations.lock().unwrap_or_else(PoisonError::into_inner),
            );
            let stats = *op_stats.lock().unwrap_or_else(PoisonError::into_inner);

            WorkloadReport {
                durations,
                stats,
                invalidated,
            }
        });
        tasks.push(task);
    }

    let finished_tasks = futures::future::join_all(tasks).await;

    for (i, (workload, task)) in workloads.iter().zip(finished_tasks).enumerate() {
        let report = task.with_context(|| format!("workload {i} panicked"))?;
        print_report(i, workload, &report, duration);
    }

    println!();
    println!(
        "Cache: {} entries, {} fetches pending",
        cache.entry_count(),
        cache.pending_count()
    );

    Ok(())
}

fn print_report(i: usize, workload: &PreparedWorkload, report: &WorkloadReport, duration: Duration) {
    let WorkloadReport {
        durations,
        stats,
        invalidated,
    } = report;

    let ops = durations.count();
    let ops_ps = ops as f32 / duration.as_secs_f32();
    println!(
        "Workload {i} ({}, concurrency: {}): {ops} operations, {ops_ps:.2} ops/s",
        workload.app.as_str(),
        workload.concurrency,
    );

    if ops > 0 {
        let quantile = |q| {
            let secs = durations.quantile(q).ok().flatten().unwrap_or_default();
            Duration::from_secs_f64(secs)
        };
        let avg = Duration::from_secs_f64(durations.sum().unwrap_or_default() / ops as f64);
        let (p50, p90, p99) = (quantile(0.5), quantile(0.9), quantile(0.99));
        println!("  avg: {avg:.2?}; p50: {p50:.2?}; p90: {p90:.2?}; p99: {p99:.2?}");
    }

    let loads = stats.fresh + stats.fetched + stats.joined + stats.failed;
    println!(
        "  loads: {loads} (fresh: {}, fetched: {}, joined: {}, failed: {}); backend fetches: {}",
        stats.fresh,
        stats.fetched,
        stats.joined,
        stats.failed,
        workload.backend.fetches(),
    );
    if *invalidated > 0 {
        println!("  invalidated: {invalidated} entries");
    }
}
