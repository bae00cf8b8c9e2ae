#[cfg(test)]
mod tests {
    use parallel_tasks::{Parallel, WorkOptions};
    use std::{
        sync::{
            atomic::{AtomicU64, AtomicUsize, Ordering},
            Arc,
        },
        thread,
        time::{Duration, Instant},
    };

    fn measure<T>(name: &str, f: impl FnOnce() -> T) -> T {
        let start = Instant::now();
        let result = f();
        println!("✓ {}: {:?}", name, start.elapsed());
        result
    }

    #[test]
    fn load_test_1_many_small_tasks() {
        println!("\n=== LOAD TEST 1: 100k small tasks ===");
        let parallel = Parallel::new(num_cpus::get().max(2)).unwrap();
        let count = Arc::new(AtomicUsize::new(0));

        let tasks = measure("submit 100k", || {
            (0..100_000)
                .map(|_| {
                    let c = Arc::clone(&count);
                    parallel
                        .start(move || {
                            c.fetch_add(1, Ordering::Relaxed);
                        })
                        .unwrap()
                })
                .collect::<Vec<_>>()
        });
        measure("wait 100k", || {
            for task in &tasks {
                task.wait().unwrap();
            }
        });

        assert_eq!(count.load(Ordering::Relaxed), 100_000);
        let metrics = parallel.scheduler().metrics();
        println!("  Executed: {}, stolen: {}", metrics.executed_tasks, metrics.stolen_tasks);
    }

    #[test]
    fn load_test_2_background_does_not_starve_loops() {
        println!("\n=== LOAD TEST 2: long background work next to parallel loops ===");
        let parallel = Arc::new(Parallel::new(4).unwrap());

        let sleepers: Vec<_> = (0..4)
            .map(|_| {
                parallel
                    .start_background(|| thread::sleep(Duration::from_secs(2)))
                    .unwrap()
            })
            .collect();

        let start = Instant::now();
        let loops: Vec<_> = (0..4)
            .map(|_| {
                let parallel = Arc::clone(&parallel);
                thread::spawn(move || {
                    let sum = Arc::new(AtomicU64::new(0));
                    let acc = Arc::clone(&sum);
                    parallel
                        .for_range(0, 100_000, move |i| {
                            acc.fetch_add(i as u64, Ordering::Relaxed);
                        })
                        .unwrap();
                    sum.load(Ordering::Relaxed)
                })
            })
            .collect();

        for handle in loops {
            assert_eq!(handle.join().unwrap(), 4_999_950_000);
        }
        let elapsed = start.elapsed();
        println!("  Loops finished in {:?}", elapsed);
        assert!(elapsed < Duration::from_secs(2), "loops waited for background work");
        assert!(
            sleepers.iter().any(|task| !task.is_complete()),
            "background work should still be sleeping"
        );

        for task in &sleepers {
            task.wait().unwrap();
        }
        println!("✓ background threads kept off the pool");
    }

    fn tree_sum(parallel: &Arc<Parallel>, lo: u64, hi: u64, acc: &Arc<AtomicU64>) {
        if hi - lo <= 1_000 {
            acc.fetch_add((lo..hi).sum::<u64>(), Ordering::Relaxed);
            return;
        }
        let mid = lo + (hi - lo) / 2;
        let (p, a) = (Arc::clone(parallel), Arc::clone(acc));
        parallel
            .join(
                || tree_sum(parallel, lo, mid, acc),
                move || tree_sum(&p, mid, hi, &a),
            )
            .unwrap();
    }

    #[test]
    fn load_test_3_recursive_join() {
        println!("\n=== LOAD TEST 3: recursive fork-join ===");
        let parallel = Arc::new(Parallel::new(4).unwrap());
        let acc = Arc::new(AtomicU64::new(0));

        measure("tree sum of 0..1M", || tree_sum(&parallel, 0, 1_000_000, &acc));
        assert_eq!(acc.load(Ordering::Relaxed), 499_999_500_000);
    }

    #[test]
    fn load_test_4_unbounded_replication() {
        println!("\n=== LOAD TEST 4: unbounded replicable work ===");
        let parallel = Parallel::new(8).unwrap();
        let claimed = Arc::new(AtomicUsize::new(0));
        let participants = Arc::new(AtomicUsize::new(0));

        let (c, p) = (Arc::clone(&claimed), Arc::clone(&participants));
        let task = parallel
            .start_with_options(WorkOptions::unbounded(), move || {
                p.fetch_add(1, Ordering::Relaxed);
                let claim = |n: usize| (n < 50_000).then_some(n + 1);
                while c
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, claim)
                    .is_ok()
                {
                    std::hint::spin_loop();
                }
            })
            .unwrap();

        measure("partitioned 50k claims", || task.wait().unwrap());
        assert_eq!(claimed.load(Ordering::Relaxed), 50_000);
        let joined = participants.load(Ordering::Relaxed);
        assert!((1..=8).contains(&joined));
        println!("  Participants: {}", joined);
    }

    #[test]
    fn load_test_5_for_each_strings() {
        println!("\n=== LOAD TEST 5: for_each over owned items ===");
        let parallel = Parallel::new(4).unwrap();
        let total = Arc::new(AtomicUsize::new(0));
        let items: Vec<String> = (0..20_000).map(|i| format!("item-{i}")).collect();
        let expected: usize = items.iter().map(String::len).sum();

        let t = Arc::clone(&total);
        measure("20k strings", || {
            parallel
                .for_each(items, move |s| {
                    t.fetch_add(s.len(), Ordering::Relaxed);
                })
                .unwrap()
        });
        assert_eq!(total.load(Ordering::Relaxed), expected);
    }
}
