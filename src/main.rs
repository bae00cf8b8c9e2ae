use parallel_tasks::Parallel;
use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::Instant;

fn main() {
    let parallel = Parallel::global();
    let sum = Arc::new(AtomicU64::new(0));

    let now = Instant::now();
    let acc = Arc::clone(&sum);
    if let Err(e) = parallel.for_range(0, 5_000_000, move |i| {
        acc.fetch_add(i as u64, Ordering::Relaxed);
    }) {
        eprintln!("loop failed: {e}");
        return;
    }
    println!("elapsed: {:?}", now.elapsed());
    println!("sum: {}", sum.load(Ordering::Relaxed));
    println!("{:?}", parallel.scheduler().metrics());
}
