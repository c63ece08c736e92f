//! Example demonstrating a read-mostly workload on SyncMap
//!
//! Writers populate the map once, then many threads read and update the
//! same keys. After the first promotion every read is lock-free.
//! Overlay rebuilds and promotions are logged at trace level.

use kovan_syncmap::SyncMap;
use std::sync::Arc;
use std::thread;
use std::time::Instant;

fn main() {
    tracing_subscriber::fmt()
        .with_max_level(tracing::Level::TRACE)
        .with_thread_ids(true)
        .init();

    println!("=== Read-Optimized SyncMap Demo ===\n");

    let map = Arc::new(SyncMap::new());

    // Populate from 4 threads
    println!("Populating from 4 threads...");
    let start = Instant::now();
    let mut handles = Vec::new();
    for thread_id in 0..4 {
        let map_clone = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            for i in 0..2_500 {
                let key = thread_id * 2_500 + i;
                map_clone.store(key, key * 2);
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    let duration = start.elapsed();
    println!(
        "Stored 10,000 entries in {:?} ({:.2} ops/sec)",
        duration,
        10_000.0 / duration.as_secs_f64()
    );
    println!("Map contains {} entries\n", map.len());

    // Concurrent reads
    println!("Benchmarking concurrent reads...");
    let start = Instant::now();
    let mut handles = Vec::new();
    for _ in 0..8 {
        let map_clone = Arc::clone(&map);
        handles.push(thread::spawn(move || {
            let mut found = 0;
            for round in 0..10 {
                for key in 0..10_000 {
                    if map_clone.load(&((key + round) % 10_000)).is_some() {
                        found += 1;
                    }
                }
            }
            found
        }));
    }
    let total_found: usize = handles.into_iter().map(|h| h.join().unwrap()).sum();
    let duration = start.elapsed();
    println!(
        "Performed 800,000 loads from 8 threads in {:?} ({:.2} ops/sec)",
        duration,
        800_000.0 / duration.as_secs_f64()
    );
    println!("Found {} entries\n", total_found);

    // Counters updated with compare_and_swap
    println!("Incrementing shared counters with compare_and_swap...");
    let counters = Arc::new(SyncMap::new());
    for name in ["hits", "misses", "errors"] {
        counters.store(name, 0u64);
    }
    let start = Instant::now();
    let mut handles = Vec::new();
    for thread_id in 0..8 {
        let counters = Arc::clone(&counters);
        handles.push(thread::spawn(move || {
            let name = ["hits", "misses", "errors"][thread_id % 3];
            for _ in 0..1_000 {
                loop {
                    let current = counters.load(name).unwrap_or(0);
                    if counters.compare_and_swap(name, &current, current + 1) {
                        break;
                    }
                }
            }
        }));
    }
    for handle in handles {
        handle.join().unwrap();
    }
    println!("Updated counters in {:?}", start.elapsed());
    counters.range(|name, count| {
        println!("  {}: {}", name, count);
        true
    });

    // Removal
    println!("\nRemoving even keys...");
    for key in (0..10_000).step_by(2) {
        map.delete(&key);
    }
    println!("Map contains {} entries", map.len());
    println!("\n=== Demo Complete ===");
}
