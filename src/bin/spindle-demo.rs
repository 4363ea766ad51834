//! spindle demo
//!
//! Runs a few green threads under the default shutdown policy: once the
//! last thread exits the reaper prints its farewell and ends the process.

use spindle::kernel::{self, Builder, Runtime};
use spindle::{CondVar, Mutex};
use std::sync::Arc;

/// A one-slot mailbox guarded by a green mutex
struct Mailbox {
    lock: Mutex,
    ready: CondVar,
    slot: std::sync::Mutex<Option<i64>>,
}

fn main() {
    let result = Runtime::builder().build().and_then(|rt| {
        rt.run(|| {
            let me = kernel::current();
            println!("[main] {} at priority {:?}", me, kernel::priority(me));

            // Priorities decide the order, not creation order
            let mut workers = Vec::new();
            for prio in [1, 5, 3] {
                let id = Builder::new()
                    .priority(prio)
                    .joinable()
                    .name(format!("worker-{}", prio))
                    .spawn(move || {
                        println!("[worker-{}] running", prio);
                        i64::from(prio) * 10
                    });
                match id {
                    Ok(id) => workers.push(id),
                    Err(e) => println!("[main] create failed: {}", e),
                }
            }
            for id in workers {
                match kernel::join(id) {
                    Ok(status) => println!("[main] joined {} -> {}", id, status),
                    Err(e) => println!("[main] join {} failed: {}", id, e),
                }
            }

            let mailbox = Arc::new(Mailbox {
                lock: Mutex::new(),
                ready: CondVar::new(),
                slot: std::sync::Mutex::new(None),
            });
            let producer = Arc::clone(&mailbox);
            let _ = kernel::create(
                move || {
                    producer.lock.lock();
                    if let Ok(mut slot) = producer.slot.lock() {
                        *slot = Some(42);
                    }
                    producer.ready.signal();
                    producer.lock.unlock();
                    0
                },
                2,
            );

            mailbox.lock.lock();
            loop {
                let value = mailbox.slot.lock().ok().and_then(|mut s| s.take());
                if let Some(value) = value {
                    println!("[main] mailbox delivered {}", value);
                    break;
                }
                mailbox.ready.wait(&mailbox.lock);
            }
            mailbox.lock.unlock();

            let stats = kernel::stats();
            println!(
                "[main] created={} switches={} exits={}",
                stats.created, stats.switches, stats.exits
            );
            0
        })
    });

    // Only reached if boot failed
    if let Err(e) = result {
        eprintln!("spindle-demo: {}", e);
        std::process::exit(1);
    }
}
