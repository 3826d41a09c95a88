//! Background writeback thread: drains a bounded queue of dirty keys into
//! the durable tier on a fixed interval, independent of `flush()`'s
//! synchronous path (spec.md §4.5 "Durability protocol").

use super::cache::Key;
use crossbeam_channel::{Receiver, Sender, TryRecvError};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

const DRAIN_CAP: usize = 64;
const QUEUE_BOUND: usize = 4096;

pub struct WritebackQueue {
    sender: Sender<Key>,
}

impl WritebackQueue {
    pub fn enqueue(&self, key: Key) {
        // the channel is bounded; a full queue means writeback is falling
        // behind, and `flush()` remains available as the synchronous
        // escape hatch, so a dropped enqueue here is not fatal.
        let _ = self.sender.try_send(key);
    }
}

/// spawns the dedicated writeback thread and returns a queue handle plus a
/// stop flag the caller holds to shut it down.
pub fn spawn<F>(interval: Duration, drain: F) -> (WritebackQueue, Arc<AtomicBool>, JoinHandle<()>)
where
    F: Fn(&[Key]) + Send + 'static,
{
    let (sender, receiver) = crossbeam_channel::bounded::<Key>(QUEUE_BOUND);
    let stop_flag = Arc::new(AtomicBool::new(false));
    let thread_stop = Arc::clone(&stop_flag);

    let handle = std::thread::spawn(move || {
        writeback_loop(receiver, interval, drain, &thread_stop);
    });

    (WritebackQueue { sender }, stop_flag, handle)
}

fn writeback_loop<F: Fn(&[Key])>(receiver: Receiver<Key>, interval: Duration, drain: F, stop_flag: &AtomicBool) {
    let mut batch = Vec::with_capacity(DRAIN_CAP);
    while !stop_flag.load(Ordering::Relaxed) {
        batch.clear();
        loop {
            match receiver.try_recv() {
                Ok(key) => {
                    batch.push(key);
                    if batch.len() >= DRAIN_CAP {
                        break;
                    }
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => {
                    if !batch.is_empty() {
                        drain(&batch);
                    }
                    return;
                }
            }
        }
        if !batch.is_empty() {
            drain(&batch);
        }
        std::thread::sleep(interval);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn drains_enqueued_keys_within_one_interval() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let seen_clone = Arc::clone(&seen);
        let (queue, stop_flag, handle) = spawn(Duration::from_millis(20), move |keys: &[Key]| {
            seen_clone.lock().unwrap().extend_from_slice(keys);
        });

        queue.enqueue([1u8; 32]);
        queue.enqueue([2u8; 32]);
        std::thread::sleep(Duration::from_millis(80));

        stop_flag.store(true, Ordering::Relaxed);
        handle.join().unwrap();

        let seen = seen.lock().unwrap();
        assert!(seen.contains(&[1u8; 32]));
        assert!(seen.contains(&[2u8; 32]));
    }
}
