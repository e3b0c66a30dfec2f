// SPDX-FileCopyrightText: 2025 rupica contributors
// SPDX-License-Identifier: GPL-3.0-or-later

//! Fixed-size worker pool for background jobs.
//!
//! Work units must be self-contained; the pool gives no ordering guarantee
//! between jobs. On drop the queue is drained and all threads are joined,
//! so queued work always runs to completion.

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::JoinHandle;

use parking_lot::{Condvar, Mutex};

type Job = Box<dyn FnOnce() + Send + 'static>;

struct State {
    queue: Mutex<QueueState>,
    work_available: Condvar,
    work_done: Condvar,
}

struct QueueState {
    jobs: VecDeque<Job>,
    in_flight: usize,
    stop: bool,
}

pub struct ThreadWorker {
    state: Arc<State>,
    threads: Vec<JoinHandle<()>>,
}

impl ThreadWorker {
    /// Spawns `num_workers` threads named `name-N`.
    pub fn new(num_workers: usize, name: &str) -> Self {
        let state = Arc::new(State {
            queue: Mutex::new(QueueState {
                jobs: VecDeque::new(),
                in_flight: 0,
                stop: false,
            }),
            work_available: Condvar::new(),
            work_done: Condvar::new(),
        });

        let threads = (0..num_workers.max(1))
            .map(|index| {
                let state = Arc::clone(&state);
                std::thread::Builder::new()
                    .name(format!("{name}-{index}"))
                    .spawn(move || worker_loop(&state))
                    .expect("failed to spawn worker thread")
            })
            .collect();

        Self { state, threads }
    }

    pub fn num_workers(&self) -> usize {
        self.threads.len()
    }

    /// Enqueues a job for execution on any worker thread.
    pub fn queue_work(&self, job: impl FnOnce() + Send + 'static) {
        let mut queue = self.state.queue.lock();
        queue.jobs.push_back(Box::new(job));
        drop(queue);
        self.state.work_available.notify_one();
    }

    /// Blocks until every queued job has finished.
    pub fn wait_for_requests(&self) {
        let mut queue = self.state.queue.lock();
        while !queue.jobs.is_empty() || queue.in_flight != 0 {
            self.state.work_done.wait(&mut queue);
        }
    }
}

impl Drop for ThreadWorker {
    fn drop(&mut self) {
        {
            let mut queue = self.state.queue.lock();
            queue.stop = true;
        }
        self.state.work_available.notify_all();
        for thread in self.threads.drain(..) {
            let _ = thread.join();
        }
    }
}

fn worker_loop(state: &State) {
    loop {
        let job = {
            let mut queue = state.queue.lock();
            loop {
                if let Some(job) = queue.jobs.pop_front() {
                    queue.in_flight += 1;
                    break job;
                }
                if queue.stop {
                    return;
                }
                state.work_available.wait(&mut queue);
            }
        };

        job();

        let mut queue = state.queue.lock();
        queue.in_flight -= 1;
        if queue.jobs.is_empty() && queue.in_flight == 0 {
            state.work_done.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_runs_all_jobs() {
        let worker = ThreadWorker::new(3, "test");
        let counter = Arc::new(AtomicUsize::new(0));
        for _ in 0..64 {
            let counter = Arc::clone(&counter);
            worker.queue_work(move || {
                counter.fetch_add(1, Ordering::SeqCst);
            });
        }
        worker.wait_for_requests();
        assert_eq!(counter.load(Ordering::SeqCst), 64);
    }

    #[test]
    fn test_drop_drains_queue() {
        let counter = Arc::new(AtomicUsize::new(0));
        {
            let worker = ThreadWorker::new(1, "drain");
            for _ in 0..8 {
                let counter = Arc::clone(&counter);
                worker.queue_work(move || {
                    counter.fetch_add(1, Ordering::SeqCst);
                });
            }
            worker.wait_for_requests();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 8);
    }

    #[test]
    fn test_wait_with_no_work() {
        let worker = ThreadWorker::new(2, "idle");
        worker.wait_for_requests();
    }
}
