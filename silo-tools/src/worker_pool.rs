//! Fixed-size worker pool over a bounded job queue.
//!
//! Producers feel backpressure as soon as all workers are busy (the
//! queue holds at most two jobs per worker). There is no separate error
//! channel: a failing job cancels the pool's [`CancelToken`] with its
//! message, `dispatch` starts refusing jobs, and `finish` surfaces the
//! reason. Pools whose jobs report results through their own side
//! channel simply never return an error from the handler.

use std::thread::JoinHandle;

use anyhow::{format_err, Error};
use crossbeam_channel::{bounded, Sender};

use crate::CancelToken;

pub struct WorkerPool<J> {
    queue: Option<Sender<J>>,
    workers: Vec<JoinHandle<()>>,
    cancel: CancelToken,
}

impl<J: Send + 'static> WorkerPool<J> {
    /// Start `count` workers, each running `handler` on queued jobs.
    ///
    /// The pool shares the caller's token: cancelling it stops intake,
    /// and the first handler error cancels it for everyone.
    pub fn spawn<F>(name: &str, count: usize, cancel: CancelToken, handler: F) -> Self
    where
        F: Fn(J) -> Result<(), Error> + Send + Clone + 'static,
    {
        let count = count.max(1);
        let (queue, jobs) = bounded::<J>(count * 2);

        let workers = (0..count)
            .map(|index| {
                let jobs = jobs.clone();
                let handler = handler.clone();
                let cancel = cancel.clone();
                std::thread::Builder::new()
                    .name(format!("{}/{}", name, index))
                    .spawn(move || {
                        while let Ok(job) = jobs.recv() {
                            if let Err(err) = handler(job) {
                                cancel.cancel_with(format!("{:#}", err));
                            }
                        }
                    })
                    .expect("unable to spawn worker thread")
            })
            .collect();

        Self {
            queue: Some(queue),
            workers,
            cancel,
        }
    }

    /// Queue a job, blocking while all workers are busy. Refuses new
    /// work once the token is canceled.
    pub fn dispatch(&self, job: J) -> Result<(), Error> {
        self.cancel.check()?;
        let queue = self
            .queue
            .as_ref()
            .ok_or_else(|| format_err!("worker pool is shut down"))?;
        queue
            .send(job)
            .map_err(|_| format_err!("worker pool is shut down"))
    }

    pub fn cancel_token(&self) -> &CancelToken {
        &self.cancel
    }

    /// Drain the queue, join all workers and report the first failure.
    pub fn finish(mut self) -> Result<(), Error> {
        self.shutdown();
        self.cancel.check()
    }

    fn shutdown(&mut self) {
        drop(self.queue.take());
        for worker in self.workers.drain(..) {
            if worker.join().is_err() {
                self.cancel.cancel_with("worker thread panicked");
            }
        }
    }
}

// dropping the pool joins outstanding workers, errors stay on the token
impl<J> Drop for WorkerPool<J> {
    fn drop(&mut self) {
        if !self.workers.is_empty() {
            drop(self.queue.take());
            for worker in self.workers.drain(..) {
                let _ = worker.join();
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use anyhow::bail;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn all_jobs_run_to_completion() {
        let total = Arc::new(AtomicUsize::new(0));
        let sink = Arc::clone(&total);

        let pool = WorkerPool::spawn("adder", 4, CancelToken::new(), move |n: usize| {
            sink.fetch_add(n, Ordering::SeqCst);
            Ok(())
        });
        for n in 0..100 {
            pool.dispatch(n).unwrap();
        }
        pool.finish().unwrap();

        assert_eq!(total.load(Ordering::SeqCst), (0..100).sum());
    }

    #[test]
    fn a_failing_job_cancels_the_pool() {
        let pool = WorkerPool::spawn("picky", 2, CancelToken::new(), |n: usize| {
            if n == 7 {
                bail!("seven is right out");
            }
            Ok(())
        });

        let mut refused = false;
        for n in 0..1000 {
            if pool.dispatch(n).is_err() {
                refused = true;
                break;
            }
        }

        let err = pool.finish().unwrap_err();
        assert!(format!("{:#}", err).contains("seven is right out"));
        assert!(refused || silo_api_types::is_canceled(&err));
    }

    #[test]
    fn external_cancellation_stops_intake() {
        let cancel = CancelToken::new();
        let pool = WorkerPool::spawn("idle", 2, cancel.clone(), |_: ()| Ok(()));

        pool.dispatch(()).unwrap();
        cancel.cancel();
        assert!(pool.dispatch(()).is_err());
    }
}
