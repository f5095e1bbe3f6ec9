//! Fixed-size pools of named OS threads for blocking method execution.
//!
//! Synchronous methods must leave the runtime; they run here. A server holds
//! up to two pools: the general worker pool and an isolated pool reserved
//! for methods flagged for isolation, so heavy work cannot starve the rest.

use std::sync::mpsc;
use std::sync::{Mutex, PoisonError};
use std::thread;

use tokio::sync::oneshot;
use tracing::debug;

use crate::error::RemoteError;
use crate::message::Value;

type Job = Box<dyn FnOnce() + Send>;

/// Pool of worker threads executing blocking jobs.
pub struct WorkerPool {
    sender: Mutex<Option<mpsc::Sender<Job>>>,
    name: String,
}

impl WorkerPool {
    /// Spawn `size` worker threads named `<name>-<n>`.
    ///
    /// # Errors
    /// Returns the spawn failure when a worker thread cannot be created.
    pub fn start(size: usize, name: &str) -> std::io::Result<Self> {
        let size = size.max(1);
        let (sender, receiver) = mpsc::channel::<Job>();
        let receiver = std::sync::Arc::new(Mutex::new(receiver));

        for index in 0..size {
            let receiver = std::sync::Arc::clone(&receiver);
            thread::Builder::new()
                .name(format!("{name}-{index}"))
                .spawn(move || {
                    loop {
                        let job = {
                            let guard = receiver.lock().unwrap_or_else(PoisonError::into_inner);
                            guard.recv()
                        };
                        match job {
                            Ok(job) => job(),
                            Err(_) => break,
                        }
                    }
                    debug!("worker thread exited");
                })?;
        }

        Ok(Self {
            sender: Mutex::new(Some(sender)),
            name: name.to_owned(),
        })
    }

    /// Submit a blocking job; the receiver resolves with its outcome.
    ///
    /// # Errors
    /// Returns [`RemoteError::SubmitTask`] when the pool has been shut down.
    pub fn submit<F>(
        &self,
        job: F,
    ) -> Result<oneshot::Receiver<anyhow::Result<Value>>, RemoteError>
    where
        F: FnOnce() -> anyhow::Result<Value> + Send + 'static,
    {
        let (done, outcome) = oneshot::channel();
        let wrapped: Job = Box::new(move || {
            let _ = done.send(job());
        });

        let guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        match guard.as_ref() {
            Some(sender) => sender
                .send(wrapped)
                .map_err(|_| RemoteError::SubmitTask(format!("{} pool stopped", self.name)))?,
            None => {
                return Err(RemoteError::SubmitTask(format!(
                    "{} pool stopped",
                    self.name
                )));
            }
        }
        Ok(outcome)
    }

    /// Stop accepting jobs; worker threads exit once the queue drains.
    pub fn shutdown(&self) {
        let mut guard = self.sender.lock().unwrap_or_else(PoisonError::into_inner);
        if guard.take().is_some() {
            debug!(pool = %self.name, "worker pool shut down");
        }
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) { self.shutdown(); }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[tokio::test]
    async fn submitted_jobs_deliver_their_outcome() {
        let pool = WorkerPool::start(2, "rpc-worker").expect("threads spawn");
        let outcome = pool
            .submit(|| Ok(json!(21 * 2)))
            .expect("submit")
            .await
            .expect("job ran")
            .expect("job succeeded");
        assert_eq!(outcome, json!(42));
    }

    #[tokio::test]
    async fn job_errors_come_back_to_the_caller() {
        let pool = WorkerPool::start(1, "rpc-worker").expect("threads spawn");
        let outcome = pool
            .submit(|| anyhow::bail!("boom"))
            .expect("submit")
            .await
            .expect("job ran");
        assert_eq!(outcome.expect_err("job failed").to_string(), "boom");
    }

    #[tokio::test]
    async fn shutdown_refuses_new_jobs() {
        let pool = WorkerPool::start(1, "rpc-worker").expect("threads spawn");
        pool.shutdown();
        pool.shutdown();
        assert!(matches!(
            pool.submit(|| Ok(Value::Null)),
            Err(RemoteError::SubmitTask(_))
        ));
    }
}
