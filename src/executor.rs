#![forbid(unsafe_code)]

//! Single-context executor that owns the network client.
//!
//! All network work runs on one dedicated thread driving a current-thread
//! Tokio runtime. Jobs arrive through a queue; each is spawned as a task on
//! that runtime, so many requests can be in flight but they interleave on
//! one thread of control. Callers get their result back through a oneshot
//! channel and must always say how long they are willing to wait.
//!
//! A caller that times out only stops waiting. The job keeps running on the
//! executor until it finishes on its own.

use std::{future::Future, sync::Arc, thread, time::Duration};

use futures::future::BoxFuture;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, error};

use crate::client::NetworkClient;
use crate::error::GatewayError;

type Job = Box<dyn FnOnce(Arc<dyn NetworkClient>) -> BoxFuture<'static, ()> + Send>;

#[derive(Clone)]
pub struct NetworkExecutor {
    jobs: mpsc::UnboundedSender<Job>,
}

impl NetworkExecutor {
    /// Starts the executor thread. It stops once every handle is dropped.
    pub fn spawn(client: Arc<dyn NetworkClient>) -> Result<Self, GatewayError> {
        let (tx, mut rx) = mpsc::unbounded_channel::<Job>();
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        thread::Builder::new()
            .name("network-executor".into())
            .spawn(move || {
                runtime.block_on(async move {
                    while let Some(job) = rx.recv().await {
                        tokio::spawn(job(client.clone()));
                    }
                    debug!("network executor queue closed");
                });
            })?;

        Ok(Self { jobs: tx })
    }

    /// Runs `job` on the executor and waits up to `wait` for its output.
    pub async fn submit<F, Fut, T>(&self, wait: Duration, job: F) -> Result<T, GatewayError>
    where
        F: FnOnce(Arc<dyn NetworkClient>) -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let boxed: Job = Box::new(move |client| {
            Box::pin(async move {
                // The caller may have given up already.
                let _ = tx.send(job(client).await);
            })
        });
        self.jobs
            .send(boxed)
            .map_err(|_| GatewayError::ExecutorStopped)?;

        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(_)) => Err(GatewayError::ExecutorStopped),
            Err(_) => Err(GatewayError::Timeout { duration: wait }),
        }
    }

    /// Starts a long-running task on the executor without waiting for it.
    pub fn spawn_background<F, Fut>(&self, name: &'static str, job: F) -> Result<(), GatewayError>
    where
        F: FnOnce(Arc<dyn NetworkClient>) -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Job = Box::new(move |client| {
            Box::pin(async move {
                debug!(task = name, "background task started");
                job(client).await;
                error!(task = name, "background task exited");
            })
        });
        self.jobs
            .send(boxed)
            .map_err(|_| GatewayError::ExecutorStopped)
    }
}
