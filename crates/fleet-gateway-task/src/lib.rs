use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;

#[derive(Debug)]
pub struct ShutdownHandle(tokio::sync::watch::Sender<()>);

impl ShutdownHandle {
    pub fn new() -> (Self, ShutdownSignal) {
        let (sender, receiver) = tokio::sync::watch::channel(());
        (Self(sender), ShutdownSignal(receiver))
    }

    pub fn signal(&self) {
        let _ = self.0.send(());
    }

    /// Resolves once every `ShutdownSignal` clone has been dropped.
    pub async fn all_closed(&self) {
        self.0.closed().await;
    }

    /// Signals shutdown and waits for all signal clones to be dropped, up
    /// to `grace_period`. Returns false when some task held on.
    pub async fn shutdown(&self, grace_period: Duration) -> bool {
        self.signal();

        tokio::select! {
            () = self.all_closed() => true,
            () = tokio::time::sleep(grace_period) => false,
        }
    }
}

#[derive(Clone, Debug)]
pub struct ShutdownSignal(tokio::sync::watch::Receiver<()>);

impl ShutdownSignal {
    pub async fn wait(&mut self) {
        let _ = self.0.changed().await;
    }
}

/// Aborts the running task when dropped.
///
/// See https://github.com/tokio-rs/tokio/issues/1830 for some background.
#[must_use]
pub struct ChildTask<T>(JoinHandle<T>);

impl<T> ChildTask<T> {
    pub fn spawn<F>(future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        ChildTask(tokio::task::spawn(future))
    }

    pub async fn join(mut self) -> Result<T, tokio::task::JoinError> {
        (&mut self.0).await
    }

    /// Immediately abort the task.
    pub fn abort(&self) {
        self.0.abort();
    }

    /// Drop without aborting the task.
    pub fn detach(self) {
        core::mem::forget(self);
    }
}

impl<T> From<JoinHandle<T>> for ChildTask<T> {
    fn from(value: JoinHandle<T>) -> Self {
        Self(value)
    }
}

impl<T> Drop for ChildTask<T> {
    fn drop(&mut self) {
        self.abort();
    }
}

/// A long-running unit of work owned by the service composition root.
///
/// Tasks are never started on module import; the composition root spawns
/// each one explicitly and every task must terminate promptly once its
/// shutdown signal fires.
#[async_trait]
pub trait Task {
    type Output: Send;

    const NAME: &'static str;

    async fn run(self, shutdown_signal: ShutdownSignal) -> Self::Output;
}

pub fn spawn_task<T>(task: T, shutdown_signal: ShutdownSignal) -> ChildTask<T::Output>
where
    T: Task + 'static,
{
    ChildTask::spawn(task.run(shutdown_signal))
}

/// Registry for the service's long-running tasks.
///
/// Owns the `ShutdownHandle`; tasks registered here all observe the same
/// shutdown signal and are joined together when the service stops.
pub struct TaskCluster {
    tasks: Vec<ChildTask<anyhow::Result<()>>>,
    shutdown_handle: ShutdownHandle,
    shutdown_signal: ShutdownSignal,
}

impl TaskCluster {
    pub fn new() -> Self {
        let (shutdown_handle, shutdown_signal) = ShutdownHandle::new();

        Self {
            tasks: Vec::new(),
            shutdown_handle,
            shutdown_signal,
        }
    }

    pub fn shutdown_signal(&self) -> ShutdownSignal {
        self.shutdown_signal.clone()
    }

    pub fn register<T>(&mut self, task: T)
    where
        T: Task<Output = anyhow::Result<()>> + 'static,
    {
        let child = spawn_task(task, self.shutdown_signal.clone());
        self.tasks.push(child);
    }

    /// Splits into the shutdown handle and the spawned children.
    pub fn into_parts(self) -> (ShutdownHandle, Vec<ChildTask<anyhow::Result<()>>>) {
        (self.shutdown_handle, self.tasks)
    }
}

impl Default for TaskCluster {
    fn default() -> Self {
        Self::new()
    }
}
