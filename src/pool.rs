use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use tokio::sync::{Mutex, Semaphore};

/// Default size of a pooled copy buffer
pub const DEFAULT_BUFFER_SIZE: usize = 32 * 1024;

const MAX_POOL_SIZE: usize = 100;

/// BufferPool hands out reusable copy buffers of a fixed size
pub struct BufferPool {
    size: usize,
    buffers: Mutex<Vec<Vec<u8>>>,
}

impl BufferPool {
    pub fn new(size: usize) -> Self {
        Self {
            size,
            buffers: Mutex::new(Vec::with_capacity(MAX_POOL_SIZE)),
        }
    }

    pub fn buffer_size(&self) -> usize {
        self.size
    }

    /// get takes a buffer from the pool or allocates a new one
    pub async fn get(&self) -> Vec<u8> {
        match self.buffers.lock().await.pop() {
            Some(buffer) => buffer,
            None => vec![0u8; self.size],
        }
    }

    /// put returns a buffer for reuse. Buffers of the wrong size are dropped.
    pub async fn put(&self, mut buffer: Vec<u8>) {
        if buffer.capacity() < self.size || buffer.capacity() > self.size * 2 {
            return;
        }
        buffer.resize(self.size, 0);

        let mut pool = self.buffers.lock().await;
        if pool.len() < MAX_POOL_SIZE {
            pool.push(buffer);
        }
    }

    pub async fn available(&self) -> usize {
        self.buffers.lock().await.len()
    }
}

impl Default for BufferPool {
    fn default() -> Self {
        Self::new(DEFAULT_BUFFER_SIZE)
    }
}

/// Task is a unit of work submitted to a TaskPool
pub type Task = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// TaskPool runs connection tasks. A pool that cannot take a task hands
/// it back so the caller can run it some other way.
pub trait TaskPool: Send + Sync {
    fn submit(&self, task: Task) -> Result<(), Task>;
}

/// BoundedPool runs at most `max_tasks` tasks at a time and rejects
/// submissions beyond that
pub struct BoundedPool {
    permits: Arc<Semaphore>,
}

impl BoundedPool {
    pub fn new(max_tasks: usize) -> Self {
        Self {
            permits: Arc::new(Semaphore::new(max_tasks)),
        }
    }

    /// available is the number of tasks that can still be submitted
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }
}

impl TaskPool for BoundedPool {
    fn submit(&self, task: Task) -> Result<(), Task> {
        match self.permits.clone().try_acquire_owned() {
            Ok(permit) => {
                tokio::spawn(async move {
                    task.await;
                    drop(permit);
                });
                Ok(())
            }
            Err(_) => Err(task),
        }
    }
}

/// spawn_task submits the task to the pool and spawns it directly when
/// there is no pool or the pool rejects it. The task always runs.
pub fn spawn_task(pool: Option<&dyn TaskPool>, task: Task) {
    let task = match pool {
        Some(pool) => match pool.submit(task) {
            Ok(()) => return,
            Err(task) => task,
        },
        None => task,
    };
    tokio::spawn(task);
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::{mpsc, oneshot};

    #[tokio::test]
    async fn buffers_are_reused() {
        let pool = BufferPool::new(1024);
        let buffer = pool.get().await;
        assert_eq!(buffer.len(), 1024);

        pool.put(buffer).await;
        assert_eq!(pool.available().await, 1);

        let _buffer = pool.get().await;
        assert_eq!(pool.available().await, 0);
    }

    #[tokio::test]
    async fn foreign_buffers_are_dropped() {
        let pool = BufferPool::new(1024);
        pool.put(vec![0u8; 16]).await;
        assert_eq!(pool.available().await, 0);
    }

    #[tokio::test]
    async fn bounded_pool_hands_back_when_full() {
        let pool = BoundedPool::new(1);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let first: Task = Box::pin(async move {
            let _ = release_rx.await;
        });
        assert!(pool.submit(first).is_ok());
        assert_eq!(pool.available(), 0);

        let second: Task = Box::pin(async {});
        assert!(pool.submit(second).is_err());

        release_tx.send(()).unwrap();
    }

    #[tokio::test]
    async fn rejected_tasks_still_run() {
        let pool = BoundedPool::new(1);
        let (done_tx, mut done_rx) = mpsc::channel(2);
        let (release_tx, release_rx) = oneshot::channel::<()>();

        let tx = done_tx.clone();
        spawn_task(
            Some(&pool),
            Box::pin(async move {
                let _ = release_rx.await;
                let _ = tx.send("pooled").await;
            }),
        );
        spawn_task(
            Some(&pool),
            Box::pin(async move {
                let _ = done_tx.send("fallback").await;
            }),
        );

        assert_eq!(done_rx.recv().await, Some("fallback"));
        release_tx.send(()).unwrap();
        assert_eq!(done_rx.recv().await, Some("pooled"));
    }

    #[tokio::test]
    async fn spawns_without_pool() {
        let (tx, rx) = oneshot::channel();
        spawn_task(
            None,
            Box::pin(async move {
                let _ = tx.send(42);
            }),
        );
        assert_eq!(rx.await.unwrap(), 42);
    }
}
