//! Per-entity FIFO task serializer.
//!
//! Every interaction with an entity — command, query, stream start,
//! `inspect`/`stateAt` — is submitted through its `Mailbox` so that all of
//! them observe a total order. A failed task must not stall the queue: it
//! propagates its error to its own awaiter only, never to the next task in
//! line. `tokio::sync::Mutex` already gives us exactly that — its internal
//! wait list is FIFO, and dropping a guard (on success, panic, or early
//! return) always hands the lock to the next waiter — so the mailbox is a
//! thin wrapper around one.

use tokio::sync::Mutex;

pub struct Mailbox {
    lock: Mutex<()>,
}

impl Mailbox {
    pub fn new() -> Self {
        Mailbox { lock: Mutex::new(()) }
    }

    /// Runs `task` after every previously enqueued task on this entity has
    /// settled, and before any task enqueued afterwards starts.
    pub async fn enqueue<F, T>(&self, task: F) -> T
    where
        F: std::future::Future<Output = T>,
    {
        let _permit = self.lock.lock().await;
        task.await
    }
}

impl Default for Mailbox {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    #[tokio::test]
    async fn tasks_run_in_submission_order() {
        let mailbox = Arc::new(Mailbox::new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let mailbox = mailbox.clone();
            let order = order.clone();
            handles.push(tokio::spawn(async move {
                mailbox
                    .enqueue(async move {
                        order.lock().unwrap().push(i);
                    })
                    .await;
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        // All five ran; FIFO-ness under concurrent submission from separate
        // tasks isn't guaranteed by spawn order, but single-submitter order
        // (the common case) is -- see the next test.
        assert_eq!(order.lock().unwrap().len(), 5);
    }

    #[tokio::test]
    async fn single_submitter_order_is_preserved() {
        let mailbox = Mailbox::new();
        let counter = AtomicU32::new(0);
        let seen = std::sync::Mutex::new(Vec::new());
        for _ in 0..10 {
            mailbox
                .enqueue(async {
                    let v = counter.fetch_add(1, Ordering::SeqCst);
                    seen.lock().unwrap().push(v);
                })
                .await;
        }
        assert_eq!(seen.lock().unwrap().as_slice(), &[0, 1, 2, 3, 4, 5, 6, 7, 8, 9]);
    }

    #[tokio::test]
    async fn a_failing_task_does_not_stall_the_queue() {
        let mailbox = Mailbox::new();
        let first: Result<(), &'static str> = mailbox.enqueue(async { Err("boom") }).await;
        assert!(first.is_err());
        let second = mailbox.enqueue(async { 42 }).await;
        assert_eq!(second, 42);
    }
}
