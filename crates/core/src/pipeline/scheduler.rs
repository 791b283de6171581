//! Delayed task queue feeding the engine loop.

use std::time::Duration;

use tokio::sync::mpsc;

/// Sends tasks to a single consumer, now or after a delay.
///
/// Delayed sends sleep on their own spawned task, so a pending delay never
/// blocks the consumer.
pub struct Scheduler<T> {
    tx: mpsc::UnboundedSender<T>,
}

impl<T> Clone for Scheduler<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

impl<T: Send + 'static> Scheduler<T> {
    pub fn new() -> (Self, mpsc::UnboundedReceiver<T>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx }, rx)
    }

    pub fn now(&self, task: T) {
        if self.tx.send(task).is_err() {
            tracing::debug!("Scheduler receiver dropped, task discarded");
        }
    }

    pub fn after(&self, delay: Duration, task: T) {
        let tx = self.tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = tx.send(task);
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_now_is_delivered_in_order() {
        let (scheduler, mut rx) = Scheduler::new();
        scheduler.now(1);
        scheduler.now(2);
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn test_after_waits_for_delay() {
        let (scheduler, mut rx) = Scheduler::new();
        scheduler.after(Duration::from_millis(50), "late");
        scheduler.now("early");

        assert_eq!(rx.recv().await, Some("early"));
        assert!(rx.try_recv().is_err());

        let late = tokio::time::timeout(Duration::from_secs(2), rx.recv())
            .await
            .unwrap();
        assert_eq!(late, Some("late"));
    }
}
