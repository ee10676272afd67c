use ess_lib::{EssEvent, MessagingSender};
use log::{debug, error, info, warn};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use tokio::task::JoinHandle;

pub const DEFAULT_EVENT_QUEUE_SIZE: usize = 1000;

/// Bounded, best-effort event delivery. A background task drains the queue into the
/// sender; events that do not fit, or that the sender rejects, are logged and dropped.
pub struct EventQueue {
    tx: Mutex<Option<mpsc::Sender<EssEvent>>>,
    drain: AsyncMutex<Option<JoinHandle<()>>>,
}

impl EventQueue {
    /// Must be called inside a tokio runtime.
    pub fn start(sender: Arc<dyn MessagingSender>, capacity: usize) -> Self {
        let (tx, mut rx) = mpsc::channel::<EssEvent>(capacity.max(1));
        let drain = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                match sender.send(&event).await {
                    Ok(()) => debug!("event sent: type={}", event.event_type),
                    Err(e) => warn!(
                        "event dropped, send failed: type={}, err={}",
                        event.event_type, e
                    ),
                }
            }
            debug!("event queue drained");
        });
        Self {
            tx: Mutex::new(Some(tx)),
            drain: AsyncMutex::new(Some(drain)),
        }
    }

    pub fn publish(&self, event: EssEvent) {
        let guard = match self.tx.lock() {
            Ok(guard) => guard,
            Err(e) => {
                error!("event queue lock poisoned: {}", e);
                return;
            }
        };
        let Some(tx) = guard.as_ref() else {
            warn!("event dropped, queue closed: type={}", event.event_type);
            return;
        };
        match tx.try_send(event) {
            Ok(()) => {}
            Err(TrySendError::Full(event)) => {
                warn!("event dropped, queue full: type={}", event.event_type)
            }
            Err(TrySendError::Closed(event)) => {
                warn!("event dropped, queue closed: type={}", event.event_type)
            }
        }
    }

    /// Closes the queue and waits up to `timeout` for queued events to go out.
    pub async fn shutdown(&self, timeout: Duration) {
        match self.tx.lock() {
            Ok(mut guard) => {
                guard.take();
            }
            Err(e) => error!("event queue lock poisoned: {}", e),
        }
        let Some(drain) = self.drain.lock().await.take() else {
            return;
        };
        match tokio::time::timeout(timeout, drain).await {
            Ok(_) => info!("event queue closed"),
            Err(_) => warn!("event queue not drained within {:?}", timeout),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use ess_lib::{Content, EssError, EssResult, EventType};
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct RecordingSender {
        seen: Mutex<Vec<EssEvent>>,
        calls: AtomicUsize,
        fail_first: bool,
    }

    #[async_trait]
    impl MessagingSender for RecordingSender {
        async fn send(&self, event: &EssEvent) -> EssResult<()> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail_first && call == 0 {
                return Err(EssError::ConnectionError("bus down".to_string()));
            }
            self.seen.lock().unwrap().push(event.clone());
            Ok(())
        }
    }

    fn event(name: &str) -> EssEvent {
        EssEvent::file_available(&Content {
            scope: "s".to_string(),
            name: name.to_string(),
            ..Default::default()
        })
    }

    #[tokio::test]
    async fn test_events_delivered_in_order() {
        let sender = Arc::new(RecordingSender::default());
        let queue = EventQueue::start(sender.clone(), 10);
        for name in ["f1", "f2", "f3"] {
            queue.publish(event(name));
        }
        queue.shutdown(Duration::from_secs(5)).await;

        let seen = sender.seen.lock().unwrap();
        let names = seen
            .iter()
            .map(|e| e.payload["name"].as_str().unwrap_or_default().to_string())
            .collect::<Vec<_>>();
        assert_eq!(names, vec!["f1", "f2", "f3"]);
        assert!(seen.iter().all(|e| e.event_type == EventType::FileAvailable));
    }

    #[tokio::test]
    async fn test_failed_send_does_not_stop_delivery() {
        let sender = Arc::new(RecordingSender {
            fail_first: true,
            ..Default::default()
        });
        let queue = EventQueue::start(sender.clone(), 10);
        queue.publish(event("f1"));
        queue.publish(event("f2"));
        queue.shutdown(Duration::from_secs(5)).await;

        assert_eq!(sender.calls.load(Ordering::SeqCst), 2);
        assert_eq!(sender.seen.lock().unwrap().len(), 1);

        // Closed queues drop quietly.
        queue.publish(event("f3"));
        assert_eq!(sender.calls.load(Ordering::SeqCst), 2);
    }
}
