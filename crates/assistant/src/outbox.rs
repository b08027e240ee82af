//! Ready-gated delivery of UI events.
//!
//! Events produced before the presentation layer is up are queued in arrival
//! order and flushed once, under the same lock that later pushes take, so nothing
//! can overtake the backlog.

use parking_lot::Mutex;
use shared::UiEvent;
use std::collections::VecDeque;
use thiserror::Error;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("UI outbox is full ({capacity} events waiting)")]
pub struct OutboxFull {
    pub capacity: usize,
}

pub struct Outbox {
    inner: Mutex<Inner>,
    capacity: usize,
}

struct Inner {
    queue: VecDeque<UiEvent>,
    sink: Option<UnboundedSender<UiEvent>>,
}

impl Outbox {
    pub fn new(capacity: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                queue: VecDeque::new(),
                sink: None,
            }),
            capacity: capacity.max(1),
        }
    }

    /// Send now if the consumer is ready, queue otherwise
    pub fn push(&self, event: UiEvent) -> Result<(), OutboxFull> {
        let mut inner = self.inner.lock();
        let event = match inner.sink.as_ref() {
            Some(sink) => match sink.send(event) {
                Ok(()) => return Ok(()),
                Err(returned) => {
                    debug!("UI consumer went away, queueing until it is ready again");
                    inner.sink = None;
                    returned.0
                }
            },
            None => event,
        };
        if inner.queue.len() >= self.capacity {
            return Err(OutboxFull {
                capacity: self.capacity,
            });
        }
        inner.queue.push_back(event);
        Ok(())
    }

    /// [`push`](Self::push), logging a rejection instead of returning it
    pub fn publish(&self, event: UiEvent) {
        if let Err(e) = self.push(event) {
            warn!("{}", e);
        }
    }

    /// Attach the consumer and flush the backlog to it in order. Returns how many
    /// queued events were delivered.
    pub fn mark_ready(&self, sink: UnboundedSender<UiEvent>) -> usize {
        let mut inner = self.inner.lock();
        let mut flushed = 0;
        while let Some(event) = inner.queue.pop_front() {
            if let Err(returned) = sink.send(event) {
                inner.queue.push_front(returned.0);
                warn!("UI consumer closed during flush, {} events kept", inner.queue.len());
                return flushed;
            }
            flushed += 1;
        }
        inner.sink = Some(sink);
        debug!(flushed, "UI outbox ready");
        flushed
    }

    pub fn is_ready(&self) -> bool {
        self.inner.lock().sink.is_some()
    }

    /// Events waiting for the consumer
    pub fn pending(&self) -> usize {
        self.inner.lock().queue.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn warning(n: usize) -> UiEvent {
        UiEvent::Warning {
            message: n.to_string(),
        }
    }

    fn drain(rx: &mut mpsc::UnboundedReceiver<UiEvent>) -> Vec<UiEvent> {
        let mut out = Vec::new();
        while let Ok(event) = rx.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_queued_then_flushed_once_in_order() {
        let outbox = Outbox::new(8);
        outbox.push(warning(1)).unwrap();
        outbox.push(warning(2)).unwrap();
        assert!(!outbox.is_ready());
        assert_eq!(outbox.pending(), 2);

        let (tx, mut rx) = mpsc::unbounded_channel();
        assert_eq!(outbox.mark_ready(tx), 2);
        outbox.push(warning(3)).unwrap();

        assert_eq!(drain(&mut rx), vec![warning(1), warning(2), warning(3)]);
        assert_eq!(outbox.pending(), 0);
    }

    #[test]
    fn test_full_queue_rejects_instead_of_dropping() {
        let outbox = Outbox::new(2);
        outbox.push(warning(1)).unwrap();
        outbox.push(warning(2)).unwrap();
        assert_eq!(outbox.push(warning(3)), Err(OutboxFull { capacity: 2 }));

        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.mark_ready(tx);
        assert_eq!(drain(&mut rx), vec![warning(1), warning(2)]);
    }

    #[test]
    fn test_closed_consumer_falls_back_to_queue() {
        let outbox = Outbox::new(4);
        let (tx, rx) = mpsc::unbounded_channel();
        outbox.mark_ready(tx);
        drop(rx);

        outbox.push(warning(1)).unwrap();
        assert!(!outbox.is_ready());
        assert_eq!(outbox.pending(), 1);

        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.mark_ready(tx);
        assert_eq!(drain(&mut rx), vec![warning(1)]);
    }

    #[tokio::test]
    async fn test_concurrent_pushes_never_overtake_backlog() {
        let outbox = Arc::new(Outbox::new(10_000));
        for i in 0..100 {
            outbox.push(warning(i)).unwrap();
        }

        let producer = {
            let outbox = outbox.clone();
            tokio::spawn(async move {
                for i in 100..200 {
                    outbox.push(warning(i)).unwrap();
                    tokio::task::yield_now().await;
                }
            })
        };
        let (tx, mut rx) = mpsc::unbounded_channel();
        outbox.mark_ready(tx);
        producer.await.unwrap();

        let received = drain(&mut rx);
        assert_eq!(received, (0..200).map(warning).collect::<Vec<_>>());
    }
}
