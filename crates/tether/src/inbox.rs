//! Holding area for inbound data messages awaiting the workload.

use std::sync::{Mutex, MutexGuard};

use crate::bridge::protocol::Message;

/// Thread-safe FIFO with drain-and-clear reads.
///
/// A drain returns the whole current content and empties the inbox under a
/// single lock acquisition, so two readers can never split one batch.
#[derive(Debug, Default)]
pub struct Inbox {
    messages: Mutex<Vec<Message>>,
}

impl Inbox {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, message: Message) {
        self.lock().push(message);
    }

    /// Take everything queued so far, in arrival order.
    pub fn drain(&self) -> Vec<Message> {
        std::mem::take(&mut *self.lock())
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    fn lock(&self) -> MutexGuard<'_, Vec<Message>> {
        match self.messages.lock() {
            Ok(guard) => guard,
            Err(poisoned) => {
                tracing::error!("Inbox mutex poisoned - recovering queued messages");
                poisoned.into_inner()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::protocol::MessageType;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn data(n: u64) -> Message {
        Message::new(MessageType::Data, json!(n))
    }

    #[test]
    fn drain_returns_in_order_and_clears() {
        let inbox = Inbox::new();
        inbox.push(data(1));
        inbox.push(data(2));
        assert_eq!(inbox.len(), 2);

        let drained: Vec<_> = inbox.drain().into_iter().map(Message::into_payload).collect();
        assert_eq!(drained, vec![json!(1), json!(2)]);
        assert!(inbox.is_empty());
        assert!(inbox.drain().is_empty());
    }

    #[test]
    fn concurrent_producers_never_lose_or_duplicate() {
        const PRODUCERS: u64 = 4;
        const PER_PRODUCER: u64 = 2_000;

        let inbox = Arc::new(Inbox::new());
        let done = Arc::new(AtomicBool::new(false));

        let consumer = {
            let inbox = Arc::clone(&inbox);
            let done = Arc::clone(&done);
            std::thread::spawn(move || {
                let mut seen = Vec::new();
                loop {
                    let finished = done.load(Ordering::SeqCst);
                    seen.extend(inbox.drain().into_iter().map(Message::into_payload));
                    if finished {
                        // One more drain after producers stopped picks up stragglers.
                        seen.extend(inbox.drain().into_iter().map(Message::into_payload));
                        break;
                    }
                    std::thread::yield_now();
                }
                seen
            })
        };

        let producers: Vec<_> = (0..PRODUCERS)
            .map(|p| {
                let inbox = Arc::clone(&inbox);
                std::thread::spawn(move || {
                    for i in 0..PER_PRODUCER {
                        inbox.push(data(p * PER_PRODUCER + i));
                    }
                })
            })
            .collect();

        for producer in producers {
            producer.join().unwrap();
        }
        done.store(true, Ordering::SeqCst);
        let seen = consumer.join().unwrap();

        assert_eq!(seen.len() as u64, PRODUCERS * PER_PRODUCER);
        let unique: HashSet<u64> = seen.iter().map(|v| v.as_u64().unwrap()).collect();
        assert_eq!(unique.len() as u64, PRODUCERS * PER_PRODUCER);
    }

    #[test]
    fn per_producer_order_is_preserved_across_drains() {
        let inbox = Arc::new(Inbox::new());
        let producer = {
            let inbox = Arc::clone(&inbox);
            std::thread::spawn(move || {
                for i in 0..5_000 {
                    inbox.push(data(i));
                }
            })
        };

        let mut seen = Vec::new();
        while seen.len() < 5_000 {
            seen.extend(inbox.drain().into_iter().map(|m| m.into_payload().as_u64().unwrap()));
        }
        producer.join().unwrap();

        assert!(seen.windows(2).all(|w| w[0] < w[1]));
    }
}
