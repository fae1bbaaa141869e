use crate::alarm_event::AlarmEvent;
use log::debug;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::mpsc::{self, Receiver, Sender};
use tokio_util::sync::CancellationToken;

pub type EventHandler = Box<dyn FnMut(&AlarmEvent) + Send>;

/// Returned when subscribing, used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionHandle(u64);

#[derive(Clone)]
enum Sink {
    // Called on the poll task, a slow handler delays polling
    Callback(Arc<Mutex<EventHandler>>),
    // Bounded queue, a full queue holds back polling until there is room
    Queue(Sender<AlarmEvent>),
}

#[derive(Clone)]
struct Subscriber {
    handle: SubscriptionHandle,
    sink: Sink,
}

fn call(handler: &Mutex<EventHandler>, event: &AlarmEvent) {
    let mut handler = handler.lock().unwrap_or_else(PoisonError::into_inner);
    handler(event);
}

pub struct SubscriberList {
    next_id: AtomicU64,
    subscribers: Mutex<Vec<Subscriber>>,
}

impl SubscriberList {
    pub fn new() -> SubscriberList {
        SubscriberList {
            next_id: AtomicU64::new(1),
            subscribers: Mutex::new(Vec::new()),
        }
    }

    fn add(&self, sink: Sink) -> SubscriptionHandle {
        let handle = SubscriptionHandle(self.next_id.fetch_add(1, Ordering::Relaxed));
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        subscribers.push(Subscriber { handle, sink });
        handle
    }

    pub fn add_callback<F>(&self, handler: F) -> SubscriptionHandle
    where
        F: FnMut(&AlarmEvent) + Send + 'static,
    {
        self.add(Sink::Callback(Arc::new(Mutex::new(Box::new(handler)))))
    }

    /// Subscribe through a bounded queue. Dropping the receiver ends the subscription.
    pub fn add_queue(&self, capacity: usize) -> (SubscriptionHandle, Receiver<AlarmEvent>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (self.add(Sink::Queue(tx)), rx)
    }

    pub fn remove(&self, handle: SubscriptionHandle) -> bool {
        let mut subscribers = self.subscribers.lock().unwrap_or_else(PoisonError::into_inner);
        let before = subscribers.len();
        subscribers.retain(|s| s.handle != handle);
        subscribers.len() != before
    }

    pub fn len(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Deliver the events, in order, to every current subscriber.
    ///
    /// Waiting for room in a full queue stops when `cancel` fires. Returns
    /// false if delivery was cut short that way.
    pub async fn publish(&self, events: &[AlarmEvent], cancel: &CancellationToken) -> bool {
        if events.is_empty() {
            return true;
        }
        // Snapshot so handlers may (un)subscribe without deadlocking
        let subscribers: Vec<Subscriber> = self
            .subscribers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        let mut closed = Vec::new();
        let mut delivered = true;
        'events: for event in events {
            for subscriber in &subscribers {
                if closed.contains(&subscriber.handle) {
                    continue;
                }
                match &subscriber.sink {
                    Sink::Callback(handler) => call(handler, event),
                    Sink::Queue(tx) => {
                        let sent = tokio::select! {
                            biased;
                            _ = cancel.cancelled() => {
                                delivered = false;
                                break 'events;
                            }
                            sent = tx.send(event.clone()) => sent
                        };
                        if sent.is_err() {
                            closed.push(subscriber.handle);
                        }
                    }
                }
            }
        }
        for handle in closed {
            debug!("Dropped subscription {:?}", handle);
            self.remove(handle);
        }
        delivered
    }
}

impl Default for SubscriberList {
    fn default() -> SubscriberList {
        SubscriberList::new()
    }
}

#[cfg(test)]
fn cleared(index: usize) -> AlarmEvent {
    AlarmEvent::Cleared {
        index,
        space: crate::alarm_event::IndexSpace::Bit,
        timestamp: chrono::Utc::now(),
    }
}

#[tokio::test]
async fn test_publish_order() {
    let list = SubscriberList::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen1 = seen.clone();
    list.add_callback(move |e| seen1.lock().unwrap().push((1, e.index())));
    let seen2 = seen.clone();
    list.add_callback(move |e| seen2.lock().unwrap().push((2, e.index())));
    assert!(list.publish(&[cleared(3), cleared(4)], &CancellationToken::new()).await);
    assert_eq!(
        *seen.lock().unwrap(),
        vec![(1, 3), (2, 3), (1, 4), (2, 4)]
    );
}

#[tokio::test]
async fn test_unsubscribe() {
    let list = SubscriberList::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let seen1 = seen.clone();
    let handle = list.add_callback(move |e| seen1.lock().unwrap().push(e.index()));
    list.publish(&[cleared(1)], &CancellationToken::new()).await;
    assert!(list.remove(handle));
    assert!(!list.remove(handle));
    list.publish(&[cleared(2)], &CancellationToken::new()).await;
    assert_eq!(*seen.lock().unwrap(), vec![1]);
}

#[tokio::test]
async fn test_queue_subscriber() {
    let list = SubscriberList::new();
    let (_handle, mut rx) = list.add_queue(4);
    list.publish(&[cleared(5), cleared(6)], &CancellationToken::new()).await;
    assert_eq!(rx.recv().await.map(|e| e.index()), Some(5));
    assert_eq!(rx.recv().await.map(|e| e.index()), Some(6));
    drop(rx);
    list.publish(&[cleared(7)], &CancellationToken::new()).await;
    assert!(list.is_empty());
}

#[tokio::test]
async fn test_cancel_full_queue() {
    let list = SubscriberList::new();
    let (_handle, mut rx) = list.add_queue(1);
    let cancel = CancellationToken::new();
    let stop = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        stop.cancel();
    });
    // Nobody reads, the second event can't be queued
    let delivered = tokio::time::timeout(
        std::time::Duration::from_secs(1),
        list.publish(&[cleared(1), cleared(2)], &cancel),
    )
    .await;
    assert_eq!(delivered, Ok(false));
    assert_eq!(rx.recv().await.map(|e| e.index()), Some(1));
    assert_eq!(list.len(), 1);
}
