//! Process-wide notification hub.
//!
//! A single task owns the notification list and the subscriber map; every
//! other party talks to it through commands. Subscribers get their own
//! bounded channel, and a subscriber that falls behind misses updates
//! instead of stalling the hub.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use tokio::sync::{mpsc, oneshot};
use tracing::{debug, warn};

/// Capacity of each subscriber channel.
pub const SUBSCRIBER_BUFFER: usize = 10;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
    pub text: String,
    pub date: DateTime<Utc>,
    pub active: bool,
}

enum Command {
    Add(String),
    Delete(String),
    Subscribe(oneshot::Sender<Option<(u64, mpsc::Receiver<Notification>)>>),
    Unsubscribe(u64),
    Snapshot(oneshot::Sender<Vec<Notification>>),
}

/// Handle to the hub task. Cheap to clone.
#[derive(Clone)]
pub struct NotificationHub {
    tx: mpsc::UnboundedSender<Command>,
}

impl NotificationHub {
    /// Spawn the hub task. Must be called inside a tokio runtime.
    pub fn new(max_subscribers: usize) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(run_hub(rx, max_subscribers));
        Self { tx }
    }

    /// Add a notification, or refresh the date of an existing one with the
    /// same text.
    pub fn add(&self, text: impl Into<String>) {
        self.send(Command::Add(text.into()));
    }

    /// Retire a notification. Subscribers see it once more as inactive.
    pub fn delete(&self, text: impl Into<String>) {
        self.send(Command::Delete(text.into()));
    }

    /// Current notifications, oldest first.
    pub async fn notifications(&self) -> Vec<Notification> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Snapshot(tx));
        rx.await.unwrap_or_default()
    }

    /// Register a new listener. `None` when the subscriber limit is reached
    /// or the hub is gone.
    pub async fn subscribe(&self) -> Option<Subscription> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Subscribe(tx));
        let (id, rx) = rx.await.ok().flatten()?;
        Some(Subscription {
            id,
            rx,
            hub: self.tx.clone(),
        })
    }

    fn send(&self, cmd: Command) {
        if self.tx.send(cmd).is_err() {
            warn!("Notification hub is not running");
        }
    }
}

/// A live feed of notifications. Dropping it unsubscribes.
pub struct Subscription {
    id: u64,
    rx: mpsc::Receiver<Notification>,
    hub: mpsc::UnboundedSender<Command>,
}

impl Subscription {
    pub async fn recv(&mut self) -> Option<Notification> {
        self.rx.recv().await
    }

    pub fn unsubscribe(self) {}
}

impl Drop for Subscription {
    fn drop(&mut self) {
        let _ = self.hub.send(Command::Unsubscribe(self.id));
    }
}

fn broadcast(subscribers: &HashMap<u64, mpsc::Sender<Notification>>, n: &Notification) {
    for (id, sub) in subscribers {
        if sub.try_send(n.clone()).is_err() {
            debug!("Dropping notification for slow subscriber {}", id);
        }
    }
}

async fn run_hub(mut rx: mpsc::UnboundedReceiver<Command>, max_subscribers: usize) {
    let mut notifications: Vec<Notification> = Vec::new();
    let mut subscribers: HashMap<u64, mpsc::Sender<Notification>> = HashMap::new();
    let mut next_id: u64 = 0;

    while let Some(cmd) = rx.recv().await {
        match cmd {
            Command::Add(text) => {
                let now = Utc::now();
                let n = match notifications.iter_mut().find(|n| n.text == text) {
                    Some(existing) => {
                        existing.date = now;
                        existing.clone()
                    }
                    None => {
                        let n = Notification {
                            text,
                            date: now,
                            active: true,
                        };
                        notifications.push(n.clone());
                        n
                    }
                };
                broadcast(&subscribers, &n);
            }
            Command::Delete(text) => {
                let before = notifications.len();
                notifications.retain(|n| n.text != text);
                if notifications.len() != before {
                    let n = Notification {
                        text,
                        date: Utc::now(),
                        active: false,
                    };
                    broadcast(&subscribers, &n);
                }
            }
            Command::Subscribe(reply) => {
                if subscribers.len() >= max_subscribers {
                    let _ = reply.send(None);
                    continue;
                }
                let (tx, sub_rx) = mpsc::channel(SUBSCRIBER_BUFFER);
                for n in &notifications {
                    if tx.try_send(n.clone()).is_err() {
                        break;
                    }
                }
                let id = next_id;
                next_id += 1;
                if reply.send(Some((id, sub_rx))).is_ok() {
                    subscribers.insert(id, tx);
                    debug!("Notification subscriber {} registered", id);
                }
            }
            Command::Unsubscribe(id) => {
                subscribers.remove(&id);
                debug!("Notification subscriber {} removed", id);
            }
            Command::Snapshot(reply) => {
                let _ = reply.send(notifications.clone());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_test::{assert_pending, task};

    #[tokio::test]
    async fn test_add_update_delete() {
        let hub = NotificationHub::new(4);
        hub.add("config reload failed");
        hub.add("config reload failed");
        hub.add("disk almost full");

        let list = hub.notifications().await;
        assert_eq!(list.len(), 2);
        assert_eq!(list[0].text, "config reload failed");

        hub.delete("config reload failed");
        let list = hub.notifications().await;
        assert_eq!(list.len(), 1);
        assert_eq!(list[0].text, "disk almost full");
    }

    #[tokio::test]
    async fn test_subscriber_gets_current_then_live() {
        let hub = NotificationHub::new(4);
        hub.add("first");

        let mut sub = hub.subscribe().await.unwrap();
        assert_eq!(sub.recv().await.unwrap().text, "first");

        hub.delete("first");
        let n = sub.recv().await.unwrap();
        assert_eq!(n.text, "first");
        assert!(!n.active);
    }

    #[tokio::test]
    async fn test_idle_subscription_is_pending() {
        let hub = NotificationHub::new(4);
        let mut sub = hub.subscribe().await.unwrap();
        let mut recv = task::spawn(sub.recv());
        assert_pending!(recv.poll());
    }

    #[tokio::test]
    async fn test_subscriber_limit() {
        let hub = NotificationHub::new(1);
        let sub = hub.subscribe().await.unwrap();
        assert!(hub.subscribe().await.is_none());

        sub.unsubscribe();
        // Commands are handled in order, so the slot is free by now.
        assert!(hub.subscribe().await.is_some());
    }

    #[tokio::test]
    async fn test_slow_subscriber_drops() {
        let hub = NotificationHub::new(4);
        let mut sub = hub.subscribe().await.unwrap();
        for i in 0..(SUBSCRIBER_BUFFER + 5) {
            hub.add(format!("n{}", i));
        }
        // Make sure the hub processed every add.
        assert_eq!(hub.notifications().await.len(), SUBSCRIBER_BUFFER + 5);

        let mut received = 0;
        while let Ok(Some(_)) =
            tokio::time::timeout(std::time::Duration::from_millis(20), sub.recv()).await
        {
            received += 1;
        }
        assert_eq!(received, SUBSCRIBER_BUFFER);
    }
}
