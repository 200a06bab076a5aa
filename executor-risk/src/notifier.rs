use async_trait::async_trait;
use derive_more::{Constructor, Display};
use futures::future::join_all;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Severity of a [`Notification`], used by [`NotifierHub`] to filter sinks
/// below the configured minimum level (`spec.md` §4.8).
#[derive(
    Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Deserialize, Serialize, Display,
)]
#[serde(rename_all = "snake_case")]
pub enum Level {
    Info,
    Success,
    Warn,
    Error,
}

/// Rich body fields a sink may choose to render (e.g. a chat bot embed).
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct NotificationDetail {
    pub action: Option<String>,
    pub symbol: Option<String>,
    pub price_buy: Option<Decimal>,
    pub price_sell: Option<Decimal>,
    pub cost: Option<Decimal>,
    pub wallet: Option<String>,
    pub elapsed_ms: Option<i64>,
}

/// A message fanned out to every registered [`Sink`] (`spec.md` §4.8).
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize, Constructor)]
pub struct Notification {
    pub level: Level,
    pub kind: String,
    pub subject: String,
    pub body: String,
    pub detail: NotificationDetail,
}

impl Notification {
    pub fn info(kind: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Level::Info, kind.into(), subject.into(), body.into(), NotificationDetail::default())
    }

    pub fn warn(kind: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Level::Warn, kind.into(), subject.into(), body.into(), NotificationDetail::default())
    }

    pub fn error(kind: impl Into<String>, subject: impl Into<String>, body: impl Into<String>) -> Self {
        Self::new(Level::Error, kind.into(), subject.into(), body.into(), NotificationDetail::default())
    }
}

/// A notification destination (e-mail, chat bot, ...). Out of scope per
/// `spec.md` §1: only the contract is modelled here.
#[async_trait]
pub trait Sink: Send + Sync {
    fn name(&self) -> &str;
    async fn send(&self, notification: &Notification);
}

/// Level-filtered fan-out to every registered [`Sink`] (`spec.md` §4.8).
///
/// Sinks run in parallel and a single sink's failure never blocks the batch
/// or the caller — `Sink::send` has no error channel by design, matching the
/// "best effort, never blocks" contract `spec.md` §1 assigns to notification
/// sinks as an external collaborator.
pub struct NotifierHub {
    min_level: Level,
    sinks: Vec<Box<dyn Sink>>,
}

impl NotifierHub {
    pub fn new(min_level: Level) -> Self {
        Self {
            min_level,
            sinks: Vec::new(),
        }
    }

    pub fn register(&mut self, sink: Box<dyn Sink>) {
        self.sinks.push(sink);
    }

    pub async fn notify(&self, notification: Notification) {
        if notification.level < self.min_level {
            return;
        }
        join_all(self.sinks.iter().map(|sink| {
            let notification = &notification;
            async move {
                tracing::debug!(sink = sink.name(), level = %notification.level, "dispatching notification");
                sink.send(notification).await;
            }
        }))
        .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::Arc;

    struct RecordingSink {
        name: String,
        received: Arc<Mutex<Vec<String>>>,
    }

    #[async_trait]
    impl Sink for RecordingSink {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, notification: &Notification) {
            self.received.lock().push(notification.subject.clone());
        }
    }

    #[tokio::test]
    async fn messages_below_min_level_are_dropped() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let mut hub = NotifierHub::new(Level::Warn);
        hub.register(Box::new(RecordingSink {
            name: "test".into(),
            received: received.clone(),
        }));

        hub.notify(Notification::info("test", "ignored", "body")).await;
        assert!(received.lock().is_empty());

        hub.notify(Notification::error("test", "seen", "body")).await;
        assert_eq!(*received.lock(), vec!["seen".to_string()]);
    }

    #[tokio::test]
    async fn all_registered_sinks_receive_the_message() {
        let received_a = Arc::new(Mutex::new(Vec::new()));
        let received_b = Arc::new(Mutex::new(Vec::new()));
        let mut hub = NotifierHub::new(Level::Info);
        hub.register(Box::new(RecordingSink {
            name: "a".into(),
            received: received_a.clone(),
        }));
        hub.register(Box::new(RecordingSink {
            name: "b".into(),
            received: received_b.clone(),
        }));

        hub.notify(Notification::info("test", "hello", "body")).await;
        assert_eq!(received_a.lock().len(), 1);
        assert_eq!(received_b.lock().len(), 1);
    }
}
