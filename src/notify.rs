use std::sync::Mutex;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::mpsc;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Success,
    Info,
    Warning,
    Error,
}

/// User-facing message data. The host decides how to render it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Notification {
    pub title: String,
    pub message: String,
    pub severity: Severity,
    pub auto_dismiss: Option<Duration>,
}

impl Notification {
    pub fn new(severity: Severity, title: impl Into<String>, message: impl Into<String>) -> Self {
        let auto_dismiss = match severity {
            Severity::Success | Severity::Info => Some(Duration::from_secs(5)),
            Severity::Warning => Some(Duration::from_secs(10)),
            Severity::Error => None,
        };
        Self {
            title: title.into(),
            message: message.into(),
            severity,
            auto_dismiss,
        }
    }

    pub fn success(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Success, title, message)
    }

    pub fn info(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Info, title, message)
    }

    pub fn warning(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Warning, title, message)
    }

    pub fn error(title: impl Into<String>, message: impl Into<String>) -> Self {
        Self::new(Severity::Error, title, message)
    }
}

/// Fan-out list of unbounded subscribers.
///
/// Publishing never blocks; subscribers whose receiver was dropped are pruned.
pub struct Observers<T> {
    senders: Mutex<Vec<mpsc::UnboundedSender<T>>>,
}

impl<T: Clone> Observers<T> {
    pub fn new() -> Self {
        Self {
            senders: Mutex::new(Vec::new()),
        }
    }

    pub fn subscribe(&self) -> mpsc::UnboundedReceiver<T> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.lock().push(tx);
        rx
    }

    pub fn publish(&self, value: T) {
        self.lock().retain(|tx| tx.send(value.clone()).is_ok());
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<mpsc::UnboundedSender<T>>> {
        self.senders
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl<T: Clone> Default for Observers<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn publishes_to_every_live_subscriber() {
        let observers = Observers::new();
        let mut a = observers.subscribe();
        let b = observers.subscribe();
        drop(b);

        observers.publish(7_u32);
        assert_eq!(a.try_recv().ok(), Some(7));
        assert_eq!(observers.len(), 1);
    }

    #[test]
    fn errors_stay_on_screen() {
        let note = Notification::error("Install failed", "no sources");
        assert_eq!(note.auto_dismiss, None);
        assert_eq!(Notification::success("Done", "ok").severity, Severity::Success);
    }
}
