use std::sync::{Arc, Mutex};

/// Best-effort notification collaborator.
///
/// `notify` must never block or fail the decision path; implementations do
/// their own I/O on a spawned task if they need any.
pub trait Notifier: Send + Sync {
    fn notify(&self, message: &str);
}

/// Notifier that writes to the log stream.
#[derive(Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, message: &str) {
        tracing::info!(target: "rulebot::notify", "{}", message);
    }
}

/// Collects messages for assertions in tests.
#[derive(Default)]
pub struct RecordingNotifier {
    messages: Arc<Mutex<Vec<String>>>,
}

impl RecordingNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn messages(&self) -> Vec<String> {
        self.messages.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, message: &str) {
        self.messages
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_recording_notifier_collects() {
        let notifier = RecordingNotifier::new();
        notifier.notify("stop loss hit");
        assert_eq!(notifier.messages(), vec!["stop loss hit".to_string()]);
    }
}
