use std::future::{Future, ready};
use std::pin::Pin;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::workflow::collaborator::{EmailDispatcher, EmailError, EmailMessage};

/// `EmailDispatcher` that records messages instead of sending them.
#[derive(Debug, Default)]
pub struct RecordingEmailDispatcher {
    sent: Mutex<Vec<EmailMessage>>,
    failing: AtomicBool,
}

impl RecordingEmailDispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn fail_sends(&self, fail: bool) {
        self.failing.store(fail, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<EmailMessage> {
        self.sent.lock().map(|s| s.clone()).unwrap_or_default()
    }

    fn send_now(&self, message: &EmailMessage) -> Result<(), EmailError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EmailError("mailer unavailable".to_string()));
        }
        self.sent
            .lock()
            .map_err(|_| EmailError("outbox poisoned".to_string()))?
            .push(message.clone());
        Ok(())
    }
}

impl EmailDispatcher for RecordingEmailDispatcher {
    fn send<'a>(
        &'a self,
        message: &'a EmailMessage,
    ) -> Pin<Box<dyn Future<Output = Result<(), EmailError>> + Send + 'a>> {
        Box::pin(ready(self.send_now(message)))
    }
}
