use std::sync::Mutex;
use std::time::Duration;

use chrono::Utc;
use tracing::info;
use vigil_common::UserQuestion;

/// At-most-one active user question, shared by the ASR intake and the
/// scheduler.
///
/// Binding is atomic: `take` hands the question to exactly one inference and
/// clears the slot in the same critical section, so the same question can
/// never be bound twice. Unconsumed questions expire after `expiry`.
#[derive(Debug)]
pub struct QuestionRegistry {
    slot: Mutex<Option<UserQuestion>>,
    expiry: Duration,
}

impl QuestionRegistry {
    pub fn new(expiry: Duration) -> Self {
        Self {
            slot: Mutex::new(None),
            expiry,
        }
    }

    /// Store a new question, replacing any previous one.
    pub fn set(&self, text: String) -> UserQuestion {
        let question = UserQuestion {
            text,
            created_at: Utc::now(),
        };
        info!(question = %question.text, "User question received");
        *self.slot.lock().unwrap() = Some(question.clone());
        question
    }

    fn expired(&self, q: &UserQuestion) -> bool {
        let age = Utc::now() - q.created_at;
        age.num_milliseconds() as u128 > self.expiry.as_millis()
    }

    /// Snapshot without consuming; expired questions are cleared here.
    pub fn current(&self) -> Option<UserQuestion> {
        let mut slot = self.slot.lock().unwrap();
        if let Some(q) = slot.as_ref() {
            if self.expired(q) {
                info!("User question expired");
                *slot = None;
            }
        }
        slot.clone()
    }

    /// Atomically consume the active question for binding to an inference.
    pub fn take(&self) -> Option<UserQuestion> {
        let mut slot = self.slot.lock().unwrap();
        match slot.take() {
            Some(q) if !self.expired(&q) => Some(q),
            Some(_) => {
                info!("User question expired");
                None
            }
            None => None,
        }
    }

    pub fn clear(&self) -> Option<String> {
        let cleared = self.slot.lock().unwrap().take().map(|q| q.text);
        if let Some(text) = &cleared {
            info!(question = %text, "User question cleared");
        }
        cleared
    }

    pub fn has_question(&self) -> bool {
        self.current().is_some()
    }
}
