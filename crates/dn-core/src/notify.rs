//! User-visible transient messages.
//!
//! A keyed notice replaces any earlier notice with the same key, so a
//! "pending" notice is resolved by a later success or error notice.

use std::sync::{Mutex, PoisonError};
use tracing::{error, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NoticeLevel {
    Loading,
    Info,
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub key: Option<String>,
    pub level: NoticeLevel,
    pub text: String,
}

impl Notice {
    pub fn new(level: NoticeLevel, text: impl Into<String>) -> Self {
        Self {
            key: None,
            level,
            text: text.into(),
        }
    }

    pub fn keyed(key: &str, level: NoticeLevel, text: impl Into<String>) -> Self {
        Self {
            key: Some(key.to_owned()),
            level,
            text: text.into(),
        }
    }
}

pub trait Notifier: Send + Sync {
    fn notify(&self, notice: Notice);
}

/// Writes notices to the tracing subscriber.
#[derive(Debug, Default)]
pub struct TracingNotifier;

impl Notifier for TracingNotifier {
    fn notify(&self, notice: Notice) {
        let key = notice.key.as_deref().unwrap_or("-");
        match notice.level {
            NoticeLevel::Loading | NoticeLevel::Info | NoticeLevel::Success => {
                info!(key, level = ?notice.level, "{}", notice.text)
            }
            NoticeLevel::Warning => warn!(key, "{}", notice.text),
            NoticeLevel::Error => error!(key, "{}", notice.text),
        }
    }
}

/// Keeps every notice in arrival order.
#[derive(Debug, Default)]
pub struct MemoryNotifier {
    notices: Mutex<Vec<Notice>>,
}

impl MemoryNotifier {
    pub fn notices(&self) -> Vec<Notice> {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn with_key(&self, key: &str) -> Vec<Notice> {
        self.notices()
            .into_iter()
            .filter(|notice| notice.key.as_deref() == Some(key))
            .collect()
    }

    pub fn take(&self) -> Vec<Notice> {
        std::mem::take(&mut *self.notices.lock().unwrap_or_else(PoisonError::into_inner))
    }
}

impl Notifier for MemoryNotifier {
    fn notify(&self, notice: Notice) {
        self.notices
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(notice);
    }
}
