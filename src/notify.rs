//! User-visible notifications.
//!
//! Business errors are pushed to a [`Notifier`] so the shell can show them.
//! Pushing is fire-and-forget.

use std::fmt;

/// Severity of a notification.
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
pub enum NotificationKind {
    #[default]
    Info,
    Success,
    Warning,
    Error,
}

impl fmt::Display for NotificationKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Info => write!(f, "info"),
            Self::Success => write!(f, "success"),
            Self::Warning => write!(f, "warning"),
            Self::Error => write!(f, "error"),
        }
    }
}

/// Sink for user-visible messages.
pub trait Notifier: Send + Sync {
    fn push(&self, message: &str, kind: NotificationKind);
}

/// Writes notifications to the log.
#[derive(Copy, Clone, Debug, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn push(&self, message: &str, kind: NotificationKind) {
        match kind {
            NotificationKind::Error => error!("{message}"),
            NotificationKind::Warning => warn!("{message}"),
            NotificationKind::Info | NotificationKind::Success => info!("{message}"),
        }
    }
}
