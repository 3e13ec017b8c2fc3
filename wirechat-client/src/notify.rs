use wirechat_core::UserId;

/// Payload handed to the desktop-notification collaborator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub title: String,
    pub body: String,
    pub sender_id: UserId,
    pub sender_name: String,
    pub icon_url: Option<String>,
}

/// Fire-and-forget sink for desktop notifications. The session never
/// observes a result.
pub trait Notifier: Send + Sync {
    fn notify(&self, notification: Notification);
}

/// Sink for headless use (CLI, tests that don't care).
#[derive(Debug, Default)]
pub struct NullNotifier;

impl Notifier for NullNotifier {
    fn notify(&self, _notification: Notification) {}
}
