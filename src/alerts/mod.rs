/// Operator notifications: events, transports and rate-limited delivery
pub mod alert;
pub mod alert_manager;
pub mod notifier;
pub mod rate_limiter;

pub use alert::{Alert, IncidentTransition, TransitionKind};
pub use alert_manager::{AlertManager, AlertSender};
pub use notifier::{LogNotifier, MockNotifier, Notifier, SlackNotifier, WebhookNotifier};
pub use rate_limiter::RateLimiter;
