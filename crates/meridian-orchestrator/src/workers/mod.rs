//! Queue-driven workers: build, deploy, notify.

pub mod build;
pub mod deploy;
pub mod notify;

pub use build::{BuildExecutor, BuildWorker, ProcessBuildExecutor, StepFailure};
pub use deploy::DeployWorker;
pub use notify::{
    ChatWebhookChannel, EmailChannel, NotificationChannel, NotificationContext, NotifyWorker,
    WebhookChannel,
};
