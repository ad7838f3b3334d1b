use alloc::string::String;
use thiserror::Error;

use crate::deferred::DeferredId;
use crate::task::Tier;

/// Non-fatal failure observed by the scheduler and handed to the host's [`Reporter`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Incident {
    /// A task or a coroutine step panicked. The run loop carried on.
    #[error("{tier} task panicked: {message}")]
    Panicked { tier: Tier, message: String },
    /// A rejected deferred was dropped without any reaction ever registered on it.
    #[error("unhandled rejection in {deferred}: {error}")]
    UnhandledRejection { deferred: DeferredId, error: String },
}

/// Sink for incidents. Any `Fn(&Incident)` closure is a reporter.
pub trait Reporter {
    fn report(&self, incident: &Incident);
}

impl<F: Fn(&Incident)> Reporter for F {
    fn report(&self, incident: &Incident) {
        self(incident)
    }
}

/// Default reporter: logs every incident at error level.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingReporter;

impl Reporter for TracingReporter {
    fn report(&self, incident: &Incident) {
        match incident {
            Incident::Panicked { tier, message } => {
                tracing::error!(%tier, %message, "task panicked");
            }
            Incident::UnhandledRejection { deferred, error } => {
                tracing::error!(%deferred, %error, "unhandled rejection");
            }
        }
    }
}

pub(crate) fn panic_message(payload: &(dyn core::any::Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        String::from(*message)
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        String::from("<non-string panic payload>")
    }
}
