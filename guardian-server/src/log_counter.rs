//! Tracing layer that feeds error/warn counts into the metrics registry so
//! the health aggregator can degrade the service on log pressure.

use std::sync::Arc;

use tracing::{Event, Level, Subscriber};
use tracing_subscriber::layer::{Context, Layer};

use guardian_core::MetricsRegistry;
use guardian_core::health::{LOG_ERROR_COUNTER, LOG_FATAL_COUNTER};

pub struct LogCounterLayer {
    metrics: Arc<MetricsRegistry>,
}

impl LogCounterLayer {
    pub fn new(metrics: Arc<MetricsRegistry>) -> Self {
        Self { metrics }
    }
}

impl<S: Subscriber> Layer<S> for LogCounterLayer {
    fn on_event(&self, event: &Event<'_>, _ctx: Context<'_, S>) {
        match *event.metadata().level() {
            Level::ERROR => {
                // tracing has no fatal level; errors in a `fatal` target are
                // treated as such.
                if event.metadata().target().contains("fatal") {
                    self.metrics.increment_counter(LOG_FATAL_COUNTER, 1);
                } else {
                    self.metrics.increment_counter(LOG_ERROR_COUNTER, 1);
                }
            }
            Level::WARN => self.metrics.increment_counter("log.warn", 1),
            _ => {}
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tracing_subscriber::layer::SubscriberExt;

    #[test]
    fn error_and_warn_events_are_counted() {
        let metrics = Arc::new(MetricsRegistry::new());
        let subscriber =
            tracing_subscriber::registry().with(LogCounterLayer::new(metrics.clone()));

        tracing::subscriber::with_default(subscriber, || {
            tracing::error!("pipeline broke");
            tracing::error!("pipeline broke again");
            tracing::warn!("recovering");
            tracing::info!("all good");
        });

        assert_eq!(metrics.counter(LOG_ERROR_COUNTER), 2);
        assert_eq!(metrics.counter("log.warn"), 1);
        assert_eq!(metrics.counter("log.fatal"), 0);
    }
}
