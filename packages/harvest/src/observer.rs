//! Progress reporting for long drains.
//!
//! The engine calls the observer from its coordinator after every settled
//! attempt, so calls for one item always arrive in attempt order.

use tracing::info;

pub trait ProgressObserver: Send + Sync {
    /// Fraction of the backlog snapshot that is settled, in `0.0..=1.0`.
    fn progress(&self, fraction: f64);

    /// Short human-readable description of what just happened.
    fn status(&self, message: &str);
}

/// Ignores everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoopObserver;

impl ProgressObserver for NoopObserver {
    fn progress(&self, _fraction: f64) {}

    fn status(&self, _message: &str) {}
}

/// Logs progress through `tracing`, for headless runs.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingObserver;

impl ProgressObserver for TracingObserver {
    fn progress(&self, fraction: f64) {
        info!(percent = format!("{:.1}", fraction * 100.0), "drain progress");
    }

    fn status(&self, message: &str) {
        info!("{}", message);
    }
}

/// Adapts a pair of closures.
pub struct FnObserver<P, S> {
    on_progress: P,
    on_status: S,
}

impl<P, S> FnObserver<P, S>
where
    P: Fn(f64) + Send + Sync,
    S: Fn(&str) + Send + Sync,
{
    pub fn new(on_progress: P, on_status: S) -> Self {
        Self {
            on_progress,
            on_status,
        }
    }
}

impl<P, S> ProgressObserver for FnObserver<P, S>
where
    P: Fn(f64) + Send + Sync,
    S: Fn(&str) + Send + Sync,
{
    fn progress(&self, fraction: f64) {
        (self.on_progress)(fraction)
    }

    fn status(&self, message: &str) {
        (self.on_status)(message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[test]
    fn test_fn_observer_forwards_calls() {
        let fractions = Mutex::new(Vec::new());
        let messages = Mutex::new(Vec::new());
        let observer = FnObserver::new(
            |f| fractions.lock().unwrap().push(f),
            |m: &str| messages.lock().unwrap().push(m.to_string()),
        );

        observer.progress(0.5);
        observer.status("done: https://a.example");

        assert_eq!(*fractions.lock().unwrap(), vec![0.5]);
        assert_eq!(*messages.lock().unwrap(), vec!["done: https://a.example"]);
    }
}
