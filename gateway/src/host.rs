//! Module host
//!
//! A process embeds the gateway next to other restartable modules. The
//! [`Scheduler`] drives all of them: on every tick each module gets the chance
//! to apply its pending configuration, and on shutdown each is stopped in
//! reverse registration order.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::MissedTickBehavior;

/// Restartable component of the host process
#[async_trait]
pub trait Module: Send + Sync {
    fn name(&self) -> &str;

    /// Apply pending configuration. Returns true if anything was restarted.
    async fn restart_if_changed(&self) -> bool;

    async fn stop(&self);
}

pub struct Scheduler {
    modules: Vec<Arc<dyn Module>>,
    period: Duration,
}

impl Scheduler {
    pub fn new(period: Duration) -> Self {
        Self {
            modules: Vec::new(),
            period,
        }
    }

    pub fn register(&mut self, module: Arc<dyn Module>) {
        tracing::debug!("Registered module {}", module.name());
        self.modules.push(module);
    }

    /// Give every module one chance to restart. Returns how many did.
    pub async fn tick(&self) -> usize {
        let mut restarted = 0;
        for module in &self.modules {
            if module.restart_if_changed().await {
                tracing::debug!("Module {} restarted", module.name());
                restarted += 1;
            }
        }
        restarted
    }

    /// Tick until `shutdown` resolves, then stop every module.
    pub async fn run<F>(self, shutdown: F)
    where
        F: Future<Output = ()>,
    {
        let mut interval = tokio::time::interval(self.period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tokio::pin!(shutdown);

        loop {
            tokio::select! {
                _ = &mut shutdown => break,
                _ = interval.tick() => {
                    self.tick().await;
                }
            }
        }

        for module in self.modules.iter().rev() {
            tracing::info!("Stopping module {}", module.name());
            module.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;

    struct Flagged {
        name: &'static str,
        pending: AtomicBool,
        restarts: AtomicUsize,
        stops: Arc<Mutex<Vec<&'static str>>>,
    }

    impl Flagged {
        fn new(name: &'static str, stops: &Arc<Mutex<Vec<&'static str>>>) -> Arc<Self> {
            Arc::new(Self {
                name,
                pending: AtomicBool::new(false),
                restarts: AtomicUsize::new(0),
                stops: stops.clone(),
            })
        }
    }

    #[async_trait]
    impl Module for Flagged {
        fn name(&self) -> &str {
            self.name
        }

        async fn restart_if_changed(&self) -> bool {
            if self.pending.swap(false, Ordering::AcqRel) {
                self.restarts.fetch_add(1, Ordering::Relaxed);
                true
            } else {
                false
            }
        }

        async fn stop(&self) {
            self.stops.lock().unwrap().push(self.name);
        }
    }

    #[tokio::test]
    async fn test_tick_restarts_only_changed_modules() {
        let stops = Arc::new(Mutex::new(Vec::new()));
        let a = Flagged::new("a", &stops);
        let b = Flagged::new("b", &stops);

        let mut scheduler = Scheduler::new(Duration::from_millis(10));
        scheduler.register(a.clone());
        scheduler.register(b.clone());

        b.pending.store(true, Ordering::Release);
        assert_eq!(scheduler.tick().await, 1);
        assert_eq!(scheduler.tick().await, 0);
        assert_eq!(a.restarts.load(Ordering::Relaxed), 0);
        assert_eq!(b.restarts.load(Ordering::Relaxed), 1);
    }

    #[tokio::test]
    async fn test_run_stops_modules_in_reverse_order() {
        let stops = Arc::new(Mutex::new(Vec::new()));
        let a = Flagged::new("a", &stops);
        let b = Flagged::new("b", &stops);
        a.pending.store(true, Ordering::Release);

        let mut scheduler = Scheduler::new(Duration::from_millis(5));
        scheduler.register(a.clone());
        scheduler.register(b.clone());

        scheduler
            .run(tokio::time::sleep(Duration::from_millis(50)))
            .await;

        assert_eq!(a.restarts.load(Ordering::Relaxed), 1);
        assert_eq!(*stops.lock().unwrap(), vec!["b", "a"]);
    }
}
