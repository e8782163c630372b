//! Hook registry and the dispatcher task that drains the write feed.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use futures_util::future::join_all;
use tokio::sync::{RwLock, broadcast};
use tracing::{debug, error, info, warn};

use super::hooks::ResourceHook;
use super::types::ResourceEvent;

/// Default upper bound on a single hook invocation.
const DEFAULT_HOOK_TIMEOUT: Duration = Duration::from_secs(30);

/// How one hook invocation ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Completed,
    Failed(String),
    Panicked(String),
    TimedOut,
}

/// Per-event tally returned by [`HookRegistry::dispatch`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DispatchSummary {
    pub completed: usize,
    pub failed: usize,
    pub panicked: usize,
    pub timed_out: usize,
}

impl DispatchSummary {
    pub fn total(&self) -> usize {
        self.completed + self.failed + self.panicked + self.timed_out
    }

    fn record(&mut self, outcome: &HookOutcome) {
        match outcome {
            HookOutcome::Completed => self.completed += 1,
            HookOutcome::Failed(_) => self.failed += 1,
            HookOutcome::Panicked(_) => self.panicked += 1,
            HookOutcome::TimedOut => self.timed_out += 1,
        }
    }
}

/// Registered hooks plus the per-invocation timeout.
pub struct HookRegistry {
    hooks: RwLock<Vec<Arc<dyn ResourceHook>>>,
    timeout: Duration,
}

impl Default for HookRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl HookRegistry {
    pub fn new() -> Self {
        Self::with_timeout(DEFAULT_HOOK_TIMEOUT)
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            hooks: RwLock::new(Vec::new()),
            timeout,
        }
    }

    pub async fn register(&self, hook: Arc<dyn ResourceHook>) {
        debug!(hook = %hook.name(), "Registered resource hook");
        self.hooks.write().await.push(hook);
    }

    pub async fn len(&self) -> usize {
        self.hooks.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.hooks.read().await.is_empty()
    }

    /// Run every matching hook against `event` and wait for all of them.
    ///
    /// Hooks run concurrently with each other. A failing, panicking or slow
    /// hook is isolated: it is logged and counted, never propagated.
    pub async fn dispatch(&self, event: &ResourceEvent) -> DispatchSummary {
        let matching: Vec<_> = self
            .hooks
            .read()
            .await
            .iter()
            .filter(|h| h.matches(event))
            .cloned()
            .collect();

        let mut summary = DispatchSummary::default();
        if matching.is_empty() {
            debug!(resource = %event.reference(), "No hooks matched event");
            return summary;
        }

        let outcomes = join_all(
            matching
                .iter()
                .map(|hook| run_hook(hook.as_ref(), event, self.timeout)),
        )
        .await;

        for (hook, outcome) in matching.iter().zip(&outcomes) {
            log_outcome(hook.name(), event, outcome, self.timeout);
            summary.record(outcome);
        }
        summary
    }

    /// Call `on_start` on every hook; failures are logged.
    pub async fn start_all(&self) {
        for hook in self.hooks.read().await.iter() {
            if let Err(e) = hook.on_start().await {
                warn!(hook = %hook.name(), error = %e, "Hook on_start failed");
            }
        }
    }

    /// Call `on_shutdown` on every hook; failures are logged.
    pub async fn shutdown_all(&self) {
        for hook in self.hooks.read().await.iter() {
            if let Err(e) = hook.on_shutdown().await {
                warn!(hook = %hook.name(), error = %e, "Hook on_shutdown failed");
            }
        }
    }
}

impl std::fmt::Debug for HookRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HookRegistry")
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}

async fn run_hook(hook: &dyn ResourceHook, event: &ResourceEvent, timeout: Duration) -> HookOutcome {
    let guarded = AssertUnwindSafe(hook.handle(event)).catch_unwind();
    match tokio::time::timeout(timeout, guarded).await {
        Ok(Ok(Ok(()))) => HookOutcome::Completed,
        Ok(Ok(Err(e))) => HookOutcome::Failed(e.to_string()),
        Ok(Err(payload)) => HookOutcome::Panicked(panic_message(payload.as_ref())),
        Err(_) => HookOutcome::TimedOut,
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string())
}

fn log_outcome(hook: &str, event: &ResourceEvent, outcome: &HookOutcome, timeout: Duration) {
    match outcome {
        HookOutcome::Completed => {
            debug!(hook = %hook, resource = %event.reference(), "Hook completed");
        }
        HookOutcome::Failed(e) => {
            warn!(hook = %hook, resource = %event.reference(), error = %e, "Hook failed");
        }
        HookOutcome::Panicked(msg) => {
            error!(hook = %hook, resource = %event.reference(), panic = %msg, "Hook panicked");
        }
        HookOutcome::TimedOut => {
            error!(
                hook = %hook,
                resource = %event.reference(),
                timeout_ms = timeout.as_millis() as u64,
                "Hook timed out"
            );
        }
    }
}

/// Drains the broadcast feed, one event at a time, into a [`HookRegistry`].
#[derive(Debug)]
pub struct HookDispatcher {
    registry: Arc<HookRegistry>,
}

impl HookDispatcher {
    pub fn new(registry: Arc<HookRegistry>) -> Self {
        Self { registry }
    }

    /// Run until the channel closes. Lagging loses the oldest events; the
    /// gap is logged and dispatch continues.
    pub async fn run(self, mut receiver: broadcast::Receiver<ResourceEvent>) {
        info!("Hook dispatcher started");
        self.registry.start_all().await;

        loop {
            match receiver.recv().await {
                Ok(event) => {
                    self.registry.dispatch(&event).await;
                }
                Err(broadcast::error::RecvError::Lagged(missed)) => {
                    warn!(missed, "Hook dispatcher lagged, oldest events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }

        self.registry.shutdown_all().await;
        info!("Hook dispatcher stopped");
    }

    pub fn registry(&self) -> &Arc<HookRegistry> {
        &self.registry
    }
}

/// Collects hooks, then spawns the dispatcher.
#[derive(Default)]
pub struct HookSystemBuilder {
    registry: HookRegistry,
}

impl HookSystemBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_timeout(timeout: Duration) -> Self {
        Self {
            registry: HookRegistry::with_timeout(timeout),
        }
    }

    pub async fn register(self, hook: Arc<dyn ResourceHook>) -> Self {
        self.registry.register(hook).await;
        self
    }

    pub fn build(self) -> Arc<HookRegistry> {
        Arc::new(self.registry)
    }

    /// Spawn the dispatcher on `receiver`. Returns the shared registry and
    /// the dispatcher task.
    pub fn start(
        self,
        receiver: broadcast::Receiver<ResourceEvent>,
    ) -> (Arc<HookRegistry>, tokio::task::JoinHandle<()>) {
        let registry = self.build();
        let handle = tokio::spawn(HookDispatcher::new(registry.clone()).run(receiver));
        (registry, handle)
    }
}
