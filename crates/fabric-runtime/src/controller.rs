//! Reconciler runner on `kube_runtime::Controller`
//!
//! Every reconciler runs behind a [`Controller`] for its primary kind. The
//! controller's scheduler deduplicates keys, never runs the same object twice
//! at once and caps parallelism at the configured concurrency. Related kinds
//! feed it through [`Runner::watches`] and [`Runner::owns`]. On top of that
//! the runner applies the per-reconcile timeout, per-object exponential
//! backoff on retriable errors, the periodic resync and the reconcile metrics.

use crate::action::Action;
use crate::backoff::{DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY, ExponentialBackoff};
use crate::error::Retriable;
use crate::metrics::Metrics;
use fabric_client::ObjectKey;
use futures::StreamExt;
use kube::{Api, Resource};
use kube_runtime::controller::{self, Config as ControllerConfig};
use kube_runtime::reflector::ObjectRef;
use kube_runtime::{Controller, watcher};
use serde::de::DeserializeOwned;
use std::collections::HashMap;
use std::fmt::Debug;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Default number of concurrent reconciles per controller
pub const DEFAULT_WORKERS: usize = 2;
/// Default per-reconcile timeout
pub const DEFAULT_RECONCILE_TIMEOUT: Duration = Duration::from_secs(10);

/// A controller's reconcile function
#[async_trait::async_trait]
pub trait Reconciler: Send + Sync + 'static {
    /// Error returned by [`Reconciler::reconcile`]
    type Error: std::error::Error + Retriable + Send + Sync + 'static;

    /// Controller name used in logs and metrics
    fn name(&self) -> &str;

    /// Drive the object behind `key` towards its desired state
    async fn reconcile(&self, key: &ObjectKey) -> Result<Action, Self::Error>;
}

/// Failure of one reconcile as seen by the controller
#[derive(Debug, Error)]
pub enum ReconcileError<E: std::error::Error + 'static> {
    /// The reconciler returned an error
    #[error(transparent)]
    Reconcile(E),

    /// The reconciler did not finish in time
    #[error("Reconcile timed out after {0:?}")]
    Timeout(Duration),
}

impl<E: std::error::Error + Retriable + 'static> Retriable for ReconcileError<E> {
    fn is_retriable(&self) -> bool {
        match self {
            ReconcileError::Reconcile(e) => e.is_retriable(),
            ReconcileError::Timeout(_) => true,
        }
    }
}

/// Reference the controller of `K` schedules for `key`
pub fn object_ref<K: Resource<DynamicType = ()>>(key: &ObjectKey) -> ObjectRef<K> {
    let reference = ObjectRef::new(&key.name);
    match &key.namespace {
        Some(namespace) => reference.within(namespace),
        None => reference,
    }
}

/// State shared by the reconcile and error-policy callbacks
struct Context<R> {
    reconciler: Arc<R>,
    timeout: Duration,
    resync: Option<Duration>,
    metrics: Option<Metrics>,
    backoff: Mutex<HashMap<ObjectKey, ExponentialBackoff>>,
}

impl<R: Reconciler> Context<R> {
    fn new(reconciler: Arc<R>, timeout: Duration, resync: Option<Duration>, metrics: Option<Metrics>) -> Self {
        Self {
            reconciler,
            timeout,
            resync,
            metrics,
            backoff: Mutex::new(HashMap::new()),
        }
    }

    fn observe(&self, result: &str, started: Instant) {
        if let Some(metrics) = &self.metrics {
            metrics.observe(self.reconciler.name(), result, started.elapsed());
        }
    }

    fn next_backoff(&self, key: &ObjectKey) -> Duration {
        self.backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key.clone())
            .or_insert_with(|| ExponentialBackoff::new(DEFAULT_BASE_DELAY, DEFAULT_MAX_DELAY))
            .next_backoff()
    }

    fn forget(&self, key: &ObjectKey) {
        self.backoff
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}

async fn reconcile<K, R>(obj: Arc<K>, ctx: Arc<Context<R>>) -> Result<Action, ReconcileError<R::Error>>
where
    K: Resource,
    R: Reconciler,
{
    let key = ObjectKey::of(obj.as_ref());
    let started = Instant::now();
    let result = tokio::time::timeout(ctx.timeout, ctx.reconciler.reconcile(&key)).await;
    match result {
        Ok(Ok(action)) => {
            ctx.forget(&key);
            if action == Action::await_change() {
                debug!(controller = %ctx.reconciler.name(), key = %key, "Reconciled");
                ctx.observe("success", started);
                return Ok(ctx.resync.map_or(action, Action::requeue));
            }
            ctx.observe("requeue", started);
            Ok(action)
        }
        Ok(Err(e)) => {
            ctx.observe("error", started);
            Err(ReconcileError::Reconcile(e))
        }
        Err(_) => {
            ctx.observe("timeout", started);
            Err(ReconcileError::Timeout(ctx.timeout))
        }
    }
}

fn error_policy<K, R>(obj: Arc<K>, err: &ReconcileError<R::Error>, ctx: Arc<Context<R>>) -> Action
where
    K: Resource,
    R: Reconciler,
{
    let key = ObjectKey::of(obj.as_ref());
    let name = ctx.reconciler.name();
    if err.is_retriable() {
        let delay = ctx.next_backoff(&key);
        warn!(controller = %name, key = %key, error = %err, delay = ?delay, "Reconcile failed, retrying");
        return Action::requeue(delay);
    }
    error!(controller = %name, key = %key, error = %err, "Reconcile failed permanently");
    ctx.forget(&key);
    Action::await_change()
}

/// One reconciler behind a [`Controller`] for its primary kind `K`
pub struct Runner<K, R>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
{
    controller: Controller<K>,
    reconciler: Arc<R>,
    concurrency: u16,
    timeout: Duration,
    resync: Option<Duration>,
    metrics: Option<Metrics>,
}

impl<K, R> Runner<K, R>
where
    K: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + Sync + 'static,
    R: Reconciler,
{
    /// Run `reconciler` for every object of `api`
    pub fn new(api: Api<K>, reconciler: Arc<R>) -> Self {
        Self {
            controller: Controller::new(api, watcher::Config::default()),
            reconciler,
            concurrency: DEFAULT_WORKERS as u16,
            timeout: DEFAULT_RECONCILE_TIMEOUT,
            resync: None,
            metrics: None,
        }
    }

    /// Also reconcile the objects `mapper` derives from each event on `api`
    #[must_use]
    pub fn watches<W>(mut self, api: Api<W>, mapper: impl Fn(&W) -> Vec<ObjectKey> + Send + Sync + 'static) -> Self
    where
        W: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
    {
        self.controller = self
            .controller
            .watches(api, watcher::Config::default(), move |obj: W| {
                mapper(&obj).iter().map(object_ref::<K>).collect::<Vec<_>>()
            });
        self
    }

    /// Also reconcile the controller owner of each object of `api`
    #[must_use]
    pub fn owns<C>(mut self, api: Api<C>) -> Self
    where
        C: Resource<DynamicType = ()> + Clone + DeserializeOwned + Debug + Send + 'static,
    {
        self.controller = self.controller.owns(api, watcher::Config::default());
        self
    }

    /// Number of objects reconciled at once (at least one)
    #[must_use]
    pub fn concurrency(mut self, workers: usize) -> Self {
        self.concurrency = u16::try_from(workers.max(1)).unwrap_or(u16::MAX);
        self
    }

    /// Per-reconcile timeout
    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Reconcile every settled object again after `period`
    #[must_use]
    pub fn resync(mut self, period: Duration) -> Self {
        self.resync = Some(period);
        self
    }

    /// Record reconcile results in `metrics`
    #[must_use]
    pub fn metrics(mut self, metrics: Metrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Run until `cancel` fires; in-flight reconciles finish first.
    pub async fn run(self, cancel: CancellationToken) {
        let name = self.reconciler.name().to_string();
        info!(controller = %name, concurrency = self.concurrency, "Starting controller");
        let context = Arc::new(Context::new(self.reconciler, self.timeout, self.resync, self.metrics));

        self.controller
            .with_config(ControllerConfig::default().concurrency(self.concurrency))
            .graceful_shutdown_on(async move { cancel.cancelled().await })
            .run(reconcile::<K, R>, error_policy::<K, R>, context)
            .for_each(|result| {
                match result {
                    Ok((reference, _)) => debug!(controller = %name, object = %reference, "Reconcile finished"),
                    // Logged by the error policy
                    Err(controller::Error::ReconcilerFailed(_, _)) => {}
                    Err(e) => warn!(controller = %name, error = %e, "Controller error"),
                }
                futures::future::ready(())
            })
            .await;
        info!(controller = %name, "Controller stopped");
    }
}
