//! Reconciliation pipeline: one pass per scheduled resource, delegating to
//! the release and status steps and owning the finalizer lifecycle.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use crate::{Error, Result, Settings, telemetry};
use chartkeeper_crd::{ChartRelease, annotation};
use futures::StreamExt;
use k8s_openapi::api::core::v1::ObjectReference;
use k8s_openapi::chrono::Utc;
use kube::api::{ListParams, Patch, PatchParams};
use kube::runtime::Controller;
use kube::runtime::events::{Event, EventType, Recorder};
use kube::runtime::watcher::Config;
use kube::{Api, Client, Resource, ResourceExt, runtime::controller::Action};
use serde_json::json;
use tokio::sync::{RwLock, watch};
use tracing::{Span, debug, error, field, info, instrument, warn};

use crate::backend::ReleaseBackend;
use crate::diagnostics::Diagnostics;
use crate::lease;
use crate::pass::PassOutcome;
use crate::release::ReleaseResource;
use crate::status::StatusResource;
use crate::store::KubeStore;

/// Finalizer guarding release teardown.
pub const FINALIZER: &str = "chartkeeper.dev/release";

/// Readiness probe attempts before the pass is rescheduled.
const READY_ATTEMPTS: u32 = 3;

/// Context for our reconciler
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// Release backend, probed for readiness before any pass mutates state
    pub backend: Arc<dyn ReleaseBackend>,
    /// Diagnostics that contains the traces metrics and kube event recorder
    pub diagnostics: Arc<RwLock<Diagnostics>>,
    /// Kubernetes event emitter
    pub recorder: Recorder,
    /// Release reconciliation step
    pub release: Arc<ReleaseResource>,
    /// Status reporting step
    pub status: Arc<StatusResource>,
}

/// Holds the state of the whole application
#[derive(Clone, Default)]
pub struct State {
    /// Atomic lock for kubernetes diagnostics
    pub diagnostics: Arc<RwLock<Diagnostics>>,
}

impl State {
    /// Getter for diagnostics with read lock
    pub async fn diagnostics(&self) -> Diagnostics {
        self.diagnostics.read().await.clone()
    }

    /// Converts the application state to controller context
    pub async fn to_ctrl_context(
        &self,
        client: Client,
        backend: Arc<dyn ReleaseBackend>,
        settings: Settings,
    ) -> Arc<Context> {
        let store = Arc::new(KubeStore::new(client.clone()));

        Arc::new(Context {
            recorder: self.diagnostics.read().await.recorder(client.clone()),
            release: Arc::new(ReleaseResource::new(
                backend.clone(),
                store.clone(),
                settings.clone(),
            )),
            status: Arc::new(StatusResource::new(backend.clone(), store, &settings)),
            backend,
            client,
            diagnostics: self.diagnostics.clone(),
        })
    }
}

/// Initialize the controller and shared state (given the crd is installed)
///
/// # Panics
/// Will panic if kube client cannot be initialized from the environment
#[instrument(skip(state, backend, settings))]
pub async fn run(state: State, backend: Arc<dyn ReleaseBackend>, settings: Settings) {
    info!("initializing chartkeeper controller");

    // tokio will handle this?
    #[allow(clippy::expect_used)]
    let client = Client::try_default()
        .await
        .expect("failed to create kube client");

    info!("kubernetes client initialized successfully");

    let (leader_tx, mut leader_rx) = watch::channel(false);
    tokio::spawn(lease::run_leader_election(client.clone(), leader_tx));

    while !*leader_rx.borrow_and_update() {
        info!("waiting for lease lock");
        if leader_rx.changed().await.is_err() {
            error!("leader election channel closed");
            std::process::exit(1);
        }
    }
    info!("lease lock acquired");

    let releases = Api::<ChartRelease>::all(client.clone());
    if let Err(e) = releases.list(&ListParams::default().limit(1)).await {
        error!(
            error = %e,
            "failed to list chartrelease resources, CRD may not be installed"
        );
        std::process::exit(1);
    }

    info!("chartrelease CRD verified, starting controller");

    Controller::new(releases, Config::default().any_semantic())
        .shutdown_on_signal()
        .run(
            reconcile,
            error_policy,
            state.to_ctrl_context(client, backend, settings).await,
        )
        .filter_map(|x| async move { std::result::Result::ok(x) })
        .for_each(|_| futures::future::ready(()))
        .await;

    info!("controller shutdown complete");
}

#[instrument(skip(cr, ctx), fields(
    resource_name = %cr.name_any(),
    resource_namespace = cr.namespace().as_deref(),
    release_name = %cr.spec.release_name,
    release_namespace = %cr.spec.namespace,
    chart_version = %cr.spec.version,
    trace_id = field::Empty,
))]
#[allow(clippy::needless_pass_by_value)]
async fn reconcile(cr: Arc<ChartRelease>, ctx: Arc<Context>) -> Result<Action> {
    let trace_id = telemetry::get_trace_id();
    if trace_id != opentelemetry::trace::TraceId::INVALID {
        Span::current().record("trace_id", field::display(&trace_id));
    }

    info!("starting reconciliation");

    if let Err(err) = with_retry(READY_ATTEMPTS, || ctx.backend.ready()).await {
        warn!(error = %err, "backend not ready, rescheduling pass");
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    let oref = cr.object_ref(&());

    if cr.meta().deletion_timestamp.is_some() {
        return teardown(&cr, &ctx, &oref).await;
    }

    ensure_finalizer(&ctx.client, &cr).await?;

    let outcome = if annotation::is_cordoned(cr.meta()) {
        debug!("resource is cordoned, skipping release step");
        PassOutcome::done()
    } else {
        ctx.release.ensure(&cr).await?
    };

    ctx.status
        .ensure(&cr, outcome.status_override.as_ref())
        .await?;

    publish_event(
        &ctx.recorder,
        EventType::Normal,
        "ReconciliationComplete",
        "Reconcile",
        Some(format!(
            "Reconciled release {} (chart {})",
            cr.spec.release_name, cr.spec.version
        )),
        &oref,
    )
    .await;

    {
        let mut diag = ctx.diagnostics.write().await;
        diag.last_event = Utc::now();
    }

    // A canceled pass has a dispatch in flight or a retryable failure behind
    // it; come back quickly. A converged pass only needs the periodic drift
    // check.
    let requeue = if outcome.cancelled {
        Duration::from_secs(30)
    } else {
        Duration::from_mins(5)
    };

    info!(
        cancelled = outcome.cancelled,
        requeue_after_secs = requeue.as_secs(),
        "reconciliation completed successfully"
    );

    Ok(Action::requeue(requeue))
}

/// Delete pass: remove the release, then the finalizer once the backend no
/// longer reports it.
async fn teardown(cr: &ChartRelease, ctx: &Context, oref: &ObjectReference) -> Result<Action> {
    let outcome = ctx.release.cleanup(cr).await?;

    if outcome.keep_finalizer {
        debug!("release still present, keeping finalizer");
        return Ok(Action::requeue(Duration::from_secs(30)));
    }

    remove_finalizer(&ctx.client, cr).await?;

    publish_event(
        &ctx.recorder,
        EventType::Normal,
        "ReleaseDeleted",
        "Teardown",
        Some(format!("Deleted release {}", cr.spec.release_name)),
        oref,
    )
    .await;

    info!("resource cleaned up");
    Ok(Action::await_change())
}

#[instrument(skip(object, err, ctx), fields(
    resource_name = %object.name_any(),
    resource_namespace = object.namespace().as_deref(),
    error_type = ?err,
))]
#[allow(clippy::needless_pass_by_value)]
fn error_policy(object: Arc<ChartRelease>, err: &Error, ctx: Arc<Context>) -> Action {
    let err_msg = err.to_string();

    error!(
        error = %err_msg,
        requeue_after_secs = 60,
        "reconciliation failed, scheduling retry"
    );

    let ctx_clone = ctx.clone();
    let oref = object.object_ref(&());

    tokio::spawn(async move {
        publish_event(
            &ctx_clone.recorder,
            EventType::Warning,
            "ReconciliationFailed",
            "Reconcile",
            Some(format!("Error: {err_msg}")),
            &oref,
        )
        .await;
    });

    Action::requeue(Duration::from_mins(1))
}

async fn ensure_finalizer(client: &Client, cr: &ChartRelease) -> Result<()> {
    if cr.finalizers().contains(&FINALIZER.to_string()) {
        return Ok(());
    }

    let mut finalizers = cr.finalizers().to_vec();
    finalizers.push(FINALIZER.to_string());

    debug!("adding release finalizer");
    patch_finalizers(client, cr, finalizers).await
}

async fn remove_finalizer(client: &Client, cr: &ChartRelease) -> Result<()> {
    if !cr.finalizers().contains(&FINALIZER.to_string()) {
        return Ok(());
    }

    let finalizers: Vec<String> = cr
        .finalizers()
        .iter()
        .filter(|f| *f != FINALIZER)
        .cloned()
        .collect();

    debug!("removing release finalizer");
    patch_finalizers(client, cr, finalizers).await
}

async fn patch_finalizers(
    client: &Client,
    cr: &ChartRelease,
    finalizers: Vec<String>,
) -> Result<()> {
    let ns = cr
        .namespace()
        .ok_or_else(|| Error::from("Unable to get source namespace".to_string()))?;
    let api: Api<ChartRelease> = Api::namespaced(client.clone(), &ns);

    let patch = json!({"metadata": {"finalizers": finalizers}});
    api.patch(&cr.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    Ok(())
}

/// Retries a fallible call with doubling delays, starting at one second.
async fn with_retry<T, E, F, Fut>(attempts: u32, mut op: F) -> std::result::Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = std::result::Result<T, E>>,
    E: std::fmt::Display,
{
    let mut delay = Duration::from_secs(1);
    let mut attempt = 1;

    loop {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) if attempt < attempts => {
                debug!(error = %err, attempt, "call failed, retrying");
                tokio::time::sleep(delay).await;
                delay *= 2;
                attempt += 1;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Helper function to publish a Kubernetes event
async fn publish_event(
    recorder: &Recorder,
    event_type: EventType,
    reason: impl Into<String>,
    action: impl Into<String>,
    note: Option<String>,
    oref: &ObjectReference,
) {
    let _ = recorder
        .publish(
            &Event {
                type_: event_type,
                reason: reason.into(),
                note,
                action: action.into(),
                secondary: None,
            },
            oref,
        )
        .await;
}
