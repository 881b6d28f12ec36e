//! Service controller driving the VIP engine for `type: LoadBalancer` Services

use crate::config::ControllerConfig;
use futures::StreamExt;
use k8s_openapi::api::core::v1::{LoadBalancerStatus, Service};
use kube::api::{Patch, PatchParams};
use kube::{Api, Client, ResourceExt};
use kube_runtime::controller::Action;
use kube_runtime::finalizer::{finalizer, Event as Finalizer};
use kube_runtime::{watcher, Controller};
use serde_json::json;
use std::error::Error;
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use vip_core::status::ingress_ip;
use vip_core::{load_balancer_name, Engine, ServiceRequest};

/// Finalizer holding a Service until its VIP has been released
pub const FINALIZER: &str = "vip-controller/load-balancer";

const LOAD_BALANCER_TYPE: &str = "LoadBalancer";

#[derive(Debug)]
pub struct ReconcileError(pub String);

impl fmt::Display for ReconcileError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Reconciliation error: {}", self.0)
    }
}

impl Error for ReconcileError {}

impl From<vip_core::CoreError> for ReconcileError {
    fn from(e: vip_core::CoreError) -> Self {
        ReconcileError(e.to_string())
    }
}

impl From<kube::Error> for ReconcileError {
    fn from(e: kube::Error) -> Self {
        ReconcileError(e.to_string())
    }
}

struct Context {
    client: Client,
    engine: Engine,
    config: ControllerConfig,
    cancel: CancellationToken,
}

pub struct ServiceController {
    context: Arc<Context>,
}

impl ServiceController {
    pub fn new(
        client: Client,
        engine: Engine,
        config: ControllerConfig,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            context: Arc::new(Context {
                client,
                engine,
                config,
                cancel,
            }),
        }
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        info!("Starting Service reconciliation");

        let services: Api<Service> = Api::all(self.context.client.clone());

        // stop accepting new work on cancel, but let running reconciles finish
        let mut stream = Controller::new(services, watcher::Config::default())
            .graceful_shutdown_on(shutdown_trigger(self.context.cancel.clone()))
            .run(reconcile, error_policy, self.context.clone())
            .boxed();

        // Process the reconciliation stream until the controller drains
        while let Some(item) = stream.next().await {
            match item {
                Ok((obj, _)) => debug!("Reconciled Service {}", obj),
                Err(e) => error!("Error in reconciliation stream: {}", e),
            }
        }

        info!("Service reconciliation stopped");
        Ok(())
    }
}

/// Future resolving once `cancel` fires
///
/// `graceful_shutdown_on` needs a `Send + Sync` future, so the token is
/// bridged through a oneshot channel.
fn shutdown_trigger(cancel: CancellationToken) -> impl Future<Output = ()> + Send + Sync + 'static {
    let (tx, rx) = oneshot::channel::<()>();
    tokio::spawn(async move {
        cancel.cancelled().await;
        let _ = tx.send(());
    });
    async move {
        let _ = rx.await;
    }
}

fn is_load_balancer(service: &Service) -> bool {
    service
        .spec
        .as_ref()
        .and_then(|spec| spec.type_.as_deref())
        == Some(LOAD_BALANCER_TYPE)
}

fn has_finalizer(service: &Service) -> bool {
    service.finalizers().iter().any(|f| f == FINALIZER)
}

async fn reconcile(service: Arc<Service>, ctx: Arc<Context>) -> Result<Action, ReconcileError> {
    let namespace = service.namespace().unwrap_or_else(|| "default".to_string());
    let api: Api<Service> = Api::namespaced(ctx.client.clone(), &namespace);

    if !is_load_balancer(&service) {
        if has_finalizer(&service) {
            // type changed away from LoadBalancer
            release_and_unfinalize(&api, &service, &ctx).await?;
        }
        return Ok(Action::await_change());
    }

    finalizer(&api, FINALIZER, service, |event| async {
        match event {
            Finalizer::Apply(service) => apply(&api, &service, &ctx).await,
            Finalizer::Cleanup(service) => cleanup(&service, &ctx).await,
        }
    })
    .await
    .map_err(|e| ReconcileError(e.to_string()))
}

async fn apply(
    api: &Api<Service>,
    service: &Service,
    ctx: &Context,
) -> Result<Action, ReconcileError> {
    let request = ServiceRequest::try_from(service)?;
    info!(
        namespace = %request.namespace,
        service = %request.name,
        uid = %request.uid,
        load_balancer = %load_balancer_name(&request),
        "Reconciling load balancer"
    );

    let status = ctx.engine.ensure(&request, &ctx.cancel).await?;

    let current = service
        .status
        .as_ref()
        .and_then(|status| status.load_balancer.as_ref());
    if current.and_then(|lb| ingress_ip(lb)) != ingress_ip(&status) {
        patch_status(api, &service.name_any(), &status).await?;
    }

    Ok(Action::requeue(ctx.config.requeue))
}

async fn cleanup(service: &Service, ctx: &Context) -> Result<Action, ReconcileError> {
    let request = ServiceRequest::try_from(service)?;
    ctx.engine.delete(&request, &ctx.cancel).await?;
    Ok(Action::await_change())
}

async fn release_and_unfinalize(
    api: &Api<Service>,
    service: &Service,
    ctx: &Context,
) -> Result<(), ReconcileError> {
    let request = ServiceRequest::try_from(service)?;
    ctx.engine.delete(&request, &ctx.cancel).await?;

    api.patch_status(
        &service.name_any(),
        &PatchParams::default(),
        &Patch::Merge(&cleared_status_patch()),
    )
    .await?;

    let remaining: Vec<String> = service
        .finalizers()
        .iter()
        .filter(|f| f.as_str() != FINALIZER)
        .cloned()
        .collect();
    let patch = json!({
        "metadata": {
            "finalizers": remaining,
            "resourceVersion": service.resource_version(),
        }
    });
    api.patch(&service.name_any(), &PatchParams::default(), &Patch::Merge(&patch))
        .await?;

    info!(
        namespace = %request.namespace,
        service = %request.name,
        "Service is no longer a LoadBalancer, released its address"
    );
    Ok(())
}

async fn patch_status(
    api: &Api<Service>,
    name: &str,
    status: &LoadBalancerStatus,
) -> Result<(), ReconcileError> {
    api.patch_status(name, &PatchParams::default(), &Patch::Merge(&status_patch(status)))
        .await?;
    debug!("Patched load balancer status of {}", name);
    Ok(())
}

fn status_patch(status: &LoadBalancerStatus) -> serde_json::Value {
    json!({ "status": { "loadBalancer": status } })
}

/// Merge patch removing every ingress point
///
/// An empty `LoadBalancerStatus` serializes to `{}`, which a merge patch
/// treats as "no change". Only an explicit null deletes the field.
fn cleared_status_patch() -> serde_json::Value {
    json!({ "status": { "loadBalancer": { "ingress": null } } })
}

fn error_policy(service: Arc<Service>, err: &ReconcileError, ctx: Arc<Context>) -> Action {
    warn!(
        namespace = ?service.namespace(),
        service = %service.name_any(),
        "Error reconciling Service: {}",
        err
    );
    Action::requeue(ctx.config.error_requeue)
}
