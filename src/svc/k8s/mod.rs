//! # Kubernetes module
//!
//! This module provide kubernetes helpers, the resource store and the traits
//! plugging reconcilers into a kubernetes controller

use std::{error::Error, fmt::Debug, hash::Hash, sync::Arc, time::Duration};

use async_trait::async_trait;
use futures::{StreamExt, TryStreamExt};
use kube::runtime::{
    controller::{self, Action},
    watcher, Controller,
};
use kube::{CustomResourceExt, Resource, ResourceExt};
#[cfg(feature = "metrics")]
use once_cell::sync::Lazy;
#[cfg(feature = "metrics")]
use prometheus::{opts, register_counter_vec, CounterVec};
use serde::de::DeserializeOwned;
use tokio::time::Instant;
use tracing::{debug, error, info, trace};

use crate::svc::{
    lifecycle::Lifecycle,
    provider::{Backend, ResolveError},
};

pub mod client;
pub mod configmap;
pub mod definition;
pub mod finalizer;
pub mod recorder;
pub mod resource;
pub mod secret;
pub mod store;

// -----------------------------------------------------------------------------
// constants

pub const RECONCILIATION_UPSERT_EVENT: &str = "upsert";
pub const RECONCILIATION_DELETE_EVENT: &str = "delete";

// -----------------------------------------------------------------------------
// Telemetry

#[cfg(feature = "metrics")]
static RECONCILIATION_SUCCESS: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_success",
            "number of successful reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_success' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_FAILED: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_failed",
            "number of failed reconciliation"
        ),
        &["kind"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_failed' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_EVENT: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_event",
            "number of upsert or delete event",
        ),
        &["kind", "namespace", "event"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_event' to not be already registered")
});

#[cfg(feature = "metrics")]
static RECONCILIATION_DURATION: Lazy<CounterVec> = Lazy::new(|| {
    register_counter_vec!(
        opts!(
            "kubernetes_operator_reconciliation_duration",
            "duration of reconciliation",
        ),
        &["kind", "unit"]
    )
    .expect("metrics 'kubernetes_operator_reconciliation_duration' to not be already registered")
});

// -----------------------------------------------------------------------------
// Context structure

/// clients and collaborators shared by every reconciliation, built once at
/// startup
pub struct Context {
    pub kube: kube::Client,
    pub lifecycle: Lifecycle<store::KubeStore, Backend, configmap::Publisher>,
}

impl Context {
    /// wires the lifecycle on top of the kubernetes client and the resolved
    /// provisioning backend
    pub fn new(kube: kube::Client, backend: Result<Backend, ResolveError>) -> Self {
        let lifecycle = Lifecycle::new(
            store::KubeStore::from(kube.to_owned()),
            backend,
            configmap::Publisher::from(kube.to_owned()),
        );

        Self { kube, lifecycle }
    }
}

// -----------------------------------------------------------------------------
// ControllerBuilder trait

/// provides a common way to create a kubernetes
/// controller [`Controller<T>`]
pub trait ControllerBuilder<T>
where
    T: Resource + Clone + Debug,
    <T as Resource>::DynamicType: Eq + Hash,
{
    /// returns a new created kubernetes controller
    fn build(&self, ctx: Arc<Context>) -> Controller<T>;
}

// -----------------------------------------------------------------------------
// Reconciler trait

/// provides two method which is given to a kubenetes controller
/// [`Controller<T>`]
#[async_trait]
pub trait Reconciler<T>
where
    T: ResourceExt + CustomResourceExt + Debug + Clone + Send + Sync + 'static,
{
    type Error: Error + Send + Sync + 'static;

    /// create or update the object, this is part of the the reconcile function
    async fn upsert(ctx: Arc<Context>, obj: Arc<T>) -> Result<(), Self::Error>;

    /// delete the object from kubernetes and third parts
    async fn delete(ctx: Arc<Context>, obj: Arc<T>) -> Result<(), Self::Error>;

    /// returns a [`Action`] to perform following the given error
    fn retry(_obj: Arc<T>, err: &Self::Error, _ctx: Arc<Context>) -> Action {
        trace!(
            duration = 500,
            error = err.to_string(),
            "Requeue failed reconciliation"
        );
        Action::requeue(Duration::from_millis(500))
    }

    /// process the object and perform actions on kubernetes and/or the
    /// provisioning backend returns a [`Action`] to maybe perform another
    /// reconciliation or an error, if something gets wrong.
    async fn reconcile(obj: Arc<T>, ctx: Arc<Context>) -> Result<Action, Self::Error> {
        let (namespace, name) = resource::namespaced_name(&*obj);
        let api_resource = T::api_resource();

        if resource::deleted(&*obj) {
            info!(
                kind = &api_resource.kind,
                uid = obj.meta().uid.as_deref().unwrap_or_default(),
                namespace = &namespace,
                name = &name,
                "Received deletion event for custom resource",
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_EVENT
                .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_DELETE_EVENT])
                .inc();

            if let Err(err) = Self::delete(ctx, obj.to_owned()).await {
                error!(
                    kind = &api_resource.kind,
                    uid = obj.meta().uid.as_deref().unwrap_or_default(),
                    namespace = &namespace,
                    name = &name,
                    error = err.to_string(),
                    "Failed to delete custom resource",
                );
                return Err(err);
            }
        } else {
            info!(
                kind = &api_resource.kind,
                uid = obj.meta().uid.as_deref().unwrap_or_default(),
                namespace = &namespace,
                name = &name,
                "Received upsertion event for custom resource",
            );

            #[cfg(feature = "metrics")]
            RECONCILIATION_EVENT
                .with_label_values(&[&api_resource.kind, &namespace, RECONCILIATION_UPSERT_EVENT])
                .inc();

            if let Err(err) = Self::upsert(ctx, obj.to_owned()).await {
                error!(
                    kind = &api_resource.kind,
                    uid = obj.meta().uid.as_deref().unwrap_or_default(),
                    namespace = &namespace,
                    name = &name,
                    error = err.to_string(),
                    "Failed to upsert custom resource",
                );
                return Err(err);
            }
        }

        Ok(Action::await_change())
    }
}

// -----------------------------------------------------------------------------
// WatcherError trait

/// group other trait needed to provide a default
/// implementation for [`Watcher<T>`] trait
pub trait WatcherError:
    From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error
where
    Self: 'static,
{
}

/// Blanklet implementation of [`WatcherError<T>`]
impl<T> WatcherError for T
where
    T: From<kube::Error> + From<controller::Error<Self, watcher::Error>> + Error,
    Self: 'static,
{
}

// -----------------------------------------------------------------------------
// Watcher trait

/// provides a watch method that listen to events of
/// kubernetes custom resource using a [`Controller<T>`]
#[async_trait]
pub trait Watcher<T>: ControllerBuilder<T> + Reconciler<T>
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    Self: Send + Sync + 'static,
    <Self as Reconciler<T>>::Error: WatcherError + Send + Sync,
{
    type Error: WatcherError + Send + Sync;

    /// listen for events of the custom resource as generic parameter until a
    /// termination signal is received. Reconciliations in flight are allowed
    /// to finish, no new ones are started.
    async fn watch(&self, ctx: Arc<Context>) -> Result<(), <Self as Watcher<T>>::Error> {
        let api_resource = T::api_resource();
        let mut stream = self
            .build(ctx.to_owned())
            .shutdown_on_signal()
            .run(Self::reconcile, Self::retry, ctx)
            .boxed();

        loop {
            let instant = Instant::now();

            match stream.try_next().await {
                Ok(None) => {
                    info!(
                        kind = &api_resource.kind,
                        "Controller drained its reconciliations, stop to watch events"
                    );
                    return Ok(());
                }
                Ok(Some((obj, _action))) => {
                    debug!(
                        kind = &api_resource.kind,
                        namespace = obj.namespace.as_deref().unwrap_or_default(),
                        name = &obj.name,
                        "Successfully reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(controller::Error::ObjectNotFound(obj_ref)) => {
                    debug!(
                        kind = &api_resource.kind,
                        namespace = obj_ref.namespace.as_deref().unwrap_or_default(),
                        name = &obj_ref.name,
                        "Received an event about an already deleted resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_SUCCESS
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
                Err(err) => {
                    error!(
                        kind = &api_resource.kind,
                        error = err.to_string(),
                        "Failed to reconcile resource",
                    );

                    #[cfg(feature = "metrics")]
                    RECONCILIATION_FAILED
                        .with_label_values(&[&api_resource.kind])
                        .inc();
                }
            }

            #[cfg(feature = "metrics")]
            RECONCILIATION_DURATION
                .with_label_values(&[&api_resource.kind, "us"])
                .inc_by(instant.elapsed().as_micros() as f64);

            #[cfg(not(feature = "metrics"))]
            trace!(
                kind = &api_resource.kind,
                duration = instant.elapsed().as_micros() as u64,
                "Handled watch event",
            );
        }
    }
}

/// Blanklet implementation for [`Watcher<T>`]
impl<T, U> Watcher<T> for U
where
    T: DeserializeOwned + ResourceExt + CustomResourceExt + Clone + Debug + Send + Sync + 'static,
    <T as Resource>::DynamicType: Unpin + Eq + Hash + Clone + Debug + Send + Sync,
    U: Reconciler<T> + ControllerBuilder<T>,
    U::Error: WatcherError + Send + Sync,
    Self: Send + Sync + 'static,
{
    type Error = U::Error;
}
