//! # Command module
//!
//! This module provide command line interface structures and helpers
use std::{path::PathBuf, sync::Arc};

use async_trait::async_trait;
use clap::{ArgAction, Parser, Subcommand};
use tracing::{error, info};

use crate::svc::{
    cfg::Configuration,
    crd::database::{ManagedDatabase, Reconciler, ReconcilerError},
    k8s::{client, definition, Context, Watcher},
    provider::Backend,
    telemetry,
};

pub mod crd;

// -----------------------------------------------------------------------------
// Executor trait

#[async_trait]
pub trait Executor {
    type Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error>;
}

// -----------------------------------------------------------------------------
// Error enum

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to execute command '{0}', {1}")]
    Execution(String, Arc<Error>),
    #[error("failed to execute command, {0}")]
    CustomResourceDefinition(crd::Error),
    #[error("failed to run daemon, {0}")]
    Daemon(DaemonError),
}

// -----------------------------------------------------------------------------
// Command enum

#[derive(Subcommand, Clone, Debug)]
pub enum Command {
    /// Interact with custom resource definition
    #[clap(name = "custom-resource-definition", aliases = &["crd"], subcommand)]
    CustomResourceDefinition(crd::CustomResourceDefinition),
}

#[async_trait]
impl Executor for Command {
    type Error = Error;

    async fn execute(&self, config: Arc<Configuration>) -> Result<(), Self::Error> {
        match self {
            Self::CustomResourceDefinition(crd) => crd
                .execute(config)
                .await
                .map_err(Error::CustomResourceDefinition)
                .map_err(|err| Error::Execution("custom-resource-definition".into(), Arc::new(err))),
        }
    }
}

// -----------------------------------------------------------------------------
// Args struct

#[derive(Parser, Clone, Debug)]
#[clap(author, version, about = env!("CARGO_PKG_DESCRIPTION"))]
pub struct Args {
    /// Increase log verbosity
    #[clap(short = 'v', global = true, action = ArgAction::Count)]
    pub verbosity: u8,
    /// Specify location of kubeconfig
    #[clap(short = 'k', long = "kubeconfig", global = true)]
    pub kubeconfig: Option<PathBuf>,
    /// Specify location of configuration
    #[clap(short = 'c', long = "config", global = true)]
    pub config: Option<PathBuf>,
    /// Check if configuration is healthy
    #[clap(short = 't', long = "check", global = true)]
    pub check: bool,
    #[clap(subcommand)]
    pub command: Option<Command>,
}

// -----------------------------------------------------------------------------
// DaemonError enum

#[derive(thiserror::Error, Debug)]
pub enum DaemonError {
    #[error("failed to create kubernetes client, {0}")]
    Client(client::Error),
    #[error("failed to bootstrap custom resource definition, {0}")]
    Definition(definition::Error),
    #[error("failed to watch managed database custom resources, {0}")]
    Watch(ReconcilerError),
}

// -----------------------------------------------------------------------------
// daemon function

pub async fn daemon(
    kubeconfig: Option<PathBuf>,
    config: Arc<Configuration>,
) -> Result<(), DaemonError> {
    // -------------------------------------------------------------------------
    // Create a new kubernetes client from path if defined, or via the
    // environment or defaults locations
    let kube_client = client::try_new(kubeconfig)
        .await
        .map_err(DaemonError::Client)?;

    // -------------------------------------------------------------------------
    // Wait for the custom resource definition to be served
    definition::ensure(
        kube_client.to_owned(),
        config.operator.install_definition,
        &config.bootstrap,
    )
    .await
    .map_err(DaemonError::Definition)?;

    // -------------------------------------------------------------------------
    // Resolve the provisioning backend, an unknown one is reported on each
    // reconciliation
    let backend = Backend::try_new(&config, kube_client.to_owned()).await;
    if let Err(err) = &backend {
        error!(
            backend = &config.provider.backend,
            error = err.to_string(),
            "Could not resolve provisioning backend",
        );
    }

    let ctx = Arc::new(Context::new(kube_client, backend));

    // -------------------------------------------------------------------------
    // Start the http server
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();
    let server = tokio::spawn(telemetry::serve(config.operator.listen, async move {
        rx.await.ok();
    }));

    // -------------------------------------------------------------------------
    // Watch custom resources until a termination signal is received
    info!("Start to listen for events of managed database custom resource");
    let result = Watcher::<ManagedDatabase>::watch(&Reconciler::default(), ctx).await;

    // -------------------------------------------------------------------------
    // Stop the http server
    tx.send(()).ok();
    match server.await {
        Ok(Ok(())) => {}
        Ok(Err(err)) => {
            error!(error = err.to_string(), "Could not serve http requests");
        }
        Err(err) => {
            error!(error = err.to_string(), "Could not wait for the http server to complete");
        }
    }

    result.map_err(DaemonError::Watch)
}
