//! # Definition module
//!
//! This module provide helpers to install the custom resource definition and
//! to wait for it to be served by the api server before watching resources

use std::time::Duration;

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::{
    api::{Api, Patch, PatchParams},
    Client, CustomResourceExt,
};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::svc::{cfg::Bootstrap, crd::database::ManagedDatabase};

// -----------------------------------------------------------------------------
// Constants

pub const FIELD_MANAGER: &str = env!("CARGO_PKG_NAME");
pub const ESTABLISHED: &str = "Established";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to install custom resource definition '{0}', {1}")]
    Install(String, kube::Error),
    #[error("custom resource definition '{0}' is not available after {1}ms")]
    Timeout(String, u128),
}

// -----------------------------------------------------------------------------
// helpers

/// returns the name of the custom resource definition
pub fn name() -> String {
    ManagedDatabase::crd_name().to_string()
}

/// returns if the api server accepted the names of the definition and serves
/// the resource
pub fn established(crd: &CustomResourceDefinition) -> bool {
    crd.status
        .as_ref()
        .and_then(|status| status.conditions.as_ref())
        .map(|conditions| {
            conditions
                .iter()
                .any(|c| c.type_ == ESTABLISHED && c.status == "True")
        })
        .unwrap_or(false)
}

/// returns the next delay of the exponential backoff
pub fn backoff(delay: Duration, max: Duration) -> Duration {
    delay.saturating_mul(2).min(max)
}

/// install or update the custom resource definition using server side apply
#[tracing::instrument(skip_all)]
pub async fn install(client: Client) -> Result<CustomResourceDefinition, Error> {
    let name = name();
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!(name = &name, "Install custom resource definition");
    Api::<CustomResourceDefinition>::all(client)
        .patch(&name, &params, &Patch::Apply(&ManagedDatabase::crd()))
        .await
        .map_err(|err| Error::Install(name, err))
}

/// wait for the custom resource definition to be established, waiting
/// longer between each attempt. Gives up once the maximum wait is reached.
#[tracing::instrument(skip_all)]
pub async fn wait_until_available(
    client: Client,
    bootstrap: &Bootstrap,
) -> Result<CustomResourceDefinition, Error> {
    let name = name();
    let api = Api::<CustomResourceDefinition>::all(client);
    let begin = Instant::now();
    let mut delay = bootstrap.initial_delay();

    loop {
        match api.get_opt(&name).await {
            Ok(Some(crd)) if established(&crd) => {
                info!(name = &name, "Custom resource definition is available");
                return Ok(crd);
            }
            Ok(Some(_)) => {
                debug!(name = &name, "Custom resource definition is not established yet");
            }
            Ok(None) => {
                debug!(name = &name, "Custom resource definition does not exist yet");
            }
            Err(err) => {
                warn!(
                    name = &name,
                    error = err.to_string(),
                    "Failed to retrieve custom resource definition",
                );
            }
        }

        let elapsed = begin.elapsed();
        if elapsed >= bootstrap.max_wait() {
            return Err(Error::Timeout(name, elapsed.as_millis()));
        }

        sleep(delay.min(bootstrap.max_wait() - elapsed)).await;
        delay = backoff(delay, bootstrap.max_delay());
    }
}

/// makes sure the custom resource definition is served, installing it first
/// if asked to
pub async fn ensure(
    client: Client,
    install_definition: bool,
    bootstrap: &Bootstrap,
) -> Result<CustomResourceDefinition, Error> {
    if install_definition {
        install(client.to_owned()).await?;
    }

    wait_until_available(client, bootstrap).await
}
