//! # Store module
//!
//! This module provide the resource store used by the reconciler to read the
//! custom resource and to persist its status

use async_trait::async_trait;
use kube::{Client, ResourceExt};
use tracing::{debug, info};

use crate::svc::{
    crd::database::{ManagedDatabase, ManagedDatabaseStatus, FINALIZER},
    k8s::{finalizer, resource},
};

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("resource '{0}/{1}' does not exist")]
    NotFound(String, String),
    #[error("resource '{0}/{1}' has been modified concurrently")]
    Conflict(String, String),
    #[error("failed to execute request on kubernetes api, {0}")]
    Kube(kube::Error),
    #[error("failed to compute diff between the original and modified object, {0}")]
    Diff(serde_json::Error),
}

impl Error {
    /// maps errors returned by the api server on the given resource
    fn from_kube(namespace: &str, name: &str, err: kube::Error) -> Self {
        match err {
            kube::Error::Api(ref response) if response.code == 404 => {
                Self::NotFound(namespace.to_string(), name.to_string())
            }
            kube::Error::Api(ref response) if response.code == 409 => {
                Self::Conflict(namespace.to_string(), name.to_string())
            }
            err => Self::Kube(err),
        }
    }
}

// -----------------------------------------------------------------------------
// ResourceStore trait

/// typed access to the custom resource, the status is written through the
/// status subresource only
#[async_trait]
pub trait ResourceStore: Send + Sync {
    /// returns the latest version of the resource
    async fn get(&self, namespace: &str, name: &str) -> Result<ManagedDatabase, Error>;

    /// re-fetch the resource and replace its status, the write fails with a
    /// conflict if the resource changed in between
    async fn persist_status(
        &self,
        namespace: &str,
        name: &str,
        status: ManagedDatabaseStatus,
    ) -> Result<ManagedDatabase, Error>;

    /// makes sure the finalizer of the operator is set on the resource
    async fn ensure_finalizer(&self, obj: &ManagedDatabase) -> Result<ManagedDatabase, Error>;

    /// removes the finalizer of the operator from the resource
    async fn release_finalizer(&self, obj: &ManagedDatabase) -> Result<ManagedDatabase, Error>;
}

// -----------------------------------------------------------------------------
// KubeStore structure

#[derive(Clone)]
pub struct KubeStore {
    client: Client,
}

impl From<Client> for KubeStore {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

impl KubeStore {
    async fn update_finalizers(
        &self,
        origin: &ManagedDatabase,
        modified: ManagedDatabase,
    ) -> Result<ManagedDatabase, Error> {
        let (namespace, name) = resource::namespaced_name(origin);
        let patch = resource::diff(origin, &modified).map_err(Error::Diff)?;

        resource::patch(self.client.to_owned(), &modified, patch)
            .await
            .map_err(|err| Error::from_kube(&namespace, &name, err))
    }
}

#[async_trait]
impl ResourceStore for KubeStore {
    async fn get(&self, namespace: &str, name: &str) -> Result<ManagedDatabase, Error> {
        resource::get(self.client.to_owned(), namespace, name)
            .await
            .map_err(|err| Error::from_kube(namespace, name, err))?
            .ok_or_else(|| Error::NotFound(namespace.to_string(), name.to_string()))
    }

    async fn persist_status(
        &self,
        namespace: &str,
        name: &str,
        status: ManagedDatabaseStatus,
    ) -> Result<ManagedDatabase, Error> {
        let mut obj = self.get(namespace, name).await?;

        debug!(
            kind = "ManagedDatabase",
            namespace = namespace,
            name = name,
            state = status.state.map(|s| s.to_string()).unwrap_or_default(),
            version = obj.resource_version().unwrap_or_default(),
            "Persist status of custom resource",
        );

        obj.status = Some(status);
        resource::replace_status(self.client.to_owned(), &obj)
            .await
            .map_err(|err| Error::from_kube(namespace, name, err))
    }

    async fn ensure_finalizer(&self, obj: &ManagedDatabase) -> Result<ManagedDatabase, Error> {
        if finalizer::contains(obj, FINALIZER) {
            return Ok(obj.to_owned());
        }

        let (namespace, name) = resource::namespaced_name(obj);
        info!(
            kind = "ManagedDatabase",
            namespace = &namespace,
            name = &name,
            finalizer = FINALIZER,
            "Set finalizer on custom resource",
        );

        let modified = finalizer::add(obj.to_owned(), FINALIZER);
        self.update_finalizers(obj, modified).await
    }

    async fn release_finalizer(&self, obj: &ManagedDatabase) -> Result<ManagedDatabase, Error> {
        let (namespace, name) = resource::namespaced_name(obj);
        info!(
            kind = "ManagedDatabase",
            namespace = &namespace,
            name = &name,
            finalizer = FINALIZER,
            "Remove finalizer on custom resource",
        );

        let modified = finalizer::remove(obj.to_owned(), FINALIZER);
        self.update_finalizers(obj, modified).await
    }
}

#[cfg(test)]
mod tests {
    use kube::{core::ErrorResponse, Error as KubeError};

    use super::*;

    fn api_error(code: u16) -> KubeError {
        KubeError::Api(ErrorResponse {
            status: "Failure".to_string(),
            message: "rejected".to_string(),
            reason: "Test".to_string(),
            code,
        })
    }

    #[test]
    fn api_errors_are_classified() {
        assert!(matches!(
            Error::from_kube("default", "db1", api_error(404)),
            Error::NotFound(namespace, name) if namespace == "default" && name == "db1"
        ));
        assert!(matches!(
            Error::from_kube("default", "db1", api_error(409)),
            Error::Conflict(_, _)
        ));
        assert!(matches!(
            Error::from_kube("default", "db1", api_error(500)),
            Error::Kube(_)
        ));
    }
}
