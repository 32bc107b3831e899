//! # ConfigMap module
//!
//! This module provide helpers to publish the connection information of a
//! provisioned database in a kubernetes config map

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::ConfigMap;
use kube::{api::ObjectMeta, Client, ResourceExt};
use tracing::info;

use crate::svc::{crd::database::ManagedDatabase, k8s::resource, provider::Endpoint};

// -----------------------------------------------------------------------------
// Constants

pub const HOST_KEY: &str = "DB_HOST";
pub const PORT_KEY: &str = "DB_PORT";
pub const APP_LABEL: &str = "app";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to upsert config map '{0}/{1}', {2}")]
    Upsert(String, String, kube::Error),
}

// -----------------------------------------------------------------------------
// helpers

/// returns the payload of the config map for the given endpoint
pub fn data(endpoint: &Endpoint) -> BTreeMap<String, String> {
    BTreeMap::from([
        (HOST_KEY.to_string(), endpoint.hostname.to_owned()),
        (PORT_KEY.to_string(), endpoint.port.to_string()),
    ])
}

/// returns a new config map named after its owner, living in the same
/// namespace and carrying an owner reference to it
pub fn new(owner: &ManagedDatabase, data: BTreeMap<String, String>) -> ConfigMap {
    let name = owner.name_any();

    ConfigMap {
        metadata: ObjectMeta {
            name: Some(name.to_owned()),
            namespace: owner.namespace(),
            labels: Some(BTreeMap::from([(APP_LABEL.to_string(), name)])),
            owner_references: Some(vec![resource::owner_reference(owner)]),
            ..Default::default()
        },
        data: Some(data),
        ..Default::default()
    }
}

// -----------------------------------------------------------------------------
// ConfigPublisher trait

#[async_trait]
pub trait ConfigPublisher: Send + Sync {
    /// create the record if it is absent, update it otherwise and returns its
    /// name
    async fn publish_or_update(
        &self,
        owner: &ManagedDatabase,
        data: BTreeMap<String, String>,
    ) -> Result<String, Error>;
}

// -----------------------------------------------------------------------------
// Publisher structure

#[derive(Clone)]
pub struct Publisher {
    client: Client,
}

impl From<Client> for Publisher {
    fn from(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl ConfigPublisher for Publisher {
    async fn publish_or_update(
        &self,
        owner: &ManagedDatabase,
        data: BTreeMap<String, String>,
    ) -> Result<String, Error> {
        let cm = new(owner, data);
        let (namespace, name) = resource::namespaced_name(&cm);

        info!(
            kind = "ConfigMap",
            namespace = &namespace,
            name = &name,
            "Upsert kubernetes config map",
        );

        resource::upsert(self.client.to_owned(), &cm)
            .await
            .map(|cm| cm.name_any())
            .map_err(|err| Error::Upsert(namespace, name, err))
    }
}

#[cfg(test)]
mod tests {
    use crate::svc::crd::database::tests::database;

    use super::*;

    #[test]
    fn data_holds_host_and_decimal_port() {
        let data = data(&Endpoint {
            hostname: "db1.example.com".to_string(),
            port: 5432,
        });

        assert_eq!(data.len(), 2);
        assert_eq!(data.get(HOST_KEY).map(String::as_str), Some("db1.example.com"));
        assert_eq!(data.get(PORT_KEY).map(String::as_str), Some("5432"));
    }

    #[test]
    fn config_map_is_owned_by_the_resource() {
        let mut owner = database("default", "db1");
        owner.metadata.uid = Some("0b5e6c02-4a8b-4a8f-9a77-1f1c0c8f3f11".to_string());

        let cm = new(&owner, BTreeMap::new());
        let references = cm.metadata.owner_references.unwrap_or_default();

        assert_eq!(cm.metadata.name.as_deref(), Some("db1"));
        assert_eq!(cm.metadata.namespace.as_deref(), Some("default"));
        assert_eq!(
            cm.metadata.labels.and_then(|labels| labels.get(APP_LABEL).cloned()),
            Some("db1".to_string())
        );
        assert_eq!(references.len(), 1);
        assert_eq!(references[0].kind, "ManagedDatabase");
        assert_eq!(references[0].name, "db1");
        assert_eq!(references[0].uid, "0b5e6c02-4a8b-4a8f-9a77-1f1c0c8f3f11");
        assert_eq!(references[0].controller, Some(true));
    }
}
