//! # Amazon RDS backend
//!
//! This module provide the provisioning backend creating database instances
//! on Amazon Relational Database Service.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_rds::{
    error::DisplayErrorContext,
    operation::{
        create_db_instance::CreateDBInstanceError, delete_db_instance::DeleteDBInstanceError,
    },
    types::DbInstance,
    Client,
};
use kube::ResourceExt;
use sha2::{Digest, Sha256};
use tokio::time::{sleep, Instant};
use tracing::{debug, info, warn};

use crate::svc::{
    cfg,
    crd::database::{ManagedDatabase, PasswordSecret},
    k8s::{resource, secret},
    provider::{Credentials, Endpoint, Error, Provider},
};

// -----------------------------------------------------------------------------
// Constants

pub const AVAILABLE: &str = "available";
pub const MAX_IDENTIFIER_LENGTH: usize = 63;
pub const DIGEST_LENGTH: usize = 8;
pub const POLL_INTERVAL: Duration = Duration::from_secs(15);
pub const UNRECOVERABLE_STATUSES: [&str; 6] = [
    "failed",
    "incompatible-parameters",
    "incompatible-network",
    "incompatible-restore",
    "storage-full",
    "deleting",
];

// -----------------------------------------------------------------------------
// helpers

/// returns the rds instance identifier of the custom resource. It must start
/// with a letter, only contains ascii alphanumeric characters or hyphens,
/// never two hyphens in a row nor a trailing one and be at most 63 characters
/// long. The readable part is suffixed by a digest of the namespaced name, so
/// two resources never share an instance.
pub fn identifier(namespace: &str, name: &str) -> String {
    let raw = format!("{namespace}-{name}").to_lowercase();
    let mut id = String::with_capacity(raw.len());

    for c in raw.chars() {
        let c = if c.is_ascii_alphanumeric() { c } else { '-' };
        if c == '-' && (id.is_empty() || id.ends_with('-')) {
            continue;
        }

        id.push(c);
    }

    if !id.starts_with(|c: char| c.is_ascii_alphabetic()) {
        id.insert_str(0, "db-");
    }

    let digest = format!("{:x}", Sha256::digest(format!("{namespace}/{name}")));

    id.truncate(MAX_IDENTIFIER_LENGTH - DIGEST_LENGTH - 1);
    format!("{}-{}", id.trim_end_matches('-'), &digest[..DIGEST_LENGTH])
}

/// returns if the instance reached a status it will not leave on its own
pub fn is_unrecoverable(status: &str) -> bool {
    UNRECOVERABLE_STATUSES.contains(&status)
}

/// returns if the creation failed because the instance already exists, in
/// which case it is adopted
pub fn is_adoptable(err: Option<&CreateDBInstanceError>) -> bool {
    err.map(CreateDBInstanceError::is_db_instance_already_exists_fault)
        .unwrap_or(false)
}

/// returns if the deletion failed because the instance is already absent
pub fn is_absent(err: Option<&DeleteDBInstanceError>) -> bool {
    err.map(DeleteDBInstanceError::is_db_instance_not_found_fault)
        .unwrap_or(false)
}

/// returns the endpoint of the instance once it is available
pub fn endpoint(instance: &DbInstance) -> Option<Endpoint> {
    if instance.db_instance_status() != Some(AVAILABLE) {
        return None;
    }

    let endpoint = instance.endpoint()?;
    let port = u16::try_from(endpoint.port()?).ok()?;

    Some(Endpoint {
        hostname: endpoint.address()?.to_string(),
        port,
    })
}

fn to_i32(field: &str, value: i64) -> Result<i32, Error> {
    i32::try_from(value)
        .map_err(|_| Error::Specification(format!("field '{field}' is out of range: {value}")))
}

// -----------------------------------------------------------------------------
// Rds structure

#[derive(Clone)]
pub struct Rds {
    client: Client,
    kube: kube::Client,
    availability_timeout: Duration,
}

impl Rds {
    pub async fn new(config: &cfg::Aws, kube: kube::Client) -> Self {
        let mut loader = aws_config::defaults(BehaviorVersion::latest());
        if let Some(region) = &config.region {
            loader = loader.region(Region::new(region.to_owned()));
        }

        let sdk = loader.load().await;
        info!(
            region = sdk.region().map(ToString::to_string).unwrap_or_default(),
            "Create amazon rds client",
        );

        Self {
            client: Client::new(&sdk),
            kube,
            availability_timeout: config.availability_timeout(),
        }
    }

    async fn describe(&self, id: &str) -> Result<Option<DbInstance>, Error> {
        let output = self
            .client
            .describe_db_instances()
            .db_instance_identifier(id)
            .send()
            .await
            .map_err(|err| Error::Backend(DisplayErrorContext(&err).to_string()))?;

        Ok(output.db_instances().first().cloned())
    }

    /// polls the instance until it is available, gives up early if it reaches
    /// an unrecoverable status or once the timeout elapses
    async fn wait_until_available(&self, id: &str) -> Result<Endpoint, Error> {
        let begin = Instant::now();

        loop {
            if let Some(instance) = self.describe(id).await? {
                if let Some(endpoint) = endpoint(&instance) {
                    return Ok(endpoint);
                }

                let status = instance.db_instance_status().unwrap_or("<none>");
                if is_unrecoverable(status) {
                    return Err(Error::Backend(format!("instance '{id}' is {status}")));
                }

                debug!(
                    identifier = id,
                    status = status,
                    "Database instance is not available yet",
                );
            }

            if begin.elapsed() >= self.availability_timeout {
                return Err(Error::Unavailable(
                    id.to_string(),
                    self.availability_timeout.as_secs(),
                ));
            }

            sleep(POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl Provider for Rds {
    #[tracing::instrument(skip_all)]
    async fn create(&self, obj: &ManagedDatabase) -> Result<Endpoint, Error> {
        let (namespace, name) = resource::namespaced_name(obj);
        let spec = &obj.spec;
        let id = identifier(&namespace, &name);
        let credentials = self.resolve_credentials(&namespace, &spec.password).await?;

        let mut request = self
            .client
            .create_db_instance()
            .db_instance_identifier(&id)
            .db_instance_class(&spec.class)
            .engine(&spec.engine)
            .allocated_storage(to_i32("size", spec.size)?)
            .master_username(&spec.username)
            .master_user_password(credentials.password())
            .multi_az(spec.multi_az)
            .publicly_accessible(spec.publicly_accessible)
            .storage_encrypted(spec.storage_encrypted)
            .backup_retention_period(to_i32(
                "backupRetentionPeriod",
                spec.backup_retention_period,
            )?)
            .deletion_protection(spec.delete_protection);

        if let Some(db_name) = &spec.db_name {
            request = request.db_name(db_name);
        }

        if let Some(storage_type) = &spec.storage_type {
            request = request.storage_type(storage_type);
        }

        if let Some(iops) = spec.iops {
            request = request.iops(to_i32("iops", iops)?);
        }

        info!(
            namespace = &namespace,
            name = &name,
            identifier = &id,
            engine = &spec.engine,
            class = &spec.class,
            "Create database instance",
        );

        match request.send().await {
            Ok(_) => {}
            Err(err) if is_adoptable(err.as_service_error()) => {
                info!(
                    identifier = &id,
                    "Database instance already exists, adopt it",
                );
            }
            Err(err) => {
                return Err(Error::Backend(DisplayErrorContext(&err).to_string()));
            }
        }

        self.wait_until_available(&id).await
    }

    #[tracing::instrument(skip_all)]
    async fn delete(&self, obj: &ManagedDatabase) -> Result<(), Error> {
        let id = identifier(&obj.namespace().unwrap_or_default(), &obj.name_any());

        info!(identifier = &id, "Delete database instance");
        let result = self
            .client
            .delete_db_instance()
            .db_instance_identifier(&id)
            .skip_final_snapshot(true)
            .send()
            .await;

        match result {
            Ok(_) => Ok(()),
            Err(err) if is_absent(err.as_service_error()) => {
                warn!(identifier = &id, "Database instance is already absent");
                Ok(())
            }
            Err(err) => Err(Error::Backend(DisplayErrorContext(&err).to_string())),
        }
    }

    async fn resolve_credentials(
        &self,
        namespace: &str,
        password: &PasswordSecret,
    ) -> Result<Credentials, Error> {
        Ok(secret::lookup(self.kube.to_owned(), namespace, &password.name, &password.key)
            .await?
            .into())
    }
}
