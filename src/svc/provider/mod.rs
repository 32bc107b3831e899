//! # Provider module
//!
//! This module provide the provisioning backends able to create and delete the
//! database behind a [`ManagedDatabase`] custom resource.

use std::{
    fmt::{self, Debug, Display, Formatter},
    str::FromStr,
};

use async_trait::async_trait;
use tracing::info;

use crate::svc::{
    cfg::Configuration,
    crd::database::{ManagedDatabase, PasswordSecret},
    k8s::secret,
};

pub mod aws;

// -----------------------------------------------------------------------------
// Endpoint structure

/// network location of a provisioned database
#[derive(PartialEq, Eq, Clone, Debug)]
pub struct Endpoint {
    pub hostname: String,
    pub port: u16,
}

impl Display for Endpoint {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        write!(f, "{}:{}", self.hostname, self.port)
    }
}

// -----------------------------------------------------------------------------
// Credentials structure

#[derive(PartialEq, Eq, Clone)]
pub struct Credentials {
    password: String,
}

impl Debug for Credentials {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("password", &"<redacted>")
            .finish()
    }
}

impl From<String> for Credentials {
    fn from(password: String) -> Self {
        Self { password }
    }
}

impl Credentials {
    pub fn password(&self) -> &str {
        &self.password
    }
}

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// error reported by the backend itself, the message is shown as-is to
    /// the user through the status of the custom resource
    #[error("{0}")]
    Backend(String),
    #[error("failed to resolve credentials, {0}")]
    Credentials(secret::Error),
    #[error("invalid specification, {0}")]
    Specification(String),
    #[error("database instance '{0}' is not available after {1}s")]
    Unavailable(String, u64),
}

impl From<secret::Error> for Error {
    fn from(err: secret::Error) -> Self {
        Self::Credentials(err)
    }
}

// -----------------------------------------------------------------------------
// ResolveError enumeration

#[derive(thiserror::Error, PartialEq, Eq, Clone, Debug)]
pub enum ResolveError {
    #[error("unable to find provider for '{0}', available options are 'aws'")]
    Unknown(String),
}

// -----------------------------------------------------------------------------
// Provider trait

/// capability to provision the database described by a custom resource
#[async_trait]
pub trait Provider: Send + Sync {
    /// creates the database and returns its endpoint once reachable. Calling
    /// it again for the same custom resource adopts the existing database.
    async fn create(&self, obj: &ManagedDatabase) -> Result<Endpoint, Error>;

    /// deletes the database, an already absent database is not an error
    async fn delete(&self, obj: &ManagedDatabase) -> Result<(), Error>;

    /// read-only lookup of the credentials referenced by the custom resource
    async fn resolve_credentials(
        &self,
        namespace: &str,
        secret: &PasswordSecret,
    ) -> Result<Credentials, Error>;
}

// -----------------------------------------------------------------------------
// Kind enumeration

/// identifiers of the available provisioning backends
#[derive(PartialEq, Eq, Clone, Copy, Debug)]
pub enum Kind {
    Aws,
}

impl FromStr for Kind {
    type Err = ResolveError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "aws" => Ok(Self::Aws),
            _ => Err(ResolveError::Unknown(s.to_string())),
        }
    }
}

impl Display for Kind {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Aws => write!(f, "aws"),
        }
    }
}

// -----------------------------------------------------------------------------
// Backend enumeration

/// closed set of provisioning backends, resolved once from the configuration
pub enum Backend {
    Aws(aws::Rds),
}

impl Debug for Backend {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Aws(_) => write!(f, "Backend::Aws"),
        }
    }
}

impl Backend {
    /// resolves the backend named in the configuration
    #[tracing::instrument(skip_all)]
    pub async fn try_new(
        config: &Configuration,
        kube: kube::Client,
    ) -> Result<Self, ResolveError> {
        let kind = Kind::from_str(&config.provider.backend)?;

        info!(backend = kind.to_string(), "Resolve provisioning backend");
        Ok(match kind {
            Kind::Aws => Self::Aws(aws::Rds::new(&config.aws, kube).await),
        })
    }
}

#[async_trait]
impl Provider for Backend {
    async fn create(&self, obj: &ManagedDatabase) -> Result<Endpoint, Error> {
        match self {
            Self::Aws(rds) => rds.create(obj).await,
        }
    }

    async fn delete(&self, obj: &ManagedDatabase) -> Result<(), Error> {
        match self {
            Self::Aws(rds) => rds.delete(obj).await,
        }
    }

    async fn resolve_credentials(
        &self,
        namespace: &str,
        secret: &PasswordSecret,
    ) -> Result<Credentials, Error> {
        match self {
            Self::Aws(rds) => rds.resolve_credentials(namespace, secret).await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_from_identifier() {
        assert_eq!(Kind::from_str("aws"), Ok(Kind::Aws));
        assert_eq!(Kind::from_str(" AWS "), Ok(Kind::Aws));
    }

    #[test]
    fn unknown_identifier_is_reported() {
        let err = Kind::from_str("gcp").expect_err("gcp is not a known backend");

        assert_eq!(err, ResolveError::Unknown("gcp".to_string()));
        assert_eq!(
            err.to_string(),
            "unable to find provider for 'gcp', available options are 'aws'"
        );
    }

    #[test]
    fn credentials_are_redacted() {
        let credentials = Credentials::from("s3cr3t".to_string());

        assert_eq!(credentials.password(), "s3cr3t");
        assert!(!format!("{credentials:?}").contains("s3cr3t"));
    }

    #[test]
    fn endpoint_display() {
        let endpoint = Endpoint {
            hostname: "db1.example.com".to_string(),
            port: 5432,
        };

        assert_eq!(endpoint.to_string(), "db1.example.com:5432");
    }
}
