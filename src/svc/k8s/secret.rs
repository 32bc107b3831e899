//! # Secret module
//!
//! This module provide helpers to read values out of kubernetes secrets

use k8s_openapi::api::core::v1::Secret;
use kube::Client;
use tracing::debug;

use crate::svc::k8s::resource;

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to retrieve secret '{0}/{1}', {2}")]
    Get(String, String, kube::Error),
    #[error("secret '{0}/{1}' does not exist")]
    NotFound(String, String),
    #[error("failed to find key '{0}' in secret '{1}/{2}'")]
    Key(String, String, String),
    #[error("failed to decode key '{0}' in secret '{1}/{2}' as utf-8")]
    Encoding(String, String, String),
}

// -----------------------------------------------------------------------------
// helpers

/// returns the value of the given key, looking at `stringData` first as it
/// takes precedence over `data` for kubernetes
pub fn value(secret: &Secret, key: &str) -> Result<String, Error> {
    let (namespace, name) = resource::namespaced_name(secret);

    if let Some(value) = secret
        .string_data
        .as_ref()
        .and_then(|string_data| string_data.get(key))
    {
        return Ok(value.to_owned());
    }

    match secret.data.as_ref().and_then(|data| data.get(key)) {
        Some(bytes) => String::from_utf8(bytes.0.to_owned())
            .map_err(|_| Error::Encoding(key.to_string(), namespace, name)),
        None => Err(Error::Key(key.to_string(), namespace, name)),
    }
}

/// retrieve the secret and returns the value of the given key
pub async fn lookup(client: Client, namespace: &str, name: &str, key: &str) -> Result<String, Error> {
    debug!(
        kind = "Secret",
        namespace = namespace,
        name = name,
        key = key,
        "Lookup value in secret",
    );

    let secret: Secret = resource::get(client, namespace, name)
        .await
        .map_err(|err| Error::Get(namespace.to_string(), name.to_string(), err))?
        .ok_or_else(|| Error::NotFound(namespace.to_string(), name.to_string()))?;

    value(&secret, key)
}
