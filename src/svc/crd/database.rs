//! # ManagedDatabase custom resource
//!
//! This module provide the managed database custom resource, its definition
//! and the reconciler plugged in the kubernetes controller

use std::{
    fmt::{self, Display, Formatter},
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use kube::{api::Api, CustomResource, Resource, ResourceExt};
use kube::runtime::{
    controller::{self, Action as ControllerAction},
    watcher, Controller,
};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, trace, warn};

use crate::svc::{
    k8s::{self, recorder, resource, store, Context, ControllerBuilder},
    lifecycle::{self, Outcome},
};

// -----------------------------------------------------------------------------
// Constants

pub const FINALIZER: &str = "api.managed-database.io/provider";

// -----------------------------------------------------------------------------
// PasswordSecret structure

/// reference to the key of a secret holding the master password
#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Debug)]
pub struct PasswordSecret {
    #[serde(rename = "name")]
    pub name: String,
    #[serde(rename = "key")]
    pub key: String,
}

// -----------------------------------------------------------------------------
// Spec structure

#[derive(CustomResource, JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug)]
#[kube(group = "api.managed-database.io")]
#[kube(version = "v1")]
#[kube(kind = "ManagedDatabase")]
#[kube(singular = "manageddatabase")]
#[kube(plural = "manageddatabases")]
#[kube(shortname = "mdb")]
#[kube(status = "ManagedDatabaseStatus")]
#[kube(namespaced)]
#[kube(derive = "PartialEq")]
#[kube(printcolumn = r#"{"name":"State", "type":"string", "jsonPath":".status.state"}"#)]
#[kube(printcolumn = r#"{"name":"Message", "type":"string", "jsonPath":".status.message"}"#)]
#[kube(printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#)]
pub struct ManagedDatabaseSpec {
    #[serde(rename = "username")]
    pub username: String,
    #[serde(rename = "password")]
    pub password: PasswordSecret,
    #[serde(rename = "dbName", default, skip_serializing_if = "Option::is_none")]
    pub db_name: Option<String>,
    /// database engine, e.g. "postgres"
    #[serde(rename = "engine")]
    pub engine: String,
    /// instance class, e.g. "db.t3.micro"
    #[serde(rename = "class")]
    pub class: String,
    /// allocated storage in gigabytes
    #[serde(rename = "size")]
    pub size: i64,
    #[serde(rename = "multiAZ", default)]
    pub multi_az: bool,
    #[serde(rename = "publiclyAccessible", default)]
    pub publicly_accessible: bool,
    #[serde(rename = "storageEncrypted", default)]
    pub storage_encrypted: bool,
    #[serde(rename = "storageType", default, skip_serializing_if = "Option::is_none")]
    pub storage_type: Option<String>,
    #[serde(rename = "iops", default, skip_serializing_if = "Option::is_none")]
    pub iops: Option<i64>,
    /// number of days to retain backups, zero disables them
    #[serde(rename = "backupRetentionPeriod", default)]
    #[schemars(range(min = 0, max = 35))]
    pub backup_retention_period: i64,
    #[serde(rename = "deleteProtection", default)]
    pub delete_protection: bool,
}

// -----------------------------------------------------------------------------
// State enumeration

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Eq, Clone, Copy, Debug)]
pub enum State {
    New,
    DBCreating,
    DBCreatingFailed,
    CreatingConfigMap,
    Completed,
}

impl Display for State {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::New => write!(f, "New"),
            Self::DBCreating => write!(f, "DBCreating"),
            Self::DBCreatingFailed => write!(f, "DBCreatingFailed"),
            Self::CreatingConfigMap => write!(f, "CreatingConfigMap"),
            Self::Completed => write!(f, "Completed"),
        }
    }
}

impl State {
    /// no automatic transition leaves a terminal state
    pub const fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::DBCreatingFailed)
    }

    /// returns if the state machine allows to move from the given state to the
    /// other one, `None` stands for a resource without status
    pub const fn can_transition(from: Option<State>, to: State) -> bool {
        matches!(
            (from, to),
            (None, Self::New)
                | (Some(Self::New), Self::DBCreating)
                | (Some(Self::DBCreating), Self::CreatingConfigMap)
                | (Some(Self::DBCreating), Self::DBCreatingFailed)
                | (Some(Self::CreatingConfigMap), Self::Completed)
        )
    }
}

// -----------------------------------------------------------------------------
// ManagedDatabaseStatus structure

#[derive(JsonSchema, Serialize, Deserialize, PartialEq, Clone, Debug, Default)]
pub struct ManagedDatabaseStatus {
    #[serde(rename = "state", default, skip_serializing_if = "Option::is_none")]
    pub state: Option<State>,
    /// detailed message around the state
    #[serde(rename = "message", default)]
    pub message: String,
    /// name of the config map holding the connection information
    #[serde(rename = "dbConnectionConfig", default)]
    pub db_connection_config: String,
    /// name of the secret holding the credentials
    #[serde(rename = "dbCredentials", default)]
    pub db_credentials: String,
}

// -----------------------------------------------------------------------------
// Action structure

#[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Clone, Debug)]
pub enum Action {
    CreateDatabase,
    PublishConfigMap,
    AwaitConfigMap,
    DeleteDatabase,
    Reconcile,
}

impl Display for Action {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::CreateDatabase => write!(f, "CreateDatabase"),
            Self::PublishConfigMap => write!(f, "PublishConfigMap"),
            Self::AwaitConfigMap => write!(f, "AwaitConfigMap"),
            Self::DeleteDatabase => write!(f, "DeleteDatabase"),
            Self::Reconcile => write!(f, "Reconcile"),
        }
    }
}

// -----------------------------------------------------------------------------
// ReconcilerError enum

#[derive(thiserror::Error, Debug)]
pub enum ReconcilerError {
    #[error("failed to reconcile resource, {0}")]
    Reconcile(String),
    #[error("{0}")]
    Lifecycle(lifecycle::Error),
    #[error("failed to execute request on kubernetes api, {0}")]
    KubeClient(kube::Error),
}

impl From<lifecycle::Error> for ReconcilerError {
    fn from(err: lifecycle::Error) -> Self {
        Self::Lifecycle(err)
    }
}

impl From<kube::Error> for ReconcilerError {
    fn from(err: kube::Error) -> Self {
        Self::KubeClient(err)
    }
}

impl From<controller::Error<Self, watcher::Error>> for ReconcilerError {
    fn from(err: controller::Error<ReconcilerError, watcher::Error>) -> Self {
        Self::Reconcile(err.to_string())
    }
}

impl ReconcilerError {
    /// returns if a fresh attempt may succeed without any change on the
    /// resource, e.g. a status write that raced another writer
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::KubeClient(_)
                | Self::Lifecycle(lifecycle::Error::Store(
                    store::Error::Conflict(_, _) | store::Error::Kube(_)
                ))
        )
    }
}

// -----------------------------------------------------------------------------
// Reconciler structure

#[derive(Clone, Default, Debug)]
pub struct Reconciler {}

impl ControllerBuilder<ManagedDatabase> for Reconciler {
    fn build(&self, ctx: Arc<Context>) -> Controller<ManagedDatabase> {
        Controller::new(Api::all(ctx.kube.to_owned()), watcher::Config::default())
    }
}

#[async_trait]
impl k8s::Reconciler<ManagedDatabase> for Reconciler {
    type Error = ReconcilerError;

    async fn upsert(ctx: Arc<Context>, origin: Arc<ManagedDatabase>) -> Result<(), ReconcilerError> {
        let (namespace, name) = resource::namespaced_name(&*origin);

        let outcome = match ctx.lifecycle.upsert(&namespace, &name).await {
            Ok(outcome) => outcome,
            Err(err) => {
                let message = err.to_string();
                warning(&ctx, &origin, &Action::Reconcile, &message).await;
                return Err(err.into());
            }
        };

        debug!(
            kind = "ManagedDatabase",
            namespace = &namespace,
            name = &name,
            outcome = outcome.to_string(),
            "Reconciled custom resource",
        );

        match &outcome {
            Outcome::Completed(config) => {
                let message = format!("Create database and publish config map '{config}'");
                normal(&ctx, &origin, &Action::PublishConfigMap, &message).await;
            }
            Outcome::Failed(message) => {
                warning(&ctx, &origin, &Action::CreateDatabase, message).await;
            }
            Outcome::Stalled => {
                let message = "Config map is not published, the resource needs attention";
                warning(&ctx, &origin, &Action::AwaitConfigMap, message).await;
            }
            Outcome::Gone | Outcome::Skipped(_) | Outcome::Deleted => {}
        }

        Ok(())
    }

    async fn delete(ctx: Arc<Context>, origin: Arc<ManagedDatabase>) -> Result<(), ReconcilerError> {
        let outcome = ctx.lifecycle.delete(&origin).await?;

        if Outcome::Deleted == outcome {
            let message = "Delete database of custom resource";
            normal(&ctx, &origin, &Action::DeleteDatabase, message).await;
        }

        Ok(())
    }

    fn retry(
        obj: Arc<ManagedDatabase>,
        err: &ReconcilerError,
        _ctx: Arc<Context>,
    ) -> ControllerAction {
        if err.is_transient() {
            trace!(
                kind = "ManagedDatabase",
                namespace = obj.namespace().unwrap_or_default(),
                name = obj.name_any(),
                duration = 500,
                error = err.to_string(),
                "Requeue failed reconciliation",
            );
            return ControllerAction::requeue(Duration::from_millis(500));
        }

        ControllerAction::await_change()
    }
}

// -----------------------------------------------------------------------------
// helpers

async fn normal(ctx: &Context, obj: &ManagedDatabase, action: &Action, message: &str) {
    info!(
        kind = "ManagedDatabase",
        uid = obj.meta().uid.as_deref().unwrap_or_default(),
        namespace = obj.namespace().unwrap_or_default(),
        name = obj.name_any(),
        action = action.to_string(),
        message = message,
        "Create event for custom resource",
    );

    if let Err(err) = recorder::normal(ctx.kube.to_owned(), obj, action, message).await {
        warn!(
            kind = "ManagedDatabase",
            name = obj.name_any(),
            error = err.to_string(),
            "Failed to record event for custom resource",
        );
    }
}

async fn warning(ctx: &Context, obj: &ManagedDatabase, action: &Action, message: &str) {
    warn!(
        kind = "ManagedDatabase",
        uid = obj.meta().uid.as_deref().unwrap_or_default(),
        namespace = obj.namespace().unwrap_or_default(),
        name = obj.name_any(),
        action = action.to_string(),
        message = message,
        "Create event for custom resource",
    );

    if let Err(err) = recorder::warning(ctx.kube.to_owned(), obj, action, message).await {
        warn!(
            kind = "ManagedDatabase",
            name = obj.name_any(),
            error = err.to_string(),
            "Failed to record event for custom resource",
        );
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use kube::CustomResourceExt;

    use super::*;

    pub(crate) fn spec() -> ManagedDatabaseSpec {
        ManagedDatabaseSpec {
            username: "admin".to_string(),
            password: PasswordSecret {
                name: "db1-password".to_string(),
                key: "password".to_string(),
            },
            db_name: None,
            engine: "postgres".to_string(),
            class: "db.t3.micro".to_string(),
            size: 20,
            multi_az: false,
            publicly_accessible: false,
            storage_encrypted: true,
            storage_type: None,
            iops: None,
            backup_retention_period: 7,
            delete_protection: false,
        }
    }

    pub(crate) fn database(namespace: &str, name: &str) -> ManagedDatabase {
        let mut obj = ManagedDatabase::new(name, spec());
        obj.metadata.namespace = Some(namespace.to_string());
        obj
    }

    #[test]
    fn states_serialize_with_their_names() {
        for (state, name) in [
            (State::New, "New"),
            (State::DBCreating, "DBCreating"),
            (State::DBCreatingFailed, "DBCreatingFailed"),
            (State::CreatingConfigMap, "CreatingConfigMap"),
            (State::Completed, "Completed"),
        ] {
            assert_eq!(
                serde_json::to_value(state).expect("state to serialize"),
                serde_json::json!(name)
            );
            assert_eq!(state.to_string(), name);
        }
    }

    #[test]
    fn transitions_follow_the_state_machine() {
        assert!(State::can_transition(None, State::New));
        assert!(State::can_transition(Some(State::New), State::DBCreating));
        assert!(State::can_transition(
            Some(State::DBCreating),
            State::CreatingConfigMap
        ));
        assert!(State::can_transition(
            Some(State::DBCreating),
            State::DBCreatingFailed
        ));
        assert!(State::can_transition(
            Some(State::CreatingConfigMap),
            State::Completed
        ));

        assert!(!State::can_transition(None, State::DBCreating));
        assert!(!State::can_transition(Some(State::New), State::CreatingConfigMap));
        assert!(!State::can_transition(Some(State::Completed), State::New));
        assert!(!State::can_transition(
            Some(State::DBCreatingFailed),
            State::DBCreating
        ));
    }

    #[test]
    fn terminal_states() {
        assert!(State::Completed.is_terminal());
        assert!(State::DBCreatingFailed.is_terminal());
        assert!(!State::New.is_terminal());
        assert!(!State::DBCreating.is_terminal());
        assert!(!State::CreatingConfigMap.is_terminal());
    }

    #[test]
    fn spec_uses_camel_case_on_the_wire() {
        let value = serde_json::to_value(spec()).expect("spec to serialize");

        assert_eq!(value["multiAZ"], serde_json::json!(false));
        assert_eq!(value["backupRetentionPeriod"], serde_json::json!(7));
        assert_eq!(value["password"]["name"], serde_json::json!("db1-password"));
        assert!(value.get("dbName").is_none());
    }

    #[test]
    fn status_is_read_from_the_wire() {
        let status: ManagedDatabaseStatus = serde_json::from_value(serde_json::json!({
            "state": "DBCreatingFailed",
            "message": "quota exceeded",
        }))
        .expect("status to deserialize");

        assert_eq!(status.state, Some(State::DBCreatingFailed));
        assert_eq!(status.message, "quota exceeded");
        assert_eq!(status.db_connection_config, "");
    }

    #[test]
    fn definition_exposes_status_subresource() {
        let crd = ManagedDatabase::crd();

        assert_eq!(
            crd.metadata.name.as_deref(),
            Some("manageddatabases.api.managed-database.io")
        );
        assert_eq!(crd.spec.scope, "Namespaced");
        assert_eq!(crd.spec.names.short_names, Some(vec!["mdb".to_string()]));
        assert!(crd.spec.versions[0]
            .subresources
            .as_ref()
            .and_then(|subresources| subresources.status.as_ref())
            .is_some());
    }

    #[test]
    fn conflicts_are_transient() {
        let err = ReconcilerError::from(lifecycle::Error::Store(store::Error::Conflict(
            "default".to_string(),
            "db1".to_string(),
        )));
        assert!(err.is_transient());

        let err = ReconcilerError::from(lifecycle::Error::Configuration(
            crate::svc::provider::ResolveError::Unknown("gcp".to_string()),
        ));
        assert!(!err.is_transient());
    }
}
