//! # Lifecycle module
//!
//! This module provide the state machine moving a [`ManagedDatabase`] from its
//! first observation to a provisioned database with published connection
//! information.
//!
//! ```text
//! (none) -> New -> DBCreating -> CreatingConfigMap -> Completed
//!                            \-> DBCreatingFailed
//! ```
//!
//! The status is persisted before the side effect of the next state, so that
//! the resource always shows what is being attempted. Any failure to persist
//! the status aborts the reconciliation, the next notification retries with
//! fresh state.

use std::fmt::{self, Display, Formatter};

use tracing::{debug, error, info, warn};

use crate::svc::{
    crd::database::{ManagedDatabase, ManagedDatabaseStatus, State, FINALIZER},
    k8s::{
        configmap::{self, ConfigPublisher},
        finalizer, resource,
        store::{self, ResourceStore},
    },
    provider::{Provider, ResolveError},
};

// -----------------------------------------------------------------------------
// Constants

pub const MESSAGE_NEW: &str = "Looking around...";
pub const MESSAGE_DB_CREATING: &str = "Attempting to Create a DB";
pub const MESSAGE_CREATING_CONFIG_MAP: &str = "DB Created - creating ConfigMap";
pub const MESSAGE_COMPLETED: &str = "ConfigMap Created";

// -----------------------------------------------------------------------------
// Error enumeration

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("failed to interact with resource store, {0}")]
    Store(store::Error),
    #[error("failed to resolve provisioning backend, {0}")]
    Configuration(ResolveError),
    #[error("failed to publish connection information, {0}")]
    Publish(configmap::Error),
    #[error("refuse to move resource from state '{0}' to '{1}'")]
    Transition(String, State),
}

impl From<store::Error> for Error {
    fn from(err: store::Error) -> Self {
        Self::Store(err)
    }
}

// -----------------------------------------------------------------------------
// Outcome enumeration

/// result of a reconciliation that did not fail
#[derive(PartialEq, Eq, Clone, Debug)]
pub enum Outcome {
    /// the resource does not exist anymore or is being deleted
    Gone,
    /// the resource is in a terminal state, nothing has been done
    Skipped(State),
    /// the resource is waiting on the config map step and needs attention
    Stalled,
    /// the database is provisioned and its config map is published
    Completed(String),
    /// the provisioning backend refused to create the database
    Failed(String),
    /// the backing database has been released with the resource
    Deleted,
}

impl Display for Outcome {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            Self::Gone => write!(f, "Gone"),
            Self::Skipped(state) => write!(f, "Skipped({state})"),
            Self::Stalled => write!(f, "Stalled"),
            Self::Completed(name) => write!(f, "Completed({name})"),
            Self::Failed(message) => write!(f, "Failed({message})"),
            Self::Deleted => write!(f, "Deleted"),
        }
    }
}

// -----------------------------------------------------------------------------
// Lifecycle structure

/// drives the resource through its states using the given collaborators,
/// they are built once at startup and shared by every reconciliation
pub struct Lifecycle<S, P, C> {
    store: S,
    provider: Result<P, ResolveError>,
    publisher: C,
}

impl<S, P, C> Lifecycle<S, P, C>
where
    S: ResourceStore,
    P: Provider,
    C: ConfigPublisher,
{
    pub fn new(store: S, provider: Result<P, ResolveError>, publisher: C) -> Self {
        Self {
            store,
            provider,
            publisher,
        }
    }

    /// converge the resource with the given namespace and name
    #[tracing::instrument(skip(self))]
    pub async fn upsert(&self, namespace: &str, name: &str) -> Result<Outcome, Error> {
        let mut obj = match self.store.get(namespace, name).await {
            Ok(obj) => obj,
            Err(store::Error::NotFound(_, _)) => {
                debug!(
                    namespace = namespace,
                    name = name,
                    "Resource disappeared before its reconciliation, skip",
                );
                return Ok(Outcome::Gone);
            }
            Err(err) => return Err(err.into()),
        };

        if resource::deleted(&obj) {
            return Ok(Outcome::Gone);
        }

        match current(&obj) {
            Some(state) if state.is_terminal() => {
                debug!(
                    namespace = namespace,
                    name = name,
                    state = state.to_string(),
                    "Resource is in a terminal state, skip",
                );
                return Ok(Outcome::Skipped(state));
            }
            Some(State::CreatingConfigMap) => {
                warn!(
                    namespace = namespace,
                    name = name,
                    "Resource is waiting on its config map, it needs attention",
                );
                return Ok(Outcome::Stalled);
            }
            _ => {}
        }

        let provider = self
            .provider
            .as_ref()
            .map_err(|err| Error::Configuration(err.to_owned()))?;

        obj = self.store.ensure_finalizer(&obj).await?;

        loop {
            match current(&obj) {
                None => {
                    let credentials = obj.spec.password.name.to_owned();
                    obj = self
                        .transition(&obj, State::New, MESSAGE_NEW, |status| {
                            status.db_credentials = credentials;
                        })
                        .await?;
                }
                Some(State::New) => {
                    obj = self
                        .transition(&obj, State::DBCreating, MESSAGE_DB_CREATING, |_| {})
                        .await?;
                }
                Some(State::DBCreating) => return self.provision(provider, obj).await,
                Some(State::CreatingConfigMap) => return Ok(Outcome::Stalled),
                Some(state) => return Ok(Outcome::Skipped(state)),
            }
        }
    }

    /// create the database then publish its connection information, the
    /// resource is expected to be in the `DBCreating` state
    async fn provision(&self, provider: &P, obj: ManagedDatabase) -> Result<Outcome, Error> {
        let (namespace, name) = resource::namespaced_name(&obj);

        info!(
            namespace = &namespace,
            name = &name,
            engine = &obj.spec.engine,
            "Create database for custom resource",
        );

        let endpoint = match provider.create(&obj).await {
            Ok(endpoint) => endpoint,
            Err(err) => {
                let message = err.to_string();

                error!(
                    namespace = &namespace,
                    name = &name,
                    error = &message,
                    "Failed to create database for custom resource",
                );

                self.transition(&obj, State::DBCreatingFailed, &message, |_| {})
                    .await?;
                return Ok(Outcome::Failed(message));
            }
        };

        info!(
            namespace = &namespace,
            name = &name,
            endpoint = endpoint.to_string(),
            "Database is available",
        );

        let obj = self
            .transition(
                &obj,
                State::CreatingConfigMap,
                MESSAGE_CREATING_CONFIG_MAP,
                |_| {},
            )
            .await?;

        let config = self
            .publisher
            .publish_or_update(&obj, configmap::data(&endpoint))
            .await
            .map_err(Error::Publish)?;

        self.transition(&obj, State::Completed, MESSAGE_COMPLETED, |status| {
            status.db_connection_config = config.to_owned();
        })
        .await?;

        Ok(Outcome::Completed(config))
    }

    /// release the backing database of a resource being deleted
    #[tracing::instrument(skip_all)]
    pub async fn delete(&self, obj: &ManagedDatabase) -> Result<Outcome, Error> {
        let (namespace, name) = resource::namespaced_name(obj);

        if !finalizer::contains(obj, FINALIZER) {
            debug!(
                namespace = &namespace,
                name = &name,
                "Resource does not hold the finalizer, nothing to release",
            );
            return Ok(Outcome::Gone);
        }

        let provider = self
            .provider
            .as_ref()
            .map_err(|err| Error::Configuration(err.to_owned()))?;

        info!(
            namespace = &namespace,
            name = &name,
            "Delete database for custom resource",
        );

        if let Err(err) = provider.delete(obj).await {
            error!(
                namespace = &namespace,
                name = &name,
                error = err.to_string(),
                "Failed to delete database for custom resource, release it anyway",
            );
        }

        self.store.release_finalizer(obj).await?;
        Ok(Outcome::Deleted)
    }

    /// persist the next state after checking the move is allowed, fields
    /// that are not overridden are carried from the current status
    async fn transition<F>(
        &self,
        obj: &ManagedDatabase,
        to: State,
        message: &str,
        f: F,
    ) -> Result<ManagedDatabase, Error>
    where
        F: FnOnce(&mut ManagedDatabaseStatus) + Send,
    {
        let (namespace, name) = resource::namespaced_name(obj);
        let from = current(obj);

        if !State::can_transition(from, to) {
            let from = from.map(|s| s.to_string());
            return Err(Error::Transition(
                from.unwrap_or_else(|| "<none>".to_string()),
                to,
            ));
        }

        let mut status = obj.status.to_owned().unwrap_or_default();
        status.state = Some(to);
        status.message = message.to_string();
        f(&mut status);

        debug!(
            namespace = &namespace,
            name = &name,
            from = from.map(|s| s.to_string()).unwrap_or_default(),
            to = to.to_string(),
            "Move custom resource to next state",
        );

        Ok(self.store.persist_status(&namespace, &name, status).await?)
    }
}

fn current(obj: &ManagedDatabase) -> Option<State> {
    obj.status.as_ref().and_then(|status| status.state)
}

#[cfg(test)]
mod tests {
    use std::{
        collections::BTreeMap,
        sync::{Arc, Mutex},
    };

    use async_trait::async_trait;
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use kube::{core::ErrorResponse, ResourceExt};

    use super::*;
    use crate::svc::{
        crd::database::{tests::database, PasswordSecret},
        provider::{self, Credentials, Endpoint},
    };

    type Key = (String, String);

    fn key(namespace: &str, name: &str) -> Key {
        (namespace.to_string(), name.to_string())
    }

    // -------------------------------------------------------------------------
    // In memory resource store

    #[derive(Clone, Default)]
    struct MemoryStore {
        objects: Arc<Mutex<BTreeMap<Key, ManagedDatabase>>>,
        history: Arc<Mutex<Vec<(Key, State)>>>,
        conflicts: Arc<Mutex<bool>>,
    }

    impl MemoryStore {
        fn insert(&self, obj: ManagedDatabase) {
            let (namespace, name) = resource::namespaced_name(&obj);
            self.objects
                .lock()
                .expect("lock to be healthy")
                .insert(key(&namespace, &name), obj);
        }

        fn object(&self, namespace: &str, name: &str) -> ManagedDatabase {
            self.objects
                .lock()
                .expect("lock to be healthy")
                .get(&key(namespace, name))
                .cloned()
                .expect("object to exist")
        }

        fn states(&self, namespace: &str, name: &str) -> Vec<State> {
            self.history
                .lock()
                .expect("lock to be healthy")
                .iter()
                .filter(|(k, _)| k == &key(namespace, name))
                .map(|(_, state)| *state)
                .collect()
        }

        fn reject_writes(&self) {
            *self.conflicts.lock().expect("lock to be healthy") = true;
        }
    }

    #[async_trait]
    impl ResourceStore for MemoryStore {
        async fn get(&self, namespace: &str, name: &str) -> Result<ManagedDatabase, store::Error> {
            self.objects
                .lock()
                .expect("lock to be healthy")
                .get(&key(namespace, name))
                .cloned()
                .ok_or_else(|| store::Error::NotFound(namespace.to_string(), name.to_string()))
        }

        async fn persist_status(
            &self,
            namespace: &str,
            name: &str,
            status: ManagedDatabaseStatus,
        ) -> Result<ManagedDatabase, store::Error> {
            if *self.conflicts.lock().expect("lock to be healthy") {
                return Err(store::Error::Conflict(namespace.to_string(), name.to_string()));
            }

            let mut objects = self.objects.lock().expect("lock to be healthy");
            let obj = objects
                .get_mut(&key(namespace, name))
                .ok_or_else(|| store::Error::NotFound(namespace.to_string(), name.to_string()))?;

            if let Some(state) = status.state {
                self.history
                    .lock()
                    .expect("lock to be healthy")
                    .push((key(namespace, name), state));
            }

            obj.status = Some(status);
            Ok(obj.to_owned())
        }

        async fn ensure_finalizer(
            &self,
            obj: &ManagedDatabase,
        ) -> Result<ManagedDatabase, store::Error> {
            let modified = finalizer::add(obj.to_owned(), FINALIZER);
            self.insert(modified.to_owned());
            Ok(modified)
        }

        async fn release_finalizer(
            &self,
            obj: &ManagedDatabase,
        ) -> Result<ManagedDatabase, store::Error> {
            let modified = finalizer::remove(obj.to_owned(), FINALIZER);
            self.insert(modified.to_owned());
            Ok(modified)
        }
    }

    // -------------------------------------------------------------------------
    // Scripted provider

    #[derive(Clone, Default)]
    struct ScriptedProvider {
        failures: BTreeMap<String, String>,
        creates: Arc<Mutex<Vec<String>>>,
        deletes: Arc<Mutex<Vec<String>>>,
        failing_delete: bool,
    }

    impl ScriptedProvider {
        fn failing(name: &str, message: &str) -> Self {
            Self {
                failures: BTreeMap::from([(name.to_string(), message.to_string())]),
                ..Default::default()
            }
        }

        fn creates(&self) -> Vec<String> {
            self.creates.lock().expect("lock to be healthy").to_owned()
        }

        fn deletes(&self) -> Vec<String> {
            self.deletes.lock().expect("lock to be healthy").to_owned()
        }
    }

    #[async_trait]
    impl Provider for ScriptedProvider {
        async fn create(&self, obj: &ManagedDatabase) -> Result<Endpoint, provider::Error> {
            let name = obj.name_any();
            self.creates
                .lock()
                .expect("lock to be healthy")
                .push(name.to_owned());

            if let Some(message) = self.failures.get(&name) {
                return Err(provider::Error::Backend(message.to_owned()));
            }

            Ok(Endpoint {
                hostname: format!("{name}.cluster.eu-west-3.rds.amazonaws.com"),
                port: 5432,
            })
        }

        async fn delete(&self, obj: &ManagedDatabase) -> Result<(), provider::Error> {
            self.deletes
                .lock()
                .expect("lock to be healthy")
                .push(obj.name_any());

            if self.failing_delete {
                return Err(provider::Error::Backend("throttled".to_string()));
            }

            // an absent database is a success
            Ok(())
        }

        async fn resolve_credentials(
            &self,
            _namespace: &str,
            _secret: &PasswordSecret,
        ) -> Result<Credentials, provider::Error> {
            Ok(Credentials::from("s3cr3t".to_string()))
        }
    }

    // -------------------------------------------------------------------------
    // In memory config publisher

    #[derive(Clone, Default)]
    struct MemoryPublisher {
        records: Arc<Mutex<BTreeMap<Key, BTreeMap<String, String>>>>,
        failing: bool,
    }

    impl MemoryPublisher {
        fn record(&self, namespace: &str, name: &str) -> Option<BTreeMap<String, String>> {
            self.records
                .lock()
                .expect("lock to be healthy")
                .get(&key(namespace, name))
                .cloned()
        }

        fn len(&self) -> usize {
            self.records.lock().expect("lock to be healthy").len()
        }
    }

    #[async_trait]
    impl ConfigPublisher for MemoryPublisher {
        async fn publish_or_update(
            &self,
            owner: &ManagedDatabase,
            data: BTreeMap<String, String>,
        ) -> Result<String, configmap::Error> {
            let (namespace, name) = resource::namespaced_name(owner);

            if self.failing {
                return Err(configmap::Error::Upsert(
                    namespace,
                    name,
                    kube::Error::Api(ErrorResponse {
                        status: "Failure".to_string(),
                        message: "forbidden".to_string(),
                        reason: "Forbidden".to_string(),
                        code: 403,
                    }),
                ));
            }

            self.records
                .lock()
                .expect("lock to be healthy")
                .insert(key(&namespace, &name), data);

            Ok(name)
        }
    }

    // -------------------------------------------------------------------------
    // helpers

    type TestLifecycle = Lifecycle<MemoryStore, ScriptedProvider, MemoryPublisher>;

    fn lifecycle(
        store: &MemoryStore,
        provider: &ScriptedProvider,
        publisher: &MemoryPublisher,
    ) -> TestLifecycle {
        Lifecycle::new(
            store.to_owned(),
            Ok(provider.to_owned()),
            publisher.to_owned(),
        )
    }

    fn with_state(mut obj: ManagedDatabase, state: State) -> ManagedDatabase {
        obj.status = Some(ManagedDatabaseStatus {
            state: Some(state),
            message: "previous message".to_string(),
            db_credentials: obj.spec.password.name.to_owned(),
            ..Default::default()
        });
        obj
    }

    fn fixtures() -> (MemoryStore, ScriptedProvider, MemoryPublisher) {
        Default::default()
    }

    fn is_ordered(states: &[State]) -> bool {
        let mut previous: Option<State> = None;
        for state in states {
            if !State::can_transition(previous, *state) {
                return false;
            }
            previous = Some(*state);
        }

        true
    }

    // -------------------------------------------------------------------------
    // tests

    #[tokio::test]
    async fn new_resource_reaches_completed() {
        let (store, provider, publisher) = fixtures();
        store.insert(database("default", "db1"));

        let outcome = lifecycle(&store, &provider, &publisher)
            .upsert("default", "db1")
            .await
            .expect("reconciliation to succeed");

        assert_eq!(outcome, Outcome::Completed("db1".to_string()));
        assert_eq!(
            store.states("default", "db1"),
            vec![
                State::New,
                State::DBCreating,
                State::CreatingConfigMap,
                State::Completed
            ]
        );

        let record = publisher
            .record("default", "db1")
            .expect("config map to be published");
        assert_eq!(
            record.get(configmap::HOST_KEY).map(String::as_str),
            Some("db1.cluster.eu-west-3.rds.amazonaws.com")
        );
        assert_eq!(record.get(configmap::PORT_KEY).map(String::as_str), Some("5432"));

        let status = store.object("default", "db1").status.expect("status to be set");
        assert_eq!(status.state, Some(State::Completed));
        assert_eq!(status.message, MESSAGE_COMPLETED);
        assert_eq!(status.db_connection_config, "db1");
        assert_eq!(status.db_credentials, "db1-password");
        assert!(finalizer::contains(&store.object("default", "db1"), FINALIZER));
    }

    #[tokio::test]
    async fn provider_failure_is_terminal() {
        let store = MemoryStore::default();
        let provider = ScriptedProvider::failing("db2", "quota exceeded");
        let publisher = MemoryPublisher::default();
        store.insert(database("default", "db2"));

        let lifecycle = lifecycle(&store, &provider, &publisher);
        let outcome = lifecycle
            .upsert("default", "db2")
            .await
            .expect("reconciliation to succeed");

        assert_eq!(outcome, Outcome::Failed("quota exceeded".to_string()));

        let status = store.object("default", "db2").status.expect("status to be set");
        assert_eq!(status.state, Some(State::DBCreatingFailed));
        assert_eq!(status.message, "quota exceeded");
        assert_eq!(publisher.record("default", "db2"), None);

        // a re-delivered notification does not retry the creation
        let outcome = lifecycle
            .upsert("default", "db2")
            .await
            .expect("reconciliation to succeed");

        assert_eq!(outcome, Outcome::Skipped(State::DBCreatingFailed));
        assert_eq!(provider.creates(), vec!["db2".to_string()]);
    }

    #[tokio::test]
    async fn completed_resource_is_not_provisioned_again() {
        let (store, provider, publisher) = fixtures();
        store.insert(database("default", "db1"));

        let lifecycle = lifecycle(&store, &provider, &publisher);
        lifecycle
            .upsert("default", "db1")
            .await
            .expect("reconciliation to succeed");

        for _ in 0..3 {
            let outcome = lifecycle
                .upsert("default", "db1")
                .await
                .expect("reconciliation to succeed");

            assert_eq!(outcome, Outcome::Skipped(State::Completed));
        }

        assert_eq!(provider.creates().len(), 1);
        assert_eq!(publisher.len(), 1);
        assert_eq!(store.states("default", "db1").len(), 4);
    }

    #[tokio::test]
    async fn persisted_states_are_ordered() {
        let store = MemoryStore::default();
        let provider = ScriptedProvider::failing("db2", "quota exceeded");
        let publisher = MemoryPublisher::default();
        store.insert(database("default", "db1"));
        store.insert(database("default", "db2"));

        let lifecycle = lifecycle(&store, &provider, &publisher);
        for name in ["db1", "db2", "db1", "db2"] {
            lifecycle
                .upsert("default", name)
                .await
                .expect("reconciliation to succeed");
        }

        assert!(is_ordered(&store.states("default", "db1")));
        assert_eq!(
            store.states("default", "db2"),
            vec![State::New, State::DBCreating, State::DBCreatingFailed]
        );
    }

    #[tokio::test]
    async fn interrupted_creation_is_attempted_again() {
        let (store, provider, publisher) = fixtures();
        store.insert(with_state(database("default", "db1"), State::DBCreating));

        let outcome = lifecycle(&store, &provider, &publisher)
            .upsert("default", "db1")
            .await
            .expect("reconciliation to succeed");

        assert_eq!(outcome, Outcome::Completed("db1".to_string()));
        assert_eq!(provider.creates(), vec!["db1".to_string()]);
        assert_eq!(
            store.states("default", "db1"),
            vec![State::CreatingConfigMap, State::Completed]
        );
    }

    #[tokio::test]
    async fn resource_in_new_state_continues() {
        let (store, provider, publisher) = fixtures();
        store.insert(with_state(database("default", "db1"), State::New));

        lifecycle(&store, &provider, &publisher)
            .upsert("default", "db1")
            .await
            .expect("reconciliation to succeed");

        assert_eq!(
            store.states("default", "db1"),
            vec![State::DBCreating, State::CreatingConfigMap, State::Completed]
        );
        assert_eq!(
            store
                .object("default", "db1")
                .status
                .map(|status| status.db_credentials),
            Some("db1-password".to_string())
        );
    }

    #[tokio::test]
    async fn failure_of_one_resource_does_not_affect_another() {
        let store = MemoryStore::default();
        let provider = ScriptedProvider::failing("a", "quota exceeded");
        let publisher = MemoryPublisher::default();
        store.insert(database("default", "a"));
        store.insert(database("default", "b"));

        let lifecycle = lifecycle(&store, &provider, &publisher);
        let a = lifecycle.upsert("default", "a").await;
        let b = lifecycle.upsert("default", "b").await;

        assert!(matches!(a, Ok(Outcome::Failed(_))));
        assert_eq!(
            b.expect("reconciliation to succeed"),
            Outcome::Completed("b".to_string())
        );
        assert_eq!(publisher.record("default", "a"), None);
        assert!(publisher.record("default", "b").is_some());
    }

    #[tokio::test]
    async fn same_name_in_distinct_namespaces_are_independent() {
        let (store, provider, publisher) = fixtures();
        store.insert(database("team-a", "db1"));
        store.insert(database("team-b", "db1"));

        let lifecycle = lifecycle(&store, &provider, &publisher);
        let (a, b) = tokio::join!(
            lifecycle.upsert("team-a", "db1"),
            lifecycle.upsert("team-b", "db1")
        );

        assert_eq!(a.expect("reconciliation to succeed"), Outcome::Completed("db1".to_string()));
        assert_eq!(b.expect("reconciliation to succeed"), Outcome::Completed("db1".to_string()));
        assert_eq!(store.states("team-a", "db1").len(), 4);
        assert_eq!(store.states("team-b", "db1").len(), 4);
    }

    #[tokio::test]
    async fn missing_resource_is_ignored() {
        let (store, provider, publisher) = fixtures();

        let outcome = lifecycle(&store, &provider, &publisher)
            .upsert("default", "ghost")
            .await
            .expect("reconciliation to succeed");

        assert_eq!(outcome, Outcome::Gone);
        assert!(provider.creates().is_empty());
    }

    #[tokio::test]
    async fn conflict_aborts_before_any_side_effect() {
        let (store, provider, publisher) = fixtures();
        store.insert(database("default", "db1"));
        store.reject_writes();

        let result = lifecycle(&store, &provider, &publisher)
            .upsert("default", "db1")
            .await;

        assert!(matches!(
            result,
            Err(Error::Store(store::Error::Conflict(_, _)))
        ));
        assert!(provider.creates().is_empty());
        assert_eq!(publisher.len(), 0);
        assert_eq!(store.object("default", "db1").status, None);
    }

    #[tokio::test]
    async fn publish_failure_leaves_resource_waiting_on_config_map() {
        let store = MemoryStore::default();
        let provider = ScriptedProvider::default();
        let publisher = MemoryPublisher {
            failing: true,
            ..Default::default()
        };
        store.insert(database("default", "db1"));

        let lifecycle = lifecycle(&store, &provider, &publisher);
        let result = lifecycle.upsert("default", "db1").await;

        assert!(matches!(result, Err(Error::Publish(_))));
        assert_eq!(
            store.object("default", "db1").status.and_then(|s| s.state),
            Some(State::CreatingConfigMap)
        );

        let outcome = lifecycle
            .upsert("default", "db1")
            .await
            .expect("reconciliation to succeed");

        assert_eq!(outcome, Outcome::Stalled);
        assert_eq!(provider.creates().len(), 1);
    }

    #[tokio::test]
    async fn unknown_backend_is_reported_per_resource() {
        let store = MemoryStore::default();
        let publisher = MemoryPublisher::default();
        store.insert(database("default", "db1"));

        let lifecycle: TestLifecycle = Lifecycle::new(
            store.to_owned(),
            Err(ResolveError::Unknown("gcp".to_string())),
            publisher,
        );

        for _ in 0..2 {
            let result = lifecycle.upsert("default", "db1").await;
            assert!(matches!(
                result,
                Err(Error::Configuration(ResolveError::Unknown(_)))
            ));
        }

        assert_eq!(store.object("default", "db1").status, None);
    }

    #[tokio::test]
    async fn delete_releases_database_once() {
        let (store, provider, publisher) = fixtures();
        store.insert(database("default", "db1"));

        let lifecycle = lifecycle(&store, &provider, &publisher);
        lifecycle
            .upsert("default", "db1")
            .await
            .expect("reconciliation to succeed");

        let mut obj = store.object("default", "db1");
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        store.insert(obj.to_owned());

        // a status event received while deleting does nothing
        assert_eq!(
            lifecycle
                .upsert("default", "db1")
                .await
                .expect("reconciliation to succeed"),
            Outcome::Gone
        );

        let outcome = lifecycle.delete(&obj).await.expect("deletion to succeed");
        assert_eq!(outcome, Outcome::Deleted);
        assert!(!finalizer::contains(&store.object("default", "db1"), FINALIZER));

        // the notification is delivered again once the finalizer is released
        let outcome = lifecycle
            .delete(&store.object("default", "db1"))
            .await
            .expect("deletion to succeed");

        assert_eq!(outcome, Outcome::Gone);
        assert_eq!(provider.deletes(), vec!["db1".to_string()]);
    }

    #[tokio::test]
    async fn delete_failure_is_swallowed() {
        let store = MemoryStore::default();
        let provider = ScriptedProvider {
            failing_delete: true,
            ..Default::default()
        };
        let publisher = MemoryPublisher::default();

        let mut obj = finalizer::add(database("default", "db1"), FINALIZER);
        obj.metadata.deletion_timestamp = Some(Time(chrono::Utc::now()));
        store.insert(obj.to_owned());

        let outcome = lifecycle(&store, &provider, &publisher)
            .delete(&obj)
            .await
            .expect("deletion to succeed");

        assert_eq!(outcome, Outcome::Deleted);
        assert_eq!(provider.deletes().len(), 1);
        assert!(!finalizer::contains(&store.object("default", "db1"), FINALIZER));
        assert!(store.states("default", "db1").is_empty());
    }

    #[tokio::test]
    async fn delete_keeps_finalizer_without_backend() {
        let store = MemoryStore::default();
        let publisher = MemoryPublisher::default();

        let obj = finalizer::add(database("default", "db1"), FINALIZER);
        store.insert(obj.to_owned());

        let lifecycle: TestLifecycle = Lifecycle::new(
            store.to_owned(),
            Err(ResolveError::Unknown("gcp".to_string())),
            publisher,
        );

        assert!(matches!(
            lifecycle.delete(&obj).await,
            Err(Error::Configuration(_))
        ));
        assert!(finalizer::contains(&store.object("default", "db1"), FINALIZER));
    }

    #[test]
    fn transition_error_names_both_states() {
        let err = Error::Transition(State::Completed.to_string(), State::New);
        assert_eq!(
            err.to_string(),
            "refuse to move resource from state 'Completed' to 'New'"
        );

        let err = Error::Transition("<none>".to_string(), State::DBCreating);
        assert_eq!(
            err.to_string(),
            "refuse to move resource from state '<none>' to 'DBCreating'"
        );
    }
}
