//! # Event module
//!
//! This module provide helpers to build kubernetes core/v1/event

use std::fmt::Debug;

use chrono::Utc;
use k8s_openapi::{
    api::core::v1::{Event, EventSource},
    apimachinery::pkg::apis::meta::v1::{MicroTime, Time},
};
use kube::{api::ObjectMeta, CustomResourceExt, ResourceExt};

use crate::svc::k8s::{recorder::Level, resource};

/// create a new event from the given parameters
pub fn new<T, U>(obj: &T, level: &Level, action: &U, message: &str) -> Event
where
    T: ResourceExt + CustomResourceExt + Debug,
    U: ToString + Debug,
{
    let now = Utc::now();
    let action = action.to_string();

    Event {
        metadata: ObjectMeta {
            namespace: obj.namespace(),
            name: Some(format!(
                "{}-{}-{}",
                obj.name_any(),
                action.to_lowercase(),
                now.timestamp_millis()
            )),
            ..Default::default()
        },
        type_: Some(level.to_string()),
        action: Some(action.to_owned()),
        count: Some(1),
        event_time: Some(MicroTime(now)),
        first_timestamp: Some(Time(now)),
        involved_object: resource::object_reference(obj),
        last_timestamp: Some(Time(now)),
        message: Some(message.to_string()),
        reason: Some(action),
        reporting_component: Some(env!("CARGO_PKG_NAME").to_string()),
        reporting_instance: Some(reporting_instance()),
        series: None,
        source: Some(source()),
        ..Default::default()
    }
}

fn reporting_instance() -> String {
    hostname::get()
        .ok()
        .map(|host| host.to_string_lossy().to_string())
        .unwrap_or_else(|| format!("{}/{}", env!("CARGO_PKG_NAME"), env!("CARGO_PKG_VERSION")))
}

/// returns the source of this operator
pub fn source() -> EventSource {
    let host = hostname::get()
        .ok()
        .map(|host| host.to_string_lossy().to_string());

    EventSource {
        component: Some(env!("CARGO_PKG_NAME").to_string()),
        host,
    }
}
