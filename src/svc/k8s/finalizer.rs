//! # Finalizer module
//!
//! This module provide helpers methods to interact with kubernetes' resource
//! finalizer

use kube::Resource;

/// returns if there is the given finalizer on the resource
pub fn contains<T>(obj: &T, finalizer: &str) -> bool
where
    T: Resource,
{
    obj.meta()
        .finalizers
        .as_ref()
        .map(|finalizers| finalizers.iter().any(|f| finalizer == f))
        .unwrap_or(false)
}

/// add finalizer to the resource
pub fn add<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    let finalizers = obj.meta_mut().finalizers.get_or_insert_with(Vec::new);
    if !finalizers.iter().any(|f| finalizer == f) {
        finalizers.push(finalizer.to_string());
    }

    obj
}

/// remove finalizer from the resource
pub fn remove<T>(mut obj: T, finalizer: &str) -> T
where
    T: Resource,
{
    if let Some(finalizers) = obj.meta_mut().finalizers.as_mut() {
        finalizers.retain(|f| f != finalizer);
    }

    obj
}
