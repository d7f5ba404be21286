//! External API versions
//!
//! Each served `(api-version, resource type)` pair maps to a [`Converter`]
//! between the versioned wire shape and the internal [`Cluster`]. Handlers
//! never touch a versioned type directly.

pub mod v20191231preview;

use std::collections::HashMap;
use std::sync::Arc;

use serde_json::Value;

use mantle_common::model::{Cluster, RESOURCE_TYPE_CLUSTERS};
use mantle_common::{Result, API_VERSION_2019_12_31_PREVIEW};

use crate::error::CloudError;

/// Request facts a converter validates the body against
#[derive(Clone, Copy, Debug)]
pub struct RequestContext<'a> {
    /// Resource id from the request path, original casing
    pub resource_id: &'a str,
    /// Resource name from the request path
    pub name: &'a str,
    /// Qualified resource type (`namespace/type`)
    pub resource_type: &'a str,
    /// Region this service runs in
    pub location: &'a str,
    /// Tenant of the service principal
    pub tenant_id: &'a str,
}

/// Converts one external API version to and from the internal model
pub trait Converter: Send + Sync {
    /// The external projection of `cluster`
    ///
    /// Whatever secrets `cluster` still holds are included; callers scrub
    /// first when the value leaves the service.
    fn to_external(&self, cluster: &Cluster) -> Result<Value>;

    /// The external projection of the admin credentials
    fn credentials_to_external(&self, cluster: &Cluster) -> Result<Value>;

    /// Strictly decode `external`, validate it and write it into `cluster`
    ///
    /// `current` is the stored cluster on update and `None` on create.
    fn apply(
        &self,
        external: Value,
        ctx: &RequestContext<'_>,
        current: Option<&Cluster>,
        cluster: &mut Cluster,
    ) -> std::result::Result<(), CloudError>;
}

/// Lookup of converters by API version and resource type
pub struct Registry {
    converters: HashMap<(String, String), Arc<dyn Converter>>,
}

impl Registry {
    /// A registry with no versions
    pub fn empty() -> Self {
        Self {
            converters: HashMap::new(),
        }
    }

    /// Serve `resource_type` at `api_version` through `converter`
    pub fn register(
        &mut self,
        api_version: &str,
        resource_type: &str,
        converter: Arc<dyn Converter>,
    ) {
        self.converters.insert(
            (api_version.to_lowercase(), resource_type.to_lowercase()),
            converter,
        );
    }

    /// The converter for a version and type, compared case-insensitively
    pub fn get(&self, api_version: &str, resource_type: &str) -> Option<Arc<dyn Converter>> {
        self.converters
            .get(&(api_version.to_lowercase(), resource_type.to_lowercase()))
            .cloned()
    }
}

impl Default for Registry {
    fn default() -> Self {
        let mut registry = Self::empty();
        registry.register(
            API_VERSION_2019_12_31_PREVIEW,
            RESOURCE_TYPE_CLUSTERS,
            Arc::new(v20191231preview::ClusterConverter),
        );
        registry
    }
}

/// Overlay `patch` onto `base`
///
/// Objects merge key by key, `null` removes a key and every other value
/// replaces what was there.
pub fn merge(base: &mut Value, patch: Value) {
    match (base, patch) {
        (Value::Object(base), Value::Object(patch)) => {
            for (key, value) in patch {
                if value.is_null() {
                    base.remove(&key);
                } else {
                    merge(base.entry(key).or_insert(Value::Null), value);
                }
            }
        }
        (base, patch) => *base = patch,
    }
}
