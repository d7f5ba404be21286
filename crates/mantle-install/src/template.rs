//! Deployment templates and infrastructure stages
//!
//! A [`Template`] is a list of resource declarations that ARM deploys as
//! one operation, ordering creation by the `dependsOn` edges. An
//! [`InfrastructureStage`] wraps a template with its parameter values and
//! checks the edges before anything is submitted.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Serialize, Serializer};

use mantle_common::{Error, Result};

/// Deployment template schema
pub const TEMPLATE_SCHEMA: &str =
    "https://schema.management.azure.com/schemas/2015-01-01/deploymentTemplate.json#";

/// Name of a declared resource
///
/// A replicated resource (one with a `copy` count) gets an indexed name:
/// `prefix`, the copy index, then `suffix`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ResourceName {
    /// A single resource
    Fixed(String),
    /// One resource per copy index
    Indexed {
        /// Text before the index
        prefix: String,
        /// Text after the index
        suffix: String,
    },
}

impl ResourceName {
    /// A single resource name
    pub fn fixed(name: impl Into<String>) -> Self {
        Self::Fixed(name.into())
    }

    /// An indexed resource name
    pub fn indexed(prefix: impl Into<String>, suffix: impl Into<String>) -> Self {
        Self::Indexed {
            prefix: prefix.into(),
            suffix: suffix.into(),
        }
    }

    /// The name as it appears in the template
    pub fn expression(&self) -> String {
        match self {
            Self::Fixed(name) => name.clone(),
            Self::Indexed { prefix, suffix } => concat_with_index(prefix, suffix),
        }
    }

    /// Resource id of the `index`th instance, relative to the resource group
    pub fn instance(&self, index: u32) -> String {
        match self {
            Self::Fixed(name) => name.clone(),
            Self::Indexed { prefix, suffix } => format!("{}{}{}", prefix, index, suffix),
        }
    }

    fn serialize_expression<S: Serializer>(
        name: &ResourceName,
        s: S,
    ) -> std::result::Result<S::Ok, S::Error> {
        s.serialize_str(&name.expression())
    }
}

fn concat_with_index(prefix: &str, suffix: &str) -> String {
    if suffix.is_empty() {
        format!("[concat('{}', copyIndex())]", prefix)
    } else {
        format!("[concat('{}', copyIndex(), '{}')]", prefix, suffix)
    }
}

/// Interleave type segments and name segments into a reference
///
/// `Microsoft.Network/privateDnsZones/A` named `zone/api` becomes
/// `Microsoft.Network/privateDnsZones/zone/A/api`.
fn interleave(resource_type: &str, name: &str) -> String {
    let mut types = resource_type.split('/');
    let mut out = types.next().unwrap_or_default().to_string();
    for (t, n) in types.zip(name.split('/')) {
        out.push('/');
        out.push_str(t);
        out.push('/');
        out.push_str(n);
    }
    out
}

/// Replication of a declaration
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Copy {
    /// Loop name
    pub name: String,
    /// Number of instances
    pub count: u32,
}

/// One resource declaration
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Resource {
    /// Resource name
    #[serde(serialize_with = "ResourceName::serialize_expression")]
    pub name: ResourceName,
    /// Resource type
    #[serde(rename = "type")]
    pub resource_type: String,
    /// Resource provider API version
    pub api_version: String,
    /// Region
    #[serde(skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,
    /// SKU
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sku: Option<serde_json::Value>,
    /// Resource kind
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    /// Managed identity
    #[serde(skip_serializing_if = "Option::is_none")]
    pub identity: Option<serde_json::Value>,
    /// Availability zones
    #[serde(skip_serializing_if = "Option::is_none")]
    pub zones: Option<Vec<String>>,
    /// Resource-specific properties
    #[serde(skip_serializing_if = "Option::is_none")]
    pub properties: Option<serde_json::Value>,
    /// Replication
    #[serde(skip_serializing_if = "Option::is_none")]
    pub copy: Option<Copy>,
    /// References of resources that must exist first
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub depends_on: Vec<String>,
}

impl Resource {
    /// A declaration with no properties
    pub fn new(
        resource_type: impl Into<String>,
        name: ResourceName,
        api_version: impl Into<String>,
    ) -> Self {
        Self {
            name,
            resource_type: resource_type.into(),
            api_version: api_version.into(),
            location: None,
            sku: None,
            kind: None,
            identity: None,
            zones: None,
            properties: None,
            copy: None,
            depends_on: Vec::new(),
        }
    }

    /// Set the region
    pub fn location(mut self, location: impl Into<String>) -> Self {
        self.location = Some(location.into());
        self
    }

    /// Set the SKU
    pub fn sku(mut self, sku: serde_json::Value) -> Self {
        self.sku = Some(sku);
        self
    }

    /// Set the resource kind
    pub fn kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    /// Set the managed identity
    pub fn identity(mut self, identity: serde_json::Value) -> Self {
        self.identity = Some(identity);
        self
    }

    /// Set the availability zones
    pub fn zones(mut self, zones: Vec<String>) -> Self {
        self.zones = Some(zones);
        self
    }

    /// Set the properties
    pub fn properties(mut self, properties: serde_json::Value) -> Self {
        self.properties = Some(properties);
        self
    }

    /// Replicate the declaration `count` times
    pub fn copies(mut self, count: u32) -> Self {
        self.copy = Some(Copy {
            name: "copy".to_string(),
            count,
        });
        self
    }

    /// Require `other` to be created first
    pub fn depends_on(mut self, other: &Resource) -> Self {
        self.depends_on.push(other.reference());
        self
    }

    /// How other declarations in the same template refer to this one
    pub fn reference(&self) -> String {
        match &self.name {
            ResourceName::Fixed(name) => interleave(&self.resource_type, name),
            ResourceName::Indexed { prefix, suffix } => {
                concat_with_index(&interleave(&self.resource_type, prefix), suffix)
            }
        }
    }

    /// Number of resources this declaration produces
    pub fn instances(&self) -> u32 {
        self.copy.as_ref().map_or(1, |c| c.count)
    }
}

/// A parameter declaration
#[derive(Clone, Debug, PartialEq, Eq, Serialize)]
pub struct Parameter {
    /// Parameter type
    #[serde(rename = "type")]
    pub kind: String,
}

/// A deployment template
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Template {
    /// Schema URL
    #[serde(rename = "$schema")]
    pub schema: String,
    /// Template content version
    pub content_version: String,
    /// Parameter declarations
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, Parameter>,
    /// Resource declarations
    pub resources: Vec<Resource>,
}

impl Template {
    /// A template over `resources`
    pub fn new(resources: Vec<Resource>) -> Self {
        Self {
            schema: TEMPLATE_SCHEMA.to_string(),
            content_version: "1.0.0.0".to_string(),
            parameters: BTreeMap::new(),
            resources,
        }
    }

    /// Declare an object parameter
    pub fn with_object_parameter(mut self, name: impl Into<String>) -> Self {
        self.parameters.insert(
            name.into(),
            Parameter {
                kind: "object".to_string(),
            },
        );
        self
    }
}

/// One batch of declarations deployed as a single ARM operation
#[derive(Clone, Debug)]
pub struct InfrastructureStage {
    /// Stage name, used in logs and errors
    pub name: &'static str,
    /// ARM deployment name; stable so re-runs update the same deployment
    pub deployment_name: String,
    /// Declarations
    pub template: Template,
    /// Parameter values (`{"name": {"value": ...}}`)
    pub parameters: serde_json::Value,
}

impl InfrastructureStage {
    /// Build a stage, rejecting malformed dependency edges
    pub fn new(
        name: &'static str,
        deployment_name: impl Into<String>,
        template: Template,
        parameters: serde_json::Value,
    ) -> Result<Self> {
        let stage = Self {
            name,
            deployment_name: deployment_name.into(),
            template,
            parameters,
        };
        stage.validate()?;
        Ok(stage)
    }

    /// Check the declarations
    ///
    /// Every `dependsOn` entry must name a declaration that appears earlier
    /// in the same template, references must be unique, and indexed names
    /// must carry a copy count.
    pub fn validate(&self) -> Result<()> {
        let mut declared = BTreeSet::new();
        for resource in &self.template.resources {
            let reference = resource.reference();
            if matches!(resource.name, ResourceName::Indexed { .. }) && resource.copy.is_none() {
                return Err(self.invalid(format!("{} has an indexed name but no copy", reference)));
            }
            for dep in &resource.depends_on {
                if !declared.contains(dep) {
                    return Err(self.invalid(format!(
                        "{} depends on {}, which is not declared before it",
                        reference, dep
                    )));
                }
            }
            if !declared.insert(reference.clone()) {
                return Err(self.invalid(format!("{} is declared twice", reference)));
            }
        }
        Ok(())
    }

    /// Total number of resources the stage creates
    pub fn resource_count(&self) -> u32 {
        self.template.resources.iter().map(Resource::instances).sum()
    }

    fn invalid(&self, message: String) -> Error {
        Error::internal_with_context(format!("stage {}", self.name), message)
    }
}
