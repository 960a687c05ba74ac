//! Bookstore Custom Resource Definition
//!
//! A Bookstore declares one Deployment and one Service that the controller
//! creates and keeps in sync. Sensitive configuration is never inlined: the
//! spec only names keys inside an externally managed Secret.

use std::collections::BTreeMap;

use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Secret consulted for the admin credentials and JWT secret when the spec
/// does not name one
pub const DEFAULT_SECRET_NAME: &str = "env-secrets";

/// Specification for a Bookstore
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "bookstore.dev",
    version = "v1alpha1",
    kind = "Bookstore",
    plural = "bookstores",
    shortname = "bks",
    status = "BookstoreStatus",
    namespaced,
    printcolumn = r#"{"name":"Deployment","type":"string","jsonPath":".spec.deploymentName"}"#,
    printcolumn = r#"{"name":"Replicas","type":"integer","jsonPath":".spec.replicas"}"#,
    printcolumn = r#"{"name":"Available","type":"integer","jsonPath":".status.availableReplicas"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct BookstoreSpec {
    /// Secret key holding the admin username
    #[serde(default)]
    pub env_admin_username: String,

    /// Secret key holding the admin password
    #[serde(default)]
    pub env_admin_password: String,

    /// Secret key holding the JWT signing secret
    #[serde(default, rename = "envJWTSECRET")]
    pub env_jwt_secret: String,

    /// Secret the env keys are read from (defaults to `env-secrets`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_name: Option<String>,

    /// Container image repository
    #[serde(default)]
    pub deployment_image_name: String,

    /// Container image tag
    #[serde(default)]
    pub deployment_image_tag: String,

    /// Image pull policy (Always, IfNotPresent, Never)
    #[serde(default)]
    pub image_pull_policy: String,

    /// Name of the managed Deployment
    #[serde(default)]
    pub deployment_name: String,

    /// Desired replica count; when unset the Deployment's count is left alone
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub replicas: Option<i32>,

    /// Name of the managed Service
    #[serde(default)]
    pub service_name: String,

    /// Service type (ClusterIP, NodePort, LoadBalancer)
    #[serde(default)]
    pub service_type: String,

    /// Port the container listens on, also exposed as the Service port
    #[serde(default)]
    pub container_port: i32,

    /// Node port for NodePort/LoadBalancer services (0 lets the API server pick)
    #[serde(default)]
    pub node_port: i32,

    /// Service target port
    #[serde(default)]
    pub target_port: i32,
}

impl BookstoreSpec {
    /// Validate the fields the Deployment is built from
    pub fn validate(&self) -> Result<(), crate::Error> {
        if self.deployment_name.is_empty() {
            return Err(crate::Error::validation("deployment name must be specified"));
        }
        if let Some(replicas) = self.replicas {
            if replicas < 0 {
                return Err(crate::Error::validation(format!(
                    "replicas must not be negative, got {replicas}"
                )));
            }
        }
        Ok(())
    }

    /// Validate the fields the Service is built from
    ///
    /// Checked only once the Deployment has converged, so a missing service
    /// name does not hold the Deployment back.
    pub fn validate_service(&self) -> Result<(), crate::Error> {
        if self.service_name.is_empty() {
            return Err(crate::Error::validation("service name must be specified"));
        }
        Ok(())
    }

    /// Full image reference (`image:tag`)
    pub fn image(&self) -> String {
        format!("{}:{}", self.deployment_image_name, self.deployment_image_tag)
    }

    /// Secret holding the referenced env keys
    pub fn secret_name(&self) -> &str {
        self.secret_name.as_deref().unwrap_or(DEFAULT_SECRET_NAME)
    }
}

/// Status for a Bookstore
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct BookstoreStatus {
    /// Available replicas last observed on the managed Deployment
    #[serde(default)]
    pub available_replicas: i32,
}

impl Bookstore {
    /// Labels selecting the pods of this Bookstore
    pub fn selector_labels(&self) -> BTreeMap<String, String> {
        let name = self.name_any();
        BTreeMap::from([
            ("app".to_string(), format!("{name}-app")),
            (
                "controller".to_string(),
                format!("{name}-customController1"),
            ),
        ])
    }

    /// Available replicas currently recorded in status
    pub fn available_replicas(&self) -> i32 {
        self.status
            .as_ref()
            .map(|s| s.available_replicas)
            .unwrap_or_default()
    }
}
