//! Desired state derived from a Bookstore spec
//!
//! Pure functions: the same Bookstore always yields the same Deployment and
//! Service, so a pass that finds nothing to change writes nothing. Drift
//! checks compare only the fields the controller owns; everything the API
//! server or other controllers fill in is left alone.

use std::collections::BTreeMap;

use k8s_openapi::api::apps::v1::{Deployment, DeploymentSpec};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, EnvVarSource, PodSpec, PodTemplateSpec, SecretKeySelector,
    Service, ServicePort, ServiceSpec,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{LabelSelector, ObjectMeta};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::ResourceExt;

use crate::crd::Bookstore;
use crate::owner::controller_reference;
use crate::registry::ResourceRegistry;
use crate::Error;

/// Env var name and the spec field naming its secret key, in container order
fn secret_env(bookstore: &Bookstore) -> [(&'static str, &str); 3] {
    let spec = &bookstore.spec;
    [
        ("AdminUsername", spec.env_admin_username.as_str()),
        ("AdminPassword", spec.env_admin_password.as_str()),
        ("JWTSECRET", spec.env_jwt_secret.as_str()),
    ]
}

/// Build the Deployment a Bookstore asks for
pub fn desired_deployment(
    bookstore: &Bookstore,
    registry: &ResourceRegistry,
) -> Result<Deployment, Error> {
    let spec = &bookstore.spec;
    let labels = bookstore.selector_labels();
    let secret_name = spec.secret_name().to_string();

    let env = secret_env(bookstore)
        .into_iter()
        .map(|(name, key)| EnvVar {
            name: name.to_string(),
            value_from: Some(EnvVarSource {
                secret_key_ref: Some(SecretKeySelector {
                    name: secret_name.clone(),
                    key: key.to_string(),
                    optional: Some(false),
                }),
                ..Default::default()
            }),
            ..Default::default()
        })
        .collect();

    let container = Container {
        name: spec.deployment_name.clone(),
        image: Some(spec.image()),
        image_pull_policy: Some(spec.image_pull_policy.clone()).filter(|p| !p.is_empty()),
        ports: Some(vec![ContainerPort {
            container_port: spec.container_port,
            ..Default::default()
        }]),
        env: Some(env),
        ..Default::default()
    };

    Ok(Deployment {
        metadata: ObjectMeta {
            name: Some(spec.deployment_name.clone()),
            namespace: bookstore.namespace(),
            owner_references: Some(vec![controller_reference(bookstore, registry)?]),
            ..Default::default()
        },
        spec: Some(DeploymentSpec {
            replicas: spec.replicas,
            selector: LabelSelector {
                match_labels: Some(labels.clone()),
                ..Default::default()
            },
            template: PodTemplateSpec {
                metadata: Some(ObjectMeta {
                    labels: Some(labels),
                    ..Default::default()
                }),
                spec: Some(PodSpec {
                    containers: vec![container],
                    ..Default::default()
                }),
            },
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Build the Service a Bookstore asks for
pub fn desired_service(bookstore: &Bookstore, registry: &ResourceRegistry) -> Result<Service, Error> {
    let spec = &bookstore.spec;
    let labels = bookstore.selector_labels();

    Ok(Service {
        metadata: ObjectMeta {
            name: Some(spec.service_name.clone()),
            namespace: bookstore.namespace(),
            labels: Some(labels.clone()),
            owner_references: Some(vec![controller_reference(bookstore, registry)?]),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            type_: Some(spec.service_type.clone()).filter(|t| !t.is_empty()),
            selector: Some(labels),
            ports: Some(vec![ServicePort {
                protocol: Some("TCP".to_string()),
                port: spec.container_port,
                target_port: (spec.target_port != 0).then_some(IntOrString::Int(spec.target_port)),
                node_port: (spec.node_port != 0).then_some(spec.node_port),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    })
}

/// Replica count the Bookstore wants, if it states one
pub fn desired_replicas(bookstore: &Bookstore) -> Option<i32> {
    bookstore.spec.replicas
}

/// True when the Deployment's replica count differs from the Bookstore's
///
/// A Bookstore without a replica count never counts as drifted.
pub fn deployment_drifted(bookstore: &Bookstore, current: &Deployment) -> bool {
    match desired_replicas(bookstore) {
        Some(want) => current.spec.as_ref().and_then(|s| s.replicas) != Some(want),
        None => false,
    }
}

/// Desired Deployment carrying the observed resourceVersion, ready for replace
pub fn deployment_update(
    bookstore: &Bookstore,
    registry: &ResourceRegistry,
    current: &Deployment,
) -> Result<Deployment, Error> {
    let mut next = desired_deployment(bookstore, registry)?;
    next.metadata.resource_version = current.resource_version();
    next.metadata.labels = current.metadata.labels.clone();
    next.metadata.annotations = current.metadata.annotations.clone();
    Ok(next)
}

type PortView = (i32, String, Option<IntOrString>, Option<i32>);

/// The port fields the controller manages, ignoring a nodePort the Bookstore
/// leaves to the server
fn port_view(port: &ServicePort, desired: &ServicePort) -> PortView {
    let protocol = port.protocol.clone().unwrap_or_else(|| "TCP".to_string());
    // an unset targetPort defaults to the service port
    let target = port
        .target_port
        .clone()
        .or(Some(IntOrString::Int(port.port)));
    let node_port = desired.node_port.and(port.node_port);
    (port.port, protocol, target, node_port)
}

/// True when type, selector or declared ports of the Service have drifted
pub fn service_drifted(desired: &Service, current: &Service) -> bool {
    let (Some(want), Some(have)) = (desired.spec.as_ref(), current.spec.as_ref()) else {
        return desired.spec.is_some();
    };

    let want_type = want.type_.as_deref().unwrap_or("ClusterIP");
    let have_type = have.type_.as_deref().unwrap_or("ClusterIP");
    if want_type != have_type {
        return true;
    }

    let empty = BTreeMap::new();
    if want.selector.as_ref().unwrap_or(&empty) != have.selector.as_ref().unwrap_or(&empty) {
        return true;
    }

    let want_ports = want.ports.as_deref().unwrap_or_default();
    let have_ports = have.ports.as_deref().unwrap_or_default();
    if want_ports.len() != have_ports.len() {
        return true;
    }
    want_ports
        .iter()
        .zip(have_ports)
        .any(|(w, h)| port_view(w, w) != port_view(h, w))
}

/// Current Service with the managed fields replaced by the desired ones
///
/// Server-assigned fields (clusterIP, an unrequested nodePort) survive so the
/// replace is accepted and does not churn.
pub fn service_update(desired: &Service, current: &Service) -> Service {
    let mut next = current.clone();
    next.metadata.labels = desired.metadata.labels.clone();
    let Some(want) = desired.spec.as_ref() else {
        return next;
    };
    let have = next.spec.get_or_insert_with(Default::default);
    let old_ports = have.ports.take().unwrap_or_default();
    have.type_ = want.type_.clone();
    have.selector = want.selector.clone();
    have.ports = want.ports.as_ref().map(|ports| {
        ports
            .iter()
            .enumerate()
            .map(|(i, p)| {
                let mut port = p.clone();
                if port.node_port.is_none() {
                    port.node_port = old_ports.get(i).and_then(|o| o.node_port);
                }
                port
            })
            .collect()
    });
    next
}
