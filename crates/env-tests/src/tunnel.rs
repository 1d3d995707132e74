//! Local port-forward tunnels.
//!
//! A tunnel binds a local TCP listener and, for every accepted connection,
//! opens a Kubernetes port-forward stream to one pod backing the target
//! resource. Services and deployments are resolved to their first available
//! pod; a service port is resolved to the pod's target port.

use crate::cluster::KubeCluster;
use async_trait::async_trait;
use k8s_openapi::api::apps::v1::Deployment;
use k8s_openapi::api::core::v1::{Pod, Service};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, ListParams};
use kube::Client;
use std::collections::BTreeMap;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use thiserror::Error;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tracing::{debug, info, warn};

/// Tunnel errors.
#[derive(Debug, Error)]
pub enum TunnelError {
    #[error("Failed to bind local port {port}: {source}")]
    Bind {
        port: u16,
        #[source]
        source: std::io::Error,
    },

    #[error("Kubernetes API request failed: {0}")]
    Api(#[from] kube::Error),

    #[error("{resource} has no selector")]
    NoSelector { resource: String },

    #[error("No available pod found for {resource}")]
    NoAvailablePod { resource: String },

    #[error("Cannot resolve port {port} on {resource}: {message}")]
    PortResolution {
        resource: String,
        port: u16,
        message: String,
    },

    #[error("Tunnel to {resource} has not been forwarded")]
    NotForwarded { resource: String },

    #[error("Tunnel to {resource} is already forwarded")]
    AlreadyForwarded { resource: String },
}

/// Kind of resource a tunnel targets.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceType {
    Pod,
    Service,
    Deployment,
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResourceType::Pod => write!(f, "pod"),
            ResourceType::Service => write!(f, "svc"),
            ResourceType::Deployment => write!(f, "deployment"),
        }
    }
}

/// An opened tunnel.
#[async_trait]
pub trait PortTunnel: Send + Sync {
    /// Establish the forward. Returns once the local listener accepts connections.
    async fn forward_port(&mut self) -> Result<(), TunnelError>;

    /// `host:port` of the local listener.
    fn endpoint(&self) -> Result<String, TunnelError>;

    /// Stop forwarding. Calling it more than once has no further effect.
    fn close(&mut self);
}

/// Creates tunnels to resources in the target namespace.
pub trait TunnelClient: Send + Sync {
    /// Create a tunnel. `local_port` 0 picks a free port.
    fn open(
        &self,
        resource_type: ResourceType,
        name: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Box<dyn PortTunnel>;
}

impl TunnelClient for KubeCluster {
    fn open(
        &self,
        resource_type: ResourceType,
        name: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Box<dyn PortTunnel> {
        Box::new(KubeTunnel::new(
            self.client.clone(),
            &self.namespace,
            resource_type,
            name,
            local_port,
            remote_port,
        ))
    }
}

/// Port-forward tunnel through the Kubernetes API.
pub struct KubeTunnel {
    client: Client,
    namespace: String,
    resource_type: ResourceType,
    name: String,
    local_port: u16,
    remote_port: u16,
    local_addr: Option<SocketAddr>,
    shutdown_tx: Option<oneshot::Sender<()>>,
}

impl KubeTunnel {
    pub fn new(
        client: Client,
        namespace: &str,
        resource_type: ResourceType,
        name: &str,
        local_port: u16,
        remote_port: u16,
    ) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            resource_type,
            name: name.to_string(),
            local_port,
            remote_port,
            local_addr: None,
            shutdown_tx: None,
        }
    }

    fn resource(&self) -> String {
        format!("{}/{}", self.resource_type, self.name)
    }

    /// Find the pod to forward to and the port on that pod.
    async fn resolve_target(&self) -> Result<(String, u16), TunnelError> {
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);

        match self.resource_type {
            ResourceType::Pod => {
                pods.get(&self.name).await?;
                Ok((self.name.clone(), self.remote_port))
            }
            ResourceType::Service => {
                let services: Api<Service> =
                    Api::namespaced(self.client.clone(), &self.namespace);
                let service = services.get(&self.name).await?;
                let selector = service
                    .spec
                    .as_ref()
                    .and_then(|s| s.selector.as_ref())
                    .ok_or_else(|| TunnelError::NoSelector {
                        resource: self.resource(),
                    })?;

                let pod = self.find_available_pod(&pods, selector).await?;
                let port = resolve_target_port(&service, &pod, self.remote_port).map_err(
                    |message| TunnelError::PortResolution {
                        resource: self.resource(),
                        port: self.remote_port,
                        message,
                    },
                )?;
                Ok((pod.metadata.name.unwrap_or_default(), port))
            }
            ResourceType::Deployment => {
                let deployments: Api<Deployment> =
                    Api::namespaced(self.client.clone(), &self.namespace);
                let deployment = deployments.get(&self.name).await?;
                let selector = deployment
                    .spec
                    .as_ref()
                    .and_then(|s| s.selector.match_labels.as_ref())
                    .ok_or_else(|| TunnelError::NoSelector {
                        resource: self.resource(),
                    })?;

                let pod = self.find_available_pod(&pods, selector).await?;
                Ok((pod.metadata.name.unwrap_or_default(), self.remote_port))
            }
        }
    }

    async fn find_available_pod(
        &self,
        pods: &Api<Pod>,
        labels: &BTreeMap<String, String>,
    ) -> Result<Pod, TunnelError> {
        let list_params = ListParams::default().labels(&label_selector(labels));
        let pod_list = pods.list(&list_params).await?;

        pod_list
            .items
            .into_iter()
            .find(|pod| pod.metadata.name.is_some() && is_pod_available(pod))
            .ok_or_else(|| TunnelError::NoAvailablePod {
                resource: self.resource(),
            })
    }
}

#[async_trait]
impl PortTunnel for KubeTunnel {
    async fn forward_port(&mut self) -> Result<(), TunnelError> {
        if self.local_addr.is_some() {
            return Err(TunnelError::AlreadyForwarded {
                resource: self.resource(),
            });
        }

        let (pod_name, pod_port) = self.resolve_target().await?;

        let listener = TcpListener::bind((Ipv4Addr::LOCALHOST, self.local_port))
            .await
            .map_err(|source| TunnelError::Bind {
                port: self.local_port,
                source,
            })?;
        let local_addr = listener.local_addr().map_err(|source| TunnelError::Bind {
            port: self.local_port,
            source,
        })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel::<()>();
        let pods: Api<Pod> = Api::namespaced(self.client.clone(), &self.namespace);
        tokio::spawn(accept_loop(listener, pods, pod_name.clone(), pod_port, shutdown_rx));

        info!(
            resource = %self.resource(),
            pod = %pod_name,
            pod_port,
            local_addr = %local_addr,
            "Port forward established"
        );

        self.local_addr = Some(local_addr);
        self.shutdown_tx = Some(shutdown_tx);
        Ok(())
    }

    fn endpoint(&self) -> Result<String, TunnelError> {
        self.local_addr
            .map(|addr| format!("localhost:{}", addr.port()))
            .ok_or_else(|| TunnelError::NotForwarded {
                resource: self.resource(),
            })
    }

    fn close(&mut self) {
        if let Some(shutdown_tx) = self.shutdown_tx.take() {
            let _ = shutdown_tx.send(());
            debug!(resource = %self.resource(), "Port forward closed");
        }
    }
}

impl Drop for KubeTunnel {
    fn drop(&mut self) {
        self.close();
    }
}

async fn accept_loop(
    listener: TcpListener,
    pods: Api<Pod>,
    pod_name: String,
    pod_port: u16,
    mut shutdown_rx: oneshot::Receiver<()>,
) {
    loop {
        tokio::select! {
            accept_result = listener.accept() => {
                match accept_result {
                    Ok((local_stream, peer)) => {
                        debug!(peer = %peer, pod = %pod_name, "Accepted tunnel connection");
                        tokio::spawn(forward_connection(
                            local_stream,
                            pods.clone(),
                            pod_name.clone(),
                            pod_port,
                        ));
                    }
                    Err(e) => {
                        warn!(error = %e, "Failed to accept connection");
                    }
                }
            }
            _ = &mut shutdown_rx => {
                debug!(pod = %pod_name, "Port forward shutdown requested");
                break;
            }
        }
    }
}

async fn forward_connection(
    mut local_stream: tokio::net::TcpStream,
    pods: Api<Pod>,
    pod_name: String,
    pod_port: u16,
) {
    let mut forwarder = match pods.portforward(&pod_name, &[pod_port]).await {
        Ok(forwarder) => forwarder,
        Err(e) => {
            warn!(error = %e, pod = %pod_name, "Failed to establish port forward stream");
            return;
        }
    };

    let Some(mut upstream) = forwarder.take_stream(pod_port) else {
        warn!(pod = %pod_name, pod_port, "Port forward stream missing");
        return;
    };

    if let Err(e) = tokio::io::copy_bidirectional(&mut local_stream, &mut upstream).await {
        warn!(error = %e, pod = %pod_name, "Error copying tunnel traffic");
    }

    drop(upstream);
    if let Err(e) = forwarder.join().await {
        debug!(error = %e, pod = %pod_name, "Port forwarder finished with error");
    }
}

/// Build a label selector string from match labels.
pub fn label_selector(labels: &BTreeMap<String, String>) -> String {
    labels
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join(",")
}

/// A pod can take traffic when it is Running and its Ready condition is True.
pub fn is_pod_available(pod: &Pod) -> bool {
    let Some(status) = pod.status.as_ref() else {
        return false;
    };

    let running = status.phase.as_deref() == Some("Running");
    let ready = status
        .conditions
        .iter()
        .flatten()
        .any(|c| c.type_ == "Ready" && c.status == "True");

    running && ready
}

/// Map a service port to the port the pod listens on.
///
/// A service port without a `targetPort` forwards to the same number; a named
/// target port is looked up among the pod's container ports. Ports the service
/// does not declare are used as-is.
pub fn resolve_target_port(service: &Service, pod: &Pod, remote_port: u16) -> Result<u16, String> {
    let service_port = service
        .spec
        .as_ref()
        .and_then(|s| s.ports.as_ref())
        .and_then(|ports| ports.iter().find(|p| p.port == i32::from(remote_port)));

    let Some(service_port) = service_port else {
        return Ok(remote_port);
    };

    match &service_port.target_port {
        None => Ok(remote_port),
        Some(IntOrString::Int(port)) => {
            u16::try_from(*port).map_err(|_| format!("target port {} out of range", port))
        }
        Some(IntOrString::String(port_name)) => pod
            .spec
            .as_ref()
            .map(|spec| spec.containers.as_slice())
            .unwrap_or_default()
            .iter()
            .flat_map(|c| c.ports.iter().flatten())
            .find(|p| p.name.as_deref() == Some(port_name.as_str()))
            .ok_or_else(|| format!("no container port named '{}'", port_name))
            .and_then(|p| {
                u16::try_from(p.container_port)
                    .map_err(|_| format!("container port {} out of range", p.container_port))
            }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use k8s_openapi::api::core::v1::{
        Container, ContainerPort, PodCondition, PodSpec, PodStatus, ServicePort, ServiceSpec,
    };

    fn pod(phase: &str, ready: &str, ports: Vec<ContainerPort>) -> Pod {
        Pod {
            metadata: kube::api::ObjectMeta {
                name: Some("nginx-7d9c6b8f5-abcde".to_string()),
                ..Default::default()
            },
            spec: Some(PodSpec {
                containers: vec![Container {
                    name: "nginx".to_string(),
                    ports: Some(ports),
                    ..Default::default()
                }],
                ..Default::default()
            }),
            status: Some(PodStatus {
                phase: Some(phase.to_string()),
                conditions: Some(vec![PodCondition {
                    type_: "Ready".to_string(),
                    status: ready.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }),
        }
    }

    fn service(port: i32, target_port: Option<IntOrString>) -> Service {
        Service {
            spec: Some(ServiceSpec {
                ports: Some(vec![ServicePort {
                    port,
                    target_port,
                    ..Default::default()
                }]),
                ..Default::default()
            }),
            ..Default::default()
        }
    }

    fn named_http_port(number: i32) -> ContainerPort {
        ContainerPort {
            name: Some("http".to_string()),
            container_port: number,
            ..Default::default()
        }
    }

    #[test]
    fn test_resource_type_display() {
        assert_eq!(ResourceType::Pod.to_string(), "pod");
        assert_eq!(ResourceType::Service.to_string(), "svc");
        assert_eq!(ResourceType::Deployment.to_string(), "deployment");
    }

    #[test]
    fn test_label_selector() {
        let labels = BTreeMap::from([
            ("app".to_string(), "nginx".to_string()),
            ("tier".to_string(), "web".to_string()),
        ]);
        assert_eq!(label_selector(&labels), "app=nginx,tier=web");
        assert_eq!(label_selector(&BTreeMap::new()), "");
    }

    #[test]
    fn test_pod_availability() {
        assert!(is_pod_available(&pod("Running", "True", vec![])));
        assert!(!is_pod_available(&pod("Running", "False", vec![])));
        assert!(!is_pod_available(&pod("Pending", "True", vec![])));
        assert!(!is_pod_available(&Pod::default()));
    }

    #[test]
    fn test_integer_target_port() {
        let svc = service(80, Some(IntOrString::Int(8080)));
        let p = pod("Running", "True", vec![]);
        assert_eq!(resolve_target_port(&svc, &p, 80), Ok(8080));
    }

    #[test]
    fn test_missing_target_port_defaults_to_service_port() {
        let svc = service(80, None);
        let p = pod("Running", "True", vec![]);
        assert_eq!(resolve_target_port(&svc, &p, 80), Ok(80));
    }

    #[test]
    fn test_named_target_port() {
        let svc = service(80, Some(IntOrString::String("http".to_string())));
        let p = pod("Running", "True", vec![named_http_port(8081)]);
        assert_eq!(resolve_target_port(&svc, &p, 80), Ok(8081));
    }

    #[test]
    fn test_unknown_named_target_port() {
        let svc = service(80, Some(IntOrString::String("metrics".to_string())));
        let p = pod("Running", "True", vec![named_http_port(8081)]);
        let err = resolve_target_port(&svc, &p, 80).expect_err("should not resolve");
        assert!(err.contains("metrics"));
    }

    #[test]
    fn test_undeclared_service_port_passes_through() {
        let svc = service(443, Some(IntOrString::Int(8443)));
        let p = pod("Running", "True", vec![]);
        assert_eq!(resolve_target_port(&svc, &p, 80), Ok(80));
    }

    fn offline_client() -> Client {
        let config = kube::Config::new(
            "http://127.0.0.1:9"
                .parse()
                .expect("static URI should parse"),
        );
        Client::try_from(config).expect("client should build")
    }

    #[tokio::test]
    async fn test_endpoint_before_forward_fails() {
        let tunnel = KubeTunnel::new(
            offline_client(),
            "highway",
            ResourceType::Service,
            "nginx-highway-service",
            0,
            80,
        );

        let err = tunnel.endpoint().expect_err("endpoint requires forward");
        assert!(matches!(err, TunnelError::NotForwarded { .. }));
        assert!(err.to_string().contains("svc/nginx-highway-service"));
    }

    #[tokio::test]
    async fn test_close_without_forward_is_noop() {
        let mut tunnel = KubeTunnel::new(
            offline_client(),
            "highway",
            ResourceType::Pod,
            "nginx",
            0,
            80,
        );
        tunnel.close();
        tunnel.close();
        assert!(tunnel.endpoint().is_err());
    }
}
