use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::OnceCell;

use crate::error::{PodlinkError, Result};
use crate::exec::runtime::PodRef;
use crate::sync::waiter::EventWaiter;

/// Decides which pod a session execs into.
#[async_trait]
pub trait TargetResolver: Send + Sync {
    async fn resolve(&self) -> Result<PodRef>;
}

/// A pod known up front.
#[derive(Debug, Clone)]
pub struct StaticTarget {
    pod: PodRef,
}

impl StaticTarget {
    pub fn new(pod: PodRef) -> Self {
        Self { pod }
    }
}

#[async_trait]
impl TargetResolver for StaticTarget {
    async fn resolve(&self) -> Result<PodRef> {
        Ok(self.pod.clone())
    }
}

/// Maps scheduler cluster ids to API server URLs.
#[derive(Debug, Clone, Default)]
pub struct ClusterDirectory {
    servers: HashMap<String, String>,
}

impl ClusterDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_cluster(mut self, cluster_id: impl Into<String>, server_url: impl Into<String>) -> Self {
        self.insert(cluster_id, server_url);
        self
    }

    pub fn insert(&mut self, cluster_id: impl Into<String>, server_url: impl Into<String>) {
        self.servers.insert(cluster_id.into(), server_url.into());
    }

    pub fn server_url(&self, cluster_id: &str) -> Result<&str> {
        self.servers
            .get(cluster_id)
            .map(String::as_str)
            .ok_or_else(|| PodlinkError::UnknownCluster {
                cluster_id: cluster_id.to_string(),
            })
    }

    pub fn len(&self) -> usize {
        self.servers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }
}

/// Where a running job's pod lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolvedTarget {
    pub pod: PodRef,
    pub cluster_id: String,
    pub server_url: String,
}

/// Resolves the pod of a scheduler job by waiting for its running event.
///
/// The first successful resolution is cached; later calls return it without
/// touching the scheduler again.
pub struct RunningJobTarget {
    job_id: String,
    job_set_id: String,
    waiter: EventWaiter,
    clusters: Arc<ClusterDirectory>,
    timeout: Option<Duration>,
    resolved: OnceCell<ResolvedTarget>,
}

impl RunningJobTarget {
    /// `node` names the agent in errors when either id is missing.
    pub fn new(
        node: &str,
        job_id: Option<&str>,
        job_set_id: Option<&str>,
        waiter: EventWaiter,
        clusters: Arc<ClusterDirectory>,
    ) -> Result<Self> {
        let job_id = non_empty(job_id).ok_or_else(|| PodlinkError::MissingJobInfo {
            field: "job_id",
            node: node.to_string(),
        })?;
        let job_set_id = non_empty(job_set_id).ok_or_else(|| PodlinkError::MissingJobInfo {
            field: "job_set_id",
            node: node.to_string(),
        })?;

        Ok(Self {
            job_id: job_id.to_string(),
            job_set_id: job_set_id.to_string(),
            waiter,
            clusters,
            timeout: None,
            resolved: OnceCell::new(),
        })
    }

    /// Bound for the running-event wait; the waiter's default otherwise.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn job_id(&self) -> &str {
        &self.job_id
    }

    pub fn job_set_id(&self) -> &str {
        &self.job_set_id
    }

    /// Full resolution including the cluster's server URL.
    pub async fn resolution(&self) -> Result<&ResolvedTarget> {
        self.resolved
            .get_or_try_init(|| async {
                let event = self
                    .waiter
                    .wait_for_running(
                        &self.job_id,
                        &self.job_set_id,
                        self.timeout.unwrap_or(self.waiter.default_timeout()),
                    )
                    .await?;
                let server_url = self.clusters.server_url(&event.cluster_id)?.to_string();

                tracing::debug!(
                    job_id = %self.job_id,
                    pod = %event.pod_name,
                    namespace = %event.pod_namespace,
                    cluster_id = %event.cluster_id,
                    "Resolved job pod"
                );

                Ok::<_, PodlinkError>(ResolvedTarget {
                    pod: PodRef::new(event.pod_name, event.pod_namespace).with_server(&server_url),
                    cluster_id: event.cluster_id,
                    server_url,
                })
            })
            .await
    }
}

#[async_trait]
impl TargetResolver for RunningJobTarget {
    async fn resolve(&self) -> Result<PodRef> {
        Ok(self.resolution().await?.pod.clone())
    }
}

fn non_empty(value: Option<&str>) -> Option<&str> {
    value.filter(|v| !v.is_empty())
}
