//! Participant notifier
//!
//! Tells shards that their cached routing information for a namespace is
//! stale. Best effort: failures are logged and counted, never surfaced to the
//! phase sequencing.

use crate::common::metrics::METRICS;
use crate::common::{Error, Result};
use crate::coordinator::record::{OperationId, ShardId};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::time::Duration;

/// Body of a refresh request sent to a shard
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushRoutingTableRequest {
    pub namespace: String,
}

/// Transport for refresh notifications
#[async_trait]
pub trait RoutingNotifier: Send + Sync {
    async fn flush_routing_table(&self, shard: &str, namespace: &str) -> Result<()>;
}

/// Sends refresh notifications to each shard's HTTP admin endpoint
pub struct HttpRoutingNotifier {
    client: reqwest::Client,
    shard_urls: HashMap<ShardId, String>,
}

impl HttpRoutingNotifier {
    pub fn new(shard_urls: HashMap<ShardId, String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { client, shard_urls })
    }
}

#[async_trait]
impl RoutingNotifier for HttpRoutingNotifier {
    async fn flush_routing_table(&self, shard: &str, namespace: &str) -> Result<()> {
        let base = self
            .shard_urls
            .get(shard)
            .ok_or_else(|| Error::NotFound(format!("no URL configured for shard {}", shard)))?;
        let url = format!("{}/admin/flush-routing-table", base.trim_end_matches('/'));

        let resp = self
            .client
            .post(&url)
            .json(&FlushRoutingTableRequest {
                namespace: namespace.to_string(),
            })
            .send()
            .await?;

        if !resp.status().is_success() {
            return Err(Error::Http(format!(
                "{} answered {} to refresh of {}",
                shard,
                resp.status(),
                namespace
            )));
        }
        Ok(())
    }
}

/// Fire-and-forget broadcaster used by the coordinator
#[derive(Clone)]
pub struct ParticipantNotifier {
    transport: Arc<dyn RoutingNotifier>,
}

impl ParticipantNotifier {
    pub fn new(transport: Arc<dyn RoutingNotifier>) -> Self {
        Self { transport }
    }

    /// Notify every shard in `shards` about `namespace` in the background.
    ///
    /// The returned handle resolves once every send finished; callers that do
    /// not care simply drop it.
    pub fn tell_to_refresh(
        &self,
        operation_id: OperationId,
        shards: impl IntoIterator<Item = ShardId>,
        namespace: &str,
    ) -> tokio::task::JoinHandle<()> {
        let shards: BTreeSet<ShardId> = shards.into_iter().collect();
        let transport = self.transport.clone();
        let namespace = namespace.to_string();

        tokio::spawn(async move {
            let sends = shards.iter().map(|shard| {
                let transport = transport.clone();
                let namespace = namespace.clone();
                async move {
                    let res = transport.flush_routing_table(shard, &namespace).await;
                    (shard, res)
                }
            });

            for (shard, res) in futures_util::future::join_all(sends).await {
                match res {
                    Ok(()) => {
                        METRICS.refresh_sent.inc();
                        tracing::debug!(%operation_id, %shard, %namespace, "routing refresh sent");
                    }
                    Err(e) => {
                        METRICS.refresh_failed.inc();
                        tracing::warn!(
                            %operation_id,
                            %shard,
                            %namespace,
                            "routing refresh failed: {}",
                            e
                        );
                    }
                }
            }
        })
    }
}
