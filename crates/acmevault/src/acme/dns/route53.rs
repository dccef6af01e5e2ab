//! Route53 DNS provider
//!
//! Challenge records are TXT record sets named `_acme-challenge.<domain>`.
//! Route53 replaces a record set as a whole, so the values published per
//! record name are tracked locally and every change rewrites the full set.

use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, Region};
use aws_sdk_route53::error::DisplayErrorContext;
use aws_sdk_route53::types::{
    Change, ChangeAction, ChangeBatch, ChangeStatus, ResourceRecord, ResourceRecordSet, RrType,
};
use aws_sdk_route53::Client;
use dashmap::DashMap;
use tokio::time::Instant;
use tracing::{debug, info, trace, warn};

use super::provider::{challenge_record_fqdn, DnsProvider, DnsProviderError, DnsResult, CHALLENGE_TTL};
use crate::acme::credentials::DynamicCredentialsProvider;

const CHANGE_POLL_INTERVAL: Duration = Duration::from_secs(5);
const CHANGE_TIMEOUT: Duration = Duration::from_secs(180);

pub struct Route53Provider {
    client: Client,
    /// Zone name without trailing dot -> hosted zone id
    zones: DashMap<String, String>,
    /// Record name -> published values
    records: DashMap<String, Vec<String>>,
    change_timeout: Duration,
}

impl Route53Provider {
    /// Build a client that authenticates with dynamic credentials
    pub async fn new(region: &str, credentials: DynamicCredentialsProvider) -> Self {
        let config = aws_config::defaults(BehaviorVersion::latest())
            .region(Region::new(region.to_string()))
            .credentials_provider(credentials)
            .load()
            .await;

        Self::from_client(Client::new(&config))
    }

    pub fn from_client(client: Client) -> Self {
        Self {
            client,
            zones: DashMap::new(),
            records: DashMap::new(),
            change_timeout: CHANGE_TIMEOUT,
        }
    }

    async fn load_zones(&self) -> DnsResult<()> {
        let mut marker: Option<String> = None;

        loop {
            let page = self
                .client
                .list_hosted_zones()
                .set_marker(marker.clone())
                .send()
                .await
                .map_err(|e| DnsProviderError::ApiRequest(DisplayErrorContext(&e).to_string()))?;

            for zone in page.hosted_zones() {
                if zone.config().map(|c| c.private_zone()).unwrap_or(false) {
                    continue;
                }
                let name = zone.name().trim_end_matches('.').to_lowercase();
                trace!(zone = %name, id = %zone.id(), "Found hosted zone");
                self.zones.insert(name, zone.id().to_string());
            }

            if !page.is_truncated() {
                break;
            }
            marker = page.next_marker().map(str::to_string);
            if marker.is_none() {
                break;
            }
        }

        debug!(count = self.zones.len(), "Loaded hosted zones");
        Ok(())
    }

    async fn zone_for(&self, fqdn: &str) -> DnsResult<String> {
        if self.zones.is_empty() {
            self.load_zones().await?;
        }

        let zones: Vec<(String, String)> = self
            .zones
            .iter()
            .map(|entry| (entry.key().clone(), entry.value().clone()))
            .collect();

        find_zone(&zones, fqdn).ok_or_else(|| DnsProviderError::ZoneNotFound {
            domain: fqdn.to_string(),
        })
    }

    async fn change(
        &self,
        zone_id: &str,
        action: ChangeAction,
        fqdn: &str,
        values: &[String],
    ) -> Result<(), String> {
        let records = values
            .iter()
            .map(|value| {
                ResourceRecord::builder()
                    .value(format!("\"{}\"", value))
                    .build()
                    .map_err(|e| e.to_string())
            })
            .collect::<Result<Vec<_>, _>>()?;

        let record_set = ResourceRecordSet::builder()
            .name(fqdn)
            .r#type(RrType::Txt)
            .ttl(CHALLENGE_TTL)
            .set_resource_records(Some(records))
            .build()
            .map_err(|e| e.to_string())?;

        let change = Change::builder()
            .action(action)
            .resource_record_set(record_set)
            .build()
            .map_err(|e| e.to_string())?;

        let batch = ChangeBatch::builder()
            .changes(change)
            .comment("acmevault DNS-01 challenge")
            .build()
            .map_err(|e| e.to_string())?;

        let output = self
            .client
            .change_resource_record_sets()
            .hosted_zone_id(zone_id)
            .change_batch(batch)
            .send()
            .await
            .map_err(|e| DisplayErrorContext(&e).to_string())?;

        match output.change_info() {
            Some(info) => self.wait_insync(info.id()).await.map_err(|e| e.to_string()),
            None => Ok(()),
        }
    }

    async fn wait_insync(&self, change_id: &str) -> DnsResult<()> {
        let start = Instant::now();

        loop {
            let output = self
                .client
                .get_change()
                .id(change_id)
                .send()
                .await
                .map_err(|e| DnsProviderError::ApiRequest(DisplayErrorContext(&e).to_string()))?;

            if output.change_info().map(|info| info.status()) == Some(&ChangeStatus::Insync) {
                debug!(change = %change_id, elapsed_secs = start.elapsed().as_secs(), "Change is in sync");
                return Ok(());
            }

            if start.elapsed() >= self.change_timeout {
                return Err(DnsProviderError::Timeout {
                    what: format!("change {}", change_id),
                    elapsed_secs: start.elapsed().as_secs(),
                });
            }

            tokio::time::sleep(CHANGE_POLL_INTERVAL).await;
        }
    }
}

#[async_trait]
impl DnsProvider for Route53Provider {
    fn name(&self) -> &'static str {
        "route53"
    }

    async fn create_txt_record(&self, domain: &str, value: &str) -> DnsResult<String> {
        let fqdn = challenge_record_fqdn(domain);
        let zone_id = self.zone_for(&fqdn).await?;

        let values = {
            let mut entry = self.records.entry(fqdn.clone()).or_default();
            if !entry.contains(&value.to_string()) {
                entry.push(value.to_string());
            }
            entry.clone()
        };

        info!(record = %fqdn, zone = %zone_id, "Publishing challenge record");
        self.change(&zone_id, ChangeAction::Upsert, &fqdn, &values)
            .await
            .map_err(|message| DnsProviderError::RecordCreation {
                record_name: fqdn.clone(),
                message,
            })?;

        Ok(value.to_string())
    }

    async fn delete_txt_record(&self, domain: &str, record_id: &str) -> DnsResult<()> {
        let fqdn = challenge_record_fqdn(domain);

        let (published, remaining) = match self.records.get_mut(&fqdn) {
            Some(mut entry) => {
                let published = entry.clone();
                entry.retain(|v| v != record_id);
                (published, entry.clone())
            }
            None => return Ok(()),
        };

        if published.len() == remaining.len() {
            return Ok(());
        }

        let zone_id = self.zone_for(&fqdn).await?;
        let result = if remaining.is_empty() {
            self.records.remove_if(&fqdn, |_, values| values.is_empty());
            // DELETE must match the live record set exactly
            self.change(&zone_id, ChangeAction::Delete, &fqdn, &published).await
        } else {
            self.change(&zone_id, ChangeAction::Upsert, &fqdn, &remaining).await
        };

        result.map_err(|message| {
            warn!(record = %fqdn, error = %message, "Failed to remove challenge record");
            DnsProviderError::RecordDeletion {
                record_name: fqdn,
                message,
            }
        })
    }
}

impl std::fmt::Debug for Route53Provider {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Route53Provider")
            .field("zones", &self.zones.len())
            .field("pending_records", &self.records.len())
            .finish()
    }
}

/// Hosted zone id whose name is the longest suffix of `fqdn`
fn find_zone(zones: &[(String, String)], fqdn: &str) -> Option<String> {
    let fqdn = fqdn.trim_end_matches('.').to_lowercase();

    zones
        .iter()
        .filter(|(name, _)| fqdn == *name || fqdn.ends_with(&format!(".{}", name)))
        .max_by_key(|(name, _)| name.len())
        .map(|(_, id)| id.clone())
}
