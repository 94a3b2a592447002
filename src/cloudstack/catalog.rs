//! Offering catalog with a per-endpoint, per-architecture cache.

use std::collections::{BTreeSet, HashMap};

use tokio::sync::RwLock;
use tracing::{debug, instrument};

use crate::model::{Architecture, ProductOffering};

use super::response::{Element, ResponseDocument};
use super::services::{ApiAction, Param};
use super::{CloudStackCompute, CloudStackError};

const NOMINAL_DISK_GB: u32 = 1;

type EndpointProducts = HashMap<Architecture, Vec<ProductOffering>>;

/// Offerings already fetched, keyed by endpoint then architecture.
///
/// Entries never expire. Two callers populating the same key at once both
/// fetch and the later write wins; the fetched collections are equivalent.
#[derive(Debug, Default)]
pub struct ProductCache {
    entries: RwLock<HashMap<String, EndpointProducts>>,
}

impl ProductCache {
    /// Creates an empty cache.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached offerings for `endpoint` and `architecture`.
    pub async fn get(
        &self,
        endpoint: &str,
        architecture: Architecture,
    ) -> Option<Vec<ProductOffering>> {
        self.entries
            .read()
            .await
            .get(endpoint)
            .and_then(|by_arch| by_arch.get(&architecture))
            .cloned()
    }

    /// Stores offerings for `endpoint` and `architecture`, replacing any
    /// previous entry.
    pub async fn insert(
        &self,
        endpoint: &str,
        architecture: Architecture,
        products: Vec<ProductOffering>,
    ) {
        self.entries
            .write()
            .await
            .entry(endpoint.to_owned())
            .or_default()
            .insert(architecture, products);
    }
}

fn parse_count(offering: &Element, field: &str) -> Result<u32, CloudStackError> {
    offering
        .child(field)
        .and_then(Element::text)
        .map_or(Ok(0), |raw| {
            raw.trim().parse::<u32>().map_err(|err| {
                CloudStackError::MalformedResponse(format!("offering {field} '{raw}': {err}"))
            })
        })
}

/// Decodes every `serviceoffering` element, keeping only ids in `allowed`
/// when an allow-list applies.
pub(crate) fn parse_offerings(
    doc: &ResponseDocument,
    allowed: Option<&BTreeSet<String>>,
) -> Result<Vec<ProductOffering>, CloudStackError> {
    let mut products = Vec::new();
    for offering in doc.elements_named("serviceoffering") {
        let Some(id) = offering.child("id").and_then(Element::text) else {
            continue;
        };
        if allowed.is_some_and(|ids| !ids.contains(id)) {
            continue;
        }
        let cpu_count = parse_count(offering, "cpunumber")?;
        let ram_mb = parse_count(offering, "memory")?;
        let base = offering.child("name").and_then(Element::text).unwrap_or(id);
        let label = format!("{base} ({cpu_count} CPU/{ram_mb}MB RAM)");
        products.push(ProductOffering {
            id: id.to_owned(),
            name: label.clone(),
            description: label,
            ram_mb,
            cpu_count,
            disk_size_gb: NOMINAL_DISK_GB,
        });
    }
    Ok(products)
}

impl CloudStackCompute {
    #[instrument(skip(self), fields(endpoint = %self.context.endpoint))]
    pub(super) async fn products_for(
        &self,
        architecture: Architecture,
    ) -> Result<Vec<ProductOffering>, CloudStackError> {
        let endpoint = self.context.endpoint.as_str();
        if let Some(cached) = self.products.get(endpoint, architecture).await {
            debug!(count = cached.len(), "offering cache hit");
            return Ok(cached);
        }

        let region = self.region()?;
        let allowed = self.overrides.allowed_products(endpoint, region).await;
        let params = [Param::new("zoneId", region)];
        let doc = self
            .collaborators
            .transport
            .invoke(ApiAction::ListServiceOfferings, &params)
            .await?;
        let products = parse_offerings(&doc, allowed.as_ref())?;
        debug!(count = products.len(), "offering cache miss; fetched");
        self.products
            .insert(endpoint, architecture, products.clone())
            .await;
        Ok(products)
    }

    pub(super) async fn find_product(
        &self,
        product_id: &str,
    ) -> Result<Option<ProductOffering>, CloudStackError> {
        for architecture in Architecture::ALL {
            if let Some(product) = self
                .products_for(architecture)
                .await?
                .into_iter()
                .find(|product| product.id == product_id)
            {
                return Ok(Some(product));
            }
        }
        debug!(product_id, "unknown offering id");
        Ok(None)
    }
}
