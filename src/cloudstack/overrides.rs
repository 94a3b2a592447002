//! Per-endpoint overrides for network placement and offering visibility.
//!
//! Deployments may ship three property-style tables alongside the driver:
//!
//! - `cloud_mappings.cfg` maps an endpoint URL to a cloud identifier.
//! - `custom_network_mappings.cfg` maps `cloud-id,product-id` to the network
//!   every launch of that product must use.
//! - `custom_service_mappings.cfg` maps `cloud-id,region-id` to the
//!   comma-separated offering ids the catalog may expose.
//!
//! Every table is optional. A missing or malformed file leaves its table
//! unset, which means "use the defaults", and the load is retried the next
//! time the table is needed.

use std::collections::{BTreeSet, HashMap};

use camino::{Utf8Path, Utf8PathBuf};
use cap_std::{ambient_authority, fs_utf8::Dir};
use thiserror::Error;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// File holding endpoint to cloud identifier mappings.
pub const CLOUD_MAPPINGS_FILE: &str = "cloud_mappings.cfg";
/// File holding network overrides.
pub const NETWORK_MAPPINGS_FILE: &str = "custom_network_mappings.cfg";
/// File holding offering allow-lists.
pub const SERVICE_MAPPINGS_FILE: &str = "custom_service_mappings.cfg";

type NetworkTable = HashMap<String, HashMap<String, String>>;
type ServiceTable = HashMap<String, HashMap<String, BTreeSet<String>>>;

#[derive(Debug, Error, Eq, PartialEq)]
enum OverrideParseError {
    #[error("line {line}: expected key=value")]
    MissingSeparator { line: usize },
    #[error("line {line}: key '{key}' is not of the form cloud-id,qualifier")]
    BadKey { line: usize, key: String },
}

/// The three override tables. `None` means the table is unavailable.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct OverrideTables {
    cloud_ids: Option<HashMap<String, String>>,
    networks: Option<NetworkTable>,
    services: Option<ServiceTable>,
}

impl OverrideTables {
    /// Tables with nothing loaded.
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    /// Maps an endpoint URL to a cloud identifier.
    #[must_use]
    pub fn with_cloud_id(
        mut self,
        endpoint: impl Into<String>,
        cloud_id: impl Into<String>,
    ) -> Self {
        self.cloud_ids
            .get_or_insert_with(HashMap::new)
            .insert(endpoint.into(), cloud_id.into());
        self
    }

    /// Forces launches of `product_id` in `cloud_id` onto `network_id`.
    #[must_use]
    pub fn with_network(
        mut self,
        cloud_id: impl Into<String>,
        product_id: impl Into<String>,
        network_id: impl Into<String>,
    ) -> Self {
        self.networks
            .get_or_insert_with(HashMap::new)
            .entry(cloud_id.into())
            .or_default()
            .insert(product_id.into(), network_id.into());
        self
    }

    /// Restricts the offerings visible in `region_id` of `cloud_id`.
    #[must_use]
    pub fn with_allowed_products(
        mut self,
        cloud_id: impl Into<String>,
        region_id: impl Into<String>,
        product_ids: impl IntoIterator<Item = impl Into<String>>,
    ) -> Self {
        self.services
            .get_or_insert_with(HashMap::new)
            .entry(cloud_id.into())
            .or_default()
            .insert(
                region_id.into(),
                product_ids.into_iter().map(Into::into).collect(),
            );
        self
    }

    /// Network override for a product launched through `endpoint`.
    #[must_use]
    pub fn network_for(&self, endpoint: &str, product_id: &str) -> Option<&str> {
        let cloud_id = self.cloud_ids.as_ref()?.get(endpoint)?;
        self.networks
            .as_ref()?
            .get(cloud_id)?
            .get(product_id)
            .map(String::as_str)
    }

    /// Offering allow-list for `region_id` of the cloud behind `endpoint`.
    #[must_use]
    pub fn allowed_products(&self, endpoint: &str, region_id: &str) -> Option<&BTreeSet<String>> {
        let cloud_id = self.cloud_ids.as_ref()?.get(endpoint)?;
        self.services.as_ref()?.get(cloud_id)?.get(region_id)
    }

    const fn is_complete(&self) -> bool {
        self.cloud_ids.is_some() && self.networks.is_some() && self.services.is_some()
    }

    fn fill_missing(&mut self, loaded: Self) {
        if self.cloud_ids.is_none() {
            self.cloud_ids = loaded.cloud_ids;
        }
        if self.networks.is_none() {
            self.networks = loaded.networks;
        }
        if self.services.is_none() {
            self.services = loaded.services;
        }
    }

    fn load_from_dir(dir: &Utf8Path) -> Self {
        let root = match Dir::open_ambient_dir(dir, ambient_authority()) {
            Ok(root) => root,
            Err(err) => {
                warn!(%dir, error = %err, "override directory unavailable; using defaults");
                return Self::default();
            }
        };
        Self {
            cloud_ids: read_table(&root, dir, CLOUD_MAPPINGS_FILE, |text| {
                Ok(parse_cloud_mappings(text))
            }),
            networks: read_table(&root, dir, NETWORK_MAPPINGS_FILE, parse_network_mappings),
            services: read_table(&root, dir, SERVICE_MAPPINGS_FILE, parse_service_mappings),
        }
    }
}

fn read_table<T>(
    root: &Dir,
    dir: &Utf8Path,
    file: &str,
    parse: impl FnOnce(&str) -> Result<T, OverrideParseError>,
) -> Option<T> {
    let text = match root.read_to_string(file) {
        Ok(text) => text,
        Err(err) => {
            debug!(%dir, file, error = %err, "override table not loaded");
            return None;
        }
    };
    match parse(&text) {
        Ok(table) => Some(table),
        Err(err) => {
            warn!(%dir, file, error = %err, "ignoring malformed override table");
            None
        }
    }
}

fn content_lines(text: &str) -> impl Iterator<Item = (usize, &str)> {
    text.lines()
        .enumerate()
        .map(|(index, line)| (index + 1, line.trim()))
        .filter(|(_, line)| !line.is_empty() && !line.starts_with('#') && !line.starts_with('!'))
}

/// Endpoint lines without a value are skipped rather than rejected.
fn parse_cloud_mappings(text: &str) -> HashMap<String, String> {
    content_lines(text)
        .filter_map(|(_, line)| line.split_once('='))
        .filter(|(_, cloud_id)| !cloud_id.is_empty())
        .map(|(endpoint, cloud_id)| (endpoint.to_owned(), cloud_id.to_owned()))
        .collect()
}

fn split_property(line_number: usize, line: &str) -> Result<(&str, &str), OverrideParseError> {
    let (key, value) = line.split_once('=').ok_or(OverrideParseError::MissingSeparator {
        line: line_number,
    })?;
    Ok((key.trim(), value.trim()))
}

fn split_key(line_number: usize, key: &str) -> Result<(String, String), OverrideParseError> {
    let mut parts = key.split(',');
    match (parts.next(), parts.next()) {
        (Some(cloud_id), Some(qualifier)) => Ok((cloud_id.to_owned(), qualifier.to_owned())),
        _ => Err(OverrideParseError::BadKey {
            line: line_number,
            key: key.to_owned(),
        }),
    }
}

fn parse_network_mappings(text: &str) -> Result<NetworkTable, OverrideParseError> {
    let mut table = NetworkTable::new();
    for (line_number, line) in content_lines(text) {
        let (key, network_id) = split_property(line_number, line)?;
        let (cloud_id, product_id) = split_key(line_number, key)?;
        table
            .entry(cloud_id)
            .or_default()
            .insert(product_id, network_id.to_owned());
    }
    Ok(table)
}

fn parse_service_mappings(text: &str) -> Result<ServiceTable, OverrideParseError> {
    let mut table = ServiceTable::new();
    for (line_number, line) in content_lines(text) {
        let (key, offerings) = split_property(line_number, line)?;
        let (cloud_id, region_id) = split_key(line_number, key)?;
        let allowed = offerings
            .split(',')
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .map(str::to_owned)
            .collect();
        table.entry(cloud_id).or_default().insert(region_id, allowed);
    }
    Ok(table)
}

/// Where override tables come from.
#[derive(Clone, Debug, Eq, PartialEq)]
pub enum OverrideSource {
    /// No overrides; defaults always apply.
    Disabled,
    /// Property files in a directory, read lazily.
    Directory(Utf8PathBuf),
    /// Tables supplied in memory.
    Fixed(OverrideTables),
}

/// Lazily loaded override tables owned by a compute service.
///
/// Concurrent first use may load the files more than once; every load reads
/// the same static files so the result is the same.
#[derive(Debug)]
pub struct OverrideStore {
    source: OverrideSource,
    tables: RwLock<OverrideTables>,
}

impl OverrideStore {
    /// Creates a store that reads from `source` on first use.
    #[must_use]
    pub fn new(source: OverrideSource) -> Self {
        Self {
            source,
            tables: RwLock::new(OverrideTables::default()),
        }
    }

    /// Creates a store without overrides.
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(OverrideSource::Disabled)
    }

    /// Network override for `product_id` on `endpoint`. Empty overrides
    /// count as none.
    pub async fn network_for(&self, endpoint: &str, product_id: &str) -> Option<String> {
        self.ensure_loaded().await;
        self.tables
            .read()
            .await
            .network_for(endpoint, product_id)
            .filter(|network| !network.is_empty())
            .map(str::to_owned)
    }

    /// Offering allow-list for `region_id` on `endpoint`.
    pub async fn allowed_products(
        &self,
        endpoint: &str,
        region_id: &str,
    ) -> Option<BTreeSet<String>> {
        self.ensure_loaded().await;
        self.tables
            .read()
            .await
            .allowed_products(endpoint, region_id)
            .cloned()
    }

    async fn ensure_loaded(&self) {
        if self.tables.read().await.is_complete() {
            return;
        }
        let loaded = match &self.source {
            OverrideSource::Disabled => return,
            OverrideSource::Fixed(tables) => tables.clone(),
            OverrideSource::Directory(dir) => {
                let owned = dir.clone();
                match tokio::task::spawn_blocking(move || OverrideTables::load_from_dir(&owned))
                    .await
                {
                    Ok(tables) => tables,
                    Err(err) => {
                        warn!(%dir, error = %err, "override load task failed; using defaults");
                        return;
                    }
                }
            }
        };
        self.tables.write().await.fill_missing(loaded);
    }
}

impl Default for OverrideStore {
    fn default() -> Self {
        Self::disabled()
    }
}
