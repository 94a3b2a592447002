//! Canonical virtual machine records shared by every backend.
//!
//! Records are built fresh from a single provider response and are never
//! mutated once handed to a caller.

use std::collections::BTreeMap;
use std::fmt;

use chrono::{DateTime, Utc};

/// CPU word size of an instance or offering.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Architecture {
    /// 32-bit x86.
    I32,
    /// 64-bit x86.
    #[default]
    I64,
}

impl Architecture {
    /// Every architecture the catalog is keyed by, in lookup order.
    pub const ALL: [Self; 2] = [Self::I32, Self::I64];

    /// Maps the provider's `osarchitecture` value. Only `"32"` selects the
    /// 32-bit variant; anything else, including absence, is 64-bit.
    #[must_use]
    pub fn from_provider(value: Option<&str>) -> Self {
        match value {
            Some("32") => Self::I32,
            _ => Self::I64,
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::I32 => f.write_str("i32"),
            Self::I64 => f.write_str("i64"),
        }
    }
}

/// Canonical lifecycle state.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum VmState {
    /// Being created or starting up.
    Pending,
    /// Powered on.
    Running,
    /// Stopped but retained; may be started again.
    Paused,
    /// Transitioning (stopping, migrating, recovering).
    Rebooting,
    /// Destroyed or being expunged.
    Terminated,
    /// The provider response did not carry a state.
    #[default]
    Unknown,
}

/// Best-effort operating system family guessed from an image name.
#[derive(Clone, Copy, Debug, Default, Eq, Hash, PartialEq)]
pub enum Platform {
    /// Microsoft Windows.
    Windows,
    /// Ubuntu Linux.
    Ubuntu,
    /// Debian Linux.
    Debian,
    /// CentOS Linux.
    CentOs,
    /// Red Hat Enterprise Linux.
    Rhel,
    /// Fedora Linux.
    Fedora,
    /// SUSE or openSUSE.
    Suse,
    /// FreeBSD.
    FreeBsd,
    /// Oracle or OpenSolaris.
    Solaris,
    /// Some other Unix or Linux flavour.
    Unix,
    /// Nothing recognisable in the name.
    #[default]
    Unknown,
}

impl Platform {
    /// Guesses a platform from a free-form image or template name.
    #[must_use]
    pub fn guess(name: &str) -> Self {
        let name = name.to_ascii_lowercase();
        let table: [(&[&str], Self); 9] = [
            (&["windows", "win2k", "win20"], Self::Windows),
            (&["ubuntu"], Self::Ubuntu),
            (&["debian"], Self::Debian),
            (&["centos"], Self::CentOs),
            (&["rhel", "red hat", "redhat"], Self::Rhel),
            (&["fedora"], Self::Fedora),
            (&["suse"], Self::Suse),
            (&["freebsd"], Self::FreeBsd),
            (&["solaris"], Self::Solaris),
        ];
        table
            .iter()
            .find(|(needles, _)| needles.iter().any(|needle| name.contains(needle)))
            .map(|(_, platform)| *platform)
            .or_else(|| {
                ["linux", "unix", "bsd"]
                    .iter()
                    .any(|needle| name.contains(needle))
                    .then_some(Self::Unix)
            })
            .unwrap_or(Self::Unknown)
    }
}

/// Root password handed back by the provider. Never printed by `Debug`.
#[derive(Clone, Eq, PartialEq)]
pub struct RootCredential(String);

impl RootCredential {
    /// Wraps a secret value.
    #[must_use]
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Returns the secret.
    #[must_use]
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for RootCredential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("RootCredential(***)")
    }
}

/// A fixed CPU/RAM bundle selectable at provisioning time.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct ProductOffering {
    /// Provider offering identifier.
    pub id: String,
    /// Display name, `"{name} ({cpu} CPU/{ram}MB RAM)"`.
    pub name: String,
    /// Same text as the name.
    pub description: String,
    /// Memory in megabytes.
    pub ram_mb: u32,
    /// Virtual CPU count.
    pub cpu_count: u32,
    /// Nominal disk size; the provider does not report one.
    pub disk_size_gb: u32,
}

/// Behaviour hints attached to every record. Not verified with the provider.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct Capabilities {
    /// Whether the instance can be cloned.
    pub clonable: bool,
    /// Whether an image can be captured from the instance.
    pub imagable: bool,
    /// Whether the instance can be paused.
    pub pausable: bool,
    /// Whether the instance survives a stop.
    pub persistent: bool,
}

impl Default for Capabilities {
    fn default() -> Self {
        Self {
            clonable: false,
            imagable: false,
            pausable: true,
            persistent: true,
        }
    }
}

/// Canonical representation of a provisioned instance.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VirtualMachineRecord {
    /// Provider instance identifier.
    pub id: String,
    /// Display name; never empty.
    pub name: String,
    /// Description; never empty.
    pub description: String,
    /// CPU word size.
    pub architecture: Architecture,
    /// Canonical lifecycle state.
    pub state: VmState,
    /// Region the instance lives in.
    pub region_id: String,
    /// Datacenter the instance lives in.
    pub datacenter_id: String,
    /// Network the first interface is attached to.
    pub network_id: Option<String>,
    /// Publicly routable addresses.
    pub public_addresses: Vec<String>,
    /// Private addresses.
    pub private_addresses: Vec<String>,
    /// Public DNS name (the first public address when no name is known).
    pub public_dns: Option<String>,
    /// Private DNS name (the first private address when no name is known).
    pub private_dns: Option<String>,
    /// Root password, when the provider generated one.
    pub root_credential: Option<RootCredential>,
    /// Image the instance was launched from.
    pub image_id: Option<String>,
    /// Operating system guess derived from the image name.
    pub platform: Platform,
    /// Offering the instance runs on, when it could be resolved.
    pub product: Option<ProductOffering>,
    /// Account that owns the instance.
    pub owner_id: Option<String>,
    /// Creation time reported by the provider.
    pub created_at: Option<DateTime<Utc>>,
    /// Last boot time; set to the epoch when the creation time was unreadable.
    pub last_boot_at: Option<DateTime<Utc>>,
    /// Fields the translator does not model, keyed by lowercased name.
    pub tags: BTreeMap<String, String>,
    /// Behaviour hints.
    pub capabilities: Capabilities,
}
