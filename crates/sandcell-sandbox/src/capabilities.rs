//! Capability registry - the allow-list between sandboxed code and the host
//!
//! Sandboxed code asks for a capability by name through `require`. The
//! registry answers with a typed handle or refuses. Only the closed set of
//! [`CapabilityKind`]s can ever load; there is no free-form module resolution.

use crate::config::SandboxConfig;
use crate::SandboxError;
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::{debug, warn};

/// Kinds of capability the sandbox knows how to construct
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CapabilityKind {
    /// Synchronous filesystem facade confined to a root directory
    Fs,
    /// POSIX path utilities
    Path,
    /// Promise-based HTTP client (axios-style)
    Http,
    /// `fetch`-style HTTP function
    Fetch,
    /// `setTimeout`, `clearTimeout` and `sleep`
    Timers,
    /// UUID generation
    Uuid,
}

impl CapabilityKind {
    pub const ALL: [CapabilityKind; 6] = [
        CapabilityKind::Fs,
        CapabilityKind::Path,
        CapabilityKind::Http,
        CapabilityKind::Fetch,
        CapabilityKind::Timers,
        CapabilityKind::Uuid,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CapabilityKind::Fs => "fs",
            CapabilityKind::Path => "path",
            CapabilityKind::Http => "http",
            CapabilityKind::Fetch => "fetch",
            CapabilityKind::Timers => "timers",
            CapabilityKind::Uuid => "uuid",
        }
    }
}

impl fmt::Display for CapabilityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CapabilityKind {
    type Err = LoadError;

    fn from_str(name: &str) -> Result<Self, Self::Err> {
        match name {
            "fs" => Ok(CapabilityKind::Fs),
            "path" => Ok(CapabilityKind::Path),
            "http" | "axios" => Ok(CapabilityKind::Http),
            "fetch" => Ok(CapabilityKind::Fetch),
            "timers" => Ok(CapabilityKind::Timers),
            "uuid" => Ok(CapabilityKind::Uuid),
            other => Err(LoadError::Unknown(other.to_string())),
        }
    }
}

/// Filesystem confinement for the `fs` capability
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FsPolicy {
    /// Canonical root directory; nothing outside it is reachable
    pub root: PathBuf,
    pub max_write_bytes: usize,
}

/// Outbound HTTP restrictions for the `http` and `fetch` capabilities
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpPolicy {
    pub allowed_hosts: Vec<String>,
    pub timeout: Duration,
    pub max_body_bytes: usize,
}

impl HttpPolicy {
    /// Check if a request to `host` is allowed
    pub fn can_access_host(&self, host: &str) -> bool {
        if self.allowed_hosts.is_empty() {
            return true;
        }
        let host = host.trim_end_matches('.').to_ascii_lowercase();
        self.allowed_hosts.iter().any(|allowed| {
            let allowed = allowed.to_ascii_lowercase();
            match allowed.strip_prefix("*.") {
                Some(suffix) => host == suffix || host.ends_with(&format!(".{suffix}")),
                None => allowed == "*" || allowed == host,
            }
        })
    }
}

/// A granted capability with the policy it was constructed under
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Capability {
    Fs(FsPolicy),
    Path,
    Http(HttpPolicy),
    Fetch(HttpPolicy),
    Timers,
    Uuid,
}

impl Capability {
    /// Construct the capability of the given kind under `config`
    pub fn load(kind: CapabilityKind, config: &SandboxConfig) -> Result<Self, LoadError> {
        match kind {
            CapabilityKind::Fs => {
                let root = config.fs_root.as_ref().ok_or_else(|| LoadError::Unavailable {
                    name: kind.as_str(),
                    reason: "no filesystem root configured".to_string(),
                })?;
                let root = root.canonicalize().map_err(|e| LoadError::Unavailable {
                    name: kind.as_str(),
                    reason: format!("filesystem root {}: {}", root.display(), e),
                })?;
                if !root.is_dir() {
                    return Err(LoadError::Unavailable {
                        name: kind.as_str(),
                        reason: format!("filesystem root {} is not a directory", root.display()),
                    });
                }
                Ok(Capability::Fs(FsPolicy {
                    root,
                    max_write_bytes: config.max_write_bytes,
                }))
            }
            CapabilityKind::Http | CapabilityKind::Fetch => {
                if !config.http.enabled {
                    return Err(LoadError::Unavailable {
                        name: kind.as_str(),
                        reason: "outbound HTTP is disabled".to_string(),
                    });
                }
                let policy = HttpPolicy {
                    allowed_hosts: config.http.allowed_hosts.clone(),
                    timeout: config.http.timeout(),
                    max_body_bytes: config.http.max_body_bytes,
                };
                Ok(match kind {
                    CapabilityKind::Http => Capability::Http(policy),
                    _ => Capability::Fetch(policy),
                })
            }
            CapabilityKind::Path => Ok(Capability::Path),
            CapabilityKind::Timers => Ok(Capability::Timers),
            CapabilityKind::Uuid => Ok(Capability::Uuid),
        }
    }

    pub fn kind(&self) -> CapabilityKind {
        match self {
            Capability::Fs(_) => CapabilityKind::Fs,
            Capability::Path => CapabilityKind::Path,
            Capability::Http(_) => CapabilityKind::Http,
            Capability::Fetch(_) => CapabilityKind::Fetch,
            Capability::Timers => CapabilityKind::Timers,
            Capability::Uuid => CapabilityKind::Uuid,
        }
    }
}

/// Why a capability could not be constructed
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LoadError {
    #[error("Unknown capability: {0}")]
    Unknown(String),

    #[error("Capability '{name}' is unavailable: {reason}")]
    Unavailable { name: &'static str, reason: String },
}

/// Why a lookup was refused
///
/// Both variants render the same message; callers that care can still tell
/// a typo from a policy denial.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum LookupError {
    /// The name is not a capability at all
    #[error("Capability '{0}' is not permitted")]
    Unknown(String),

    /// The name is a real capability that was not granted (or failed to load)
    #[error("Capability '{0}' is not permitted")]
    NotGranted(String),
}

impl LookupError {
    pub fn name(&self) -> &str {
        match self {
            LookupError::Unknown(name) | LookupError::NotGranted(name) => name,
        }
    }
}

#[derive(Debug, Clone)]
struct Grant {
    name: String,
    capability: Capability,
    default: bool,
}

/// The capabilities granted to one execution
///
/// Built fresh for every request and dropped with it.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    grants: Vec<Grant>,
}

impl CapabilityRegistry {
    /// Build the registry: configured defaults first, then `requested` in
    /// caller order.
    ///
    /// A default that fails to load is a configuration error. A requested
    /// name that fails to load is skipped with a warning; referencing it
    /// later fails at lookup time.
    pub fn resolve(config: &SandboxConfig, requested: &[String]) -> crate::Result<Self> {
        let mut registry = Self::default();

        for name in &config.default_capabilities {
            if registry.contains(name) {
                continue;
            }
            let capability = name
                .parse::<CapabilityKind>()
                .and_then(|kind| Capability::load(kind, config))
                .map_err(|source| SandboxError::DefaultCapability {
                    name: name.clone(),
                    source,
                })?;
            registry.grants.push(Grant {
                name: name.clone(),
                capability,
                default: true,
            });
        }

        for name in requested {
            registry.grant(name, config);
        }

        debug!(granted = ?registry.names().collect::<Vec<_>>(), "capability registry resolved");
        Ok(registry)
    }

    /// Grant a capability by name. Already-present names are left untouched.
    ///
    /// Returns whether the name is granted afterwards.
    pub fn grant(&mut self, name: &str, config: &SandboxConfig) -> bool {
        if self.contains(name) {
            return true;
        }
        match name
            .parse::<CapabilityKind>()
            .and_then(|kind| Capability::load(kind, config))
        {
            Ok(capability) => {
                self.grants.push(Grant {
                    name: name.to_string(),
                    capability,
                    default: false,
                });
                true
            }
            Err(e) => {
                warn!(capability = name, error = %e, "skipping requested capability");
                false
            }
        }
    }

    /// Resolve a name to its capability, or refuse
    pub fn lookup(&self, name: &str) -> Result<&Capability, LookupError> {
        match self.grants.iter().find(|grant| grant.name == name) {
            Some(grant) => Ok(&grant.capability),
            None if name.parse::<CapabilityKind>().is_err() => {
                Err(LookupError::Unknown(name.to_string()))
            }
            None => Err(LookupError::NotGranted(name.to_string())),
        }
    }

    pub fn contains(&self, name: &str) -> bool {
        self.grants.iter().any(|grant| grant.name == name)
    }

    pub fn is_default(&self, name: &str) -> bool {
        self.grants
            .iter()
            .any(|grant| grant.name == name && grant.default)
    }

    /// Granted names in resolution order
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.grants.iter().map(|grant| grant.name.as_str())
    }

    pub fn has_kind(&self, kind: CapabilityKind) -> bool {
        self.grants
            .iter()
            .any(|grant| grant.capability.kind() == kind)
    }

    pub fn len(&self) -> usize {
        self.grants.len()
    }

    pub fn is_empty(&self) -> bool {
        self.grants.is_empty()
    }
}
