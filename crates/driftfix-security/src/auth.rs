use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use driftfix_common::{Error, Result};
use ring::hmac;
use ring::rand::{SecureRandom, SystemRandom};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Administrative rights a caller can hold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Capability {
    /// Run migrations on a single site.
    ManageOptions,
    /// Run migrations across every site of a network.
    ManageNetwork,
}

impl Capability {
    pub fn as_str(&self) -> &'static str {
        match self {
            Capability::ManageOptions => "manage_options",
            Capability::ManageNetwork => "manage_network",
        }
    }
}

impl fmt::Display for Capability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Capability {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim() {
            "manage_options" => Ok(Capability::ManageOptions),
            "manage_network" => Ok(Capability::ManageNetwork),
            other => Err(Error::Security(format!("unknown capability: {other}"))),
        }
    }
}

/// An authenticated administrator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Principal {
    pub name: String,
    pub capabilities: BTreeSet<Capability>,
}

impl Principal {
    /// Network administrators can also manage any single site.
    pub fn can(&self, capability: Capability) -> bool {
        self.capabilities.contains(&capability)
            || (capability == Capability::ManageOptions
                && self.capabilities.contains(&Capability::ManageNetwork))
    }

    pub fn require(&self, capability: Capability) -> Result<()> {
        if self.can(capability) {
            Ok(())
        } else {
            Err(Error::Unauthorized(format!(
                "{} lacks {capability}",
                self.name
            )))
        }
    }
}

struct Entry {
    principal: Principal,
    key_tag: hmac::Tag,
}

/// API keys of the configured administrators.
///
/// Keys are kept only as HMAC tags under a per-process key and checked with
/// `hmac::verify`, so lookups compare in constant time.
pub struct AdminDirectory {
    key: hmac::Key,
    entries: Vec<Entry>,
}

impl AdminDirectory {
    pub fn new() -> Result<Self> {
        let key = hmac::Key::generate(hmac::HMAC_SHA256, &SystemRandom::new())
            .map_err(|_| Error::Security("failed to generate directory key".into()))?;
        Ok(Self {
            key,
            entries: Vec::new(),
        })
    }

    pub fn add(
        &mut self,
        name: impl Into<String>,
        api_key: &str,
        capabilities: impl IntoIterator<Item = Capability>,
    ) -> Result<()> {
        let name = name.into();
        if api_key.is_empty() {
            return Err(Error::Security(format!("admin {name} has an empty api key")));
        }
        self.entries.push(Entry {
            key_tag: hmac::sign(&self.key, api_key.as_bytes()),
            principal: Principal {
                name,
                capabilities: capabilities.into_iter().collect(),
            },
        });
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Resolve a bearer token to its administrator.
    pub fn authenticate(&self, api_key: &str) -> Result<&Principal> {
        self.entries
            .iter()
            .find(|entry| {
                hmac::verify(&self.key, api_key.as_bytes(), entry.key_tag.as_ref()).is_ok()
            })
            .map(|entry| &entry.principal)
            .ok_or_else(|| {
                warn!("rejected request with an unknown api key");
                Error::Unauthorized("unknown api key".into())
            })
    }

    pub fn find(&self, name: &str) -> Option<&Principal> {
        self.entries
            .iter()
            .map(|entry| &entry.principal)
            .find(|principal| principal.name == name)
    }
}

/// Fill `buf` from the system CSPRNG.
pub(crate) fn random_bytes(buf: &mut [u8]) -> Result<()> {
    SystemRandom::new()
        .fill(buf)
        .map_err(|_| Error::Security("system random source unavailable".into()))
}
