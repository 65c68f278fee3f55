//! Source trust policy.

use std::collections::BTreeSet;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{KardexError, Result};

/// Static mapping from source-system name to trust level.
///
/// Loaded once at startup and handed to the [`Ledger`] by value. A source
/// that is not listed is untrusted.
///
/// [`Ledger`]: crate::Ledger
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustPolicy {
    #[serde(default)]
    trusted: BTreeSet<String>,
}

impl TrustPolicy {
    pub fn new<I, S>(trusted: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            trusted: trusted.into_iter().map(Into::into).collect(),
        }
    }

    /// Parse a policy of the form `{"trusted": ["EPIC", "HL7"]}`.
    pub fn from_json_str(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Read and parse a JSON policy file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .map_err(|e| KardexError::Config(format!("{}: {e}", path.display())))?;
        Self::from_json_str(&json)
    }

    pub fn is_trusted(&self, source_system: &str) -> bool {
        self.trusted.contains(source_system)
    }

    pub fn trusted_sources(&self) -> impl Iterator<Item = &str> {
        self.trusted.iter().map(String::as_str)
    }
}
