//! Identifier types for collector entities
//!
//! Instruments are identified by the exchange's product id string. The
//! newtype keeps registry keys and handler signatures honest about what
//! they carry.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Exchange instrument identifier (trading pair)
///
/// Format: "BASE-QUOTE" (e.g., "BTC-USD", "ETH-USD")
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProductId(String);

impl ProductId {
    /// Create a new ProductId from a string
    ///
    /// # Panics
    /// Panics if the id is empty
    pub fn new(id: impl Into<String>) -> Self {
        let s = id.into();
        assert!(!s.is_empty(), "ProductId must be non-empty");
        Self(s)
    }

    /// Try to create a ProductId, returning None if empty
    pub fn try_new(id: impl Into<String>) -> Option<Self> {
        let s = id.into();
        if s.is_empty() {
            None
        } else {
            Some(Self(s))
        }
    }

    /// Get the id string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ProductId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for ProductId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}
