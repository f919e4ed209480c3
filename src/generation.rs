//! Cache generation naming.

use std::fmt;
use std::sync::Arc;

/// Generation shipped with this release.
pub const DEFAULT_GENERATION: &str = "logbook-cache-v2";

/// Name of one versioned set of cached assets.
///
/// Exactly one generation is current for the lifetime of a process. Every
/// other store name found in storage belongs to an earlier deployment.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Generation(Arc<str>);

impl Generation {
  pub fn new(name: impl Into<String>) -> Self {
    Self(Arc::from(name.into()))
  }

  pub fn as_str(&self) -> &str {
    &self.0
  }

  /// Whether the store called `store_name` belongs to this generation.
  pub fn owns(&self, store_name: &str) -> bool {
    &*self.0 == store_name
  }
}

impl Default for Generation {
  fn default() -> Self {
    Self::new(DEFAULT_GENERATION)
  }
}

impl fmt::Display for Generation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(&self.0)
  }
}
