//! Configuration items that are used across the server adapters. A `Configuration` is
//! constructed once at startup and passed into the dispatcher and adapter constructors;
//! there is no process-wide configuration state.

use std::collections::HashMap;

use serde_json::Value;

/// Configuration for a server adapter
#[derive(Debug, Clone, PartialEq)]
pub struct Configuration {
  /// Interface to bind to. Defaults to "0.0.0.0" (all interfaces).
  pub ip: String,
  /// Port to bind to. Defaults to 8080.
  pub port: u16,
  /// The adapter to use. Defaults to "hyper".
  pub adapter: String,
  /// Adapter-specific options (e.g. "ssl" with "cert" and "key" paths, or "extra_verbs"
  /// with a list of non-standard verbs to tunnel as POST requests)
  pub adapter_options: HashMap<String, Value>,
  /// Whether the server runs behind a proxy. When set, the trusted forwarding headers are
  /// applied to each request before it is dispatched.
  pub runs_behind_proxy: bool,
  /// The allow-list of trusted forwarding headers when running behind a proxy
  pub trusted_headers: Vec<String>
}

impl Default for Configuration {
  fn default() -> Configuration {
    Configuration {
      ip: "0.0.0.0".to_string(),
      port: 8080,
      adapter: "hyper".to_string(),
      adapter_options: HashMap::new(),
      runs_behind_proxy: false,
      trusted_headers: Vec::new()
    }
  }
}
