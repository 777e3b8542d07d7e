//! Routing of requests to resources. A route is an ordered list of path segments (literal,
//! `{variable}` binder or a trailing `*` wildcard), an optional guard predicate over the
//! request, and a factory that builds a fresh resource for each matched request.

use std::collections::HashMap;
use std::fmt::{Debug, Formatter};

use itertools::Itertools;

use crate::Resource;
use crate::context::Request;

/// A single segment of a route template
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteSegment {
  /// Segment that must match exactly
  Literal(String),
  /// Segment that always matches and binds the matched value under the variable name
  Variable(String),
  /// Trailing segment that matches zero or more remaining path segments
  Wildcard
}

impl RouteSegment {
  fn parse(segment: &str) -> RouteSegment {
    if segment == "*" {
      RouteSegment::Wildcard
    } else if segment.starts_with('{') && segment.ends_with('}') {
      RouteSegment::Variable(segment[1..(segment.len() - 1)].to_string())
    } else {
      RouteSegment::Literal(segment.to_string())
    }
  }
}

/// Parses a route template like `/orders/{id}/items/*` into its segments. A wildcard is only
/// valid as the final segment.
pub fn parse_route_template(template: &str) -> Vec<RouteSegment> {
  let segments = template.split('/')
    .filter(|s| !s.is_empty())
    .map(RouteSegment::parse)
    .collect_vec();
  let wildcards = segments.iter().filter(|s| **s == RouteSegment::Wildcard).count();
  assert!(wildcards == 0 || (wildcards == 1 && segments.last() == Some(&RouteSegment::Wildcard)),
    "a wildcard is only valid as the final segment of a route template: {}", template);
  segments
}

fn path_segments(path: &str) -> Vec<String> {
  path.split('/').filter(|s| !s.is_empty()).map(|s| s.to_string()).collect()
}

/// Guard predicate evaluated against the request after the path has matched
pub type RouteGuard = Box<dyn Fn(&Request) -> bool + Send + Sync>;

/// Factory that builds the resource handling a matched request
pub type ResourceFactory = Box<dyn Fn() -> Box<dyn Resource + Send + Sync> + Send + Sync>;

/// Route binding a path pattern (plus optional guard) to a resource factory
pub struct Route {
  /// Pattern segments the request path is matched against
  pub pattern: Vec<RouteSegment>,
  /// Optional guard predicate. The route only matches if both the path and the guard match.
  pub guard: Option<RouteGuard>,
  /// Statically configured extra bindings, merged into the path bindings on apply. These are
  /// never overridden by path-derived bindings.
  pub bindings: HashMap<String, String>,
  factory: ResourceFactory
}

impl Route {
  /// Creates a route for the template, with a factory producing a fresh resource per request
  pub fn new<F, R>(template: &str, factory: F) -> Route
    where F: Fn() -> R + Send + Sync + 'static,
          R: Resource + Send + Sync + 'static {
    Route {
      pattern: parse_route_template(template),
      guard: None,
      bindings: HashMap::new(),
      factory: Box::new(move || Box::new(factory()) as Box<dyn Resource + Send + Sync>)
    }
  }

  /// Adds a guard predicate to the route
  pub fn with_guard<G>(mut self, guard: G) -> Route
    where G: Fn(&Request) -> bool + Send + Sync + 'static {
    self.guard = Some(Box::new(guard));
    self
  }

  /// Adds statically configured bindings to the route
  pub fn with_bindings(mut self, bindings: HashMap<String, String>) -> Route {
    self.bindings = bindings;
    self
  }

  /// If this route matches the request: the path must match the pattern, and the guard (when
  /// there is one) must pass. The guard is only evaluated once the path has matched.
  pub fn matches(&self, request: &Request) -> bool {
    self.matches_path(&path_segments(&request.request_path)) &&
      self.guard.as_ref().map(|guard| guard(request)).unwrap_or(true)
  }

  fn matches_path(&self, segments: &[String]) -> bool {
    for (index, segment) in self.pattern.iter().enumerate() {
      match segment {
        RouteSegment::Wildcard => return true,
        RouteSegment::Literal(expected) => {
          if segments.get(index) != Some(expected) {
            return false
          }
        },
        RouteSegment::Variable(_) => {
          if index >= segments.len() {
            return false
          }
        }
      }
    }
    self.pattern.len() == segments.len()
  }

  /// Applies the route to a matched request: sets the dispatch path, the path bindings
  /// (path-derived values merged under the static bindings) and the wildcard path tokens,
  /// and rewrites the request path to the part beyond the consumed prefix.
  pub fn apply(&self, request: &mut Request) {
    let segments = path_segments(&request.request_path);
    let mut path_vars = HashMap::new();
    let mut wildcard_index = None;

    for (index, segment) in self.pattern.iter().enumerate() {
      match segment {
        RouteSegment::Literal(_) => (),
        RouteSegment::Variable(name) => {
          path_vars.insert(name.clone(), segments[index].clone());
        },
        RouteSegment::Wildcard => {
          wildcard_index = Some(index);
          break
        }
      }
    }
    for (key, value) in &self.bindings {
      path_vars.insert(key.clone(), value.clone());
    }

    let consumed = wildcard_index.unwrap_or(segments.len());
    request.disp_path = segments[wildcard_index.unwrap_or(0)..].join("/");
    request.path_tokens = match wildcard_index {
      Some(index) => segments[index..].to_vec(),
      None => Vec::new()
    };
    request.path_vars = path_vars;
    request.base_path = if consumed == 0 {
      "/".to_string()
    } else {
      format!("/{}", segments[..consumed].join("/"))
    };
    request.request_path = if consumed == segments.len() {
      "/".to_string()
    } else {
      format!("/{}", segments[consumed..].join("/"))
    };
  }

  /// Builds a fresh resource for a request matched by this route
  pub fn resource(&self) -> Box<dyn Resource + Send + Sync> {
    (self.factory)()
  }
}

impl Debug for Route {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Route")
      .field("pattern", &self.pattern)
      .field("guarded", &self.guard.is_some())
      .field("bindings", &self.bindings)
      .finish()
  }
}
