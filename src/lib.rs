/*!
# httpmachine

httpmachine is a finite state machine for the HTTP protocol that provides semantic HTTP
resource handling, based on the well-known HTTP decision diagram. Instead of pattern-matching
on requests, you describe what is relevant about a resource (which methods it allows, which
media types it produces, its validators for conditional requests) and the decision graph
produces the correct status code, headers and body for you.

REQUEST -> adapter -> Dispatcher -> Resource -> your application code -> Response -> adapter -> RESPONSE

## Features

- Handles the hard parts of content negotiation, conditional requests, and response codes for you.
- Provides a resource trait and struct with points of extension to let you describe what is
  relevant about your particular resource.
- Routes with path variables, trailing wildcards and guard predicates.
- A hyper/tokio server adapter with optional TLS, and a chunked-transfer body encoder for
  transports without native chunked framing.

There are two ways of using this crate. You can either use the `DynamicResource` struct and
add callbacks for the behaviour you need to change, or you can create your own resource
structs and implement the `Resource` trait.

You need to define a `Dispatcher` that maps routes to your resources (`DynamicResource` or
structs that implement `Resource`). Routes are matched in registration order and the first
match wins.

## Getting started

 ```no_run
 use std::future::ready;

 use bytes::Bytes;
 use futures_util::future::FutureExt;
 use serde_json::json;

 use httpmachine::*;
 use httpmachine::adapter::HyperAdapter;
 use httpmachine::config::Configuration;
 use httpmachine::route::Route;

 # fn main() {}

 async fn start_server() -> anyhow::Result<()> {
   // The dispatcher maps routes to resources. Each route carries a factory so that a fresh
   // resource is built for every matched request.
   let dispatcher = Dispatcher::new(vec![
     Route::new("/myresource", || DynamicResource {
       // Methods allowed on this resource
       allowed_methods: owned_vec(&["OPTIONS", "GET", "HEAD", "POST"]),
       // if the resource exists callback
       resource_exists: callback(|_, _| true),
       // callback to render the response for the resource, it has to be async
       render_response: async_callback(|_, _| {
         let json_response = json!({
           "data": [1, 2, 3, 4]
         });
         ready(Ok(Some(Bytes::from(json_response.to_string())))).boxed()
       }),
       // callback to process the post for the resource
       process_post: async_callback(|_, _| /* Handle the post here */ ready(Ok(true)).boxed()),
       // default everything else
       .. DynamicResource::default()
     })
   ]);

   // The adapter owns the network side: it binds, accepts connections, translates between
   // the wire and the dispatcher, and serialises responses back out.
   let adapter = HyperAdapter::new(Configuration::default(), dispatcher);
   adapter.start().await
 }
 ```
*/

#![warn(missing_docs)]

use std::collections::HashMap;
use std::fmt::{Debug, Display, Formatter};
use std::future::{Future, ready};
use std::pin::Pin;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use futures_util::future::FutureExt;
use itertools::Itertools;
use tracing::{debug, trace};

use context::{Context, Response};
use route::Route;

pub mod headers;
pub mod config;
pub mod context;
pub mod content_negotiation;
pub mod route;
pub mod machine;
pub mod chunked;
pub mod adapter;

#[cfg(test)]
mod machine_tests;


/// Error for request content that cannot be interpreted safely enough to run the decision
/// graph (e.g. unparsable negotiation headers). Surfaced as a 400 response carrying the
/// message; never treated as a server fault.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MalformedRequest {
  /// Description of the problem with the request content
  pub message: String
}

impl Display for MalformedRequest {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "malformed request: {}", self.message)
  }
}

impl std::error::Error for MalformedRequest {}

/// Type of a resource callback
pub type Callback<T> = Box<dyn Fn(&mut Context, &DynamicResource) -> T + Send + Sync>;

/// Wrap a callback in a structure that is safe to call between threads
pub fn callback<T, RT>(cb: T) -> Callback<RT>
  where T: Fn(&mut Context, &DynamicResource) -> RT + Send + Sync + 'static {
  Box::new(cb)
}

/// Type of an async resource callback
pub type AsyncCallback<T> = Pin<Box<dyn Fn(&mut Context, &DynamicResource) -> Pin<Box<dyn Future<Output=T> + Send>> + Send + Sync>>;

/// Wrap an async callback in a structure that is safe to call between threads
pub fn async_callback<T, RT>(cb: T) -> Pin<Box<T>>
  where T: Fn(&mut Context, &DynamicResource) -> Pin<Box<dyn Future<Output=RT> + Send>> {
  Box::pin(cb)
}

/// Convenience function to create a vector of string structs from a slice of strings
pub fn owned_vec(strings: &[&str]) -> Vec<String> {
  strings.iter().map(|s| s.to_string()).collect()
}

/// The capability contract all resources implement. The decision graph queries these
/// callbacks at its decision points; every callback has a sensible default, so a minimal
/// resource only needs to implement content generation.
#[async_trait]
pub trait Resource: Debug {
  /// This is called just before the final response is constructed and sent. It allows the
  /// resource an opportunity to modify the response after the state machine has executed.
  fn finalise_response(&self, _context: &mut Context) {}

  /// This is invoked to render the response for the resource
  async fn render_response(&self, _context: &mut Context) -> anyhow::Result<Option<Bytes>> {
    Ok(None)
  }

  /// Renders the body for an error response. Return None to use the built-in minimal body.
  /// The response status is available on the context when this is invoked.
  fn render_error(&self, _context: &mut Context) -> Option<Bytes> {
    None
  }

  /// Is the resource available? Returning false will result in a '503 Service Not Available'
  /// response. Defaults to true. If the resource is only temporarily not available,
  /// add a 'Retry-After' response header.
  fn available(&self, _context: &mut Context) -> bool {
    true
  }

  /// HTTP methods that are known to the resource. Default includes all standard HTTP methods.
  /// One could override this to allow additional methods
  fn known_methods(&self) -> Vec<&str> {
    vec!["OPTIONS", "GET", "POST", "PUT", "DELETE", "HEAD", "TRACE", "CONNECT", "PATCH"]
  }

  /// If the URI is too long to be processed, this should return true, which will result in a
  /// '414 Request URI Too Long' response. Defaults to false.
  fn uri_too_long(&self, _context: &mut Context) -> bool {
    false
  }

  /// HTTP methods that are allowed on this resource. Defaults to 'OPTIONS', 'GET' and 'HEAD'.
  fn allowed_methods(&self) -> Vec<&str> {
    vec!["OPTIONS", "GET", "HEAD"]
  }

  /// If the request is malformed, this should return true, which will result in a
  /// '400 Malformed Request' response. Defaults to false.
  fn malformed_request(&self, _context: &mut Context) -> bool {
    false
  }

  /// Is the client or request not authorized? Returning a Some<String>
  /// will result in a '401 Unauthorized' response. Defaults to None. If a Some(String) is
  /// returned, the string will be used as the value in the WWW-Authenticate header.
  fn not_authorized(&self, _context: &mut Context) -> Option<String> {
    None
  }

  /// Is the request or client forbidden? Returning true will result in a '403 Forbidden'
  /// response. Defaults to false.
  fn forbidden(&self, _context: &mut Context) -> bool {
    false
  }

  /// If the request includes any invalid Content-* headers, this should return true, which
  /// will result in a '501 Not Implemented' response. Defaults to false.
  fn unsupported_content_headers(&self, _context: &mut Context) -> bool {
    false
  }

  /// The list of acceptable content types. Defaults to 'application/json'. If the content
  /// type of a PUT or POST request is not in this list, a '415 Unsupported Media Type'
  /// response is returned. Wild cards can be used, like `*/*`, `type/*` or `*/sub-type`.
  fn acceptable_content_types(&self, _context: &mut Context) -> Vec<&str> {
    vec!["application/json"]
  }

  /// If the entity length on PUT or POST is invalid, this should return false, which will
  /// result in a '413 Request Entity Too Large' response. Defaults to true.
  fn valid_entity_length(&self, _context: &mut Context) -> bool {
    true
  }

  /// This is called just after the response body is rendered and before the final response
  /// is constructed and sent, on every execution path (including error paths), exactly once
  /// per request. Resources can release any acquired handles here. The default
  /// implementation adds CORS headers to the response.
  fn finish_request(&self, context: &mut Context) {
    context.response.add_cors_headers(self.allowed_methods().as_slice())
  }

  /// If the OPTIONS method is supported and is used, this returns a HashMap of headers that
  /// should appear in the response. Defaults to CORS headers.
  fn options(&self, _context: &mut Context) -> Option<HashMap<String, Vec<String>>> {
    Some(Response::cors_headers(self.allowed_methods().as_slice()))
  }

  /// The list of content types that this resource produces. Defaults to 'application/json'.
  /// If more than one is provided, and the client does not supply an Accept header, the
  /// first one will be selected.
  fn produces(&self) -> Vec<&str> {
    vec!["application/json"]
  }

  /// The list of content languages that this resource provides. Defaults to an empty list,
  /// which represents all languages. If more than one is provided, and the client does not
  /// supply an Accept-Language header, the first one will be selected.
  fn languages_provided(&self) -> Vec<&str> {
    vec![]
  }

  /// The list of charsets that this resource provides. Defaults to an empty list,
  /// which represents all charsets with ISO-8859-1 as the default. If more than one is
  /// provided, and the client does not supply an Accept-Charset header, the first one will
  /// be selected.
  fn charsets_provided(&self) -> Vec<&str> {
    vec![]
  }

  /// The list of encodings your resource wants to provide. The encoding will be applied to
  /// the response body automatically. Default includes only the 'identity' encoding.
  fn encodings_provided(&self) -> Vec<&str> {
    vec!["identity"]
  }

  /// The list of header names that should be included in the response's Vary header. The
  /// standard content negotiation headers (Accept, Accept-Encoding, Accept-Charset,
  /// Accept-Language) do not need to be specified here as the machine will add the correct
  /// elements of those automatically depending on resource behaviour. Default is an empty
  /// list.
  fn variances(&self) -> Vec<&str> {
    vec![]
  }

  /// Does the resource exist? Returning a false value will result in a '404 Not Found'
  /// response unless it is a PUT or POST. Defaults to true.
  async fn resource_exists(&self, _context: &mut Context) -> bool {
    true
  }

  /// If this resource is known to have existed previously, this should return true. Default
  /// is false.
  fn previously_existed(&self, _context: &mut Context) -> bool {
    false
  }

  /// If this resource has moved to a new location permanently, this should return the new
  /// location as a String. Default is to return None
  fn moved_permanently(&self, _context: &mut Context) -> Option<String> {
    None
  }

  /// If this resource has moved to a new location temporarily, this should return the new
  /// location as a String. Default is to return None
  fn moved_temporarily(&self, _context: &mut Context) -> Option<String> {
    None
  }

  /// If this returns true, the client will receive a '409 Conflict' response. This is only
  /// called for PUT requests. Default is false.
  fn is_conflict(&self, _context: &mut Context) -> bool {
    false
  }

  /// Return true if the resource accepts POST requests to nonexistent resources. Defaults
  /// to false.
  fn allow_missing_post(&self, _context: &mut Context) -> bool {
    false
  }

  /// If this returns a value, it will be used as the value of the ETag header and for
  /// comparison in conditional requests. Default is None.
  fn generate_etag(&self, _context: &mut Context) -> Option<String> {
    None
  }

  /// Returns the last modified date and time of the resource which will be added as the
  /// Last-Modified header in the response and used in negotiating conditional requests.
  /// Default is None
  fn last_modified(&self, _context: &mut Context) -> Option<DateTime<FixedOffset>> {
    None
  }

  /// If the resource expires, this should return the date/time it expires. Default is None.
  fn expires(&self, _context: &mut Context) -> Option<DateTime<FixedOffset>> {
    None
  }

  /// Called when a DELETE request should be enacted. Return `Ok(true)` if the deletion
  /// succeeded, and `Ok(false)` if the deletion was accepted but cannot yet be guaranteed to
  /// have finished. If the delete fails for any reason, return an Err with the status code
  /// you wish returned (a 500 status makes sense). Defaults to `Ok(true)`.
  async fn delete_resource(&self, _context: &mut Context) -> Result<bool, u16> {
    Ok(true)
  }

  /// If POST requests should be treated as a request to put content into a (potentially new)
  /// resource as opposed to a generic submission for processing, then this should return
  /// true. If it does return true, then `create_path` will be called and the rest of the
  /// request will be treated much like a PUT to the path returned by that call. Default is
  /// false.
  fn post_is_create(&self, _context: &mut Context) -> bool {
    false
  }

  /// If `post_is_create` returns false, then this will be called to process any POST
  /// request. If it succeeds, return `Ok(true)`, `Ok(false)` otherwise. If it fails for any
  /// reason, return an Err with the status code you wish returned (e.g., a 500 status makes
  /// sense). Default is false. If you want the result of processing the POST to be a
  /// redirect, set `context.redirect` to true.
  async fn process_post(&self, _context: &mut Context) -> Result<bool, u16> {
    Ok(false)
  }

  /// This will be called on a POST request if `post_is_create` returns true. It should
  /// create the new resource and return the path as a valid URI part following the
  /// dispatcher prefix. That path will replace the previous one in the return value of
  /// `Request.request_path` for all subsequent resource function calls in the course of this
  /// request and will be set as the value of the Location header of the response. If it
  /// fails for any reason, return an Err with the status code you wish returned (e.g., a 500
  /// status makes sense). Default will return an `Ok(Request.request_path)`. If you want the
  /// result of processing the POST to be a redirect, set `context.redirect` to true.
  async fn create_path(&self, context: &mut Context) -> Result<String, u16> {
    Ok(context.request.request_path.clone())
  }

  /// This will be called to process any PUT request. If it succeeds, return `Ok(true)`,
  /// `Ok(false)` otherwise. If it fails for any reason, return an Err with the status code
  /// you wish returned (e.g., a 500 status makes sense). Default is `Ok(true)`
  async fn process_put(&self, _context: &mut Context) -> Result<bool, u16> {
    Ok(true)
  }

  /// If this returns true, then it is assumed that multiple representations of the response
  /// are possible and a single one cannot be automatically chosen, so a 300 Multiple Choices
  /// will be sent instead of a 200. Default is false.
  fn multiple_choices(&self, _context: &mut Context) -> bool {
    false
  }
}

/// A resource assembled from callbacks instead of a trait implementation. Every field has a
/// default matching the `Resource` trait defaults, so only the callbacks of interest need to
/// be supplied.
pub struct DynamicResource {
  /// This is called just before the final response is constructed and sent. It allows the
  /// resource an opportunity to modify the response after the state machine has executed.
  pub finalise_response: Option<Callback<()>>,
  /// This is invoked to render the response for the resource
  pub render_response: AsyncCallback<anyhow::Result<Option<Bytes>>>,
  /// Renders the body for an error response. Return None to use the built-in minimal body.
  pub render_error: Callback<Option<Bytes>>,
  /// Is the resource available? Returning false will result in a '503 Service Not Available'
  /// response. Defaults to true.
  pub available: Callback<bool>,
  /// HTTP methods that are known to the resource. Default includes all standard HTTP methods.
  pub known_methods: Vec<String>,
  /// If the URI is too long to be processed, this should return true, which will result in a
  /// '414 Request URI Too Long' response. Defaults to false.
  pub uri_too_long: Callback<bool>,
  /// HTTP methods that are allowed on this resource. Defaults to 'OPTIONS', 'GET' and 'HEAD'.
  pub allowed_methods: Vec<String>,
  /// If the request is malformed, this should return true, which will result in a
  /// '400 Malformed Request' response. Defaults to false.
  pub malformed_request: Callback<bool>,
  /// Is the client or request not authorized? Returning a Some<String> will result in a
  /// '401 Unauthorized' response with the string as the WWW-Authenticate header value.
  pub not_authorized: Callback<Option<String>>,
  /// Is the request or client forbidden? Returning true will result in a '403 Forbidden'
  /// response. Defaults to false.
  pub forbidden: Callback<bool>,
  /// If the request includes any invalid Content-* headers, this should return true, which
  /// will result in a '501 Not Implemented' response. Defaults to false.
  pub unsupported_content_headers: Callback<bool>,
  /// The list of acceptable content types for PUT and POST requests. Defaults to
  /// 'application/json'. Wild cards can be used, like `*/*`, `type/*` or `*/sub-type`.
  pub acceptable_content_types: Vec<String>,
  /// If the entity length on PUT or POST is invalid, this should return false, which will
  /// result in a '413 Request Entity Too Large' response. Defaults to true.
  pub valid_entity_length: Callback<bool>,
  /// Called on every execution path, exactly once per request, before the final response is
  /// sent. The default implementation adds CORS headers to the response.
  pub finish_request: Callback<()>,
  /// If the OPTIONS method is supported and is used, this returns a HashMap of headers that
  /// should appear in the response. Defaults to CORS headers.
  pub options: Callback<Option<HashMap<String, Vec<String>>>>,
  /// The list of content types that this resource produces. Defaults to 'application/json'.
  pub produces: Vec<String>,
  /// The list of content languages that this resource provides. An empty list represents
  /// all languages.
  pub languages_provided: Vec<String>,
  /// The list of charsets that this resource provides. An empty list represents all
  /// charsets with ISO-8859-1 as the default.
  pub charsets_provided: Vec<String>,
  /// The list of encodings this resource wants to provide. Default includes only the
  /// 'identity' encoding.
  pub encodings_provided: Vec<String>,
  /// The list of extra header names that should be included in the response's Vary header.
  pub variances: Vec<String>,
  /// Does the resource exist? Returning a false value will result in a '404 Not Found'
  /// response unless it is a PUT or POST. Defaults to true.
  pub resource_exists: Callback<bool>,
  /// If this resource is known to have existed previously, this should return true.
  /// Default is false.
  pub previously_existed: Callback<bool>,
  /// If this resource has moved to a new location permanently, this should return the new
  /// location as a String.
  pub moved_permanently: Callback<Option<String>>,
  /// If this resource has moved to a new location temporarily, this should return the new
  /// location as a String.
  pub moved_temporarily: Callback<Option<String>>,
  /// If this returns true, the client will receive a '409 Conflict' response. This is only
  /// called for PUT requests. Default is false.
  pub is_conflict: Callback<bool>,
  /// Return true if the resource accepts POST requests to nonexistent resources. Defaults
  /// to false.
  pub allow_missing_post: Callback<bool>,
  /// If this returns a value, it will be used as the value of the ETag header and for
  /// comparison in conditional requests. Default is None.
  pub generate_etag: Callback<Option<String>>,
  /// Returns the last modified date and time of the resource. Default is None.
  pub last_modified: Callback<Option<DateTime<FixedOffset>>>,
  /// If the resource expires, this should return the date/time it expires. Default is None.
  pub expires: Callback<Option<DateTime<FixedOffset>>>,
  /// Called when a DELETE request should be enacted. Defaults to `Ok(true)`.
  pub delete_resource: Callback<Result<bool, u16>>,
  /// If POST requests should be treated as a request to put content into a (potentially
  /// new) resource as opposed to a generic submission for processing. Default is false.
  pub post_is_create: Callback<bool>,
  /// Called to process a POST request when `post_is_create` returns false. Default is
  /// `Ok(false)`.
  pub process_post: AsyncCallback<Result<bool, u16>>,
  /// Called on a POST request when `post_is_create` returns true; returns the path of the
  /// created resource. Default returns the current request path.
  pub create_path: Callback<Result<String, u16>>,
  /// Called to process any PUT request. Default is `Ok(true)`.
  pub process_put: Callback<Result<bool, u16>>,
  /// If multiple representations of the response are possible, so a 300 Multiple Choices
  /// should be sent instead of a 200. Default is false.
  pub multiple_choices: Callback<bool>
}

fn true_fn(_: &mut Context, _: &DynamicResource) -> bool {
  true
}

fn false_fn(_: &mut Context, _: &DynamicResource) -> bool {
  false
}

fn none_fn<T>(_: &mut Context, _: &DynamicResource) -> Option<T> {
  None
}

impl Default for DynamicResource {
  fn default() -> DynamicResource {
    DynamicResource {
      finalise_response: None,
      render_response: async_callback(|_, _| ready(Ok(None)).boxed()),
      render_error: callback(none_fn),
      available: callback(true_fn),
      known_methods: owned_vec(&["OPTIONS", "GET", "POST", "PUT", "DELETE", "HEAD", "TRACE", "CONNECT", "PATCH"]),
      uri_too_long: callback(false_fn),
      allowed_methods: owned_vec(&["OPTIONS", "GET", "HEAD"]),
      malformed_request: callback(false_fn),
      not_authorized: callback(none_fn),
      forbidden: callback(false_fn),
      unsupported_content_headers: callback(false_fn),
      acceptable_content_types: owned_vec(&["application/json"]),
      valid_entity_length: callback(true_fn),
      finish_request: callback(|context, resource| {
        let methods = resource.allowed_methods.iter()
          .map(|m| m.as_str())
          .collect_vec();
        context.response.add_cors_headers(methods.as_slice())
      }),
      options: callback(|_, resource| {
        let methods = resource.allowed_methods.iter()
          .map(|m| m.as_str())
          .collect_vec();
        Some(Response::cors_headers(methods.as_slice()))
      }),
      produces: owned_vec(&["application/json"]),
      languages_provided: Vec::new(),
      charsets_provided: Vec::new(),
      encodings_provided: owned_vec(&["identity"]),
      variances: Vec::new(),
      resource_exists: callback(true_fn),
      previously_existed: callback(false_fn),
      moved_permanently: callback(none_fn),
      moved_temporarily: callback(none_fn),
      is_conflict: callback(false_fn),
      allow_missing_post: callback(false_fn),
      generate_etag: callback(none_fn),
      last_modified: callback(none_fn),
      expires: callback(none_fn),
      delete_resource: callback(|_, _| Ok(true)),
      post_is_create: callback(false_fn),
      process_post: async_callback(|_, _| ready(Ok(false)).boxed()),
      create_path: callback(|context, _| Ok(context.request.request_path.clone())),
      process_put: callback(|_, _| Ok(true)),
      multiple_choices: callback(false_fn)
    }
  }
}

impl Debug for DynamicResource {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "DynamicResource{{}}")
  }
}

#[async_trait]
impl Resource for DynamicResource {
  fn finalise_response(&self, context: &mut Context) {
    if let Some(callback) = &self.finalise_response {
      callback(context, self);
    }
  }

  async fn render_response(&self, context: &mut Context) -> anyhow::Result<Option<Bytes>> {
    (self.render_response)(context, self).await
  }

  fn render_error(&self, context: &mut Context) -> Option<Bytes> {
    (self.render_error)(context, self)
  }

  fn available(&self, context: &mut Context) -> bool {
    (self.available)(context, self)
  }

  fn known_methods(&self) -> Vec<&str> {
    self.known_methods.iter()
      .map(|s| s.as_str())
      .collect()
  }

  fn uri_too_long(&self, context: &mut Context) -> bool {
    (self.uri_too_long)(context, self)
  }

  fn allowed_methods(&self) -> Vec<&str> {
    self.allowed_methods.iter()
      .map(|s| s.as_str())
      .collect()
  }

  fn malformed_request(&self, context: &mut Context) -> bool {
    (self.malformed_request)(context, self)
  }

  fn not_authorized(&self, context: &mut Context) -> Option<String> {
    (self.not_authorized)(context, self)
  }

  fn forbidden(&self, context: &mut Context) -> bool {
    (self.forbidden)(context, self)
  }

  fn unsupported_content_headers(&self, context: &mut Context) -> bool {
    (self.unsupported_content_headers)(context, self)
  }

  fn acceptable_content_types(&self, _context: &mut Context) -> Vec<&str> {
    self.acceptable_content_types.iter()
      .map(|s| s.as_str())
      .collect_vec()
  }

  fn valid_entity_length(&self, context: &mut Context) -> bool {
    (self.valid_entity_length)(context, self)
  }

  fn finish_request(&self, context: &mut Context) {
    (self.finish_request)(context, self)
  }

  fn options(&self, context: &mut Context) -> Option<HashMap<String, Vec<String>>> {
    (self.options)(context, self)
  }

  fn produces(&self) -> Vec<&str> {
    self.produces.iter()
      .map(|s| s.as_str())
      .collect_vec()
  }

  fn languages_provided(&self) -> Vec<&str> {
    self.languages_provided.iter()
      .map(|s| s.as_str())
      .collect_vec()
  }

  fn charsets_provided(&self) -> Vec<&str> {
    self.charsets_provided.iter()
      .map(|s| s.as_str())
      .collect_vec()
  }

  fn encodings_provided(&self) -> Vec<&str> {
    self.encodings_provided.iter()
      .map(|s| s.as_str())
      .collect_vec()
  }

  fn variances(&self) -> Vec<&str> {
    self.variances.iter()
      .map(|s| s.as_str())
      .collect_vec()
  }

  async fn resource_exists(&self, context: &mut Context) -> bool {
    (self.resource_exists)(context, self)
  }

  fn previously_existed(&self, context: &mut Context) -> bool {
    (self.previously_existed)(context, self)
  }

  fn moved_permanently(&self, context: &mut Context) -> Option<String> {
    (self.moved_permanently)(context, self)
  }

  fn moved_temporarily(&self, context: &mut Context) -> Option<String> {
    (self.moved_temporarily)(context, self)
  }

  fn is_conflict(&self, context: &mut Context) -> bool {
    (self.is_conflict)(context, self)
  }

  fn allow_missing_post(&self, context: &mut Context) -> bool {
    (self.allow_missing_post)(context, self)
  }

  fn generate_etag(&self, context: &mut Context) -> Option<String> {
    (self.generate_etag)(context, self)
  }

  fn last_modified(&self, context: &mut Context) -> Option<DateTime<FixedOffset>> {
    (self.last_modified)(context, self)
  }

  fn expires(&self, context: &mut Context) -> Option<DateTime<FixedOffset>> {
    (self.expires)(context, self)
  }

  async fn delete_resource(&self, context: &mut Context) -> Result<bool, u16> {
    (self.delete_resource)(context, self)
  }

  fn post_is_create(&self, context: &mut Context) -> bool {
    (self.post_is_create)(context, self)
  }

  async fn process_post(&self, context: &mut Context) -> Result<bool, u16> {
    (self.process_post)(context, self).await
  }

  async fn create_path(&self, context: &mut Context) -> Result<String, u16> {
    (self.create_path)(context, self)
  }

  async fn process_put(&self, context: &mut Context) -> Result<bool, u16> {
    (self.process_put)(context, self)
  }

  fn multiple_choices(&self, context: &mut Context) -> bool {
    (self.multiple_choices)(context, self)
  }
}

/// The main dispatcher. Routes are matched in registration order against the request path
/// (and guard, when one is set); the first matching route wins, its bindings are applied to
/// the request, and a fresh resource is built from its factory to handle the request.
pub struct Dispatcher {
  /// Ordered list of routes. Registered once at startup and read-only afterwards.
  pub routes: Vec<Route>
}

impl Dispatcher {
  /// Creates a dispatcher with the given routes
  pub fn new(routes: Vec<Route>) -> Dispatcher {
    Dispatcher {
      routes
    }
  }

  /// Dispatches the request in the context to the first matching route's resource and
  /// executes the state machine against it. If no route matches, a 404 Not Found response
  /// is generated.
  pub async fn dispatch(&self, context: &mut Context) {
    let body_size = context.request.body.as_ref().map(|bytes| bytes.len()).unwrap_or_default();
    debug!(method = %context.request.method, request_path = context.request.request_path,
      headers = ?context.request.headers, query = ?context.request.query(), body_size,
      "Incoming request");
    match self.routes.iter().find(|route| route.matches(&context.request)) {
      Some(route) => {
        route.apply(&mut context.request);
        let resource = route.resource();
        trace!("Dispatching to resource {:?}", resource);
        machine::run(context, resource.as_ref()).await;
      },
      None => {
        debug!("No route matches the request path '{}'", context.request.request_path);
        context.response.status = 404;
        machine::render_error_body(context, None, None);
      }
    }
  }
}
