//! The `context` module encapsulates the environment that the state machine executes in.
//! Basically wraps the request and response.

use std::any::Any;
use std::collections::{BTreeMap, HashMap};
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset};
use futures::stream::BoxStream;
use http::Uri;
use http::uri::{Authority, PathAndQuery, Scheme};
use maplit::hashmap;
use once_cell::sync::OnceCell;

use crate::headers::HeaderValue;

/// HTTP methods. Custom verbs are supported through the `Extension` variant.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Method {
  /// GET request
  Get,
  /// HEAD request
  Head,
  /// POST request
  Post,
  /// PUT request
  Put,
  /// DELETE request
  Delete,
  /// OPTIONS request
  Options,
  /// TRACE request
  Trace,
  /// CONNECT request
  Connect,
  /// PATCH request
  Patch,
  /// Any non-standard verb (stored uppercased)
  Extension(String)
}

impl Method {
  /// Parses a method from its string form. Unknown verbs become `Extension` values.
  pub fn parse(method: &str) -> Method {
    match method.to_uppercase().as_str() {
      "GET" => Method::Get,
      "HEAD" => Method::Head,
      "POST" => Method::Post,
      "PUT" => Method::Put,
      "DELETE" => Method::Delete,
      "OPTIONS" => Method::Options,
      "TRACE" => Method::Trace,
      "CONNECT" => Method::Connect,
      "PATCH" => Method::Patch,
      _ => Method::Extension(method.to_uppercase())
    }
  }

  /// The wire form of the method
  pub fn as_str(&self) -> &str {
    match self {
      Method::Get => "GET",
      Method::Head => "HEAD",
      Method::Post => "POST",
      Method::Put => "PUT",
      Method::Delete => "DELETE",
      Method::Options => "OPTIONS",
      Method::Trace => "TRACE",
      Method::Connect => "CONNECT",
      Method::Patch => "PATCH",
      Method::Extension(s) => s.as_str()
    }
  }
}

impl Display for Method {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.as_str())
  }
}

pub(crate) fn decode_query(query: &str) -> String {
  let mut chars = query.chars();
  let mut ch = chars.next();
  let mut result = String::new();

  while let Some(c) = ch {
    if c == '%' {
      let c1 = chars.next();
      let c2 = chars.next();
      match (c1, c2) {
        (Some(v1), Some(v2)) => {
          let mut s = String::new();
          s.push(v1);
          s.push(v2);
          match hex::decode(s) {
            Ok(n) => result.push(n[0] as char),
            Err(_) => {
              result.push('%');
              result.push(v1);
              result.push(v2);
            }
          }
        },
        (Some(v1), None) => {
          result.push('%');
          result.push(v1);
        },
        _ => result.push('%')
      }
    } else if c == '+' {
      result.push(' ');
    } else {
      result.push(c);
    }

    ch = chars.next();
  }

  result
}

fn parse_query(query: &str) -> HashMap<String, String> {
  query.split('&')
    .filter_map(|kv| kv.split_once('='))
    .map(|(k, v)| (decode_query(k), decode_query(v)))
    .collect()
}

/// Request that the state machine is executing against
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
  /// Requested URI. Includes the scheme, host and port when they are known.
  pub uri: Uri,
  /// Path of the request being dispatched. May be rewritten by `create_path` on POST.
  pub request_path: String,
  /// Path prefix consumed by the matched route
  pub base_path: String,
  /// Sub-path consumed by a trailing wildcard, or all matched segments when there is none
  pub disp_path: String,
  /// Path parts bound to route variables (parts like /{id} will have id mapped)
  pub path_vars: HashMap<String, String>,
  /// Ordered path segments matched by a trailing wildcard
  pub path_tokens: Vec<String>,
  /// Request method
  pub method: Method,
  /// Request headers
  pub headers: HashMap<String, Vec<HeaderValue>>,
  /// Request body
  pub body: Option<Bytes>,
  pub(crate) query: OnceCell<HashMap<String, String>>,
  pub(crate) cookies: OnceCell<HashMap<String, String>>
}

impl Default for Request {
  /// Creates a default request (GET /)
  fn default() -> Request {
    Request {
      uri: Uri::from_static("/"),
      request_path: "/".to_string(),
      base_path: "/".to_string(),
      disp_path: String::new(),
      path_vars: HashMap::new(),
      path_tokens: Vec::new(),
      method: Method::Get,
      headers: HashMap::new(),
      body: None,
      query: OnceCell::new(),
      cookies: OnceCell::new()
    }
  }
}

impl Request {
  /// Creates a request for the given method and URI
  pub fn new(method: Method, uri: Uri) -> Request {
    Request {
      request_path: uri.path().to_string(),
      uri,
      method,
      .. Request::default()
    }
  }

  /// Query parameters parsed from the request URI. Parsed once on first access; on duplicate
  /// keys the last value wins, and pairs without an `=` are dropped.
  pub fn query(&self) -> &HashMap<String, String> {
    self.query.get_or_init(|| {
      match self.uri.query() {
        Some(query) => parse_query(query),
        None => HashMap::new()
      }
    })
  }

  /// Cookies sent with the request, parsed from the `Cookie` header on first access
  pub fn cookies(&self) -> &HashMap<String, String> {
    self.cookies.get_or_init(|| {
      self.find_header("Cookie").iter()
        .flat_map(|header| {
          let mut pairs = Vec::new();
          if let Some((name, value)) = header.value.split_once('=') {
            pairs.push((name.trim().to_string(), value.trim().trim_matches('"').to_string()));
          }
          pairs.extend(header.params.iter().map(|(k, v)| (k.clone(), v.clone())));
          pairs
        })
        .collect()
    })
  }

  /// Returns the content type of the request, based on the content type header. Defaults to
  /// 'application/json' if there is no header.
  pub fn content_type(&self) -> HeaderValue {
    self.find_header("Content-Type").first().cloned()
      .unwrap_or_else(HeaderValue::json)
  }

  /// If the request is a put or post
  pub fn is_put_or_post(&self) -> bool {
    matches!(self.method, Method::Put | Method::Post)
  }

  /// If the request is a get or head request
  pub fn is_get_or_head(&self) -> bool {
    matches!(self.method, Method::Get | Method::Head)
  }

  /// If the request is a get
  pub fn is_get(&self) -> bool {
    self.method == Method::Get
  }

  /// If the request is an options
  pub fn is_options(&self) -> bool {
    self.method == Method::Options
  }

  /// If the request is a put
  pub fn is_put(&self) -> bool {
    self.method == Method::Put
  }

  /// If the request is a post
  pub fn is_post(&self) -> bool {
    self.method == Method::Post
  }

  /// If the request is a delete
  pub fn is_delete(&self) -> bool {
    self.method == Method::Delete
  }

  /// If an Accept header exists
  pub fn has_accept_header(&self) -> bool {
    self.has_header("Accept")
  }

  /// Returns the acceptable media types from the Accept header
  pub fn accept(&self) -> Vec<HeaderValue> {
    self.find_header("Accept")
  }

  /// If an Accept-Language header exists
  pub fn has_accept_language_header(&self) -> bool {
    self.has_header("Accept-Language")
  }

  /// Returns the acceptable languages from the Accept-Language header
  pub fn accept_language(&self) -> Vec<HeaderValue> {
    self.find_header("Accept-Language")
  }

  /// If an Accept-Charset header exists
  pub fn has_accept_charset_header(&self) -> bool {
    self.has_header("Accept-Charset")
  }

  /// Returns the acceptable charsets from the Accept-Charset header
  pub fn accept_charset(&self) -> Vec<HeaderValue> {
    self.find_header("Accept-Charset")
  }

  /// If an Accept-Encoding header exists
  pub fn has_accept_encoding_header(&self) -> bool {
    self.has_header("Accept-Encoding")
  }

  /// Returns the acceptable encodings from the Accept-Encoding header
  pub fn accept_encoding(&self) -> Vec<HeaderValue> {
    self.find_header("Accept-Encoding")
  }

  /// If the request has the provided header
  pub fn has_header(&self, header: &str) -> bool {
    self.headers.keys().any(|k| k.eq_ignore_ascii_case(header))
  }

  /// Returns the list of values for the provided request header. If the header is not present,
  /// an empty vector is returned.
  pub fn find_header(&self, header: &str) -> Vec<HeaderValue> {
    self.headers.iter()
      .find(|(k, _)| k.eq_ignore_ascii_case(header))
      .map(|(_, values)| values.clone())
      .unwrap_or_default()
  }

  /// If the header has a matching value
  pub fn has_header_value(&self, header: &str, value: &str) -> bool {
    self.find_header(header).iter().any(|v| *v == value)
  }

  /// Applies the proxy-trust policy: drops any `X-` prefixed header that is not in the
  /// trusted allow-list, then rewrites the URI scheme, host and port from the remaining
  /// forwarding headers. Untrusted forwarding headers are never consulted.
  pub fn apply_proxy_support(&mut self, trusted_headers: &[String]) {
    self.headers.retain(|name, _| {
      !name.to_uppercase().starts_with("X-") ||
        trusted_headers.iter().any(|trusted| trusted.eq_ignore_ascii_case(name))
    });

    let scheme = self.forwarded_scheme();
    let host = self.find_header("X-Forwarded-Host").first().map(|h| h.value.clone());
    let port = self.find_header("X-Forwarded-Port").first()
      .and_then(|h| h.value.parse::<u16>().ok());
    self.rewrite_uri(&scheme, host, port);
  }

  fn forwarded_scheme(&self) -> String {
    if self.has_header_value("X-Forwarded-Https", "on") || self.has_header_value("X-Forwarded-Ssl", "on") {
      "https".to_string()
    } else if let Some(scheme) = self.find_header("X-Forwarded-Scheme").first() {
      scheme.value.clone()
    } else if self.has_header("X-Forwarded-Proto") {
      if self.find_header("X-Forwarded-Proto").iter().any(|p| p.value.trim() == "https") {
        "https".to_string()
      } else {
        "http".to_string()
      }
    } else {
      self.uri.scheme_str().unwrap_or("http").to_string()
    }
  }

  fn rewrite_uri(&mut self, scheme: &str, host: Option<String>, port: Option<u16>) {
    let host = host.or_else(|| self.uri.host().map(|h| h.to_string()));
    let Some(host) = host else { return };
    let port = port.or_else(|| self.uri.port_u16());
    let authority = match port {
      Some(port) => format!("{}:{}", host, port),
      None => host
    };

    let mut parts = self.uri.clone().into_parts();
    parts.scheme = Scheme::try_from(scheme).ok();
    parts.authority = Authority::try_from(authority.as_str()).ok();
    if parts.path_and_query.is_none() {
      parts.path_and_query = Some(PathAndQuery::from_static("/"));
    }
    if let Ok(uri) = Uri::from_parts(parts) {
      self.uri = uri;
    }
  }
}

/// Response body, which can be a fixed byte buffer, a lazy stream of byte chunks, or a
/// single-shot callable that produces one buffer when invoked
pub enum ResponseBody {
  /// No body
  None,
  /// Fully buffered body
  Bytes(Bytes),
  /// Lazy stream of body chunks
  Stream(BoxStream<'static, Bytes>),
  /// Single-shot producer, invoked once by the transport adapter
  Callable(Box<dyn FnOnce() -> Bytes + Send + 'static>)
}

impl ResponseBody {
  /// If there is no body, or the body is zero length
  pub fn is_empty(&self) -> bool {
    match self {
      ResponseBody::None => true,
      ResponseBody::Bytes(bytes) => bytes.is_empty(),
      _ => false
    }
  }

  /// The buffered bytes, if the body is a fixed buffer
  pub fn bytes(&self) -> Option<&Bytes> {
    match self {
      ResponseBody::Bytes(bytes) => Some(bytes),
      _ => None
    }
  }
}

impl Default for ResponseBody {
  fn default() -> Self {
    ResponseBody::None
  }
}

impl Debug for ResponseBody {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      ResponseBody::None => write!(f, "None"),
      ResponseBody::Bytes(bytes) => write!(f, "Bytes({})", bytes.len()),
      ResponseBody::Stream(_) => write!(f, "Stream"),
      ResponseBody::Callable(_) => write!(f, "Callable")
    }
  }
}

impl From<Bytes> for ResponseBody {
  fn from(bytes: Bytes) -> Self {
    ResponseBody::Bytes(bytes)
  }
}

impl From<String> for ResponseBody {
  fn from(body: String) -> Self {
    ResponseBody::Bytes(Bytes::from(body))
  }
}

impl From<&'static str> for ResponseBody {
  fn from(body: &'static str) -> Self {
    ResponseBody::Bytes(Bytes::from(body))
  }
}

/// Response that is generated as a result of the state machine execution
#[derive(Debug, Default)]
pub struct Response {
  /// Status code to return
  pub status: u16,
  /// Headers to return
  pub headers: BTreeMap<String, Vec<HeaderValue>>,
  /// Response body
  pub body: ResponseBody,
  /// Ordered list of decision states visited while processing the request
  pub trace: Vec<&'static str>,
  /// The state the machine was in when a fault occurred
  pub end_state: Option<&'static str>,
  /// Details of any fault that was contained while processing the request
  pub error: Option<String>
}

impl Response {
  /// Creates a default response (200 OK)
  pub fn new() -> Response {
    Response {
      status: 200,
      .. Response::default()
    }
  }

  /// If the response has the provided header
  pub fn has_header(&self, header: &str) -> bool {
    self.headers.keys().any(|k| k.eq_ignore_ascii_case(header))
  }

  /// Adds the header values to the headers
  pub fn add_header(&mut self, header: &str, values: Vec<HeaderValue>) {
    self.headers.insert(header.to_string(), values);
  }

  /// Adds the headers from a HashMap to the headers
  pub fn add_headers(&mut self, headers: HashMap<String, Vec<String>>) {
    for (k, v) in headers {
      self.headers.insert(k, v.iter().map(HeaderValue::basic).collect());
    }
  }

  /// Removes the header, matching the name case-insensitively
  pub fn remove_header(&mut self, header: &str) {
    self.headers.retain(|k, _| !k.eq_ignore_ascii_case(header));
  }

  /// Adds standard CORS headers to the response
  pub fn add_cors_headers(&mut self, allowed_methods: &[&str]) {
    let cors_headers = Response::cors_headers(allowed_methods);
    for (k, v) in cors_headers {
      self.add_header(k.as_str(), v.iter().map(HeaderValue::basic).collect());
    }
  }

  /// Returns a HashMap of standard CORS headers
  pub fn cors_headers(allowed_methods: &[&str]) -> HashMap<String, Vec<String>> {
    hashmap!{
      "Access-Control-Allow-Origin".to_string() => vec!["*".to_string()],
      "Access-Control-Allow-Methods".to_string() => allowed_methods.iter().map(|v| v.to_string()).collect(),
      "Access-Control-Allow-Headers".to_string() => vec!["Content-Type".to_string()]
    }
  }

  /// If the response has a body
  pub fn has_body(&self) -> bool {
    !self.body.is_empty()
  }
}

/// Trait for values that can be stored in the metadata store
pub trait MetaDataThing: Any + Debug {}

/// Values that can be stored as metadata
#[derive(Debug, Clone, Default)]
pub enum MetaDataValue {
  /// No value
  #[default]
  Empty,
  /// String value
  String(String),
  /// Unsigned integer
  UInteger(u64),
  /// Signed integer
  Integer(i64),
  /// Boxed Any
  Anything(Arc<dyn MetaDataThing + Send + Sync>)
}

impl MetaDataValue {
  /// If the metadata value is empty
  pub fn is_empty(&self) -> bool {
    matches!(self, MetaDataValue::Empty)
  }

  /// If the metadata value is a String
  pub fn as_string(&self) -> Option<String> {
    match self {
      MetaDataValue::String(s) => Some(s.clone()),
      _ => None
    }
  }

  /// If the metadata value is an unsigned integer
  pub fn as_uint(&self) -> Option<u64> {
    match self {
      MetaDataValue::UInteger(u) => Some(*u),
      _ => None
    }
  }

  /// If the metadata value is a signed integer
  pub fn as_int(&self) -> Option<i64> {
    match self {
      MetaDataValue::Integer(i) => Some(*i),
      _ => None
    }
  }

  /// If the metadata value is an Anything
  pub fn as_anything(&self) -> Option<&(dyn Any + Send + Sync)> {
    match self {
      MetaDataValue::Anything(thing) => Some(thing.as_ref()),
      _ => None
    }
  }
}

impl Display for MetaDataValue {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    match self {
      MetaDataValue::Empty => Ok(()),
      MetaDataValue::String(s) => write!(f, "{}", s.as_str()),
      MetaDataValue::UInteger(u) => write!(f, "{}", *u),
      MetaDataValue::Integer(i) => write!(f, "{}", *i),
      MetaDataValue::Anything(thing) => write!(f, "any({:?})", thing)
    }
  }
}

impl From<&str> for MetaDataValue {
  fn from(value: &str) -> Self {
    MetaDataValue::String(value.to_string())
  }
}

impl From<String> for MetaDataValue {
  fn from(value: String) -> Self {
    MetaDataValue::String(value)
  }
}

impl From<u64> for MetaDataValue {
  fn from(value: u64) -> Self {
    MetaDataValue::UInteger(value)
  }
}

impl From<i64> for MetaDataValue {
  fn from(value: i64) -> Self {
    MetaDataValue::Integer(value)
  }
}

/// Main context struct that holds the request and response, and the state accumulated while
/// the machine executes. A fresh context is created for every request, never shared.
#[derive(Debug)]
pub struct Context {
  /// Request that the machine is executing against
  pub request: Request,
  /// Response that is the result of the execution
  pub response: Response,
  /// Selected media type after content negotiation
  pub selected_media_type: Option<String>,
  /// Selected language after content negotiation
  pub selected_language: Option<String>,
  /// Selected charset after content negotiation
  pub selected_charset: Option<String>,
  /// Selected encoding after content negotiation
  pub selected_encoding: Option<String>,
  /// Parsed date and time from the If-Unmodified-Since header
  pub if_unmodified_since: Option<DateTime<FixedOffset>>,
  /// Parsed date and time from the If-Modified-Since header
  pub if_modified_since: Option<DateTime<FixedOffset>>,
  /// If the response should be a redirect
  pub redirect: bool,
  /// If a new resource was created
  pub new_resource: bool,
  /// General store of metadata, keyed by decision state or anything else. Cleared per request.
  pub metadata: HashMap<String, MetaDataValue>,
  /// Instant the context was created
  pub start_time: SystemTime
}

impl Context {
  /// Convenience method to downcast a metadata anything value
  pub fn downcast_metadata_value<'a, T: 'static>(&'a self, key: &'a str) -> Option<&'a T> {
    self.metadata.get(key)
      .and_then(|value| value.as_anything())
      .and_then(|value| value.downcast_ref())
  }
}

impl Default for Context {
  /// Creates a default context
  fn default() -> Context {
    Context {
      request: Request::default(),
      response: Response::new(),
      selected_media_type: None,
      selected_language: None,
      selected_charset: None,
      selected_encoding: None,
      if_unmodified_since: None,
      if_modified_since: None,
      redirect: false,
      new_resource: false,
      metadata: HashMap::new(),
      start_time: SystemTime::now()
    }
  }
}
