//! The hyper/tokio server adapter. It owns the network side of a server: binding and
//! accepting connections (plain TCP or TLS), translating each wire request into the core
//! `Request` type, driving the dispatcher, and serialising the resulting response back to
//! the connection.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::fs::File;
use std::io::BufReader;
use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{anyhow, bail};
use bytes::Bytes;
use futures::StreamExt;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{HeaderMap, Uri};
use http_body_util::combinators::UnsyncBoxBody;
use http_body_util::{BodyExt, Full, StreamBody};
use hyper::body::{Frame, Incoming};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Request as HttpRequest, Response as HttpResponse};
use hyper_util::rt::TokioIo;
use itertools::Itertools;
use serde_json::Value;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpListener;
use tokio::sync::Notify;
use tokio_rustls::TlsAcceptor;
use tokio_rustls::rustls::ServerConfig;
use tracing::{debug, error};

use crate::Dispatcher;
use crate::config::Configuration;
use crate::context::{Context, Method, Request, ResponseBody};
use crate::headers::{HeaderValue, parse_header_values};
use crate::machine;

type WireBody = UnsyncBoxBody<Bytes, Infallible>;

fn headers_from_http_request(headers: &HeaderMap) -> HashMap<String, Vec<HeaderValue>> {
  headers.iter()
    .fold(HashMap::new(), |mut map: HashMap<String, Vec<HeaderValue>>, (name, value)| {
      map.entry(name.to_string())
        .or_default()
        .extend(parse_header_values(value.to_str().unwrap_or_default()));
      map
    })
}

// Maps a configured extra verb onto POST, tunnelling the original verb as a synthetic
// `_method` query parameter (method-override-via-tunnel)
pub(crate) fn tunnelled_request_uri(uri: &Uri, verb: &str) -> Uri {
  let query = match uri.query() {
    Some(query) => format!("{}&_method={}", query, verb),
    None => format!("_method={}", verb)
  };
  let path_and_query = format!("{}?{}", uri.path(), query);
  let mut parts = uri.clone().into_parts();
  parts.path_and_query = PathAndQuery::try_from(path_and_query.as_str()).ok();
  Uri::from_parts(parts).unwrap_or_else(|_| uri.clone())
}

// HTTP/1.1 requests normally carry an origin-form target; reconstruct an absolute URI from
// the Host header so resources see the full request URI
fn with_authority_from_host_header(uri: Uri, headers: &HashMap<String, Vec<HeaderValue>>) -> Uri {
  if uri.authority().is_some() {
    return uri
  }
  let host = headers.iter()
    .find(|(name, _)| name.eq_ignore_ascii_case("Host"))
    .and_then(|(_, values)| values.first())
    .map(|value| value.value.clone());
  match host {
    Some(host) => {
      let mut parts = uri.clone().into_parts();
      parts.scheme = Some(Scheme::HTTP);
      parts.authority = Authority::try_from(host.as_str()).ok();
      if parts.path_and_query.is_none() {
        parts.path_and_query = Some(PathAndQuery::from_static("/"));
      }
      Uri::from_parts(parts).unwrap_or(uri)
    },
    None => uri
  }
}

async fn request_from_http_request(
  req: HttpRequest<Incoming>,
  extra_verbs: &HashSet<String>
) -> Request {
  let (parts, body) = req.into_parts();
  let headers = headers_from_http_request(&parts.headers);

  let mut method = Method::parse(parts.method.as_str());
  let mut uri = parts.uri;
  if extra_verbs.contains(method.as_str()) {
    uri = tunnelled_request_uri(&uri, method.as_str());
    method = Method::Post;
  }
  uri = with_authority_from_host_header(uri, &headers);

  let body = match body.collect().await {
    Ok(collected) => {
      let bytes = collected.to_bytes();
      if bytes.is_empty() {
        None
      } else {
        Some(bytes)
      }
    },
    Err(err) => {
      error!("Failed to read the request body: {}", err);
      None
    }
  };

  let mut request = Request::new(method, uri);
  request.headers = headers;
  request.body = body;
  request
}

// Wire headers are single-valued: multiple values collapse into one comma-joined line
pub(crate) fn collapse_headers(values: &[HeaderValue]) -> String {
  values.iter().map(|v| v.to_string()).join(", ")
}

fn generate_http_response(context: Context) -> http::Result<HttpResponse<WireBody>> {
  let mut response = HttpResponse::builder().status(context.response.status);
  for (header, values) in &context.response.headers {
    response = response.header(header, collapse_headers(values));
  }
  let body = match context.response.body {
    ResponseBody::None => Full::new(Bytes::new()).boxed_unsync(),
    ResponseBody::Bytes(bytes) => Full::new(bytes).boxed_unsync(),
    // hyper frames streamed bodies with chunked transfer encoding itself
    ResponseBody::Stream(stream) => BodyExt::boxed_unsync(StreamBody::new(stream.map(|chunk| Ok(Frame::data(chunk))))),
    // a single-shot callable encoder is invoked exactly once, its result is the body
    ResponseBody::Callable(encoder) => Full::new(encoder()).boxed_unsync()
  };
  response.body(body)
}

// We cannot service a protocol switch; answer with a 400 rather than dropping the request
fn upgrade_not_supported() -> http::Result<HttpResponse<WireBody>> {
  HttpResponse::builder()
    .status(400)
    .header("Content-Type", "text/html;charset=utf-8")
    .body(Full::new(Bytes::from(machine::default_error_body(400,
      Some("Protocol upgrades are not supported")))).boxed_unsync())
}

async fn handle(
  dispatcher: Arc<Dispatcher>,
  config: Arc<Configuration>,
  extra_verbs: Arc<HashSet<String>>,
  req: HttpRequest<Incoming>
) -> http::Result<HttpResponse<WireBody>> {
  if req.headers().contains_key(http::header::UPGRADE) {
    return upgrade_not_supported()
  }
  let mut request = request_from_http_request(req, &extra_verbs).await;
  if config.runs_behind_proxy {
    request.apply_proxy_support(&config.trusted_headers);
  }
  let mut context = Context {
    request,
    .. Context::default()
  };
  dispatcher.dispatch(&mut context).await;
  generate_http_response(context)
}

async fn serve_connection<I>(
  stream: I,
  dispatcher: Arc<Dispatcher>,
  config: Arc<Configuration>,
  extra_verbs: Arc<HashSet<String>>
) where I: AsyncRead + AsyncWrite + Unpin + Send + 'static {
  let io = TokioIo::new(stream);
  let service = service_fn(move |req| {
    let dispatcher = dispatcher.clone();
    let config = config.clone();
    let extra_verbs = extra_verbs.clone();
    async move {
      handle(dispatcher, config, extra_verbs, req).await
    }
  });
  if let Err(err) = http1::Builder::new().serve_connection(io, service).await {
    error!("Error serving connection: {:?}", err);
  }
}

fn build_tls_acceptor(cert_path: &str, key_path: &str) -> anyhow::Result<TlsAcceptor> {
  let certs = rustls_pemfile::certs(&mut BufReader::new(File::open(cert_path)?))
    .collect::<Result<Vec<_>, _>>()?;
  if certs.is_empty() {
    bail!("No certificates found in {}", cert_path);
  }
  let key = rustls_pemfile::private_key(&mut BufReader::new(File::open(key_path)?))?
    .ok_or_else(|| anyhow!("No private key found in {}", key_path))?;
  let config = ServerConfig::builder()
    .with_no_client_auth()
    .with_single_cert(certs, key)?;
  Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Server adapter that accepts connections with tokio, speaks HTTP/1.1 with hyper, and
/// drives the dispatcher for each request received on a connection
pub struct HyperAdapter {
  config: Arc<Configuration>,
  dispatcher: Arc<Dispatcher>,
  shutdown: Arc<Notify>
}

impl HyperAdapter {
  /// Creates an adapter serving the dispatcher with the given configuration
  pub fn new(config: Configuration, dispatcher: Dispatcher) -> HyperAdapter {
    HyperAdapter {
      config: Arc::new(config),
      dispatcher: Arc::new(dispatcher),
      shutdown: Arc::new(Notify::new())
    }
  }

  /// Starts the server and accepts connections until `stop` is called. Configuration
  /// errors fail here, before any connection is accepted: a TLS configuration must supply
  /// both the certificate and the private key, and the bind address must parse.
  pub async fn start(&self) -> anyhow::Result<()> {
    let tls = self.tls_acceptor()?;
    let extra_verbs = Arc::new(self.extra_verbs());
    let addr: SocketAddr = format!("{}:{}", self.config.ip, self.config.port).parse()?;
    let listener = TcpListener::bind(addr).await?;
    debug!("Listening on {}", addr);

    loop {
      tokio::select! {
        _ = self.shutdown.notified() => {
          debug!("Shutting down, no longer accepting connections");
          return Ok(())
        },
        accepted = listener.accept() => {
          let (stream, _) = accepted?;
          let dispatcher = self.dispatcher.clone();
          let config = self.config.clone();
          let extra_verbs = extra_verbs.clone();
          match &tls {
            Some(acceptor) => {
              let acceptor = acceptor.clone();
              tokio::task::spawn(async move {
                match acceptor.accept(stream).await {
                  Ok(stream) => serve_connection(stream, dispatcher, config, extra_verbs).await,
                  Err(err) => error!("TLS handshake failed: {}", err)
                }
              });
            },
            None => {
              tokio::task::spawn(async move {
                serve_connection(stream, dispatcher, config, extra_verbs).await
              });
            }
          }
        }
      }
    }
  }

  /// Stops the server accepting any new connections
  pub fn stop(&self) {
    self.shutdown.notify_waiters();
  }

  // Non-standard verbs configured under "extra_verbs" are tunnelled as POST requests
  fn extra_verbs(&self) -> HashSet<String> {
    match self.config.adapter_options.get("extra_verbs") {
      Some(Value::Array(verbs)) => verbs.iter()
        .filter_map(|v| v.as_str())
        .map(|v| v.to_uppercase())
        .collect(),
      _ => HashSet::new()
    }
  }

  // TLS is configured under "ssl" with "cert" and "key" PEM file paths; both are required
  fn tls_acceptor(&self) -> anyhow::Result<Option<TlsAcceptor>> {
    match self.config.adapter_options.get("ssl") {
      Some(ssl) => {
        let cert = ssl.get("cert").and_then(Value::as_str);
        let key = ssl.get("key").and_then(Value::as_str);
        match (cert, key) {
          (Some(cert), Some(key)) => Ok(Some(build_tls_acceptor(cert, key)?)),
          _ => bail!("Certificate or private key missing for the HTTPS server")
        }
      },
      None => Ok(None)
    }
  }
}
