//! The `machine` module implements the decision graph that drives resource evaluation: a
//! fixed directed graph of decision states encoding the HTTP/1.1 semantics of RFC 7231 and
//! RFC 7232. The executor starts at a fixed state and follows branches until a state
//! produces a status code. Failures never propagate out of a run; every execution path
//! terminates with a status code on the response.

use std::any::Any;
use std::collections::HashMap;
use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use chrono::{DateTime, FixedOffset, Utc};
use futures::FutureExt;
use itertools::Itertools;
use lazy_static::lazy_static;
use maplit::hashmap;
use tracing::{debug, error, trace};

use crate::{MalformedRequest, Resource};
use crate::content_negotiation;
use crate::context::{Context, Request, ResponseBody};
use crate::h;
use crate::headers::HeaderValue;

/// Ceiling on state transitions for one run. The graph is finite and acyclic, so a run that
/// gets anywhere near this is wired wrongly; it is answered with a 500 rather than looping.
const MAX_STATE_MACHINE_TRANSITIONS: u8 = 100;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) enum Decision {
  End(u16),
  A3Options,
  B3Options,
  B4RequestEntityTooLarge,
  B5UnknownContentType,
  B6UnsupportedContentHeader,
  B7Forbidden,
  B8Authorized,
  B9MalformedRequest,
  B10MethodAllowed,
  B11UriTooLong,
  B12KnownMethod,
  B13Available,
  C3AcceptExists,
  C4AcceptableMediaTypeAvailable,
  D4AcceptLanguageExists,
  D5AcceptableLanguageAvailable,
  E5AcceptCharsetExists,
  E6AcceptableCharsetAvailable,
  F6AcceptEncodingExists,
  F7AcceptableEncodingAvailable,
  G7ResourceExists,
  G8IfMatchExists,
  G9IfMatchStarExists,
  G11EtagInIfMatch,
  H7IfMatchStarExists,
  H10IfUnmodifiedSinceExists,
  H11IfUnmodifiedSinceValid,
  H12LastModifiedGreaterThanUMS,
  I4HasMovedPermanently,
  I7Put,
  I12IfNoneMatchExists,
  I13IfNoneMatchStarExists,
  J18GetHead,
  K5HasMovedPermanently,
  K7ResourcePreviouslyExisted,
  K13ETagInIfNoneMatch,
  L5HasMovedTemporarily,
  L7Post,
  L13IfModifiedSinceExists,
  L14IfModifiedSinceValid,
  L15IfModifiedSinceGreaterThanNow,
  L17IfLastModifiedGreaterThanMS,
  M5Post,
  M7PostToMissingResource,
  M16Delete,
  M20DeleteEnacted,
  N5PostToMissingResource,
  N11Redirect,
  N16Post,
  O14Conflict,
  O16Put,
  O18MultipleRepresentations,
  O20ResponseHasBody,
  P3Conflict,
  P11NewResource
}

impl Decision {
  fn is_terminal(&self) -> bool {
    matches!(self, Decision::End(_) | Decision::A3Options)
  }

  pub(crate) fn name(&self) -> &'static str {
    match self {
      Decision::End(_) => "end",
      Decision::A3Options => "a3_options",
      Decision::B3Options => "b3_options",
      Decision::B4RequestEntityTooLarge => "b4_request_entity_too_large",
      Decision::B5UnknownContentType => "b5_unknown_content_type",
      Decision::B6UnsupportedContentHeader => "b6_unsupported_content_header",
      Decision::B7Forbidden => "b7_forbidden",
      Decision::B8Authorized => "b8_authorized",
      Decision::B9MalformedRequest => "b9_malformed_request",
      Decision::B10MethodAllowed => "b10_method_allowed",
      Decision::B11UriTooLong => "b11_uri_too_long",
      Decision::B12KnownMethod => "b12_known_method",
      Decision::B13Available => "b13_available",
      Decision::C3AcceptExists => "c3_accept_exists",
      Decision::C4AcceptableMediaTypeAvailable => "c4_acceptable_media_type_available",
      Decision::D4AcceptLanguageExists => "d4_accept_language_exists",
      Decision::D5AcceptableLanguageAvailable => "d5_acceptable_language_available",
      Decision::E5AcceptCharsetExists => "e5_accept_charset_exists",
      Decision::E6AcceptableCharsetAvailable => "e6_acceptable_charset_available",
      Decision::F6AcceptEncodingExists => "f6_accept_encoding_exists",
      Decision::F7AcceptableEncodingAvailable => "f7_acceptable_encoding_available",
      Decision::G7ResourceExists => "g7_resource_exists",
      Decision::G8IfMatchExists => "g8_if_match_exists",
      Decision::G9IfMatchStarExists => "g9_if_match_star_exists",
      Decision::G11EtagInIfMatch => "g11_etag_in_if_match",
      Decision::H7IfMatchStarExists => "h7_if_match_star_exists",
      Decision::H10IfUnmodifiedSinceExists => "h10_if_unmodified_since_exists",
      Decision::H11IfUnmodifiedSinceValid => "h11_if_unmodified_since_valid",
      Decision::H12LastModifiedGreaterThanUMS => "h12_last_modified_greater_than_ums",
      Decision::I4HasMovedPermanently => "i4_has_moved_permanently",
      Decision::I7Put => "i7_put",
      Decision::I12IfNoneMatchExists => "i12_if_none_match_exists",
      Decision::I13IfNoneMatchStarExists => "i13_if_none_match_star_exists",
      Decision::J18GetHead => "j18_get_head",
      Decision::K5HasMovedPermanently => "k5_has_moved_permanently",
      Decision::K7ResourcePreviouslyExisted => "k7_resource_previously_existed",
      Decision::K13ETagInIfNoneMatch => "k13_etag_in_if_none_match",
      Decision::L5HasMovedTemporarily => "l5_has_moved_temporarily",
      Decision::L7Post => "l7_post",
      Decision::L13IfModifiedSinceExists => "l13_if_modified_since_exists",
      Decision::L14IfModifiedSinceValid => "l14_if_modified_since_valid",
      Decision::L15IfModifiedSinceGreaterThanNow => "l15_if_modified_since_greater_than_now",
      Decision::L17IfLastModifiedGreaterThanMS => "l17_if_last_modified_greater_than_ms",
      Decision::M5Post => "m5_post",
      Decision::M7PostToMissingResource => "m7_post_to_missing_resource",
      Decision::M16Delete => "m16_delete",
      Decision::M20DeleteEnacted => "m20_delete_enacted",
      Decision::N5PostToMissingResource => "n5_post_to_missing_resource",
      Decision::N11Redirect => "n11_redirect",
      Decision::N16Post => "n16_post",
      Decision::O14Conflict => "o14_conflict",
      Decision::O16Put => "o16_put",
      Decision::O18MultipleRepresentations => "o18_multiple_representations",
      Decision::O20ResponseHasBody => "o20_response_has_body",
      Decision::P3Conflict => "p3_conflict",
      Decision::P11NewResource => "p11_new_resource"
    }
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum DecisionResult {
  True(String),
  False(String),
  StatusCode(u16)
}

impl DecisionResult {
  fn wrap(result: bool, reason: &str) -> DecisionResult {
    if result {
      DecisionResult::True(format!("is: {}", reason))
    } else {
      DecisionResult::False(format!("is not: {}", reason))
    }
  }
}

lazy_static! {
  // (true branch, false branch) for each decision state
  static ref TRANSITION_MAP: HashMap<Decision, (Decision, Decision)> = hashmap!{
    Decision::B13Available => (Decision::B12KnownMethod, Decision::End(503)),
    Decision::B12KnownMethod => (Decision::B11UriTooLong, Decision::End(501)),
    Decision::B11UriTooLong => (Decision::End(414), Decision::B10MethodAllowed),
    Decision::B10MethodAllowed => (Decision::B9MalformedRequest, Decision::End(405)),
    Decision::B9MalformedRequest => (Decision::End(400), Decision::B8Authorized),
    Decision::B8Authorized => (Decision::B7Forbidden, Decision::End(401)),
    Decision::B7Forbidden => (Decision::End(403), Decision::B6UnsupportedContentHeader),
    Decision::B6UnsupportedContentHeader => (Decision::End(501), Decision::B5UnknownContentType),
    Decision::B5UnknownContentType => (Decision::End(415), Decision::B4RequestEntityTooLarge),
    Decision::B4RequestEntityTooLarge => (Decision::End(413), Decision::B3Options),
    Decision::B3Options => (Decision::A3Options, Decision::C3AcceptExists),
    Decision::C3AcceptExists => (Decision::C4AcceptableMediaTypeAvailable, Decision::D4AcceptLanguageExists),
    Decision::C4AcceptableMediaTypeAvailable => (Decision::D4AcceptLanguageExists, Decision::End(406)),
    Decision::D4AcceptLanguageExists => (Decision::D5AcceptableLanguageAvailable, Decision::E5AcceptCharsetExists),
    Decision::D5AcceptableLanguageAvailable => (Decision::E5AcceptCharsetExists, Decision::End(406)),
    Decision::E5AcceptCharsetExists => (Decision::E6AcceptableCharsetAvailable, Decision::F6AcceptEncodingExists),
    Decision::E6AcceptableCharsetAvailable => (Decision::F6AcceptEncodingExists, Decision::End(406)),
    Decision::F6AcceptEncodingExists => (Decision::F7AcceptableEncodingAvailable, Decision::G7ResourceExists),
    Decision::F7AcceptableEncodingAvailable => (Decision::G7ResourceExists, Decision::End(406)),
    Decision::G7ResourceExists => (Decision::G8IfMatchExists, Decision::H7IfMatchStarExists),
    Decision::G8IfMatchExists => (Decision::G9IfMatchStarExists, Decision::H10IfUnmodifiedSinceExists),
    Decision::G9IfMatchStarExists => (Decision::H10IfUnmodifiedSinceExists, Decision::G11EtagInIfMatch),
    Decision::G11EtagInIfMatch => (Decision::H10IfUnmodifiedSinceExists, Decision::End(412)),
    Decision::H7IfMatchStarExists => (Decision::End(412), Decision::I7Put),
    Decision::H10IfUnmodifiedSinceExists => (Decision::H11IfUnmodifiedSinceValid, Decision::I12IfNoneMatchExists),
    Decision::H11IfUnmodifiedSinceValid => (Decision::H12LastModifiedGreaterThanUMS, Decision::I12IfNoneMatchExists),
    Decision::H12LastModifiedGreaterThanUMS => (Decision::End(412), Decision::I12IfNoneMatchExists),
    Decision::I4HasMovedPermanently => (Decision::End(301), Decision::P3Conflict),
    Decision::I7Put => (Decision::I4HasMovedPermanently, Decision::K7ResourcePreviouslyExisted),
    Decision::I12IfNoneMatchExists => (Decision::I13IfNoneMatchStarExists, Decision::L13IfModifiedSinceExists),
    Decision::I13IfNoneMatchStarExists => (Decision::J18GetHead, Decision::K13ETagInIfNoneMatch),
    Decision::J18GetHead => (Decision::End(304), Decision::End(412)),
    Decision::K13ETagInIfNoneMatch => (Decision::J18GetHead, Decision::L13IfModifiedSinceExists),
    Decision::K5HasMovedPermanently => (Decision::End(301), Decision::L5HasMovedTemporarily),
    Decision::K7ResourcePreviouslyExisted => (Decision::K5HasMovedPermanently, Decision::L7Post),
    Decision::L5HasMovedTemporarily => (Decision::End(307), Decision::M5Post),
    Decision::L7Post => (Decision::M7PostToMissingResource, Decision::End(404)),
    Decision::L13IfModifiedSinceExists => (Decision::L14IfModifiedSinceValid, Decision::M16Delete),
    Decision::L14IfModifiedSinceValid => (Decision::L15IfModifiedSinceGreaterThanNow, Decision::M16Delete),
    Decision::L15IfModifiedSinceGreaterThanNow => (Decision::M16Delete, Decision::L17IfLastModifiedGreaterThanMS),
    Decision::L17IfLastModifiedGreaterThanMS => (Decision::M16Delete, Decision::End(304)),
    Decision::M5Post => (Decision::N5PostToMissingResource, Decision::End(410)),
    Decision::M7PostToMissingResource => (Decision::N11Redirect, Decision::End(404)),
    Decision::M16Delete => (Decision::M20DeleteEnacted, Decision::N16Post),
    Decision::M20DeleteEnacted => (Decision::O20ResponseHasBody, Decision::End(202)),
    Decision::N5PostToMissingResource => (Decision::N11Redirect, Decision::End(410)),
    Decision::N11Redirect => (Decision::End(303), Decision::P11NewResource),
    Decision::N16Post => (Decision::N11Redirect, Decision::O16Put),
    Decision::O14Conflict => (Decision::End(409), Decision::P11NewResource),
    Decision::O16Put => (Decision::O14Conflict, Decision::O18MultipleRepresentations),
    Decision::O18MultipleRepresentations => (Decision::End(300), Decision::End(200)),
    Decision::O20ResponseHasBody => (Decision::O18MultipleRepresentations, Decision::End(204)),
    Decision::P3Conflict => (Decision::End(409), Decision::P11NewResource),
    Decision::P11NewResource => (Decision::End(201), Decision::O20ResponseHasBody)
  };
}

/// Compares the ETag generated by the resource with the values of the given header. The
/// strong comparison (RFC 7232 section 2.3.2) never matches a weak validator; the weak
/// comparison ignores the weak prefix.
fn resource_etag_matches(
  resource: &(dyn Resource + Send + Sync),
  context: &mut Context,
  header: &str,
  strong: bool
) -> bool {
  let header_values = context.request.find_header(header);
  match resource.generate_etag(context) {
    Some(etag) => header_values.iter().any(|value| {
      match value.weak_etag() {
        Some(weak) => !strong && weak == etag,
        None => value.value == etag
      }
    }),
    None => false
  }
}

fn validate_header_date(
  request: &Request,
  header: &str,
  context_meta: &mut Option<DateTime<FixedOffset>>
) -> bool {
  let header_values = request.find_header(header);
  if let Some(date_value) = header_values.first() {
    match DateTime::parse_from_rfc2822(&date_value.value) {
      Ok(datetime) => {
        *context_meta = Some(datetime);
        true
      },
      Err(err) => {
        debug!("Failed to parse '{}' header value '{:?}' - {}", header, date_value, err);
        false
      }
    }
  } else {
    false
  }
}

fn sanitise_path(path: &str) -> Vec<String> {
  path.split('/').filter(|p| !p.is_empty()).map(|p| p.to_string()).collect()
}

fn join_paths(base: &[String], path: &[String]) -> String {
  let filtered = base.iter().chain(path.iter())
    .filter(|p| !p.is_empty())
    .join("/");
  if filtered.is_empty() {
    "/".to_string()
  } else if filtered.starts_with('/') {
    filtered
  } else {
    "/".to_owned() + &filtered
  }
}

async fn execute_decision(
  decision: &Decision,
  context: &mut Context,
  resource: &(dyn Resource + Send + Sync)
) -> anyhow::Result<DecisionResult> {
  let result = match decision {
    Decision::B13Available => {
      DecisionResult::wrap(resource.available(context), "available")
    },
    Decision::B12KnownMethod => DecisionResult::wrap(resource.known_methods()
      .iter().any(|m| m.to_uppercase() == context.request.method.as_str()),
      "known method"),
    Decision::B11UriTooLong => {
      DecisionResult::wrap(resource.uri_too_long(context), "URI too long")
    },
    Decision::B10MethodAllowed => {
      match resource.allowed_methods()
        .iter().find(|m| m.to_uppercase() == context.request.method.as_str()) {
        Some(_) => DecisionResult::True("method is in the list of allowed methods".to_string()),
        None => {
          context.response.add_header("Allow", resource.allowed_methods()
            .iter()
            .map(HeaderValue::basic)
            .collect());
          DecisionResult::False("method is not in the list of allowed methods".to_string())
        }
      }
    },
    Decision::B9MalformedRequest => {
      DecisionResult::wrap(resource.malformed_request(context), "malformed request")
    },
    Decision::B8Authorized => {
      match resource.not_authorized(context) {
        Some(realm) => {
          context.response.add_header("WWW-Authenticate", vec![HeaderValue::parse_string(realm.as_str())]);
          DecisionResult::False("is not authorized".to_string())
        },
        None => DecisionResult::True("is authorized".to_string())
      }
    },
    Decision::B7Forbidden => {
      DecisionResult::wrap(resource.forbidden(context), "forbidden")
    },
    Decision::B6UnsupportedContentHeader => {
      DecisionResult::wrap(resource.unsupported_content_headers(context), "unsupported content headers")
    },
    Decision::B5UnknownContentType => {
      DecisionResult::wrap(context.request.is_put_or_post() &&
        !content_negotiation::acceptable_content_type(resource, context),
        "unknown content type")
    },
    Decision::B4RequestEntityTooLarge => {
      DecisionResult::wrap(context.request.is_put_or_post() && !resource.valid_entity_length(context),
        "request entity too large")
    },
    Decision::B3Options => DecisionResult::wrap(context.request.is_options(), "options"),
    Decision::C3AcceptExists => DecisionResult::wrap(context.request.has_accept_header(),
      "has accept header"),
    Decision::C4AcceptableMediaTypeAvailable => {
      match content_negotiation::matching_content_type(resource, &context.request)? {
        Some(media_type) => {
          context.selected_media_type = Some(media_type);
          DecisionResult::True("acceptable media type is available".to_string())
        },
        None => DecisionResult::False("acceptable media type is not available".to_string())
      }
    },
    Decision::D4AcceptLanguageExists => DecisionResult::wrap(context.request.has_accept_language_header(),
      "has accept language header"),
    Decision::D5AcceptableLanguageAvailable => {
      match content_negotiation::matching_language(resource, &context.request)? {
        Some(language) => {
          if language != "*" {
            context.response.add_header("Content-Language", vec![HeaderValue::parse_string(&language)]);
            context.selected_language = Some(language);
          }
          DecisionResult::True("acceptable language is available".to_string())
        },
        None => DecisionResult::False("acceptable language is not available".to_string())
      }
    },
    Decision::E5AcceptCharsetExists => DecisionResult::wrap(context.request.has_accept_charset_header(),
      "accept charset exists"),
    Decision::E6AcceptableCharsetAvailable => {
      match content_negotiation::matching_charset(resource, &context.request)? {
        Some(charset) => {
          if charset != "*" {
            context.selected_charset = Some(charset);
          }
          DecisionResult::True("acceptable charset is available".to_string())
        },
        None => DecisionResult::False("acceptable charset is not available".to_string())
      }
    },
    Decision::F6AcceptEncodingExists => DecisionResult::wrap(context.request.has_accept_encoding_header(),
      "accept encoding exists"),
    Decision::F7AcceptableEncodingAvailable => {
      match content_negotiation::matching_encoding(resource, &context.request)? {
        Some(encoding) => {
          if encoding != "identity" {
            context.response.add_header("Content-Encoding", vec![HeaderValue::parse_string(&encoding)]);
          }
          context.selected_encoding = Some(encoding);
          DecisionResult::True("acceptable encoding is available".to_string())
        },
        None => DecisionResult::False("acceptable encoding is not available".to_string())
      }
    },
    Decision::G7ResourceExists => {
      DecisionResult::wrap(resource.resource_exists(context).await, "resource exists")
    },
    Decision::G8IfMatchExists => DecisionResult::wrap(context.request.has_header("If-Match"),
      "if match exists"),
    Decision::G9IfMatchStarExists | Decision::H7IfMatchStarExists => DecisionResult::wrap(
      context.request.has_header_value("If-Match", "*"), "if match star exists"),
    Decision::G11EtagInIfMatch => DecisionResult::wrap(
      resource_etag_matches(resource, context, "If-Match", true), "etag in if match"),
    Decision::H10IfUnmodifiedSinceExists => DecisionResult::wrap(
      context.request.has_header("If-Unmodified-Since"), "unmodified since exists"),
    Decision::H11IfUnmodifiedSinceValid => DecisionResult::wrap(
      validate_header_date(&context.request, "If-Unmodified-Since", &mut context.if_unmodified_since),
      "unmodified since valid"),
    Decision::H12LastModifiedGreaterThanUMS => {
      match context.if_unmodified_since {
        Some(unmodified_since) => {
          match resource.last_modified(context) {
            Some(datetime) => DecisionResult::wrap(datetime > unmodified_since,
              "resource last modified date is greater than unmodified since"),
            None => DecisionResult::False("resource has no last modified date".to_string())
          }
        },
        None => DecisionResult::False("no unmodified since date".to_string())
      }
    },
    Decision::I4HasMovedPermanently | Decision::K5HasMovedPermanently => {
      match resource.moved_permanently(context) {
        Some(location) => {
          context.response.add_header("Location", vec![HeaderValue::basic(&location)]);
          DecisionResult::True("resource has moved permanently".to_string())
        },
        None => DecisionResult::False("resource has not moved permanently".to_string())
      }
    },
    Decision::I7Put => if context.request.is_put() {
      context.new_resource = true;
      DecisionResult::True("is a PUT request".to_string())
    } else {
      DecisionResult::False("is not a PUT request".to_string())
    },
    Decision::I12IfNoneMatchExists => DecisionResult::wrap(context.request.has_header("If-None-Match"),
      "none match exists"),
    Decision::I13IfNoneMatchStarExists => DecisionResult::wrap(
      context.request.has_header_value("If-None-Match", "*"), "none match star exists"),
    Decision::J18GetHead => DecisionResult::wrap(context.request.is_get_or_head(),
      "is GET or HEAD request"),
    Decision::K7ResourcePreviouslyExisted => {
      DecisionResult::wrap(resource.previously_existed(context), "resource previously existed")
    },
    Decision::K13ETagInIfNoneMatch => DecisionResult::wrap(
      resource_etag_matches(resource, context, "If-None-Match", false), "etag in if none match"),
    Decision::L5HasMovedTemporarily => {
      match resource.moved_temporarily(context) {
        Some(location) => {
          context.response.add_header("Location", vec![HeaderValue::basic(&location)]);
          DecisionResult::True("resource has moved temporarily".to_string())
        },
        None => DecisionResult::False("resource has not moved temporarily".to_string())
      }
    },
    Decision::L7Post | Decision::M5Post | Decision::N16Post => DecisionResult::wrap(
      context.request.is_post(), "a POST request"),
    Decision::L13IfModifiedSinceExists => DecisionResult::wrap(
      context.request.has_header("If-Modified-Since"), "if modified since exists"),
    Decision::L14IfModifiedSinceValid => DecisionResult::wrap(
      validate_header_date(&context.request, "If-Modified-Since", &mut context.if_modified_since),
      "modified since valid"),
    Decision::L15IfModifiedSinceGreaterThanNow => {
      match context.if_modified_since {
        Some(datetime) => {
          let timezone = datetime.timezone();
          DecisionResult::wrap(datetime > Utc::now().with_timezone(&timezone),
            "modified since greater than now")
        },
        None => DecisionResult::False("no modified since date".to_string())
      }
    },
    Decision::L17IfLastModifiedGreaterThanMS => {
      match context.if_modified_since {
        Some(modified_since) => {
          match resource.last_modified(context) {
            Some(datetime) => DecisionResult::wrap(datetime > modified_since,
              "last modified greater than modified since"),
            None => DecisionResult::False("resource has no last modified date".to_string())
          }
        },
        None => DecisionResult::False("no modified since date".to_string())
      }
    },
    Decision::M7PostToMissingResource | Decision::N5PostToMissingResource => {
      if resource.allow_missing_post(context) {
        context.new_resource = true;
        DecisionResult::True("resource allows POST to missing resource".to_string())
      } else {
        DecisionResult::False("resource does not allow POST to missing resource".to_string())
      }
    },
    Decision::M16Delete => DecisionResult::wrap(context.request.is_delete(), "a DELETE request"),
    Decision::M20DeleteEnacted => {
      match resource.delete_resource(context).await {
        Ok(result) => DecisionResult::wrap(result, "resource DELETE succeeded"),
        Err(status) => DecisionResult::StatusCode(status)
      }
    },
    Decision::N11Redirect => {
      if resource.post_is_create(context) {
        match resource.create_path(context).await {
          Ok(path) => {
            let base_path = sanitise_path(&context.request.base_path);
            let new_path = join_paths(&base_path, &sanitise_path(&path));
            context.request.request_path = path;
            context.response.add_header("Location", vec![HeaderValue::basic(&new_path)]);
            DecisionResult::wrap(context.redirect, "should redirect")
          },
          Err(status) => DecisionResult::StatusCode(status)
        }
      } else {
        match resource.process_post(context).await {
          Ok(_) => DecisionResult::wrap(context.redirect, "processing POST succeeded"),
          Err(status) => DecisionResult::StatusCode(status)
        }
      }
    },
    Decision::P3Conflict | Decision::O14Conflict => {
      DecisionResult::wrap(resource.is_conflict(context), "resource conflict")
    },
    Decision::P11NewResource => {
      if context.request.is_put() {
        match resource.process_put(context).await {
          Ok(_) => DecisionResult::wrap(context.new_resource, "process PUT succeeded"),
          Err(status) => DecisionResult::StatusCode(status)
        }
      } else {
        DecisionResult::wrap(context.new_resource, "new resource creation succeeded")
      }
    },
    Decision::O16Put => DecisionResult::wrap(context.request.is_put(), "a PUT request"),
    Decision::O18MultipleRepresentations => {
      DecisionResult::wrap(resource.multiple_choices(context), "multiple choices exist")
    },
    Decision::O20ResponseHasBody => DecisionResult::wrap(context.response.has_body(),
      "response has a body"),
    _ => DecisionResult::False("default decision is false".to_string())
  };
  Ok(result)
}

pub(crate) async fn execute_state_machine(
  context: &mut Context,
  resource: &(dyn Resource + Send + Sync)
) {
  let mut state = Decision::B13Available;
  let mut transitions = 0;
  while !state.is_terminal() {
    transitions += 1;
    if transitions >= MAX_STATE_MACHINE_TRANSITIONS {
      error!("State machine has not terminated within {} transitions", transitions);
      context.response.error = Some(format!("State machine has not terminated within {} transitions",
        transitions));
      context.response.end_state = Some(state.name());
      state = Decision::End(500);
      break;
    }
    context.response.trace.push(state.name());
    trace!("state is {:?}", state);
    state = match TRANSITION_MAP.get(&state) {
      Some((true_state, false_state)) => {
        match execute_decision(&state, context, resource).await {
          Ok(DecisionResult::True(reason)) => {
            trace!("Transitioning from {:?} to {:?} as decision is true -> {}", state, true_state, reason);
            true_state.clone()
          },
          Ok(DecisionResult::False(reason)) => {
            trace!("Transitioning from {:?} to {:?} as decision is false -> {}", state, false_state, reason);
            false_state.clone()
          },
          Ok(DecisionResult::StatusCode(code)) => {
            trace!("Transitioning from {:?} to end state as decision is status code {}", state, code);
            Decision::End(code)
          },
          Err(err) => match err.downcast_ref::<MalformedRequest>() {
            Some(malformed) => {
              debug!("Malformed request at state {:?}: {}", state, malformed.message);
              context.response.status = 400;
              let message = malformed.message.clone();
              render_error_body(context, Some(resource), Some(&message));
              Decision::End(400)
            },
            None => {
              error_response(context, &err, &state);
              Decision::End(500)
            }
          }
        }
      },
      None => {
        // A decision state without a transition entry means the graph wiring is broken
        error!("No transition is defined from state {:?}", state);
        context.response.error = Some(format!("Invalid resource: no transition is defined from decision state '{}'",
          state.name()));
        context.response.end_state = Some(state.name());
        Decision::End(500)
      }
    };
  }
  trace!("Final state is {:?}", state);
  match state {
    Decision::End(status) => context.response.status = status,
    Decision::A3Options => {
      context.response.status = 204;
      if let Some(headers) = resource.options(context) {
        context.response.add_headers(headers);
      }
    },
    _ => ()
  }
}

// Records a contained failure on the response. The body is rendered during finalisation.
fn error_response(context: &mut Context, error: &anyhow::Error, state: &Decision) {
  error!("Caught an error while executing decision {:?}: {:#}", state, error);
  context.response.error = Some(format!("{:#}", error));
  context.response.end_state = Some(state.name());
  context.response.status = 500;
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
  if let Some(message) = panic.downcast_ref::<&str>() {
    message.to_string()
  } else if let Some(message) = panic.downcast_ref::<String>() {
    message.clone()
  } else {
    "resource callback panicked".to_string()
  }
}

fn status_reason(status: u16) -> &'static str {
  match status {
    400 => "Bad Request",
    401 => "Unauthorized",
    403 => "Forbidden",
    404 => "Not Found",
    405 => "Method Not Allowed",
    406 => "Not Acceptable",
    409 => "Conflict",
    410 => "Gone",
    412 => "Precondition Failed",
    413 => "Request Entity Too Large",
    414 => "Request URI Too Long",
    415 => "Unsupported Media Type",
    500 => "Internal Server Error",
    501 => "Not Implemented",
    503 => "Service Unavailable",
    _ => "Error"
  }
}

pub(crate) fn default_error_body(status: u16, message: Option<&str>) -> String {
  let reason = status_reason(status);
  match message {
    Some(message) => format!("<html><head><title>{} {}</title></head><body><h1>{}</h1><p>{}</p></body></html>",
      status, reason, reason, message),
    None => format!("<html><head><title>{} {}</title></head><body><h1>{}</h1></body></html>",
      status, reason, reason)
  }
}

/// Renders an error body onto the response, using the resource's `render_error` hook when
/// one is provided, and a minimal non-sensitive default body otherwise
pub(crate) fn render_error_body(
  context: &mut Context,
  resource: Option<&(dyn Resource + Send + Sync)>,
  message: Option<&str>
) {
  let rendered = resource.and_then(|r| r.render_error(context));
  let body = match rendered {
    Some(body) => body,
    None => {
      context.response.add_header("Content-Type", vec![h!("text/html;charset=utf-8")]);
      Bytes::from(default_error_body(context.response.status, message))
    }
  };
  context.response.body = ResponseBody::Bytes(body);
}

fn add_caching_headers(context: &mut Context, resource: &(dyn Resource + Send + Sync)) {
  if let Some(etag) = resource.generate_etag(context) {
    context.response.add_header("ETag", vec![HeaderValue::basic(&etag).quote()]);
  }
  if let Some(datetime) = resource.expires(context) {
    context.response.add_header("Expires", vec![HeaderValue::basic(datetime.to_rfc2822())]);
  }
  if let Some(datetime) = resource.last_modified(context) {
    context.response.add_header("Last-Modified", vec![HeaderValue::basic(datetime.to_rfc2822())]);
  }
}

pub(crate) async fn finalise_response(context: &mut Context, resource: &(dyn Resource + Send + Sync)) {
  if context.response.status == 304 {
    // A 304 carries the validators but no representation
    context.response.remove_header("Content-Type");
    add_caching_headers(context, resource);
  } else {
    if !context.response.has_header("Content-Type") {
      let media_type = context.selected_media_type.clone()
        .or_else(|| resource.produces().first().map(|p| p.to_string()))
        .unwrap_or_else(|| "application/json".to_string());
      let charset = context.selected_charset.clone()
        .unwrap_or_else(|| "ISO-8859-1".to_string());
      let header = HeaderValue {
        value: media_type,
        params: hashmap!{ "charset".to_string() => charset },
        quote: false
      };
      context.response.add_header("Content-Type", vec![header]);
    }

    if !context.response.has_header("Vary") {
      let mut vary_header = resource.variances()
        .iter()
        .map(|h| HeaderValue::parse_string(h))
        .collect_vec();
      if resource.produces().len() > 1 {
        vary_header.push(h!("Accept"));
      }
      if resource.languages_provided().len() > 1 {
        vary_header.push(h!("Accept-Language"));
      }
      if resource.charsets_provided().len() > 1 {
        vary_header.push(h!("Accept-Charset"));
      }
      if resource.encodings_provided().len() > 1 {
        vary_header.push(h!("Accept-Encoding"));
      }
      if !vary_header.is_empty() {
        context.response.add_header("Vary", vary_header.iter().cloned().unique().collect());
      }
    }

    if context.request.is_get_or_head() {
      add_caching_headers(context, resource);
    }

    if !context.response.has_body() && context.response.status == 200 && context.request.is_get() {
      match resource.render_response(context).await {
        Ok(Some(body)) => context.response.body = ResponseBody::Bytes(body),
        Ok(None) => (),
        Err(err) => {
          error!("render_response failed with an error: {:#}", err);
          context.response.status = 500;
          context.response.error = Some(format!("{:#}", err));
        }
      }
    }

    if context.response.status >= 400 && !context.response.has_body() {
      render_error_body(context, Some(resource), None);
    }
  }

  resource.finish_request(context);
  resource.finalise_response(context);

  let body_size = context.response.body.bytes().map(|bytes| bytes.len()).unwrap_or_default();
  debug!(status = context.response.status, headers = ?context.response.headers, body_size,
    "Final response");
}

/// Runs the state machine against the resource and finalises the response. Every execution
/// path terminates with a status code on the response: malformed negotiation headers
/// short-circuit to a 400 with the message in the body, and any other failure (including a
/// panic out of a resource callback) is contained and answered with a 500 carrying the
/// failure details in the response error slot. The resource's `finish_request` hook runs
/// exactly once, whatever path the machine took.
pub async fn run(context: &mut Context, resource: &(dyn Resource + Send + Sync)) {
  let outcome = AssertUnwindSafe(execute_state_machine(context, resource)).catch_unwind().await;
  if let Err(panic) = outcome {
    let message = panic_message(panic);
    error!("A resource callback panicked while executing the decision graph: {}", message);
    context.response.end_state = context.response.trace.last().copied();
    context.response.error = Some(message);
    context.response.status = 500;
  }
  finalise_response(context, resource).await;
}
