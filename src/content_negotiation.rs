//! The `content_negotiation` module deals with negotiating the media type, language, charset
//! and encoding of the response against the `Accept-*` request headers (RFC 7231 section 5.3).

use anyhow::Error;
use itertools::Itertools;

use crate::{MalformedRequest, Resource};
use crate::context::{Context, Request};
use crate::headers::HeaderValue;

/// Parsed media type split into its main and sub parts
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MediaType {
  /// Main type (`application` in `application/json`)
  pub main: String,
  /// Sub type (`json` in `application/json`)
  pub sub: String
}

impl MediaType {
  /// Parses a string into a `MediaType`. A bare `*` is treated as `*/*`.
  pub fn parse_string(media_type: &str) -> MediaType {
    let (main, sub) = media_type.trim()
      .split_once('/')
      .unwrap_or((media_type.trim(), "*"));
    MediaType {
      main: main.to_string(),
      sub: sub.to_string()
    }
  }

  /// If this media type (which may contain wildcards) matches the other, concrete media type
  pub fn matches(&self, other: &MediaType) -> bool {
    (self.main == "*" || self.main.eq_ignore_ascii_case(&other.main)) &&
      (self.sub == "*" || self.sub.eq_ignore_ascii_case(&other.sub))
  }

  /// Number of non-wildcard parts, used to rank media types by how specific they are
  pub fn specificity(&self) -> usize {
    [&self.main, &self.sub].iter().filter(|p| **p != "*").count()
  }
}

/// Parses the quality parameter of a header value into thousandths. A missing `q` parameter
/// is quality 1. RFC 7231 allows at most three decimal places, and nothing above 1.
pub(crate) fn quality(header: &HeaderValue) -> anyhow::Result<u16> {
  match header.params.get("q") {
    Some(q) => parse_quality_value(q).ok_or_else(|| Error::new(MalformedRequest {
      message: format!("Invalid quality value '{}' for '{}'", q, header.value)
    })),
    None => Ok(1000)
  }
}

fn parse_quality_value(q: &str) -> Option<u16> {
  let (int_part, frac_part) = match q.split_once('.') {
    Some((int_part, frac_part)) => (int_part, frac_part),
    None => (q, "")
  };
  if frac_part.len() > 3 || !frac_part.chars().all(|c| c.is_ascii_digit()) {
    return None
  }
  let frac = format!("{:0<3}", frac_part).parse::<u16>().unwrap_or_default();
  match int_part {
    "0" => Some(frac),
    "1" if frac == 0 => Some(1000),
    _ => None
  }
}

// Orders the header values by descending quality then descending specificity. The sort is
// stable, so values listed first win among equals.
fn sorted_media_types(accept: &[HeaderValue]) -> anyhow::Result<Vec<(MediaType, u16)>> {
  let mut weighted = accept.iter()
    .map(|value| Ok((MediaType::parse_string(&value.value), quality(value)?)))
    .collect::<anyhow::Result<Vec<_>>>()?;
  weighted.sort_by(|(a, a_quality), (b, b_quality)| {
    b_quality.cmp(a_quality).then(b.specificity().cmp(&a.specificity()))
  });
  Ok(weighted)
}

fn sorted_by_quality(accept: &[HeaderValue]) -> anyhow::Result<Vec<(String, u16)>> {
  let mut weighted = accept.iter()
    .map(|value| Ok((value.value.clone(), quality(value)?)))
    .collect::<anyhow::Result<Vec<_>>>()?;
  weighted.sort_by(|(_, a_quality), (_, b_quality)| b_quality.cmp(a_quality));
  Ok(weighted)
}

/// Matches the media types provided by the resource against the request `Accept` header,
/// returning the best match. Errors with a `MalformedRequest` if a quality value cannot
/// be parsed.
pub fn matching_content_type(
  resource: &(dyn Resource + Send + Sync),
  request: &Request
) -> anyhow::Result<Option<String>> {
  let provided = resource.produces().iter()
    .map(|p| (p.to_string(), MediaType::parse_string(p)))
    .collect_vec();
  for (accepted, quality) in sorted_media_types(&request.accept())? {
    if quality == 0 {
      continue
    }
    if let Some((provided_type, _)) = provided.iter().find(|(_, p)| accepted.matches(p)) {
      return Ok(Some(provided_type.clone()))
    }
  }
  Ok(None)
}

/// If the content type of a PUT or POST request is acceptable to the resource. Wildcards
/// like `*/*`, `type/*` or `*/sub-type` can be used in the acceptable content types.
pub fn acceptable_content_type(
  resource: &(dyn Resource + Send + Sync),
  context: &mut Context
) -> bool {
  let content_type = MediaType::parse_string(&context.request.content_type().value);
  resource.acceptable_content_types(context).iter()
    .any(|acceptable| MediaType::parse_string(acceptable).matches(&content_type))
}

// A language range matches a tag if it equals the tag, or is a prefix of the tag ending at
// a `-` boundary (RFC 4647 basic filtering: `en` matches `en-gb`, `en-gb` does not match `en`).
fn language_matches(range: &str, tag: &str) -> bool {
  range == "*" || tag.eq_ignore_ascii_case(range) ||
    (tag.len() > range.len() &&
      tag[..range.len()].eq_ignore_ascii_case(range) &&
      tag.as_bytes()[range.len()] == b'-')
}

/// Matches the languages provided by the resource against the request `Accept-Language`
/// header. An empty provided list stands for all languages.
pub fn matching_language(
  resource: &(dyn Resource + Send + Sync),
  request: &Request
) -> anyhow::Result<Option<String>> {
  let provided = resource.languages_provided();
  for (language, quality) in sorted_by_quality(&request.accept_language())? {
    if quality == 0 {
      continue
    }
    if provided.is_empty() {
      return Ok(Some(language))
    }
    if language == "*" {
      return Ok(provided.first().map(|p| p.to_string()))
    }
    if let Some(found) = provided.iter().find(|p| language_matches(&language, p)) {
      return Ok(Some(found.to_string()))
    }
  }
  Ok(None)
}

/// Matches the charsets provided by the resource against the request `Accept-Charset`
/// header. An empty provided list stands for all charsets.
pub fn matching_charset(
  resource: &(dyn Resource + Send + Sync),
  request: &Request
) -> anyhow::Result<Option<String>> {
  let provided = resource.charsets_provided();
  for (charset, quality) in sorted_by_quality(&request.accept_charset())? {
    if quality == 0 {
      continue
    }
    if provided.is_empty() {
      return Ok(Some(charset))
    }
    if charset == "*" {
      return Ok(provided.first().map(|p| p.to_string()))
    }
    if let Some(found) = provided.iter().find(|p| p.eq_ignore_ascii_case(&charset)) {
      return Ok(Some(found.to_string()))
    }
  }
  Ok(None)
}

/// Matches the encodings provided by the resource against the request `Accept-Encoding`
/// header. The `identity` encoding is always acceptable unless it is explicitly refused
/// with a zero quality.
pub fn matching_encoding(
  resource: &(dyn Resource + Send + Sync),
  request: &Request
) -> anyhow::Result<Option<String>> {
  let provided = resource.encodings_provided();
  let accepted = sorted_by_quality(&request.accept_encoding())?;
  for (encoding, quality) in &accepted {
    if *quality == 0 {
      continue
    }
    if encoding == "*" {
      return Ok(provided.first().map(|p| p.to_string()))
    }
    if let Some(found) = provided.iter().find(|p| p.eq_ignore_ascii_case(encoding)) {
      return Ok(Some(found.to_string()))
    }
  }

  let identity_refused = accepted.iter().any(|(encoding, quality)| {
    (encoding == "identity" || encoding == "*") && *quality == 0
  });
  if !identity_refused && provided.iter().any(|p| p.eq_ignore_ascii_case("identity")) {
    Ok(Some("identity".to_string()))
  } else {
    Ok(None)
  }
}
