//! The `headers` module deals with parsing and formatting request and response headers

use std::collections::HashMap;
use std::fmt::{Display, Formatter};

use itertools::Itertools;

/// Splits the string on the separator, ignoring separators that occur inside double quotes
fn split_outside_quotes(s: &str, separator: char) -> Vec<String> {
  let mut parts = Vec::new();
  let mut current = String::new();
  let mut in_quotes = false;
  for ch in s.chars() {
    if ch == '"' {
      in_quotes = !in_quotes;
      current.push(ch);
    } else if ch == separator && !in_quotes {
      parts.push(current.clone());
      current.clear();
    } else {
      current.push(ch);
    }
  }
  parts.push(current);
  parts
}

fn strip_quotes(s: &str) -> (&str, bool) {
  if s.len() >= 2 && s.starts_with('"') && s.ends_with('"') {
    (&s[1..s.len() - 1], true)
  } else {
    (s, false)
  }
}

/// Parses a comma-separated header line into the individual header values
pub fn parse_header_values(value: &str) -> Vec<HeaderValue> {
  if value.is_empty() {
    Vec::new()
  } else {
    split_outside_quotes(value, ',').iter()
      .map(|s| HeaderValue::parse_string(s.trim()))
      .collect()
  }
}

/// Struct to represent a header value with any optional parameters (e.g. `text/html;level=1`)
#[derive(Debug, Clone, Eq)]
pub struct HeaderValue {
  /// Value of the header
  pub value: String,
  /// Parameter map of the header (everything after the first `;`)
  pub params: HashMap<String, String>,
  /// If the header value was quoted, and should be quoted when written back out
  pub quote: bool
}

impl HeaderValue {
  /// Parses a single header value string into a `HeaderValue`
  pub fn parse_string(s: &str) -> HeaderValue {
    let parts = split_outside_quotes(s.trim(), ';');
    let (value, quote) = strip_quotes(parts[0].trim());
    let params = parts.iter().skip(1)
      .filter_map(|param| {
        param.splitn(2, '=')
          .map(|p| p.trim())
          .collect_tuple()
          .map(|(k, v)| (k.to_string(), strip_quotes(v).0.to_string()))
      })
      .collect();
    HeaderValue {
      value: value.to_string(),
      params,
      quote
    }
  }

  /// Creates a basic header value that has no parameters
  pub fn basic<S: ToString>(value: S) -> HeaderValue {
    HeaderValue {
      value: value.to_string(),
      params: HashMap::new(),
      quote: false
    }
  }

  /// Basic header value for `application/json`
  pub fn json() -> HeaderValue {
    HeaderValue::basic("application/json")
  }

  /// Converts this header value into a quoted header value
  pub fn quote(mut self) -> HeaderValue {
    self.quote = true;
    self
  }

  /// If the value is a weak validator (`W/"..."`), returns the opaque tag without the weak
  /// prefix and quotes
  pub fn weak_etag(&self) -> Option<String> {
    if self.value.starts_with("W/") {
      Some(self.value[2..].trim_matches('"').to_string())
    } else {
      None
    }
  }
}

impl Display for HeaderValue {
  fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
    if self.quote {
      write!(f, "\"{}\"", self.value)?;
    } else {
      write!(f, "{}", self.value)?;
    }
    for (key, value) in self.params.iter().sorted() {
      write!(f, ";{}={}", key, value)?;
    }
    Ok(())
  }
}

impl PartialEq<HeaderValue> for HeaderValue {
  fn eq(&self, other: &HeaderValue) -> bool {
    self.value == other.value && self.params == other.params
  }
}

impl std::hash::Hash for HeaderValue {
  fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
    self.value.hash(state);
    let mut params: Vec<(&String, &String)> = self.params.iter().collect();
    params.sort();
    params.hash(state);
  }
}

impl PartialEq<String> for HeaderValue {
  fn eq(&self, other: &String) -> bool {
    self.value == *other
  }
}

impl PartialEq<&str> for HeaderValue {
  fn eq(&self, other: &&str) -> bool {
    self.value == *other
  }
}

impl From<&str> for HeaderValue {
  fn from(value: &str) -> Self {
    HeaderValue::parse_string(value)
  }
}

/// Simple macro to create a `HeaderValue` from anything that can be parsed as one
#[macro_export]
macro_rules! h {
  ($e:expr) => ($crate::headers::HeaderValue::parse_string($e))
}

#[cfg(test)]
mod tests {
  use expectest::prelude::*;
  use maplit::hashmap;

  use super::*;

  #[test]
  fn parse_simple_header_value() {
    expect!(HeaderValue::parse_string("text/html")).to(be_equal_to(HeaderValue {
      value: "text/html".to_string(),
      params: hashmap!{},
      quote: false
    }));
  }

  #[test]
  fn parse_empty_header_value() {
    expect!(HeaderValue::parse_string("")).to(be_equal_to(HeaderValue {
      value: String::new(),
      params: hashmap!{},
      quote: false
    }));
  }

  #[test]
  fn parse_header_value_with_parameters() {
    expect!(HeaderValue::parse_string("application/xml;q=0.7;level=1")).to(be_equal_to(HeaderValue {
      value: "application/xml".to_string(),
      params: hashmap!{
        "q".to_string() => "0.7".to_string(),
        "level".to_string() => "1".to_string()
      },
      quote: false
    }));
  }

  #[test]
  fn parse_header_value_strips_whitespace() {
    expect!(HeaderValue::parse_string("  application/xml ; q=0.7 ")).to(be_equal_to(HeaderValue {
      value: "application/xml".to_string(),
      params: hashmap!{ "q".to_string() => "0.7".to_string() },
      quote: false
    }));
  }

  #[test]
  fn parse_quoted_header_value() {
    let value = HeaderValue::parse_string("\"1234567890\"");
    expect!(value.clone()).to(be_equal_to(HeaderValue {
      value: "1234567890".to_string(),
      params: hashmap!{},
      quote: true
    }));
    expect!(value.to_string()).to(be_equal_to("\"1234567890\"".to_string()));
  }

  #[test]
  fn parse_header_value_with_quoted_parameter() {
    expect!(HeaderValue::parse_string("form-data; name=\"a;b\"")).to(be_equal_to(HeaderValue {
      value: "form-data".to_string(),
      params: hashmap!{ "name".to_string() => "a;b".to_string() },
      quote: false
    }));
  }

  #[test]
  fn weak_etag_values() {
    expect!(h!("\"1234567890\"").weak_etag()).to(be_none());
    expect!(h!("W/\"1234567890\"").weak_etag()).to(be_some().value("1234567890"));
  }

  #[test]
  fn weak_etag_value_displays_unchanged() {
    expect!(h!("W/\"1234567890\"").to_string()).to(be_equal_to("W/\"1234567890\"".to_string()));
  }

  #[test]
  fn header_value_compares_to_strings() {
    let value = h!("compress;q=0.5");
    expect!(value == "compress").to(be_true());
    expect!(value == "gzip").to(be_false());
  }

  #[test]
  fn display_renders_parameters() {
    let value = h!("application/xml;q=0.7");
    expect!(value.to_string()).to(be_equal_to("application/xml;q=0.7".to_string()));
  }

  #[test]
  fn parse_comma_separated_values() {
    let values = parse_header_values("gzip, deflate;q=0.8");
    expect!(values.len()).to(be_equal_to(2));
    expect!(values[0].value.as_str()).to(be_equal_to("gzip"));
    expect!(values[1].params.get("q").cloned()).to(be_some().value("0.8".to_string()));
  }
}
