use std::future::ready;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use expectest::prelude::*;
use futures_util::future::FutureExt;
use maplit::hashmap;

use crate::context::{Context, Method, Request};
use crate::h;
use crate::headers::HeaderValue;
use crate::machine;
use crate::route::Route;
use crate::{Dispatcher, DynamicResource, async_callback, callback, owned_vec};

fn request(method: Method) -> Request {
  Request {
    method,
    .. Request::default()
  }
}

async fn run(resource: &DynamicResource, request: Request) -> Context {
  let mut context = Context {
    request,
    .. Context::default()
  };
  machine::run(&mut context, resource).await;
  context
}

fn header_value(context: &Context, header: &str) -> String {
  context.response.headers.iter()
    .find(|(k, _)| k.eq_ignore_ascii_case(header))
    .map(|(_, values)| values.iter().map(|v| v.to_string()).collect::<Vec<_>>().join(", "))
    .unwrap_or_default()
}

#[test_log::test(tokio::test)]
async fn get_on_a_default_resource_returns_200() {
  let context = run(&DynamicResource::default(), request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(200));
  expect!(header_value(&context, "Content-Type"))
    .to(be_equal_to("application/json;charset=ISO-8859-1".to_string()));
}

#[test_log::test(tokio::test)]
async fn the_trace_records_the_visited_states_in_order() {
  let context = run(&DynamicResource::default(), request(Method::Get)).await;
  expect!(context.response.trace.clone()).to(be_equal_to(vec![
    "b13_available",
    "b12_known_method",
    "b11_uri_too_long",
    "b10_method_allowed",
    "b9_malformed_request",
    "b8_authorized",
    "b7_forbidden",
    "b6_unsupported_content_header",
    "b5_unknown_content_type",
    "b4_request_entity_too_large",
    "b3_options",
    "c3_accept_exists",
    "d4_accept_language_exists",
    "e5_accept_charset_exists",
    "f6_accept_encoding_exists",
    "g7_resource_exists",
    "g8_if_match_exists",
    "h10_if_unmodified_since_exists",
    "i12_if_none_match_exists",
    "l13_if_modified_since_exists",
    "m16_delete",
    "n16_post",
    "o16_put",
    "o18_multiple_representations"
  ]));
}

#[test_log::test(tokio::test)]
async fn options_request_returns_204_with_the_options_headers() {
  let context = run(&DynamicResource::default(), request(Method::Options)).await;
  expect!(context.response.status).to(be_equal_to(204));
  expect!(context.response.has_header("Access-Control-Allow-Methods")).to(be_true());
}

#[test_log::test(tokio::test)]
async fn unavailable_resource_returns_503() {
  let resource = DynamicResource {
    available: callback(|_, _| false),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(503));
}

#[test_log::test(tokio::test)]
async fn unknown_method_returns_501() {
  let context = run(&DynamicResource::default(), request(Method::Extension("BREW".to_string()))).await;
  expect!(context.response.status).to(be_equal_to(501));
}

#[test_log::test(tokio::test)]
async fn method_not_in_the_allowed_list_returns_405_with_the_allow_header() {
  let context = run(&DynamicResource::default(), request(Method::Delete)).await;
  expect!(context.response.status).to(be_equal_to(405));
  expect!(header_value(&context, "Allow")).to(be_equal_to("OPTIONS, GET, HEAD".to_string()));
}

#[test_log::test(tokio::test)]
async fn malformed_request_callback_returns_400() {
  let resource = DynamicResource {
    malformed_request: callback(|_, _| true),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(400));
}

#[test_log::test(tokio::test)]
async fn unauthorized_returns_401_with_the_www_authenticate_header() {
  let resource = DynamicResource {
    not_authorized: callback(|_, _| Some("Basic realm=\"test\"".to_string())),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(401));
  expect!(context.response.has_header("WWW-Authenticate")).to(be_true());
}

#[test_log::test(tokio::test)]
async fn forbidden_returns_403() {
  let resource = DynamicResource {
    forbidden: callback(|_, _| true),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(403));
}

#[test_log::test(tokio::test)]
async fn put_with_an_unacceptable_content_type_returns_415() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["PUT"]),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Put);
  req.headers = hashmap!{ "Content-Type".to_string() => vec![h!("text/xml")] };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(415));
}

#[test_log::test(tokio::test)]
async fn put_with_an_invalid_entity_length_returns_413() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["PUT"]),
    valid_entity_length: callback(|_, _| false),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Put)).await;
  expect!(context.response.status).to(be_equal_to(413));
}

#[test_log::test(tokio::test)]
async fn a_malformed_accept_quality_value_short_circuits_to_400_with_the_message() {
  let mut req = request(Method::Get);
  req.headers = hashmap!{ "Accept".to_string() => vec![h!("text/html;q=bogus")] };
  let context = run(&DynamicResource::default(), req).await;
  expect!(context.response.status).to(be_equal_to(400));
  let body = String::from_utf8_lossy(context.response.body.bytes().expect("a rendered body"))
    .to_string();
  expect!(body.contains("Invalid quality value 'bogus'")).to(be_true());
  expect!(context.response.trace.last().copied())
    .to(be_some().value("c4_acceptable_media_type_available"));
}

#[test_log::test(tokio::test)]
async fn content_negotiation_selects_the_best_media_type() {
  let resource = DynamicResource {
    produces: owned_vec(&["application/xml", "application/json"]),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Get);
  req.headers = hashmap!{
    "Accept".to_string() => vec![h!("application/json"), h!("application/xml;q=0.5")]
  };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(200));
  expect!(context.selected_media_type.clone()).to(be_some().value("application/json".to_string()));
  expect!(header_value(&context, "Vary")).to(be_equal_to("Accept".to_string()));
}

#[test_log::test(tokio::test)]
async fn no_acceptable_media_type_returns_406() {
  let mut req = request(Method::Get);
  req.headers = hashmap!{ "Accept".to_string() => vec![h!("text/html")] };
  let context = run(&DynamicResource::default(), req).await;
  expect!(context.response.status).to(be_equal_to(406));
}

#[test_log::test(tokio::test)]
async fn if_match_star_on_a_missing_resource_returns_412() {
  let resource = DynamicResource {
    resource_exists: callback(|_, _| false),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Get);
  req.headers = hashmap!{ "If-Match".to_string() => vec![h!("*")] };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(412));
}

#[test_log::test(tokio::test)]
async fn get_with_a_matching_if_none_match_returns_304_without_a_content_type() {
  let resource = DynamicResource {
    generate_etag: callback(|_, _| Some("1234567890".to_string())),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Get);
  req.headers = hashmap!{ "If-None-Match".to_string() => vec![h!("\"1234567890\"")] };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(304));
  expect!(context.response.has_header("Content-Type")).to(be_false());
  expect!(header_value(&context, "ETag")).to(be_equal_to("\"1234567890\"".to_string()));
}

#[test_log::test(tokio::test)]
async fn if_none_match_uses_the_weak_comparison() {
  let resource = DynamicResource {
    generate_etag: callback(|_, _| Some("1234567890".to_string())),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Get);
  req.headers = hashmap!{ "If-None-Match".to_string() => vec![h!("W/\"1234567890\"")] };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(304));
}

#[test_log::test(tokio::test)]
async fn if_match_uses_the_strong_comparison_so_a_weak_etag_never_matches() {
  let resource = DynamicResource {
    generate_etag: callback(|_, _| Some("1234567890".to_string())),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Get);
  req.headers = hashmap!{ "If-Match".to_string() => vec![h!("W/\"1234567890\"")] };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(412));
}

#[test_log::test(tokio::test)]
async fn if_match_with_a_matching_strong_etag_proceeds_to_200() {
  let resource = DynamicResource {
    generate_etag: callback(|_, _| Some("1234567890".to_string())),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Get);
  req.headers = hashmap!{ "If-Match".to_string() => vec![h!("\"1234567890\"")] };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(200));
}

#[test_log::test(tokio::test)]
async fn if_unmodified_since_returns_412_when_the_resource_changed_later() {
  let resource = DynamicResource {
    last_modified: callback(|_, _| DateTime::parse_from_rfc2822("Sat, 16 May 2020 00:00:00 GMT").ok()),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Get);
  req.headers = hashmap!{
    "If-Unmodified-Since".to_string() => vec![h!("Wed, 15 Apr 2020 00:00:00 GMT")]
  };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(412));
}

#[test_log::test(tokio::test)]
async fn an_unparsable_if_unmodified_since_is_ignored() {
  let resource = DynamicResource {
    last_modified: callback(|_, _| DateTime::parse_from_rfc2822("Sat, 16 May 2020 00:00:00 GMT").ok()),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Get);
  req.headers = hashmap!{ "If-Unmodified-Since".to_string() => vec![h!("not-a-date")] };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(200));
}

#[test_log::test(tokio::test)]
async fn if_modified_since_returns_304_when_the_resource_is_unchanged() {
  let resource = DynamicResource {
    last_modified: callback(|_, _| DateTime::parse_from_rfc2822("Wed, 15 Apr 2020 00:00:00 GMT").ok()),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Get);
  req.headers = hashmap!{
    "If-Modified-Since".to_string() => vec![h!("Sat, 16 May 2020 00:00:00 GMT")]
  };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(304));
}

#[test_log::test(tokio::test)]
async fn an_if_modified_since_date_in_the_future_is_ignored() {
  let resource = DynamicResource {
    last_modified: callback(|_, _| DateTime::parse_from_rfc2822("Wed, 15 Apr 2020 00:00:00 GMT").ok()),
    .. DynamicResource::default()
  };
  let future_date = (Utc::now() + Duration::days(365)).to_rfc2822();
  let mut req = request(Method::Get);
  req.headers = hashmap!{
    "If-Modified-Since".to_string() => vec![HeaderValue::basic(&future_date)]
  };
  let context = run(&resource, req).await;
  expect!(context.response.status).to(be_equal_to(200));
}

#[test_log::test(tokio::test)]
async fn delete_returns_204_when_the_deletion_is_enacted() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["DELETE"]),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Delete)).await;
  expect!(context.response.status).to(be_equal_to(204));
}

#[test_log::test(tokio::test)]
async fn delete_returns_202_when_the_deletion_is_not_yet_guaranteed() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["DELETE"]),
    delete_resource: callback(|_, _| Ok(false)),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Delete)).await;
  expect!(context.response.status).to(be_equal_to(202));
}

#[test_log::test(tokio::test)]
async fn a_failing_delete_propagates_its_status_code() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["DELETE"]),
    delete_resource: callback(|_, _| Err(507)),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Delete)).await;
  expect!(context.response.status).to(be_equal_to(507));
  expect!(context.response.trace.last().copied()).to(be_some().value("m20_delete_enacted"));
}

#[test_log::test(tokio::test)]
async fn post_to_a_missing_resource_returns_201_when_missing_posts_are_allowed() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["POST"]),
    resource_exists: callback(|_, _| false),
    allow_missing_post: callback(|_, _| true),
    process_post: async_callback(|_, _| ready(Ok(true)).boxed()),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Post)).await;
  expect!(context.response.status).to(be_equal_to(201));
}

#[test_log::test(tokio::test)]
async fn post_to_a_missing_resource_returns_404_otherwise() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["POST"]),
    resource_exists: callback(|_, _| false),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Post)).await;
  expect!(context.response.status).to(be_equal_to(404));
}

#[test_log::test(tokio::test)]
async fn post_with_a_redirect_returns_303() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["POST"]),
    process_post: async_callback(|context, _| {
      context.redirect = true;
      ready(Ok(true)).boxed()
    }),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Post)).await;
  expect!(context.response.status).to(be_equal_to(303));
}

#[test_log::test(tokio::test)]
async fn post_as_create_sets_the_location_header() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["POST"]),
    post_is_create: callback(|_, _| true),
    create_path: callback(|_, _| Ok("42".to_string())),
    .. DynamicResource::default()
  };
  let mut req = request(Method::Post);
  req.base_path = "/entries".to_string();
  let context = run(&resource, req).await;
  expect!(header_value(&context, "Location")).to(be_equal_to("/entries/42".to_string()));
  expect!(context.request.request_path.clone()).to(be_equal_to("42".to_string()));
}

#[test_log::test(tokio::test)]
async fn put_to_a_missing_resource_creates_it_and_returns_201() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["PUT"]),
    resource_exists: callback(|_, _| false),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Put)).await;
  expect!(context.response.status).to(be_equal_to(201));
}

#[test_log::test(tokio::test)]
async fn put_with_a_conflict_returns_409() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["PUT"]),
    resource_exists: callback(|_, _| false),
    is_conflict: callback(|_, _| true),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Put)).await;
  expect!(context.response.status).to(be_equal_to(409));
}

#[test_log::test(tokio::test)]
async fn put_to_an_existing_resource_returns_204() {
  let resource = DynamicResource {
    allowed_methods: owned_vec(&["PUT"]),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Put)).await;
  expect!(context.response.status).to(be_equal_to(204));
}

#[test_log::test(tokio::test)]
async fn a_permanently_moved_resource_returns_301_with_the_location() {
  let resource = DynamicResource {
    resource_exists: callback(|_, _| false),
    previously_existed: callback(|_, _| true),
    moved_permanently: callback(|_, _| Some("/new/location".to_string())),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(301));
  expect!(header_value(&context, "Location")).to(be_equal_to("/new/location".to_string()));
}

#[test_log::test(tokio::test)]
async fn a_temporarily_moved_resource_returns_307() {
  let resource = DynamicResource {
    resource_exists: callback(|_, _| false),
    previously_existed: callback(|_, _| true),
    moved_temporarily: callback(|_, _| Some("/elsewhere".to_string())),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(307));
}

#[test_log::test(tokio::test)]
async fn a_previously_existing_resource_that_has_not_moved_returns_410() {
  let resource = DynamicResource {
    resource_exists: callback(|_, _| false),
    previously_existed: callback(|_, _| true),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(410));
}

#[test_log::test(tokio::test)]
async fn a_missing_resource_returns_404_with_the_default_body() {
  let resource = DynamicResource {
    resource_exists: callback(|_, _| false),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(404));
  let body = String::from_utf8_lossy(context.response.body.bytes().expect("a rendered body"))
    .to_string();
  expect!(body.contains("Not Found")).to(be_true());
}

#[test_log::test(tokio::test)]
async fn the_render_error_hook_overrides_the_default_error_body() {
  let resource = DynamicResource {
    resource_exists: callback(|_, _| false),
    render_error: callback(|_, _| Some(Bytes::from("it's gone"))),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(404));
  expect!(context.response.body.bytes().cloned()).to(be_some().value(Bytes::from("it's gone")));
}

#[test_log::test(tokio::test)]
async fn a_panicking_callback_is_contained_as_a_500_and_finish_request_still_runs_once() {
  let finish_count = Arc::new(AtomicUsize::new(0));
  let counter = finish_count.clone();
  let resource = DynamicResource {
    available: callback(|_, _| panic!("boom")),
    finish_request: callback(move |_, _| {
      counter.fetch_add(1, Ordering::SeqCst);
    }),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(500));
  expect!(context.response.error.clone()).to(be_some().value("boom".to_string()));
  expect!(context.response.end_state).to(be_some().value("b13_available"));
  expect!(finish_count.load(Ordering::SeqCst)).to(be_equal_to(1));
}

#[test_log::test(tokio::test)]
async fn the_rendered_response_body_is_used_for_a_200_get() {
  let resource = DynamicResource {
    render_response: async_callback(|_, _| ready(Ok(Some(Bytes::from("hello")))).boxed()),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(200));
  expect!(context.response.body.bytes().cloned()).to(be_some().value(Bytes::from("hello")));
}

#[test_log::test(tokio::test)]
async fn a_head_request_does_not_render_a_body() {
  let resource = DynamicResource {
    render_response: async_callback(|_, _| ready(Ok(Some(Bytes::from("hello")))).boxed()),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Head)).await;
  expect!(context.response.status).to(be_equal_to(200));
  expect!(context.response.has_body()).to(be_false());
}

#[test_log::test(tokio::test)]
async fn a_failing_render_response_is_contained_as_a_500() {
  let resource = DynamicResource {
    render_response: async_callback(|_, _| ready(Err(anyhow::anyhow!("representation failed"))).boxed()),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.response.status).to(be_equal_to(500));
  expect!(context.response.error.clone().unwrap_or_default()
    .contains("representation failed")).to(be_true());
}

#[test_log::test(tokio::test)]
async fn validators_are_added_to_a_get_response() {
  let resource = DynamicResource {
    generate_etag: callback(|_, _| Some("1234567890".to_string())),
    last_modified: callback(|_, _| DateTime::parse_from_rfc2822("Wed, 15 Apr 2020 00:00:00 GMT").ok()),
    expires: callback(|_, _| DateTime::parse_from_rfc2822("Sat, 16 May 2020 00:00:00 GMT").ok()),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(header_value(&context, "ETag")).to(be_equal_to("\"1234567890\"".to_string()));
  expect!(header_value(&context, "Last-Modified"))
    .to(be_equal_to("Wed, 15 Apr 2020 00:00:00 +0000".to_string()));
  expect!(context.response.has_header("Expires")).to(be_true());
}

#[test_log::test(tokio::test)]
async fn metadata_stored_by_a_callback_survives_the_run() {
  let resource = DynamicResource {
    resource_exists: callback(|context, _| {
      context.metadata.insert("seen".to_string(), "g7".into());
      true
    }),
    .. DynamicResource::default()
  };
  let context = run(&resource, request(Method::Get)).await;
  expect!(context.metadata.get("seen").and_then(|v| v.as_string()))
    .to(be_some().value("g7".to_string()));
}

#[test_log::test(tokio::test)]
async fn the_dispatcher_returns_404_with_a_body_when_no_route_matches() {
  let dispatcher = Dispatcher::new(vec![
    Route::new("/somewhere", DynamicResource::default)
  ]);
  let mut context = Context {
    request: Request {
      request_path: "/elsewhere".to_string(),
      .. Request::default()
    },
    .. Context::default()
  };
  dispatcher.dispatch(&mut context).await;
  expect!(context.response.status).to(be_equal_to(404));
  expect!(context.response.has_body()).to(be_true());
}

#[test_log::test(tokio::test)]
async fn the_dispatcher_applies_the_route_bindings_before_running_the_machine() {
  let dispatcher = Dispatcher::new(vec![
    Route::new("/orders/{id}", || DynamicResource {
      render_response: async_callback(|context, _| {
        let id = context.request.path_vars.get("id").cloned().unwrap_or_default();
        ready(Ok(Some(Bytes::from(id)))).boxed()
      }),
      .. DynamicResource::default()
    })
  ]);
  let mut context = Context {
    request: Request {
      request_path: "/orders/42".to_string(),
      .. Request::default()
    },
    .. Context::default()
  };
  dispatcher.dispatch(&mut context).await;
  expect!(context.response.status).to(be_equal_to(200));
  expect!(context.response.body.bytes().cloned()).to(be_some().value(Bytes::from("42")));
}

#[test_log::test(tokio::test)]
async fn the_first_matching_route_wins() {
  let dispatcher = Dispatcher::new(vec![
    Route::new("/notes", || DynamicResource {
      allowed_methods: owned_vec(&["POST"]),
      process_post: async_callback(|_, _| ready(Ok(true)).boxed()),
      .. DynamicResource::default()
    }).with_guard(|request| request.method == Method::Post),
    Route::new("/notes", || DynamicResource {
      render_response: async_callback(|_, _| ready(Ok(Some(Bytes::from("all notes")))).boxed()),
      .. DynamicResource::default()
    })
  ]);

  let mut context = Context {
    request: Request {
      request_path: "/notes".to_string(),
      .. Request::default()
    },
    .. Context::default()
  };
  dispatcher.dispatch(&mut context).await;
  expect!(context.response.status).to(be_equal_to(200));
  expect!(context.response.body.bytes().cloned()).to(be_some().value(Bytes::from("all notes")));
}
