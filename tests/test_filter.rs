//! Tests for path normalization and the routing filter tree.

use palisade::config::{Config, HandlerConfig};
use palisade::error::Error;
use palisade::filter::{normalize_path, Filter};
use palisade::http::request::{Method, Request, RequestTarget};

fn request(method: Method, path: &str) -> Request {
    Request::new(method, RequestTarget::parse(path))
}

fn filter_from(toml: &str) -> Filter {
    let config = Config::from_str(toml).unwrap();
    Filter::from_server(&config.servers[0]).unwrap()
}

#[test]
fn test_normalize_path_basic() {
    assert_eq!(normalize_path("/a/b/c").unwrap(), vec!["a", "b", "c"]);
    assert_eq!(normalize_path("/").unwrap(), Vec::<String>::new());
    assert_eq!(normalize_path("//a///b/").unwrap(), vec!["a", "b"]);
}

#[test]
fn test_normalize_path_resolves_dots() {
    assert_eq!(normalize_path("/a/./b").unwrap(), vec!["a", "b"]);
    assert_eq!(normalize_path("/a/b/../c").unwrap(), vec!["a", "c"]);
    assert_eq!(normalize_path("/a/..").unwrap(), Vec::<String>::new());
}

#[test]
fn test_normalize_path_rejects_escaping_the_root() {
    assert!(matches!(normalize_path("/.."), Err(Error::BadRequest(_))));
    assert!(matches!(normalize_path("/a/../../b"), Err(Error::BadRequest(_))));
}

const PRECEDENCE_CONFIG: &str = r#"
[[server]]
listen = ["127.0.0.1:8080"]

[[server.location]]
path = "/"
handler = { type = "static", root = "/var/www" }

[[server.location]]
path = "/api"
handler = { type = "redirect", code = 301, target = "/v2/api" }

[[server.location.location]]
path = "admin"
handler = { type = "redirect", code = 302, target = "/admin-v2" }
"#;

#[test]
fn test_deepest_matching_filter_wins() {
    let root = filter_from(PRECEDENCE_CONFIG);
    let req = request(Method::GET, "/api/admin/panel");
    let normalized = normalize_path("/api/admin/panel").unwrap();

    let matched = root.find(None, &req, &normalized).unwrap();
    assert_eq!(matched.match_count(), 2);
    assert!(matches!(
        matched.handler(),
        Some(HandlerConfig::Redirect { code: 302, .. })
    ));
}

#[test]
fn test_deeper_filter_beats_declaration_order() {
    // "/" is declared first but "/api" consumes more segments for /api/x.
    let root = filter_from(PRECEDENCE_CONFIG);

    let req = request(Method::GET, "/other");
    let normalized = normalize_path("/other").unwrap();
    let matched = root.find(None, &req, &normalized).unwrap();
    assert!(matches!(matched.handler(), Some(HandlerConfig::Static { .. })));

    let req = request(Method::GET, "/api/x");
    let normalized = normalize_path("/api/x").unwrap();
    let matched = root.find(None, &req, &normalized).unwrap();
    assert!(matches!(
        matched.handler(),
        Some(HandlerConfig::Redirect { code: 301, .. })
    ));
    assert_eq!(matched.match_count(), 1);
}

#[test]
fn test_equal_depth_ties_break_by_declaration_order() {
    let root = filter_from(
        r#"
[[server]]
listen = ["127.0.0.1:8080"]

[[server.location]]
path = "/dup"
handler = { type = "redirect", code = 301, target = "/first" }

[[server.location]]
path = "/dup"
handler = { type = "redirect", code = 302, target = "/second" }
"#,
    );
    let req = request(Method::GET, "/dup");
    let normalized = normalize_path("/dup").unwrap();
    let matched = root.find(None, &req, &normalized).unwrap();
    assert!(matches!(
        matched.handler(),
        Some(HandlerConfig::Redirect { code: 301, .. })
    ));
}

#[test]
fn test_path_prefix_must_match_whole_segments() {
    let root = filter_from(PRECEDENCE_CONFIG);
    // "/apix" shares a string prefix with "/api" but not a segment prefix.
    let req = request(Method::GET, "/apix");
    let normalized = normalize_path("/apix").unwrap();
    let matched = root.find(None, &req, &normalized).unwrap();
    assert!(matches!(matched.handler(), Some(HandlerConfig::Static { .. })));
}

#[test]
fn test_method_set_restricts_matching() {
    let root = filter_from(
        r#"
[[server]]
listen = ["127.0.0.1:8080"]

[[server.location]]
path = "/upload"
methods = ["POST", "PUT"]
handler = { type = "static", root = "/srv/upload" }
"#,
    );

    let normalized = normalize_path("/upload").unwrap();
    let post = request(Method::POST, "/upload");
    let matched = root.find(None, &post, &normalized).unwrap();
    assert!(matched.handler().is_some());

    // The GET falls through to the handlerless server root.
    let get = request(Method::GET, "/upload");
    let matched = root.find(None, &get, &normalized).unwrap();
    assert!(matched.handler().is_none());
}

#[test]
fn test_server_names_match_sni_or_host_header() {
    let root = filter_from(
        r#"
[[server]]
listen = ["127.0.0.1:8443"]
server_names = ["example.com"]

[[server.location]]
path = "/"
handler = { type = "static", root = "/var/www" }
"#,
    );
    let normalized = normalize_path("/").unwrap();

    // SNI wins when present.
    let req = request(Method::GET, "/");
    assert!(root.find(Some("example.com"), &req, &normalized).is_some());
    assert!(root.find(Some("evil.test"), &req, &normalized).is_none());

    // Without SNI, the Host header decides; ports are ignored.
    let mut req = request(Method::GET, "/");
    req.headers.insert("Host", "example.com:8443");
    assert!(root.find(None, &req, &normalized).is_some());

    let mut req = request(Method::GET, "/");
    req.headers.insert("Host", "other.test");
    assert!(root.find(None, &req, &normalized).is_none());

    // No SNI and no Host header fails a named server.
    let req = request(Method::GET, "/");
    assert!(root.find(None, &req, &normalized).is_none());
}

#[test]
fn test_match_count_tracks_consumed_segments() {
    let root = filter_from(
        r#"
[[server]]
listen = ["127.0.0.1:8080"]

[[server.location]]
path = "/a/b"
handler = { type = "static", root = "/srv" }

[[server.location.location]]
path = "c/d"
handler = { type = "static", root = "/srv2" }
"#,
    );

    let req = request(Method::GET, "/a/b/c/d/rest");
    let normalized = normalize_path("/a/b/c/d/rest").unwrap();
    let matched = root.find(None, &req, &normalized).unwrap();
    assert_eq!(matched.match_count(), 4);
    assert_eq!(&normalized[matched.match_count()..], ["rest".to_string()]);
}
