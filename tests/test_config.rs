//! Tests for configuration loading and validation.

use palisade::config::{Config, ConfigError, HandlerConfig};

#[test]
fn test_load_full_config() {
    let config = Config::from_str(
        r#"
workers = 4
io_timeout_ms = 30000

[[server]]
listen = ["127.0.0.1:8080", "127.0.0.1:8081"]
server_names = ["example.com", "www.example.com"]

[[server.location]]
path = "/"
handler = { type = "static", root = "/var/www", index = "index.html" }

[[server.location]]
path = "/app"
handler = { type = "cgi", command = "/usr/bin/php-cgi", root = "/var/app" }

[[server.location]]
path = "/fpm"
handler = { type = "fastcgi", address = "127.0.0.1:9000", root = "/var/fpm", try_files = ["a.php", "b.php"] }

[[server.location]]
path = "/upstream"
handler = { type = "proxy", upstream = "http://127.0.0.1:3000" }

[[server.location]]
path = "/old"
handler = { type = "redirect", code = 301, target = "/new" }
"#,
    )
    .unwrap();

    assert_eq!(config.workers, 4);
    assert_eq!(config.io_timeout_ms, Some(30000));
    assert_eq!(config.servers.len(), 1);

    let server = &config.servers[0];
    assert_eq!(server.listen.len(), 2);
    assert_eq!(server.server_names, ["example.com", "www.example.com"]);
    assert_eq!(server.locations.len(), 5);

    match &server.locations[2].handler {
        Some(HandlerConfig::Fastcgi { address, try_files, .. }) => {
            assert_eq!(address, "127.0.0.1:9000");
            assert_eq!(try_files, &["a.php", "b.php"]);
        }
        other => panic!("unexpected handler: {other:?}"),
    }
}

#[test]
fn test_nested_locations_parse() {
    let config = Config::from_str(
        r#"
[[server]]
listen = ["127.0.0.1:8080"]

[[server.location]]
path = "/a"

[[server.location.location]]
path = "b"
handler = { type = "static", root = "/srv" }
"#,
    )
    .unwrap();
    let outer = &config.servers[0].locations[0];
    assert!(outer.handler.is_none());
    assert_eq!(outer.locations.len(), 1);
    assert!(outer.locations[0].handler.is_some());
}

#[test]
fn test_defaults_are_sequential_and_untimed() {
    let config = Config::from_str(
        r#"
[[server]]
listen = ["127.0.0.1:8080"]
"#,
    )
    .unwrap();
    assert_eq!(config.workers, 0);
    assert_eq!(config.io_timeout_ms, None);
}

#[test]
fn test_rejects_empty_config() {
    let result = Config::from_str("");
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_rejects_server_without_listen_address() {
    let result = Config::from_str(
        r#"
[[server]]
listen = []
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_rejects_unparseable_listen_address() {
    let result = Config::from_str(
        r#"
[[server]]
listen = ["not-an-address"]
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_rejects_unknown_method() {
    let result = Config::from_str(
        r#"
[[server]]
listen = ["127.0.0.1:8080"]

[[server.location]]
path = "/"
methods = ["FETCH"]
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_rejects_non_3xx_redirect() {
    let result = Config::from_str(
        r#"
[[server]]
listen = ["127.0.0.1:8080"]

[[server.location]]
path = "/old"
handler = { type = "redirect", code = 200, target = "/new" }
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_rejects_invalid_proxy_upstream() {
    let result = Config::from_str(
        r#"
[[server]]
listen = ["127.0.0.1:8080"]

[[server.location]]
path = "/"
handler = { type = "proxy", upstream = "not a url" }
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_rejects_fastcgi_address_without_port() {
    let result = Config::from_str(
        r#"
[[server]]
listen = ["127.0.0.1:8080"]

[[server.location]]
path = "/"
handler = { type = "fastcgi", address = "localhost", root = "/srv" }
"#,
    );
    assert!(matches!(result, Err(ConfigError::Validation(_))));
}

#[test]
fn test_rejects_malformed_toml() {
    let result = Config::from_str("[[server]\nlisten = [");
    assert!(matches!(result, Err(ConfigError::Parse(_))));
}
