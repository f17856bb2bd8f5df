//! End-to-end tests: a real server on a loopback port, driven by plain
//! blocking sockets from the test side.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::path::PathBuf;
use std::time::Duration;

use palisade::config::Config;
use palisade::runtime::Runtime;
use palisade::server::{listener, Server};

/// Picks a free loopback port.
fn free_port() -> u16 {
    TcpListener::bind("127.0.0.1:0")
        .unwrap()
        .local_addr()
        .unwrap()
        .port()
}

/// Starts a server for `config_toml` on a background thread.
fn start_server(config_toml: String) {
    unsafe { libc::signal(libc::SIGPIPE, libc::SIG_IGN) };
    std::thread::spawn(move || {
        let config = Config::from_str(&config_toml).expect("bad test config");
        let runtime = Runtime::thread_pool(2).unwrap();
        let handle = runtime.handle().clone();
        let servers = Server::build_all(&config).unwrap();
        let server = servers.into_iter().next().unwrap();
        runtime.block_on(async move {
            let _ = listener::run(server, handle).await;
        });
    });
}

/// Sends raw bytes and reads the whole response (the server closes the
/// connection after one exchange).
fn exchange(port: u16, raw: &[u8]) -> Vec<u8> {
    let addr = format!("127.0.0.1:{port}");
    let mut stream = connect_with_retry(&addr);
    stream.write_all(raw).unwrap();
    let mut response = Vec::new();
    stream.read_to_end(&mut response).unwrap();
    response
}

fn connect_with_retry(addr: &str) -> TcpStream {
    for _ in 0..200 {
        if let Ok(stream) = TcpStream::connect(addr) {
            return stream;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("server on {addr} never came up");
}

/// Splits a raw response into (status code, headers, body).
fn parse_response(raw: &[u8]) -> (u16, HashMap<String, String>, Vec<u8>) {
    let split = raw
        .windows(4)
        .position(|window| window == b"\r\n\r\n")
        .expect("no header terminator in response");
    let head = std::str::from_utf8(&raw[..split]).unwrap();
    let body = raw[split + 4..].to_vec();

    let mut lines = head.split("\r\n");
    let status_line = lines.next().unwrap();
    let code: u16 = status_line.split(' ').nth(1).unwrap().parse().unwrap();

    let mut headers = HashMap::new();
    for line in lines {
        if let Some((key, value)) = line.split_once(':') {
            headers.insert(key.trim().to_string(), value.trim().to_string());
        }
    }
    (code, headers, body)
}

/// A scratch directory that lives for the duration of the test process.
fn scratch_dir(name: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("palisade-test-{}-{name}", std::process::id()));
    std::fs::create_dir_all(&dir).unwrap();
    dir
}

#[test]
fn test_static_hit_serves_the_index_file() {
    let www = scratch_dir("static-hit");
    std::fs::write(www.join("index.html"), b"<h1>it works</h1>").unwrap();

    let port = free_port();
    start_server(format!(
        r#"
[[server]]
listen = ["127.0.0.1:{port}"]

[[server.location]]
path = "/"
handler = {{ type = "static", root = "{}", index = "index.html" }}
"#,
        www.display()
    ));

    let (code, headers, body) = parse_response(&exchange(
        port,
        b"GET / HTTP/1.1\r\nHost: localhost\r\n\r\n",
    ));
    assert_eq!(code, 200);
    assert_eq!(headers.get("Content-Type").map(String::as_str), Some("text/html"));
    assert_eq!(body, b"<h1>it works</h1>");
}

#[test]
fn test_static_miss_is_404() {
    let www = scratch_dir("static-miss");

    let port = free_port();
    start_server(format!(
        r#"
[[server]]
listen = ["127.0.0.1:{port}"]

[[server.location]]
path = "/"
handler = {{ type = "static", root = "{}", index = "index.html" }}
"#,
        www.display()
    ));

    let (code, headers, _body) = parse_response(&exchange(
        port,
        b"GET /missing.txt HTTP/1.1\r\nHost: localhost\r\n\r\n",
    ));
    assert_eq!(code, 404);
    assert_eq!(headers.get("Content-Type").map(String::as_str), Some("text/html"));
}

#[test]
fn test_filter_precedence_and_residual_redirect() {
    let www = scratch_dir("precedence");
    std::fs::write(www.join("other"), b"static wins").unwrap();

    let port = free_port();
    start_server(format!(
        r#"
[[server]]
listen = ["127.0.0.1:{port}"]

[[server.location]]
path = "/"
handler = {{ type = "static", root = "{}" }}

[[server.location]]
path = "/api"
handler = {{ type = "redirect", code = 301, target = "/v2/api" }}
"#,
        www.display()
    ));

    // The deeper /api filter wins and keeps the residual path.
    let (code, headers, _) = parse_response(&exchange(
        port,
        b"GET /api/x HTTP/1.1\r\nHost: localhost\r\n\r\n",
    ));
    assert_eq!(code, 301);
    assert_eq!(headers.get("Location").map(String::as_str), Some("/v2/api/x"));

    // Anything else falls back to the static root.
    let (code, _, body) = parse_response(&exchange(
        port,
        b"GET /other HTTP/1.1\r\nHost: localhost\r\n\r\n",
    ));
    assert_eq!(code, 200);
    assert_eq!(body, b"static wins");
}

#[test]
fn test_cgi_try_files_falls_back_past_404() {
    let dir = scratch_dir("cgi-fallback");
    std::fs::write(
        dir.join("a.sh"),
        "printf 'Status: 404 Not Found\\r\\n\\r\\n'\n",
    )
    .unwrap();
    std::fs::write(
        dir.join("b.sh"),
        "printf 'Status: 200 OK\\r\\nContent-Type: text/plain\\r\\n\\r\\nOK'\n",
    )
    .unwrap();

    let port = free_port();
    start_server(format!(
        r#"
[[server]]
listen = ["127.0.0.1:{port}"]

[[server.location]]
path = "/run"
handler = {{ type = "cgi", command = "/bin/sh", root = "{}", try_files = ["a.sh", "b.sh"] }}
"#,
        dir.display()
    ));

    let (code, headers, body) = parse_response(&exchange(
        port,
        b"GET /run HTTP/1.1\r\nHost: localhost\r\n\r\n",
    ));
    assert_eq!(code, 200);
    assert_eq!(headers.get("Content-Type").map(String::as_str), Some("text/plain"));
    assert_eq!(body, b"OK");
}

#[test]
fn test_cgi_sees_request_environment() {
    let dir = scratch_dir("cgi-env");
    std::fs::write(
        dir.join("env.sh"),
        "printf 'Content-Type: text/plain\\r\\n\\r\\n'\nprintf '%s %s %s' \"$REQUEST_METHOD\" \"$QUERY_STRING\" \"$HTTP_X_TOKEN\"\n",
    )
    .unwrap();

    let port = free_port();
    start_server(format!(
        r#"
[[server]]
listen = ["127.0.0.1:{port}"]

[[server.location]]
path = "/env"
handler = {{ type = "cgi", command = "/bin/sh", root = "{}", try_files = ["env.sh"] }}
"#,
        dir.display()
    ));

    let (code, _, body) = parse_response(&exchange(
        port,
        b"GET /env?a=1 HTTP/1.1\r\nHost: localhost\r\nX-Token: secret\r\n\r\n",
    ));
    assert_eq!(code, 200);
    assert_eq!(body, b"GET a=1 secret");
}

#[test]
fn test_cgi_receives_the_request_body() {
    let dir = scratch_dir("cgi-body");
    std::fs::write(
        dir.join("echo.sh"),
        "printf 'Content-Type: text/plain\\r\\n\\r\\n'\ncat\n",
    )
    .unwrap();

    let port = free_port();
    start_server(format!(
        r#"
[[server]]
listen = ["127.0.0.1:{port}"]

[[server.location]]
path = "/echo"
handler = {{ type = "cgi", command = "/bin/sh", root = "{}", try_files = ["echo.sh"] }}
"#,
        dir.display()
    ));

    let (code, _, body) = parse_response(&exchange(
        port,
        b"POST /echo HTTP/1.1\r\nHost: localhost\r\nContent-Length: 13\r\n\r\nhello backend",
    ));
    assert_eq!(code, 200);
    assert_eq!(body, b"hello backend");
}

#[test]
fn test_proxy_round_trips_the_body() {
    let upstream = TcpListener::bind("127.0.0.1:0").unwrap();
    let upstream_port = upstream.local_addr().unwrap().port();

    // A one-shot upstream that echoes the request body back.
    std::thread::spawn(move || {
        let (mut stream, _) = upstream.accept().unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];
        let body = loop {
            let n = stream.read(&mut chunk).unwrap();
            assert!(n > 0, "upstream saw eof before the body");
            buf.extend_from_slice(&chunk[..n]);
            if let Some(split) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                let head = String::from_utf8_lossy(&buf[..split]).to_string();
                let length: usize = head
                    .lines()
                    .find_map(|line| line.strip_prefix("Content-Length: "))
                    .unwrap()
                    .parse()
                    .unwrap();
                let mut body = buf[split + 4..].to_vec();
                while body.len() < length {
                    let n = stream.read(&mut chunk).unwrap();
                    assert!(n > 0);
                    body.extend_from_slice(&chunk[..n]);
                }
                break body;
            }
        };
        let head = format!(
            "HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nContent-Length: {}\r\n\r\n",
            body.len()
        );
        stream.write_all(head.as_bytes()).unwrap();
        stream.write_all(&body).unwrap();
    });

    let port = free_port();
    start_server(format!(
        r#"
[[server]]
listen = ["127.0.0.1:{port}"]

[[server.location]]
path = "/x"
handler = {{ type = "proxy", upstream = "http://127.0.0.1:{upstream_port}" }}
"#
    ));

    let (code, headers, body) = parse_response(&exchange(
        port,
        b"POST /x HTTP/1.1\r\nHost: localhost\r\nContent-Length: 5\r\n\r\nhello",
    ));
    assert_eq!(code, 200);
    assert_eq!(headers.get("Content-Type").map(String::as_str), Some("text/plain"));
    assert_eq!(body, b"hello");
}

#[test]
fn test_malformed_request_gets_400() {
    let www = scratch_dir("bad-request");
    let port = free_port();
    start_server(format!(
        r#"
[[server]]
listen = ["127.0.0.1:{port}"]

[[server.location]]
path = "/"
handler = {{ type = "static", root = "{}" }}
"#,
        www.display()
    ));

    let (code, _, _) = parse_response(&exchange(port, b"NOT-HTTP\r\n\r\n"));
    assert_eq!(code, 400);
}

#[test]
fn test_unrouted_request_gets_404() {
    let port = free_port();
    start_server(format!(
        r#"
[[server]]
listen = ["127.0.0.1:{port}"]

[[server.location]]
path = "/only-here"
handler = {{ type = "redirect", code = 302, target = "/elsewhere" }}
"#
    ));

    let (code, _, _) = parse_response(&exchange(
        port,
        b"GET /somewhere-else HTTP/1.1\r\nHost: localhost\r\n\r\n",
    ));
    assert_eq!(code, 404);
}
