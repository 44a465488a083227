//! Local HTTP server for download tests

#![allow(dead_code)]

use std::io::{BufRead, BufReader, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use tiny_http::{Header, Response, Server, StatusCode};

/// Path the image is served at
pub const IMAGE_PATH: &str = "/image.img";

/// Entity tag advertised while a HEAD is stale
pub const STALE_ETAG: &str = "\"v0\"";

/// One request as seen by the server
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedRequest {
    pub method: String,
    pub path: String,
    pub range: Option<String>,
}

/// Server behaviour
#[derive(Debug, Clone)]
pub struct ServerOptions {
    pub accept_ranges: bool,
    pub etag: Option<String>,
    /// Cut `GET` bodies after this many bytes and close the connection
    pub truncate_after: Option<usize>,
    /// How many `GET`s are cut when `truncate_after` is set
    pub truncate_times: usize,
    /// The first N `HEAD`s describe an older image: half the size and [`STALE_ETAG`]
    pub stale_heads: usize,
}

impl Default for ServerOptions {
    fn default() -> Self {
        Self {
            accept_ranges: true,
            etag: Some("\"v1\"".to_string()),
            truncate_after: None,
            truncate_times: usize::MAX,
            stale_heads: 0,
        }
    }
}

enum Backend {
    Http(Arc<Server>),
    Raw { stop: Arc<AtomicBool>, addr: SocketAddr },
}

/// Serves one body at [`IMAGE_PATH`], honouring `HEAD` and `Range`
///
/// Truncating servers write responses straight to the socket, since
/// tiny_http keeps the connection open after a short body.
pub struct TestServer {
    backend: Backend,
    handle: Option<JoinHandle<()>>,
    requests: Arc<Mutex<Vec<RecordedRequest>>>,
    port: u16,
}

/// Per-server request counters
#[derive(Default)]
struct Counters {
    heads: AtomicUsize,
    truncated: AtomicUsize,
}

impl TestServer {
    pub fn start(body: Vec<u8>) -> Self {
        Self::with_options(body, ServerOptions::default())
    }

    pub fn with_options(body: Vec<u8>, options: ServerOptions) -> Self {
        if options.truncate_after.is_some() {
            Self::start_raw(body, options)
        } else {
            Self::start_http(body, options)
        }
    }

    fn start_http(body: Vec<u8>, options: ServerOptions) -> Self {
        let server = Arc::new(Server::http("127.0.0.1:0").expect("bind test server"));
        let port = server
            .server_addr()
            .to_ip()
            .expect("tcp listener")
            .port();
        let requests = Arc::new(Mutex::new(Vec::new()));
        let counters = Arc::new(Counters::default());

        let handle = {
            let server = Arc::clone(&server);
            let requests = Arc::clone(&requests);
            std::thread::spawn(move || {
                for request in server.incoming_requests() {
                    let range = request
                        .headers()
                        .iter()
                        .find(|h| h.field.equiv("Range"))
                        .map(|h| h.value.as_str().to_string());
                    let method = request.method().to_string();
                    requests.lock().unwrap().push(RecordedRequest {
                        method: method.clone(),
                        path: request.url().to_string(),
                        range: range.clone(),
                    });

                    let reply = respond(&body, &options, &counters, &method, request.url(), range);
                    let headers = reply
                        .headers
                        .iter()
                        .map(|(name, value)| header(name, value))
                        .collect::<Vec<_>>();
                    let response = Response::new(
                        StatusCode(reply.status),
                        headers,
                        std::io::Cursor::new(reply.data),
                        Some(reply.length),
                        None,
                    )
                    .with_chunked_threshold(usize::MAX);
                    let _ = request.respond(response);
                }
            })
        };

        Self {
            backend: Backend::Http(server),
            handle: Some(handle),
            requests,
            port,
        }
    }

    fn start_raw(body: Vec<u8>, options: ServerOptions) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind test server");
        let addr = listener.local_addr().expect("tcp listener");
        let requests = Arc::new(Mutex::new(Vec::new()));
        let counters = Arc::new(Counters::default());
        let stop = Arc::new(AtomicBool::new(false));

        let handle = {
            let requests = Arc::clone(&requests);
            let stop = Arc::clone(&stop);
            std::thread::spawn(move || {
                for stream in listener.incoming() {
                    if stop.load(Ordering::SeqCst) {
                        break;
                    }
                    if let Ok(stream) = stream {
                        serve_raw(stream, &body, &options, &counters, &requests);
                    }
                }
            })
        };

        Self {
            backend: Backend::Raw { stop, addr },
            handle: Some(handle),
            requests,
            port: addr.port(),
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}{}", self.port, IMAGE_PATH)
    }

    pub fn url_for(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port, path)
    }

    /// File name the acquirer derives for [`url`](Self::url)
    pub fn image_name(&self) -> String {
        format!("127.0.0.1%3A{}-image.img", self.port)
    }

    pub fn requests(&self) -> Vec<RecordedRequest> {
        self.requests.lock().unwrap().clone()
    }

    /// `Range` headers of every `GET`, sorted
    pub fn served_ranges(&self) -> Vec<String> {
        let mut ranges: Vec<String> = self
            .requests()
            .into_iter()
            .filter(|r| r.method == "GET")
            .filter_map(|r| r.range)
            .collect();
        ranges.sort();
        ranges
    }

    pub fn get_count(&self) -> usize {
        self.requests().iter().filter(|r| r.method == "GET").count()
    }

    pub fn head_count(&self) -> usize {
        self.requests().iter().filter(|r| r.method == "HEAD").count()
    }
}

impl Drop for TestServer {
    fn drop(&mut self) {
        match &self.backend {
            Backend::Http(server) => server.unblock(),
            Backend::Raw { stop, addr } => {
                stop.store(true, Ordering::SeqCst);
                // wake the blocking accept
                let _ = TcpStream::connect(addr);
            }
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

fn header(name: &str, value: &str) -> Header {
    Header::from_bytes(name.as_bytes(), value.as_bytes()).expect("valid header")
}

/// Status, headers and body of one response
struct Reply {
    status: u16,
    headers: Vec<(String, String)>,
    data: Vec<u8>,
    /// Declared `Content-Length`, also for `HEAD`
    length: usize,
}

fn respond(
    body: &[u8],
    options: &ServerOptions,
    counters: &Counters,
    method: &str,
    url: &str,
    range: Option<String>,
) -> Reply {
    if url != IMAGE_PATH {
        let data = b"not found".to_vec();
        return Reply {
            status: 404,
            headers: Vec::new(),
            length: data.len(),
            data,
        };
    }

    let stale = method == "HEAD" && counters.heads.fetch_add(1, Ordering::SeqCst) < options.stale_heads;
    let body = if stale { &body[..body.len() / 2] } else { body };

    let mut headers = Vec::new();
    if options.accept_ranges {
        headers.push(("Accept-Ranges".to_string(), "bytes".to_string()));
    }
    let etag = if stale { Some(STALE_ETAG.to_string()) } else { options.etag.clone() };
    if let Some(etag) = etag {
        headers.push(("ETag".to_string(), etag));
    }

    let total = body.len() as u64;
    let requested = range
        .as_deref()
        .filter(|_| options.accept_ranges)
        .and_then(|r| parse_range(r, total));

    let (status, data) = match (range.is_some() && options.accept_ranges, requested) {
        (true, Some((start, end))) => {
            headers.push((
                "Content-Range".to_string(),
                format!("bytes {}-{}/{}", start, end, total),
            ));
            (206, body[start as usize..=end as usize].to_vec())
        }
        (true, None) => (416, Vec::new()),
        (false, _) => (200, body.to_vec()),
    };

    let length = data.len();
    let data = if method == "HEAD" { Vec::new() } else { data };
    Reply {
        status,
        headers,
        data,
        length,
    }
}

/// Answer one request on a raw connection, then close it
fn serve_raw(
    mut stream: TcpStream,
    body: &[u8],
    options: &ServerOptions,
    counters: &Counters,
    requests: &Mutex<Vec<RecordedRequest>>,
) {
    let Some((method, path, range)) = read_request(&stream) else {
        return;
    };
    requests.lock().unwrap().push(RecordedRequest {
        method: method.clone(),
        path: path.clone(),
        range: range.clone(),
    });

    let reply = respond(body, options, counters, &method, &path, range);
    let mut data = &reply.data[..];
    if method == "GET" {
        if let Some(limit) = options.truncate_after {
            if counters.truncated.fetch_add(1, Ordering::SeqCst) < options.truncate_times {
                data = &data[..data.len().min(limit)];
            }
        }
    }

    let mut head = format!("HTTP/1.1 {} {}\r\n", reply.status, reason(reply.status));
    for (name, value) in &reply.headers {
        head.push_str(&format!("{}: {}\r\n", name, value));
    }
    head.push_str(&format!("Content-Length: {}\r\nConnection: close\r\n\r\n", reply.length));

    let _ = stream.write_all(head.as_bytes());
    let _ = stream.write_all(data);
    let _ = stream.flush();
    let _ = stream.shutdown(Shutdown::Both);
}

/// Method, path and `Range` of the request on `stream`
fn read_request(stream: &TcpStream) -> Option<(String, String, Option<String>)> {
    let mut reader = BufReader::new(stream);
    let mut line = String::new();
    reader.read_line(&mut line).ok()?;
    let mut parts = line.split_whitespace();
    let method = parts.next()?.to_string();
    let path = parts.next()?.to_string();

    let mut range = None;
    loop {
        line.clear();
        if reader.read_line(&mut line).ok()? == 0 {
            break;
        }
        let trimmed = line.trim_end();
        if trimmed.is_empty() {
            break;
        }
        if let Some((name, value)) = trimmed.split_once(':') {
            if name.trim().eq_ignore_ascii_case("range") {
                range = Some(value.trim().to_string());
            }
        }
    }
    Some((method, path, range))
}

fn reason(status: u16) -> &'static str {
    match status {
        200 => "OK",
        206 => "Partial Content",
        404 => "Not Found",
        416 => "Range Not Satisfiable",
        _ => "Unknown",
    }
}

/// Inclusive byte range for `bytes=a-b` or `bytes=a-`
fn parse_range(value: &str, total: u64) -> Option<(u64, u64)> {
    let spec = value.trim().strip_prefix("bytes=")?;
    let (start, end) = spec.split_once('-')?;
    let start: u64 = start.trim().parse().ok()?;
    let end: u64 = if end.trim().is_empty() {
        total.checked_sub(1)?
    } else {
        end.trim().parse::<u64>().ok()?.min(total.checked_sub(1)?)
    };
    (start <= end).then_some((start, end))
}

/// Deterministic pseudo-random payload
pub fn payload(len: usize) -> Vec<u8> {
    let mut state = 0x2545_f491_u32;
    (0..len)
        .map(|_| {
            state ^= state << 13;
            state ^= state >> 17;
            state ^= state << 5;
            (state >> 24) as u8
        })
        .collect()
}
