//! In-process scripted servers and collaborator fakes for client tests.
#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

use courier::collab::Dns;
use courier::{BoxFuture, BoxedIo, ConnectionSpec, Protocol};

/// A scripted HTTP/1 server: for each accepted connection, a list of
/// canned responses, one per request. The connection closes when its
/// script runs out.
pub struct TestServer {
    pub addr: SocketAddr,
    log: Arc<Mutex<Vec<Vec<String>>>>,
}

impl TestServer {
    pub async fn start(script: Vec<Vec<Vec<u8>>>) -> TestServer {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let log: Arc<Mutex<Vec<Vec<String>>>> = Arc::new(Mutex::new(Vec::new()));

        let accept_log = log.clone();
        tokio::spawn(async move {
            for conn_script in script {
                let (socket, _) = match listener.accept().await {
                    Ok(accepted) => accepted,
                    Err(_) => return,
                };
                let conn_index = {
                    let mut log = accept_log.lock().unwrap();
                    log.push(Vec::new());
                    log.len() - 1
                };
                let log = accept_log.clone();
                tokio::spawn(serve_connection(socket, conn_script, log, conn_index));
            }
        });

        TestServer { addr, log }
    }

    pub fn uri(&self, path: &str) -> String {
        format!("http://{}{}", self.addr, path)
    }

    /// How many connections the server accepted so far.
    pub fn connection_count(&self) -> usize {
        self.log.lock().unwrap().len()
    }

    /// The raw request texts seen on connection `index`, in order.
    pub fn requests(&self, index: usize) -> Vec<String> {
        self.log.lock().unwrap()[index].clone()
    }
}

async fn serve_connection(
    mut socket: TcpStream,
    responses: Vec<Vec<u8>>,
    log: Arc<Mutex<Vec<Vec<String>>>>,
    conn_index: usize,
) {
    for response in responses {
        let request = match read_request(&mut socket).await {
            Some(request) => request,
            None => return,
        };
        log.lock().unwrap()[conn_index].push(request);
        if socket.write_all(&response).await.is_err() {
            return;
        }
    }
    // Script exhausted: close.
}

/// Reads one request (head plus any Content-Length body) as text.
pub async fn read_request(socket: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let head_end = loop {
        if let Some(at) = find_head_end(&buf) {
            break at;
        }
        let mut chunk = [0u8; 4096];
        let n = socket.read(&mut chunk).await.ok()?;
        if n == 0 {
            return None;
        }
        buf.extend_from_slice(&chunk[..n]);
    };

    let head = String::from_utf8_lossy(&buf[..head_end]).to_string();
    let content_length = head
        .lines()
        .find_map(|line| {
            let (name, value) = line.split_once(':')?;
            if name.eq_ignore_ascii_case("content-length") {
                value.trim().parse::<usize>().ok()
            } else {
                None
            }
        })
        .unwrap_or(0);

    let chunked = head.lines().any(|line| {
        line.to_ascii_lowercase()
            .starts_with("transfer-encoding: chunked")
    });

    let mut body = buf[head_end + 4..].to_vec();
    if chunked {
        // Slurp until the last-chunk terminator.
        while !body.windows(5).any(|w| w == b"0\r\n\r\n") {
            let mut chunk = [0u8; 4096];
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    } else {
        while body.len() < content_length {
            let mut chunk = [0u8; 4096];
            let n = socket.read(&mut chunk).await.ok()?;
            if n == 0 {
                break;
            }
            body.extend_from_slice(&chunk[..n]);
        }
    }

    Some(format!("{}\r\n\r\n{}", head, String::from_utf8_lossy(&body)))
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n")
}

pub fn response(status: &str, headers: &[(&str, &str)], body: &[u8]) -> Vec<u8> {
    let mut out = format!("HTTP/1.1 {}\r\n", status).into_bytes();
    let mut has_length = false;
    for (name, value) in headers {
        if name.eq_ignore_ascii_case("content-length") || name.eq_ignore_ascii_case("transfer-encoding") {
            has_length = true;
        }
        out.extend_from_slice(format!("{}: {}\r\n", name, value).as_bytes());
    }
    if !has_length {
        out.extend_from_slice(format!("content-length: {}\r\n", body.len()).as_bytes());
    }
    out.extend_from_slice(b"\r\n");
    out.extend_from_slice(body);
    out
}

/// A resolver that sends every hostname to one address.
pub struct StaticDns(pub SocketAddr);

impl Dns for StaticDns {
    fn resolve<'a>(
        &'a self,
        _host: &'a str,
        _port: u16,
    ) -> BoxFuture<'a, courier::Result<Vec<SocketAddr>>> {
        let addr = self.0;
        Box::pin(async move { Ok(vec![addr]) })
    }
}

/// A pass-through "TLS" collaborator: no records, just a scripted
/// handshake descriptor and per-spec failure injection.
pub struct FakeTls {
    pub fail_specs: Vec<ConnectionSpec>,
    pub sans: Vec<String>,
    pub alpn: Option<Protocol>,
    pub attempts: Arc<Mutex<Vec<ConnectionSpec>>>,
}

impl FakeTls {
    pub fn passthrough(sans: &[&str]) -> FakeTls {
        FakeTls {
            fail_specs: Vec::new(),
            sans: sans.iter().map(|s| s.to_string()).collect(),
            alpn: None,
            attempts: Arc::new(Mutex::new(Vec::new())),
        }
    }
}

impl courier::connect::tls::TlsConnector for FakeTls {
    fn connect<'a>(
        &'a self,
        _host: &'a str,
        spec: ConnectionSpec,
        _alpn: &'a [Protocol],
        io: BoxedIo,
    ) -> BoxFuture<'a, courier::Result<courier::connect::tls::TlsStream>> {
        Box::pin(async move {
            self.attempts.lock().unwrap().push(spec);
            if self.fail_specs.contains(&spec) {
                return Err(handshake_refused());
            }
            let (version, cipher) = match spec {
                ConnectionSpec::ModernTls => ("TLSv1.3", "TLS_AES_128_GCM_SHA256"),
                ConnectionSpec::CompatibleTls => ("TLSv1.2", "TLS_ECDHE_RSA_WITH_AES_128_GCM_SHA256"),
                ConnectionSpec::Cleartext => ("", ""),
            };
            Ok(courier::connect::tls::TlsStream {
                io,
                handshake: courier::connect::tls::Handshake {
                    tls_version: version.to_string(),
                    cipher_suite: cipher.to_string(),
                    peer_certificates: vec![courier::connect::tls::PeerCertificate {
                        subject: "cn=fake".to_string(),
                        subject_alternative_names: self.sans.clone(),
                    }],
                    local_certificates: Vec::new(),
                },
                alpn: self.alpn,
            })
        })
    }
}

fn handshake_refused() -> courier::Error {
    courier::Error::tls(std::io::Error::new(
        std::io::ErrorKind::InvalidData,
        "handshake refused by scripted collaborator",
    ))
}
