//! Probe transport.
//!
//! [`HttpProber`] issues one HTTP/1.1 request per probe and keeps a single
//! keep-alive connection between probes. HTTPS targets are wrapped with
//! `tokio-rustls` against the webpki root set.

use std::future::Future;
use std::io;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use http::{Method, Request, Uri};
use http_body_util::{BodyExt, Empty};
use hyper::client::conn::http1::SendRequest;
use hyper_util::rt::TokioIo;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio::time::{Instant, timeout};
use tokio_rustls::TlsConnector;
use tracing::debug;

use pagemon_core::{Config, Transient};

const USER_AGENT: &str = concat!("pagemon/", env!("CARGO_PKG_VERSION"));

/// Result of one successful probe.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOutcome {
    pub status: u16,
    /// From request start to response head.
    pub elapsed: Duration,
}

/// Why a probe failed.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("dns lookup for {host} failed: {source}")]
    Dns {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("{host} resolved to no addresses")]
    NoAddress { host: String },

    #[error("connect to {host} failed: {source}")]
    Connect {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("connect to {host} timed out after {timeout:?}")]
    ConnectTimeout { host: String, timeout: Duration },

    #[error("tls handshake with {host} failed: {source}")]
    Tls {
        host: String,
        #[source]
        source: io::Error,
    },

    #[error("http exchange failed: {0}")]
    Http(#[from] hyper::Error),

    #[error("no response within {0:?}")]
    ReadTimeout(Duration),

    #[error("tls setup failed: {0}")]
    TlsSetup(#[from] rustls::Error),

    #[error("invalid probe target: {0}")]
    InvalidTarget(String),

    #[error("probe client is closed")]
    Closed,
}

impl Transient for ProbeError {
    fn is_transient(&self) -> bool {
        !matches!(
            self,
            Self::InvalidTarget(_) | Self::TlsSetup(_) | Self::Closed
        )
    }
}

/// A probe of one endpoint.
pub trait Probe: Send + Sync {
    /// The probed URL, as configured.
    fn url(&self) -> &str;

    /// Perform a single probe.
    fn probe(&self) -> impl Future<Output = Result<ProbeOutcome, ProbeError>> + Send;

    /// Release network resources; later probes fail with [`ProbeError::Closed`].
    fn close(&self) -> impl Future<Output = ()> + Send;
}

/// Host, port and request target derived from the configured URL.
#[derive(Debug, Clone)]
struct Target {
    url: String,
    host: String,
    port: u16,
    authority: String,
    path: String,
    https: bool,
}

impl Target {
    fn parse(url: &str, uri: &Uri) -> Result<Self, ProbeError> {
        let https = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            other => {
                return Err(ProbeError::InvalidTarget(format!(
                    "unsupported scheme {other:?}"
                )));
            }
        };
        let authority = uri
            .authority()
            .ok_or_else(|| ProbeError::InvalidTarget("missing host".to_string()))?;
        let host = authority
            .host()
            .trim_start_matches('[')
            .trim_end_matches(']')
            .to_string();
        if host.is_empty() {
            return Err(ProbeError::InvalidTarget("missing host".to_string()));
        }
        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str().to_string())
            .filter(|p| !p.is_empty())
            .unwrap_or_else(|| "/".to_string());

        Ok(Self {
            url: url.to_string(),
            host,
            port: authority.port_u16().unwrap_or(if https { 443 } else { 80 }),
            authority: authority.as_str().to_string(),
            path,
            https,
        })
    }
}

/// Open HTTP/1 connection plus the task driving it.
struct Connection {
    sender: SendRequest<Empty<Bytes>>,
    driver: JoinHandle<()>,
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.driver.abort();
    }
}

/// HTTP(S) prober with one cached keep-alive connection.
pub struct HttpProber {
    target: Target,
    method: Method,
    connect_timeout: Duration,
    read_timeout: Duration,
    tls: Option<TlsConnector>,
    conn: Mutex<Option<Connection>>,
    closed: AtomicBool,
}

impl HttpProber {
    /// Build a prober for the configured target.
    pub fn new(config: &Config) -> Result<Self, ProbeError> {
        Self::with_options(
            &config.url,
            config.probe_method.as_http(),
            config.connect_timeout,
            config.read_timeout,
        )
    }

    pub fn with_options(
        url: &str,
        method: Method,
        connect_timeout: Duration,
        read_timeout: Duration,
    ) -> Result<Self, ProbeError> {
        let uri: Uri = url
            .parse()
            .map_err(|e: http::uri::InvalidUri| ProbeError::InvalidTarget(e.to_string()))?;
        let target = Target::parse(url, &uri)?;
        let tls = if target.https {
            Some(tls_connector()?)
        } else {
            None
        };

        Ok(Self {
            target,
            method,
            connect_timeout,
            read_timeout,
            tls,
            conn: Mutex::new(None),
            closed: AtomicBool::new(false),
        })
    }

    /// Whether a keep-alive connection is currently cached.
    pub async fn has_idle_connection(&self) -> bool {
        self.conn.lock().await.is_some()
    }

    async fn checkout(&self) -> Result<Connection, ProbeError> {
        let cached = self.conn.lock().await.take();
        if let Some(mut conn) = cached {
            if let Ok(Ok(())) = timeout(self.connect_timeout, conn.sender.ready()).await {
                return Ok(conn);
            }
            debug!(host = %self.target.host, "cached probe connection unusable, reconnecting");
        }

        match timeout(self.connect_timeout, self.connect()).await {
            Ok(result) => result,
            Err(_) => Err(ProbeError::ConnectTimeout {
                host: self.target.host.clone(),
                timeout: self.connect_timeout,
            }),
        }
    }

    async fn connect(&self) -> Result<Connection, ProbeError> {
        let host = &self.target.host;
        let addrs = tokio::net::lookup_host((host.as_str(), self.target.port))
            .await
            .map_err(|source| ProbeError::Dns {
                host: host.clone(),
                source,
            })?;

        let mut last_err = None;
        let mut stream = None;
        for addr in addrs {
            match TcpStream::connect(addr).await {
                Ok(s) => {
                    stream = Some(s);
                    break;
                }
                Err(e) => {
                    debug!(%addr, error = %e, "probe connect attempt failed");
                    last_err = Some(e);
                }
            }
        }
        let stream = match (stream, last_err) {
            (Some(s), _) => s,
            (None, Some(source)) => {
                return Err(ProbeError::Connect {
                    host: host.clone(),
                    source,
                });
            }
            (None, None) => return Err(ProbeError::NoAddress { host: host.clone() }),
        };
        let _ = stream.set_nodelay(true);

        match &self.tls {
            Some(tls) => {
                let name = ServerName::try_from(host.clone())
                    .map_err(|e| ProbeError::InvalidTarget(e.to_string()))?;
                let stream = tls
                    .connect(name, stream)
                    .await
                    .map_err(|source| ProbeError::Tls {
                        host: host.clone(),
                        source,
                    })?;
                handshake(TokioIo::new(stream)).await
            }
            None => handshake(TokioIo::new(stream)).await,
        }
    }

    fn request(&self) -> Result<Request<Empty<Bytes>>, ProbeError> {
        Request::builder()
            .method(self.method.clone())
            .uri(self.target.path.as_str())
            .header(http::header::HOST, self.target.authority.as_str())
            .header(http::header::USER_AGENT, USER_AGENT)
            .body(Empty::new())
            .map_err(|e| ProbeError::InvalidTarget(e.to_string()))
    }
}

impl Probe for HttpProber {
    fn url(&self) -> &str {
        &self.target.url
    }

    async fn probe(&self) -> Result<ProbeOutcome, ProbeError> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ProbeError::Closed);
        }

        let started = Instant::now();
        let mut conn = self.checkout().await?;
        let request = self.request()?;

        let response = match timeout(self.read_timeout, conn.sender.send_request(request)).await
        {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => return Err(ProbeError::Http(e)),
            Err(_) => return Err(ProbeError::ReadTimeout(self.read_timeout)),
        };
        let elapsed = started.elapsed();
        let status = response.status().as_u16();

        // The body is discarded frame by frame; draining it lets the
        // connection be reused without buffering the page.
        let mut body = response.into_body();
        let drain = async {
            while let Some(frame) = body.frame().await {
                frame?;
            }
            Ok::<_, hyper::Error>(())
        };
        let drained = timeout(self.read_timeout, drain).await;
        if matches!(drained, Ok(Ok(())))
            && !conn.sender.is_closed()
            && !self.closed.load(Ordering::Acquire)
        {
            *self.conn.lock().await = Some(conn);
        }

        debug!(url = %self.target.url, status, elapsed_us = elapsed.as_micros() as u64, "probe complete");
        Ok(ProbeOutcome { status, elapsed })
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
        if self.conn.lock().await.take().is_some() {
            debug!(url = %self.target.url, "closed cached probe connection");
        }
    }
}

async fn handshake<T>(io: T) -> Result<Connection, ProbeError>
where
    T: hyper::rt::Read + hyper::rt::Write + Unpin + Send + 'static,
{
    let (sender, conn) = hyper::client::conn::http1::handshake(io).await?;
    let driver = tokio::spawn(async move {
        if let Err(e) = conn.await {
            debug!(error = %e, "probe connection closed with error");
        }
    });
    Ok(Connection { sender, driver })
}

fn tls_connector() -> Result<TlsConnector, ProbeError> {
    let mut roots = rustls::RootCertStore::empty();
    roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

    let mut config =
        rustls::ClientConfig::builder_with_provider(rustls::crypto::ring::default_provider().into())
            .with_safe_default_protocol_versions()?
            .with_root_certificates(roots)
            .with_no_client_auth();
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    Ok(TlsConnector::from(Arc::new(config)))
}
