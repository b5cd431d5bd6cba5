use std::{
    fs::File,
    io::BufReader,
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
    time::Duration,
};

use rustls::{
    client::{ServerCertVerified, ServerCertVerifier},
    Certificate,
    ClientConfig,
    Error as TlsError,
    OwnedTrustAnchor,
    PrivateKey,
    RootCertStore,
    ServerName,
};
use tokio::{
    io::{AsyncRead, AsyncWrite, ReadBuf},
    net::TcpStream,
};
use tokio_rustls::TlsConnector;

use crate::{
    client::options::TlsOptions,
    error::{ErrorKind, Result},
    options::ServerAddress,
    runtime,
};

const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEPALIVE_TIME: Duration = Duration::from_secs(120);

/// A TCP stream to a server, optionally wrapped in TLS.
#[derive(Debug)]
pub(crate) enum AsyncStream {
    Tcp(TcpStream),
    Tls(Box<tokio_rustls::client::TlsStream<TcpStream>>),
}

impl AsyncStream {
    /// Opens a socket to the given address, performing the TLS handshake as well when TLS
    /// options are supplied. The entire establishment is bounded by `connect_timeout`.
    pub(crate) async fn connect(
        address: ServerAddress,
        connect_timeout: Option<Duration>,
        tls_options: Option<&TlsOptions>,
    ) -> Result<Self> {
        let timeout = match connect_timeout {
            Some(timeout) if timeout.is_zero() => None,
            Some(timeout) => Some(timeout),
            None => Some(DEFAULT_CONNECT_TIMEOUT),
        };

        let connect = Self::connect_inner(&address, tls_options);
        match timeout {
            Some(timeout) => runtime::timeout(timeout, connect).await?,
            None => connect.await,
        }
    }

    async fn connect_inner(
        address: &ServerAddress,
        tls_options: Option<&TlsOptions>,
    ) -> Result<Self> {
        let tcp_stream = TcpStream::connect((address.host.as_str(), address.port())).await?;
        tcp_stream.set_nodelay(true)?;

        let socket = socket2::SockRef::from(&tcp_stream);
        let keepalive = socket2::TcpKeepalive::new().with_time(KEEPALIVE_TIME);
        socket.set_tcp_keepalive(&keepalive)?;

        match tls_options {
            Some(tls_options) => {
                let config = make_rustls_config(tls_options)?;
                let connector: TlsConnector = Arc::new(config).into();
                let server_name = ServerName::try_from(address.host.as_str()).map_err(|e| {
                    ErrorKind::InvalidTlsConfig {
                        message: format!("invalid DNS name {}: {}", address.host, e),
                    }
                })?;
                let stream = connector.connect(server_name, tcp_stream).await?;
                Ok(AsyncStream::Tls(Box::new(stream)))
            }
            None => Ok(AsyncStream::Tcp(tcp_stream)),
        }
    }
}

/// Converts `TlsOptions` into a rustls client configuration.
pub(crate) fn make_rustls_config(options: &TlsOptions) -> Result<ClientConfig> {
    let mut root_store = RootCertStore::empty();
    root_store.add_server_trust_anchors(webpki_roots::TLS_SERVER_ROOTS.0.iter().map(|ta| {
        OwnedTrustAnchor::from_subject_spki_name_constraints(
            ta.subject,
            ta.spki,
            ta.name_constraints,
        )
    }));

    if let Some(ref path) = options.ca_file_path {
        let mut reader = BufReader::new(File::open(path)?);
        let certs = rustls_pemfile::certs(&mut reader).map_err(|e| ErrorKind::InvalidTlsConfig {
            message: format!("unable to parse CA file {}: {}", path.display(), e),
        })?;
        for cert in certs {
            root_store
                .add(&Certificate(cert))
                .map_err(|e| ErrorKind::InvalidTlsConfig {
                    message: format!("invalid certificate in CA file {}: {}", path.display(), e),
                })?;
        }
    }

    let builder = ClientConfig::builder()
        .with_safe_defaults()
        .with_root_certificates(root_store);

    let mut config = match options.cert_key_file_path {
        Some(ref path) => {
            let mut reader = BufReader::new(File::open(path)?);
            let mut certs = Vec::new();
            let mut key = None;

            for item in rustls_pemfile::read_all(&mut reader).map_err(|e| {
                ErrorKind::InvalidTlsConfig {
                    message: format!(
                        "unable to parse certificate file {}: {}",
                        path.display(),
                        e
                    ),
                }
            })? {
                match item {
                    rustls_pemfile::Item::X509Certificate(bytes) => {
                        certs.push(Certificate(bytes))
                    }
                    rustls_pemfile::Item::PKCS8Key(bytes) | rustls_pemfile::Item::RSAKey(bytes) => {
                        key = Some(PrivateKey(bytes))
                    }
                    _ => {}
                }
            }

            let key = key.ok_or_else(|| ErrorKind::InvalidTlsConfig {
                message: format!("no PEM-encoded private key found in {}", path.display()),
            })?;

            builder
                .with_single_cert(certs, key)
                .map_err(|e| ErrorKind::InvalidTlsConfig {
                    message: format!("invalid client certificate: {}", e),
                })?
        }
        None => builder.with_no_client_auth(),
    };

    if options.allow_invalid_certificates == Some(true)
        || options.allow_invalid_hostnames == Some(true)
    {
        config
            .dangerous()
            .set_certificate_verifier(Arc::new(NoCertVerifier {}));
    }

    Ok(config)
}

/// A certificate verifier that accepts any presented certificate. Installed when the caller
/// opts out of certificate or hostname validation.
struct NoCertVerifier {}

impl ServerCertVerifier for NoCertVerifier {
    fn verify_server_cert(
        &self,
        _: &Certificate,
        _: &[Certificate],
        _: &ServerName,
        _: &mut dyn Iterator<Item = &[u8]>,
        _: &[u8],
        _: std::time::SystemTime,
    ) -> std::result::Result<ServerCertVerified, TlsError> {
        Ok(ServerCertVerified::assertion())
    }
}

impl AsyncRead for AsyncStream {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
            Self::Tls(ref mut stream) => Pin::new(stream).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for AsyncStream {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
            Self::Tls(ref mut stream) => Pin::new(stream).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_flush(cx),
            Self::Tls(ref mut stream) => Pin::new(stream).poll_flush(cx),
        }
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            Self::Tcp(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
            Self::Tls(ref mut stream) => Pin::new(stream).poll_shutdown(cx),
        }
    }
}
