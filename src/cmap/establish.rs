use bson::{doc, Bson, Document};
use lazy_static::lazy_static;
use serde::Serialize;

use crate::{
    client::{
        auth::ClientFirst,
        options::{ClientOptions, TlsOptions},
    },
    cmap::{conn::Connection, StreamDescription},
    compression::Compressor,
    error::{Error, ErrorKind, Result},
    hello::{hello_command, run_hello, HelloReply},
    options::Credential,
};

/// The maximum size in bytes of the `client` metadata document; handshakes exceeding it have
/// their platform field truncated.
const MAX_METADATA_SIZE: usize = 512;

#[derive(Clone, Debug, Serialize)]
struct ClientMetadata {
    driver: DriverMetadata,
    os: OsMetadata,
    platform: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    application: Option<AppMetadata>,
}

#[derive(Clone, Debug, Serialize)]
struct DriverMetadata {
    name: &'static str,
    version: &'static str,
}

#[derive(Clone, Debug, Serialize)]
struct OsMetadata {
    #[serde(rename = "type")]
    os_type: String,
    architecture: &'static str,
}

#[derive(Clone, Debug, Serialize)]
struct AppMetadata {
    name: String,
}

lazy_static! {
    static ref BASE_CLIENT_METADATA: ClientMetadata = ClientMetadata {
        driver: DriverMetadata {
            name: "mongodb-core",
            version: env!("CARGO_PKG_VERSION"),
        },
        os: OsMetadata {
            os_type: os_info::get().os_type().to_string(),
            architecture: std::env::consts::ARCH,
        },
        platform: format!("rustc {}", rustc_version_runtime::version()),
        application: None,
    };
}

/// The result of the handshake portion of establishing a connection.
#[derive(Debug)]
pub(crate) struct HandshakeResult {
    /// The hello reply from the server.
    pub(crate) hello_reply: HelloReply,
}

/// Runs the initial `isMaster` exchange on freshly opened connections, negotiating
/// compression and authentication, and caching the resulting capability vector on the
/// connection.
#[derive(Clone, Debug)]
pub(crate) struct Handshaker {
    app_name: Option<String>,
    compressors: Option<Vec<Compressor>>,
    credential: Option<Credential>,
}

impl Handshaker {
    pub(crate) fn new(options: &ClientOptions) -> Self {
        Self {
            app_name: options.app_name.clone(),
            compressors: options.compressors.clone(),
            credential: options.credential.clone(),
        }
    }

    /// Constructs a handshaker that never authenticates, for use by monitors.
    pub(crate) fn for_monitoring(options: &ClientOptions) -> Self {
        Self {
            app_name: options.app_name.clone(),
            compressors: None,
            credential: None,
        }
    }

    fn metadata(&self) -> Result<Document> {
        let mut metadata = BASE_CLIENT_METADATA.clone();
        if let Some(ref app_name) = self.app_name {
            metadata.application = Some(AppMetadata {
                name: app_name.clone(),
            });
        }

        let mut doc = match bson::to_bson(&metadata)? {
            Bson::Document(doc) => doc,
            _ => Document::new(),
        };

        if crate::bson_util::document_byte_size(&doc)? > MAX_METADATA_SIZE {
            doc.remove("platform");
        }

        Ok(doc)
    }

    /// Performs the handshake on the given connection, authenticating afterwards when a
    /// credential is configured. The server's reply to a speculative authentication attempt is
    /// used to resume the conversation, saving a round trip.
    pub(crate) async fn handshake(&self, conn: &mut Connection) -> Result<HandshakeResult> {
        let mut command = hello_command(None);
        command.body.insert("client", self.metadata()?);

        if let Some(ref compressors) = self.compressors {
            command.body.insert(
                "compression",
                Bson::Array(
                    compressors
                        .iter()
                        .map(|c| Bson::String(c.name().to_string()))
                        .collect(),
                ),
            );
        }

        let client_first = match self.credential {
            Some(ref credential) => {
                credential.append_needed_mechanism_negotiation(&mut command.body);
                let client_first = credential.build_speculative_client_first()?;
                if let Some(ref client_first) = client_first {
                    command
                        .body
                        .insert("speculativeAuthenticate", client_first.to_document());
                }
                client_first
            }
            None => None,
        };

        let mut reply = run_hello(conn, command)
            .await
            .map_err(Error::into_handshake_error)?;

        conn.set_stream_description(StreamDescription::from_hello_reply(&reply));

        // Compression negotiation: the first client-advertised compressor the server also
        // supports wins.
        if let (Some(client_compressors), Some(server_compressors)) = (
            self.compressors.as_ref(),
            reply.command_response.compressors.as_ref(),
        ) {
            conn.compressor = client_compressors
                .iter()
                .find(|c| server_compressors.iter().any(|s| s == c.name()))
                .cloned();
        }

        if let Some(ref credential) = self.credential {
            let server_first = reply.command_response.speculative_authenticate.take();
            let first_round = client_first
                .and_then(|cf| server_first.map(|sf| cf.into_first_round(sf)));
            credential.authenticate_stream(conn, first_round).await?;
        }

        Ok(HandshakeResult { hello_reply: reply })
    }
}

impl Error {
    /// Wraps a failure of the initial `isMaster` exchange. TLS and socket failures during
    /// establishment also surface with this kind via the same path.
    pub(crate) fn into_handshake_error(self) -> Error {
        ErrorKind::Handshake {
            message: self.to_string(),
        }
        .into()
    }
}

/// Establishes a connection: opens the socket (optionally TLS), handshakes and authenticates.
pub(crate) async fn establish_connection(
    handshaker: &Handshaker,
    address: crate::options::ServerAddress,
    generation: u32,
    connect_timeout: Option<std::time::Duration>,
    socket_timeout: Option<std::time::Duration>,
    tls_options: Option<&TlsOptions>,
) -> Result<(Connection, HelloReply)> {
    let mut conn = Connection::connect(
        address,
        generation,
        connect_timeout,
        socket_timeout,
        tls_options,
    )
    .await
    .map_err(Error::into_handshake_error)?;

    let result = handshaker.handshake(&mut conn).await?;
    Ok((conn, result.hello_reply))
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn metadata_includes_driver_and_os() {
        let handshaker = Handshaker {
            app_name: Some("testApp".to_string()),
            compressors: None,
            credential: None,
        };

        let metadata = handshaker.metadata().unwrap();
        let driver = metadata.get_document("driver").unwrap();
        assert_eq!(driver.get_str("name").unwrap(), "mongodb-core");
        assert!(!driver.get_str("version").unwrap().is_empty());
        assert!(metadata.get_document("os").unwrap().contains_key("type"));
        assert_eq!(
            metadata
                .get_document("application")
                .unwrap()
                .get_str("name")
                .unwrap(),
            "testApp"
        );
    }

    #[test]
    fn metadata_omits_application_without_app_name() {
        let handshaker = Handshaker {
            app_name: None,
            compressors: None,
            credential: None,
        };
        assert!(!handshaker.metadata().unwrap().contains_key("application"));
    }
}
