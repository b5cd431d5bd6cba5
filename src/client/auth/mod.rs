//! Contains the types needed to specify the auth configuration for a
//! [`Client`](../../struct.Client.html).

mod sasl;
pub(crate) mod scram;
mod x509;

use std::str::FromStr;

use bson::Document;
use derivative::Derivative;
use rand::Rng;
use serde::Deserialize;
use typed_builder::TypedBuilder;

use self::scram::ScramVersion;
use crate::{
    cmap::{Command, Connection, StreamDescription},
    error::{Error, ErrorKind, Result},
};

const SCRAM_SHA_1_STR: &str = "SCRAM-SHA-1";
const SCRAM_SHA_256_STR: &str = "SCRAM-SHA-256";
const MONGODB_X509_STR: &str = "MONGODB-X509";

/// The authentication mechanisms supported by this driver.
#[derive(Clone, Deserialize, PartialEq, Debug)]
#[non_exhaustive]
pub enum AuthMechanism {
    /// The SCRAM-SHA-1 mechanism as defined in [RFC 5802](http://tools.ietf.org/html/rfc5802).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha1,

    /// The SCRAM-SHA-256 mechanism which extends [RFC 5802](http://tools.ietf.org/html/rfc5802) and is formally defined in [RFC 7677](https://tools.ietf.org/html/rfc7677).
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-scram/) for more information.
    ScramSha256,

    /// The MONGODB-X509 mechanism based on the usage of X.509 certificates to validate a client
    /// where the distinguished subject name of the client certificate acts as the username.
    ///
    /// See the [MongoDB documentation](https://www.mongodb.com/docs/manual/core/security-x.509/) for more information.
    MongoDbX509,
}

impl AuthMechanism {
    /// Selects the mechanism to use based on the `saslSupportedMechs` reported by the
    /// handshake, preferring SCRAM-SHA-256. When the server reported no mechanisms (e.g. the
    /// user does not exist), SCRAM-SHA-1 is used so that the failure surfaces as a generic
    /// authentication error.
    pub(crate) fn from_stream_description(description: &StreamDescription) -> AuthMechanism {
        let scram_sha_256_found = description
            .sasl_supported_mechs
            .as_ref()
            .map(|ms| ms.iter().any(|m| m == AuthMechanism::ScramSha256.as_str()))
            .unwrap_or(false);

        if scram_sha_256_found {
            AuthMechanism::ScramSha256
        } else {
            AuthMechanism::ScramSha1
        }
    }

    /// Determines if the provided credentials have the required information to perform
    /// authentication.
    pub fn validate_credential(&self, credential: &Credential) -> Result<()> {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => {
                if credential.username.is_none() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "No username provided for SCRAM authentication".to_string(),
                    }
                    .into());
                };
                Ok(())
            }
            AuthMechanism::MongoDbX509 => {
                if credential.password.is_some() {
                    return Err(ErrorKind::InvalidArgument {
                        message: "A password cannot be specified with MONGODB-X509".to_string(),
                    }
                    .into());
                }

                if credential.source.as_deref().unwrap_or("$external") != "$external" {
                    return Err(ErrorKind::InvalidArgument {
                        message: "only $external may be specified as an auth source for \
                                  MONGODB-X509"
                            .to_string(),
                    }
                    .into());
                }

                Ok(())
            }
        }
    }

    /// Returns this `AuthMechanism` as a string.
    pub fn as_str(&self) -> &'static str {
        match self {
            AuthMechanism::ScramSha1 => SCRAM_SHA_1_STR,
            AuthMechanism::ScramSha256 => SCRAM_SHA_256_STR,
            AuthMechanism::MongoDbX509 => MONGODB_X509_STR,
        }
    }

    /// Get the default authSource for a given mechanism depending on the database provided in the
    /// connection string.
    pub(crate) fn default_source<'a>(&'a self, uri_db: Option<&'a str>) -> &'a str {
        match self {
            AuthMechanism::ScramSha1 | AuthMechanism::ScramSha256 => uri_db.unwrap_or("admin"),
            AuthMechanism::MongoDbX509 => "$external",
        }
    }

    /// Constructs the first message of the SASL handshake for inclusion in the initial
    /// handshake via `speculativeAuthenticate`.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<Option<ClientFirst>> {
        match self {
            Self::ScramSha1 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha1,
                ScramVersion::Sha1.build_speculative_client_first(credential)?,
            ))),
            Self::ScramSha256 => Ok(Some(ClientFirst::Scram(
                ScramVersion::Sha256,
                ScramVersion::Sha256.build_speculative_client_first(credential)?,
            ))),
            Self::MongoDbX509 => Ok(Some(ClientFirst::X509(Box::new(
                x509::build_speculative_client_first(credential),
            )))),
        }
    }

    /// Performs the authentication handshake for this mechanism over the given connection.
    pub(crate) async fn authenticate_stream(
        &self,
        stream: &mut Connection,
        credential: &Credential,
    ) -> Result<()> {
        self.validate_credential(credential)?;

        match self {
            AuthMechanism::ScramSha1 => {
                ScramVersion::Sha1
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::ScramSha256 => {
                ScramVersion::Sha256
                    .authenticate_stream(stream, credential, None)
                    .await
            }
            AuthMechanism::MongoDbX509 => x509::authenticate_stream(stream, credential, None).await,
        }
    }
}

impl FromStr for AuthMechanism {
    type Err = Error;

    fn from_str(str: &str) -> Result<Self> {
        match str {
            SCRAM_SHA_1_STR => Ok(AuthMechanism::ScramSha1),
            SCRAM_SHA_256_STR => Ok(AuthMechanism::ScramSha256),
            MONGODB_X509_STR => Ok(AuthMechanism::MongoDbX509),
            _ => Err(ErrorKind::InvalidArgument {
                message: format!("invalid mechanism string: {}", str),
            }
            .into()),
        }
    }
}

/// A struct containing authentication information.
///
/// Some fields (mechanism and source) may be omitted and will either be negotiated or assigned a
/// default value, depending on the values of other fields in the credential.
#[derive(Clone, Default, Deserialize, TypedBuilder, Derivative)]
#[derivative(Debug, PartialEq)]
#[builder(field_defaults(default, setter(into, strip_option)))]
#[non_exhaustive]
pub struct Credential {
    /// The username to authenticate with. This applies to all mechanisms but may be omitted when
    /// authenticating via MONGODB-X509.
    pub username: Option<String>,

    /// The database used to authenticate. This applies to all mechanisms and defaults to "admin"
    /// in SCRAM authentication mechanisms and "$external" for MONGODB-X509.
    pub source: Option<String>,

    /// The password to authenticate with. This does not apply to all mechanisms.
    #[derivative(Debug = "ignore")]
    pub password: Option<String>,

    /// Which authentication mechanism to use. If not provided, one will be negotiated with the
    /// server.
    pub mechanism: Option<AuthMechanism>,

    /// Additional properties for the given mechanism.
    pub mechanism_properties: Option<Document>,
}

impl Credential {
    /// The database this credential authenticates against, accounting for mechanism defaults.
    pub(crate) fn resolved_source(&self) -> &str {
        self.source.as_deref().unwrap_or_else(|| {
            self.mechanism
                .as_ref()
                .map(|m| m.default_source(None))
                .unwrap_or("admin")
        })
    }

    /// If the mechanism is missing, append the appropriate mechanism negotiation key-value-pair to
    /// the provided hello command document.
    pub(crate) fn append_needed_mechanism_negotiation(&self, command: &mut Document) {
        if let (Some(username), None) = (self.username.as_ref(), self.mechanism.as_ref()) {
            command.insert(
                "saslSupportedMechs",
                format!("{}.{}", self.resolved_source(), username),
            );
        }
    }

    /// Attempts to prepare the first round of authentication to be included in the initial
    /// handshake via `speculativeAuthenticate`.
    pub(crate) fn build_speculative_client_first(&self) -> Result<Option<ClientFirst>> {
        match self.mechanism {
            Some(ref mechanism) => mechanism.build_speculative_client_first(self),
            None => Ok(None),
        }
    }

    /// Authenticates the connection, using the mechanism negotiated during the handshake when
    /// none was specified and resuming a speculative exchange when the server replied to one.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        // If the server responded to the speculative exchange, resume it rather than starting
        // over.
        if let Some(first_round) = first_round {
            return match first_round {
                FirstRound::Scram(version, server_first) => {
                    version
                        .authenticate_stream(conn, self, Some(server_first))
                        .await
                }
                FirstRound::X509(server_response) => {
                    x509::authenticate_stream(conn, self, Some(server_response)).await
                }
            };
        }

        let (mechanism, negotiated) = match self.mechanism {
            Some(ref mechanism) => (mechanism.clone(), false),
            None => (
                AuthMechanism::from_stream_description(conn.stream_description()?),
                true,
            ),
        };

        match mechanism.authenticate_stream(conn, self).await {
            // When the mechanism was negotiated, server-side failures surface generically so
            // that an unknown user is indistinguishable from a bad password.
            Err(e) if negotiated && e.is_auth_error() => {
                Err(Error::mechanism_negotiation_error())
            }
            other => other,
        }
    }
}

/// The first message sent as part of authentication, carried in the handshake's
/// `speculativeAuthenticate` field.
#[derive(Debug)]
pub(crate) enum ClientFirst {
    Scram(ScramVersion, scram::ClientFirst),
    X509(Box<Command>),
}

impl ClientFirst {
    pub(crate) fn to_document(&self) -> Document {
        match self {
            Self::Scram(version, client_first) => {
                let command = client_first.to_command(version);
                let mut body = command.body;
                body.insert("db", command.target_db);
                body
            }
            Self::X509(command) => command.body.clone(),
        }
    }

    pub(crate) fn into_first_round(self, server_first: Document) -> FirstRound {
        match self {
            Self::Scram(version, client_first) => FirstRound::Scram(
                version,
                scram::FirstRound {
                    client_first,
                    server_first,
                },
            ),
            Self::X509(..) => FirstRound::X509(server_first),
        }
    }
}

/// The first exchange of an authentication conversation that was begun speculatively in the
/// handshake.
#[derive(Debug)]
pub(crate) enum FirstRound {
    Scram(ScramVersion, scram::FirstRound),
    X509(Document),
}

pub(crate) fn generate_nonce() -> String {
    let result: [u8; 32] = rand::thread_rng().gen();
    base64::encode(result)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn negotiation_prefers_sha_256() {
        let mut description = StreamDescription::new_testing();
        description.sasl_supported_mechs =
            Some(vec!["SCRAM-SHA-1".to_string(), "SCRAM-SHA-256".to_string()]);
        assert_eq!(
            AuthMechanism::from_stream_description(&description),
            AuthMechanism::ScramSha256
        );
    }

    #[test]
    fn negotiation_falls_back_to_sha_1() {
        let mut description = StreamDescription::new_testing();
        description.sasl_supported_mechs = Some(vec!["SCRAM-SHA-1".to_string()]);
        assert_eq!(
            AuthMechanism::from_stream_description(&description),
            AuthMechanism::ScramSha1
        );

        // An absent list (e.g. an unknown user) also falls back to SCRAM-SHA-1.
        description.sasl_supported_mechs = None;
        assert_eq!(
            AuthMechanism::from_stream_description(&description),
            AuthMechanism::ScramSha1
        );
    }

    #[test]
    fn x509_rejects_password() {
        let credential = Credential::builder()
            .username("CN=client".to_string())
            .password("hunter2".to_string())
            .build();
        assert!(AuthMechanism::MongoDbX509
            .validate_credential(&credential)
            .is_err());
    }

    #[test]
    fn negotiation_key_appended_when_mechanism_unset() {
        let credential = Credential::builder().username("alice".to_string()).build();
        let mut command = Document::new();
        credential.append_needed_mechanism_negotiation(&mut command);
        assert_eq!(command.get_str("saslSupportedMechs").unwrap(), "admin.alice");
    }
}
