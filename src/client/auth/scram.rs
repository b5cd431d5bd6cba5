use std::{
    borrow::Cow,
    collections::HashMap,
    fmt::{self, Display, Formatter},
    ops::{BitXor, Range},
    str,
    sync::RwLock,
};

use bson::{Bson, Document};
use hmac::{digest::KeyInit, Hmac, Mac};
use lazy_static::lazy_static;
use md5::Md5;
use sha1::{Digest, Sha1};
use sha2::Sha256;

use crate::{
    client::auth::{
        self,
        sasl::{SaslContinue, SaslResponse, SaslStart},
        AuthMechanism,
        Credential,
    },
    cmap::{Command, Connection},
    error::{Error, Result},
};

// The single letter attribute keys in SCRAM messages.
const ITERATION_COUNT_KEY: char = 'i';
const ERROR_KEY: char = 'e';
const PROOF_KEY: char = 'p';
const VERIFIER_KEY: char = 'v';
const NONCE_KEY: char = 'r';
const SALT_KEY: char = 's';
const CHANNEL_BINDING_KEY: char = 'c';
const USERNAME_KEY: char = 'n';

/// Constant specifying that we won't be using channel binding.
const NO_CHANNEL_BINDING: char = 'n';

/// The minimum number of iterations of the hash function that we will accept from the server.
const MIN_ITERATION_COUNT: u32 = 4096;

lazy_static! {
    /// Cache of pre-computed salted passwords.
    static ref CREDENTIAL_CACHE: RwLock<HashMap<CacheEntry, Vec<u8>>> = {
        RwLock::new(HashMap::new())
    };
}

#[derive(Hash, Eq, PartialEq)]
struct CacheEntry {
    password: String,
    salt: Vec<u8>,
    i: u32,
    mechanism: ScramVersion,
}

/// The versions of SCRAM supported by the driver (classified according to the hash function
/// used).
#[derive(Hash, Eq, PartialEq, Clone, Debug)]
pub(crate) enum ScramVersion {
    Sha1,
    Sha256,
}

impl ScramVersion {
    fn mechanism(&self) -> AuthMechanism {
        match self {
            ScramVersion::Sha1 => AuthMechanism::ScramSha1,
            ScramVersion::Sha256 => AuthMechanism::ScramSha256,
        }
    }

    /// Constructs the client first message for a speculative authentication attempt carried by
    /// the initial handshake.
    pub(crate) fn build_speculative_client_first(
        &self,
        credential: &Credential,
    ) -> Result<ClientFirst> {
        let username = credential
            .username
            .as_ref()
            .ok_or_else(|| Error::authentication_error(&self.to_string(), "no username supplied"))?;

        Ok(ClientFirst::new(
            credential.resolved_source().to_string(),
            username,
            auth::generate_nonce().as_str(),
        ))
    }

    /// Perform SCRAM authentication for a given stream. When the handshake carried a
    /// speculative first exchange, the conversation resumes from its server first message.
    pub(crate) async fn authenticate_stream(
        &self,
        conn: &mut Connection,
        credential: &Credential,
        first_round: Option<FirstRound>,
    ) -> Result<()> {
        let username = credential
            .username
            .as_ref()
            .ok_or_else(|| Error::authentication_error(&self.to_string(), "no username supplied"))?;

        let password = credential
            .password
            .as_ref()
            .ok_or_else(|| Error::authentication_error(&self.to_string(), "no password supplied"))?;

        let source = credential.resolved_source().to_string();

        if credential.mechanism_properties.is_some() {
            return Err(Error::authentication_error(
                &self.to_string(),
                "mechanism properties MUST NOT be specified",
            ));
        };

        let (client_first, server_first_doc) = match first_round {
            Some(FirstRound {
                client_first,
                server_first,
            }) => (client_first, server_first),
            None => {
                let client_first = ClientFirst::new(
                    source.clone(),
                    username,
                    auth::generate_nonce().as_str(),
                );

                let command = client_first.to_command(self);
                let server_first = conn.send_command(command, None).await?;
                (client_first, server_first.into_raw())
            }
        };

        let server_first = ServerFirst::parse(&self.to_string(), server_first_doc)?;
        server_first.validate(client_first.nonce())?;

        let cache_entry_key = CacheEntry {
            password: password.to_string(),
            salt: server_first.salt().to_vec(),
            i: server_first.i(),
            mechanism: self.clone(),
        };
        let (should_update_cache, salted_password) =
            match CREDENTIAL_CACHE.read().unwrap().get(&cache_entry_key) {
                Some(pwd) => (false, pwd.clone()),
                None => (
                    true,
                    self.compute_salted_password(
                        username,
                        password,
                        server_first.i(),
                        server_first.salt(),
                    )?,
                ),
            };

        let client_final = ClientFinal::new(
            salted_password.as_slice(),
            &client_first,
            &server_first,
            self,
        )?;

        let command = SaslContinue::new(
            source.clone(),
            server_first.conversation_id().clone(),
            client_final.payload(),
        )
        .into_command();

        let response = conn.send_command(command, None).await?;
        let sasl_response = SaslResponse::parse(&self.to_string(), response.into_raw())?;

        let server_final = ServerFinal::parse(&self.to_string(), sasl_response.payload)?;
        server_final.validate(salted_password.as_slice(), &client_final, self)?;

        // With skipEmptyExchange, the server reports `done` on the client final response.
        // Older servers require one more empty exchange before reporting completion.
        if !sasl_response.done {
            let noop = SaslContinue::new(
                source,
                sasl_response.conversation_id.clone(),
                Vec::new(),
            )
            .into_command();
            let response = conn.send_command(noop, None).await?;
            let final_response = SaslResponse::parse(&self.to_string(), response.into_raw())?;

            if !final_response.done
                || final_response.conversation_id != sasl_response.conversation_id
            {
                return Err(Error::authentication_error(
                    &self.to_string(),
                    "authentication did not complete successfully",
                ));
            }
        }

        if should_update_cache {
            if let Ok(ref mut cache) = CREDENTIAL_CACHE.write() {
                if cache.get(&cache_entry_key).is_none() {
                    cache.insert(cache_entry_key, salted_password);
                }
            }
        }

        Ok(())
    }

    /// HMAC function used as part of SCRAM authentication.
    fn hmac(&self, key: &[u8], input: &[u8]) -> Result<Vec<u8>> {
        match self {
            ScramVersion::Sha1 => mac::<Hmac<Sha1>>(key, input, &self.to_string()),
            ScramVersion::Sha256 => mac::<Hmac<Sha256>>(key, input, &self.to_string()),
        }
    }

    /// Compute the HMAC of the given key and input and verify it matches the given signature.
    fn hmac_verify(&self, key: &[u8], input: &[u8], signature: &[u8]) -> Result<()> {
        let is_valid = match self {
            ScramVersion::Sha1 => mac_verify::<Hmac<Sha1>>(key, input, signature),
            ScramVersion::Sha256 => mac_verify::<Hmac<Sha256>>(key, input, signature),
        }?;

        if is_valid {
            Ok(())
        } else {
            Err(Error::authentication_error(
                &self.to_string(),
                "Authentication failed.",
            ))
        }
    }

    /// The "h" function defined in the SCRAM RFC.
    fn h(&self, str: &[u8]) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => hash::<Sha1>(str),
            ScramVersion::Sha256 => hash::<Sha256>(str),
        }
    }

    /// The "h_i" function as defined in the SCRAM RFC.
    fn h_i(&self, str: &str, salt: &[u8], iterations: u32) -> Vec<u8> {
        match self {
            ScramVersion::Sha1 => h_i::<Hmac<Sha1>>(str, salt, iterations, 160 / 8),
            ScramVersion::Sha256 => h_i::<Hmac<Sha256>>(str, salt, iterations, 256 / 8),
        }
    }

    /// The password normalization this SCRAM version applies before salting: SCRAM-SHA-1
    /// MD5-digests `username:mongo:password`, while SCRAM-SHA-256 SASLprep-normalizes the raw
    /// Unicode password.
    fn normalized_password<'a>(&self, username: &str, password: &'a str) -> Result<Cow<'a, str>> {
        match self {
            ScramVersion::Sha1 => {
                let mut md5 = Md5::new();
                md5.update(format!("{}:mongo:{}", username, password));
                Ok(Cow::Owned(hex::encode(md5.finalize())))
            }
            ScramVersion::Sha256 => match stringprep::saslprep(password) {
                Ok(p) => Ok(p),
                Err(_) => Err(Error::authentication_error(
                    "SCRAM-SHA-256",
                    "saslprep failure",
                )),
            },
        }
    }

    /// Computes the salted password according to the SCRAM RFC and the MongoDB-specific
    /// password hashing algorithm.
    fn compute_salted_password(
        &self,
        username: &str,
        password: &str,
        i: u32,
        salt: &[u8],
    ) -> Result<Vec<u8>> {
        let normalized_password = self.normalized_password(username, password)?;
        Ok(self.h_i(normalized_password.as_ref(), salt, i))
    }
}

impl Display for ScramVersion {
    fn fmt(&self, f: &mut Formatter) -> fmt::Result {
        match self {
            ScramVersion::Sha1 => write!(f, "SCRAM-SHA-1"),
            ScramVersion::Sha256 => write!(f, "SCRAM-SHA-256"),
        }
    }
}

fn xor(lhs: &[u8], rhs: &[u8]) -> Vec<u8> {
    debug_assert_eq!(lhs.len(), rhs.len());

    lhs.iter()
        .zip(rhs.iter())
        .map(|(l, r)| l.bitxor(r))
        .collect()
}

fn mac<M: Mac + KeyInit>(key: &[u8], input: &[u8], auth_mechanism: &str) -> Result<Vec<u8>> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error(auth_mechanism))?;
    mac.update(input);
    Ok(mac.finalize().into_bytes().to_vec())
}

fn mac_verify<M: Mac + KeyInit>(key: &[u8], input: &[u8], signature: &[u8]) -> Result<bool> {
    let mut mac = <M as Mac>::new_from_slice(key)
        .map_err(|_| Error::unknown_authentication_error("SCRAM"))?;
    mac.update(input);
    Ok(mac.verify_slice(signature).is_ok())
}

fn hash<D: Digest>(val: &[u8]) -> Vec<u8> {
    let mut hash = D::new();
    hash.update(val);
    hash.finalize().to_vec()
}

fn h_i<M: Mac + KeyInit + Sync + Clone + hmac::digest::FixedOutput>(
    str: &str,
    salt: &[u8],
    iterations: u32,
    output_size: usize,
) -> Vec<u8> {
    let mut buf = vec![0u8; output_size];
    pbkdf2::pbkdf2::<M>(str.as_bytes(), salt, iterations, buf.as_mut_slice());
    buf
}

/// Parses a string slice of the form "<expected_key>=<body>" into "<body>", if possible.
fn parse_kvp(str: &str, expected_key: char) -> Result<String> {
    if str.chars().next() != Some(expected_key) || str.chars().nth(1) != Some('=') {
        Err(Error::invalid_authentication_response("SCRAM"))
    } else {
        Ok(str.chars().skip(2).collect())
    }
}

/// Model of the first message sent by the client.
#[derive(Debug)]
pub(crate) struct ClientFirst {
    source: String,

    message: String,

    gs2_header: Range<usize>,

    bare: Range<usize>,

    nonce: String,
}

impl ClientFirst {
    fn new(source: String, username: &str, nonce: &str) -> Self {
        let gs2_header = format!("{},,", NO_CHANNEL_BINDING);
        let bare = format!(
            "{}={},{}={}",
            USERNAME_KEY, username, NONCE_KEY, nonce
        );
        let full = format!("{}{}", &gs2_header, &bare);
        let end = full.len();
        ClientFirst {
            source,
            message: full,
            gs2_header: Range {
                start: 0,
                end: gs2_header.len(),
            },
            bare: Range {
                start: gs2_header.len(),
                end,
            },
            nonce: nonce.to_string(),
        }
    }

    fn bare_message(&self) -> &str {
        &self.message[self.bare.clone()]
    }

    fn gs2_header(&self) -> &str {
        &self.message[self.gs2_header.clone()]
    }

    fn message(&self) -> &str {
        &self.message[..]
    }

    fn nonce(&self) -> &str {
        &self.nonce
    }

    pub(crate) fn to_command(&self, scram: &ScramVersion) -> Command {
        SaslStart::new(
            self.source.clone(),
            scram.mechanism(),
            self.message().as_bytes().to_vec(),
        )
        .into_command()
    }
}

/// The first round of a SCRAM conversation that was started speculatively during the handshake.
#[derive(Debug)]
pub(crate) struct FirstRound {
    pub(crate) client_first: ClientFirst,
    pub(crate) server_first: Document,
}

/// Model of the first message received from the server.
///
/// This MUST be validated before sending the `ClientFinal` message back to the server.
struct ServerFirst {
    conversation_id: Bson,
    done: bool,
    message: String,
    nonce: String,
    salt: Vec<u8>,
    i: u32,
}

impl ServerFirst {
    fn parse(mechanism_name: &str, response: Document) -> Result<Self> {
        let sasl_response = SaslResponse::parse(mechanism_name, response)?;

        let message = str::from_utf8(&sasl_response.payload)
            .map_err(|_| Error::invalid_authentication_response(mechanism_name))?
            .to_string();

        let parts: Vec<&str> = message.split(',').collect();
        if parts.len() < 3 {
            return Err(Error::invalid_authentication_response(mechanism_name));
        }

        let full_nonce = parse_kvp(parts[0], NONCE_KEY)?;

        let salt = base64::decode(parse_kvp(parts[1], SALT_KEY)?.as_str())
            .map_err(|_| Error::invalid_authentication_response(mechanism_name))?;

        let i: u32 = parse_kvp(parts[2], ITERATION_COUNT_KEY)?
            .parse()
            .map_err(|_| {
                Error::authentication_error(mechanism_name, "iteration count invalid")
            })?;

        Ok(ServerFirst {
            conversation_id: sasl_response.conversation_id,
            done: sasl_response.done,
            message,
            nonce: full_nonce,
            salt,
            i,
        })
    }

    fn conversation_id(&self) -> &Bson {
        &self.conversation_id
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn nonce(&self) -> &str {
        self.nonce.as_str()
    }

    fn salt(&self) -> &[u8] {
        self.salt.as_slice()
    }

    fn i(&self) -> u32 {
        self.i
    }

    fn validate(&self, client_nonce: &str) -> Result<()> {
        if self.done {
            Err(Error::authentication_error(
                "SCRAM",
                "handshake terminated early",
            ))
        } else if !self.nonce.starts_with(client_nonce) {
            Err(Error::authentication_error("SCRAM", "mismatched nonce"))
        } else if self.i < MIN_ITERATION_COUNT {
            Err(Error::authentication_error(
                "SCRAM",
                "iteration count too low",
            ))
        } else {
            Ok(())
        }
    }
}

/// Model of the final message sent by the client.
struct ClientFinal {
    message: String,
    auth_message: String,
}

impl ClientFinal {
    fn new(
        salted_password: &[u8],
        client_first: &ClientFirst,
        server_first: &ServerFirst,
        scram: &ScramVersion,
    ) -> Result<Self> {
        let client_key = scram.hmac(salted_password, b"Client Key")?;
        let stored_key = scram.h(client_key.as_slice());

        let without_proof = format!(
            "{}={},{}={}",
            CHANNEL_BINDING_KEY,
            base64::encode(client_first.gs2_header()),
            NONCE_KEY,
            server_first.nonce()
        );
        let auth_message = format!(
            "{},{},{}",
            client_first.bare_message(),
            server_first.message(),
            without_proof.as_str()
        );
        let client_signature = scram.hmac(stored_key.as_slice(), auth_message.as_bytes())?;
        let client_proof = base64::encode(
            xor(client_key.as_slice(), client_signature.as_slice()).as_slice(),
        );

        let message = format!("{},{}={}", without_proof, PROOF_KEY, client_proof);

        Ok(ClientFinal {
            message,
            auth_message,
        })
    }

    fn payload(&self) -> Vec<u8> {
        self.message().as_bytes().to_vec()
    }

    fn message(&self) -> &str {
        self.message.as_str()
    }

    fn auth_message(&self) -> &str {
        self.auth_message.as_str()
    }
}

enum ServerFinalBody {
    Error(String),
    Verifier(String),
}

/// Model of the final message received from the server.
///
/// This MUST be validated before the authentication conversation is considered successful.
struct ServerFinal {
    body: ServerFinalBody,
}

impl ServerFinal {
    fn parse(mechanism_name: &str, payload: Vec<u8>) -> Result<Self> {
        let message = str::from_utf8(&payload)
            .map_err(|_| Error::invalid_authentication_response(mechanism_name))?;

        let first = message
            .chars()
            .next()
            .ok_or_else(|| Error::invalid_authentication_response(mechanism_name))?;

        let body = if first == ERROR_KEY {
            let error = parse_kvp(message, ERROR_KEY)?;
            ServerFinalBody::Error(error)
        } else if first == VERIFIER_KEY {
            let verifier = parse_kvp(message, VERIFIER_KEY)?;
            ServerFinalBody::Verifier(verifier)
        } else {
            return Err(Error::invalid_authentication_response(mechanism_name));
        };

        Ok(ServerFinal { body })
    }

    fn validate(
        &self,
        salted_password: &[u8],
        client_final: &ClientFinal,
        scram: &ScramVersion,
    ) -> Result<()> {
        match self.body {
            ServerFinalBody::Verifier(ref body) => {
                let server_key = scram.hmac(salted_password, b"Server Key")?;
                let body_decoded = base64::decode(body.as_bytes())
                    .map_err(|_| Error::invalid_authentication_response(&scram.to_string()))?;

                scram.hmac_verify(
                    server_key.as_slice(),
                    client_final.auth_message().as_bytes(),
                    body_decoded.as_slice(),
                )
            }
            ServerFinalBody::Error(ref err) => {
                Err(Error::authentication_error(&scram.to_string(), err))
            }
        }
    }
}

#[cfg(test)]
mod test {
    use bson::{doc, spec::BinarySubtype, Binary};

    use super::*;

    fn server_first_response(payload: &str) -> Document {
        doc! {
            "ok": 1,
            "conversationId": 1,
            "done": false,
            "payload": Binary { subtype: BinarySubtype::Generic, bytes: payload.as_bytes().to_vec() },
        }
    }

    #[test]
    fn saslprep_maps_roman_numeral_four() {
        // ROMAN NUMERAL FOUR normalizes to the ASCII letters "IV".
        let normalized = ScramVersion::Sha256
            .normalized_password("user", "\u{2163}")
            .unwrap();
        assert_eq!(normalized, "IV");
    }

    #[test]
    fn saslprep_strips_soft_hyphen() {
        // The user "IX" with password "I<soft-hyphen>X" must authenticate as "IX".
        let normalized = ScramVersion::Sha256
            .normalized_password("IX", "I\u{00AD}X")
            .unwrap();
        assert_eq!(normalized, "IX");
    }

    #[test]
    fn sha1_password_is_md5_digested() {
        let normalized = ScramVersion::Sha1
            .normalized_password("user", "pencil")
            .unwrap();
        // The MD5 digest is always 32 hex characters and deterministic.
        assert_eq!(normalized.len(), 32);
        assert_eq!(
            normalized,
            ScramVersion::Sha1
                .normalized_password("user", "pencil")
                .unwrap()
        );
        assert_ne!(
            normalized,
            ScramVersion::Sha1
                .normalized_password("other", "pencil")
                .unwrap()
        );
    }

    #[test]
    fn server_first_nonce_must_extend_client_nonce() {
        let server_first = ServerFirst::parse(
            "SCRAM-SHA-256",
            server_first_response("r=abcdef,s=QSXCR+Q6sek8bf92,i=4096"),
        )
        .unwrap();

        assert!(server_first.validate("abc").is_ok());
        assert!(server_first.validate("xyz").is_err());
    }

    #[test]
    fn low_iteration_counts_are_rejected() {
        let server_first = ServerFirst::parse(
            "SCRAM-SHA-256",
            server_first_response("r=abcdef,s=QSXCR+Q6sek8bf92,i=1000"),
        )
        .unwrap();

        assert!(server_first.validate("abc").is_err());
    }

    #[test]
    fn kvp_parsing() {
        assert_eq!(parse_kvp("r=nonce", 'r').unwrap(), "nonce");
        assert!(parse_kvp("s=salt", 'r').is_err());
        assert!(parse_kvp("r", 'r').is_err());
    }

    #[test]
    fn xor_is_involutive() {
        let lhs = vec![0xde, 0xad, 0xbe, 0xef];
        let rhs = vec![0x01, 0x02, 0x03, 0x04];
        assert_eq!(xor(&xor(&lhs, &rhs), &rhs), lhs);
    }
}
