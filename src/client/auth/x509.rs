use bson::{doc, Document};

use crate::{
    cmap::{Command, Connection},
    error::{Error, Result},
    options::Credential,
};

/// Constructs the first message of the X.509 exchange for speculative authentication. Servers
/// at wire version 5+ derive the user from the TLS peer certificate, so no `user` field is
/// sent; against older servers the credential carries the certificate subject DN explicitly.
pub(crate) fn build_speculative_client_first(credential: &Credential) -> Command {
    build_client_first(credential)
}

/// Constructs the `authenticate` command for the X.509 mechanism.
pub(crate) fn build_client_first(credential: &Credential) -> Command {
    let mut auth_command_doc = doc! {
        "authenticate": 1,
        "mechanism": "MONGODB-X509",
    };

    if let Some(ref username) = credential.username {
        auth_command_doc.insert("user", username);
    }

    Command::new("authenticate", "$external", auth_command_doc)
}

/// Performs X.509 authentication for a given stream. When the handshake carried a speculative
/// exchange, the server's response to it completes authentication without another round trip.
pub(super) async fn authenticate_stream(
    conn: &mut Connection,
    credential: &Credential,
    server_first: impl Into<Option<Document>>,
) -> Result<()> {
    let server_response = match server_first.into() {
        Some(server_first) => server_first,
        None => {
            let command = build_client_first(credential);
            conn.send_command(command, None).await?.into_raw()
        }
    };

    if server_response
        .get("ok")
        .and_then(crate::bson_util::get_int)
        != Some(1)
    {
        return Err(Error::authentication_error(
            "MONGODB-X509",
            "Authentication failed",
        ));
    }

    Ok(())
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn user_field_only_sent_when_username_present() {
        let with_user = Credential::builder()
            .username("CN=client,OU=drivers".to_string())
            .build();
        let command = build_client_first(&with_user);
        assert_eq!(
            command.body.get_str("user").unwrap(),
            "CN=client,OU=drivers"
        );

        let without_user = Credential::default();
        let command = build_client_first(&without_user);
        assert!(!command.body.contains_key("user"));
        assert_eq!(command.target_db, "$external");
    }
}
