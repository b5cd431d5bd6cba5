use std::time::Duration;

use trust_dns_resolver::TokioAsyncResolver;

use crate::{
    error::{Error, ErrorKind, Result},
    options::ServerAddress,
};

const DEFAULT_SRV_TTL_SECS: u32 = 60;

/// The outcome of resolving a `mongodb+srv` seedlist: the seed hosts, the smallest record TTL
/// (bounding how often the list should be re-polled), and the options carried by the
/// accompanying TXT record.
#[derive(Debug, Clone)]
pub(crate) struct ResolvedConfig {
    pub(crate) hosts: Vec<ServerAddress>,
    pub(crate) min_ttl: Duration,
    pub(crate) replica_set: Option<String>,
    pub(crate) auth_source: Option<String>,
}

/// Resolves `mongodb+srv` seedlists via the `_mongodb._tcp.<host>` SRV record and the
/// associated TXT record.
pub(crate) struct SrvResolver {
    resolver: TokioAsyncResolver,
}

impl SrvResolver {
    pub(crate) async fn new() -> Result<Self> {
        let resolver =
            TokioAsyncResolver::tokio_from_system_conf().map_err(Error::from_resolve_error)?;

        Ok(Self { resolver })
    }

    pub(crate) async fn resolve_client_options(&self, hostname: &str) -> Result<ResolvedConfig> {
        let (hosts, min_ttl) = self.get_srv_hosts(hostname).await?;
        let (replica_set, auth_source) = self.get_txt_options(hostname).await?;

        Ok(ResolvedConfig {
            hosts,
            min_ttl,
            replica_set,
            auth_source,
        })
    }

    /// Looks up the SRV records for the original hostname, enforcing the trust boundary: every
    /// returned host must belong to the parent domain of the queried hostname.
    pub(crate) async fn get_srv_hosts(
        &self,
        original_hostname: &str,
    ) -> Result<(Vec<ServerAddress>, Duration)> {
        let hostname_parts: Vec<_> = original_hostname.split('.').collect();

        if hostname_parts.len() < 3 {
            return Err(ErrorKind::InvalidArgument {
                message: "a 'mongodb+srv' hostname must have at least three '.'-separated parts"
                    .to_string(),
            }
            .into());
        }

        let domain_name = &hostname_parts[1..];

        let lookup_hostname = format!("_mongodb._tcp.{}", original_hostname);

        let srv_lookup = self
            .resolver
            .srv_lookup(lookup_hostname.as_str())
            .await
            .map_err(Error::from_resolve_error)?;

        let mut hosts = Vec::new();
        for record in srv_lookup.iter() {
            let hostname = record.target().to_utf8();
            let port = Some(record.port());
            let mut address = ServerAddress {
                host: hostname,
                port,
            };

            let domain_matches = {
                let address_parts: Vec<_> = address
                    .host
                    .trim_end_matches('.')
                    .split('.')
                    .collect();
                address_parts.len() > domain_name.len()
                    && address_parts[address_parts.len() - domain_name.len()..] == domain_name[..]
            };

            if !domain_matches {
                return Err(ErrorKind::DnsResolve {
                    message: format!(
                        "SRV lookup for {} returned result {}, which does not match domain name \
                         {}",
                        original_hostname,
                        address,
                        domain_name.join(".")
                    ),
                }
                .into());
            }

            // The spec requires the drivers to remove the trailing '.' from the hostname.
            address.host = address.host.trim_end_matches('.').to_lowercase();

            hosts.push(address);
        }

        if hosts.is_empty() {
            return Err(ErrorKind::DnsResolve {
                message: format!("SRV lookup for {} returned no records", original_hostname),
            }
            .into());
        }

        let min_ttl = srv_lookup
            .as_lookup()
            .record_iter()
            .map(|record| record.ttl())
            .min()
            .unwrap_or(DEFAULT_SRV_TTL_SECS);

        Ok((hosts, Duration::from_secs(min_ttl.into())))
    }

    /// Looks up the TXT record for the original hostname. At most one TXT record may exist,
    /// and it may only contain the `authSource` and `replicaSet` options.
    async fn get_txt_options(
        &self,
        original_hostname: &str,
    ) -> Result<(Option<String>, Option<String>)> {
        let txt_records_response = match self.resolver.txt_lookup(original_hostname).await {
            Ok(response) => response,
            Err(_) => return Ok((None, None)),
        };

        let mut txt_records = txt_records_response.iter();

        let txt_record = match txt_records.next() {
            Some(record) => record,
            None => return Ok((None, None)),
        };

        if txt_records.next().is_some() {
            return Err(ErrorKind::DnsResolve {
                message: format!(
                    "TXT lookup for {} returned more than one record, but more than one are not \
                     allowed with 'mongodb+srv'",
                    original_hostname,
                ),
            }
            .into());
        }

        let txt_data: Vec<_> = txt_record
            .txt_data()
            .iter()
            .map(|bytes| String::from_utf8_lossy(bytes).into_owned())
            .collect();

        let mut replica_set = None;
        let mut auth_source = None;

        for option_pair in txt_data.join("").split('&') {
            let (key, value) = match option_pair.find('=') {
                Some(index) => option_pair.split_at(index),
                None => {
                    return Err(ErrorKind::DnsResolve {
                        message: format!(
                            "TXT record for {} is not a `key=value` option list",
                            original_hostname
                        ),
                    }
                    .into())
                }
            };
            let value = &value[1..];

            match key.to_lowercase().as_str() {
                "replicaset" => replica_set = Some(value.to_string()),
                "authsource" => auth_source = Some(value.to_string()),
                other => {
                    return Err(ErrorKind::DnsResolve {
                        message: format!(
                            "TXT record for {} contains the option {}, but only authSource and \
                             replicaSet are allowed with 'mongodb+srv'",
                            original_hostname, other
                        ),
                    }
                    .into())
                }
            }
        }

        Ok((replica_set, auth_source))
    }
}
