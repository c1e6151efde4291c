/// Extraction of caller identity from verified client certificates
use crate::core::{Identity, IdentityContext, RouteToDatabase, UserKind};
use crate::error::{GatewayError, GatewayResult};
use crate::net::TlsMaterial;
use rustls::pki_types::CertificateDer;
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use x509_cert::der::oid::ObjectIdentifier;
use x509_cert::der::{Decode, Encode};
use x509_cert::name::Name;
use x509_cert::Certificate;

/// Subject attribute types carrying identity fields
pub mod oids {
    use x509_cert::der::oid::ObjectIdentifier;

    pub const COMMON_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.3");
    pub const ORGANIZATION: ObjectIdentifier = ObjectIdentifier::new_unwrap("2.5.4.10");

    pub const ROUTE_TO_CLUSTER: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.9999.1.1");
    pub const ISSUING_CLUSTER: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.9999.1.2");
    pub const USAGE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.9999.1.3");
    pub const DATABASE_SERVICE: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.9999.2.1");
    pub const DATABASE_PROTOCOL: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.9999.2.2");
    pub const DATABASE_USER: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.9999.2.3");
    pub const DATABASE_NAME: ObjectIdentifier = ObjectIdentifier::new_unwrap("1.3.9999.2.4");

    /// Same OIDs as integer arcs, for certificate generators
    pub const ROUTE_TO_CLUSTER_ARCS: &[u64] = &[1, 3, 9999, 1, 1];
    pub const ISSUING_CLUSTER_ARCS: &[u64] = &[1, 3, 9999, 1, 2];
    pub const USAGE_ARCS: &[u64] = &[1, 3, 9999, 1, 3];
    pub const DATABASE_SERVICE_ARCS: &[u64] = &[1, 3, 9999, 2, 1];
    pub const DATABASE_PROTOCOL_ARCS: &[u64] = &[1, 3, 9999, 2, 2];
    pub const DATABASE_USER_ARCS: &[u64] = &[1, 3, 9999, 2, 3];
    pub const DATABASE_NAME_ARCS: &[u64] = &[1, 3, 9999, 2, 4];
}

/// Usage value granting database access
pub const USAGE_DATABASE: &str = "usage:db";

/// Produces a typed identity for an accepted TLS connection
pub trait IdentityMiddleware: Send + Sync {
    /// `chain` is the verified peer chain, leaf first
    fn identity_from_chain(&self, chain: &[CertificateDer<'_>]) -> GatewayResult<IdentityContext>;
}

/// Subject names of the certificate authorities each cluster signs
/// client certificates with
#[derive(Debug, Clone, Default)]
pub struct ClusterAuthorities {
    by_subject: HashMap<Vec<u8>, String>,
}

impl ClusterAuthorities {
    pub fn new() -> Self {
        Self::default()
    }

    /// Authorities of the local cluster and of every trusted cluster in `tls`
    pub fn from_material(local_cluster: &str, tls: &TlsMaterial) -> GatewayResult<Self> {
        let mut authorities = Self::new();
        authorities.add(local_cluster, &tls.client_cas)?;
        for (cluster, cas) in &tls.trusted_cas {
            if cluster == local_cluster {
                return Err(GatewayError::bad_parameter(format!(
                    "trusted cluster {:?} is the local cluster",
                    cluster
                )));
            }
            authorities.add(cluster, cas)?;
        }
        Ok(authorities)
    }

    /// Register `cas` as issued by `cluster`
    pub fn add(&mut self, cluster: &str, cas: &[CertificateDer<'_>]) -> GatewayResult<()> {
        for ca in cas {
            let subject = encode_name(&decode(ca.as_ref())?.tbs_certificate.subject)?;
            if let Some(owner) = self.by_subject.get(&subject) {
                if owner != cluster {
                    return Err(GatewayError::bad_parameter(format!(
                        "CA subject is shared by clusters {:?} and {:?}",
                        owner, cluster
                    )));
                }
                continue;
            }
            self.by_subject.insert(subject, cluster.to_string());
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.by_subject.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_subject.is_empty()
    }

    /// Cluster whose CA issued the presented chain, leaf first
    fn issuing_cluster(
        &self,
        leaf: &Certificate,
        intermediates: &[CertificateDer<'_>],
    ) -> GatewayResult<String> {
        if let Some(cluster) = self.issuer_of(leaf)? {
            return Ok(cluster);
        }
        for der in intermediates {
            if let Some(cluster) = self.issuer_of(&decode(der.as_ref())?)? {
                return Ok(cluster);
            }
        }
        Err(GatewayError::access_denied(
            "client certificate is not issued by a known cluster CA",
        ))
    }

    fn issuer_of(&self, cert: &Certificate) -> GatewayResult<Option<String>> {
        let issuer = encode_name(&cert.tbs_certificate.issuer)?;
        Ok(self.by_subject.get(&issuer).cloned())
    }
}

/// Reads identity fields from the leaf certificate subject and derives the
/// caller's cluster from the CA that issued it
#[derive(Debug, Clone)]
pub struct CertIdentityMiddleware {
    cluster_name: String,
    authorities: ClusterAuthorities,
    accepted_usage: Vec<String>,
}

impl CertIdentityMiddleware {
    pub fn new<S: Into<String>>(cluster_name: S, authorities: ClusterAuthorities) -> Self {
        Self {
            cluster_name: cluster_name.into(),
            authorities,
            accepted_usage: vec![USAGE_DATABASE.to_string()],
        }
    }

    pub fn with_accepted_usage(mut self, usage: Vec<String>) -> Self {
        self.accepted_usage = usage;
        self
    }

    /// Parse a DER certificate into an identity
    pub fn parse_identity(der: &[u8]) -> GatewayResult<Identity> {
        identity_of(&decode(der)?, der)
    }

    fn classify(&self, identity: &Identity, cluster: String) -> UserKind {
        if let Some(role) = identity.system_role() {
            return UserKind::Builtin {
                role: role.to_string(),
            };
        }
        if cluster == self.cluster_name {
            UserKind::Local
        } else {
            UserKind::Remote { cluster }
        }
    }
}

impl IdentityMiddleware for CertIdentityMiddleware {
    fn identity_from_chain(&self, chain: &[CertificateDer<'_>]) -> GatewayResult<IdentityContext> {
        let (leaf, intermediates) = chain
            .split_first()
            .ok_or_else(|| GatewayError::access_denied("client certificate required"))?;
        let cert = decode(leaf.as_ref())?;
        let identity = identity_of(&cert, leaf.as_ref())?;

        if !identity.usage.is_empty()
            && !identity
                .usage
                .iter()
                .any(|usage| self.accepted_usage.contains(usage))
        {
            return Err(GatewayError::access_denied(format!(
                "certificate usage {:?} does not permit database access",
                identity.usage
            )));
        }

        let cluster = self.authorities.issuing_cluster(&cert, intermediates)?;
        if !identity.issuing_cluster.is_empty() && identity.issuing_cluster != cluster {
            return Err(GatewayError::access_denied(format!(
                "certificate claims cluster {:?} but was issued by {:?}",
                identity.issuing_cluster, cluster
            )));
        }

        let kind = self.classify(&identity, cluster);
        Ok(IdentityContext { kind, identity })
    }
}

fn decode(der: &[u8]) -> GatewayResult<Certificate> {
    Certificate::from_der(der).map_err(|e| {
        GatewayError::bad_parameter(format!("failed to parse client certificate: {}", e))
    })
}

fn encode_name(name: &Name) -> GatewayResult<Vec<u8>> {
    name.to_der()
        .map_err(|e| GatewayError::bad_parameter(format!("failed to encode certificate name: {}", e)))
}

fn identity_of(cert: &Certificate, der: &[u8]) -> GatewayResult<Identity> {
    let tbs = &cert.tbs_certificate;

    let mut identity = Identity::new(
        String::new(),
        Vec::new(),
        tbs.validity.not_after.to_system_time(),
    );
    let mut route = RouteToDatabase::default();

    for rdn in tbs.subject.0.iter() {
        for atv in rdn.0.iter() {
            let value = attribute_value(&atv.oid, atv.value.value())?;
            let oid = atv.oid;
            if oid == oids::COMMON_NAME {
                identity.username = value;
            } else if oid == oids::ORGANIZATION {
                identity.roles.push(value);
            } else if oid == oids::ROUTE_TO_CLUSTER {
                identity.route_to_cluster = value;
            } else if oid == oids::ISSUING_CLUSTER {
                identity.issuing_cluster = value;
            } else if oid == oids::USAGE {
                identity.usage.push(value);
            } else if oid == oids::DATABASE_SERVICE {
                route.service_name = value;
            } else if oid == oids::DATABASE_PROTOCOL {
                route.protocol = value;
            } else if oid == oids::DATABASE_USER {
                route.username = value;
            } else if oid == oids::DATABASE_NAME {
                route.database = value;
            }
        }
    }

    if identity.username.is_empty() {
        return Err(GatewayError::bad_parameter(
            "client certificate has no common name",
        ));
    }

    identity.route_to_database = route;
    identity.fingerprint = hex::encode(Sha256::digest(der));
    Ok(identity)
}

fn attribute_value(oid: &ObjectIdentifier, raw: &[u8]) -> GatewayResult<String> {
    String::from_utf8(raw.to_vec()).map_err(|_| {
        GatewayError::bad_parameter(format!("certificate attribute {} is not valid UTF-8", oid))
    })
}
