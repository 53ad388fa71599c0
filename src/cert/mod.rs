//! Self-signed certificate authority for the webhook's serving certificate.
//!
//! The API server only talks to admission webhooks over TLS. Rather than
//! depending on an external issuer, the injector generates its own CA at
//! startup, signs a serving certificate for its service hostnames with it,
//! and publishes the CA certificate as the `caBundle` of its webhook
//! configuration.
//!
//! One serial counter, seeded randomly, is shared by every certificate an
//! authority issues (its own CA certificate included), so serial numbers
//! never repeat within one authority.

use std::fmt;
use std::net::IpAddr;

use axum_server::tls_rustls::RustlsConfig;
use jiff::tz::TimeZone;
use jiff::{SignedDuration, Timestamp, ToSpan, Unit};
use parking_lot::Mutex;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair, KeyUsagePurpose, SanType, SerialNumber,
    string::Ia5String,
};
use thiserror::Error;
use time::OffsetDateTime;
use tracing::info;

/// Certificate errors, tagged with the stage that failed
#[derive(Debug, Error)]
pub enum CertError {
    #[error("failed to regenerate CA: {0}")]
    RegenerateCaFailed(String),

    #[error("failed to generate certificate: {0}")]
    GenerateCertFailed(String),

    #[error("failed to generate private key: {0}")]
    GeneratePrivateKeyFailed(String),

    #[error("no hosts specified for the serving certificate")]
    UnspecifiedHosts,
}

/// CA certificate plus a serving key pair signed by it, all PEM encoded.
#[derive(Clone)]
pub struct TlsBundle {
    ca_pem: String,
    cert_pem: String,
    key_pem: String,
}

impl TlsBundle {
    pub fn ca_pem(&self) -> &str {
        &self.ca_pem
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn key_pem(&self) -> &str {
        &self.key_pem
    }

    /// Server configuration for `axum-server`.
    pub async fn rustls_config(&self) -> std::io::Result<RustlsConfig> {
        RustlsConfig::from_pem(
            self.cert_pem.clone().into_bytes(),
            self.key_pem.clone().into_bytes(),
        )
        .await
    }
}

impl fmt::Debug for TlsBundle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TlsBundle")
            .field("ca_pem", &self.ca_pem)
            .field("cert_pem", &self.cert_pem)
            .field("key_pem", &"<redacted>")
            .finish()
    }
}

struct CaMaterial {
    cert_pem: String,
    key_pem: String,
}

struct SignerState {
    serial: u128,
    ca: Option<CaMaterial>,
}

impl SignerState {
    fn next_serial(&mut self) -> SerialNumber {
        self.serial = self.serial.wrapping_add(1);
        SerialNumber::from_slice(&self.serial.to_be_bytes())
    }
}

pub struct CertificateAuthority {
    organization: String,
    hosts: Vec<String>,
    state: Mutex<SignerState>,
}

impl CertificateAuthority {
    /// Create an authority that issues serving certificates for `hosts`.
    /// The first host becomes the certificate's common name.
    pub fn new(organization: impl Into<String>, hosts: Vec<String>) -> Result<Self, CertError> {
        if hosts.is_empty() {
            return Err(CertError::UnspecifiedHosts);
        }
        Ok(Self {
            organization: organization.into(),
            hosts,
            state: Mutex::new(SignerState {
                // Top bit cleared keeps the DER integer positive.
                serial: rand::random::<u128>() >> 1,
                ca: None,
            }),
        })
    }

    pub fn hosts(&self) -> &[String] {
        &self.hosts
    }

    /// Replace the CA with a freshly generated one and return its PEM.
    pub fn regenerate_ca(&self) -> Result<String, CertError> {
        let mut state = self.state.lock();
        self.regenerate_locked(&mut state)
    }

    /// Sign a serving certificate for the configured hosts, generating the CA
    /// first if this authority has none yet.
    pub fn issue_leaf(&self) -> Result<TlsBundle, CertError> {
        let mut state = self.state.lock();
        if state.ca.is_none() {
            self.regenerate_locked(&mut state)?;
        }
        let serial = state.next_serial();
        let ca = state
            .ca
            .as_ref()
            .ok_or_else(|| CertError::GenerateCertFailed("CA material missing".to_string()))?;

        let ca_key = KeyPair::from_pem(&ca.key_pem)
            .map_err(|e| CertError::GenerateCertFailed(format!("failed to load CA key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&ca.cert_pem, &ca_key)
            .map_err(|e| CertError::GenerateCertFailed(format!("failed to load CA: {e}")))?;

        let key = KeyPair::generate()
            .map_err(|e| CertError::GeneratePrivateKeyFailed(e.to_string()))?;

        let (not_before, not_after) = validity().map_err(CertError::GenerateCertFailed)?;
        let mut params = CertificateParams::default();
        params.distinguished_name = self.distinguished_name(self.hosts.first());
        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.subject_alt_names = self
            .hosts
            .iter()
            .map(|host| subject_alt_name(host))
            .collect::<Result<_, _>>()?;
        params.serial_number = Some(serial);
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .signed_by(&key, &issuer)
            .map_err(|e| CertError::GenerateCertFailed(e.to_string()))?;

        info!(hosts = ?self.hosts, "Issued serving certificate");
        Ok(TlsBundle {
            ca_pem: ca.cert_pem.clone(),
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        })
    }

    fn regenerate_locked(&self, state: &mut SignerState) -> Result<String, CertError> {
        let key = KeyPair::generate()
            .map_err(|e| CertError::RegenerateCaFailed(format!("failed to generate CA key: {e}")))?;

        let (not_before, not_after) = validity().map_err(CertError::RegenerateCaFailed)?;
        let mut params = CertificateParams::default();
        params.distinguished_name = self.distinguished_name(None);
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(state.next_serial());
        params.not_before = not_before;
        params.not_after = not_after;

        let cert = params
            .self_signed(&key)
            .map_err(|e| CertError::RegenerateCaFailed(format!("failed to create CA cert: {e}")))?;

        let cert_pem = cert.pem();
        state.ca = Some(CaMaterial {
            cert_pem: cert_pem.clone(),
            key_pem: key.serialize_pem(),
        });
        info!(organization = %self.organization, "Generated certificate authority");
        Ok(cert_pem)
    }

    fn distinguished_name(&self, common_name: Option<&String>) -> DistinguishedName {
        let mut dn = DistinguishedName::new();
        if let Some(common_name) = common_name {
            dn.push(DnType::CommonName, DnValue::Utf8String(common_name.clone()));
        }
        dn.push(
            DnType::OrganizationName,
            DnValue::Utf8String(self.organization.clone()),
        );
        dn
    }
}

/// From a day ago (rounded to the hour) until a year from now.
fn validity() -> Result<(OffsetDateTime, OffsetDateTime), String> {
    let now = Timestamp::now();
    let start = now
        .checked_sub(SignedDuration::from_hours(24))
        .and_then(|ts| ts.round(Unit::Hour))
        .map_err(|e| e.to_string())?;
    let end = now
        .to_zoned(TimeZone::UTC)
        .checked_add(1.year())
        .map_err(|e| e.to_string())?
        .timestamp();
    Ok((to_offset(start)?, to_offset(end)?))
}

fn to_offset(ts: Timestamp) -> Result<OffsetDateTime, String> {
    OffsetDateTime::from_unix_timestamp(ts.as_second()).map_err(|e| e.to_string())
}

/// IP literals become IP SANs, anything else a DNS SAN.
fn subject_alt_name(host: &str) -> Result<SanType, CertError> {
    if let Ok(ip) = host.parse::<IpAddr>() {
        return Ok(SanType::IpAddress(ip));
    }
    Ia5String::try_from(host.to_string())
        .map(SanType::DnsName)
        .map_err(|e| CertError::GenerateCertFailed(format!("invalid DNS name {host:?}: {e}")))
}
