//! Certificate generation for development and tests.
//!
//! Produces a self-signed CA, a broker server certificate and agent client
//! certificates whose CN is the agent id the broker reads back.
//!
//! Requires the `certs` feature to be enabled.

use std::path::{Path, PathBuf};

use rcgen::{
    BasicConstraints, CertificateParams, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose,
};

use crate::error::PkiError;

/// CA material for signing server and client certificates.
pub struct CaBundle {
    params: CertificateParams,
    key_pair: KeyPair,
    /// PEM-encoded CA certificate.
    pub ca_cert_pem: String,
    /// DER-encoded CA certificate.
    pub ca_cert_der: Vec<u8>,
}

/// A leaf certificate and its private key.
pub struct LeafBundle {
    pub cert_pem: String,
    pub key_pem: String,
    pub cert_der: Vec<u8>,
}

fn gen_err(e: impl std::fmt::Display) -> PkiError {
    PkiError::Generation(e.to_string())
}

/// Generate a self-signed CA.
pub fn generate_ca(org_name: &str) -> Result<CaBundle, PkiError> {
    let mut params = CertificateParams::default();
    params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    params
        .distinguished_name
        .push(DnType::CommonName, format!("{org_name} CA"));
    params
        .distinguished_name
        .push(DnType::OrganizationName, org_name);
    params.key_usages.push(KeyUsagePurpose::KeyCertSign);
    params.key_usages.push(KeyUsagePurpose::CrlSign);
    params.key_usages.push(KeyUsagePurpose::DigitalSignature);

    let key_pair = KeyPair::generate().map_err(gen_err)?;
    let ca_cert = params.self_signed(&key_pair).map_err(gen_err)?;

    Ok(CaBundle {
        ca_cert_pem: ca_cert.pem(),
        ca_cert_der: ca_cert.der().to_vec(),
        params,
        key_pair,
    })
}

/// Generate an agent client certificate signed by `ca`.
///
/// The certificate carries `ClientAuth` and the agent id as its CN.
pub fn generate_client_cert(ca: &CaBundle, agent_id: &str) -> Result<LeafBundle, PkiError> {
    let mut params = CertificateParams::default();
    params.distinguished_name.push(DnType::CommonName, agent_id);
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ClientAuth);
    sign_leaf(ca, params)
}

/// Generate a broker server certificate signed by `ca`.
///
/// Each entry of `names` becomes a SAN; IP literals become IP SANs.
pub fn generate_server_cert(ca: &CaBundle, names: &[&str]) -> Result<LeafBundle, PkiError> {
    let sans: Vec<String> = names.iter().map(|n| (*n).to_string()).collect();
    let mut params = CertificateParams::new(sans).map_err(gen_err)?;
    if let Some(first) = names.first() {
        params.distinguished_name.push(DnType::CommonName, *first);
    }
    params
        .extended_key_usages
        .push(ExtendedKeyUsagePurpose::ServerAuth);
    sign_leaf(ca, params)
}

fn sign_leaf(ca: &CaBundle, params: CertificateParams) -> Result<LeafBundle, PkiError> {
    let issuer = Issuer::from_params(&ca.params, &ca.key_pair);
    let key = KeyPair::generate().map_err(gen_err)?;
    let cert = params.signed_by(&key, &issuer).map_err(gen_err)?;
    Ok(LeafBundle {
        cert_pem: cert.pem(),
        key_pem: key.serialize_pem(),
        cert_der: cert.der().to_vec(),
    })
}

/// Paths of a development PKI written by [`ensure_dev_bundle`].
#[derive(Debug, Clone)]
pub struct DevTlsPaths {
    pub ca_cert: PathBuf,
    pub server_cert: PathBuf,
    pub server_key: PathBuf,
    pub agent_cert: PathBuf,
    pub agent_key: PathBuf,
}

impl DevTlsPaths {
    pub fn in_dir(dir: &Path) -> Self {
        Self {
            ca_cert: dir.join("ca.pem"),
            server_cert: dir.join("server.pem"),
            server_key: dir.join("server-key.pem"),
            agent_cert: dir.join("agent.pem"),
            agent_key: dir.join("agent-key.pem"),
        }
    }

    fn all_exist(&self) -> bool {
        [
            &self.ca_cert,
            &self.server_cert,
            &self.server_key,
            &self.agent_cert,
            &self.agent_key,
        ]
        .iter()
        .all(|p| p.exists())
    }
}

/// Write a CA, a server certificate for `server_names` and a client
/// certificate for `agent_id` into `dir`.
///
/// Existing material in `dir` is reused, so a restarted broker keeps
/// accepting the agent certificate it issued earlier.
pub fn ensure_dev_bundle(
    dir: &Path,
    agent_id: &str,
    server_names: &[&str],
) -> Result<DevTlsPaths, PkiError> {
    let paths = DevTlsPaths::in_dir(dir);
    if paths.all_exist() {
        tracing::debug!(dir = %dir.display(), "Reusing development certificates");
        return Ok(paths);
    }

    std::fs::create_dir_all(dir)?;
    let ca = generate_ca("Burrow Dev")?;
    let server = generate_server_cert(&ca, server_names)?;
    let agent = generate_client_cert(&ca, agent_id)?;

    std::fs::write(&paths.ca_cert, &ca.ca_cert_pem)?;
    std::fs::write(&paths.server_cert, &server.cert_pem)?;
    write_private(&paths.server_key, &server.key_pem)?;
    std::fs::write(&paths.agent_cert, &agent.cert_pem)?;
    write_private(&paths.agent_key, &agent.key_pem)?;

    tracing::info!(dir = %dir.display(), agent_id, "Generated development certificates");
    Ok(paths)
}

fn write_private(path: &Path, pem: &str) -> Result<(), PkiError> {
    std::fs::write(path, pem)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))?;
    }
    Ok(())
}
