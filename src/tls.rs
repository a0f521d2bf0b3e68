//! Self-signed CA and server certificate generation for TLS termination.
//!
//! The proxy sits in front of an upstream hostname the operator has pointed
//! at it via `/etc/hosts`. It terminates TLS itself with a locally-issued
//! certificate rather than the upstream's real one; the client must trust
//! our CA for this to work transparently.

use std::path::{Path, PathBuf};

use rcgen::{CertificateParams, DistinguishedName, DnType, KeyPair};

pub struct CaMaterials {
    pub ca_pem: PathBuf,
    pub server_pem: PathBuf,
    pub server_key: PathBuf,
}

impl CaMaterials {
    pub fn under(ca_dir: &Path) -> Self {
        Self {
            ca_pem: ca_dir.join("ca.pem"),
            server_pem: ca_dir.join("server.pem"),
            server_key: ca_dir.join("server.key"),
        }
    }

    pub fn exist(&self) -> bool {
        self.ca_pem.exists() && self.server_pem.exists() && self.server_key.exists()
    }
}

/// Generate (or reuse) the CA and server certificate/key under `ca_dir`,
/// issued for `server_hostname`.
pub fn ensure_tls_materials(ca_dir: &Path, server_hostname: &str) -> anyhow::Result<CaMaterials> {
    std::fs::create_dir_all(ca_dir)?;
    let materials = CaMaterials::under(ca_dir);

    if materials.exist() {
        tracing::info!(dir = %ca_dir.display(), "reusing existing TLS materials");
        return Ok(materials);
    }

    tracing::info!(dir = %ca_dir.display(), hostname = %server_hostname, "generating TLS materials");

    let mut ca_dn = DistinguishedName::new();
    ca_dn.push(DnType::CommonName, "Compaction Proxy Root CA");
    let mut ca_params = CertificateParams::default();
    ca_params.distinguished_name = ca_dn;
    ca_params.is_ca = rcgen::IsCa::Ca(rcgen::BasicConstraints::Unconstrained);
    let ca_key = KeyPair::generate()?;
    let ca_cert = ca_params.self_signed(&ca_key)?;

    let mut server_dn = DistinguishedName::new();
    server_dn.push(DnType::CommonName, server_hostname);
    let mut server_params = CertificateParams::new(vec![server_hostname.to_string()])?;
    server_params.distinguished_name = server_dn;
    let server_key = KeyPair::generate()?;
    let server_cert = server_params.signed_by(&server_key, &ca_cert, &ca_key)?;

    std::fs::write(&materials.ca_pem, ca_cert.pem())?;
    std::fs::write(&materials.server_pem, server_cert.pem())?;
    std::fs::write(&materials.server_key, server_key.serialize_pem())?;

    Ok(materials)
}

pub async fn load_rustls_config(materials: &CaMaterials) -> anyhow::Result<axum_server::tls_rustls::RustlsConfig> {
    let config = axum_server::tls_rustls::RustlsConfig::from_pem_file(&materials.server_pem, &materials.server_key).await?;
    Ok(config)
}

/// Print the `/etc/hosts` line(s) needed to route `upstream_hostname`
/// through this proxy, for the operator to paste in manually.
pub fn print_hosts_entry(bind_host: &str, upstream_hostname: &str) {
    println!("# Add the following to /etc/hosts to route {upstream_hostname} through this proxy:");
    println!("{bind_host} {upstream_hostname}");
}
