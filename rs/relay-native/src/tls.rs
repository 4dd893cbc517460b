use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use rustls::ServerConfig as RustlsServerConfig;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};

/// Loads a PEM certificate chain and private key from disk and builds a
/// `rustls::ServerConfig` for `axum-server`'s TLS acceptor.
pub fn load_server_config(cert: &Path, key: &Path) -> anyhow::Result<Arc<RustlsServerConfig>> {
	let cert_chain = load_certs(cert)?;
	let private_key = load_private_key(key)?;

	let config = RustlsServerConfig::builder()
		.with_no_client_auth()
		.with_single_cert(cert_chain, private_key)
		.context("invalid certificate/key pair")?;

	Ok(Arc::new(config))
}

fn load_certs(path: &Path) -> anyhow::Result<Vec<CertificateDer<'static>>> {
	let bytes = std::fs::read(path).with_context(|| format!("reading certificate {}", path.display()))?;
	rustls_pemfile::certs(&mut bytes.as_slice())
		.collect::<Result<Vec<_>, _>>()
		.with_context(|| format!("parsing certificate {}", path.display()))
}

fn load_private_key(path: &Path) -> anyhow::Result<PrivateKeyDer<'static>> {
	let bytes = std::fs::read(path).with_context(|| format!("reading private key {}", path.display()))?;
	rustls_pemfile::private_key(&mut bytes.as_slice())
		.with_context(|| format!("parsing private key {}", path.display()))?
		.ok_or_else(|| anyhow::anyhow!("no private key found in {}", path.display()))
}

/// Generates a self-signed certificate for local development, the same
/// fallback this workspace's native layer reaches for when no cert/key
/// path is configured.
pub fn self_signed(hostname: &str) -> anyhow::Result<(Vec<CertificateDer<'static>>, PrivateKeyDer<'static>)> {
	let cert = rcgen::generate_simple_self_signed(vec![hostname.to_string()])
		.context("generating self-signed certificate")?;
	let key = PrivateKeyDer::try_from(cert.signing_key.serialize_der())
		.map_err(|e| anyhow::anyhow!("invalid generated key: {e}"))?;
	Ok((vec![cert.cert.der().clone()], key))
}
