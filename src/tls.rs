//! TLS material: the server side acceptor and the client side connector.

use anyhow::{anyhow, Context, Result};
use rustls_pemfile::{certs, ec_private_keys, pkcs8_private_keys, rsa_private_keys};
use std::fs;
use std::path::Path;
use std::sync::Arc;
use tokio_rustls::rustls::client::danger::{
    HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier,
};
use tokio_rustls::rustls::pki_types::{
    CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer, PrivateSec1KeyDer,
    ServerName, UnixTime,
};
use tokio_rustls::rustls::{
    ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme,
};
use tokio_rustls::{TlsAcceptor, TlsConnector};

pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem = fs::read(path)
        .with_context(|| format!("Failed to read certificate file {}", path.display()))?;
    let certs = certs(&mut &pem[..])
        .map_err(|e| anyhow!("Failed to parse certificate: {}", e))?
        .into_iter()
        .map(CertificateDer::from)
        .collect::<Vec<_>>();
    if certs.is_empty() {
        anyhow::bail!("No certificates found in {}", path.display());
    }
    Ok(certs)
}

pub fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem = fs::read(path)
        .with_context(|| format!("Failed to read private key file {}", path.display()))?;

    let parse_err = |e: std::io::Error| anyhow!("Failed to parse private key: {}", e);
    if let Some(key) = pkcs8_private_keys(&mut &pem[..]).map_err(parse_err)?.into_iter().next() {
        return Ok(PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key)));
    }
    if let Some(key) = rsa_private_keys(&mut &pem[..]).map_err(parse_err)?.into_iter().next() {
        return Ok(PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(key)));
    }
    if let Some(key) = ec_private_keys(&mut &pem[..]).map_err(parse_err)?.into_iter().next() {
        return Ok(PrivateKeyDer::Sec1(PrivateSec1KeyDer::from(key)));
    }
    Err(anyhow!("No private key found in {}", path.display()))
}

pub fn acceptor_from_der(
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<TlsAcceptor> {
    let config = ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(certs, key)
        .map_err(|e| anyhow!("TLS config error: {}", e))?;
    Ok(TlsAcceptor::from(Arc::new(config)))
}

/// Server acceptor from PEM certificate chain and key files.
pub fn load_acceptor(cert: &Path, key: &Path) -> Result<TlsAcceptor> {
    acceptor_from_der(load_certs(cert)?, load_key(key)?)
}

/// How a client checks the tunnel's certificate.
#[derive(Debug, Clone)]
pub enum ServerTrust {
    /// Trust exactly these roots.
    Roots(Vec<CertificateDer<'static>>),
    /// Accept any certificate (lab and self-signed deployments).
    Insecure,
}

pub fn connector(trust: ServerTrust) -> Result<TlsConnector> {
    let config = match trust {
        ServerTrust::Roots(roots) => {
            let mut store = RootCertStore::empty();
            for cert in roots {
                store
                    .add(cert)
                    .map_err(|e| anyhow!("Invalid CA certificate: {}", e))?;
            }
            ClientConfig::builder()
                .with_root_certificates(store)
                .with_no_client_auth()
        }
        ServerTrust::Insecure => ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipVerification))
            .with_no_client_auth(),
    };
    Ok(TlsConnector::from(Arc::new(config)))
}

pub fn server_name(sni: &str) -> Result<ServerName<'static>> {
    ServerName::try_from(sni)
        .map(|name| name.to_owned())
        .map_err(|e| anyhow!("Invalid SNI name {sni:?}: {e}"))
}

#[derive(Debug)]
struct SkipVerification;

impl ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, tokio_rustls::rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, tokio_rustls::rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn write_temp(name: &str, contents: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(format!("ticket-tunnel-{}-{name}", std::process::id()));
        fs::write(&path, contents).unwrap();
        path
    }

    #[test]
    fn loads_pem_pair() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        let cert = write_temp("cert.pem", &generated.cert.pem());
        let key = write_temp("key.pem", &generated.key_pair.serialize_pem());

        assert_eq!(load_certs(&cert).unwrap().len(), 1);
        assert!(matches!(load_key(&key).unwrap(), PrivateKeyDer::Pkcs8(_)));
        assert!(load_acceptor(&cert, &key).is_ok());

        let _ = fs::remove_file(cert);
        let _ = fs::remove_file(key);
    }

    #[test]
    fn missing_material_is_reported() {
        let empty = write_temp("empty.pem", "");
        assert!(load_certs(&empty).is_err());
        assert!(load_key(&empty).is_err());
        assert!(load_certs(Path::new("/nonexistent/cert.pem")).is_err());
        let _ = fs::remove_file(empty);
    }

    #[test]
    fn builds_connectors() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".into()]).unwrap();
        assert!(connector(ServerTrust::Roots(vec![generated.cert.der().clone()])).is_ok());
        assert!(connector(ServerTrust::Insecure).is_ok());
        assert!(server_name("localhost").is_ok());
        assert!(server_name("127.0.0.1").is_ok());
    }
}
