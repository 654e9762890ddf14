use openssl::{
    nid::Nid,
    pkey::{Id, PKey},
    stack::Stack,
    x509::{
        store::X509StoreBuilder, verify::X509VerifyFlags, X509Ref, X509StoreContext, X509,
    },
};
use std::sync::Arc;
use thiserror::Error;

pub type SharedInspector = Arc<dyn CertificateInspector + Send + Sync>;

/// Inspects PEM-encoded certificate material.
pub trait CertificateInspector {
    /// Parses every certificate in a PEM bundle.
    fn parse_certificates(&self, pem: &str) -> Result<Vec<CertificateInfo>, TlsError>;

    /// Checks that the private key belongs to the first certificate of the
    /// bundle.
    fn verify_key_pair(&self, certificate: &str, key: &str) -> Result<(), TlsError>;

    /// Checks that the first certificate of the bundle chains to one of the
    /// CA certificates. Expiry is not checked.
    fn verify_chain(&self, certificate: &str, ca_certificate: &str) -> Result<(), TlsError>;
}

/// The properties of a certificate that routes are validated against.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CertificateInfo {
    pub subject: String,
    pub sha1_signature: bool,

    /// The size of the certificate's key, if it is an RSA key.
    pub rsa_bits: Option<u32>,
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TlsError {
    #[error("no PEM-encoded certificate found")]
    NoCertificate,

    #[error("failed to parse certificate: {0}")]
    InvalidCertificate(String),

    #[error("failed to parse private key: {0}")]
    InvalidKey(String),

    #[error("private key does not match the certificate")]
    KeyMismatch,

    #[error("certificate is not signed by the CA certificate: {0}")]
    Untrusted(String),
}

/// Inspects certificates with OpenSSL.
#[derive(Copy, Clone, Debug, Default)]
pub struct OpenSslInspector;

// === impl OpenSslInspector ===

impl OpenSslInspector {
    pub fn shared() -> SharedInspector {
        Arc::new(Self)
    }

    fn parse(pem: &str) -> Result<Vec<X509>, TlsError> {
        let certs = X509::stack_from_pem(pem.as_bytes())
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        if certs.is_empty() {
            return Err(TlsError::NoCertificate);
        }
        Ok(certs)
    }

    fn info(cert: &X509Ref) -> CertificateInfo {
        let subject = cert
            .subject_name()
            .entries_by_nid(Nid::COMMONNAME)
            .next()
            .and_then(|entry| entry.data().as_utf8().ok())
            .map(|cn| cn.to_string())
            .unwrap_or_default();

        let sha1_signature = matches!(
            cert.signature_algorithm().object().nid(),
            Nid::SHA1WITHRSAENCRYPTION | Nid::SHA1WITHRSA | Nid::ECDSA_WITH_SHA1 | Nid::DSAWITHSHA1
        );

        let rsa_bits = cert
            .public_key()
            .ok()
            .filter(|key| key.id() == Id::RSA)
            .map(|key| key.bits());

        CertificateInfo {
            subject,
            sha1_signature,
            rsa_bits,
        }
    }
}

impl CertificateInspector for OpenSslInspector {
    fn parse_certificates(&self, pem: &str) -> Result<Vec<CertificateInfo>, TlsError> {
        Ok(Self::parse(pem)?.iter().map(|c| Self::info(c)).collect())
    }

    fn verify_key_pair(&self, certificate: &str, key: &str) -> Result<(), TlsError> {
        let certs = Self::parse(certificate)?;
        let key = PKey::private_key_from_pem(key.as_bytes())
            .map_err(|e| TlsError::InvalidKey(e.to_string()))?;
        let public = certs[0]
            .public_key()
            .map_err(|e| TlsError::InvalidCertificate(e.to_string()))?;
        if !public.public_eq(&key) {
            return Err(TlsError::KeyMismatch);
        }
        Ok(())
    }

    fn verify_chain(&self, certificate: &str, ca_certificate: &str) -> Result<(), TlsError> {
        let mut certs = Self::parse(certificate)?.into_iter();
        let Some(leaf) = certs.next() else {
            return Err(TlsError::NoCertificate);
        };
        let untrusted = |e: openssl::error::ErrorStack| TlsError::Untrusted(e.to_string());

        let mut intermediates = Stack::new().map_err(untrusted)?;
        for cert in certs {
            intermediates.push(cert).map_err(untrusted)?;
        }

        let mut store = X509StoreBuilder::new().map_err(untrusted)?;
        for ca in Self::parse(ca_certificate)? {
            store.add_cert(ca).map_err(untrusted)?;
        }
        // The CA certificate may itself be an intermediate.
        store
            .set_flags(X509VerifyFlags::NO_CHECK_TIME | X509VerifyFlags::PARTIAL_CHAIN)
            .map_err(untrusted)?;
        let store = store.build();

        let mut ctx = X509StoreContext::new().map_err(untrusted)?;
        let (verified, error) = ctx
            .init(&store, &leaf, &intermediates, |ctx| {
                let verified = ctx.verify_cert()?;
                Ok((verified, ctx.error().to_string()))
            })
            .map_err(untrusted)?;
        if !verified {
            return Err(TlsError::Untrusted(error));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_certs::{self, Digest};

    #[test]
    fn parses_certificate_properties() {
        let ca = test_certs::ca("root-ca", test_certs::rsa(2048));
        let leaf = ca.issue("www.example.com", test_certs::rsa(1024), Digest::Sha1);
        let ec = ca.issue("ec.example.com", test_certs::ec(), Digest::Sha256);

        let bundle = format!("{}{}", leaf.cert_pem(), ca.cert_pem());
        let infos = OpenSslInspector.parse_certificates(&bundle).expect("must parse");
        assert_eq!(
            infos,
            vec![
                CertificateInfo {
                    subject: "www.example.com".to_string(),
                    sha1_signature: true,
                    rsa_bits: Some(1024),
                },
                CertificateInfo {
                    subject: "root-ca".to_string(),
                    sha1_signature: false,
                    rsa_bits: Some(2048),
                },
            ]
        );

        let infos = OpenSslInspector
            .parse_certificates(&ec.cert_pem())
            .expect("must parse");
        assert_eq!(infos[0].rsa_bits, None);
    }

    #[test]
    fn rejects_garbage() {
        assert_eq!(
            OpenSslInspector.parse_certificates("not a certificate"),
            Err(TlsError::NoCertificate)
        );
        assert!(matches!(
            OpenSslInspector.verify_key_pair(
                &test_certs::ca("root-ca", test_certs::rsa(2048)).cert_pem(),
                "not a key"
            ),
            Err(TlsError::InvalidKey(_))
        ));
    }

    #[test]
    fn key_pairs() {
        let ca = test_certs::ca("root-ca", test_certs::rsa(2048));
        let leaf = ca.issue("www.example.com", test_certs::ec(), Digest::Sha256);
        let other = ca.issue("other.example.com", test_certs::ec(), Digest::Sha256);

        assert_eq!(
            OpenSslInspector.verify_key_pair(&leaf.cert_pem(), &leaf.key_pem()),
            Ok(())
        );
        assert_eq!(
            OpenSslInspector.verify_key_pair(&leaf.cert_pem(), &other.key_pem()),
            Err(TlsError::KeyMismatch)
        );
    }

    #[test]
    fn chains() {
        let ca = test_certs::ca("root-ca", test_certs::rsa(2048));
        let other_ca = test_certs::ca("other-ca", test_certs::rsa(2048));
        let leaf = ca.issue("www.example.com", test_certs::ec(), Digest::Sha256);
        let expired = ca.issue_expired("old.example.com", test_certs::ec());

        assert_eq!(
            OpenSslInspector.verify_chain(&leaf.cert_pem(), &ca.cert_pem()),
            Ok(())
        );
        assert_eq!(
            OpenSslInspector.verify_chain(&expired.cert_pem(), &ca.cert_pem()),
            Ok(())
        );
        assert!(matches!(
            OpenSslInspector.verify_chain(&leaf.cert_pem(), &other_ca.cert_pem()),
            Err(TlsError::Untrusted(_))
        ));
    }

    #[test]
    fn chains_through_intermediates() {
        let root = test_certs::ca("root-ca", test_certs::rsa(2048));
        let intermediate = root.issue_ca("intermediate-ca", test_certs::rsa(2048));
        let leaf = intermediate.issue("www.example.com", test_certs::ec(), Digest::Sha256);

        let bundle = format!("{}{}", leaf.cert_pem(), intermediate.cert_pem());
        assert_eq!(OpenSslInspector.verify_chain(&bundle, &root.cert_pem()), Ok(()));
        assert_eq!(
            OpenSslInspector.verify_chain(&leaf.cert_pem(), &intermediate.cert_pem()),
            Ok(())
        );
    }
}
