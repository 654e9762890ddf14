//! Certificates generated for tests.

use openssl::{
    asn1::Asn1Time,
    bn::BigNum,
    ec::{EcGroup, EcKey},
    hash::MessageDigest,
    nid::Nid,
    pkey::{PKey, Private},
    rsa::Rsa,
    x509::{
        extension::{BasicConstraints, KeyUsage},
        X509Builder, X509NameBuilder, X509,
    },
};
use std::sync::atomic::{AtomicU32, Ordering};

static SERIAL: AtomicU32 = AtomicU32::new(1);

#[derive(Copy, Clone, Debug)]
pub enum Digest {
    Sha1,
    Sha256,
}

pub struct Issued {
    pub cert: X509,
    pub key: PKey<Private>,
}

pub fn rsa(bits: u32) -> PKey<Private> {
    PKey::from_rsa(Rsa::generate(bits).expect("rsa key")).expect("rsa key")
}

pub fn ec() -> PKey<Private> {
    let group = EcGroup::from_curve_name(Nid::X9_62_PRIME256V1).expect("curve");
    PKey::from_ec_key(EcKey::generate(&group).expect("ec key")).expect("ec key")
}

/// Creates a self-signed CA.
pub fn ca(name: &str, key: PKey<Private>) -> Issued {
    let cert = build(name, &key, None, Digest::Sha256, true, false);
    Issued { cert, key }
}

// === impl Issued ===

impl Issued {
    pub fn issue(&self, name: &str, key: PKey<Private>, digest: Digest) -> Issued {
        let cert = build(name, &key, Some(self), digest, false, false);
        Issued { cert, key }
    }

    pub fn issue_ca(&self, name: &str, key: PKey<Private>) -> Issued {
        let cert = build(name, &key, Some(self), Digest::Sha256, true, false);
        Issued { cert, key }
    }

    pub fn issue_expired(&self, name: &str, key: PKey<Private>) -> Issued {
        let cert = build(name, &key, Some(self), Digest::Sha256, false, true);
        Issued { cert, key }
    }

    pub fn cert_pem(&self) -> String {
        String::from_utf8(self.cert.to_pem().expect("pem")).expect("utf8")
    }

    pub fn key_pem(&self) -> String {
        String::from_utf8(self.key.private_key_to_pem_pkcs8().expect("pem")).expect("utf8")
    }
}

fn build(
    name: &str,
    key: &PKey<Private>,
    issuer: Option<&Issued>,
    digest: Digest,
    is_ca: bool,
    expired: bool,
) -> X509 {
    let mut subject = X509NameBuilder::new().expect("name");
    subject
        .append_entry_by_nid(Nid::COMMONNAME, name)
        .expect("name");
    let subject = subject.build();

    let mut builder = X509Builder::new().expect("builder");
    builder.set_version(2).expect("version");
    let serial = BigNum::from_u32(SERIAL.fetch_add(1, Ordering::Relaxed))
        .and_then(|n| n.to_asn1_integer())
        .expect("serial");
    builder.set_serial_number(&serial).expect("serial");
    builder.set_subject_name(&subject).expect("subject");
    let issuer_name = issuer.map_or(&*subject, |issuer| issuer.cert.subject_name());
    builder.set_issuer_name(issuer_name).expect("issuer");
    builder.set_pubkey(key).expect("pubkey");

    let (not_before, not_after) = if expired {
        (Asn1Time::from_unix(0), Asn1Time::from_unix(86_400))
    } else {
        (Asn1Time::days_from_now(0), Asn1Time::days_from_now(365))
    };
    builder
        .set_not_before(&not_before.expect("time"))
        .expect("not before");
    builder
        .set_not_after(&not_after.expect("time"))
        .expect("not after");

    if is_ca {
        builder
            .append_extension(BasicConstraints::new().critical().ca().build().expect("ext"))
            .expect("ext");
        builder
            .append_extension(
                KeyUsage::new()
                    .critical()
                    .key_cert_sign()
                    .crl_sign()
                    .build()
                    .expect("ext"),
            )
            .expect("ext");
    }

    let digest = match digest {
        Digest::Sha1 => MessageDigest::sha1(),
        Digest::Sha256 => MessageDigest::sha256(),
    };
    let signing_key = issuer.map_or(key, |issuer| &issuer.key);
    builder.sign(signing_key, digest).expect("sign");
    builder.build()
}
