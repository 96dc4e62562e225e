//! Dynamic certificate authority.
//!
//! Loads the embedded root authority once and issues leaf certificates on
//! demand, one per TLS subject. Leaves are cached for the life of the
//! process. Each subject has its own cache entry and lock, so a subject is
//! generated at most once while distinct subjects generate in parallel.

use std::collections::HashMap;
use std::fmt;
use std::io::{self, Write};
use std::net::{IpAddr, Ipv4Addr, UdpSocket};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use rand::rngs::OsRng;
use rand::RngCore;
use rcgen::{
    CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, RsaKeySize, SanType, SerialNumber, PKCS_RSA_SHA256,
};
use rustls::crypto::aws_lc_rs::sign::any_supported_type;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs1KeyDer, PrivatePkcs8KeyDer};
use rustls::server::{ClientHello, ResolvesServerCert};
use rustls::sign::CertifiedKey;
use time::{Duration, OffsetDateTime};
use x509_parser::prelude::{FromDer, X509Certificate};
use x509_parser::x509::SubjectPublicKeyInfo;

pub use crate::error::CaError;

const ROOT_CERT_PEM: &str = include_str!("../certs/hflow-ca.crt");
const ROOT_PUBLIC_KEY_PEM: &str = include_str!("../certs/hflow-ca.pub");
const ROOT_PRIVATE_KEY_PEM: &str = include_str!("../certs/hflow-ca.key");

/// Leaf certificates are valid from issue for this many hours (~10 years).
const LEAF_VALIDITY_HOURS: i64 = 87_658;

/// Address used to discover the outbound interface. Nothing is sent to it.
const HOST_IP_PROBE: &str = "192.0.0.0:9999";

struct CacheEntry {
    leaf: Mutex<Option<Arc<CertifiedKey>>>,
}

/// Issues and caches leaf certificates signed by the root authority.
pub struct CertificateAuthority {
    root_pem: String,
    root_der: CertificateDer<'static>,
    issuer: Issuer<'static, KeyPair>,
    host_ip: IpAddr,
    cache: RwLock<HashMap<String, Arc<CacheEntry>>>,
    generated: AtomicU64,
}

impl fmt::Debug for CertificateAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CertificateAuthority")
            .field("host_ip", &self.host_ip)
            .field("cached", &self.cache.read().len())
            .field("generated", &self.generated_count())
            .finish_non_exhaustive()
    }
}

impl CertificateAuthority {
    /// Loads the root authority compiled into the binary.
    pub fn from_embedded() -> Result<Self, CaError> {
        Self::from_pem(ROOT_CERT_PEM, ROOT_PUBLIC_KEY_PEM, ROOT_PRIVATE_KEY_PEM)
    }

    /// Loads a root authority from PEM text.
    ///
    /// `cert_pem` must hold a `CERTIFICATE`, `public_key_pem` a `PUBLIC KEY` and
    /// `private_key_pem` a PKCS#1 `RSA PRIVATE KEY` block, all for the same key.
    pub fn from_pem(
        cert_pem: &str,
        public_key_pem: &str,
        private_key_pem: &str,
    ) -> Result<Self, CaError> {
        let private_key = read_pem(private_key_pem, "RSA PRIVATE KEY")?;
        let key_der = PrivateKeyDer::Pkcs1(PrivatePkcs1KeyDer::from(private_key));
        let key_pair = KeyPair::from_der_and_sign_algo(&key_der, &PKCS_RSA_SHA256).map_err(|e| {
            CaError::Material(format!("unable to parse private key as pkcs1 rsa key: {}", e))
        })?;

        let public_key = read_pem(public_key_pem, "PUBLIC KEY")?;
        let (_, spki) = SubjectPublicKeyInfo::from_der(&public_key)
            .map_err(|e| CaError::Material(format!("unable to parse public key: {}", e)))?;
        if spki.subject_public_key.data.as_ref() != key_pair.public_key_raw() {
            return Err(CaError::Material(
                "public key does not match private key".into(),
            ));
        }

        let root_der = read_pem(cert_pem, "CERTIFICATE")?;
        {
            let (_, cert) = X509Certificate::from_der(&root_der)
                .map_err(|e| CaError::Material(format!("unable to parse certificate: {}", e)))?;

            if cert.public_key().subject_public_key.data.as_ref() != key_pair.public_key_raw() {
                return Err(CaError::Material(
                    "certificate key does not match private key".into(),
                ));
            }
            if !cert.is_ca() {
                return Err(CaError::Material("certificate is not a CA".into()));
            }
        }
        tracing::trace!("loaded root authority certificate and keys");

        let issuer = Issuer::from_ca_cert_pem(cert_pem, key_pair)
            .map_err(|e| CaError::Material(format!("unable to use certificate as issuer: {}", e)))?;

        let host_ip = detect_host_ip().unwrap_or_else(|e| {
            tracing::warn!("{}, falling back to {}", e, Ipv4Addr::LOCALHOST);
            IpAddr::V4(Ipv4Addr::LOCALHOST)
        });
        tracing::debug!("using host ip [{}] for certificates without a server name", host_ip);

        Ok(Self {
            root_pem: cert_pem.to_string(),
            root_der: CertificateDer::from(root_der),
            issuer,
            host_ip,
            cache: RwLock::new(HashMap::new()),
            generated: AtomicU64::new(0),
        })
    }

    /// Returns a leaf certificate chain for `subject`, generating it on first use.
    ///
    /// An empty subject is replaced by the host IP. A failed generation leaves
    /// the subject uncached, so the next call tries again.
    pub fn leaf_certificate(&self, subject: &str) -> Result<Arc<CertifiedKey>, CaError> {
        let subject = if subject.is_empty() {
            tracing::trace!("no server name, using host ip as certificate subject");
            self.host_ip.to_string()
        } else {
            subject.to_ascii_lowercase()
        };

        let entry = self.entry(&subject);
        let mut leaf = entry.leaf.lock();

        if let Some(certified) = leaf.as_ref() {
            return Ok(Arc::clone(certified));
        }

        let certified = Arc::new(self.generate(&subject)?);
        *leaf = Some(Arc::clone(&certified));
        self.generated.fetch_add(1, Ordering::Relaxed);

        tracing::debug!("generated certificate for [{}]", subject);
        Ok(certified)
    }

    /// Writes the root certificate as PEM.
    pub fn write_root_certificate<W: Write>(&self, mut sink: W) -> io::Result<()> {
        sink.write_all(self.root_pem.as_bytes())?;
        sink.flush()
    }

    /// The root certificate as PEM.
    pub fn root_pem(&self) -> &str {
        &self.root_pem
    }

    /// The root certificate as DER.
    pub fn root_der(&self) -> &CertificateDer<'static> {
        &self.root_der
    }

    /// Address used as the subject when a client sends no server name.
    pub fn host_ip(&self) -> IpAddr {
        self.host_ip
    }

    /// Number of leaf certificates generated so far.
    pub fn generated_count(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    fn entry(&self, subject: &str) -> Arc<CacheEntry> {
        if let Some(entry) = self.cache.read().get(subject) {
            return Arc::clone(entry);
        }

        let mut cache = self.cache.write();
        let entry = cache.entry(subject.to_string()).or_insert_with(|| {
            tracing::trace!("added certificate cache entry for [{}]", subject);
            Arc::new(CacheEntry {
                leaf: Mutex::new(None),
            })
        });
        Arc::clone(entry)
    }

    fn generate(&self, subject: &str) -> Result<CertifiedKey, CaError> {
        let mut serial = [0u8; 16];
        OsRng
            .try_fill_bytes(&mut serial)
            .map_err(|e| CaError::generation(subject, format!("serial number: {}", e)))?;
        serial[0] &= 0x7f;

        let mut params = CertificateParams::default();
        params.serial_number = Some(SerialNumber::from_slice(&serial));

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, subject);
        dn.push(DnType::OrganizationName, "HFLOW Dynamic Cert");
        dn.push(DnType::LocalityName, "Net");
        dn.push(DnType::StateOrProvinceName, "Ether");
        dn.push(DnType::CountryName, "UK");
        params.distinguished_name = dn;

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = now + Duration::hours(LEAF_VALIDITY_HOURS);

        params.is_ca = IsCa::ExplicitNoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];
        params.subject_alt_names = self.subject_alt_names(subject)?;

        let key_pair = KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, RsaKeySize::_4096)
            .map_err(|e| CaError::generation(subject, format!("key generation: {}", e)))?;

        let cert = params
            .signed_by(&key_pair, &self.issuer)
            .map_err(|e| CaError::generation(subject, format!("signing: {}", e)))?;

        let key_der = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
        let signing_key = any_supported_type(&key_der)
            .map_err(|e| CaError::generation(subject, format!("signing key: {}", e)))?;

        Ok(CertifiedKey::new(
            vec![cert.der().clone(), self.root_der.clone()],
            signing_key,
        ))
    }

    fn subject_alt_names(&self, subject: &str) -> Result<Vec<SanType>, CaError> {
        let mut names = Vec::with_capacity(2);

        match subject.parse::<IpAddr>() {
            Ok(ip) if ip != self.host_ip => names.push(SanType::IpAddress(ip)),
            Ok(_) => {}
            Err(_) => {
                let dns = subject
                    .to_string()
                    .try_into()
                    .map_err(|e| CaError::generation(subject, format!("dns name: {}", e)))?;
                names.push(SanType::DnsName(dns));
            }
        }

        names.push(SanType::IpAddress(self.host_ip));
        Ok(names)
    }
}

/// Finds the address of the interface used for outbound traffic.
///
/// Connecting a UDP socket only selects a route; no packet is sent.
fn detect_host_ip() -> Result<IpAddr, CaError> {
    let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).map_err(CaError::HostIp)?;
    socket.connect(HOST_IP_PROBE).map_err(CaError::HostIp)?;

    let ip = socket.local_addr().map_err(CaError::HostIp)?.ip();
    if ip.is_unspecified() {
        return Err(CaError::HostIp(io::Error::new(
            io::ErrorKind::AddrNotAvailable,
            "no outbound interface",
        )));
    }

    Ok(ip)
}

fn read_pem(text: &str, expected: &str) -> Result<Vec<u8>, CaError> {
    let block = pem::parse(text).map_err(|e| {
        CaError::Material(format!("expected pem [{}] data but data is not pem: {}", expected, e))
    })?;

    if block.tag() != expected {
        return Err(CaError::Material(format!(
            "expected pem data for type [{}] but found [{}]",
            expected,
            block.tag()
        )));
    }

    Ok(block.contents().to_vec())
}

/// Certificate resolver that issues leaves from a [`CertificateAuthority`]
/// using the client's server name.
#[derive(Debug, Clone)]
pub struct SniResolver {
    ca: Arc<CertificateAuthority>,
}

impl SniResolver {
    /// Creates a resolver backed by `ca`.
    pub fn new(ca: Arc<CertificateAuthority>) -> Self {
        Self { ca }
    }
}

impl ResolvesServerCert for SniResolver {
    fn resolve(&self, client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        let subject = client_hello.server_name().unwrap_or_default();

        match self.ca.leaf_certificate(subject) {
            Ok(certified) => Some(certified),
            Err(e) => {
                tracing::error!("{}", e);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;
    use std::thread;
    use x509_parser::extensions::GeneralName;
    use x509_parser::public_key::PublicKey;

    const UNRELATED_PUBLIC_KEY_PEM: &str = include_str!("../tests/fixtures/unrelated.pub");

    fn leaf_der(certified: &CertifiedKey) -> Vec<u8> {
        certified.cert[0].as_ref().to_vec()
    }

    fn san_ips(der: &[u8]) -> Vec<IpAddr> {
        let (_, cert) = X509Certificate::from_der(der).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        san.value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::IPAddress(bytes) => match bytes.len() {
                    4 => Some(IpAddr::from(<[u8; 4]>::try_from(*bytes).unwrap())),
                    16 => Some(IpAddr::from(<[u8; 16]>::try_from(*bytes).unwrap())),
                    _ => None,
                },
                _ => None,
            })
            .collect()
    }

    fn san_dns(der: &[u8]) -> Vec<String> {
        let (_, cert) = X509Certificate::from_der(der).unwrap();
        let san = cert.subject_alternative_name().unwrap().unwrap();
        san.value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn embedded_material_loads() {
        let ca = CertificateAuthority::from_embedded().unwrap();

        assert!(ca.root_pem().starts_with("-----BEGIN CERTIFICATE-----"));
        assert_eq!(ca.generated_count(), 0);

        let mut out = Vec::new();
        ca.write_root_certificate(&mut out).unwrap();
        assert_eq!(out, ca.root_pem().as_bytes());

        let (_, root) = X509Certificate::from_der(ca.root_der()).unwrap();
        assert!(root.is_ca());
    }

    #[test]
    fn mismatched_public_key_is_fatal() {
        let err = CertificateAuthority::from_pem(
            ROOT_CERT_PEM,
            UNRELATED_PUBLIC_KEY_PEM,
            ROOT_PRIVATE_KEY_PEM,
        )
        .unwrap_err();

        assert!(matches!(err, CaError::Material(ref m) if m.contains("does not match")));
    }

    #[test]
    fn wrong_block_type_is_fatal() {
        let err = CertificateAuthority::from_pem(ROOT_CERT_PEM, ROOT_PUBLIC_KEY_PEM, ROOT_CERT_PEM)
            .unwrap_err();

        assert!(matches!(err, CaError::Material(ref m) if m.contains("[CERTIFICATE]")));
    }

    #[test]
    fn non_pem_material_is_fatal() {
        let err =
            CertificateAuthority::from_pem("not pem", ROOT_PUBLIC_KEY_PEM, ROOT_PRIVATE_KEY_PEM)
                .unwrap_err();

        assert!(matches!(err, CaError::Material(_)));
    }

    #[test]
    fn leaf_certificate_fields() {
        let ca = CertificateAuthority::from_embedded().unwrap();
        let certified = ca.leaf_certificate("Example.Test").unwrap();

        assert_eq!(certified.cert.len(), 2);
        assert_eq!(&certified.cert[1], ca.root_der());

        let der = leaf_der(&certified);
        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let (_, root) = X509Certificate::from_der(ca.root_der()).unwrap();

        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), "example.test");
        let org = cert.subject().iter_organization().next().unwrap();
        assert_eq!(org.as_str().unwrap(), "HFLOW Dynamic Cert");
        let issuer_cn = cert.issuer().iter_common_name().next().unwrap();
        let root_cn = root.subject().iter_common_name().next().unwrap();
        assert_eq!(issuer_cn.as_str().unwrap(), root_cn.as_str().unwrap());
        assert!(!cert.is_ca());
        assert!(cert.raw_serial().len() <= 17);

        let validity = cert.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(lifetime, LEAF_VALIDITY_HOURS * 3600);

        let key_usage = cert.key_usage().unwrap().unwrap().value;
        assert!(key_usage.digital_signature());
        assert!(key_usage.key_encipherment());
        assert!(key_usage.key_cert_sign());
        assert!(key_usage.crl_sign());

        let eku = cert.extended_key_usage().unwrap().unwrap().value;
        assert!(eku.server_auth);
        assert!(eku.client_auth);

        match cert.public_key().parsed().unwrap() {
            PublicKey::RSA(rsa) => assert_eq!(rsa.key_size(), 4096),
            other => panic!("unexpected key type: {other:?}"),
        }

        assert_eq!(san_dns(&der), vec!["example.test".to_string()]);
        assert_eq!(san_ips(&der), vec![ca.host_ip()]);
    }

    #[test]
    fn missing_server_name_uses_host_ip() {
        let ca = CertificateAuthority::from_embedded().unwrap();
        let certified = ca.leaf_certificate("").unwrap();
        let der = leaf_der(&certified);

        assert!(san_ips(&der).contains(&ca.host_ip()));

        let (_, cert) = X509Certificate::from_der(&der).unwrap();
        let cn = cert.subject().iter_common_name().next().unwrap();
        assert_eq!(cn.as_str().unwrap(), ca.host_ip().to_string());

        // the empty subject and the literal host ip share one cache entry
        let by_ip = ca.leaf_certificate(&ca.host_ip().to_string()).unwrap();
        assert!(Arc::ptr_eq(&certified, &by_ip));
        assert_eq!(ca.generated_count(), 1);
    }

    #[test]
    fn ip_subject_gets_ip_san() {
        let ca = CertificateAuthority::from_embedded().unwrap();
        let subject: IpAddr = "203.0.113.7".parse().unwrap();
        let der = leaf_der(&ca.leaf_certificate(&subject.to_string()).unwrap());

        let ips = san_ips(&der);
        assert!(ips.contains(&subject));
        assert!(ips.contains(&ca.host_ip()));
        assert!(san_dns(&der).is_empty());
    }

    #[test]
    fn leaf_is_cached() {
        let ca = CertificateAuthority::from_embedded().unwrap();

        let first = ca.leaf_certificate("cached.test").unwrap();
        let second = ca.leaf_certificate("cached.test").unwrap();

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(ca.generated_count(), 1);
    }

    #[test]
    fn failed_generation_is_retried() {
        let ca = CertificateAuthority::from_embedded().unwrap();
        let subject = "bad\u{e9}.test";

        for _ in 0..2 {
            let err = ca.leaf_certificate(subject).unwrap_err();
            assert!(matches!(err, CaError::Generation { .. }), "{:?}", err);
        }

        assert_eq!(ca.generated_count(), 0);
        let entry = ca.cache.read().get(subject).cloned().unwrap();
        assert!(entry.leaf.lock().is_none());
    }

    #[test]
    fn concurrent_requests_generate_once() {
        const CALLERS: usize = 8;

        let ca = Arc::new(CertificateAuthority::from_embedded().unwrap());
        let barrier = Arc::new(Barrier::new(CALLERS));

        let handles: Vec<_> = (0..CALLERS)
            .map(|_| {
                let ca = Arc::clone(&ca);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    ca.leaf_certificate("contended.test").unwrap()
                })
            })
            .collect();

        let leaves: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert_eq!(ca.generated_count(), 1);
        for leaf in &leaves[1..] {
            assert!(Arc::ptr_eq(&leaves[0], leaf));
        }
    }

    #[test]
    fn distinct_subjects_get_distinct_leaves() {
        let ca = Arc::new(CertificateAuthority::from_embedded().unwrap());

        let a = {
            let ca = Arc::clone(&ca);
            thread::spawn(move || ca.leaf_certificate("a.test").unwrap())
        };
        let b = ca.leaf_certificate("b.test").unwrap();
        let a = a.join().unwrap();

        assert!(!Arc::ptr_eq(&a, &b));
        assert_eq!(ca.generated_count(), 2);
        assert_eq!(san_dns(&leaf_der(&a)), vec!["a.test".to_string()]);
    }
}
