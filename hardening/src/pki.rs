//! Certificate authority for agent credentials.
//!
//! Trust material is read from file storage under fixed directory conventions:
//!
//! - `vxca/{name}.cert`: root of trust (public only).
//! - `sca/{name}.cert` and `sca/{name}.key`: signing authority issued by the root of the same
//!   name. Used to sign agent credentials (LTACs).
//! - `sc/{name}.cert` and `sc/{name}.key`: server certificate issued by the signing authority
//!   of the same name.
//!
//! Every server certificate is verified up to its root when the material is loaded. Names
//! keep independent trust domains apart.

use crate::Error;
use bastion_persistence::FileReader;
use rand::{rngs::OsRng, RngCore};
use rcgen::{
    CertificateSigningRequestParams, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SerialNumber,
};
use std::{
    collections::BTreeMap,
    sync::{Arc, RwLock},
};
use tracing::{debug, info, warn};
use x509_parser::{
    certificate::X509Certificate, certification_request::X509CertificationRequest,
    prelude::FromDer,
};
use zeroize::Zeroizing;

/// Common name of the certificate agents present on their initial connection.
pub const IAC_COMMON_NAME: &str = "IAC Cert";

const ROOTS_DIR: &str = "vxca";
const SIGNERS_DIR: &str = "sca";
const SERVERS_DIR: &str = "sc";
const CERT_EXTENSION: &str = ".cert";
const KEY_EXTENSION: &str = ".key";

const CERTIFICATE_TAG: &str = "CERTIFICATE";
const CSR_TAG: &str = "CERTIFICATE REQUEST";

/// Days an issued credential is valid before the time it is issued.
const LTAC_BACKDATE_DAYS: i64 = 1;

/// Days an issued credential is valid after the time it is issued.
const LTAC_VALIDITY_DAYS: i64 = 365;

const SERIAL_LENGTH: usize = 16;

/// A server certificate to serve TLS with.
#[derive(Clone)]
pub struct ServerCertificate {
    /// PEM chain: the server certificate followed by its signing authority.
    pub cert_pem: String,
    pub key_pem: Zeroizing<String>,
}

struct Signer {
    cert_pem: String,
    key_pem: Zeroizing<String>,
}

#[derive(Default)]
struct Material {
    roots: BTreeMap<String, Vec<u8>>,
    signers: BTreeMap<String, Signer>,
    servers: BTreeMap<String, ServerCertificate>,
}

fn join(dir: &str, child: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        child.to_string()
    } else {
        format!("{dir}/{child}")
    }
}

/// Decode the DER of the first certificate in `pem`.
fn certificate_der(pem: &[u8]) -> Result<Vec<u8>, Error> {
    let block = pem::parse(pem).map_err(|err| Error::Certificate(err.to_string()))?;
    if block.tag() != CERTIFICATE_TAG {
        return Err(Error::Certificate(format!(
            "unexpected PEM block: {}",
            block.tag()
        )));
    }
    Ok(block.contents().to_vec())
}

fn parse(der: &[u8]) -> Result<X509Certificate<'_>, Error> {
    let (_, cert) =
        X509Certificate::from_der(der).map_err(|err| Error::Certificate(err.to_string()))?;
    Ok(cert)
}

/// Verify that `cert` was signed by `issuer` and that both are within their validity window.
fn verify_issued(cert: &X509Certificate<'_>, issuer: &X509Certificate<'_>) -> Result<(), Error> {
    if !cert.validity().is_valid() {
        return Err(Error::InvalidChain(format!(
            "{} is outside its validity window",
            cert.subject()
        )));
    }
    if !issuer.validity().is_valid() {
        return Err(Error::InvalidChain(format!(
            "{} is outside its validity window",
            issuer.subject()
        )));
    }
    cert.verify_signature(Some(issuer.public_key()))
        .map_err(|err| {
            Error::InvalidChain(format!(
                "{} is not signed by {}: {err}",
                cert.subject(),
                issuer.subject()
            ))
        })
}

/// Return the common name of the leaf of `chain`, if any.
pub fn leaf_common_name(chain: &[Vec<u8>]) -> Result<Option<String>, Error> {
    let leaf = chain
        .first()
        .ok_or_else(|| Error::InvalidChain("empty chain".into()))?;
    let leaf = parse(leaf)?;
    let cn = leaf
        .subject()
        .iter_common_name()
        .next()
        .and_then(|cn| cn.as_str().ok())
        .map(str::to_string);
    Ok(cn)
}

/// Split the files of a directory into complete cert/key pairs.
async fn read_pairs(
    reader: &dyn FileReader,
    dir: &str,
) -> Result<BTreeMap<String, (Vec<u8>, Vec<u8>)>, Error> {
    let mut certs = BTreeMap::new();
    let mut keys = BTreeMap::new();
    for name in reader.list_dir(dir).await? {
        if let Some(stem) = name.strip_suffix(CERT_EXTENSION) {
            certs.insert(stem.to_string(), reader.read_file(&join(dir, &name)).await?);
        } else if let Some(stem) = name.strip_suffix(KEY_EXTENSION) {
            keys.insert(stem.to_string(), reader.read_file(&join(dir, &name)).await?);
        }
    }
    let mut pairs = BTreeMap::new();
    for (name, cert) in certs {
        match keys.remove(&name) {
            Some(key) => {
                pairs.insert(name, (cert, key));
            }
            None => warn!(dir, %name, "certificate without key, skipping"),
        }
    }
    for name in keys.keys() {
        warn!(dir, %name, "key without certificate, skipping");
    }
    Ok(pairs)
}

fn key_pem(raw: Vec<u8>) -> Result<Zeroizing<String>, Error> {
    let pem = Zeroizing::new(
        String::from_utf8(raw).map_err(|err| Error::Certificate(err.to_string()))?,
    );
    KeyPair::from_pem(&pem).map_err(|err| Error::Certificate(err.to_string()))?;
    Ok(pem)
}

fn utf8(raw: Vec<u8>) -> Result<String, Error> {
    String::from_utf8(raw).map_err(|err| Error::Certificate(err.to_string()))
}

impl Material {
    async fn load(reader: &dyn FileReader, dir: &str) -> Result<Self, Error> {
        let mut material = Self::default();

        // Roots
        let roots_dir = join(dir, ROOTS_DIR);
        for name in reader.list_dir(&roots_dir).await? {
            let Some(stem) = name.strip_suffix(CERT_EXTENSION) else {
                continue;
            };
            let der = certificate_der(&reader.read_file(&join(&roots_dir, &name)).await?)?;
            parse(&der)?;
            material.roots.insert(stem.to_string(), der);
        }
        if material.roots.is_empty() {
            return Err(Error::Certificate("no root certificate found".into()));
        }

        // Signing authorities
        for (name, (cert, key)) in read_pairs(reader, &join(dir, SIGNERS_DIR)).await? {
            let cert_pem = utf8(cert)?;
            parse(&certificate_der(cert_pem.as_bytes())?)?;
            let signer = Signer {
                cert_pem,
                key_pem: key_pem(key)?,
            };
            material.signers.insert(name, signer);
        }
        if material.signers.is_empty() {
            return Err(Error::Certificate("no signing authority found".into()));
        }

        // Server certificates
        for (name, (cert, key)) in read_pairs(reader, &join(dir, SERVERS_DIR)).await? {
            let root = material
                .roots
                .get(&name)
                .ok_or_else(|| Error::Certificate(format!("root {name} not found")))?;
            let signer = material
                .signers
                .get(&name)
                .ok_or_else(|| Error::Certificate(format!("signing authority {name} not found")))?;
            let cert_pem = utf8(cert)?;
            let server_der = certificate_der(cert_pem.as_bytes())?;
            let signer_der = certificate_der(signer.cert_pem.as_bytes())?;
            let (server, signer_cert, root) =
                (parse(&server_der)?, parse(&signer_der)?, parse(root)?);
            verify_issued(&server, &signer_cert)?;
            verify_issued(&signer_cert, &root)?;
            let mut chain = cert_pem.trim_end().to_string();
            chain.push('\n');
            chain.push_str(&signer.cert_pem);
            material.servers.insert(
                name,
                ServerCertificate {
                    cert_pem: chain,
                    key_pem: key_pem(key)?,
                },
            );
        }
        if material.servers.is_empty() {
            return Err(Error::Certificate("no server certificate found".into()));
        }
        Ok(material)
    }
}

/// Holds the trust material and signs agent credentials.
pub struct CertificateAuthority {
    reader: Arc<dyn FileReader>,
    dir: String,
    material: RwLock<Arc<Material>>,
}

impl CertificateAuthority {
    /// Load and verify the trust material stored under `dir`.
    pub async fn load(reader: Arc<dyn FileReader>, dir: &str) -> Result<Self, Error> {
        let material = Material::load(reader.as_ref(), dir).await?;
        info!(
            dir,
            roots = material.roots.len(),
            signers = material.signers.len(),
            servers = material.servers.len(),
            "loaded certificate material"
        );
        Ok(Self {
            reader,
            dir: dir.to_string(),
            material: RwLock::new(Arc::new(material)),
        })
    }

    /// Reload the trust material. On failure the current material is kept.
    pub async fn reload(&self) -> Result<(), Error> {
        let material = Material::load(self.reader.as_ref(), &self.dir).await?;
        *self.material.write().unwrap() = Arc::new(material);
        debug!(dir = %self.dir, "reloaded certificate material");
        Ok(())
    }

    fn material(&self) -> Arc<Material> {
        self.material.read().unwrap().clone()
    }

    /// Names of the loaded trust domains that can serve TLS.
    pub fn names(&self) -> Vec<String> {
        self.material().servers.keys().cloned().collect()
    }

    /// Number of loaded roots, signing authorities, and server certificates.
    pub fn counts(&self) -> (usize, usize, usize) {
        let material = self.material();
        (
            material.roots.len(),
            material.signers.len(),
            material.servers.len(),
        )
    }

    /// Return the server certificate of trust domain `name`.
    pub fn server_certificate(&self, name: &str) -> Result<ServerCertificate, Error> {
        self.material()
            .servers
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Certificate(format!("server certificate {name} not found")))
    }

    /// Return the DER of the root of trust domain `name`.
    pub fn root_certificate(&self, name: &str) -> Result<Vec<u8>, Error> {
        self.material()
            .roots
            .get(name)
            .cloned()
            .ok_or_else(|| Error::Certificate(format!("root {name} not found")))
    }

    /// Verify a presented chain (leaf first) up to one of the roots and return its name.
    ///
    /// The chain may end with the root itself or with a certificate the root signed.
    pub fn verify_chain(&self, chain: &[Vec<u8>]) -> Result<String, Error> {
        if chain.is_empty() {
            return Err(Error::InvalidChain("empty chain".into()));
        }
        let certs = chain
            .iter()
            .map(|der| parse(der))
            .collect::<Result<Vec<_>, _>>()?;
        for pair in certs.windows(2) {
            verify_issued(&pair[0], &pair[1])?;
        }
        let last = &certs[certs.len() - 1];
        let material = self.material();
        for (name, root_der) in &material.roots {
            let root = parse(root_der)?;
            if root.public_key().raw == last.public_key().raw {
                if !root.validity().is_valid() {
                    return Err(Error::InvalidChain(format!("root {name} has expired")));
                }
                return Ok(name.clone());
            }
            if verify_issued(last, &root).is_ok() {
                return Ok(name.clone());
            }
        }
        Err(Error::UnknownRoot)
    }

    /// Sign the CSR `csr_der` with the signing authority of the root `root_der`.
    ///
    /// The root is matched by public key. The credential keeps the CSR subject and public key,
    /// is valid from one day ago until a year from now, and can authenticate clients and
    /// servers. Returns the DER of the new certificate.
    pub fn create_ltac_from_csr(&self, root_der: &[u8], csr_der: &[u8]) -> Result<Vec<u8>, Error> {
        let (_, csr) = X509CertificationRequest::from_der(csr_der)
            .map_err(|err| Error::Certificate(format!("invalid CSR: {err}")))?;
        csr.verify_signature()
            .map_err(|err| Error::Certificate(format!("CSR signature check failed: {err}")))?;

        let presented = parse(root_der)?;
        let material = self.material();
        let mut name = None;
        for (candidate, der) in &material.roots {
            if parse(der)?.public_key().raw == presented.public_key().raw {
                name = Some(candidate);
                break;
            }
        }
        let name = name.ok_or(Error::UnknownRoot)?;
        let signer = material
            .signers
            .get(name)
            .ok_or_else(|| Error::Certificate(format!("signing authority {name} not found")))?;

        let csr_pem = pem::encode(&pem::Pem::new(CSR_TAG, csr_der.to_vec()));
        let mut params = CertificateSigningRequestParams::from_pem(&csr_pem)
            .map_err(|err| Error::Certificate(format!("invalid CSR: {err}")))?;
        let now = time::OffsetDateTime::now_utc();
        params.params.not_before = now - time::Duration::days(LTAC_BACKDATE_DAYS);
        params.params.not_after = now + time::Duration::days(LTAC_VALIDITY_DAYS);
        let mut serial = [0u8; SERIAL_LENGTH];
        OsRng.fill_bytes(&mut serial);
        serial[0] &= 0x7f;
        params.params.serial_number = Some(SerialNumber::from_slice(&serial));
        params.params.is_ca = IsCa::NoCa;
        params.params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ClientAuth,
            ExtendedKeyUsagePurpose::ServerAuth,
        ];

        let key = KeyPair::from_pem(&signer.key_pem)
            .map_err(|err| Error::Certificate(err.to_string()))?;
        let issuer = Issuer::from_ca_cert_pem(&signer.cert_pem, &key)
            .map_err(|err| Error::Certificate(format!("failed to create issuer: {err}")))?;
        let ltac = params
            .signed_by(&issuer)
            .map_err(|err| Error::Certificate(format!("failed to sign credential: {err}")))?;
        debug!(%name, "issued credential");
        Ok(ltac.der().to_vec())
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use bastion_persistence::memory;
    use rcgen::{
        BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue,
    };

    /// A certificate and its key, PEM encoded.
    pub(crate) struct Generated {
        pub cert_pem: String,
        pub key_pem: String,
    }

    impl Generated {
        pub fn der(&self) -> Vec<u8> {
            certificate_der(self.cert_pem.as_bytes()).unwrap()
        }
    }

    fn params(cn: &str, ca: bool) -> CertificateParams {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(cn.to_string()));
        params.distinguished_name = dn;
        if ca {
            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::CrlSign,
                KeyUsagePurpose::DigitalSignature,
            ];
        }
        params
    }

    pub(crate) fn self_signed(cn: &str) -> Generated {
        let key = KeyPair::generate().unwrap();
        let cert = params(cn, true).self_signed(&key).unwrap();
        Generated {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    pub(crate) fn issued(cn: &str, ca: bool, issuer: &Generated) -> Generated {
        let key = KeyPair::generate().unwrap();
        let issuer_key = KeyPair::from_pem(&issuer.key_pem).unwrap();
        let issuer = Issuer::from_ca_cert_pem(&issuer.cert_pem, &issuer_key).unwrap();
        let cert = params(cn, ca).signed_by(&key, &issuer).unwrap();
        Generated {
            cert_pem: cert.pem(),
            key_pem: key.serialize_pem(),
        }
    }

    /// A trust domain: root, signing authority, server certificate.
    pub(crate) struct Domain {
        pub root: Generated,
        pub signer: Generated,
        pub server: Generated,
    }

    pub(crate) fn domain(name: &str) -> Domain {
        let root = self_signed(&format!("{name} VXCA"));
        let signer = issued(&format!("{name} SCA"), true, &root);
        let server = issued(&format!("{name} SC"), false, &signer);
        Domain {
            root,
            signer,
            server,
        }
    }

    pub(crate) fn store(files: &memory::Files, dir: &str, name: &str, domain: &Domain) {
        files.put(
            &format!("{dir}/vxca/{name}.cert"),
            domain.root.cert_pem.as_str(),
        );
        files.put(
            &format!("{dir}/sca/{name}.cert"),
            domain.signer.cert_pem.as_str(),
        );
        files.put(
            &format!("{dir}/sca/{name}.key"),
            domain.signer.key_pem.as_str(),
        );
        files.put(
            &format!("{dir}/sc/{name}.cert"),
            domain.server.cert_pem.as_str(),
        );
        files.put(
            &format!("{dir}/sc/{name}.key"),
            domain.server.key_pem.as_str(),
        );
    }

    fn csr(cn: &str) -> (Vec<u8>, KeyPair) {
        let key = KeyPair::generate().unwrap();
        let request = params(cn, false).serialize_request(&key).unwrap();
        (request.der().to_vec(), key)
    }

    #[tokio::test]
    async fn test_load_and_server_certificate() {
        let files = Arc::new(memory::Files::new());
        store(&files, "certs", "main", &domain("main"));
        store(&files, "certs", "backup", &domain("backup"));
        let ca = CertificateAuthority::load(files, "certs").await.unwrap();
        assert_eq!(ca.names(), vec!["backup".to_string(), "main".to_string()]);
        assert_eq!(ca.counts(), (2, 2, 2));

        let server = ca.server_certificate("main").unwrap();
        assert_eq!(pem::parse_many(server.cert_pem.as_bytes()).unwrap().len(), 2);
        assert!(ca.server_certificate("missing").is_err());
    }

    #[tokio::test]
    async fn test_load_rejects_foreign_server_certificate() {
        let files = Arc::new(memory::Files::new());
        let main = domain("main");
        let other = domain("other");
        store(&files, "certs", "main", &main);
        files.put("certs/sc/main.cert", other.server.cert_pem.as_str());
        let result = CertificateAuthority::load(files, "certs").await;
        assert!(matches!(result, Err(Error::InvalidChain(_))));
    }

    #[tokio::test]
    async fn test_load_requires_matching_names() {
        let files = Arc::new(memory::Files::new());
        let main = domain("main");
        store(&files, "certs", "main", &main);
        files.put("certs/sc/renamed.cert", main.server.cert_pem.as_str());
        files.put("certs/sc/renamed.key", main.server.key_pem.as_str());
        assert!(CertificateAuthority::load(files, "certs").await.is_err());

        let empty = Arc::new(memory::Files::new());
        assert!(CertificateAuthority::load(empty, "certs").await.is_err());
    }

    #[tokio::test]
    async fn test_verify_chain() {
        let files = Arc::new(memory::Files::new());
        let main = domain("main");
        store(&files, "certs", "main", &main);
        let ca = CertificateAuthority::load(files, "certs").await.unwrap();

        let iac = issued(IAC_COMMON_NAME, false, &main.signer);
        let chain = vec![iac.der(), main.signer.der(), main.root.der()];
        assert_eq!(ca.verify_chain(&chain).unwrap(), "main");
        assert_eq!(ca.verify_chain(&chain[..2]).unwrap(), "main");
        assert_eq!(ca.root_certificate("main").unwrap(), main.root.der());
        assert!(ca.root_certificate("stranger").is_err());
        assert_eq!(
            leaf_common_name(&chain).unwrap().as_deref(),
            Some(IAC_COMMON_NAME)
        );

        let stranger = domain("stranger");
        let chain = vec![stranger.server.der(), stranger.signer.der()];
        assert!(matches!(ca.verify_chain(&chain), Err(Error::UnknownRoot)));

        // Broken link
        let chain = vec![iac.der(), stranger.signer.der()];
        assert!(matches!(ca.verify_chain(&chain), Err(Error::InvalidChain(_))));
    }

    #[tokio::test]
    async fn test_create_ltac_from_csr() {
        let files = Arc::new(memory::Files::new());
        let main = domain("main");
        let backup = domain("backup");
        store(&files, "certs", "main", &main);
        store(&files, "certs", "backup", &backup);
        let ca = CertificateAuthority::load(files, "certs").await.unwrap();

        let (csr, _key) = csr("agent-0123");
        let ltac = ca.create_ltac_from_csr(&backup.root.der(), &csr).unwrap();
        let (_, cert) = X509Certificate::from_der(&ltac).unwrap();

        // Signed by the matching signing authority, bound to the CSR key
        let signer_der = backup.signer.der();
        let (_, signer) = X509Certificate::from_der(&signer_der).unwrap();
        cert.verify_signature(Some(signer.public_key())).unwrap();
        let other_der = main.signer.der();
        let other = parse(&other_der).unwrap();
        assert!(cert.verify_signature(Some(other.public_key())).is_err());
        let (_, request) = X509CertificationRequest::from_der(&csr).unwrap();
        assert_eq!(
            cert.public_key().raw,
            request.certification_request_info.subject_pki.raw
        );
        assert_eq!(
            cert.subject().iter_common_name().next().unwrap().as_str().unwrap(),
            "agent-0123"
        );

        // Backdated by a day, valid for a year
        let validity = cert.validity();
        let lifetime = validity.not_after.timestamp() - validity.not_before.timestamp();
        assert_eq!(lifetime, (LTAC_BACKDATE_DAYS + LTAC_VALIDITY_DAYS) * 86_400);
        assert!(validity.is_valid());

        // Chains up to its root
        let chain = vec![ltac, signer_der];
        assert_eq!(ca.verify_chain(&chain).unwrap(), "backup");
    }

    #[tokio::test]
    async fn test_create_ltac_rejects() {
        let files = Arc::new(memory::Files::new());
        let main = domain("main");
        store(&files, "certs", "main", &main);
        let ca = CertificateAuthority::load(files, "certs").await.unwrap();
        let (csr, _) = csr("agent");

        let stranger = self_signed("stranger");
        assert!(matches!(
            ca.create_ltac_from_csr(&stranger.der(), &csr),
            Err(Error::UnknownRoot)
        ));

        let mut tampered = csr.clone();
        let last = tampered.len() - 1;
        tampered[last] ^= 0xff;
        assert!(ca.create_ltac_from_csr(&main.root.der(), &tampered).is_err());
        assert!(ca.create_ltac_from_csr(&main.root.der(), b"garbage").is_err());
    }

    #[tokio::test]
    async fn test_reload() {
        let files = Arc::new(memory::Files::new());
        store(&files, "certs", "main", &domain("main"));
        let ca = CertificateAuthority::load(files.clone(), "certs").await.unwrap();
        store(&files, "certs", "second", &domain("second"));
        ca.reload().await.unwrap();
        assert_eq!(ca.counts(), (2, 2, 2));

        // A failed reload keeps the current material
        files.remove("certs/sca/main.cert");
        assert!(ca.reload().await.is_err());
        assert_eq!(ca.counts(), (2, 2, 2));
    }
}
