//! Certificate Authority (spec §4.4): provides the TLS-callback certificate
//! for any SNI host the proxy terminates, backed by a root + intermediate
//! chain loaded from disk.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, ExtendedKeyUsagePurpose, IsCa, Issuer, KeyPair,
    KeyUsagePurpose, SanType, PKCS_ECDSA_P256_SHA256,
};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info};

use crate::clock::Clock;
use crate::errors::KProxyError;

/// A minted leaf certificate ready to hand to `rustls::ServerConfig::with_single_cert`.
#[derive(Clone)]
pub struct LeafCert {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    not_after_unix: i64,
}

pub struct CertificateAuthorityConfig {
    pub root_cert_path: String,
    pub root_key_path: String,
    pub intermediate_cert_path: String,
    pub intermediate_key_path: String,
    pub leaf_validity_secs: i64,
    pub leaf_skew_secs: i64,
    pub safety_margin_secs: i64,
    pub cache_size: u64,
}

pub struct CertificateAuthority {
    issuer: Issuer<'static, KeyPair>,
    intermediate_der: CertificateDer<'static>,
    clock: Arc<dyn Clock>,
    cache: moka::sync::Cache<String, Arc<LeafCert>>,
    inflight: StdMutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    leaf_validity_secs: i64,
    leaf_skew_secs: i64,
    safety_margin_secs: i64,
}

impl CertificateAuthority {
    pub async fn load(cfg: CertificateAuthorityConfig, clock: Arc<dyn Clock>) -> anyhow::Result<Self> {
        // Root material is the externally-trusted anchor (spec §4.4: "root
        // is client-trusted out of band"); it is not used to sign anything
        // at runtime, only validated as present at startup.
        let root_cert_pem = tokio::fs::read_to_string(&cfg.root_cert_path)
            .await
            .map_err(|e| KProxyError::certificate(format!("reading root cert: {e}")))?;
        let _root_key_pem = tokio::fs::read_to_string(&cfg.root_key_path)
            .await
            .map_err(|e| KProxyError::certificate(format!("reading root key: {e}")))?;
        debug!(bytes = root_cert_pem.len(), "loaded root certificate");

        let intermediate_cert_pem = tokio::fs::read_to_string(&cfg.intermediate_cert_path)
            .await
            .map_err(|e| KProxyError::certificate(format!("reading intermediate cert: {e}")))?;
        let intermediate_key_pem = tokio::fs::read_to_string(&cfg.intermediate_key_path)
            .await
            .map_err(|e| KProxyError::certificate(format!("reading intermediate key: {e}")))?;

        let intermediate_key = KeyPair::from_pem(&intermediate_key_pem)
            .map_err(|e| KProxyError::certificate(format!("parsing intermediate key: {e}")))?;
        let issuer = Issuer::from_ca_cert_pem(&intermediate_cert_pem, intermediate_key)
            .map_err(|e| KProxyError::certificate(format!("parsing intermediate cert: {e}")))?;
        let intermediate_der = CertificateDer::from(
            rustls_pemfile::certs(&mut intermediate_cert_pem.as_bytes())
                .next()
                .ok_or_else(|| KProxyError::certificate("intermediate cert PEM had no certificate blocks"))?
                .map_err(|e| KProxyError::certificate(format!("decoding intermediate cert DER: {e}")))?,
        );

        info!("certificate authority ready (intermediate loaded, leaf minting enabled)");

        Ok(Self {
            issuer,
            intermediate_der,
            clock,
            cache: moka::sync::Cache::builder().max_capacity(cfg.cache_size).build(),
            inflight: StdMutex::new(HashMap::new()),
            leaf_validity_secs: cfg.leaf_validity_secs,
            leaf_skew_secs: cfg.leaf_skew_secs,
            safety_margin_secs: cfg.safety_margin_secs,
        })
    }

    /// `get_certificate(sni)` (spec §4.4). Rejects an empty SNI; otherwise
    /// returns a cached or freshly-minted leaf, single-flighted per SNI so
    /// concurrent handshakes for a new host mint only one certificate.
    pub async fn get_certificate(&self, sni: &str) -> Result<Arc<LeafCert>, KProxyError> {
        if sni.is_empty() {
            return Err(KProxyError::certificate("missing SNI, cannot forge a certificate"));
        }
        let sni = sni.to_ascii_lowercase();

        if let Some(entry) = self.fresh_cached(&sni) {
            return Ok(entry);
        }

        let lock = {
            let mut inflight = self.inflight.lock().unwrap();
            inflight.entry(sni.clone()).or_insert_with(|| Arc::new(AsyncMutex::new(()))).clone()
        };
        let _guard = lock.lock().await;

        if let Some(entry) = self.fresh_cached(&sni) {
            self.inflight.lock().unwrap().remove(&sni);
            return Ok(entry);
        }

        let minted = Arc::new(self.mint(&sni)?);
        self.cache.insert(sni.clone(), minted.clone());
        self.inflight.lock().unwrap().remove(&sni);
        Ok(minted)
    }

    fn fresh_cached(&self, sni: &str) -> Option<Arc<LeafCert>> {
        let entry = self.cache.get(sni)?;
        let now = self.clock.now().timestamp();
        if entry.not_after_unix - self.safety_margin_secs > now {
            Some(entry)
        } else {
            None
        }
    }

    fn mint(&self, sni: &str) -> Result<LeafCert, KProxyError> {
        let now = self.clock.now().timestamp();
        let not_before = now - self.leaf_skew_secs;
        let not_after = now + self.leaf_validity_secs;

        let mut params = if let Ok(ip) = sni.parse::<std::net::IpAddr>() {
            let mut params = CertificateParams::new(Vec::new())
                .map_err(|e| KProxyError::certificate(format!("building cert params: {e}")))?;
            params.subject_alt_names.push(SanType::IpAddress(ip));
            params
        } else {
            CertificateParams::new(vec![sni.to_string()])
                .map_err(|e| KProxyError::certificate(format!("building cert params: {e}")))?
        };

        let mut dn = DistinguishedName::new();
        dn.push(rcgen::DnType::CommonName, sni);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature, KeyUsagePurpose::KeyEncipherment];
        params.not_before = time::OffsetDateTime::from_unix_timestamp(not_before)
            .map_err(|e| KProxyError::certificate(format!("invalid not_before: {e}")))?;
        params.not_after = time::OffsetDateTime::from_unix_timestamp(not_after)
            .map_err(|e| KProxyError::certificate(format!("invalid not_after: {e}")))?;

        let leaf_key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)
            .map_err(|e| KProxyError::certificate(format!("generating leaf key: {e}")))?;
        let cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| KProxyError::certificate(format!("signing leaf cert: {e}")))?;

        let leaf_der = CertificateDer::from(cert.der().to_vec());
        let key_der = PrivateKeyDer::try_from(leaf_key.serialize_der())
            .map_err(|e| KProxyError::certificate(format!("encoding leaf key: {e}")))?;

        Ok(LeafCert {
            chain: vec![leaf_der, self.intermediate_der.clone()],
            key: key_der,
            not_after_unix: not_after,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::SystemClock;
    use rcgen::{BasicConstraints as BC, CertificateParams as CP, IsCa as IC, KeyPair as KP};
    use std::io::Write;

    fn write_test_ca(dir: &std::path::Path) -> CertificateAuthorityConfig {
        let root_key = KP::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut root_params = CP::default();
        root_params.is_ca = IC::Ca(BC::Unconstrained);
        let root_cert = root_params.self_signed(&root_key).unwrap();

        let root_key_pem = root_key.serialize_pem();
        let root_issuer = Issuer::from_ca_cert_pem(&root_cert.pem(), root_key).unwrap();
        let intermediate_key = KP::generate_for(&PKCS_ECDSA_P256_SHA256).unwrap();
        let mut int_params = CP::default();
        int_params.is_ca = IC::Ca(BC::Unconstrained);
        let intermediate_cert = int_params.signed_by(&intermediate_key, &root_issuer).unwrap();

        let root_cert_path = dir.join("root.pem");
        let root_key_path = dir.join("root.key");
        let int_cert_path = dir.join("int.pem");
        let int_key_path = dir.join("int.key");

        std::fs::File::create(&root_cert_path).unwrap().write_all(root_cert.pem().as_bytes()).unwrap();
        std::fs::File::create(&root_key_path).unwrap().write_all(root_key_pem.as_bytes()).unwrap();
        std::fs::File::create(&int_cert_path).unwrap().write_all(intermediate_cert.pem().as_bytes()).unwrap();
        std::fs::File::create(&int_key_path)
            .unwrap()
            .write_all(intermediate_key.serialize_pem().as_bytes())
            .unwrap();

        CertificateAuthorityConfig {
            root_cert_path: root_cert_path.to_string_lossy().to_string(),
            root_key_path: root_key_path.to_string_lossy().to_string(),
            intermediate_cert_path: int_cert_path.to_string_lossy().to_string(),
            intermediate_key_path: int_key_path.to_string_lossy().to_string(),
            leaf_validity_secs: 86400,
            leaf_skew_secs: 300,
            safety_margin_secs: 60,
            cache_size: 100,
        }
    }

    #[tokio::test]
    async fn mints_and_caches_a_leaf_for_new_sni() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_test_ca(dir.path());
        let ca = CertificateAuthority::load(cfg, Arc::new(SystemClock)).await.unwrap();

        let first = ca.get_certificate("www.example.com").await.unwrap();
        let second = ca.get_certificate("www.example.com").await.unwrap();
        assert_eq!(first.chain.len(), 2);
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn rejects_empty_sni() {
        let dir = tempfile::tempdir().unwrap();
        let cfg = write_test_ca(dir.path());
        let ca = CertificateAuthority::load(cfg, Arc::new(SystemClock)).await.unwrap();
        assert!(ca.get_certificate("").await.is_err());
    }
}
