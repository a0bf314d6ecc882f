use std::sync::Arc;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{verify_tls12_signature, verify_tls13_signature, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::server::{ClientHello, ResolvesServerCert, WebPkiClientVerifier};
use rustls::sign::CertifiedKey;
use rustls::{
    ClientConfig, ClientConnection, Connection, DigitallySignedStruct, InconsistentKeys,
    RootCertStore, ServerConfig, ServerConnection, SignatureScheme, SupportedProtocolVersion,
};

use crate::pki::{self, ParseError};
use crate::session::SocketMode;
use crate::slots::{Slot, SlotAllocator};
use crate::{module, Error, Result};

static TLS12_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS12];
static TLS13_ONLY: &[&SupportedProtocolVersion] = &[&rustls::version::TLS13];

/// Protocol variant a [`Context`] is configured for.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum Protocol {
    /// Stream transport, TLS 1.2 or 1.3 as negotiated.
    Tls,
    /// Stream transport, TLS 1.2 only.
    Tls12,
    /// Stream transport, TLS 1.3 only.
    Tls13,
    /// Datagram transport. Not supported by the engine.
    Dtls,
}

impl Protocol {
    fn versions(self) -> Option<&'static [&'static SupportedProtocolVersion]> {
        match self {
            Self::Tls => Some(rustls::DEFAULT_VERSIONS),
            Self::Tls12 => Some(TLS12_ONLY),
            Self::Tls13 => Some(TLS13_ONLY),
            Self::Dtls => None,
        }
    }
}

/// Peer certificate verification.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum VerifyMode {
    /// Do not verify the peer. Server default.
    None,
    /// Verify a certificate if the peer presents one. Server side only; a
    /// client treats this as `Required`.
    Optional,
    /// The peer must present a certificate chaining to a loaded verify
    /// location. Client default.
    Required,
}

/// A TLS configuration occupying one configuration slot.
///
/// The context holds its own certificate material; loading a chain into one
/// context never affects another. Every [`Session`](crate::Session) borrows
/// the context it was opened from, so a context cannot be deinitialized or
/// dropped while a session is live.
pub struct Context<'a> {
    slots: &'a dyn SlotAllocator,
    slot: Option<Slot>,
    protocol: Protocol,
    versions: &'static [&'static SupportedProtocolVersion],
    provider: Arc<CryptoProvider>,
    material: Material,
}

impl<'a> Context<'a> {
    /// Create a context for `protocol`, taking a configuration slot from
    /// `slots`.
    ///
    /// The module must be initialized. The engine's server defaults are
    /// applied with the process generator as random source.
    pub fn init(slots: &'a dyn SlotAllocator, protocol: Protocol) -> Result<Self> {
        let provider = module::crypto_provider().inspect_err(|_| {
            warn!("Context created before module initialization");
        })?;
        let Some(versions) = protocol.versions() else {
            warn!("Unsupported protocol {:?}", protocol);
            return Err(Error::InvalidArgument);
        };

        let slot = slots.acquire_config_slot()?;
        let material = Material::default();
        if let Err(e) = material.server_config(&provider, versions) {
            error!("Engine rejected default configuration: {:?}", e);
            slots.release_config_slot(slot);
            return Err(e);
        }

        debug!("Context initialized for {:?}", protocol);
        Ok(Self {
            slots,
            slot: Some(slot),
            protocol,
            versions,
            provider,
            material,
        })
    }

    /// Release the configuration slot. The context is unusable afterwards.
    pub fn deinit(&mut self) -> Result<()> {
        let slot = self.slot.take().ok_or(Error::InvalidArgument)?;
        self.slots.release_config_slot(slot);
        self.material = Material::default();
        debug!("Context deinitialized");
        Ok(())
    }

    /// Load the certificate chain (leaf first) and, optionally, its private
    /// key. PEM and DER are accepted.
    ///
    /// The certificates after the leaf become the CA chain; the whole chain
    /// and key become the context's own certificate. Without `key` the key
    /// loaded by an earlier call stays in place and must match the new leaf.
    /// A key that the engine rejects or that does not match the leaf is a
    /// [`ParseError::InvalidPrivateKey`]. On error the context is left as it
    /// was.
    pub fn load_cert_chain(&mut self, cert: &[u8], key: Option<&[u8]>) -> Result<()> {
        self.ensure_configured()?;

        let chain = pki::parse_certificates(cert)?;
        let key = match key {
            Some(key) => Some(pki::parse_private_key(key)?),
            None => self.material.key.as_ref().map(PrivateKeyDer::clone_key),
        };
        if let Some(key) = &key {
            self.check_key_pair(&chain, key)?;
        }

        debug!(
            "Loaded {} certificate(s), key {}",
            chain.len(),
            if key.is_some() { "present" } else { "absent" }
        );
        self.material.chain = chain;
        self.material.key = key;
        Ok(())
    }

    fn check_key_pair(
        &self,
        chain: &[CertificateDer<'static>],
        key: &PrivateKeyDer<'static>,
    ) -> Result<()> {
        let signing_key = self
            .provider
            .key_provider
            .load_private_key(key.clone_key())
            .map_err(|e| {
                warn!("Engine rejected private key: {:?}", e);
                ParseError::InvalidPrivateKey
            })?;
        match CertifiedKey::new(chain.to_vec(), signing_key).keys_match() {
            // The key cannot report its public half; nothing to compare.
            Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => Ok(()),
            Err(e) => {
                warn!("Private key does not match certificate: {:?}", e);
                Err(ParseError::InvalidPrivateKey.into())
            }
        }
    }

    /// Add trust anchors used to verify the peer.
    pub fn load_verify_location(&mut self, ca: &[u8]) -> Result<()> {
        self.ensure_configured()?;
        let anchors = pki::parse_certificates(ca)?;
        trace!("Added {} verify location(s)", anchors.len());
        self.material.verify_locations.extend(anchors);
        Ok(())
    }

    pub fn set_verify_mode(&mut self, mode: VerifyMode) -> Result<()> {
        self.ensure_configured()?;
        self.material.verify_mode = Some(mode);
        Ok(())
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn has_private_key(&self) -> bool {
        self.material.key.is_some()
    }

    pub fn is_configured(&self) -> bool {
        self.slot.is_some()
    }

    /// Own certificate chain, leaf first. Empty until a chain is loaded.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.material.chain
    }

    /// The certificates following the leaf of the loaded chain.
    pub fn ca_chain(&self) -> &[CertificateDer<'static>] {
        self.material.ca_chain()
    }

    pub(crate) fn slots(&self) -> &'a dyn SlotAllocator {
        self.slots
    }

    /// Set up an engine connection for one session.
    pub(crate) fn connection(
        &self,
        mode: SocketMode,
        server_hostname: Option<&str>,
    ) -> Result<Connection> {
        self.ensure_configured()?;
        match mode {
            SocketMode::Server => {
                let config = self.material.server_config(&self.provider, self.versions)?;
                Ok(Connection::Server(ServerConnection::new(config)?))
            }
            SocketMode::Client => {
                let hostname = server_hostname.ok_or(Error::InvalidArgument)?;
                let name = ServerName::try_from(hostname.to_owned()).map_err(|_| {
                    warn!("Invalid server hostname {}", hostname);
                    Error::InvalidArgument
                })?;
                let config = self.material.client_config(&self.provider, self.versions)?;
                Ok(Connection::Client(ClientConnection::new(config, name)?))
            }
        }
    }

    fn ensure_configured(&self) -> Result<()> {
        if self.is_configured() {
            Ok(())
        } else {
            warn!("Context used after deinit");
            Err(Error::InvalidArgument)
        }
    }
}

impl Drop for Context<'_> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            self.slots.release_config_slot(slot);
        }
    }
}

impl core::fmt::Debug for Context<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Context")
            .field("slot", &self.slot)
            .field("protocol", &self.protocol)
            .field("certificates", &self.material.chain.len())
            .field("key", &self.material.key.is_some())
            .field("verify_mode", &self.material.verify_mode)
            .finish_non_exhaustive()
    }
}

/// Certificate material and verification settings of one context.
#[derive(Default)]
struct Material {
    chain: Vec<CertificateDer<'static>>,
    key: Option<PrivateKeyDer<'static>>,
    verify_locations: Vec<CertificateDer<'static>>,
    verify_mode: Option<VerifyMode>,
}

impl Clone for Material {
    fn clone(&self) -> Self {
        Self {
            chain: self.chain.clone(),
            key: self.key.as_ref().map(PrivateKeyDer::clone_key),
            verify_locations: self.verify_locations.clone(),
            verify_mode: self.verify_mode,
        }
    }
}

impl Material {
    fn ca_chain(&self) -> &[CertificateDer<'static>] {
        self.chain.get(1..).unwrap_or_default()
    }

    fn roots(&self) -> Result<RootCertStore> {
        let mut roots = RootCertStore::empty();
        for cert in self.verify_locations.iter().chain(self.ca_chain()) {
            roots.add(cert.clone())?;
        }
        Ok(roots)
    }

    fn server_config(
        &self,
        provider: &Arc<CryptoProvider>,
        versions: &[&'static SupportedProtocolVersion],
    ) -> Result<Arc<ServerConfig>> {
        let builder = ServerConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)?;

        let builder = match self.verify_mode.unwrap_or(VerifyMode::None) {
            VerifyMode::None => builder.with_no_client_auth(),
            mode => {
                let verifier =
                    WebPkiClientVerifier::builder_with_provider(Arc::new(self.roots()?), provider.clone());
                let verifier = if mode == VerifyMode::Optional {
                    verifier.allow_unauthenticated()
                } else {
                    verifier
                };
                let verifier = verifier.build().map_err(|e| {
                    warn!("Unable to build client verifier: {}", e);
                    Error::Tls(rustls::Error::General(e.to_string()))
                })?;
                builder.with_client_cert_verifier(verifier)
            }
        };

        let config = match &self.key {
            Some(key) if !self.chain.is_empty() => {
                builder.with_single_cert(self.chain.clone(), key.clone_key())?
            }
            _ => builder.with_cert_resolver(Arc::new(NoCertificate)),
        };
        Ok(Arc::new(config))
    }

    fn client_config(
        &self,
        provider: &Arc<CryptoProvider>,
        versions: &[&'static SupportedProtocolVersion],
    ) -> Result<Arc<ClientConfig>> {
        let builder = ClientConfig::builder_with_provider(provider.clone())
            .with_protocol_versions(versions)?;

        let builder = match self.verify_mode.unwrap_or(VerifyMode::Required) {
            VerifyMode::None => builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoVerification(provider.clone()))),
            _ => builder.with_root_certificates(self.roots()?),
        };

        let config = match &self.key {
            Some(key) if !self.chain.is_empty() => {
                builder.with_client_auth_cert(self.chain.clone(), key.clone_key())?
            }
            _ => builder.with_no_client_auth(),
        };
        Ok(Arc::new(config))
    }
}

/// Server certificate source used until a chain and key are loaded. Every
/// handshake fails in the engine.
#[derive(Debug)]
struct NoCertificate;

impl ResolvesServerCert for NoCertificate {
    fn resolve(&self, _client_hello: ClientHello<'_>) -> Option<Arc<CertifiedKey>> {
        warn!("Server handshake without a loaded certificate");
        None
    }
}

/// Accepts any server certificate. Signatures are still checked so the
/// handshake transcript stays bound to the presented key.
#[derive(Debug)]
struct NoVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for NoVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> core::result::Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> core::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> core::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.0.signature_verification_algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ResourceSlots;

    fn self_signed() -> rcgen::CertifiedKey {
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap()
    }

    #[test]
    fn init_takes_the_only_config_slot() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        let mut context = Context::init(&slots, Protocol::Tls).unwrap();
        assert!(Context::init(&slots, Protocol::Tls)
            .unwrap_err()
            .is_resource_exhaustion());

        context.deinit().unwrap();
        assert!(!context.is_configured());
        assert!(context.deinit().unwrap_err().is_precondition());

        let _again = Context::init(&slots, Protocol::Tls13).unwrap();
    }

    #[test]
    fn drop_releases_the_slot() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        {
            let _context = Context::init(&slots, Protocol::Tls).unwrap();
            assert_eq!(slots.configs().in_use(), 1);
        }
        assert_eq!(slots.configs().in_use(), 0);
    }

    #[test]
    fn datagram_transport_is_rejected() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        let err = Context::init(&slots, Protocol::Dtls).unwrap_err();
        assert!(err.is_precondition());
        assert_eq!(slots.configs().in_use(), 0);
    }

    #[test]
    fn load_cert_chain_registers_ca_chain() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        let mut context = Context::init(&slots, Protocol::Tls).unwrap();

        let leaf = self_signed();
        let issuer = self_signed();
        let chain = format!("{}{}", leaf.cert.pem(), issuer.cert.pem());
        context
            .load_cert_chain(chain.as_bytes(), Some(leaf.key_pair.serialize_pem().as_bytes()))
            .unwrap();

        assert_eq!(context.cert_chain().len(), 2);
        assert_eq!(context.ca_chain().len(), 1);
        assert_eq!(context.ca_chain()[0].as_ref(), issuer.cert.der().as_ref());
    }

    #[test]
    fn malformed_certificate_leaves_context_usable() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        let mut context = Context::init(&slots, Protocol::Tls).unwrap();

        let err = context.load_cert_chain(b"garbage", None).unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::InvalidCertificate)));
        assert!(context.is_configured());
        assert!(context.cert_chain().is_empty());

        let good = self_signed();
        context
            .load_cert_chain(
                good.cert.pem().as_bytes(),
                Some(good.key_pair.serialize_pem().as_bytes()),
            )
            .unwrap();
        assert_eq!(context.cert_chain().len(), 1);
    }

    #[test]
    fn malformed_key_is_a_parse_error() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        let mut context = Context::init(&slots, Protocol::Tls).unwrap();
        let good = self_signed();

        let err = context
            .load_cert_chain(good.cert.pem().as_bytes(), Some(b"not a key"))
            .unwrap_err();
        assert!(matches!(err, Error::Parse(_)));
        assert!(context.cert_chain().is_empty());
    }

    #[test]
    fn mismatched_key_is_a_parse_error() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        let mut context = Context::init(&slots, Protocol::Tls).unwrap();
        let cert = self_signed();
        let other = self_signed();

        let err = context
            .load_cert_chain(
                cert.cert.pem().as_bytes(),
                Some(other.key_pair.serialize_pem().as_bytes()),
            )
            .unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::InvalidPrivateKey)));
        assert!(context.cert_chain().is_empty());
        assert!(!context.has_private_key());
    }

    #[test]
    fn verify_mode_does_not_affect_certificate_loading() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        let mut context = Context::init(&slots, Protocol::Tls).unwrap();
        context.set_verify_mode(VerifyMode::Required).unwrap();

        let good = self_signed();
        context
            .load_cert_chain(
                good.cert.pem().as_bytes(),
                Some(good.key_pair.serialize_pem().as_bytes()),
            )
            .unwrap();
        assert!(context.has_private_key());

        // Requiring client certificates without trust anchors is an engine
        // failure, reported when the session is set up.
        let err = context.connection(SocketMode::Server, None).unwrap_err();
        assert!(matches!(err, Error::Tls(_)), "unexpected error {err:?}");

        context.load_verify_location(good.cert.pem().as_bytes()).unwrap();
        assert!(context.connection(SocketMode::Server, None).is_ok());
    }

    #[test]
    fn chain_without_key_keeps_the_loaded_key() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        let mut context = Context::init(&slots, Protocol::Tls).unwrap();
        let first = self_signed();
        context
            .load_cert_chain(
                first.cert.pem().as_bytes(),
                Some(first.key_pair.serialize_pem().as_bytes()),
            )
            .unwrap();

        context
            .load_cert_chain(first.cert.der(), None)
            .unwrap();
        assert!(context.has_private_key());

        // The kept key has to match the new leaf.
        let second = self_signed();
        let err = context
            .load_cert_chain(second.cert.pem().as_bytes(), None)
            .unwrap_err();
        assert!(matches!(err, Error::Parse(ParseError::InvalidPrivateKey)));
        assert_eq!(context.cert_chain()[0].as_ref(), first.cert.der().as_ref());
        assert!(context.has_private_key());
    }

    #[test]
    fn material_is_per_context() {
        module::initialize().unwrap();
        let slots: ResourceSlots<1, 2> = ResourceSlots::new();
        let mut first = Context::init(&slots, Protocol::Tls).unwrap();
        let mut second = Context::init(&slots, Protocol::Tls).unwrap();

        let a = self_signed();
        let b = self_signed();
        first
            .load_cert_chain(a.cert.pem().as_bytes(), Some(a.key_pair.serialize_pem().as_bytes()))
            .unwrap();
        second
            .load_cert_chain(b.cert.pem().as_bytes(), Some(b.key_pair.serialize_pem().as_bytes()))
            .unwrap();

        assert_eq!(first.cert_chain()[0].as_ref(), a.cert.der().as_ref());
        assert_eq!(second.cert_chain()[0].as_ref(), b.cert.der().as_ref());
    }

    #[test]
    fn configured_context_builds_engine_connections() {
        module::initialize().unwrap();
        let slots: ResourceSlots = ResourceSlots::new();
        let mut context = Context::init(&slots, Protocol::Tls).unwrap();
        let cert = self_signed();
        context.load_verify_location(cert.cert.pem().as_bytes()).unwrap();

        assert!(context.connection(SocketMode::Server, None).is_ok());
        assert!(context
            .connection(SocketMode::Client, Some("localhost"))
            .is_ok());
        assert!(context
            .connection(SocketMode::Client, None)
            .unwrap_err()
            .is_precondition());

        context.deinit().unwrap();
        assert!(context
            .connection(SocketMode::Server, None)
            .unwrap_err()
            .is_precondition());
        assert!(context
            .load_verify_location(cert.cert.pem().as_bytes())
            .unwrap_err()
            .is_precondition());
    }
}
