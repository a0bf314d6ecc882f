//! Certificate and private key decoding.
//!
//! Input may be PEM or DER. A trailing NUL is tolerated so that C-string
//! buffers can be passed as they are.

use rustls::pki_types::{CertificateDer, PrivateKeyDer};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ParseError {
    /// The input held no certificate.
    NoCertificate,
    /// A certificate was not valid DER X.509.
    InvalidCertificate,
    /// The input held no private key.
    NoPrivateKey,
    /// The private key was malformed or rejected by the engine.
    InvalidPrivateKey,
    /// The PEM armour itself was malformed.
    InvalidPem,
}

impl core::fmt::Display for ParseError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            Self::NoCertificate => write!(f, "No certificate found"),
            Self::InvalidCertificate => write!(f, "Invalid certificate"),
            Self::NoPrivateKey => write!(f, "No private key found"),
            Self::InvalidPrivateKey => write!(f, "Invalid private key"),
            Self::InvalidPem => write!(f, "Invalid PEM encoding"),
        }
    }
}

impl std::error::Error for ParseError {}

/// Decode a certificate chain, leaf first.
pub fn parse_certificates(data: &[u8]) -> Result<Vec<CertificateDer<'static>>, ParseError> {
    let data = trim_nul(data);
    let certs = if is_pem(data) {
        rustls_pemfile::certs(&mut &data[..])
            .collect::<Result<Vec<_>, _>>()
            .map_err(|e| {
                warn!("Error reading PEM certificates: {:?}", e);
                ParseError::InvalidPem
            })?
    } else if data.is_empty() {
        Vec::new()
    } else {
        vec![CertificateDer::from(data.to_vec())]
    };

    if certs.is_empty() {
        return Err(ParseError::NoCertificate);
    }

    for (i, cert) in certs.iter().enumerate() {
        webpki::EndEntityCert::try_from(cert).map_err(|e| {
            warn!("Error loading cert #{}: {:?}", i, e);
            ParseError::InvalidCertificate
        })?;
    }
    trace!("Parsed {} certificate(s)", certs.len());
    Ok(certs)
}

/// Decode a single private key (PKCS#1, PKCS#8 or SEC1).
pub fn parse_private_key(data: &[u8]) -> Result<PrivateKeyDer<'static>, ParseError> {
    let data = trim_nul(data);
    if is_pem(data) {
        rustls_pemfile::private_key(&mut &data[..])
            .map_err(|e| {
                warn!("Error reading PEM private key: {:?}", e);
                ParseError::InvalidPem
            })?
            .ok_or(ParseError::NoPrivateKey)
    } else if data.is_empty() {
        Err(ParseError::NoPrivateKey)
    } else {
        PrivateKeyDer::try_from(data)
            .map(|key| key.clone_key())
            .map_err(|e| {
                warn!("Error reading DER private key: {}", e);
                ParseError::InvalidPrivateKey
            })
    }
}

fn trim_nul(data: &[u8]) -> &[u8] {
    data.strip_suffix(&[0]).unwrap_or(data)
}

fn is_pem(data: &[u8]) -> bool {
    const MARKER: &[u8] = b"-----BEGIN ";
    data.windows(MARKER.len()).any(|w| w == MARKER)
}
