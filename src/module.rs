//! Process-wide random generator state.
//!
//! [`initialize`] must run once before any [`Context`](crate::Context) is
//! created. The generator is never torn down and never re-seeded by a second
//! call.

use std::sync::{Arc, Mutex, OnceLock};

use rand_core::CryptoRngCore;
use rustls::crypto::{CryptoProvider, GetRandomFailed, SecureRandom};

use crate::rng::{HmacDrbg, MAX_REQUEST};
use crate::{Error, Result};

/// Personalization string mixed into the initial seed.
pub const SEED_LABEL: &[u8] = b"simba-ssl";

static STATE: OnceLock<ProcessRng> = OnceLock::new();

/// The process DRBG together with the entropy source it reseeds from.
pub struct ProcessRng {
    inner: Mutex<Inner>,
}

struct Inner {
    drbg: HmacDrbg,
    entropy: Box<dyn CryptoRngCore + Send>,
}

impl ProcessRng {
    fn new(drbg: HmacDrbg, entropy: Box<dyn CryptoRngCore + Send>) -> Self {
        Self {
            inner: Mutex::new(Inner { drbg, entropy }),
        }
    }

    /// Fill `dest` from the DRBG, reseeding from the entropy source whenever
    /// the reseed interval runs out, including part way through a large
    /// request.
    pub fn try_fill(&self, dest: &mut [u8]) -> Result<()> {
        let mut guard = self
            .inner
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let Inner { drbg, entropy } = &mut *guard;
        for chunk in dest.chunks_mut(MAX_REQUEST) {
            if drbg.needs_reseed() {
                drbg.reseed(entropy.as_rngcore(), None)?;
            }
            drbg.generate(chunk, None)?;
        }
        Ok(())
    }
}

impl core::fmt::Debug for ProcessRng {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("ProcessRng").finish_non_exhaustive()
    }
}

impl SecureRandom for ProcessRng {
    fn fill(&self, buf: &mut [u8]) -> core::result::Result<(), GetRandomFailed> {
        self.try_fill(buf).map_err(|e| {
            error!("Process random generator failed: {:?}", e);
            GetRandomFailed
        })
    }
}

/// Seed the process generator from the operating system entropy source.
///
/// Returns immediately if the module is already initialized.
pub fn initialize() -> Result<()> {
    initialize_with_entropy(rand_core::OsRng)
}

/// Seed the process generator from `entropy`, e.g. a hardware RNG peripheral.
///
/// The source is kept for periodic reseeding. Returns immediately, without
/// touching `entropy`, if the module is already initialized.
pub fn initialize_with_entropy<E>(mut entropy: E) -> Result<()>
where
    E: CryptoRngCore + Send + 'static,
{
    if STATE.get().is_some() {
        trace!("Module already initialized");
        return Ok(());
    }

    let drbg = HmacDrbg::new(&mut entropy, SEED_LABEL).inspect_err(|_| {
        error!("Unable to seed the random generator");
    })?;

    if STATE.set(ProcessRng::new(drbg, Box::new(entropy))).is_err() {
        // Another thread got there first; its generator stays in place.
        debug!("Module initialized concurrently");
    } else {
        info!("Module initialized");
    }
    Ok(())
}

pub fn is_initialized() -> bool {
    STATE.get().is_some()
}

/// The process generator, or `InvalidArgument` before [`initialize`].
pub fn rng() -> Result<&'static ProcessRng> {
    STATE.get().ok_or(Error::InvalidArgument)
}

/// Engine crypto provider drawing its randomness from the process generator.
pub(crate) fn crypto_provider() -> Result<Arc<CryptoProvider>> {
    let rng = rng()?;
    Ok(Arc::new(CryptoProvider {
        secure_random: rng,
        ..rustls::crypto::ring::default_provider()
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn initialize_is_idempotent() {
        initialize().unwrap();
        let first = rng().unwrap();
        initialize().unwrap();
        let second = rng().unwrap();
        assert!(core::ptr::eq(first, second));
        assert!(is_initialized());
    }

    #[test]
    fn generator_feeds_the_engine() {
        initialize().unwrap();
        let provider = crypto_provider().unwrap();
        let mut a = [0u8; 48];
        let mut b = [0u8; 48];
        provider.secure_random.fill(&mut a).unwrap();
        provider.secure_random.fill(&mut b).unwrap();
        assert_ne!(a, b);
    }

    #[test]
    fn large_fill_reseeds_between_pieces() {
        let mut drbg = HmacDrbg::new(&mut rand_core::OsRng, SEED_LABEL).unwrap();
        drbg.set_reseed_interval(2);
        let rng = ProcessRng::new(drbg, Box::new(rand_core::OsRng));

        let mut out = vec![0u8; MAX_REQUEST * 4];
        rng.try_fill(&mut out).unwrap();
        assert_ne!(&out[..32], &out[MAX_REQUEST * 3..MAX_REQUEST * 3 + 32]);

        // The interval is spent again; the next call reseeds up front.
        rng.try_fill(&mut out).unwrap();
    }
}
