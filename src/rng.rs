//! HMAC_DRBG (NIST SP 800-90A) over SHA-256.
//!
//! The engine does not ship a deterministic generator we can seed ourselves,
//! so the process generator is built from `hmac` and `sha2` and handed to the
//! engine as its random source (see [`crate::module`]).

use digest::{Key, KeyInit};
use hmac::{Hmac, Mac};
use rand_core::RngCore;
use sha2::Sha256;

use crate::{Error, Result};

type HmacSha256 = Hmac<Sha256>;

const OUTPUT_LEN: usize = 32;

/// Entropy pulled from the source on seed and reseed.
pub const ENTROPY_LEN: usize = 32;

/// Nonce pulled from the source on instantiation only.
const NONCE_LEN: usize = ENTROPY_LEN / 2;

/// Generate calls allowed between reseeds.
pub const RESEED_INTERVAL: u64 = 10_000;

/// Largest request served by a single generate call.
pub const MAX_REQUEST: usize = 1024;

pub struct HmacDrbg {
    key: [u8; OUTPUT_LEN],
    v: [u8; OUTPUT_LEN],
    reseed_counter: u64,
    reseed_interval: u64,
}

impl HmacDrbg {
    /// Instantiate from `entropy`, mixing in `personalization`.
    pub fn new<E: RngCore + ?Sized>(entropy: &mut E, personalization: &[u8]) -> Result<Self> {
        let mut seed = [0; ENTROPY_LEN + NONCE_LEN];
        entropy.try_fill_bytes(&mut seed).map_err(|e| {
            warn!("Entropy source failed: {}", e);
            Error::Seed
        })?;
        Ok(Self::from_seed_material(&[&seed, personalization]))
    }

    /// Instantiate from caller-provided seed material, concatenated in order.
    pub fn from_seed_material(parts: &[&[u8]]) -> Self {
        let mut drbg = Self {
            key: [0x00; OUTPUT_LEN],
            v: [0x01; OUTPUT_LEN],
            reseed_counter: 1,
            reseed_interval: RESEED_INTERVAL,
        };
        drbg.update(parts);
        drbg
    }

    pub fn set_reseed_interval(&mut self, interval: u64) {
        self.reseed_interval = interval;
    }

    pub fn needs_reseed(&self) -> bool {
        self.reseed_counter > self.reseed_interval
    }

    pub fn reseed<E: RngCore + ?Sized>(
        &mut self,
        entropy: &mut E,
        additional: Option<&[u8]>,
    ) -> Result<()> {
        let mut fresh = [0; ENTROPY_LEN];
        entropy.try_fill_bytes(&mut fresh).map_err(|e| {
            warn!("Entropy source failed during reseed: {}", e);
            Error::Seed
        })?;
        self.update(&[&fresh, additional.unwrap_or_default()]);
        self.reseed_counter = 1;
        trace!("DRBG reseeded");
        Ok(())
    }

    /// Fill `out` with pseudo-random bytes.
    ///
    /// Fails with [`Error::Seed`] once the reseed interval is exhausted; the
    /// owner is expected to [`reseed`](Self::reseed) and retry.
    pub fn generate(&mut self, out: &mut [u8], additional: Option<&[u8]>) -> Result<()> {
        for chunk in out.chunks_mut(MAX_REQUEST) {
            if self.needs_reseed() {
                return Err(Error::Seed);
            }
            let additional = additional.unwrap_or_default();
            if !additional.is_empty() {
                self.update(&[additional]);
            }
            for block in chunk.chunks_mut(OUTPUT_LEN) {
                self.v = mac(&self.key, &[&self.v]);
                block.copy_from_slice(&self.v[..block.len()]);
            }
            self.update(&[additional]);
            self.reseed_counter += 1;
        }
        Ok(())
    }

    fn update(&mut self, provided: &[&[u8]]) {
        let empty = provided.iter().all(|part| part.is_empty());
        for round in [0x00u8, 0x01] {
            let mut input: Vec<&[u8]> = Vec::with_capacity(provided.len() + 2);
            input.push(&self.v);
            input.push(core::slice::from_ref(&round));
            input.extend_from_slice(provided);
            self.key = mac(&self.key, &input);
            self.v = mac(&self.key, &[&self.v]);
            if empty {
                break;
            }
        }
    }
}

impl core::fmt::Debug for HmacDrbg {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("HmacDrbg")
            .field("reseed_counter", &self.reseed_counter)
            .field("reseed_interval", &self.reseed_interval)
            .finish_non_exhaustive()
    }
}

fn mac(key: &[u8; OUTPUT_LEN], parts: &[&[u8]]) -> [u8; OUTPUT_LEN] {
    // HMAC zero pads short keys to the block size, so this is HMAC(key, ..).
    let mut block = [0u8; 64];
    block[..OUTPUT_LEN].copy_from_slice(key);
    let mut hmac = <HmacSha256 as KeyInit>::new(Key::<HmacSha256>::from_slice(&block));
    for part in parts {
        Mac::update(&mut hmac, part);
    }
    hmac.finalize().into_bytes().into()
}
