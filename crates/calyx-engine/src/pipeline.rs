//! The layered transform pipeline.
//!
//! Three composites over the four [`LayerCrypto`](crate::hooks::LayerCrypto)
//! primitives:
//!
//! - [`Engine::encrypt_and_wrap`]: encrypt for the target hop, then apply
//!   wrap layers from the first hop up to and including the target.
//! - [`Engine::decrypt_and_unwrap`]: trial decryption along the candidate
//!   hops, peeling one cumulative unwrap layer per step, to recover both
//!   the plaintext and which hop produced it.
//! - [`Engine::rewrap`]: the per-hop re-keying every encrypted packet gets
//!   on arrival, so identical ciphertext never appears on two links.
//!
//! Every primitive's output length is checked against its contract; a
//! wrong-length buffer is treated exactly like a rejection.

use tracing::trace;

use calyx_types::{Address, SourceKey};

use crate::engine::Engine;
use crate::hooks::Rejected;

/// The outcome of successful trial decryption: recovered plaintext plus
/// the hop address whose key matched, identifying the true sender.
pub(crate) struct PeeledPayload {
    pub plaintext: Vec<u8>,
    pub target_address: Address,
}

impl Engine {
    /// Encrypt `plaintext` for `target_address`, then wrap once per hop
    /// from the near end of the path through the target, inclusive.
    ///
    /// Without an outgoing path for `key` (incoming-established segments,
    /// and responses built before confirmation), the peer itself is the
    /// only hop.
    pub(crate) async fn encrypt_and_wrap(
        &self,
        key: &SourceKey,
        target_address: &Address,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Rejected> {
        let hops: Vec<Address> = match self.table.outgoing_path(key) {
            Some(path) => path.to_vec(),
            None => vec![key.address.clone()],
        };

        let mut ciphertext = self
            .encrypt_checked(key, target_address, plaintext)
            .await?;
        for hop in &hops {
            ciphertext = self.wrap_checked(key, hop, &ciphertext).await?;
            if hop == target_address {
                break;
            }
        }
        Ok(ciphertext)
    }

    /// Trial-decrypt `ciphertext` along the candidate hops.
    ///
    /// The first candidate gets a direct decryption attempt; each further
    /// candidate first peels one more unwrap layer off the running
    /// ciphertext (layers accumulate, so hop N's payload sits under N-1
    /// wraps). A failed unwrap skips the candidate without consuming a
    /// layer; a failed decrypt just moves on. Errors only when every
    /// candidate is exhausted.
    pub(crate) async fn decrypt_and_unwrap(
        &self,
        key: &SourceKey,
        ciphertext: &[u8],
    ) -> Result<PeeledPayload, Rejected> {
        let candidates: Vec<Address> = match self.table.outgoing_path(key) {
            Some(path) => path.to_vec(),
            None => vec![key.address.clone()],
        };

        let mut current = ciphertext.to_vec();
        for (index, candidate) in candidates.iter().enumerate() {
            if index > 0 {
                match self.unwrap_checked(key, candidate, &current).await {
                    Ok(unwrapped) => current = unwrapped,
                    Err(Rejected) => continue,
                }
            }
            if let Ok(plaintext) = self.decrypt_checked(key, candidate, &current).await {
                return Ok(PeeledPayload {
                    plaintext,
                    target_address: candidate.clone(),
                });
            }
        }
        trace!(key = %key, "No candidate hop decrypted the payload");
        Err(Rejected)
    }

    /// Apply this node's per-hop re-keying to an arriving encrypted
    /// payload: endpoints peel their own layer (`unwrap` against the
    /// peer), a relay applies the paired segment's layer (`wrap` for the
    /// other side) before handing the bytes on.
    pub(crate) async fn rewrap(&self, key: &SourceKey, data: &[u8]) -> Result<Vec<u8>, Rejected> {
        if self.table.is_outgoing(key) || self.table.is_incoming(key) {
            self.unwrap_checked(key, &key.address, data).await
        } else if let Some(other) = self.table.forwarding_target(key) {
            let other = other.clone();
            self.wrap_checked(&other, &other.address, data).await
        } else {
            Err(Rejected)
        }
    }

    async fn encrypt_checked(
        &self,
        key: &SourceKey,
        target_address: &Address,
        plaintext: &[u8],
    ) -> Result<Vec<u8>, Rejected> {
        let ciphertext = self.crypto.encrypt(key, target_address, plaintext).await?;
        if ciphertext.len() != plaintext.len() + self.config.mac_length {
            trace!(key = %key, "Encrypt violated its length contract");
            return Err(Rejected);
        }
        Ok(ciphertext)
    }

    async fn decrypt_checked(
        &self,
        key: &SourceKey,
        target_address: &Address,
        ciphertext: &[u8],
    ) -> Result<Vec<u8>, Rejected> {
        let expected = ciphertext
            .len()
            .checked_sub(self.config.mac_length)
            .ok_or(Rejected)?;
        let plaintext = self.crypto.decrypt(key, target_address, ciphertext).await?;
        if plaintext.len() != expected {
            trace!(key = %key, "Decrypt violated its length contract");
            return Err(Rejected);
        }
        Ok(plaintext)
    }

    async fn wrap_checked(
        &self,
        key: &SourceKey,
        target_address: &Address,
        data: &[u8],
    ) -> Result<Vec<u8>, Rejected> {
        let wrapped = self.crypto.wrap(key, target_address, data).await?;
        if wrapped.len() != data.len() {
            trace!(key = %key, "Wrap violated its length contract");
            return Err(Rejected);
        }
        Ok(wrapped)
    }

    async fn unwrap_checked(
        &self,
        key: &SourceKey,
        target_address: &Address,
        data: &[u8],
    ) -> Result<Vec<u8>, Rejected> {
        let unwrapped = self.crypto.unwrap(key, target_address, data).await?;
        if unwrapped.len() != data.len() {
            trace!(key = %key, "Unwrap violated its length contract");
            return Err(Rejected);
        }
        Ok(unwrapped)
    }
}
