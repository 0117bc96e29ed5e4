/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

use hmac::{Hmac, Mac};
use rand::{rngs::OsRng, RngCore};
use sha1::Sha1;
use sha2::{Digest, Sha256, Sha384, Sha512};
use sm3::Sm3;

use crate::error::TpmError;
use crate::tpm_types::TPM_ALG_ID;

pub struct Crypto;

fn digest_with<D: Digest>(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = D::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

fn hmac_with<M: Mac + hmac::digest::KeyInit>(key: &[u8], data: &[u8]) -> Result<Vec<u8>, TpmError> {
    let mut mac = <M as hmac::digest::KeyInit>::new_from_slice(key)
        .map_err(|_| TpmError::InvalidParameter(format!("HMAC key of {} bytes", key.len())))?;
    mac.update(data);
    Ok(mac.finalize().into_bytes().to_vec())
}

impl Crypto {
    /// Digest size in bytes, or 0 for algorithms that are not hashes
    pub fn digest_size(alg: TPM_ALG_ID) -> usize {
        match alg {
            TPM_ALG_ID::SHA1 => 20,
            TPM_ALG_ID::SHA256 => 32,
            TPM_ALG_ID::SHA384 => 48,
            TPM_ALG_ID::SHA512 => 64,
            TPM_ALG_ID::SM3_256 => 32,
            _ => 0,
        }
    }

    pub fn is_hash_alg(alg: TPM_ALG_ID) -> bool {
        Self::digest_size(alg) != 0
    }

    pub fn hash(alg: TPM_ALG_ID, data: &[u8]) -> Result<Vec<u8>, TpmError> {
        Self::hash_parts(alg, &[data])
    }

    /// Hash the concatenation of `parts`
    pub fn hash_parts(alg: TPM_ALG_ID, parts: &[&[u8]]) -> Result<Vec<u8>, TpmError> {
        match alg {
            TPM_ALG_ID::SHA1 => Ok(digest_with::<Sha1>(parts)),
            TPM_ALG_ID::SHA256 => Ok(digest_with::<Sha256>(parts)),
            TPM_ALG_ID::SHA384 => Ok(digest_with::<Sha384>(parts)),
            TPM_ALG_ID::SHA512 => Ok(digest_with::<Sha512>(parts)),
            TPM_ALG_ID::SM3_256 => Ok(digest_with::<Sm3>(parts)),
            _ => Err(TpmError::NotSupported(format!("hash algorithm {:?}", alg))),
        }
    }

    pub fn hmac(hash_alg: TPM_ALG_ID, key: &[u8], to_hash: &[u8]) -> Result<Vec<u8>, TpmError> {
        match hash_alg {
            TPM_ALG_ID::SHA1 => hmac_with::<Hmac<Sha1>>(key, to_hash),
            TPM_ALG_ID::SHA256 => hmac_with::<Hmac<Sha256>>(key, to_hash),
            TPM_ALG_ID::SHA384 => hmac_with::<Hmac<Sha384>>(key, to_hash),
            TPM_ALG_ID::SHA512 => hmac_with::<Hmac<Sha512>>(key, to_hash),
            TPM_ALG_ID::SM3_256 => hmac_with::<Hmac<Sm3>>(key, to_hash),
            _ => Err(TpmError::NotSupported(format!("HMAC algorithm {:?}", hash_alg))),
        }
    }

    /// KDFa (TPM 2.0 Part 1, 11.4.10.2): HMAC counter mode over
    /// `counter || label || 0 || contextU || contextV || bits`
    pub fn kdfa(
        hash_alg: TPM_ALG_ID,
        key: &[u8],
        label: &str,
        context_u: &[u8],
        context_v: &[u8],
        bits: usize,
    ) -> Result<Vec<u8>, TpmError> {
        let bytes_needed = (bits + 7) / 8;
        let bits = u32::try_from(bits)
            .map_err(|_| TpmError::InvalidParameter(format!("KDFa output of {} bits", bits)))?;

        let mut result = Vec::with_capacity(bytes_needed);
        for counter in 1u32.. {
            if result.len() >= bytes_needed {
                break;
            }
            let block = [
                &counter.to_be_bytes()[..],
                label.as_bytes(),
                &[0u8],
                context_u,
                context_v,
                &bits.to_be_bytes(),
            ]
            .concat();
            result.extend_from_slice(&Self::hmac(hash_alg, key, &block)?);
        }

        result.truncate(bytes_needed);
        Ok(result)
    }

    pub fn get_random(num_bytes: usize) -> Vec<u8> {
        let mut result = vec![0u8; num_bytes];
        OsRng.fill_bytes(&mut result);
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hash_of_empty_input() {
        // SHA-256 of the empty string
        let digest = Crypto::hash(TPM_ALG_ID::SHA256, &[]).unwrap();
        assert_eq!(digest[..4], [0xE3, 0xB0, 0xC4, 0x42]);
        assert_eq!(digest.len(), 32);
    }

    #[test]
    fn test_digest_sizes() {
        for alg in [TPM_ALG_ID::SHA1, TPM_ALG_ID::SHA256, TPM_ALG_ID::SHA384, TPM_ALG_ID::SHA512, TPM_ALG_ID::SM3_256] {
            assert_eq!(Crypto::hash(alg, b"abc").unwrap().len(), Crypto::digest_size(alg));
        }
        assert!(Crypto::hash(TPM_ALG_ID::AES, b"abc").is_err());
    }

    #[test]
    fn test_hmac_rfc4231_case_2() {
        let mac = Crypto::hmac(TPM_ALG_ID::SHA256, b"Jefe", b"what do ya want for nothing?").unwrap();
        assert_eq!(mac[..4], [0x5B, 0xDC, 0xC1, 0x46]);
    }

    #[test]
    fn test_kdfa_length_and_determinism() {
        let a = Crypto::kdfa(TPM_ALG_ID::SHA256, b"key", "ATH", b"u", b"v", 520).unwrap();
        let b = Crypto::kdfa(TPM_ALG_ID::SHA256, b"key", "ATH", b"u", b"v", 520).unwrap();
        assert_eq!(a.len(), 65);
        assert_eq!(a, b);

        let c = Crypto::kdfa(TPM_ALG_ID::SHA256, b"key", "ATH", b"v", b"u", 520).unwrap();
        assert_ne!(a, c);
    }
}
