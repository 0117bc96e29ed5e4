/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Convenience methods on the generated-style TPM structures

use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm2_helpers::int_to_tpm;
use crate::tpm_structure::{TpmEnum, TpmStructure};
use crate::tpm_types::*;

/// Name of an entity described by a public area: `nameAlg || H(public)`
fn public_name<T: TpmStructure>(name_alg: TPM_ALG_ID, public: &T) -> Result<Vec<u8>, TpmError> {
    let mut name = int_to_tpm(name_alg.get_value());
    name.extend(Crypto::hash(name_alg, &public.toBytes()?)?);
    Ok(name)
}

impl TPMT_PUBLIC {
    pub fn get_name(&self) -> Result<Vec<u8>, TpmError> {
        public_name(self.nameAlg, self)
    }
}

impl TPMS_NV_PUBLIC {
    /// The index name; it changes whenever the attributes change (e.g. on first write)
    pub fn get_name(&self) -> Result<Vec<u8>, TpmError> {
        public_name(self.nameAlg, self)
    }
}

impl TPM_HANDLE {
    pub fn new(handle: u32) -> Self {
        TPM_HANDLE {
            handle,
            ..Default::default()
        }
    }

    /// PCR handle
    pub fn pcr(index: u32) -> Self {
        Self::new(index)
    }

    /// NV index handle
    pub fn nv(index: u32) -> Self {
        Self::new(((TPM_HT::NV_INDEX.0 as u32) << 24) | (index & 0x00FF_FFFF))
    }

    /// Persistent object handle
    pub fn persistent(index: u32) -> Self {
        Self::new(((TPM_HT::PERSISTENT.0 as u32) << 24) | (index & 0x00FF_FFFF))
    }

    pub fn get_type(&self) -> TPM_HT {
        TPM_HT((self.handle >> 24) as u8)
    }

    pub fn is_session(&self) -> bool {
        matches!(self.get_type(), TPM_HT::HMAC_SESSION | TPM_HT::POLICY_SESSION)
    }

    pub fn with_auth(mut self, auth_value: &[u8]) -> Self {
        self.auth_value = auth_value.to_vec();
        self
    }

    pub fn set_name(&mut self, name: Vec<u8>) {
        self.name = name;
    }

    /// Name of the entity for cpHash purposes. Entities without a public area
    /// (PCRs, permanent handles, sessions) are named by their handle.
    pub fn get_name(&self) -> Vec<u8> {
        if self.name.is_empty() {
            int_to_tpm(self.handle)
        } else {
            self.name.clone()
        }
    }
}

impl From<TPM_RH> for TPM_HANDLE {
    fn from(rh: TPM_RH) -> Self {
        TPM_HANDLE::new(rh.0)
    }
}

impl TPMS_PCR_SELECTION {
    /// Selection of `pcrs` in the `hash` bank, using the minimum three-octet bitmap
    pub fn new(hash: TPM_ALG_ID, pcrs: &[u32]) -> Self {
        let max = pcrs.iter().copied().max().unwrap_or(0) as usize;
        let mut select = vec![0u8; (max / 8 + 1).max(3)];
        for pcr in pcrs {
            select[*pcr as usize / 8] |= 1 << (pcr % 8);
        }
        TPMS_PCR_SELECTION {
            hash,
            pcrSelect: select,
        }
    }

    pub fn get_selected_pcrs(&self) -> Vec<u32> {
        (0..self.pcrSelect.len() as u32 * 8)
            .filter(|pcr| self.pcrSelect[*pcr as usize / 8] & (1 << (pcr % 8)) != 0)
            .collect()
    }
}
