/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Policy tree infrastructure for declarative TPM 2.0 policy composition.
//!
//! A `PolicyTree` holds an ordered list of policy assertions. The tree can
//! compute the policy digest in software (the value to put in an entity's
//! `authPolicy`) or be executed against a live policy session on the TPM.

use crate::auth_session::Session;
use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm2_impl::Tpm2;
use crate::tpm_structure::TpmEnum;
use crate::tpm_types::*;

/// Trait implemented by all policy assertion types.
pub trait PolicyAssertion {
    /// Extend a policy digest accumulator the way the TPM does when the assertion executes
    fn update_policy_digest(&self, hash_alg: TPM_ALG_ID, accumulator: &mut Vec<u8>) -> Result<(), TpmError>;

    /// Execute this policy assertion against a live TPM policy session.
    fn execute(&self, tpm: &mut Tpm2, session: &Session) -> Result<(), TpmError>;
}

/// `policyDigest = H(policyDigest || commandCode || arg2)`
fn policy_update(
    hash_alg: TPM_ALG_ID,
    accumulator: &mut Vec<u8>,
    command_code: TPM_CC,
    arg2: &[u8],
) -> Result<(), TpmError> {
    *accumulator = Crypto::hash_parts(
        hash_alg,
        &[accumulator.as_slice(), &command_code.get_value().to_be_bytes(), arg2],
    )?;
    Ok(())
}

/// Ordered list of policy assertions
#[derive(Default)]
pub struct PolicyTree {
    assertions: Vec<Box<dyn PolicyAssertion>>,
}

impl PolicyTree {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append an assertion. Assertions execute in the order they were added.
    pub fn add(mut self, assertion: impl PolicyAssertion + 'static) -> Self {
        self.assertions.push(Box::new(assertion));
        self
    }

    pub fn len(&self) -> usize {
        self.assertions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.assertions.is_empty()
    }

    /// Compute the policy digest in software (equivalent to a trial session).
    pub fn get_policy_digest(&self, hash_alg: TPM_ALG_ID) -> Result<Vec<u8>, TpmError> {
        if !Crypto::is_hash_alg(hash_alg) {
            return Err(TpmError::NotSupported(format!("policy hash {:?}", hash_alg)));
        }
        let mut accumulator = vec![0u8; Crypto::digest_size(hash_alg)];
        for assertion in &self.assertions {
            assertion.update_policy_digest(hash_alg, &mut accumulator)?;
        }
        Ok(accumulator)
    }

    /// Execute all assertions in order against a policy session
    pub fn execute(&self, tpm: &mut Tpm2, session: &Session) -> Result<(), TpmError> {
        for assertion in &self.assertions {
            assertion.execute(tpm, session)?;
        }
        Ok(())
    }
}

/// PolicyCommandCode: limits the authorized action to a specific command.
pub struct PolicyCommandCode {
    pub command_code: TPM_CC,
}

impl PolicyCommandCode {
    pub fn new(command_code: TPM_CC) -> Self {
        Self { command_code }
    }
}

impl PolicyAssertion for PolicyCommandCode {
    fn update_policy_digest(&self, hash_alg: TPM_ALG_ID, acc: &mut Vec<u8>) -> Result<(), TpmError> {
        policy_update(
            hash_alg,
            acc,
            TPM_CC::PolicyCommandCode,
            &self.command_code.get_value().to_be_bytes(),
        )
    }

    fn execute(&self, tpm: &mut Tpm2, session: &Session) -> Result<(), TpmError> {
        tpm.policy_command_code(session, self.command_code)
    }
}

/// PolicyLocality: limits authorization to the selected localities.
pub struct PolicyLocality {
    pub locality: TPMA_LOCALITY,
}

impl PolicyLocality {
    pub fn new(locality: TPMA_LOCALITY) -> Self {
        Self { locality }
    }
}

impl PolicyAssertion for PolicyLocality {
    fn update_policy_digest(&self, hash_alg: TPM_ALG_ID, acc: &mut Vec<u8>) -> Result<(), TpmError> {
        policy_update(hash_alg, acc, TPM_CC::PolicyLocality, &[self.locality.get_value()])
    }

    fn execute(&self, tpm: &mut Tpm2, session: &Session) -> Result<(), TpmError> {
        tpm.policy_locality(session, self.locality)
    }
}

/// PolicyPassword: the auth value is presented in clear in the policy session.
#[derive(Default)]
pub struct PolicyPassword;

impl PolicyPassword {
    pub fn new() -> Self {
        Self
    }
}

impl PolicyAssertion for PolicyPassword {
    fn update_policy_digest(&self, hash_alg: TPM_ALG_ID, acc: &mut Vec<u8>) -> Result<(), TpmError> {
        // Same digest as PolicyAuthValue
        policy_update(hash_alg, acc, TPM_CC::PolicyAuthValue, &[])
    }

    fn execute(&self, tpm: &mut Tpm2, session: &Session) -> Result<(), TpmError> {
        tpm.policy_password(session)
    }
}

/// PolicyAuthValue: requires an auth-value HMAC during policy use.
#[derive(Default)]
pub struct PolicyAuthValue;

impl PolicyAuthValue {
    pub fn new() -> Self {
        Self
    }
}

impl PolicyAssertion for PolicyAuthValue {
    fn update_policy_digest(&self, hash_alg: TPM_ALG_ID, acc: &mut Vec<u8>) -> Result<(), TpmError> {
        policy_update(hash_alg, acc, TPM_CC::PolicyAuthValue, &[])
    }

    fn execute(&self, tpm: &mut Tpm2, session: &Session) -> Result<(), TpmError> {
        tpm.policy_auth_value(session)
    }
}
