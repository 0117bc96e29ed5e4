/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Authorization sessions: the caller-facing token and the per-session HMAC state

use derivative::Derivative;

use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm2_helpers::trim_trailing_zeros;
use crate::tpm_structure::TpmEnum;
use crate::tpm_types::*;

/// Authorization to attach to a command.
///
/// Either a password (PWAP) authorization or a reference to a session started
/// with `Tpm2::start_auth_session`. The token is cheap to clone; all rolling
/// session state lives inside the `Tpm2` instance.
#[derive(Clone, PartialEq, Eq, Derivative)]
#[derivative(Debug)]
pub struct Session {
    pub handle: TPM_HANDLE,
    pub attributes: TPMA_SESSION,
    #[derivative(Debug = "ignore")]
    password: Option<Vec<u8>>,
}

impl Session {
    pub(crate) fn new(handle: u32, attributes: TPMA_SESSION) -> Self {
        Session {
            handle: TPM_HANDLE::new(handle),
            attributes,
            password: None,
        }
    }

    /// Create a password authorization session (PWAP).
    ///
    /// With `None` the auth value of the authorized handle is used.
    pub fn pw(auth_value: Option<Vec<u8>>) -> Self {
        Session {
            handle: TPM_HANDLE::from(TPM_RH::PW),
            attributes: TPMA_SESSION::continueSession,
            password: auth_value,
        }
    }

    /// Check if this is a password authorization session
    pub fn is_pwap(&self) -> bool {
        self.handle.handle == TPM_RH::PW.get_value()
    }

    /// Password to send for `authorized`
    pub(crate) fn password_for(&self, authorized: &TPM_HANDLE) -> Vec<u8> {
        self.password
            .clone()
            .unwrap_or_else(|| authorized.auth_value.clone())
    }

    /// Ask the TPM to flush the session after its next use
    pub fn single_use(mut self) -> Self {
        self.attributes.remove(TPMA_SESSION::continueSession);
        self
    }

    pub fn with_attributes(mut self, attributes: TPMA_SESSION) -> Self {
        self.attributes = attributes;
        self
    }
}

/// Entity a session was bound to, as it was when the session started.
///
/// The TPM treats a later authorization as one for the bind entity only while
/// the entity still has this name and auth value.
#[derive(Clone, PartialEq, Eq, Derivative)]
#[derivative(Debug)]
pub struct BoundEntity {
    pub handle: u32,
    pub name: Vec<u8>,
    #[derivative(Debug = "ignore")]
    auth: Vec<u8>,
}

impl BoundEntity {
    pub fn new(entity: &TPM_HANDLE, name: Vec<u8>) -> Self {
        BoundEntity {
            handle: entity.handle,
            name,
            auth: trim_trailing_zeros(&entity.auth_value).to_vec(),
        }
    }

    pub fn matches(&self, entity: &TPM_HANDLE, name: &[u8]) -> bool {
        self.name == name && self.auth == trim_trailing_zeros(&entity.auth_value)
    }
}

/// Rolling state of an HMAC, policy or trial session
#[derive(Clone, Derivative)]
#[derivative(Debug)]
pub struct AuthSession {
    pub sess_in: TPMS_AUTH_COMMAND,
    pub sess_out: TPMS_AUTH_RESPONSE,

    pub hash_alg: TPM_ALG_ID,
    pub session_type: TPM_SE,

    #[derivative(Debug = "ignore")]
    session_key: Vec<u8>,

    pub bind: Option<BoundEntity>,

    /// Auth value that entered the last command HMAC; the response HMAC uses the same
    #[derivative(Debug = "ignore")]
    command_auth: Vec<u8>,

    /// PolicyAuthValue was asserted: the auth value enters the HMAC key
    pub needs_hmac: bool,

    /// PolicyPassword was asserted: the auth value is sent in clear
    pub needs_password: bool,
}

impl AuthSession {
    /// Build the state of a freshly started session and derive its session key.
    ///
    /// The key is `KDFa(hash, bindAuth, "ATH", nonceTPM, nonceCaller, digestBits)`;
    /// an unbound, unsalted session has an empty key.
    pub fn new(
        session_handle: u32,
        session_type: TPM_SE,
        hash_alg: TPM_ALG_ID,
        nonce_caller: &[u8],
        nonce_tpm: &[u8],
        bind: Option<BoundEntity>,
    ) -> Result<Self, TpmError> {
        let bind_auth = bind.as_ref().map(|b| b.auth.as_slice()).unwrap_or_default();
        let session_key = if bind_auth.is_empty() {
            Vec::new()
        } else {
            Crypto::kdfa(
                hash_alg,
                bind_auth,
                "ATH",
                nonce_tpm,
                nonce_caller,
                Crypto::digest_size(hash_alg) * 8,
            )?
        };

        Ok(AuthSession {
            sess_in: TPMS_AUTH_COMMAND::new(
                &TPM_HANDLE::new(session_handle),
                nonce_caller,
                TPMA_SESSION::continueSession,
                &[],
            ),
            sess_out: TPMS_AUTH_RESPONSE::new(nonce_tpm, TPMA_SESSION::continueSession, &[]),
            hash_alg,
            session_type,
            session_key,
            bind,
            command_auth: Vec::new(),
            needs_hmac: false,
            needs_password: false,
        })
    }

    pub fn handle(&self) -> u32 {
        self.sess_in.sessionHandle.handle
    }

    pub fn is_policy(&self) -> bool {
        self.session_type != TPM_SE::HMAC
    }

    pub fn nonce_size(&self) -> usize {
        Crypto::digest_size(self.hash_alg)
    }

    /// Start a new command: fresh caller nonce and the attributes to send
    pub fn roll_caller_nonce(&mut self, attributes: TPMA_SESSION) {
        self.sess_in.nonce = Crypto::get_random(self.nonce_size());
        self.sess_in.sessionAttributes = attributes;
    }

    /// Record the TPM's side of a completed exchange
    pub fn accept_response(&mut self, response: &TPMS_AUTH_RESPONSE) {
        self.sess_out = response.clone();
    }

    /// Policy sessions that have not asserted PolicyAuthValue/PolicyPassword and
    /// carry no session key authorize with an empty HMAC
    pub(crate) fn sends_empty_hmac(&self) -> bool {
        self.is_policy() && self.session_key.is_empty() && !self.needs_hmac
    }

    /// Auth value of `associated` (with its current `name`) that this session
    /// puts into the HMAC key, or sends in clear after PolicyPassword
    pub fn auth_value_for(&self, associated: Option<(&TPM_HANDLE, &[u8])>) -> Vec<u8> {
        let Some((entity, name)) = associated else {
            return Vec::new();
        };

        let include = if self.is_policy() {
            self.needs_hmac || self.needs_password
        } else {
            self.bind.as_ref().map_or(true, |bound| !bound.matches(entity, name))
        };

        if include {
            trim_trailing_zeros(&entity.auth_value).to_vec()
        } else {
            Vec::new()
        }
    }

    /// Fix the auth value for the command about to be sent and return its HMAC
    pub fn authorize_command(&mut self, cp_hash: &[u8], auth_value: Vec<u8>) -> Result<Vec<u8>, TpmError> {
        self.command_auth = auth_value;
        self.get_auth_hmac(cp_hash, true, &self.command_auth)
    }

    /// Response HMAC expected for the command last authorized
    pub fn expected_response_hmac(&self, rp_hash: &[u8]) -> Result<Vec<u8>, TpmError> {
        self.get_auth_hmac(rp_hash, false, &self.command_auth)
    }

    /// Compute the command (`is_command`) or response authorization HMAC.
    ///
    /// `p_hash` is the cpHash or rpHash in the session's hash algorithm and
    /// `auth_value` comes from `auth_value_for`.
    pub fn get_auth_hmac(&self, p_hash: &[u8], is_command: bool, auth_value: &[u8]) -> Result<Vec<u8>, TpmError> {
        if self.needs_password {
            // The response to a PolicyPassword authorization carries no HMAC
            return Ok(if is_command { auth_value.to_vec() } else { Vec::new() });
        }

        if is_command && self.sends_empty_hmac() {
            return Ok(Vec::new());
        }

        let (nonce_newer, nonce_older, attrs) = if is_command {
            (&self.sess_in.nonce, &self.sess_out.nonce, self.sess_in.sessionAttributes)
        } else {
            (&self.sess_out.nonce, &self.sess_in.nonce, self.sess_out.sessionAttributes)
        };

        let mut hmac_key = self.session_key.clone();
        hmac_key.extend_from_slice(auth_value);

        let mut buf_to_hmac = Vec::new();
        buf_to_hmac.extend_from_slice(p_hash);
        buf_to_hmac.extend_from_slice(nonce_newer);
        buf_to_hmac.extend_from_slice(nonce_older);
        buf_to_hmac.push(attrs.get_value());

        Crypto::hmac(self.hash_alg, &hmac_key, &buf_to_hmac)
    }

    /// Reset the policy flags (PolicyRestart)
    pub fn reset_policy(&mut self) {
        self.needs_hmac = false;
        self.needs_password = false;
    }
}
