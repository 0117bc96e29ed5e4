/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Per-command authorization: building the command auth area and checking the response one

use std::collections::{HashMap, HashSet};

use log::{trace, warn};

use crate::auth_session::{AuthSession, Session};
use crate::crypto::Crypto;
use crate::error::TpmError;
use crate::tpm_types::*;

/// Maximum number of sessions a single command may carry
pub const MAX_SESSIONS: usize = 3;

/// Inputs to the command and response parameter hashes
pub struct HashInputs<'a> {
    pub command: TPM_CC,
    /// Names of the handles in the handle area
    pub names: &'a [Vec<u8>],
    pub params: &'a [u8],
}

#[derive(Debug, Default)]
pub struct SessionManager {
    sessions: HashMap<u32, AuthSession>,
    expired: HashSet<u32>,
}

fn cp_hash(alg: TPM_ALG_ID, inputs: &HashInputs) -> Result<Vec<u8>, TpmError> {
    let mut data = inputs.command.0.to_be_bytes().to_vec();
    for name in inputs.names {
        data.extend_from_slice(name);
    }
    data.extend_from_slice(inputs.params);
    Crypto::hash(alg, &data)
}

fn rp_hash(alg: TPM_ALG_ID, command: TPM_CC, rp_params: &[u8]) -> Result<Vec<u8>, TpmError> {
    // Only successful responses carry authorizations, so the response code is always zero
    Crypto::hash_parts(alg, &[&0u32.to_be_bytes(), &command.0.to_be_bytes(), rp_params])
}

impl SessionManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, session: AuthSession) {
        self.expired.remove(&session.handle());
        self.sessions.insert(session.handle(), session);
    }

    pub fn get(&self, handle: u32) -> Option<&AuthSession> {
        self.sessions.get(&handle)
    }

    pub fn get_mut(&mut self, handle: u32) -> Option<&mut AuthSession> {
        self.sessions.get_mut(&handle)
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    /// Drop a session the caller flushed, along with any record of its expiry
    pub fn forget(&mut self, handle: u32) {
        self.sessions.remove(&handle);
        self.expired.remove(&handle);
    }

    /// Drop a session the TPM ended because it was not continued
    pub fn expire(&mut self, handle: u32) {
        if self.sessions.remove(&handle).is_some() {
            self.expired.insert(handle);
        }
    }

    pub fn is_expired(&self, handle: u32) -> bool {
        self.expired.contains(&handle)
    }

    pub fn expired_count(&self) -> usize {
        self.expired.len()
    }

    /// Validate the session list of a command before anything is sent
    pub fn check_usable(&self, sessions: &[Session], num_auth_handles: usize) -> Result<(), TpmError> {
        if sessions.len() > MAX_SESSIONS {
            return Err(TpmError::InvalidParameter(format!(
                "{} sessions supplied, at most {} allowed",
                sessions.len(),
                MAX_SESSIONS
            )));
        }
        if !sessions.is_empty() && sessions.len() < num_auth_handles {
            return Err(TpmError::InvalidParameter(format!(
                "command needs {} authorizations, {} sessions supplied",
                num_auth_handles,
                sessions.len()
            )));
        }

        for (i, session) in sessions.iter().enumerate() {
            if session.is_pwap() {
                if i >= num_auth_handles {
                    return Err(TpmError::InvalidParameter(
                        "password sessions can only authorize handles".to_string(),
                    ));
                }
                continue;
            }
            let handle = session.handle.handle;
            if self.expired.contains(&handle) {
                return Err(TpmError::ExpiredSession(handle));
            }
            if !self.sessions.contains_key(&handle) {
                return Err(TpmError::InvalidHandle(handle));
            }
        }
        Ok(())
    }

    /// Build the authorization area. `auth_handles` are the handles that need
    /// authorization, in handle-area order, and their names lead `inputs.names`.
    /// Extra sessions authorize nothing.
    pub fn build_command_auths(
        &mut self,
        inputs: &HashInputs,
        auth_handles: &[TPM_HANDLE],
        sessions: &[Session],
    ) -> Result<Vec<TPMS_AUTH_COMMAND>, TpmError> {
        let mut auths = Vec::with_capacity(sessions.len());

        for (i, session) in sessions.iter().enumerate() {
            let associated = auth_handles.get(i);

            if session.is_pwap() {
                let password = associated.map(|h| session.password_for(h)).unwrap_or_default();
                auths.push(TPMS_AUTH_COMMAND::new(
                    &session.handle,
                    &[],
                    TPMA_SESSION::continueSession,
                    &password,
                ));
                continue;
            }

            let state = self
                .sessions
                .get_mut(&session.handle.handle)
                .ok_or(TpmError::InvalidHandle(session.handle.handle))?;

            state.roll_caller_nonce(session.attributes);
            let p_hash = cp_hash(state.hash_alg, inputs)?;
            let name = inputs.names.get(i).map(Vec::as_slice).unwrap_or_default();
            let auth_value = state.auth_value_for(associated.map(|h| (h, name)));
            state.sess_in.hmac = state.authorize_command(&p_hash, auth_value)?;

            trace!(
                "Session 0x{:08X} authorizes {:?} for {}",
                state.handle(),
                associated.map(|h| h.handle),
                inputs.command
            );
            auths.push(state.sess_in.clone());
        }

        Ok(auths)
    }

    /// Check the response authorizations, then roll nonces and retire sessions
    /// that were not continued. Each HMAC is keyed with the auth value chosen
    /// when the command was authorized, even if the command changed the entity.
    ///
    /// Returns the handles of sessions the TPM has ended.
    pub fn validate_response_auths(
        &mut self,
        command: TPM_CC,
        rp_params: &[u8],
        sessions: &[Session],
        auths: &[TPMS_AUTH_RESPONSE],
    ) -> Result<Vec<u32>, TpmError> {
        let mut ended = Vec::new();

        for (session, response) in sessions.iter().zip(auths) {
            if session.is_pwap() {
                if !response.hmac.is_empty() {
                    return Err(TpmError::AuthValidation {
                        command,
                        session: session.handle.handle,
                    });
                }
                continue;
            }

            let handle = session.handle.handle;
            let state = self.sessions.get_mut(&handle).ok_or(TpmError::InvalidHandle(handle))?;
            state.accept_response(response);

            let p_hash = rp_hash(state.hash_alg, command, rp_params)?;
            let expected = state.expected_response_hmac(&p_hash)?;
            let empty_allowed = response.hmac.is_empty() && state.sends_empty_hmac();
            if expected != response.hmac && !empty_allowed {
                warn!("Response HMAC mismatch for session 0x{:08X} on {}", handle, command);
                return Err(TpmError::AuthValidation {
                    command,
                    session: handle,
                });
            }

            // A policy session that authorized a command starts over
            if state.is_policy() {
                state.reset_policy();
            }

            if !response.sessionAttributes.contains(TPMA_SESSION::continueSession) {
                ended.push(handle);
            }
        }

        for handle in &ended {
            self.expire(*handle);
        }
        Ok(ended)
    }
}
