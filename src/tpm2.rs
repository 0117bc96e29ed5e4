/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Typed TPM 2.0 commands on top of the `Tpm2` command pipeline

pub use crate::tpm2_impl::{CallOptions, Tpm2, Tpm2Config, TpmCommand, TpmResponse};

use log::{debug, warn};

use crate::auth_session::{AuthSession, BoundEntity, Session};
use crate::crypto::Crypto;
use crate::error::{DecodeError, TpmError};
use crate::resource_manager::SlotKind;
use crate::tpm_buffer::{TpmBuffer, TpmMarshaller};
use crate::tpm_structure::TpmStructure;
use crate::tpm_types::*;

/// Outputs of TPM2_CreatePrimary
#[derive(Debug, Clone)]
pub struct CreatePrimaryResponse {
    /// Logical handle of the new object, carrying its name and auth value
    pub handle: TPM_HANDLE,
    pub out_public: TPMT_PUBLIC,
    /// Marshalled TPMS_CREATION_DATA
    pub creation_data: Vec<u8>,
    pub creation_hash: Vec<u8>,
    pub creation_ticket: TPMT_TK_CREATION,
    pub name: Vec<u8>,
}

/// Outputs of TPM2_PCR_Read
#[derive(Debug, Clone, Default)]
pub struct PcrReadResponse {
    pub pcr_update_counter: u32,
    pub pcr_selection_out: TPML_PCR_SELECTION,
    pub pcr_values: TPML_DIGEST,
}

/// Largest element count asked for in a single capability query
const MAX_CAPABILITY_COUNT: u32 = MAX_LIST_ITEMS as u32;

fn read_sized_struct<T: TpmStructure>(buf: &mut TpmBuffer) -> Result<T, TpmError> {
    buf.read_sized(|b| T::fromTpm(b))
}

impl Tpm2 {
    pub fn startup(&mut self, startup_type: TPM_SU) -> Result<(), TpmError> {
        let mut params = TpmBuffer::new(None);
        startup_type.toTpm(&mut params)?;
        self.run(TpmCommand::new(TPM_CC::Startup).params(params))?;
        self.refresh_capacities()
    }

    pub fn shutdown(&mut self, shutdown_type: TPM_SU) -> Result<(), TpmError> {
        let mut params = TpmBuffer::new(None);
        shutdown_type.toTpm(&mut params)?;
        self.run(TpmCommand::new(TPM_CC::Shutdown).params(params))?;
        Ok(())
    }

    pub fn get_random(&mut self, bytes_requested: u16) -> Result<Vec<u8>, TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_u16(bytes_requested);
        let mut resp = self.run(TpmCommand::new(TPM_CC::GetRandom).params(params))?;
        let random = resp.params.read_sized_bytes()?;
        resp.params.check_consumed()?;
        Ok(random)
    }

    pub fn stir_random(&mut self, in_data: &[u8]) -> Result<(), TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_sized_bytes(in_data)?;
        self.run(TpmCommand::new(TPM_CC::StirRandom).params(params))?;
        Ok(())
    }

    /// One TPM2_GetCapability round trip. Returns the `moreData` flag and the payload.
    ///
    /// Handle enumeration over the transient object and session ranges is answered
    /// from the resource manager, so it lists the logical handles callers hold.
    pub fn get_capability(
        &mut self,
        capability: TPM_CAP,
        property: u32,
        property_count: u32,
    ) -> Result<(bool, TPMS_CAPABILITY_DATA), TpmError> {
        if capability == TPM_CAP::HANDLES {
            if let Some(kind) = SlotKind::of_handle(property) {
                return Ok(self.virtual_handles(kind, property, property_count));
            }
        }

        let mut params = TpmBuffer::new(None);
        capability.toTpm(&mut params)?;
        params.write_u32(property);
        params.write_u32(property_count);

        let mut resp = self.run(TpmCommand::new(TPM_CC::GetCapability).params(params))?;
        let more_data = resp.params.read_u8()? != 0;
        let data = TPMS_CAPABILITY_DATA::fromTpm(&mut resp.params)?;
        resp.params.check_consumed()?;

        if data.capability() != capability {
            warn!("Asked for {:?}, TPM answered {:?}", capability, data.capability());
            return Err(DecodeError::InvalidUnion(data.capability().0).into());
        }
        Ok((more_data, data))
    }

    fn virtual_handles(&self, kind: SlotKind, property: u32, count: u32) -> (bool, TPMS_CAPABILITY_DATA) {
        let range = property & 0xFF00_0000;
        let matching: Vec<u32> = self
            .logical_handles(kind)
            .into_iter()
            .filter(|h| *h & 0xFF00_0000 == range && *h >= property)
            .collect();
        let more = matching.len() > count as usize;
        let handles = matching
            .into_iter()
            .take(count as usize)
            .map(TPM_HANDLE::new)
            .collect();

        (
            more,
            TPMS_CAPABILITY_DATA {
                data: TPMU_CAPABILITIES::handles(TPML_HANDLE::new(handles)),
            },
        )
    }

    /// Enumerate a capability in pages of `page_size`, starting at `property`,
    /// until the TPM reports no more data
    pub fn get_capability_paged(
        &mut self,
        capability: TPM_CAP,
        property: u32,
        page_size: u32,
    ) -> Result<TPMU_CAPABILITIES, TpmError> {
        let mut all = TPMU_CAPABILITIES::empty(capability)?;
        let mut next = property;

        loop {
            let (more, page) = self.get_capability(capability, next, page_size)?;
            let following = page.data.next_property();
            let page_len = page.data.len();
            all.append(page.data)?;

            if !more {
                break;
            }
            match following {
                Some(property) if page_len > 0 => next = property,
                // Nothing to continue from; the TPM flags more data it cannot page to
                _ => {
                    debug!("{:?} paging stopped after {} elements", capability, all.len());
                    break;
                }
            }
        }
        Ok(all)
    }

    pub fn get_capability_all(&mut self, capability: TPM_CAP, property: u32) -> Result<TPMU_CAPABILITIES, TpmError> {
        self.get_capability_paged(capability, property, MAX_CAPABILITY_COUNT)
    }

    /// Value of a fixed or variable TPM property
    pub fn get_tpm_property(&mut self, property: TPM_PT) -> Result<u32, TpmError> {
        let (_, data) = self.get_capability(TPM_CAP::TPM_PROPERTIES, property.0, 1)?;
        match data.data {
            TPMU_CAPABILITIES::tpmProperties(list) => list
                .tpmProperty
                .iter()
                .find(|p| p.property == property)
                .map(|p| p.value)
                .ok_or_else(|| TpmError::NotSupported(format!("TPM property {:?}", property))),
            _ => Err(TpmError::NotSupported(format!("TPM property {:?}", property))),
        }
    }

    /// Start an unbound, unsalted session
    pub fn start_auth_session(&mut self, session_type: TPM_SE, auth_hash: TPM_ALG_ID) -> Result<Session, TpmError> {
        self.start_auth_session_ex(None, session_type, &TPMT_SYM_DEF::null(), auth_hash)
    }

    /// Start a session, optionally bound to `bind`. Its auth value seeds the session key,
    /// and later authorizations of the same entity leave it out of the HMAC while the
    /// entity keeps the name and auth value it has now.
    pub fn start_auth_session_ex(
        &mut self,
        bind: Option<&TPM_HANDLE>,
        session_type: TPM_SE,
        symmetric: &TPMT_SYM_DEF,
        auth_hash: TPM_ALG_ID,
    ) -> Result<Session, TpmError> {
        if !Crypto::is_hash_alg(auth_hash) {
            return Err(TpmError::NotSupported(format!("session hash {:?}", auth_hash)));
        }
        let nonce_caller = Crypto::get_random(Crypto::digest_size(auth_hash));
        let null = TPM_HANDLE::from(TPM_RH::NULL);
        let bound = match bind {
            Some(entity) => Some(BoundEntity::new(entity, self.current_name(entity)?)),
            None => None,
        };

        let mut params = TpmBuffer::new(None);
        params.write_sized_bytes(&nonce_caller)?;
        params.write_sized_bytes(&[])?;
        session_type.toTpm(&mut params)?;
        symmetric.toTpm(&mut params)?;
        auth_hash.toTpm(&mut params)?;

        let cmd = TpmCommand::new(TPM_CC::StartAuthSession)
            .handle(&null)
            .handle(bind.unwrap_or(&null))
            .params(params);
        let mut resp = self.run(cmd)?;
        let nonce_tpm = resp.params.read_sized_bytes()?;
        resp.params.check_consumed()?;

        let handle = resp.handle.ok_or(TpmError::InvalidParameter(
            "StartAuthSession response without a handle".to_string(),
        ))?;
        let state = AuthSession::new(handle.handle, session_type, auth_hash, &nonce_caller, &nonce_tpm, bound)?;
        self.session_manager.register(state);

        debug!("Started {:?} session 0x{:08X}", session_type, handle.handle);
        Ok(Session::new(handle.handle, TPMA_SESSION::continueSession))
    }

    pub fn hash(
        &mut self,
        data: &[u8],
        hash_alg: TPM_ALG_ID,
        hierarchy: &TPM_HANDLE,
    ) -> Result<(Vec<u8>, TPMT_TK_HASHCHECK), TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_sized_bytes(data)?;
        hash_alg.toTpm(&mut params)?;
        hierarchy.toTpm(&mut params)?;

        let mut resp = self.run(TpmCommand::new(TPM_CC::Hash).params(params))?;
        let digest = resp.params.read_sized_bytes()?;
        let ticket = TPMT_TK_HASHCHECK::fromTpm(&mut resp.params)?;
        resp.params.check_consumed()?;
        Ok((digest, ticket))
    }

    /// Start a hash sequence. The returned handle carries `auth` for later use.
    pub fn hash_sequence_start(&mut self, auth: &[u8], hash_alg: TPM_ALG_ID) -> Result<TPM_HANDLE, TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_sized_bytes(auth)?;
        hash_alg.toTpm(&mut params)?;

        let resp = self.run(TpmCommand::new(TPM_CC::HashSequenceStart).params(params))?;
        resp.params.check_consumed()?;
        let handle = resp.handle.ok_or(TpmError::InvalidParameter(
            "HashSequenceStart response without a handle".to_string(),
        ))?;
        Ok(handle.with_auth(auth))
    }

    pub fn sequence_update(
        &mut self,
        sequence: &TPM_HANDLE,
        buffer: &[u8],
        sessions: &[Session],
    ) -> Result<(), TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_sized_bytes(buffer)?;
        self.run(
            TpmCommand::new(TPM_CC::SequenceUpdate)
                .handle(sequence)
                .params(params)
                .sessions(sessions),
        )?;
        Ok(())
    }

    /// Finish a hash sequence; the sequence object is gone afterwards
    pub fn sequence_complete(
        &mut self,
        sequence: &TPM_HANDLE,
        buffer: &[u8],
        hierarchy: &TPM_HANDLE,
        sessions: &[Session],
    ) -> Result<(Vec<u8>, TPMT_TK_HASHCHECK), TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_sized_bytes(buffer)?;
        hierarchy.toTpm(&mut params)?;

        let mut resp = self.run(
            TpmCommand::new(TPM_CC::SequenceComplete)
                .handle(sequence)
                .params(params)
                .sessions(sessions),
        )?;
        let result = resp.params.read_sized_bytes()?;
        let validation = TPMT_TK_HASHCHECK::fromTpm(&mut resp.params)?;
        resp.params.check_consumed()?;
        Ok((result, validation))
    }

    pub fn create_primary(
        &mut self,
        primary_handle: &TPM_HANDLE,
        in_sensitive: &TPMS_SENSITIVE_CREATE,
        in_public: &TPMT_PUBLIC,
        outside_info: &[u8],
        creation_pcr: &TPML_PCR_SELECTION,
        sessions: &[Session],
    ) -> Result<CreatePrimaryResponse, TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_sized(|b| in_sensitive.toTpm(b))?;
        params.write_sized(|b| in_public.toTpm(b))?;
        params.write_sized_bytes(outside_info)?;
        creation_pcr.toTpm(&mut params)?;

        let mut resp = self.run(
            TpmCommand::new(TPM_CC::CreatePrimary)
                .handle(primary_handle)
                .params(params)
                .sessions(sessions),
        )?;
        let out_public: TPMT_PUBLIC = read_sized_struct(&mut resp.params)?;
        let creation_data = resp.params.read_sized_bytes()?;
        let creation_hash = resp.params.read_sized_bytes()?;
        let creation_ticket = TPMT_TK_CREATION::fromTpm(&mut resp.params)?;
        let name = resp.params.read_sized_bytes()?;
        resp.params.check_consumed()?;

        let mut handle = resp
            .handle
            .ok_or(TpmError::InvalidParameter("CreatePrimary response without a handle".to_string()))?
            .with_auth(&in_sensitive.userAuth);
        handle.set_name(name.clone());
        self.object_names.insert(handle.handle, name.clone());

        Ok(CreatePrimaryResponse {
            handle,
            out_public,
            creation_data,
            creation_hash,
            creation_ticket,
            name,
        })
    }

    /// Public area, name and qualified name of a loaded object
    pub fn read_public(&mut self, object: &TPM_HANDLE) -> Result<(TPMT_PUBLIC, Vec<u8>, Vec<u8>), TpmError> {
        let mut resp = self.run(TpmCommand::new(TPM_CC::ReadPublic).handle(object))?;
        let out_public: TPMT_PUBLIC = read_sized_struct(&mut resp.params)?;
        let name = resp.params.read_sized_bytes()?;
        let qualified_name = resp.params.read_sized_bytes()?;
        resp.params.check_consumed()?;

        if self.resource_manager.contains(object.handle) {
            self.object_names.insert(object.handle, name.clone());
        }
        Ok((out_public, name, qualified_name))
    }

    pub fn nv_define_space(
        &mut self,
        auth_handle: &TPM_HANDLE,
        auth: &[u8],
        public_info: &TPMS_NV_PUBLIC,
        sessions: &[Session],
    ) -> Result<(), TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_sized_bytes(auth)?;
        params.write_sized(|b| public_info.toTpm(b))?;

        self.run(
            TpmCommand::new(TPM_CC::NV_DefineSpace)
                .handle(auth_handle)
                .params(params)
                .sessions(sessions),
        )?;
        self.nv_publics.insert(public_info.nvIndex.handle, public_info.clone());
        Ok(())
    }

    pub fn nv_undefine_space(
        &mut self,
        auth_handle: &TPM_HANDLE,
        nv_index: &TPM_HANDLE,
        sessions: &[Session],
    ) -> Result<(), TpmError> {
        self.run(
            TpmCommand::new(TPM_CC::NV_UndefineSpace)
                .handle(auth_handle)
                .handle(nv_index)
                .sessions(sessions),
        )?;
        self.nv_publics.remove(&nv_index.handle);
        Ok(())
    }

    /// The first write to an index sets TPMA_NV_WRITTEN, which changes its name
    fn mark_nv_written(&mut self, nv_index: &TPM_HANDLE) {
        if let Some(public) = self.nv_publics.get_mut(&nv_index.handle) {
            public.attributes |= TPMA_NV::WRITTEN;
        }
    }

    pub fn nv_increment(
        &mut self,
        auth_handle: &TPM_HANDLE,
        nv_index: &TPM_HANDLE,
        sessions: &[Session],
    ) -> Result<(), TpmError> {
        self.run(
            TpmCommand::new(TPM_CC::NV_Increment)
                .handle(auth_handle)
                .handle(nv_index)
                .sessions(sessions),
        )?;
        self.mark_nv_written(nv_index);
        Ok(())
    }

    pub fn nv_write(
        &mut self,
        auth_handle: &TPM_HANDLE,
        nv_index: &TPM_HANDLE,
        data: &[u8],
        offset: u16,
        sessions: &[Session],
    ) -> Result<(), TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_sized_bytes(data)?;
        params.write_u16(offset);

        self.run(
            TpmCommand::new(TPM_CC::NV_Write)
                .handle(auth_handle)
                .handle(nv_index)
                .params(params)
                .sessions(sessions),
        )?;
        self.mark_nv_written(nv_index);
        Ok(())
    }

    pub fn nv_read(
        &mut self,
        auth_handle: &TPM_HANDLE,
        nv_index: &TPM_HANDLE,
        size: u16,
        offset: u16,
        sessions: &[Session],
    ) -> Result<Vec<u8>, TpmError> {
        let mut params = TpmBuffer::new(None);
        params.write_u16(size);
        params.write_u16(offset);

        let mut resp = self.run(
            TpmCommand::new(TPM_CC::NV_Read)
                .handle(auth_handle)
                .handle(nv_index)
                .params(params)
                .sessions(sessions),
        )?;
        let data = resp.params.read_sized_bytes()?;
        resp.params.check_consumed()?;
        Ok(data)
    }

    /// Read an NV counter index as its 64-bit value
    pub fn nv_read_counter(
        &mut self,
        auth_handle: &TPM_HANDLE,
        nv_index: &TPM_HANDLE,
        sessions: &[Session],
    ) -> Result<u64, TpmError> {
        let data = self.nv_read(auth_handle, nv_index, 8, 0, sessions)?;
        let bytes: [u8; 8] = data.as_slice().try_into().map_err(|_| {
            TpmError::InvalidParameter(format!("counter read returned {} bytes", data.len()))
        })?;
        Ok(u64::from_be_bytes(bytes))
    }

    /// Public area and name of an NV index; both are cached for later authorizations
    pub fn nv_read_public(&mut self, nv_index: &TPM_HANDLE) -> Result<(TPMS_NV_PUBLIC, Vec<u8>), TpmError> {
        let mut resp = self.run(TpmCommand::new(TPM_CC::NV_ReadPublic).handle(nv_index))?;
        let public: TPMS_NV_PUBLIC = read_sized_struct(&mut resp.params)?;
        let name = resp.params.read_sized_bytes()?;
        resp.params.check_consumed()?;

        self.nv_publics.insert(nv_index.handle, public.clone());
        Ok((public, name))
    }

    pub fn pcr_read(&mut self, pcr_selection_in: &TPML_PCR_SELECTION) -> Result<PcrReadResponse, TpmError> {
        let mut params = TpmBuffer::new(None);
        pcr_selection_in.toTpm(&mut params)?;

        let mut resp = self.run(TpmCommand::new(TPM_CC::PCR_Read).params(params))?;
        let out = PcrReadResponse {
            pcr_update_counter: resp.params.read_u32()?,
            pcr_selection_out: TPML_PCR_SELECTION::fromTpm(&mut resp.params)?,
            pcr_values: TPML_DIGEST::fromTpm(&mut resp.params)?,
        };
        resp.params.check_consumed()?;
        Ok(out)
    }

    pub fn pcr_extend(
        &mut self,
        pcr: &TPM_HANDLE,
        digests: &TPML_DIGEST_VALUES,
        sessions: &[Session],
    ) -> Result<(), TpmError> {
        let mut params = TpmBuffer::new(None);
        digests.toTpm(&mut params)?;
        self.run(
            TpmCommand::new(TPM_CC::PCR_Extend)
                .handle(pcr)
                .params(params)
                .sessions(sessions),
        )?;
        Ok(())
    }

    pub fn pcr_reset(&mut self, pcr: &TPM_HANDLE, sessions: &[Session]) -> Result<(), TpmError> {
        self.run(TpmCommand::new(TPM_CC::PCR_Reset).handle(pcr).sessions(sessions))?;
        Ok(())
    }

    fn policy_state(&mut self, session: &Session) -> Result<&mut AuthSession, TpmError> {
        let handle = session.handle.handle;
        if self.session_manager.is_expired(handle) {
            return Err(TpmError::ExpiredSession(handle));
        }
        match self.session_manager.get_mut(handle) {
            Some(state) if state.is_policy() => Ok(state),
            Some(_) => Err(TpmError::InvalidParameter(format!(
                "session 0x{:08X} is not a policy session",
                handle
            ))),
            None => Err(TpmError::InvalidHandle(handle)),
        }
    }

    fn policy_command(&mut self, code: TPM_CC, session: &Session, params: TpmBuffer) -> Result<TpmResponse, TpmError> {
        self.policy_state(session)?;
        self.run(TpmCommand::new(code).handle(&session.handle).params(params))
    }

    pub fn policy_command_code(&mut self, session: &Session, code: TPM_CC) -> Result<(), TpmError> {
        let mut params = TpmBuffer::new(None);
        code.toTpm(&mut params)?;
        self.policy_command(TPM_CC::PolicyCommandCode, session, params)?;
        Ok(())
    }

    pub fn policy_locality(&mut self, session: &Session, locality: TPMA_LOCALITY) -> Result<(), TpmError> {
        let mut params = TpmBuffer::new(None);
        locality.toTpm(&mut params)?;
        self.policy_command(TPM_CC::PolicyLocality, session, params)?;
        Ok(())
    }

    /// After this the session's HMAC includes the auth value of the authorized entity
    pub fn policy_auth_value(&mut self, session: &Session) -> Result<(), TpmError> {
        self.policy_command(TPM_CC::PolicyAuthValue, session, TpmBuffer::new(None))?;
        self.policy_state(session)?.needs_hmac = true;
        Ok(())
    }

    /// After this the session carries the auth value in clear
    pub fn policy_password(&mut self, session: &Session) -> Result<(), TpmError> {
        self.policy_command(TPM_CC::PolicyPassword, session, TpmBuffer::new(None))?;
        self.policy_state(session)?.needs_password = true;
        Ok(())
    }

    pub fn policy_restart(&mut self, session: &Session) -> Result<(), TpmError> {
        self.policy_command(TPM_CC::PolicyRestart, session, TpmBuffer::new(None))?;
        self.policy_state(session)?.reset_policy();
        Ok(())
    }

    pub fn policy_get_digest(&mut self, session: &Session) -> Result<Vec<u8>, TpmError> {
        let mut resp = self.policy_command(TPM_CC::PolicyGetDigest, session, TpmBuffer::new(None))?;
        let digest = resp.params.read_sized_bytes()?;
        resp.params.check_consumed()?;
        Ok(digest)
    }
}
