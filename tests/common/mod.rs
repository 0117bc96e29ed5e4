/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! In-process TPM used by the integration tests.
//!
//! Implements enough of TPM 2.0 to exercise the command layer end to end:
//! bounded object and session slots, context save/load with integrity checked
//! blobs, HMAC/policy/password authorization, NV indices, PCRs and hashing.
//! Session HMACs are computed here with `hmac`/`sha2` directly so the client's
//! own crypto is checked against an independent implementation.

#![allow(dead_code)]

use std::cell::RefCell;
use std::collections::{BTreeMap, HashMap};
use std::rc::Rc;

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use tss_rm::device::{ConnInfo, TpmDevice};
use tss_rm::error::TpmError;
use tss_rm::tpm2::Tpm2;
use tss_rm::tpm_buffer::{TpmBuffer, TpmMarshaller};
use tss_rm::tpm_structure::{supported_commands, CommandInfo, TpmStructure};
use tss_rm::tpm_types::*;

pub const OWNER_AUTH: &[u8] = b"";
const PCR_COUNT: usize = 24;
const FIRST_TRANSIENT: u32 = 0x8000_0000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Mock with the given slot counts, wrapped in a connected and started `Tpm2`
pub fn started_tpm(max_objects: usize, max_sessions: usize) -> (MockTpm, Tpm2) {
    init_logging();
    let mock = MockTpm::new(max_objects, max_sessions);
    let mut tpm = Tpm2::new(Box::new(mock.clone()));
    tpm.connect().expect("connect");
    tpm.startup(TPM_SU::CLEAR).expect("startup");
    (mock, tpm)
}

pub fn sha256(parts: &[&[u8]]) -> Vec<u8> {
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    hasher.finalize().to_vec()
}

pub fn hmac_sha256(key: &[u8], parts: &[&[u8]]) -> Vec<u8> {
    let mut mac = <Hmac<Sha256> as Mac>::new_from_slice(key).expect("any key length");
    for part in parts {
        mac.update(part);
    }
    mac.finalize().into_bytes().to_vec()
}

/// KDFa with SHA-256 for whole-digest outputs
fn kdfa_sha256(key: &[u8], label: &str, context_u: &[u8], context_v: &[u8]) -> Vec<u8> {
    let mut label_z = label.as_bytes().to_vec();
    label_z.push(0);
    hmac_sha256(
        key,
        &[&1u32.to_be_bytes(), &label_z, context_u, context_v, &256u32.to_be_bytes()],
    )
}

fn trimmed(value: &[u8]) -> &[u8] {
    let len = value.iter().rposition(|b| *b != 0).map_or(0, |p| p + 1);
    &value[..len]
}

fn insufficient(_: TpmError) -> TPM_RC {
    TPM_RC::INSUFFICIENT
}

/// A command as the mock saw it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoggedCommand {
    pub code: TPM_CC,
    pub locality: u8,
    pub physical_presence: bool,
    pub response_code: TPM_RC,
}

#[derive(Debug, Clone)]
enum ObjectKind {
    Primary { public: Vec<u8> },
    HashSequence { data: Vec<u8> },
}

#[derive(Debug, Clone)]
struct MockObject {
    auth: Vec<u8>,
    name: Vec<u8>,
    kind: ObjectKind,
}

#[derive(Debug, Clone)]
struct MockSession {
    session_type: TPM_SE,
    nonce_tpm: Vec<u8>,
    session_key: Vec<u8>,
    /// Name and auth value of the bind entity when the session started
    bind: Option<(Vec<u8>, Vec<u8>)>,
    policy_digest: Vec<u8>,
    needs_hmac: bool,
    needs_password: bool,
    command_code: Option<TPM_CC>,
    locality: Option<TPMA_LOCALITY>,
}

impl MockSession {
    fn reset_policy(&mut self) {
        self.policy_digest = vec![0; 32];
        self.needs_hmac = false;
        self.needs_password = false;
        self.command_code = None;
        self.locality = None;
    }

    fn extend_policy(&mut self, code: TPM_CC, arg: &[u8]) {
        self.policy_digest = sha256(&[&self.policy_digest, &code.0.to_be_bytes(), arg]);
    }

    /// HMAC key for authorizing an entity with the given current name and auth value.
    /// An HMAC session leaves the auth value out only while the entity still has
    /// the name and auth value it had when the session was bound to it.
    fn hmac_key(&self, entity: Option<(&[u8], &[u8])>) -> Vec<u8> {
        let mut key = self.session_key.clone();
        if let Some((name, auth)) = entity {
            let include = match self.session_type {
                TPM_SE::HMAC => self
                    .bind
                    .as_ref()
                    .map_or(true, |(bound_name, bound_auth)| {
                        bound_name.as_slice() != name || trimmed(bound_auth) != trimmed(auth)
                    }),
                _ => self.needs_hmac,
            };
            if include {
                key.extend_from_slice(trimmed(auth));
            }
        }
        key
    }
}

#[derive(Debug, Clone)]
struct MockNv {
    public: TPMS_NV_PUBLIC,
    auth: Vec<u8>,
    data: Vec<u8>,
}

impl MockNv {
    fn name(&self) -> Vec<u8> {
        let bytes = self.public.toBytes().expect("NV public marshals");
        let mut name = TPM_ALG_ID::SHA256.0.to_be_bytes().to_vec();
        name.extend(sha256(&[&bytes]));
        name
    }

    fn is_counter(&self) -> bool {
        self.public.attributes.nv_type() == 1
    }
}

#[derive(Debug, Clone)]
enum SavedEntity {
    Object(MockObject),
    Session(u32, MockSession),
}

/// Authorization data gathered while checking a command's sessions
struct PendingAuth {
    /// HMAC key fixed while checking the command; the response uses it unchanged
    key: Vec<u8>,
    nonce_caller: Vec<u8>,
    attributes: TPMA_SESSION,
}

struct Reply {
    handle: Option<u32>,
    params: TpmBuffer,
}

impl Reply {
    fn empty() -> Self {
        Reply {
            handle: None,
            params: TpmBuffer::new(None),
        }
    }

    fn with_params(params: TpmBuffer) -> Self {
        Reply { handle: None, params }
    }
}

pub struct MockTpmState {
    started: bool,
    max_objects: usize,
    max_sessions: usize,
    report_capacities: bool,
    max_capability_count: usize,
    answer_capability_as: Option<TPM_CAP>,

    objects: BTreeMap<u32, MockObject>,
    sessions: BTreeMap<u32, MockSession>,
    saved_sessions: BTreeMap<u32, u64>,
    saved: HashMap<u64, SavedEntity>,
    context_sequence: u64,
    context_key: Vec<u8>,
    next_session: u32,

    nv: BTreeMap<u32, MockNv>,
    pcrs: Vec<Vec<u8>>,
    pcr_update_counter: u32,

    locality: u8,
    physical_presence: bool,
    pending: Option<Vec<u8>>,
    corrupt_next_response_hmac: bool,
    drop_next_response: bool,
    log: Vec<LoggedCommand>,
}

/// Shared handle to the mock; the test keeps one clone, the `Tpm2` another
#[derive(Clone)]
pub struct MockTpm {
    state: Rc<RefCell<MockTpmState>>,
}

impl MockTpm {
    pub fn new(max_objects: usize, max_sessions: usize) -> Self {
        MockTpm {
            state: Rc::new(RefCell::new(MockTpmState {
                started: false,
                max_objects,
                max_sessions,
                report_capacities: true,
                max_capability_count: 64,
                answer_capability_as: None,
                objects: BTreeMap::new(),
                sessions: BTreeMap::new(),
                saved_sessions: BTreeMap::new(),
                saved: HashMap::new(),
                context_sequence: 0,
                context_key: vec![0x5A; 32],
                next_session: 0,
                nv: BTreeMap::new(),
                pcrs: vec![vec![0; 32]; PCR_COUNT],
                pcr_update_counter: 0,
                locality: 0,
                physical_presence: false,
                pending: None,
                corrupt_next_response_hmac: false,
                drop_next_response: false,
                log: Vec::new(),
            })),
        }
    }

    /// Leave the slot capacity properties out of TPM_CAP_TPM_PROPERTIES
    pub fn hide_capacities(&self) {
        self.state.borrow_mut().report_capacities = false;
    }

    /// Most elements the mock returns from one GetCapability
    pub fn set_max_capability_count(&self, count: usize) {
        self.state.borrow_mut().max_capability_count = count;
    }

    /// Answer every GetCapability with data of `capability`, whatever was asked
    pub fn answer_capability_as(&self, capability: Option<TPM_CAP>) {
        self.state.borrow_mut().answer_capability_as = capability;
    }

    pub fn corrupt_next_response_hmac(&self) {
        self.state.borrow_mut().corrupt_next_response_hmac = true;
    }

    /// The next command executes but its response is lost in transport
    pub fn drop_next_response(&self) {
        self.state.borrow_mut().drop_next_response = true;
    }

    /// Change the context integrity key: every saved context stops loading
    pub fn forget_contexts(&self) {
        let mut state = self.state.borrow_mut();
        state.context_key = sha256(&[&state.context_key]);
    }

    pub fn loaded_objects(&self) -> usize {
        self.state.borrow().objects.len()
    }

    pub fn loaded_sessions(&self) -> usize {
        self.state.borrow().sessions.len()
    }

    /// Sessions the TPM still tracks, loaded or saved
    pub fn active_sessions(&self) -> usize {
        let state = self.state.borrow();
        state.sessions.len() + state.saved_sessions.len()
    }

    pub fn log(&self) -> Vec<LoggedCommand> {
        self.state.borrow().log.clone()
    }

    pub fn count(&self, code: TPM_CC) -> usize {
        self.state.borrow().log.iter().filter(|c| c.code == code).count()
    }

    pub fn clear_log(&self) {
        self.state.borrow_mut().log.clear();
    }

    pub fn last_command(&self) -> Option<LoggedCommand> {
        self.state.borrow().log.last().cloned()
    }
}

impl TpmDevice for MockTpm {
    fn connect(&mut self) -> Result<(), TpmError> {
        Ok(())
    }

    fn close(&mut self) {}

    fn dispatch_command(&mut self, cmd_buf: &[u8]) -> Result<(), TpmError> {
        let mut state = self.state.borrow_mut();
        let response = state.process(cmd_buf);
        if state.drop_next_response {
            state.drop_next_response = false;
            state.pending = None;
        } else {
            state.pending = Some(response);
        }
        Ok(())
    }

    fn get_response(&mut self) -> Result<Vec<u8>, TpmError> {
        self.state
            .borrow_mut()
            .pending
            .take()
            .ok_or_else(|| TpmError::Transport("connection reset by mock TPM".to_string()))
    }

    fn conn_info(&self) -> ConnInfo {
        ConnInfo::PLATFORM_AVAILABLE | ConnInfo::SUPPORTS_PP
    }

    fn power_ctl(&mut self, on: bool) -> Result<(), TpmError> {
        if !on {
            self.state.borrow_mut().power_off();
        }
        Ok(())
    }

    fn assert_physical_presence(&mut self, on: bool) -> Result<(), TpmError> {
        self.state.borrow_mut().physical_presence = on;
        Ok(())
    }

    fn set_locality(&mut self, locality: u8) -> Result<(), TpmError> {
        self.state.borrow_mut().locality = locality;
        Ok(())
    }
}

fn error_response(rc: TPM_RC) -> Vec<u8> {
    let mut buf = TpmBuffer::new(None);
    buf.write_u16(TPM_ST::NO_SESSIONS.0);
    buf.write_u32(10);
    buf.write_u32(rc.0);
    buf.into_vec()
}

impl MockTpmState {
    fn power_off(&mut self) {
        self.started = false;
        self.objects.clear();
        self.sessions.clear();
        self.saved_sessions.clear();
        self.saved.clear();
        self.context_key = sha256(&[&self.context_key, b"reset"]);
        self.pcrs = vec![vec![0; 32]; PCR_COUNT];
    }

    fn process(&mut self, cmd: &[u8]) -> Vec<u8> {
        let mut buf = TpmBuffer::from_bytes(cmd);
        let header = (|| -> Result<(u16, u32, u32), TpmError> {
            Ok((buf.read_u16()?, buf.read_u32()?, buf.read_u32()?))
        })();
        let Ok((tag, size, code)) = header else {
            return error_response(TPM_RC::COMMAND_SIZE);
        };
        let code = TPM_CC(code);

        let (response, rc) = if size as usize != cmd.len() {
            (error_response(TPM_RC::COMMAND_SIZE), TPM_RC::COMMAND_SIZE)
        } else {
            match self.execute(TPM_ST(tag), code, &mut buf) {
                Ok(response) => (response, TPM_RC::SUCCESS),
                Err(rc) => (error_response(rc), rc),
            }
        };

        self.log.push(LoggedCommand {
            code,
            locality: self.locality,
            physical_presence: self.physical_presence,
            response_code: rc,
        });
        response
    }

    fn execute(&mut self, tag: TPM_ST, code: TPM_CC, buf: &mut TpmBuffer) -> Result<Vec<u8>, TPM_RC> {
        if !self.started && code != TPM_CC::Startup {
            return Err(TPM_RC::INITIALIZE);
        }
        let info = CommandInfo::lookup(code).ok_or(TPM_RC::COMMAND_CODE)?;
        let (num_handles, num_auth) = (info.num_handles, info.num_auth_handles);

        let mut handles = Vec::with_capacity(num_handles);
        for i in 0..num_handles {
            let handle = buf.read_u32().map_err(insufficient)?;
            self.check_handle(code, handle, i)?;
            handles.push(handle);
        }

        let auths = match tag {
            TPM_ST::SESSIONS => {
                let auth_size = buf.read_u32().map_err(insufficient)? as usize;
                let end = buf.cur_pos() + auth_size;
                let mut auths = Vec::new();
                while buf.cur_pos() < end {
                    auths.push(TPMS_AUTH_COMMAND::fromTpm(buf).map_err(|_| TPM_RC::AUTHSIZE)?);
                }
                if buf.cur_pos() != end || auths.is_empty() || auths.len() > 3 {
                    return Err(TPM_RC::AUTHSIZE);
                }
                auths
            }
            TPM_ST::NO_SESSIONS => Vec::new(),
            _ => return Err(TPM_RC::BAD_TAG),
        };
        if auths.len() < num_auth {
            return Err(TPM_RC::AUTH_MISSING);
        }

        let params = buf.read_bytes(buf.remaining()).map_err(insufficient)?;
        let mut names = Vec::new();
        for handle in &handles {
            names.extend(self.name_of(*handle));
        }
        let cp_hash = sha256(&[&code.0.to_be_bytes(), &names, &params]);
        let pending = self.authorize(code, &handles, num_auth, &auths, &cp_hash)?;

        let mut params_buf = TpmBuffer::from_bytes(&params);
        let reply = self.run(code, &handles, &mut params_buf)?;
        if params_buf.remaining() != 0 {
            return Err(TPM_RC::SIZE);
        }

        let response_auths = self.finish_sessions(code, &auths, &pending, reply.params.trim());
        Ok(self.success_response(reply, response_auths))
    }

    fn check_handle(&self, code: TPM_CC, handle: u32, index: usize) -> Result<(), TPM_RC> {
        let bad = TPM_RC::HANDLE.with_handle(index as u32 + 1);
        match TPM_HT((handle >> 24) as u8) {
            TPM_HT::TRANSIENT if !self.objects.contains_key(&handle) => Err(bad),
            TPM_HT::HMAC_SESSION | TPM_HT::POLICY_SESSION if !self.sessions.contains_key(&handle) => Err(bad),
            TPM_HT::NV_INDEX if !self.nv.contains_key(&handle) && code != TPM_CC::NV_DefineSpace => Err(bad),
            TPM_HT::PCR if handle as usize >= PCR_COUNT => Err(bad),
            TPM_HT::PERSISTENT => Err(bad),
            _ => Ok(()),
        }
    }

    fn name_of(&self, handle: u32) -> Vec<u8> {
        if let Some(nv) = self.nv.get(&handle) {
            return nv.name();
        }
        match self.objects.get(&handle) {
            Some(MockObject {
                kind: ObjectKind::Primary { .. },
                name,
                ..
            }) => name.clone(),
            _ => handle.to_be_bytes().to_vec(),
        }
    }

    /// Auth value and authPolicy of an entity
    fn entity_auth(&self, handle: u32) -> (Vec<u8>, Vec<u8>) {
        if let Some(nv) = self.nv.get(&handle) {
            return (nv.auth.clone(), nv.public.authPolicy.clone());
        }
        if let Some(object) = self.objects.get(&handle) {
            return (object.auth.clone(), Vec::new());
        }
        match TPM_RH(handle) {
            TPM_RH::OWNER | TPM_RH::ENDORSEMENT | TPM_RH::PLATFORM | TPM_RH::LOCKOUT => {
                (OWNER_AUTH.to_vec(), Vec::new())
            }
            _ => (Vec::new(), Vec::new()),
        }
    }

    fn authorize(
        &self,
        code: TPM_CC,
        handles: &[u32],
        num_auth: usize,
        auths: &[TPMS_AUTH_COMMAND],
        cp_hash: &[u8],
    ) -> Result<Vec<PendingAuth>, TPM_RC> {
        let mut pending = Vec::with_capacity(auths.len());

        for (i, auth) in auths.iter().enumerate() {
            let session_index = i as u32 + 1;
            let associated = handles.get(i).copied().filter(|_| i < num_auth);
            let (entity_auth, auth_policy) = associated.map(|h| self.entity_auth(h)).unwrap_or_default();
            let mut key = Vec::new();

            if auth.sessionHandle.handle == TPM_RH::PW.0 {
                if associated.is_none() || !auth.nonce.is_empty() {
                    return Err(TPM_RC::AUTH_TYPE.with_session(session_index));
                }
                if trimmed(&auth.hmac) != trimmed(&entity_auth) {
                    return Err(TPM_RC::AUTH_FAIL.with_session(session_index));
                }
            } else {
                let session = self
                    .sessions
                    .get(&auth.sessionHandle.handle)
                    .ok_or(TPM_RC::VALUE.with_session(session_index))?;

                if session.session_type == TPM_SE::TRIAL {
                    return Err(TPM_RC::AUTH_TYPE.with_session(session_index));
                }
                if session.session_type == TPM_SE::POLICY && associated.is_some() {
                    if session.policy_digest != auth_policy {
                        return Err(TPM_RC::POLICY_FAIL.with_session(session_index));
                    }
                    if session.command_code.is_some_and(|cc| cc != code) {
                        return Err(TPM_RC::POLICY_CC.with_session(session_index));
                    }
                    if let Some(allowed) = session.locality {
                        if !allowed.contains(TPMA_LOCALITY(1 << self.locality)) {
                            return Err(TPM_RC::LOCALITY);
                        }
                    }
                }

                if session.needs_password {
                    if trimmed(&auth.hmac) != trimmed(&entity_auth) {
                        return Err(TPM_RC::AUTH_FAIL.with_session(session_index));
                    }
                } else {
                    let name = associated.map(|h| self.name_of(h)).unwrap_or_default();
                    key = session.hmac_key(associated.map(|_| (name.as_slice(), entity_auth.as_slice())));
                    let empty_allowed = session.session_type == TPM_SE::POLICY && key.is_empty();
                    if !(empty_allowed && auth.hmac.is_empty()) {
                        let expected = hmac_sha256(
                            &key,
                            &[
                                cp_hash,
                                &auth.nonce,
                                &session.nonce_tpm,
                                &[auth.sessionAttributes.0],
                            ],
                        );
                        if expected != auth.hmac {
                            return Err(TPM_RC::AUTH_FAIL.with_session(session_index));
                        }
                    }
                }
            }

            pending.push(PendingAuth {
                key,
                nonce_caller: auth.nonce.clone(),
                attributes: auth.sessionAttributes,
            });
        }
        Ok(pending)
    }

    /// Roll nonces, compute response HMACs and retire discontinued sessions
    fn finish_sessions(
        &mut self,
        code: TPM_CC,
        auths: &[TPMS_AUTH_COMMAND],
        pending: &[PendingAuth],
        rp_params: &[u8],
    ) -> Vec<TPMS_AUTH_RESPONSE> {
        let rp_hash = sha256(&[&0u32.to_be_bytes(), &code.0.to_be_bytes(), rp_params]);
        let mut responses = Vec::with_capacity(auths.len());

        for (auth, info) in auths.iter().zip(pending) {
            let handle = auth.sessionHandle.handle;
            let Some(session) = self.sessions.get_mut(&handle) else {
                responses.push(TPMS_AUTH_RESPONSE::new(&[], TPMA_SESSION::continueSession, &[]));
                continue;
            };

            session.nonce_tpm = tss_rm::crypto::Crypto::get_random(32);
            let hmac = if session.needs_password {
                Vec::new()
            } else {
                hmac_sha256(
                    &info.key,
                    &[&rp_hash, &session.nonce_tpm, &info.nonce_caller, &[info.attributes.0]],
                )
            };
            responses.push(TPMS_AUTH_RESPONSE::new(&session.nonce_tpm, info.attributes, &hmac));

            if session.session_type == TPM_SE::POLICY {
                session.reset_policy();
            }
            if !info.attributes.contains(TPMA_SESSION::continueSession) {
                self.sessions.remove(&handle);
            }
        }

        if self.corrupt_next_response_hmac {
            if let Some(response) = responses.iter_mut().find(|r| !r.hmac.is_empty()) {
                self.corrupt_next_response_hmac = false;
                response.hmac[0] ^= 0xFF;
            }
        }
        responses
    }

    fn success_response(&self, reply: Reply, auths: Vec<TPMS_AUTH_RESPONSE>) -> Vec<u8> {
        let mut buf = TpmBuffer::new(None);
        let tag = if auths.is_empty() {
            TPM_ST::NO_SESSIONS
        } else {
            TPM_ST::SESSIONS
        };
        buf.write_u16(tag.0);
        buf.write_u32(0);
        buf.write_u32(TPM_RC::SUCCESS.0);
        if let Some(handle) = reply.handle {
            buf.write_u32(handle);
        }
        let params = reply.params.trim();
        if !auths.is_empty() {
            buf.write_u32(params.len() as u32);
        }
        buf.write_bytes(params);
        for auth in &auths {
            auth.toTpm(&mut buf).expect("auth response marshals");
        }
        let size = buf.len() as u32;
        buf.patch_u32(2, size);
        buf.into_vec()
    }

    fn run(&mut self, code: TPM_CC, handles: &[u32], params: &mut TpmBuffer) -> Result<Reply, TPM_RC> {
        match code {
            TPM_CC::Startup => {
                let _startup_type = params.read_u16().map_err(insufficient)?;
                if self.started {
                    return Err(TPM_RC::INITIALIZE);
                }
                self.started = true;
                Ok(Reply::empty())
            }
            TPM_CC::Shutdown => {
                params.read_u16().map_err(insufficient)?;
                Ok(Reply::empty())
            }
            TPM_CC::GetRandom => {
                let requested = params.read_u16().map_err(insufficient)? as usize;
                let mut out = TpmBuffer::new(None);
                out.write_sized_bytes(&tss_rm::crypto::Crypto::get_random(requested.min(32)))
                    .map_err(insufficient)?;
                Ok(Reply::with_params(out))
            }
            TPM_CC::StirRandom => {
                params.read_sized_bytes().map_err(insufficient)?;
                Ok(Reply::empty())
            }
            TPM_CC::GetCapability => self.get_capability(params),
            TPM_CC::StartAuthSession => self.start_auth_session(handles, params),
            TPM_CC::FlushContext => {
                let handle = params.read_u32().map_err(insufficient)?;
                let found = self.objects.remove(&handle).is_some()
                    || self.sessions.remove(&handle).is_some()
                    || self.saved_sessions.remove(&handle).is_some();
                if !found {
                    return Err(TPM_RC::HANDLE.with_parameter(1));
                }
                Ok(Reply::empty())
            }
            TPM_CC::ContextSave => self.context_save(handles[0]),
            TPM_CC::ContextLoad => self.context_load(params),
            TPM_CC::Hash => {
                let data = params.read_sized_bytes().map_err(insufficient)?;
                let alg = params.read_u16().map_err(insufficient)?;
                let hierarchy = params.read_u32().map_err(insufficient)?;
                if TPM_ALG_ID(alg) != TPM_ALG_ID::SHA256 {
                    return Err(TPM_RC::HASH.with_parameter(2));
                }
                Ok(Reply::with_params(digest_with_ticket(&sha256(&[&data]), hierarchy)))
            }
            TPM_CC::HashSequenceStart => {
                let auth = params.read_sized_bytes().map_err(insufficient)?;
                let alg = params.read_u16().map_err(insufficient)?;
                if TPM_ALG_ID(alg) != TPM_ALG_ID::SHA256 {
                    return Err(TPM_RC::HASH.with_parameter(2));
                }
                let handle = self.create_object(MockObject {
                    auth,
                    name: Vec::new(),
                    kind: ObjectKind::HashSequence { data: Vec::new() },
                })?;
                Ok(Reply {
                    handle: Some(handle),
                    params: TpmBuffer::new(None),
                })
            }
            TPM_CC::SequenceUpdate => {
                let chunk = params.read_sized_bytes().map_err(insufficient)?;
                match self.objects.get_mut(&handles[0]) {
                    Some(MockObject {
                        kind: ObjectKind::HashSequence { data },
                        ..
                    }) => data.extend(chunk),
                    _ => return Err(TPM_RC::MODE.with_handle(1)),
                }
                Ok(Reply::empty())
            }
            TPM_CC::SequenceComplete => {
                let chunk = params.read_sized_bytes().map_err(insufficient)?;
                let hierarchy = params.read_u32().map_err(insufficient)?;
                let Some(ObjectKind::HashSequence { mut data }) =
                    self.objects.get(&handles[0]).map(|o| o.kind.clone())
                else {
                    return Err(TPM_RC::MODE.with_handle(1));
                };
                data.extend(chunk);
                self.objects.remove(&handles[0]);
                Ok(Reply::with_params(digest_with_ticket(&sha256(&[&data]), hierarchy)))
            }
            TPM_CC::CreatePrimary => self.create_primary(handles[0], params),
            TPM_CC::ReadPublic => match self.objects.get(&handles[0]) {
                Some(MockObject {
                    kind: ObjectKind::Primary { public },
                    name,
                    ..
                }) => {
                    let mut out = TpmBuffer::new(None);
                    out.write_sized_bytes(public).map_err(insufficient)?;
                    out.write_sized_bytes(name).map_err(insufficient)?;
                    out.write_sized_bytes(name).map_err(insufficient)?;
                    Ok(Reply::with_params(out))
                }
                _ => Err(TPM_RC::SEQUENCE),
            },
            TPM_CC::NV_DefineSpace => {
                let auth = params.read_sized_bytes().map_err(insufficient)?;
                let public: TPMS_NV_PUBLIC = params.read_sized(|b| TPMS_NV_PUBLIC::fromTpm(b)).map_err(insufficient)?;
                let index = public.nvIndex.handle;
                if self.nv.contains_key(&index) {
                    return Err(TPM_RC::NV_DEFINED);
                }
                if public.attributes.contains(TPMA_NV::WRITTEN) {
                    return Err(TPM_RC::ATTRIBUTES.with_parameter(2));
                }
                self.nv.insert(
                    index,
                    MockNv {
                        data: vec![0; public.dataSize as usize],
                        public,
                        auth,
                    },
                );
                Ok(Reply::empty())
            }
            TPM_CC::NV_UndefineSpace => {
                self.nv.remove(&handles[1]);
                Ok(Reply::empty())
            }
            TPM_CC::NV_Increment => {
                let nv = self.nv.get_mut(&handles[1]).ok_or(TPM_RC::HANDLE.with_handle(2))?;
                if !nv.is_counter() {
                    return Err(TPM_RC::ATTRIBUTES.with_handle(2));
                }
                let mut value = [0u8; 8];
                value.copy_from_slice(&nv.data[..8]);
                let next = u64::from_be_bytes(value) + 1;
                nv.data = next.to_be_bytes().to_vec();
                nv.public.attributes |= TPMA_NV::WRITTEN;
                Ok(Reply::empty())
            }
            TPM_CC::NV_Write => {
                let data = params.read_sized_bytes().map_err(insufficient)?;
                let offset = params.read_u16().map_err(insufficient)? as usize;
                let nv = self.nv.get_mut(&handles[1]).ok_or(TPM_RC::HANDLE.with_handle(2))?;
                if nv.is_counter() {
                    return Err(TPM_RC::ATTRIBUTES.with_handle(2));
                }
                if offset + data.len() > nv.data.len() {
                    return Err(TPM_RC::NV_RANGE);
                }
                nv.data[offset..offset + data.len()].copy_from_slice(&data);
                nv.public.attributes |= TPMA_NV::WRITTEN;
                Ok(Reply::empty())
            }
            TPM_CC::NV_Read => {
                let size = params.read_u16().map_err(insufficient)? as usize;
                let offset = params.read_u16().map_err(insufficient)? as usize;
                let nv = self.nv.get(&handles[1]).ok_or(TPM_RC::HANDLE.with_handle(2))?;
                if !nv.public.attributes.contains(TPMA_NV::WRITTEN) {
                    return Err(TPM_RC::NV_UNINITIALIZED);
                }
                if offset + size > nv.data.len() {
                    return Err(TPM_RC::NV_RANGE);
                }
                let mut out = TpmBuffer::new(None);
                out.write_sized_bytes(&nv.data[offset..offset + size]).map_err(insufficient)?;
                Ok(Reply::with_params(out))
            }
            TPM_CC::NV_ReadPublic => {
                let nv = self.nv.get(&handles[0]).ok_or(TPM_RC::HANDLE.with_handle(1))?;
                let mut out = TpmBuffer::new(None);
                out.write_sized(|b| nv.public.toTpm(b)).map_err(insufficient)?;
                out.write_sized_bytes(&nv.name()).map_err(insufficient)?;
                Ok(Reply::with_params(out))
            }
            TPM_CC::PCR_Read => self.pcr_read(params),
            TPM_CC::PCR_Extend => {
                let digests = TPML_DIGEST_VALUES::fromTpm(params).map_err(insufficient)?;
                let index = handles[0] as usize;
                for ha in digests.digests.iter().filter(|d| d.hashAlg == TPM_ALG_ID::SHA256) {
                    self.pcrs[index] = sha256(&[&self.pcrs[index], &ha.digest]);
                }
                self.pcr_update_counter += 1;
                Ok(Reply::empty())
            }
            TPM_CC::PCR_Reset => {
                let index = handles[0] as usize;
                if index < 16 {
                    return Err(TPM_RC::LOCALITY);
                }
                self.pcrs[index] = vec![0; 32];
                self.pcr_update_counter += 1;
                Ok(Reply::empty())
            }
            _ => self.policy_command(code, handles[0], params),
        }
    }

    fn create_object(&mut self, object: MockObject) -> Result<u32, TPM_RC> {
        if self.objects.len() >= self.max_objects {
            return Err(TPM_RC::OBJECT_MEMORY);
        }
        let handle = (FIRST_TRANSIENT..)
            .find(|h| !self.objects.contains_key(h))
            .ok_or(TPM_RC::OBJECT_HANDLES)?;
        self.objects.insert(handle, object);
        Ok(handle)
    }

    fn create_primary(&mut self, hierarchy: u32, params: &mut TpmBuffer) -> Result<Reply, TPM_RC> {
        let sensitive: TPMS_SENSITIVE_CREATE =
            params.read_sized(|b| TPMS_SENSITIVE_CREATE::fromTpm(b)).map_err(insufficient)?;
        let public = params.read_sized_bytes().map_err(insufficient)?;
        let _outside_info = params.read_sized_bytes().map_err(insufficient)?;
        let _creation_pcr = TPML_PCR_SELECTION::fromTpm(params).map_err(insufficient)?;

        let mut name = TPM_ALG_ID::SHA256.0.to_be_bytes().to_vec();
        name.extend(sha256(&[&public]));

        let handle = self.create_object(MockObject {
            auth: sensitive.userAuth,
            name: name.clone(),
            kind: ObjectKind::Primary { public: public.clone() },
        })?;

        let creation_data = hierarchy.to_be_bytes().to_vec();
        let mut out = TpmBuffer::new(None);
        out.write_sized_bytes(&public).map_err(insufficient)?;
        out.write_sized_bytes(&creation_data).map_err(insufficient)?;
        out.write_sized_bytes(&sha256(&[&creation_data])).map_err(insufficient)?;
        out.write_u16(TPM_ST::CREATION.0);
        out.write_u32(hierarchy);
        out.write_sized_bytes(&sha256(&[&name, &creation_data])).map_err(insufficient)?;
        out.write_sized_bytes(&name).map_err(insufficient)?;
        Ok(Reply {
            handle: Some(handle),
            params: out,
        })
    }

    fn start_auth_session(&mut self, handles: &[u32], params: &mut TpmBuffer) -> Result<Reply, TPM_RC> {
        let nonce_caller = params.read_sized_bytes().map_err(insufficient)?;
        let salt = params.read_sized_bytes().map_err(insufficient)?;
        let session_type = TPM_SE(params.read_u8().map_err(insufficient)?);
        let _symmetric = TPMT_SYM_DEF::fromTpm(params).map_err(insufficient)?;
        let auth_hash = TPM_ALG_ID(params.read_u16().map_err(insufficient)?);

        if handles[0] != TPM_RH::NULL.0 || !salt.is_empty() {
            return Err(TPM_RC::VALUE.with_handle(1));
        }
        if auth_hash != TPM_ALG_ID::SHA256 {
            return Err(TPM_RC::HASH.with_parameter(5));
        }
        if nonce_caller.len() < 16 {
            return Err(TPM_RC::SIZE.with_parameter(1));
        }
        let type_byte = match session_type {
            TPM_SE::HMAC => TPM_HT::HMAC_SESSION.0,
            TPM_SE::POLICY | TPM_SE::TRIAL => TPM_HT::POLICY_SESSION.0,
            _ => return Err(TPM_RC::VALUE.with_parameter(3)),
        };
        if self.sessions.len() >= self.max_sessions {
            return Err(TPM_RC::SESSION_MEMORY);
        }

        let bind = (handles[1] != TPM_RH::NULL.0)
            .then(|| (self.name_of(handles[1]), self.entity_auth(handles[1]).0));
        let bind_auth = bind.as_ref().map(|(_, auth)| auth.clone()).unwrap_or_default();
        let nonce_tpm = tss_rm::crypto::Crypto::get_random(32);
        let session_key = if trimmed(&bind_auth).is_empty() {
            Vec::new()
        } else {
            kdfa_sha256(trimmed(&bind_auth), "ATH", &nonce_tpm, &nonce_caller)
        };

        self.next_session += 1;
        let handle = ((type_byte as u32) << 24) | self.next_session;
        self.sessions.insert(
            handle,
            MockSession {
                session_type,
                nonce_tpm: nonce_tpm.clone(),
                session_key,
                bind,
                policy_digest: vec![0; 32],
                needs_hmac: false,
                needs_password: false,
                command_code: None,
                locality: None,
            },
        );

        let mut out = TpmBuffer::new(None);
        out.write_sized_bytes(&nonce_tpm).map_err(insufficient)?;
        Ok(Reply {
            handle: Some(handle),
            params: out,
        })
    }

    fn context_blob(&self, sequence: u64, handle: u32) -> Vec<u8> {
        let mut blob = sequence.to_be_bytes().to_vec();
        blob.extend(hmac_sha256(&self.context_key, &[&sequence.to_be_bytes(), &handle.to_be_bytes()]));
        blob
    }

    fn context_save(&mut self, handle: u32) -> Result<Reply, TPM_RC> {
        self.context_sequence += 1;
        let sequence = self.context_sequence;

        if let Some(object) = self.objects.get(&handle) {
            self.saved.insert(sequence, SavedEntity::Object(object.clone()));
        } else if let Some(session) = self.sessions.remove(&handle) {
            self.saved.insert(sequence, SavedEntity::Session(handle, session));
            self.saved_sessions.insert(handle, sequence);
        } else {
            return Err(TPM_RC::HANDLE.with_handle(1));
        }

        let context = TPMS_CONTEXT {
            sequence,
            savedHandle: TPM_HANDLE::new(handle),
            hierarchy: TPM_HANDLE::new(TPM_RH::NULL.0),
            contextBlob: self.context_blob(sequence, handle),
        };
        let mut out = TpmBuffer::new(None);
        context.toTpm(&mut out).map_err(insufficient)?;
        Ok(Reply::with_params(out))
    }

    fn context_load(&mut self, params: &mut TpmBuffer) -> Result<Reply, TPM_RC> {
        let context = TPMS_CONTEXT::fromTpm(params).map_err(insufficient)?;
        let integrity = TPM_RC::INTEGRITY.with_parameter(1);
        if context.contextBlob != self.context_blob(context.sequence, context.savedHandle.handle) {
            return Err(integrity);
        }

        match self.saved.get(&context.sequence).cloned() {
            Some(SavedEntity::Object(object)) => {
                let handle = self.create_object(object)?;
                Ok(Reply {
                    handle: Some(handle),
                    params: TpmBuffer::new(None),
                })
            }
            Some(SavedEntity::Session(handle, session)) => {
                if self.saved_sessions.get(&handle) != Some(&context.sequence) {
                    return Err(integrity);
                }
                if self.sessions.len() >= self.max_sessions {
                    return Err(TPM_RC::SESSION_MEMORY);
                }
                self.saved.remove(&context.sequence);
                self.saved_sessions.remove(&handle);
                self.sessions.insert(handle, session);
                Ok(Reply {
                    handle: Some(handle),
                    params: TpmBuffer::new(None),
                })
            }
            None => Err(integrity),
        }
    }

    fn properties(&self) -> Vec<(TPM_PT, u32)> {
        let mut properties = vec![
            (TPM_PT::FAMILY_INDICATOR, 0x322E_3000),
            (TPM_PT::LEVEL, 0),
            (TPM_PT::REVISION, 164),
            (TPM_PT::DAY_OF_YEAR, 1),
            (TPM_PT::YEAR, 2024),
            (TPM_PT::MANUFACTURER, 0x4D53_4654),
            (TPM_PT::INPUT_BUFFER, 1024),
            (TPM_PT::HR_PERSISTENT_MIN, 7),
            (TPM_PT::ACTIVE_SESSIONS_MAX, 64),
            (TPM_PT::PCR_COUNT, PCR_COUNT as u32),
            (TPM_PT::CONTEXT_GAP_MAX, 0xFFFF),
            (TPM_PT::NV_INDEX_MAX, 2048),
            (TPM_PT::MAX_DIGEST, 32),
            (TPM_PT::HR_LOADED, self.sessions.len() as u32),
            (TPM_PT::HR_TRANSIENT_AVAIL, (self.max_objects - self.objects.len()) as u32),
        ];
        if self.report_capacities {
            properties.push((TPM_PT::HR_TRANSIENT_MIN, self.max_objects as u32));
            properties.push((TPM_PT::HR_LOADED_MIN, self.max_sessions as u32));
        }
        properties.sort_by_key(|(pt, _)| pt.0);
        properties
    }

    fn get_capability(&self, params: &mut TpmBuffer) -> Result<Reply, TPM_RC> {
        let requested = TPM_CAP(params.read_u32().map_err(insufficient)?);
        let capability = self.answer_capability_as.unwrap_or(requested);
        let property = params.read_u32().map_err(insufficient)?;
        let count = (params.read_u32().map_err(insufficient)? as usize).min(self.max_capability_count);

        fn page<T>(items: Vec<T>, count: usize) -> (bool, Vec<T>) {
            let more = items.len() > count;
            (more, items.into_iter().take(count).collect())
        }

        let (more, data) = match capability {
            TPM_CAP::TPM_PROPERTIES => {
                let items: Vec<TPMS_TAGGED_PROPERTY> = self
                    .properties()
                    .into_iter()
                    .filter(|(pt, _)| pt.0 >= property)
                    .map(|(pt, value)| TPMS_TAGGED_PROPERTY { property: pt, value })
                    .collect();
                let (more, items) = page(items, count);
                (more, TPMU_CAPABILITIES::tpmProperties(TPML_TAGGED_TPM_PROPERTY::new(items)))
            }
            TPM_CAP::COMMANDS => {
                let items: Vec<TPMA_CC> = supported_commands()
                    .into_iter()
                    .filter(|cc| cc.0 >= (property & 0xFFFF))
                    .filter_map(CommandInfo::lookup)
                    .map(|info| {
                        let mut attributes = TPMA_CC(info.code.0 | ((info.num_handles as u32) << 25));
                        if info.response_handle {
                            attributes |= TPMA_CC::rHandle;
                        }
                        attributes
                    })
                    .collect();
                let (more, items) = page(items, count);
                (more, TPMU_CAPABILITIES::command(TPML_CCA::new(items)))
            }
            TPM_CAP::HANDLES => {
                let range = property & 0xFF00_0000;
                let all: Vec<u32> = match TPM_HT((property >> 24) as u8) {
                    TPM_HT::TRANSIENT => self.objects.keys().copied().collect(),
                    TPM_HT::NV_INDEX => self.nv.keys().copied().collect(),
                    TPM_HT::HMAC_SESSION | TPM_HT::POLICY_SESSION => self
                        .sessions
                        .keys()
                        .chain(self.saved_sessions.keys())
                        .copied()
                        .filter(|h| h & 0xFF00_0000 == range)
                        .collect(),
                    _ => Vec::new(),
                };
                let mut items: Vec<u32> = all.into_iter().filter(|h| *h >= property).collect();
                items.sort_unstable();
                let (more, items) = page(items, count);
                (
                    more,
                    TPMU_CAPABILITIES::handles(TPML_HANDLE::new(items.into_iter().map(TPM_HANDLE::new).collect())),
                )
            }
            TPM_CAP::ALGS => {
                let items: Vec<TPMS_ALG_PROPERTY> = [
                    (TPM_ALG_ID::RSA, TPMA_ALGORITHM::asymmetric | TPMA_ALGORITHM::object),
                    (TPM_ALG_ID::SHA1, TPMA_ALGORITHM::hash),
                    (TPM_ALG_ID::HMAC, TPMA_ALGORITHM::hash | TPMA_ALGORITHM::signing),
                    (TPM_ALG_ID::AES, TPMA_ALGORITHM::symmetric),
                    (TPM_ALG_ID::SHA256, TPMA_ALGORITHM::hash),
                    (TPM_ALG_ID::CFB, TPMA_ALGORITHM::symmetric | TPMA_ALGORITHM::encrypting),
                ]
                .into_iter()
                .filter(|(alg, _)| alg.0 as u32 >= property)
                .map(|(alg, attributes)| TPMS_ALG_PROPERTY {
                    alg,
                    algProperties: attributes,
                })
                .collect();
                let (more, items) = page(items, count);
                (more, TPMU_CAPABILITIES::algorithms(TPML_ALG_PROPERTY::new(items)))
            }
            _ => return Err(TPM_RC::VALUE.with_parameter(1)),
        };

        let mut out = TpmBuffer::new(None);
        out.write_u8(more as u8);
        TPMS_CAPABILITY_DATA { data }.toTpm(&mut out).map_err(insufficient)?;
        Ok(Reply::with_params(out))
    }

    fn pcr_read(&self, params: &mut TpmBuffer) -> Result<Reply, TPM_RC> {
        let selection = TPML_PCR_SELECTION::fromTpm(params).map_err(insufficient)?;
        let mut selected_out = Vec::new();
        let mut values = Vec::new();

        for bank in &selection.pcrSelections {
            let mut select = vec![0u8; bank.pcrSelect.len()];
            if bank.hash == TPM_ALG_ID::SHA256 {
                for (byte_index, byte) in bank.pcrSelect.iter().enumerate() {
                    for bit in 0..8 {
                        let pcr = byte_index * 8 + bit;
                        if byte & (1 << bit) != 0 && pcr < PCR_COUNT && values.len() < 8 {
                            select[byte_index] |= 1 << bit;
                            values.push(self.pcrs[pcr].clone());
                        }
                    }
                }
            }
            selected_out.push(TPMS_PCR_SELECTION {
                hash: bank.hash,
                pcrSelect: select,
            });
        }

        let mut out = TpmBuffer::new(None);
        out.write_u32(self.pcr_update_counter);
        TPML_PCR_SELECTION::new(selected_out).toTpm(&mut out).map_err(insufficient)?;
        TPML_DIGEST { digests: values }.toTpm(&mut out).map_err(insufficient)?;
        Ok(Reply::with_params(out))
    }

    fn policy_command(&mut self, code: TPM_CC, handle: u32, params: &mut TpmBuffer) -> Result<Reply, TPM_RC> {
        let session = self.sessions.get_mut(&handle).ok_or(TPM_RC::HANDLE.with_handle(1))?;
        if session.session_type == TPM_SE::HMAC {
            return Err(TPM_RC::AUTH_TYPE.with_handle(1));
        }

        match code {
            TPM_CC::PolicyCommandCode => {
                let cc = TPM_CC(params.read_u32().map_err(insufficient)?);
                if session.command_code.is_some_and(|existing| existing != cc) {
                    return Err(TPM_RC::VALUE.with_parameter(1));
                }
                session.extend_policy(TPM_CC::PolicyCommandCode, &cc.0.to_be_bytes());
                session.command_code = Some(cc);
            }
            TPM_CC::PolicyLocality => {
                let locality = TPMA_LOCALITY(params.read_u8().map_err(insufficient)?);
                session.extend_policy(TPM_CC::PolicyLocality, &[locality.0]);
                session.locality = Some(locality);
            }
            TPM_CC::PolicyAuthValue => {
                session.extend_policy(TPM_CC::PolicyAuthValue, &[]);
                session.needs_hmac = true;
                session.needs_password = false;
            }
            TPM_CC::PolicyPassword => {
                session.extend_policy(TPM_CC::PolicyAuthValue, &[]);
                session.needs_password = true;
                session.needs_hmac = false;
            }
            TPM_CC::PolicyRestart => session.reset_policy(),
            TPM_CC::PolicyGetDigest => {
                let mut out = TpmBuffer::new(None);
                out.write_sized_bytes(&session.policy_digest).map_err(insufficient)?;
                return Ok(Reply::with_params(out));
            }
            _ => return Err(TPM_RC::COMMAND_CODE),
        }
        Ok(Reply::empty())
    }
}

/// Digest followed by a TPMT_TK_HASHCHECK; the NULL hierarchy gets the NULL ticket
fn digest_with_ticket(digest: &[u8], hierarchy: u32) -> TpmBuffer {
    let mut out = TpmBuffer::new(None);
    out.write_sized_bytes(digest).expect("digest fits");
    out.write_u16(TPM_ST::HASHCHECK.0);
    out.write_u32(hierarchy);
    if hierarchy == TPM_RH::NULL.0 {
        out.write_u16(0);
    } else {
        out.write_sized_bytes(&sha256(&[b"ticket", digest])).expect("ticket fits");
    }
    out
}
