/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! The command pipeline shared by every TPM command: handle virtualization,
//! authorization, dispatch and response validation.

use std::collections::HashMap;

use log::{debug, warn};

use crate::auth_session::{AuthSession, Session};
use crate::device::TpmDevice;
use crate::dispatcher::{Dispatcher, SignalOptions};
use crate::error::TpmError;
use crate::resource_manager::{ContextOps, ResourceManager, SlotKind};
use crate::session_manager::{HashInputs, SessionManager};
use crate::tpm2_helpers::int_to_tpm;
use crate::tpm_buffer::TpmBuffer;
use crate::tpm_structure::CommandInfo;
use crate::tpm_types::*;

/// Slot count assumed when the TPM does not report its capacity
pub const DEFAULT_SLOT_COUNT: usize = 3;

/// Construction-time settings of a `Tpm2`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Tpm2Config {
    /// Transient object slots; read from `TPM_PT_HR_TRANSIENT_MIN` when unset
    pub max_loaded_objects: Option<usize>,
    /// Loaded session slots; read from `TPM_PT_HR_LOADED_MIN` when unset
    pub max_loaded_sessions: Option<usize>,
    /// Query the TPM for unset capacities at connect and startup
    pub query_capacities: bool,
}

impl Default for Tpm2Config {
    fn default() -> Self {
        Tpm2Config {
            max_loaded_objects: None,
            max_loaded_sessions: None,
            query_capacities: true,
        }
    }
}

/// Options that apply to a single command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CallOptions {
    /// Return a non-success response instead of failing with `CommandFailed`
    pub allow_errors: bool,
    /// Locality to issue the command from
    pub locality: Option<u8>,
    /// Assert physical presence while the command executes
    pub physical_presence: bool,
}

impl CallOptions {
    pub fn tolerant() -> Self {
        CallOptions {
            allow_errors: true,
            ..Default::default()
        }
    }

    pub fn at_locality(locality: u8) -> Self {
        CallOptions {
            locality: Some(locality),
            ..Default::default()
        }
    }

    pub fn with_physical_presence(mut self) -> Self {
        self.physical_presence = true;
        self
    }
}

/// A command before handle resolution and authorization
#[derive(Debug, Clone)]
pub struct TpmCommand {
    pub code: TPM_CC,
    /// Handle area, as logical handles with their auth values and names
    pub handles: Vec<TPM_HANDLE>,
    /// Marshalled parameter area
    pub params: Vec<u8>,
    /// Authorizations; empty means password sessions for every auth handle
    pub sessions: Vec<Session>,
}

impl TpmCommand {
    pub fn new(code: TPM_CC) -> Self {
        TpmCommand {
            code,
            handles: Vec::new(),
            params: Vec::new(),
            sessions: Vec::new(),
        }
    }

    pub fn handle(mut self, handle: &TPM_HANDLE) -> Self {
        self.handles.push(handle.clone());
        self
    }

    pub fn params(mut self, params: TpmBuffer) -> Self {
        self.params = params.into_vec();
        self
    }

    pub fn sessions(mut self, sessions: &[Session]) -> Self {
        self.sessions = sessions.to_vec();
        self
    }
}

/// Response of a command, with the returned handle already virtualized
#[derive(Debug, Clone, Default)]
pub struct TpmResponse {
    pub response_code: TPM_RC,
    pub handle: Option<TPM_HANDLE>,
    pub params: TpmBuffer,
}

impl TpmResponse {
    pub fn is_success(&self) -> bool {
        self.response_code.is_success()
    }
}

/// TPM 2.0 client: owns the transport, the slot table and the session table
pub struct Tpm2 {
    pub(crate) dispatcher: Dispatcher,
    pub(crate) resource_manager: ResourceManager,
    pub(crate) session_manager: SessionManager,

    /// Public areas of NV indices seen by this client, for their names
    pub(crate) nv_publics: HashMap<u32, TPMS_NV_PUBLIC>,

    /// Names of loaded objects by logical handle
    pub(crate) object_names: HashMap<u32, Vec<u8>>,

    last_response_code: TPM_RC,
    config: Tpm2Config,
}

impl Tpm2 {
    pub fn new(device: Box<dyn TpmDevice>) -> Self {
        Self::with_config(device, Tpm2Config::default())
    }

    pub fn with_config(device: Box<dyn TpmDevice>, config: Tpm2Config) -> Self {
        let resource_manager = ResourceManager::new(
            config.max_loaded_objects.unwrap_or(DEFAULT_SLOT_COUNT),
            config.max_loaded_sessions.unwrap_or(DEFAULT_SLOT_COUNT),
        );
        Tpm2 {
            dispatcher: Dispatcher::new(device),
            resource_manager,
            session_manager: SessionManager::new(),
            nv_publics: HashMap::new(),
            object_names: HashMap::new(),
            last_response_code: TPM_RC::SUCCESS,
            config,
        }
    }

    /// Connect the transport and size the slot arenas
    pub fn connect(&mut self) -> Result<(), TpmError> {
        self.dispatcher.device().connect()?;
        self.refresh_capacities()
    }

    pub fn close(&mut self) {
        self.dispatcher.device().close();
    }

    pub fn device(&mut self) -> &mut dyn TpmDevice {
        self.dispatcher.device()
    }

    pub fn resource_manager(&self) -> &ResourceManager {
        &self.resource_manager
    }

    pub fn session_manager(&self) -> &SessionManager {
        &self.session_manager
    }

    /// Rolling state of a started session
    pub fn session_state(&self, session: &Session) -> Option<&AuthSession> {
        self.session_manager.get(session.handle.handle)
    }

    /// Response code of the most recent command that reached the TPM
    pub fn last_response_code(&self) -> TPM_RC {
        self.last_response_code
    }

    /// Re-read the slot capacities the configuration leaves open.
    ///
    /// A TPM that is not started yet answers with an error; the default is kept then.
    pub fn refresh_capacities(&mut self) -> Result<(), TpmError> {
        let objects = match self.config.max_loaded_objects {
            Some(n) => n,
            None => self.detect_capacity(TPM_PT::HR_TRANSIENT_MIN)?,
        };
        let sessions = match self.config.max_loaded_sessions {
            Some(n) => n,
            None => self.detect_capacity(TPM_PT::HR_LOADED_MIN)?,
        };
        self.resource_manager.set_capacity(objects, sessions);
        Ok(())
    }

    fn detect_capacity(&mut self, property: TPM_PT) -> Result<usize, TpmError> {
        if !self.config.query_capacities {
            return Ok(DEFAULT_SLOT_COUNT);
        }
        match self.get_tpm_property(property) {
            Ok(value) if value > 0 => Ok(value as usize),
            Ok(_) => Ok(DEFAULT_SLOT_COUNT),
            Err(err) if err.is_transport() => Err(err),
            Err(err) => {
                debug!("{:?} not available ({}), assuming {}", property, err, DEFAULT_SLOT_COUNT);
                Ok(DEFAULT_SLOT_COUNT)
            }
        }
    }

    /// Power cycle a simulator. Every loaded entity is gone afterwards and
    /// saved contexts no longer load.
    pub fn power_cycle(&mut self) -> Result<(), TpmError> {
        self.dispatcher.device().power_cycle()?;
        self.resource_manager.invalidate_all();
        debug!("TPM power cycled; all logical handles invalidated");
        Ok(())
    }

    /// Flush a transient object or a session, wherever it currently lives
    pub fn flush_context(&mut self, handle: &TPM_HANDLE) -> Result<(), TpmError> {
        let logical = handle.handle;
        if self.session_manager.is_expired(logical) {
            // The TPM ended the session already; only the record of its expiry remains
            debug!("Session 0x{:08X} already ended, dropping its record", logical);
            self.session_manager.forget(logical);
            return Ok(());
        }
        self.resource_manager.flush(&mut self.dispatcher, logical)?;
        self.session_manager.forget(logical);
        self.object_names.remove(&logical);
        Ok(())
    }

    /// Name of an entity as the TPM computes it; `physical` is where it is loaded
    fn entity_name(&self, handle: &TPM_HANDLE, physical: u32) -> Result<Vec<u8>, TpmError> {
        if !handle.name.is_empty() {
            return Ok(handle.name.clone());
        }
        if let Some(public) = self.nv_publics.get(&handle.handle) {
            return public.get_name();
        }
        if let Some(name) = self.object_names.get(&handle.handle) {
            return Ok(name.clone());
        }
        Ok(int_to_tpm(physical))
    }

    /// Read the public areas of NV indices whose names are not known yet.
    ///
    /// A handle the TPM does not know is left alone; the command using it
    /// reports the bad handle.
    fn learn_nv_names(&mut self, handles: &[TPM_HANDLE]) -> Result<(), TpmError> {
        for handle in handles {
            if handle.get_type() != TPM_HT::NV_INDEX
                || !handle.name.is_empty()
                || self.nv_publics.contains_key(&handle.handle)
            {
                continue;
            }
            debug!("Reading the public area of NV index 0x{:08X} for its name", handle.handle);
            match self.nv_read_public(handle) {
                Ok(_) | Err(TpmError::CommandFailed { .. }) => {}
                Err(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// Current name of an entity, reading it from the TPM for an unknown NV index
    pub(crate) fn current_name(&mut self, handle: &TPM_HANDLE) -> Result<Vec<u8>, TpmError> {
        self.learn_nv_names(std::slice::from_ref(handle))?;
        self.entity_name(handle, handle.handle)
    }

    /// Run one command through the resource manager, the session manager and the dispatcher
    pub fn execute(&mut self, command: &TpmCommand, options: &CallOptions) -> Result<TpmResponse, TpmError> {
        let info = CommandInfo::lookup(command.code)
            .ok_or_else(|| TpmError::NotSupported(format!("{}", command.code)))?;

        if matches!(
            command.code,
            TPM_CC::ContextSave | TPM_CC::ContextLoad | TPM_CC::FlushContext
        ) {
            return Err(TpmError::InvalidParameter(format!(
                "{} is issued by the resource manager",
                command.code
            )));
        }
        if command.handles.len() != info.num_handles {
            return Err(TpmError::InvalidParameter(format!(
                "{} takes {} handles, {} supplied",
                command.code,
                info.num_handles,
                command.handles.len()
            )));
        }

        let default_sessions;
        let sessions: &[Session] = if command.sessions.is_empty() && info.num_auth_handles > 0 {
            default_sessions = vec![Session::pw(None); info.num_auth_handles];
            &default_sessions
        } else {
            &command.sessions
        };
        self.session_manager.check_usable(sessions, info.num_auth_handles)?;
        if sessions.iter().any(|s| !s.is_pwap()) {
            // cpHash covers the names of all handles, not only the authorized ones
            self.learn_nv_names(&command.handles)?;
        }

        let mut logical: Vec<u32> = command.handles.iter().map(|h| h.handle).collect();
        logical.extend(sessions.iter().filter(|s| !s.is_pwap()).map(|s| s.handle.handle));
        let physical = self
            .resource_manager
            .resolve(&mut self.dispatcher, &logical, info.creates)?;
        let physical_handles = &physical[..command.handles.len()];

        let names = command
            .handles
            .iter()
            .zip(physical_handles)
            .map(|(h, p)| self.entity_name(h, *p))
            .collect::<Result<Vec<_>, _>>()?;
        let auth_handles = &command.handles[..info.num_auth_handles];

        let inputs = HashInputs {
            command: command.code,
            names: &names,
            params: &command.params,
        };
        let auths = self
            .session_manager
            .build_command_auths(&inputs, auth_handles, sessions)?;

        let signals = SignalOptions {
            locality: options.locality,
            physical_presence: options.physical_presence,
        };
        let raw = self.dispatcher.transact(
            command.code,
            physical_handles,
            &auths,
            &command.params,
            info.response_handle,
            &signals,
        )?;
        self.last_response_code = raw.response_code;

        if !raw.response_code.is_success() {
            if options.allow_errors {
                return Ok(TpmResponse {
                    response_code: raw.response_code,
                    ..Default::default()
                });
            }
            return Err(TpmError::CommandFailed {
                command: command.code,
                response_code: raw.response_code,
            });
        }

        let ended = match self.session_manager.validate_response_auths(
            command.code,
            &raw.params,
            sessions,
            &raw.auths,
        ) {
            Ok(ended) => ended,
            Err(err) => {
                if let (Some(created), Some(_)) = (raw.handle, info.creates) {
                    self.discard_created(created);
                }
                return Err(err);
            }
        };
        for handle in ended {
            debug!("Session 0x{:08X} ended with {}", handle, command.code);
            self.resource_manager.forget(handle);
        }

        let handle = match (raw.handle, info.creates) {
            (Some(created), Some(kind)) => Some(TPM_HANDLE::new(self.resource_manager.register(kind, created))),
            (Some(returned), None) => Some(TPM_HANDLE::new(returned)),
            (None, _) => None,
        };

        if info.flushes_handle {
            if let Some(flushed) = command.handles.first() {
                self.resource_manager.forget(flushed.handle);
                self.object_names.remove(&flushed.handle);
            }
        }

        Ok(TpmResponse {
            response_code: raw.response_code,
            handle,
            params: TpmBuffer::from_bytes(&raw.params),
        })
    }

    /// Flush an entity created by a response that failed validation
    fn discard_created(&mut self, physical: u32) {
        if let Err(err) = self.dispatcher.flush_context(physical) {
            warn!("Could not flush 0x{:08X} after a failed response check: {}", physical, err);
        }
    }

    /// Run a command that must succeed
    pub(crate) fn run(&mut self, command: TpmCommand) -> Result<TpmResponse, TpmError> {
        self.execute(&command, &CallOptions::default())
    }

    /// Logical handles of one kind, for answering handle enumeration locally
    pub(crate) fn logical_handles(&self, kind: SlotKind) -> Vec<u32> {
        self.resource_manager.logical_handles(kind)
    }
}
