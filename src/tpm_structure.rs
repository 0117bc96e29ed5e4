/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Structure traits and the command shape table

use std::collections::HashMap;

use lazy_static::lazy_static;

use crate::error::TpmError;
use crate::resource_manager::SlotKind;
use crate::tpm_buffer::{TpmBuffer, TpmMarshaller};
use crate::tpm_types::TPM_CC;

/// Convenience conversions for every marshallable structure
pub trait TpmStructure: TpmMarshaller + Default {
    /// Read a new value from the current position of `buf`
    fn fromTpm(buf: &mut TpmBuffer) -> Result<Self, TpmError> {
        let mut value = Self::default();
        value.initFromTpm(buf)?;
        Ok(value)
    }

    /// Decode a value that must occupy all of `bytes`
    fn fromBytes(bytes: &[u8]) -> Result<Self, TpmError> {
        let mut buf = TpmBuffer::from_bytes(bytes);
        let value = Self::fromTpm(&mut buf)?;
        buf.check_consumed()?;
        Ok(value)
    }

    fn toBytes(&self) -> Result<Vec<u8>, TpmError> {
        let mut buf = TpmBuffer::new(None);
        self.toTpm(&mut buf)?;
        Ok(buf.into_vec())
    }
}

impl<T: TpmMarshaller + Default> TpmStructure for T {}

/// Common trait for all TPM enumeration types
pub trait TpmEnum<T> {
    /// Get the numeric value of the enum
    fn get_value(&self) -> T;

    /// Names of the defined values, used for diagnostics
    fn value_names() -> &'static [(u64, &'static str)];
}

/// Shape of a command as far as the dispatcher and the resource manager are concerned
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommandInfo {
    pub code: TPM_CC,

    /// Number of handles in the handle area
    pub num_handles: usize,

    /// Leading handles that require an authorization session
    pub num_auth_handles: usize,

    /// The response handle area carries a handle
    pub response_handle: bool,

    /// Slot kind the returned handle occupies, if it creates a loaded entity
    pub creates: Option<SlotKind>,

    /// On success the TPM flushes the entity named by the first handle
    pub flushes_handle: bool,
}

impl CommandInfo {
    const fn new(code: TPM_CC, num_handles: usize, num_auth_handles: usize) -> Self {
        CommandInfo {
            code,
            num_handles,
            num_auth_handles,
            response_handle: false,
            creates: None,
            flushes_handle: false,
        }
    }

    const fn returning_handle(mut self) -> Self {
        self.response_handle = true;
        self
    }

    const fn flushing(mut self) -> Self {
        self.flushes_handle = true;
        self
    }

    const fn creating(mut self, kind: SlotKind) -> Self {
        self.response_handle = true;
        self.creates = Some(kind);
        self
    }

    /// Table entry for `code`, if the command is known
    pub fn lookup(code: TPM_CC) -> Option<CommandInfo> {
        COMMAND_INFO.get(&code.0).copied()
    }
}

lazy_static! {
    static ref COMMAND_INFO: HashMap<u32, CommandInfo> = {
        use SlotKind::{Object, Session};

        let table = [
            CommandInfo::new(TPM_CC::Startup, 0, 0),
            CommandInfo::new(TPM_CC::Shutdown, 0, 0),
            CommandInfo::new(TPM_CC::GetRandom, 0, 0),
            CommandInfo::new(TPM_CC::StirRandom, 0, 0),
            CommandInfo::new(TPM_CC::GetCapability, 0, 0),
            CommandInfo::new(TPM_CC::StartAuthSession, 2, 0).creating(Session),
            CommandInfo::new(TPM_CC::FlushContext, 0, 0),
            CommandInfo::new(TPM_CC::ContextSave, 1, 0),
            CommandInfo::new(TPM_CC::ContextLoad, 0, 0).returning_handle(),
            CommandInfo::new(TPM_CC::Hash, 0, 0),
            CommandInfo::new(TPM_CC::HashSequenceStart, 0, 0).creating(Object),
            CommandInfo::new(TPM_CC::SequenceUpdate, 1, 1),
            CommandInfo::new(TPM_CC::SequenceComplete, 1, 1).flushing(),
            CommandInfo::new(TPM_CC::CreatePrimary, 1, 1).creating(Object),
            CommandInfo::new(TPM_CC::ReadPublic, 1, 0),
            CommandInfo::new(TPM_CC::NV_DefineSpace, 1, 1),
            CommandInfo::new(TPM_CC::NV_UndefineSpace, 2, 1),
            CommandInfo::new(TPM_CC::NV_Increment, 2, 1),
            CommandInfo::new(TPM_CC::NV_Read, 2, 1),
            CommandInfo::new(TPM_CC::NV_Write, 2, 1),
            CommandInfo::new(TPM_CC::NV_ReadPublic, 1, 0),
            CommandInfo::new(TPM_CC::PCR_Read, 0, 0),
            CommandInfo::new(TPM_CC::PCR_Extend, 1, 1),
            CommandInfo::new(TPM_CC::PCR_Reset, 1, 1),
            CommandInfo::new(TPM_CC::PolicyCommandCode, 1, 0),
            CommandInfo::new(TPM_CC::PolicyLocality, 1, 0),
            CommandInfo::new(TPM_CC::PolicyAuthValue, 1, 0),
            CommandInfo::new(TPM_CC::PolicyPassword, 1, 0),
            CommandInfo::new(TPM_CC::PolicyRestart, 1, 0),
            CommandInfo::new(TPM_CC::PolicyGetDigest, 1, 0),
        ];

        table.into_iter().map(|info| (info.code.0, info)).collect()
    };
}

/// Codes of every command in the shape table, ascending
pub fn supported_commands() -> Vec<TPM_CC> {
    let mut codes: Vec<TPM_CC> = COMMAND_INFO.values().map(|info| info.code).collect();
    codes.sort();
    codes
}
