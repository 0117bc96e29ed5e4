/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Command framing: marshals a command, moves it over the transport and splits the response

use log::{debug, trace};

use crate::device::TpmDevice;
use crate::error::{DecodeError, TpmError};
use crate::resource_manager::ContextOps;
use crate::tpm_buffer::{TpmBuffer, TpmMarshaller};
use crate::tpm_structure::TpmStructure;
use crate::tpm_types::*;

/// Size of the command and response header
pub const HEADER_SIZE: usize = 10;

/// Transport settings applied for a single command
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SignalOptions {
    pub locality: Option<u8>,
    pub physical_presence: bool,
}

/// A response split into its areas
#[derive(Debug, Clone, Default)]
pub struct RawResponse {
    pub response_code: TPM_RC,
    pub handle: Option<u32>,
    pub params: Vec<u8>,
    pub auths: Vec<TPMS_AUTH_RESPONSE>,
}

pub struct Dispatcher {
    device: Box<dyn TpmDevice>,
}

impl Dispatcher {
    pub fn new(device: Box<dyn TpmDevice>) -> Self {
        Dispatcher { device }
    }

    pub fn device(&mut self) -> &mut dyn TpmDevice {
        self.device.as_mut()
    }

    /// Marshal a command with already-resolved physical handles
    pub fn marshal_command(
        command: TPM_CC,
        handles: &[u32],
        auths: &[TPMS_AUTH_COMMAND],
        params: &[u8],
    ) -> Result<Vec<u8>, TpmError> {
        let mut buf = TpmBuffer::new(Some(HEADER_SIZE + handles.len() * 4 + params.len() + 64));
        let tag = if auths.is_empty() {
            TPM_ST::NO_SESSIONS
        } else {
            TPM_ST::SESSIONS
        };

        tag.toTpm(&mut buf)?;
        buf.write_u32(0);
        command.toTpm(&mut buf)?;

        for handle in handles {
            buf.write_u32(*handle);
        }

        if !auths.is_empty() {
            let size_pos = buf.len();
            buf.write_u32(0);
            for auth in auths {
                auth.toTpm(&mut buf)?;
            }
            let auth_size = buf.len() - size_pos - 4;
            buf.patch_u32(size_pos, auth_size as u32);
        }

        buf.write_bytes(params);

        let size = buf.len() as u32;
        buf.patch_u32(2, size);
        Ok(buf.into_vec())
    }

    /// Split a response. `num_sessions` is the number of sessions the command carried.
    pub fn parse_response(
        response: &[u8],
        response_handle: bool,
        num_sessions: usize,
    ) -> Result<RawResponse, TpmError> {
        let mut buf = TpmBuffer::from_bytes(response);
        let tag = TPM_ST::fromTpm(&mut buf)?;
        let size = buf.read_u32()? as usize;
        let response_code = TPM_RC::fromTpm(&mut buf)?;

        if size != response.len() {
            return Err(DecodeError::SizeMismatch {
                declared: size,
                actual: response.len(),
            }
            .into());
        }

        if !response_code.is_success() {
            buf.check_consumed()?;
            return Ok(RawResponse {
                response_code,
                ..Default::default()
            });
        }

        let expected_tag = if num_sessions > 0 {
            TPM_ST::SESSIONS
        } else {
            TPM_ST::NO_SESSIONS
        };
        if tag != expected_tag {
            return Err(DecodeError::IncorrectTag {
                expected: expected_tag.0,
                actual: tag.0,
            }
            .into());
        }

        let handle = if response_handle {
            Some(buf.read_u32()?)
        } else {
            None
        };

        let (params, auths) = if num_sessions > 0 {
            let param_size = buf.read_u32()? as usize;
            let params = buf.read_bytes(param_size)?;
            let auths = (0..num_sessions)
                .map(|_| TPMS_AUTH_RESPONSE::fromTpm(&mut buf))
                .collect::<Result<Vec<_>, _>>()?;
            buf.check_consumed()?;
            (params, auths)
        } else {
            (buf.read_bytes(buf.remaining())?, Vec::new())
        };

        Ok(RawResponse {
            response_code,
            handle,
            params,
            auths,
        })
    }

    fn apply_signals(&mut self, signals: &SignalOptions) -> Result<(), TpmError> {
        if let Some(locality) = signals.locality {
            if self.device.locality_ctl_available() {
                self.device.set_locality(locality)?;
            } else if locality != 0 {
                return Err(TpmError::NotSupported(format!("locality {} on this connection", locality)));
            }
        }
        if signals.physical_presence {
            if !self.device.implements_physical_presence() {
                return Err(TpmError::NotSupported("physical presence on this connection".to_string()));
            }
            self.device.assert_physical_presence(true)?;
        }
        Ok(())
    }

    fn reset_signals(&mut self, signals: &SignalOptions) -> Result<(), TpmError> {
        if signals.locality.is_some() && self.device.locality_ctl_available() {
            self.device.set_locality(0)?;
        }
        if signals.physical_presence && self.device.implements_physical_presence() {
            self.device.assert_physical_presence(false)?;
        }
        Ok(())
    }

    /// Send one command and return its split response. Locality and physical
    /// presence are in effect for this command only.
    pub fn transact(
        &mut self,
        command: TPM_CC,
        handles: &[u32],
        auths: &[TPMS_AUTH_COMMAND],
        params: &[u8],
        response_handle: bool,
        signals: &SignalOptions,
    ) -> Result<RawResponse, TpmError> {
        let cmd_buf = Self::marshal_command(command, handles, auths, params)?;
        trace!("{} command: {:02X?}", command, cmd_buf);

        let result = self
            .apply_signals(signals)
            .and_then(|()| self.send_receive(&cmd_buf));
        self.reset_signals(signals)?;
        let resp_buf = result?;

        trace!("{} response: {:02X?}", command, resp_buf);
        let response = Self::parse_response(&resp_buf, response_handle, auths.len())?;
        debug!("{} -> {}", command, response.response_code);
        Ok(response)
    }

    fn send_receive(&mut self, cmd_buf: &[u8]) -> Result<Vec<u8>, TpmError> {
        self.device.dispatch_command(cmd_buf)?;
        self.device.get_response()
    }

    fn transact_ok(
        &mut self,
        command: TPM_CC,
        handles: &[u32],
        params: &[u8],
        response_handle: bool,
    ) -> Result<RawResponse, TpmError> {
        let response = self.transact(command, handles, &[], params, response_handle, &SignalOptions::default())?;
        if !response.response_code.is_success() {
            return Err(TpmError::CommandFailed {
                command,
                response_code: response.response_code,
            });
        }
        Ok(response)
    }
}

impl ContextOps for Dispatcher {
    fn context_save(&mut self, physical: u32) -> Result<TPMS_CONTEXT, TpmError> {
        let response = self.transact_ok(TPM_CC::ContextSave, &[physical], &[], false)?;
        TPMS_CONTEXT::fromBytes(&response.params)
    }

    fn context_load(&mut self, context: &TPMS_CONTEXT) -> Result<u32, TpmError> {
        let response = self.transact_ok(TPM_CC::ContextLoad, &[], &context.toBytes()?, true)?;
        response.handle.ok_or(TpmError::Decode(DecodeError::BufferUnderflow {
            needed: 4,
            remaining: 0,
        }))
    }

    fn flush_context(&mut self, physical: u32) -> Result<(), TpmError> {
        self.transact_ok(TPM_CC::FlushContext, &[], &physical.to_be_bytes(), false)?;
        Ok(())
    }
}
