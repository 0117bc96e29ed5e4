/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Byte transports to a TPM: the simulator socket protocol and the OS device

use std::io::{Read, Write};
use std::net::TcpStream;
use std::ops::BitOr;
use std::time::Duration;

use log::{debug, trace};

use crate::error::TpmError;

#[cfg(target_os = "windows")]
use std::os::raw::c_void;
#[cfg(target_os = "windows")]
use std::ptr;
#[cfg(target_os = "windows")]
use windows::Win32::System::TpmBaseServices::*;

#[cfg(target_os = "linux")]
use std::fs::{File, OpenOptions};

/// What a connection can do besides moving command buffers
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ConnInfo(pub u32);

impl ConnInfo {
    /// Platform hierarchy and platform signals (power, NV) are available
    pub const PLATFORM_AVAILABLE: ConnInfo = ConnInfo(0x01);
    /// Another resource manager sits between us and the TPM
    pub const USES_TRM: ConnInfo = ConnInfo(0x02);
    pub const SUPPORTS_PP: ConnInfo = ConnInfo(0x08);
    pub const NO_POWER_CTL: ConnInfo = ConnInfo(0x10);
    pub const NO_LOCALITY_CTL: ConnInfo = ConnInfo(0x20);
    pub const SOCKET: ConnInfo = ConnInfo(0x1000);
    pub const TBS: ConnInfo = ConnInfo(0x2000);

    pub fn contains(self, other: ConnInfo) -> bool {
        self.0 & other.0 == other.0
    }
}

impl BitOr for ConnInfo {
    type Output = ConnInfo;

    fn bitor(self, rhs: ConnInfo) -> ConnInfo {
        ConnInfo(self.0 | rhs.0)
    }
}

/// Byte transport to a TPM. Implementations move opaque command and response
/// buffers; they never interpret TPM structures.
pub trait TpmDevice {
    fn connect(&mut self) -> Result<(), TpmError>;

    fn close(&mut self);

    /// Send a complete command buffer
    fn dispatch_command(&mut self, cmd_buf: &[u8]) -> Result<(), TpmError>;

    /// Block until the response to the last dispatched command arrives
    fn get_response(&mut self) -> Result<Vec<u8>, TpmError>;

    /// Capabilities of the current connection; empty when not connected
    fn conn_info(&self) -> ConnInfo;

    fn power_ctl(&mut self, _on: bool) -> Result<(), TpmError> {
        Err(TpmError::NotSupported("power control".to_string()))
    }

    fn assert_physical_presence(&mut self, _on: bool) -> Result<(), TpmError> {
        Err(TpmError::NotSupported("physical presence".to_string()))
    }

    /// Locality of subsequent commands
    fn set_locality(&mut self, _locality: u8) -> Result<(), TpmError> {
        Err(TpmError::NotSupported("locality control".to_string()))
    }

    fn platform_available(&self) -> bool {
        self.conn_info().contains(ConnInfo::PLATFORM_AVAILABLE)
    }

    fn power_ctl_available(&self) -> bool {
        self.platform_available() && !self.conn_info().contains(ConnInfo::NO_POWER_CTL)
    }

    fn locality_ctl_available(&self) -> bool {
        self.platform_available() && !self.conn_info().contains(ConnInfo::NO_LOCALITY_CTL)
    }

    fn implements_physical_presence(&self) -> bool {
        self.conn_info().contains(ConnInfo::SUPPORTS_PP)
    }

    /// Power off then on; the TPM loses every loaded entity and expects a new Startup
    fn power_cycle(&mut self) -> Result<(), TpmError> {
        if !self.power_ctl_available() {
            return Err(TpmError::NotSupported("power control".to_string()));
        }
        self.power_ctl(false)?;
        self.power_ctl(true)
    }
}

/// Requests of the simulator socket protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
enum SimCommand {
    SignalPowerOn = 1,
    SignalPowerOff = 2,
    SignalPPOn = 3,
    SignalPPOff = 4,
    SendCommand = 8,
    SignalNvOn = 11,
    SignalNvOff = 12,
    RemoteHandshake = 15,
    SessionEnd = 20,
}

const SIM_PROTOCOL_VERSION: u32 = 1;

/// One simulator socket: big-endian u32 words, length-prefixed byte arrays,
/// and a zero status word closing every exchange
struct SimSocket {
    stream: TcpStream,
}

impl SimSocket {
    fn open(addr: &str, read_timeout: Duration) -> Result<Self, TpmError> {
        let stream = TcpStream::connect(addr)
            .map_err(|e| TpmError::Transport(format!("cannot reach simulator at {}: {}", addr, e)))?;
        stream.set_read_timeout(Some(read_timeout))?;
        Ok(SimSocket { stream })
    }

    fn send_u32(&mut self, value: u32) -> Result<(), TpmError> {
        self.stream.write_all(&value.to_be_bytes())?;
        Ok(())
    }

    fn recv_u32(&mut self) -> Result<u32, TpmError> {
        let mut word = [0u8; 4];
        self.stream.read_exact(&mut word)?;
        Ok(u32::from_be_bytes(word))
    }

    fn recv_sized(&mut self) -> Result<Vec<u8>, TpmError> {
        let len = self.recv_u32()? as usize;
        let mut data = vec![0u8; len];
        self.stream.read_exact(&mut data)?;
        Ok(data)
    }

    fn expect_ack(&mut self) -> Result<(), TpmError> {
        match self.recv_u32()? {
            0 => Ok(()),
            1 => Err(TpmError::Transport("simulator reported a failure".to_string())),
            other => Err(TpmError::Transport(format!("bad end tag {}", other))),
        }
    }

    fn signal(&mut self, signal: SimCommand) -> Result<(), TpmError> {
        trace!("Simulator signal {:?}", signal);
        self.send_u32(signal as u32)?;
        self.expect_ack()
    }
}

/// TPM simulator reached over TCP: commands on `port`, platform signals on `port + 1`
pub struct TpmTcpDevice {
    host_name: String,
    port: u16,
    command: Option<SimSocket>,
    platform: Option<SimSocket>,
    locality: u8,
    info: ConnInfo,
}

impl TpmTcpDevice {
    pub fn new(host_name: String, port: u16) -> Self {
        TpmTcpDevice {
            host_name,
            port,
            command: None,
            platform: None,
            locality: 0,
            info: ConnInfo::default(),
        }
    }

    fn command(&mut self) -> Result<&mut SimSocket, TpmError> {
        self.command.as_mut().ok_or(TpmError::NotConnected)
    }

    fn platform(&mut self) -> Result<&mut SimSocket, TpmError> {
        self.platform.as_mut().ok_or(TpmError::NotConnected)
    }
}

impl TpmDevice for TpmTcpDevice {
    fn connect(&mut self) -> Result<(), TpmError> {
        self.close();

        let platform_port = self.port.checked_add(1).ok_or_else(|| {
            TpmError::InvalidParameter(format!("no platform port after {}", self.port))
        })?;
        let platform = SimSocket::open(&format!("{}:{}", self.host_name, platform_port), Duration::from_secs(5))?;
        let mut command = SimSocket::open(&format!("{}:{}", self.host_name, self.port), Duration::from_secs(30))?;

        command.send_u32(SimCommand::RemoteHandshake as u32)?;
        command.send_u32(SIM_PROTOCOL_VERSION)?;
        let version = command.recv_u32()?;
        if version != SIM_PROTOCOL_VERSION {
            return Err(TpmError::Transport(format!(
                "incompatible simulator protocol version {}",
                version
            )));
        }
        let info = ConnInfo(command.recv_u32()?) | ConnInfo::SOCKET;
        command.expect_ack()?;

        self.command = Some(command);
        self.platform = Some(platform);
        self.locality = 0;
        self.info = info;
        debug!(
            "Connected to TPM simulator at {}:{} (info 0x{:X})",
            self.host_name, self.port, info.0
        );
        Ok(())
    }

    fn close(&mut self) {
        if let Some(mut socket) = self.command.take() {
            let _ = socket.send_u32(SimCommand::SessionEnd as u32);
        }
        self.platform = None;
        self.info = ConnInfo::default();
    }

    fn dispatch_command(&mut self, cmd_buf: &[u8]) -> Result<(), TpmError> {
        let locality = self.locality;
        let socket = self.command()?;

        let mut frame = Vec::with_capacity(9 + cmd_buf.len());
        frame.extend_from_slice(&(SimCommand::SendCommand as u32).to_be_bytes());
        frame.push(locality);
        frame.extend_from_slice(&(cmd_buf.len() as u32).to_be_bytes());
        frame.extend_from_slice(cmd_buf);
        socket.stream.write_all(&frame)?;
        Ok(())
    }

    fn get_response(&mut self) -> Result<Vec<u8>, TpmError> {
        let socket = self.command()?;
        let response = socket.recv_sized()?;
        socket.expect_ack()?;
        Ok(response)
    }

    fn conn_info(&self) -> ConnInfo {
        self.info
    }

    fn power_ctl(&mut self, on: bool) -> Result<(), TpmError> {
        let socket = self.platform()?;
        if on {
            socket.signal(SimCommand::SignalPowerOn)?;
            socket.signal(SimCommand::SignalNvOn)
        } else {
            socket.signal(SimCommand::SignalPowerOff)?;
            socket.signal(SimCommand::SignalNvOff)
        }
    }

    fn assert_physical_presence(&mut self, on: bool) -> Result<(), TpmError> {
        let signal = if on { SimCommand::SignalPPOn } else { SimCommand::SignalPPOff };
        self.platform()?.signal(signal)
    }

    fn set_locality(&mut self, locality: u8) -> Result<(), TpmError> {
        if locality > 4 {
            return Err(TpmError::InvalidParameter(format!("locality {}", locality)));
        }
        self.locality = locality;
        Ok(())
    }
}

/// Windows TPM Base Services
#[cfg(target_os = "windows")]
pub struct TpmTbsDevice {
    context: *mut c_void,
    result_buffer: [u8; 4096],
    res_size: u32,
    info: ConnInfo,
}

#[cfg(target_os = "windows")]
impl TpmTbsDevice {
    pub fn new() -> Self {
        TpmTbsDevice {
            context: ptr::null_mut(),
            result_buffer: [0; 4096],
            res_size: 0,
            info: ConnInfo::default(),
        }
    }
}

#[cfg(target_os = "windows")]
impl TpmDevice for TpmTbsDevice {
    fn connect(&mut self) -> Result<(), TpmError> {
        if !self.context.is_null() {
            return Ok(());
        }

        let mut params = TBS_CONTEXT_PARAMS2::default();
        params.version = TBS_CONTEXT_VERSION_TWO;
        // includeTpm20
        params.Anonymous.asUINT32 = 4;

        let res = unsafe {
            Tbsi_Context_Create(
                &params as *const TBS_CONTEXT_PARAMS2 as *const TBS_CONTEXT_PARAMS,
                &mut self.context as *mut *mut c_void,
            )
        };
        if res != TBS_SUCCESS {
            return Err(TpmError::Transport(format!("failed to connect to TBS: 0x{:08X}", res)));
        }

        let mut device = TPM_DEVICE_INFO::default();
        let res = unsafe {
            Tbsi_GetDeviceInfo(
                std::mem::size_of::<TPM_DEVICE_INFO>() as u32,
                &mut device as *mut _ as *mut c_void,
            )
        };
        if res != TBS_SUCCESS || device.tpmVersion != TPM_VERSION_20 {
            self.close();
            return Err(TpmError::Transport("platform does not contain a TPM 2.0".to_string()));
        }

        self.info = ConnInfo::TBS | ConnInfo::USES_TRM | ConnInfo::NO_POWER_CTL | ConnInfo::NO_LOCALITY_CTL;
        debug!("Connected to TBS");
        Ok(())
    }

    fn close(&mut self) {
        if !self.context.is_null() {
            unsafe { Tbsip_Context_Close(self.context) };
            self.context = ptr::null_mut();
        }
        self.info = ConnInfo::default();
    }

    fn dispatch_command(&mut self, cmd_buf: &[u8]) -> Result<(), TpmError> {
        if self.context.is_null() {
            return Err(TpmError::NotConnected);
        }

        self.res_size = self.result_buffer.len() as u32;
        let res = unsafe {
            Tbsip_Submit_Command(
                self.context,
                TBS_COMMAND_LOCALITY_ZERO,
                TBS_COMMAND_PRIORITY_NORMAL,
                cmd_buf,
                self.result_buffer.as_mut_ptr(),
                &mut self.res_size as *mut u32,
            )
        };
        if res != TBS_SUCCESS {
            self.res_size = 0;
            return Err(TpmError::Transport(format!("TBS submit failed: 0x{:08X}", res)));
        }
        Ok(())
    }

    fn get_response(&mut self) -> Result<Vec<u8>, TpmError> {
        // Submission is synchronous; the response is already in the buffer
        if self.res_size == 0 {
            return Err(TpmError::Transport("no response available".to_string()));
        }
        let response = self.result_buffer[..self.res_size as usize].to_vec();
        self.res_size = 0;
        Ok(response)
    }

    fn conn_info(&self) -> ConnInfo {
        self.info
    }
}

/// Linux character device (`/dev/tpm0`, falling back to the kernel resource manager `/dev/tpmrm0`)
#[cfg(target_os = "linux")]
pub struct TpmTbsDevice {
    dev_tpm: Option<File>,
    info: ConnInfo,
}

#[cfg(target_os = "linux")]
impl Default for TpmTbsDevice {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(target_os = "linux")]
impl TpmTbsDevice {
    pub fn new() -> Self {
        TpmTbsDevice {
            dev_tpm: None,
            info: ConnInfo::default(),
        }
    }

    fn open(path: &str) -> Option<File> {
        OpenOptions::new().read(true).write(true).open(path).ok()
    }

    fn device(&mut self) -> Result<&mut File, TpmError> {
        self.dev_tpm.as_mut().ok_or(TpmError::NotConnected)
    }
}

#[cfg(target_os = "linux")]
impl TpmDevice for TpmTbsDevice {
    fn connect(&mut self) -> Result<(), TpmError> {
        if self.dev_tpm.is_some() {
            return Ok(());
        }

        let base = ConnInfo::TBS | ConnInfo::NO_POWER_CTL | ConnInfo::NO_LOCALITY_CTL;
        if let Some(file) = Self::open("/dev/tpm0") {
            self.dev_tpm = Some(file);
            self.info = base;
            debug!("Opened /dev/tpm0");
        } else if let Some(file) = Self::open("/dev/tpmrm0") {
            self.dev_tpm = Some(file);
            self.info = base | ConnInfo::USES_TRM;
            debug!("Opened /dev/tpmrm0");
        } else {
            return Err(TpmError::Transport("no TPM character device available".to_string()));
        }
        Ok(())
    }

    fn close(&mut self) {
        self.dev_tpm = None;
        self.info = ConnInfo::default();
    }

    fn dispatch_command(&mut self, cmd_buf: &[u8]) -> Result<(), TpmError> {
        self.device()?.write_all(cmd_buf)?;
        Ok(())
    }

    fn get_response(&mut self) -> Result<Vec<u8>, TpmError> {
        // The driver hands over a whole response per read
        let mut response = vec![0u8; 4096];
        let len = self.device()?.read(&mut response)?;
        if len < 10 {
            return Err(TpmError::Transport(format!("short read from TPM: {} bytes", len)));
        }
        response.truncate(len);
        Ok(response)
    }

    fn conn_info(&self) -> ConnInfo {
        self.info
    }
}
