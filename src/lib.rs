/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! TPM 2.0 command session and resource management layer.
//!
//! `tpm2::Tpm2` marshals commands, authorizes them through HMAC, policy and
//! password sessions, verifies response HMACs, and virtualizes the TPM's
//! limited object and session slots with ContextSave/ContextLoad.

pub mod auth_session;
pub mod crypto;
pub mod device;
pub mod dispatcher;
pub mod error;
pub mod policy;
pub mod resource_manager;
pub mod session_manager;
pub mod tpm2;
pub mod tpm2_helpers;
mod tpm2_impl;
pub mod tpm_buffer;
pub mod tpm_structure;
pub mod tpm_type_extensions;
pub mod tpm_types;
