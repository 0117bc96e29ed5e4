/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Walks through sessions, policies and resource manager paging against a TPM
//! simulator listening on the standard ports (2321 command, 2322 platform).

use std::env;
use std::error::Error;

use tss_rm::auth_session::Session;
use tss_rm::device::TpmTcpDevice;
use tss_rm::policy::{PolicyAuthValue, PolicyCommandCode, PolicyTree};
use tss_rm::resource_manager::SlotKind;
use tss_rm::tpm2::{CallOptions, Tpm2, TpmCommand};
use tss_rm::tpm_buffer::TpmBuffer;
use tss_rm::tpm_types::*;

const COUNTER_INDEX: u32 = 0x0150_0020;

struct TpmSamples {
    tpm: Tpm2,
}

impl TpmSamples {
    fn new(host: &str, port: u16) -> Result<Self, Box<dyn Error>> {
        let mut tpm = Tpm2::new(Box::new(TpmTcpDevice::new(host.to_string(), port)));
        tpm.connect()?;

        // A simulator has to be powered and started by us
        if tpm.device().platform_available() {
            tpm.power_cycle()?;
            tpm.startup(TPM_SU::CLEAR)?;
        }
        Ok(Self { tpm })
    }

    fn run_all_samples(&mut self) -> Result<(), Box<dyn Error>> {
        self.announce("Starting TPM Samples");

        self.rand()?;
        self.capabilities()?;
        self.hash_sequences()?;
        self.pcr()?;
        self.nv_counter()?;
        self.policy()?;
        self.many_sessions()?;
        self.error_handling()?;

        self.announce("All samples completed successfully");
        Ok(())
    }

    fn announce(&self, title: &str) {
        println!("\n================================================================================");
        println!("        {}", title);
        println!("================================================================================\n");
    }

    fn owner() -> TPM_HANDLE {
        TPM_HANDLE::from(TPM_RH::OWNER)
    }

    fn rand(&mut self) -> Result<(), Box<dyn Error>> {
        self.announce("Random Number Generation");

        let rand_bytes = self.tpm.get_random(20)?;
        println!("Random bytes: {:02x?}", rand_bytes);

        self.tpm.stir_random(&[1, 2, 3])?;
        println!("More random bytes: {:02x?}", self.tpm.get_random(20)?);
        Ok(())
    }

    fn capabilities(&mut self) -> Result<(), Box<dyn Error>> {
        self.announce("Capabilities");

        println!("PCR count: {}", self.tpm.get_tpm_property(TPM_PT::PCR_COUNT)?);
        println!(
            "Object slots: {}, session slots: {}",
            self.tpm.resource_manager().capacity(SlotKind::Object),
            self.tpm.resource_manager().capacity(SlotKind::Session)
        );

        // Small pages exercise the continuation loop
        if let TPMU_CAPABILITIES::command(list) = self.tpm.get_capability_paged(TPM_CAP::COMMANDS, 0, 8)? {
            println!("TPM implements {} commands", list.commandAttributes.len());
        }
        Ok(())
    }

    fn hash_sequences(&mut self) -> Result<(), Box<dyn Error>> {
        self.announce("Hash Sequences");

        let data = [1u8, 2, 3, 4, 5, 6];
        let null = TPM_HANDLE::from(TPM_RH::NULL);
        let (digest, _) = self.tpm.hash(&data, TPM_ALG_ID::SHA256, &null)?;
        println!("TPM2_Hash: {:02x?}", digest);

        // More sequences than most TPMs have object slots
        let mut sequences = Vec::new();
        for _ in 0..8 {
            sequences.push(self.tpm.hash_sequence_start(&[], TPM_ALG_ID::SHA256)?);
        }
        for sequence in &sequences {
            self.tpm.sequence_update(sequence, &data[..3], &[])?;
        }
        for sequence in &sequences {
            let (result, _) = self.tpm.sequence_complete(sequence, &data[3..], &null, &[])?;
            assert_eq!(result, digest);
        }
        println!("{} interleaved sequences produced the same digest", sequences.len());
        Ok(())
    }

    fn pcr(&mut self) -> Result<(), Box<dyn Error>> {
        self.announce("PCR Operations");

        let pcr = TPM_HANDLE::pcr(16);
        let selection = TPML_PCR_SELECTION::new(vec![TPMS_PCR_SELECTION::new(TPM_ALG_ID::SHA256, &[16])]);

        self.tpm.pcr_reset(&pcr, &[Session::pw(None)])?;
        let event = self.tpm.hash(b"event", TPM_ALG_ID::SHA256, &TPM_HANDLE::from(TPM_RH::NULL))?.0;
        let digests = TPML_DIGEST_VALUES::new(vec![TPMT_HA {
            hashAlg: TPM_ALG_ID::SHA256,
            digest: event,
        }]);
        self.tpm.pcr_extend(&pcr, &digests, &[Session::pw(None)])?;

        let read = self.tpm.pcr_read(&selection)?;
        println!("PCR[16] after one extend: {:02x?}", read.pcr_values.digests);
        println!("PCR update counter: {}", read.pcr_update_counter);
        Ok(())
    }

    fn define_counter(&mut self, auth: &[u8], policy: Vec<u8>) -> Result<TPM_HANDLE, Box<dyn Error>> {
        let nv = TPM_HANDLE::nv(COUNTER_INDEX);
        // Leftovers from an earlier run
        let _ = self.tpm.nv_undefine_space(&Self::owner(), &nv, &[Session::pw(None)]);

        let mut attributes = TPMA_NV::AUTHREAD | TPMA_NV::TPM_NT_COUNTER;
        attributes |= if policy.is_empty() { TPMA_NV::AUTHWRITE } else { TPMA_NV::POLICYWRITE };
        let public = TPMS_NV_PUBLIC {
            nvIndex: nv.clone(),
            nameAlg: TPM_ALG_ID::SHA256,
            attributes,
            authPolicy: policy,
            dataSize: 8,
        };
        self.tpm.nv_define_space(&Self::owner(), auth, &public, &[Session::pw(None)])?;
        Ok(nv.with_auth(auth))
    }

    fn nv_counter(&mut self) -> Result<(), Box<dyn Error>> {
        self.announce("NV Counter with an HMAC Session");

        let nv = self.define_counter(b"counter", Vec::new())?;
        let session = self.tpm.start_auth_session(TPM_SE::HMAC, TPM_ALG_ID::SHA256)?;

        for _ in 0..3 {
            self.tpm.nv_increment(&nv, &nv, &[session.clone()])?;
        }
        println!("Counter value: {}", self.tpm.nv_read_counter(&nv, &nv, &[session.clone()])?);

        self.tpm.flush_context(&session.handle)?;
        self.tpm.nv_undefine_space(&Self::owner(), &nv, &[Session::pw(None)])?;
        Ok(())
    }

    fn policy(&mut self) -> Result<(), Box<dyn Error>> {
        self.announce("Policy Sessions");

        let tree = PolicyTree::new()
            .add(PolicyCommandCode::new(TPM_CC::NV_Increment))
            .add(PolicyAuthValue::new());
        let digest = tree.get_policy_digest(TPM_ALG_ID::SHA256)?;
        println!("Software policy digest: {:02x?}", digest);

        // A trial session must arrive at the same value
        let trial = self.tpm.start_auth_session(TPM_SE::TRIAL, TPM_ALG_ID::SHA256)?;
        tree.execute(&mut self.tpm, &trial)?;
        let trial_digest = self.tpm.policy_get_digest(&trial)?;
        self.tpm.flush_context(&trial.handle)?;
        println!("Trial digest matches: {}", trial_digest == digest);

        let nv = self.define_counter(b"policy", digest)?;
        let session = self.tpm.start_auth_session(TPM_SE::POLICY, TPM_ALG_ID::SHA256)?;
        for _ in 0..2 {
            // The policy state resets after every authorization
            tree.execute(&mut self.tpm, &session)?;
            self.tpm.nv_increment(&nv, &nv, &[session.clone()])?;
        }
        println!("Counter value: {}", self.tpm.nv_read_counter(&nv, &nv, &[])?);

        self.tpm.flush_context(&session.handle)?;
        self.tpm.nv_undefine_space(&Self::owner(), &nv, &[Session::pw(None)])?;
        Ok(())
    }

    fn many_sessions(&mut self) -> Result<(), Box<dyn Error>> {
        self.announce("More Sessions than Slots");

        let nv = self.define_counter(b"rm", Vec::new())?;
        let mut sessions = Vec::new();
        for _ in 0..24 {
            sessions.push(self.tpm.start_auth_session(TPM_SE::HMAC, TPM_ALG_ID::SHA256)?);
        }
        for session in sessions.iter().rev() {
            self.tpm.nv_increment(&nv, &nv, &[session.clone()])?;
        }
        println!(
            "{} sessions used, {} loaded on the TPM",
            sessions.len(),
            self.tpm.resource_manager().loaded_count(SlotKind::Session)
        );
        println!("Counter value: {}", self.tpm.nv_read_counter(&nv, &nv, &[])?);

        for session in &sessions {
            self.tpm.flush_context(&session.handle)?;
        }
        self.tpm.nv_undefine_space(&Self::owner(), &nv, &[Session::pw(None)])?;
        Ok(())
    }

    fn error_handling(&mut self) -> Result<(), Box<dyn Error>> {
        self.announce("Error Handling");

        match self.tpm.hash(b"abc", TPM_ALG_ID::SHA1, &TPM_HANDLE::from(TPM_RH::NULL)) {
            Ok(_) => println!("TPM accepted SHA-1"),
            Err(e) => println!("Expected failure: {}", e),
        }

        let mut params = TpmBuffer::new(None);
        params.write_u16(8);
        let command = TpmCommand::new(TPM_CC::GetRandom).params(params);
        let response = self.tpm.execute(&command, &CallOptions::tolerant())?;
        println!("Tolerant call returned {}", response.response_code);
        Ok(())
    }
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::init();

    let args: Vec<String> = env::args().collect();
    let host = args.get(1).map(String::as_str).unwrap_or("127.0.0.1");
    let port = match args.get(2) {
        Some(p) => p.parse()?,
        None => 2321,
    };

    let mut samples = TpmSamples::new(host, port)?;
    samples.run_all_samples()
}
