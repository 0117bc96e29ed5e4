/*
 *  Copyright (c) Microsoft Corporation. All rights reserved.
 *  Licensed under the MIT License. See the LICENSE file in the project root for full license information.
 */

//! Virtualization of the TPM's transient object and session slots.
//!
//! Callers hold stable logical handles. Entities that do not fit in the TPM's
//! slots are kept as saved contexts and reloaded on demand, evicting the least
//! recently used entity that the current command does not reference.

use std::collections::HashMap;

use log::{debug, trace, warn};

use crate::error::TpmError;
use crate::tpm_types::{TPMS_CONTEXT, TPM_HT};

/// First logical handle handed out for transient objects
pub const LOGICAL_OBJECT_BASE: u32 = 0x80FF_0000;

/// Which slot pool an entity occupies
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SlotKind {
    Object,
    Session,
}

impl SlotKind {
    /// Slot kind implied by the handle type, for handles the resource manager virtualizes
    pub fn of_handle(handle: u32) -> Option<SlotKind> {
        match TPM_HT((handle >> 24) as u8) {
            TPM_HT::TRANSIENT => Some(SlotKind::Object),
            TPM_HT::HMAC_SESSION | TPM_HT::POLICY_SESSION => Some(SlotKind::Session),
            _ => None,
        }
    }
}

/// Where a logical handle currently lives
#[derive(Debug, Clone)]
pub enum HandleState {
    /// Loaded in the TPM under the given physical handle
    Active(u32),
    /// Saved off the TPM
    Saved(TPMS_CONTEXT),
    /// The saved context was rejected or discarded; the entity is gone
    Invalid,
}

#[derive(Debug, Clone)]
struct Entry {
    kind: SlotKind,
    state: HandleState,
    last_used: u64,
}

/// Context management commands the resource manager issues to the TPM
pub trait ContextOps {
    fn context_save(&mut self, physical: u32) -> Result<TPMS_CONTEXT, TpmError>;

    /// Returns the physical handle the context was loaded under
    fn context_load(&mut self, context: &TPMS_CONTEXT) -> Result<u32, TpmError>;

    fn flush_context(&mut self, physical: u32) -> Result<(), TpmError>;
}

#[derive(Debug)]
pub struct ResourceManager {
    entries: HashMap<u32, Entry>,
    max_objects: usize,
    max_sessions: usize,
    tick: u64,
    next_object: u32,
}

impl ResourceManager {
    pub fn new(max_objects: usize, max_sessions: usize) -> Self {
        ResourceManager {
            entries: HashMap::new(),
            max_objects: max_objects.max(1),
            max_sessions: max_sessions.max(1),
            tick: 0,
            next_object: LOGICAL_OBJECT_BASE,
        }
    }

    pub fn set_capacity(&mut self, max_objects: usize, max_sessions: usize) {
        self.max_objects = max_objects.max(1);
        self.max_sessions = max_sessions.max(1);
        debug!(
            "Resource manager capacity: {} objects, {} sessions",
            self.max_objects, self.max_sessions
        );
    }

    pub fn capacity(&self, kind: SlotKind) -> usize {
        match kind {
            SlotKind::Object => self.max_objects,
            SlotKind::Session => self.max_sessions,
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn contains(&self, logical: u32) -> bool {
        self.entries.contains_key(&logical)
    }

    pub fn state(&self, logical: u32) -> Option<&HandleState> {
        self.entries.get(&logical).map(|e| &e.state)
    }

    /// Logical handles of the given kind, ascending
    pub fn logical_handles(&self, kind: SlotKind) -> Vec<u32> {
        let mut handles: Vec<u32> = self
            .entries
            .iter()
            .filter(|(_, e)| e.kind == kind)
            .map(|(h, _)| *h)
            .collect();
        handles.sort_unstable();
        handles
    }

    pub fn loaded_count(&self, kind: SlotKind) -> usize {
        self.entries
            .values()
            .filter(|e| e.kind == kind && matches!(e.state, HandleState::Active(_)))
            .count()
    }

    fn touch(&mut self, logical: u32) {
        self.tick += 1;
        if let Some(entry) = self.entries.get_mut(&logical) {
            entry.last_used = self.tick;
        }
    }

    fn allocate_object_handle(&mut self) -> u32 {
        loop {
            let candidate = self.next_object;
            self.next_object = if self.next_object == 0x80FF_FFFF {
                LOGICAL_OBJECT_BASE
            } else {
                self.next_object + 1
            };
            if !self.entries.contains_key(&candidate) {
                return candidate;
            }
        }
    }

    /// Make every handle in `logical_handles` loaded, returning the physical
    /// handles to put on the wire in the same order.
    ///
    /// Handles the resource manager does not own (PCRs, NV indices, persistent
    /// and permanent handles) pass through unchanged. `new_slot` reserves room
    /// for an entity the command is about to create.
    pub fn resolve<O: ContextOps>(
        &mut self,
        ops: &mut O,
        logical_handles: &[u32],
        new_slot: Option<SlotKind>,
    ) -> Result<Vec<u32>, TpmError> {
        let mut pinned: Vec<u32> = Vec::new();
        for &handle in logical_handles {
            match self.entries.get(&handle) {
                Some(entry) => {
                    if matches!(entry.state, HandleState::Invalid) {
                        return Err(TpmError::ContextLost(handle));
                    }
                    if !pinned.contains(&handle) {
                        pinned.push(handle);
                    }
                }
                None if handle >= LOGICAL_OBJECT_BASE && SlotKind::of_handle(handle).is_some() => {
                    return Err(TpmError::InvalidHandle(handle));
                }
                None if SlotKind::of_handle(handle) == Some(SlotKind::Session) => {
                    return Err(TpmError::InvalidHandle(handle));
                }
                None => {}
            }
        }

        for kind in [SlotKind::Object, SlotKind::Session] {
            let pinned_count = pinned
                .iter()
                .filter(|h| self.entries.get(*h).map(|e| e.kind) == Some(kind))
                .count()
                + usize::from(new_slot == Some(kind));
            let slots = self.capacity(kind);
            if pinned_count > slots {
                return Err(TpmError::Capacity {
                    kind,
                    pinned: pinned_count,
                    slots,
                });
            }

            let to_load = pinned
                .iter()
                .filter(|h| {
                    self.entries
                        .get(*h)
                        .map_or(false, |e| e.kind == kind && matches!(e.state, HandleState::Saved(_)))
                })
                .count()
                + usize::from(new_slot == Some(kind));

            while self.loaded_count(kind) + to_load > slots {
                let victim = self.lru_victim(kind, &pinned).ok_or(TpmError::Capacity {
                    kind,
                    pinned: pinned_count,
                    slots,
                })?;
                self.evict(ops, victim)?;
            }
        }

        for &handle in &pinned {
            self.load(ops, handle)?;
            self.touch(handle);
        }

        Ok(logical_handles
            .iter()
            .map(|h| match self.entries.get(h).map(|e| &e.state) {
                Some(HandleState::Active(physical)) => *physical,
                _ => *h,
            })
            .collect())
    }

    fn lru_victim(&self, kind: SlotKind, pinned: &[u32]) -> Option<u32> {
        self.entries
            .iter()
            .filter(|(h, e)| {
                e.kind == kind && matches!(e.state, HandleState::Active(_)) && !pinned.contains(*h)
            })
            .min_by_key(|(_, e)| e.last_used)
            .map(|(h, _)| *h)
    }

    /// Move a loaded entity off the TPM. Objects stay loaded after ContextSave
    /// and must be flushed; sessions are unloaded by the save itself.
    fn evict<O: ContextOps>(&mut self, ops: &mut O, logical: u32) -> Result<(), TpmError> {
        let Some(entry) = self.entries.get(&logical) else {
            return Ok(());
        };
        let HandleState::Active(physical) = entry.state else {
            return Ok(());
        };
        let kind = entry.kind;

        let context = ops.context_save(physical)?;
        if kind == SlotKind::Object {
            ops.flush_context(physical)?;
        }

        trace!("Evicted {:?} 0x{:08X} (physical 0x{:08X})", kind, logical, physical);
        if let Some(entry) = self.entries.get_mut(&logical) {
            entry.state = HandleState::Saved(context);
        }
        Ok(())
    }

    fn load<O: ContextOps>(&mut self, ops: &mut O, logical: u32) -> Result<(), TpmError> {
        let context = match self.entries.get(&logical).map(|e| &e.state) {
            Some(HandleState::Saved(context)) => context.clone(),
            _ => return Ok(()),
        };

        match ops.context_load(&context) {
            Ok(physical) => {
                trace!("Reloaded 0x{:08X} as physical 0x{:08X}", logical, physical);
                if let Some(entry) = self.entries.get_mut(&logical) {
                    entry.state = HandleState::Active(physical);
                }
                Ok(())
            }
            Err(err) if err.is_transport() => Err(err),
            Err(err) => {
                warn!("Saved context of 0x{:08X} could not be loaded: {}", logical, err);
                if let Some(entry) = self.entries.get_mut(&logical) {
                    entry.state = HandleState::Invalid;
                }
                Err(TpmError::ContextLost(logical))
            }
        }
    }

    /// Track a newly created entity that is loaded at `physical`.
    ///
    /// Sessions keep their TPM handle across save and load, so their logical
    /// handle is the physical one. Objects get a stable virtual handle.
    pub fn register(&mut self, kind: SlotKind, physical: u32) -> u32 {
        let logical = match kind {
            SlotKind::Object => self.allocate_object_handle(),
            SlotKind::Session => physical,
        };
        self.entries.insert(
            logical,
            Entry {
                kind,
                state: HandleState::Active(physical),
                last_used: 0,
            },
        );
        self.touch(logical);
        debug!("Registered {:?} 0x{:08X} (physical 0x{:08X})", kind, logical, physical);
        logical
    }

    /// Remove `logical` from the TPM and from the table
    pub fn flush<O: ContextOps>(&mut self, ops: &mut O, logical: u32) -> Result<(), TpmError> {
        let entry = self.entries.get(&logical).ok_or(TpmError::InvalidHandle(logical))?;
        let kind = entry.kind;

        match entry.state {
            HandleState::Active(physical) => ops.flush_context(physical)?,
            // A saved session still holds its handle in the TPM
            HandleState::Saved(_) if kind == SlotKind::Session => ops.flush_context(logical)?,
            HandleState::Saved(_) | HandleState::Invalid => {}
        }
        self.entries.remove(&logical);
        debug!("Flushed {:?} 0x{:08X}", kind, logical);
        Ok(())
    }

    /// Drop `logical` from the table without touching the TPM (the TPM already released it)
    pub fn forget(&mut self, logical: u32) {
        if self.entries.remove(&logical).is_some() {
            trace!("Forgot 0x{:08X}", logical);
        }
    }

    /// After a TPM reset every loaded entity is gone and saved contexts no longer load
    pub fn invalidate_all(&mut self) {
        for entry in self.entries.values_mut() {
            entry.state = HandleState::Invalid;
        }
    }
}
