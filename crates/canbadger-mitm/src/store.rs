//! Two-tier rule storage: a small in-memory index of `(target ID, offset)`
//! pairs, and the rule bodies themselves in external SRAM, 51 consecutive
//! 20-byte slots per target terminated by `0xFFFF`.

use canbadger_core::frame::MAX_STANDARD_ID;
use canbadger_core::{FrameFormat, Storage, StorageError};

use crate::rule::Rule;

/// Index entries are 7 bytes (4-byte ID + 3-byte offset) in 2 KiB on-chip
pub const INDEX_CAPACITY: usize = 2048 / 7;
/// Rule chain length limit per target ID
pub const RULES_PER_TARGET: usize = 51;
/// Arena bytes reserved per target ID
pub const TARGET_STRIDE: u32 = 1024;
/// Index entry marking the end of the table
pub const INDEX_SENTINEL: u32 = 0xFFFF_FFFF;

pub struct RuleStore<S: Storage> {
    /// `(target_id, arena_offset)` pairs, in insertion order
    index: Vec<(u32, u32)>,
    arena: S,
    format: FrameFormat,
    promoted: bool,
}

impl<S: Storage> RuleStore<S> {
    /// Wrap an arena, invalidating any leftover rule bodies
    pub fn new(mut arena: S, format: FrameFormat) -> Result<Self, StorageError> {
        arena.fill(0xFF)?;
        Ok(Self {
            index: Vec::new(),
            arena,
            format,
            promoted: false,
        })
    }

    /// The frame format outgoing frames use.
    ///
    /// Starts as configured but flips to Extended the first time a target ID
    /// above 11 bits is inserted.
    #[inline]
    #[must_use]
    pub fn format(&self) -> FrameFormat {
        self.format
    }

    #[inline]
    #[must_use]
    pub fn target_count(&self) -> usize {
        self.index.len()
    }

    /// Arena offset of the rule chain for `target_id`, if indexed
    #[must_use]
    pub fn lookup(&self, target_id: u32) -> Option<u32> {
        self.index
            .iter()
            .find(|(id, _)| *id == target_id)
            .map(|(_, offset)| *offset)
    }

    /// Add one rule to the chain for `target_id`.
    ///
    /// Returns `Ok(false)` without storing when the index is full, the chain
    /// already holds [RULES_PER_TARGET] rules, or an identical rule body is
    /// already present.
    pub fn insert(&mut self, target_id: u32, rule: &Rule) -> Result<bool, StorageError> {
        if target_id > MAX_STANDARD_ID && self.format == FrameFormat::Standard {
            // rule files are allowed to outgrow an 11-bit configuration;
            // flip the whole engine to extended rather than clip the ID
            self.format = FrameFormat::Extended;
            if !self.promoted {
                self.promoted = true;
                tracing::warn!(
                    "Target ID {target_id:#X} exceeds 11 bits; switching the engine to extended frames"
                );
            }
        }

        let offset = match self.lookup(target_id) {
            Some(offset) => offset,
            None => {
                if self.index.len() >= INDEX_CAPACITY {
                    tracing::warn!("Rule index is full, refusing target {target_id:#X}");
                    return Ok(false);
                }
                let offset = self.index.len() as u32 * TARGET_STRIDE;
                self.index.push((target_id, offset));
                offset
            }
        };

        let body = rule.to_bytes();
        for slot in 0..RULES_PER_TARGET {
            let slot_addr = offset + (slot * Rule::SIZE) as u32;
            let mut stored = [0; Rule::SIZE];
            self.arena.read(slot_addr, &mut stored)?;
            if stored[0] == 0xFF && stored[1] == 0xFF {
                // free slot: write the body plus the new terminator
                let mut write = [0xFF; Rule::SIZE + 2];
                write[..Rule::SIZE].copy_from_slice(&body);
                self.arena.write(slot_addr, &write)?;
                return Ok(true);
            }
            if stored == body {
                return Ok(false);
            }
        }
        tracing::debug!("Rule chain for {target_id:#X} is full");
        Ok(false)
    }

    /// Walk the chain for `target_id` in insertion order
    pub fn rules_for(&mut self, target_id: u32) -> Result<Vec<Rule>, StorageError> {
        let Some(offset) = self.lookup(target_id) else {
            return Ok(Vec::new());
        };
        let mut rules = Vec::new();
        for slot in 0..RULES_PER_TARGET {
            let mut stored = [0; Rule::SIZE];
            self.arena.read(offset + (slot * Rule::SIZE) as u32, &mut stored)?;
            if stored[0] == 0xFF && stored[1] == 0xFF {
                break;
            }
            rules.push(Rule::from_bytes(&stored));
        }
        Ok(rules)
    }

    /// Read the 20-byte body at `offset + slot * 20`, or None at the terminator
    pub fn rule_at(&mut self, offset: u32, slot: usize) -> Result<Option<Rule>, StorageError> {
        let mut stored = [0; Rule::SIZE];
        self.arena.read(offset + (slot * Rule::SIZE) as u32, &mut stored)?;
        if stored[0] == 0xFF && stored[1] == 0xFF {
            return Ok(None);
        }
        Ok(Some(Rule::from_bytes(&stored)))
    }

    /// Drop the index and invalidate the arena
    pub fn reset(&mut self) -> Result<(), StorageError> {
        self.index.clear();
        self.arena.fill(0xFF)
    }
}
