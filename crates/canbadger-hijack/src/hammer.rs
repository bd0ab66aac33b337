//! The seed hammer: force an ECU to hand out SecurityAccess seeds over and
//! over to expose weak challenge randomness.

use std::sync::atomic::{AtomicBool, Ordering};

use byteorder::{BigEndian, ByteOrder};
use canbadger_core::{CanBus, SdCard, StorageError};
use canbadger_diag::{DiagError, UdsClient};

/// Consecutive failures before a variance technique is retired
pub const TECHNIQUE_RETRY_CAP: u32 = 5;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct HammerConfig {
    /// SecurityAccess level to hammer
    pub level: u8,
    /// Alternate level used by the level-change technique
    pub alt_level: u8,
    /// Samples to collect before declaring success
    pub max_samples: usize,
}

impl Default for HammerConfig {
    fn default() -> Self {
        Self {
            level: 0x01,
            alt_level: 0x03,
            max_samples: 512,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HammerVerdict {
    /// Seeds varied for the whole sample run
    SeedsVary,
    /// Every variance technique retired without moving the seed
    NotVulnerable,
    /// Stopped from outside before a verdict
    Stopped,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HammerOutcome {
    pub verdict: HammerVerdict,
    pub seeds: Vec<u32>,
}

/// The three ways to coax a fresh seed out of a stuck ECU, in priority order
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Technique {
    Rerequest,
    LevelChange,
    SessionBounce,
}

const TECHNIQUES: [Technique; 3] = [
    Technique::Rerequest,
    Technique::LevelChange,
    Technique::SessionBounce,
];

pub struct Hammer<'a, B: CanBus> {
    client: &'a mut UdsClient<B>,
    config: HammerConfig,
    enabled: [bool; 3],
    failures: [u32; 3],
}

impl<'a, B: CanBus> Hammer<'a, B> {
    /// Requires an established diagnostic session on `client`
    pub fn new(client: &'a mut UdsClient<B>, config: HammerConfig) -> Self {
        Self {
            client,
            config,
            enabled: [true; 3],
            failures: [0; 3],
        }
    }

    /// Collect seeds until the sample target is reached, every technique
    /// retires, or `running` clears. Each fresh seed is handed to `on_seed`.
    pub fn run(
        &mut self,
        running: &AtomicBool,
        mut on_seed: impl FnMut(u32) -> Result<(), StorageError>,
    ) -> Result<HammerOutcome, DiagError> {
        let mut seeds: Vec<u32> = Vec::new();
        let mut previous: Option<u32> = None;

        while running.load(Ordering::Relaxed) {
            let seed = self.fetch_seed(self.config.level)?;

            if previous == Some(seed) {
                let Some((index, technique)) = self.active_technique() else {
                    tracing::info!(
                        "Seed stuck at {seed:#010X} and all techniques retired; not vulnerable"
                    );
                    return Ok(HammerOutcome {
                        verdict: HammerVerdict::NotVulnerable,
                        seeds,
                    });
                };
                self.apply_technique(technique)?;
                let retry = self.fetch_seed(self.config.level)?;
                if retry == seed {
                    self.record_failure(index);
                    continue;
                }
                self.failures = [0; 3];
                previous = Some(retry);
                seeds.push(retry);
                if let Err(e) = on_seed(retry) {
                    tracing::warn!("Failed to persist seed sample: {e}");
                }
            } else {
                self.failures = [0; 3];
                previous = Some(seed);
                seeds.push(seed);
                if let Err(e) = on_seed(seed) {
                    tracing::warn!("Failed to persist seed sample: {e}");
                }
            }

            if seeds.len() >= self.config.max_samples {
                return Ok(HammerOutcome {
                    verdict: HammerVerdict::SeedsVary,
                    seeds,
                });
            }
        }
        Ok(HammerOutcome {
            verdict: HammerVerdict::Stopped,
            seeds,
        })
    }

    fn fetch_seed(&mut self, level: u8) -> Result<u32, DiagError> {
        let seed = self.client.request_seed(level)?;
        if seed.len() < 4 {
            // short seeds pad out with zeros rather than aborting the run
            let mut padded = [0u8; 4];
            padded[..seed.len()].copy_from_slice(&seed);
            return Ok(BigEndian::read_u32(&padded));
        }
        Ok(BigEndian::read_u32(&seed[..4]))
    }

    fn active_technique(&self) -> Option<(usize, Technique)> {
        TECHNIQUES
            .iter()
            .enumerate()
            .find(|(i, _)| self.enabled[*i])
            .map(|(i, t)| (i, *t))
    }

    fn apply_technique(&mut self, technique: Technique) -> Result<(), DiagError> {
        match technique {
            Technique::Rerequest => Ok(()),
            Technique::LevelChange => {
                // a seed request on another level; its value is discarded
                match self.fetch_seed(self.config.alt_level) {
                    Ok(_) => Ok(()),
                    Err(DiagError::Negative { .. }) => Ok(()),
                    Err(e) => Err(e),
                }
            }
            Technique::SessionBounce => {
                // hop to another session and back; the +2 fallback matches
                // the hardware tool and may well pick a session the ECU
                // rejects, which still counts as a bounce
                let current = self.client.current_session();
                let detour = current.wrapping_add(2);
                tracing::warn!("Session bounce via untested session {detour:#04X}");
                if let Err(e @ DiagError::Transport(_)) = self.client.start_diag_session(detour) {
                    return Err(e);
                }
                if let Err(e @ DiagError::Transport(_)) = self.client.start_diag_session(current) {
                    return Err(e);
                }
                Ok(())
            }
        }
    }

    fn record_failure(&mut self, index: usize) {
        self.failures[index] += 1;
        if self.failures[index] >= TECHNIQUE_RETRY_CAP {
            self.enabled[index] = false;
            tracing::info!("Variance technique {:?} retired", TECHNIQUES[index]);
        }
    }
}

/// Append one 4-byte big-endian seed sample to the collection file
pub fn append_seed(sd: &SdCard, path: &str, seed: u32) -> Result<(), StorageError> {
    sd.append(path, &seed.to_be_bytes())
}

/// Convert a collected seed file (consecutive 4-byte big-endian samples)
/// into a CSV of `sample,seed,delta` rows for offline entropy analysis.
pub fn seeds_to_csv<W: std::io::Write>(data: &[u8], writer: W) -> Result<(), csv::Error> {
    let mut csv = csv::Writer::from_writer(writer);
    csv.write_record(["sample", "seed", "delta"])?;
    let mut previous: Option<u32> = None;
    for (i, chunk) in data.chunks_exact(4).enumerate() {
        let seed = BigEndian::read_u32(chunk);
        let delta = match previous {
            Some(prev) => seed.wrapping_sub(prev) as i64,
            None => 0,
        };
        csv.write_record([
            i.to_string(),
            format!("{seed:08X}"),
            delta.to_string(),
        ])?;
        previous = Some(seed);
    }
    csv.flush()?;
    Ok(())
}
