//! Dandelion++ source-to-stem mapping.
//!
//! Each epoch a small set of outbound connections becomes the stem set.
//! Every tx source maps to one stem slot for the whole epoch, chosen
//! least-loaded with uniform tie-breaks, so an observer of one stem peer
//! cannot correlate sources across epochs.

use rand::seq::SliceRandom;
use rand::Rng;
use std::collections::BTreeMap;
use uuid::Uuid;

/// Maps tx sources to stem slots. Slots hold `None` when their peer
/// disconnected mid-epoch; `update` refills them from fresh candidates.
#[derive(Debug, Clone, Default)]
pub struct ConnectionMap {
    /// Live stem peers; `len() <= usage_count.len()`, entries distinct
    out_mapping: Vec<Option<Uuid>>,
    /// source -> index into `out_mapping`
    in_mapping: BTreeMap<Uuid, usize>,
    /// `usage_count[i]` = number of sources mapped to slot `i`
    usage_count: Vec<usize>,
}

/// Least-loaded live slot, ties broken uniformly at random
fn select_stem<R: Rng>(
    rng: &mut R,
    usage: &[usize],
    out_mapping: &[Option<Uuid>],
) -> Option<usize> {
    let mut lowest = usize::MAX;
    let mut choices: Vec<usize> = Vec::with_capacity(out_mapping.len());
    for (slot, out) in out_mapping.iter().enumerate() {
        if out.is_some() {
            if usage[slot] < lowest {
                lowest = usage[slot];
                choices.clear();
                choices.push(slot);
            } else if usage[slot] == lowest {
                choices.push(slot);
            }
        }
    }
    choices.choose(rng).copied()
}

impl ConnectionMap {
    /// Pick `min(stems, out_connections.len())` connections uniformly at
    /// random (without replacement) as the initial stem set.
    pub fn new(mut out_connections: Vec<Uuid>, stems: usize) -> Self {
        let mut rng = rand::thread_rng();
        if stems < out_connections.len() {
            // partial Fisher-Yates: only the first `stems` picks matter
            for i in 0..stems {
                let j = i + rng.gen_range(0..out_connections.len() - i);
                out_connections.swap(i, j);
            }
            out_connections.truncate(stems);
        } else {
            out_connections.shuffle(&mut rng);
        }

        Self {
            out_mapping: out_connections.into_iter().map(Some).collect(),
            in_mapping: BTreeMap::new(),
            usage_count: vec![0; stems],
        }
    }

    /// Number of live stem slots
    pub fn size(&self) -> usize {
        self.out_mapping.iter().filter(|slot| slot.is_some()).count()
    }

    /// Stem peer bound to channel/slot `index`, if any
    pub fn slot(&self, index: usize) -> Option<Uuid> {
        self.out_mapping.get(index).copied().flatten()
    }

    pub fn slot_count(&self) -> usize {
        self.out_mapping.len()
    }

    /// Drop slots whose peer left `current` and refill vacancies from the
    /// remaining candidates in random order. Returns whether any slot
    /// changed.
    pub fn update(&mut self, mut current: Vec<Uuid>) -> bool {
        current.sort_unstable();

        let mut replaced = false;
        for existing in &mut self.out_mapping {
            if let Some(id) = existing {
                match current.binary_search(id) {
                    Ok(pos) => {
                        // already a stem; remove from the candidate list
                        current.remove(pos);
                    }
                    Err(_) => {
                        *existing = None;
                        replaced = true;
                    }
                }
            }
        }

        if !replaced && self.out_mapping.len() == self.usage_count.len() {
            return false;
        }

        let existing_outs = self.out_mapping.len();
        let mut rng = rand::thread_rng();
        for slot in 0..self.usage_count.len() {
            if current.is_empty() {
                break;
            }
            let grow = self.out_mapping.len() <= slot;
            if grow || self.out_mapping[slot].is_none() {
                let pick = rng.gen_range(0..current.len());
                let last = current.len() - 1;
                current.swap(pick, last);
                let id = current.pop().expect("non-empty checked");
                if grow {
                    self.out_mapping.push(Some(id));
                } else {
                    self.out_mapping[slot] = Some(id);
                }
            }
        }

        replaced || existing_outs < self.out_mapping.len()
    }

    /// Stem peer for `source`; stable within an epoch unless the mapped
    /// peer disconnected, in which case the source is remapped.
    pub fn get_stem(&mut self, source: Uuid) -> Option<Uuid> {
        let mut rng = rand::thread_rng();
        match self.in_mapping.get(&source).copied() {
            None => {
                let slot = select_stem(&mut rng, &self.usage_count, &self.out_mapping)?;
                self.in_mapping.insert(source, slot);
                self.usage_count[slot] += 1;
                self.out_mapping[slot]
            }
            Some(slot) if self.out_mapping[slot].is_none() => {
                // mapped peer disconnected after the mapping was made
                self.usage_count[slot] -= 1;
                match select_stem(&mut rng, &self.usage_count, &self.out_mapping) {
                    None => {
                        self.in_mapping.remove(&source);
                        None
                    }
                    Some(fresh) => {
                        self.in_mapping.insert(source, fresh);
                        self.usage_count[fresh] += 1;
                        self.out_mapping[fresh]
                    }
                }
            }
            Some(slot) => self.out_mapping[slot],
        }
    }
}
