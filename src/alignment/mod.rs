use std::fmt;

use anyhow::bail;
use bio::io::fasta::Record;
use hashbrown::{HashMap, HashSet};
use log::debug;
use rand::Rng;

use crate::alphabets::SeqType;
use crate::io::DataError;
use crate::Result;

mod super_alignment;
pub use super_alignment::*;

/// Distance reported for a pair of taxa without shared data, or when the
/// corrected distance is beyond what the model can represent.
pub const MAX_GENETIC_DIST: f64 = 9.0;

/// Jukes-Cantor style correction of an observed distance for `num_states` states.
pub(crate) fn corrected_distance(observed: f64, num_states: usize) -> f64 {
    let z = num_states as f64 / (num_states as f64 - 1.0);
    let x = 1.0 - z * observed;
    if x <= 0.0 {
        return MAX_GENETIC_DIST;
    }
    f64::min(-x.ln() / z, MAX_GENETIC_DIST)
}

/// One distinct alignment column with the number of sites it stands for.
#[derive(Debug, Clone, PartialEq)]
pub struct Pattern {
    pub(crate) states: Vec<u8>,
    pub(crate) frequency: usize,
    pub(crate) is_const: bool,
}

impl Pattern {
    pub fn new(states: Vec<u8>, frequency: usize, num_states: usize) -> Self {
        let mut known = states.iter().filter(|&&s| (s as usize) < num_states);
        let is_const = match known.next() {
            Some(first) => known.all(|s| s == first),
            None => true,
        };
        Self {
            states,
            frequency,
            is_const,
        }
    }

    pub fn states(&self) -> &[u8] {
        &self.states
    }

    pub fn frequency(&self) -> usize {
        self.frequency
    }

    pub fn is_const(&self) -> bool {
        self.is_const
    }
}

/// Alignment of one partition compressed into unique site patterns.
/// Patterns keep the order in which they first occur.
#[derive(Debug, Clone)]
pub struct Alignment {
    pub(crate) names: Vec<String>,
    pub(crate) patterns: Vec<Pattern>,
    pub(crate) site_pattern: Vec<usize>,
    pub(crate) seq_type: SeqType,
    pattern_index: HashMap<Vec<u8>, usize>,
}

impl fmt::Display for Alignment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (row, name) in self.names.iter().enumerate() {
            let seq = self
                .site_pattern
                .iter()
                .map(|&p| {
                    let state = self.patterns[p].states[row];
                    match self.seq_type.decode(state) {
                        Some(chars) => String::from_utf8_lossy(&chars).to_string(),
                        None => "-".repeat(self.seq_type.site_width()),
                    }
                })
                .collect::<String>();
            writeln!(f, ">{name}\n{seq}")?;
        }
        Ok(())
    }
}

impl Alignment {
    /// Alignment over the given taxa without any sites.
    pub fn empty(names: Vec<String>, seq_type: SeqType) -> Self {
        Self {
            names,
            patterns: Vec::new(),
            site_pattern: Vec::new(),
            seq_type,
            pattern_index: HashMap::new(),
        }
    }

    /// Builds an alignment from aligned fasta records.
    ///
    /// # Errors
    /// Fails with a `DataError` if there are no records, if names repeat or if the sequences
    /// differ in length.
    pub fn from_records(records: &[Record], seq_type: SeqType) -> Result<Self> {
        if records.is_empty() {
            bail!(DataError {
                message: String::from("No sequences provided for the alignment")
            });
        }
        let mut seen = HashSet::with_capacity(records.len());
        for rec in records {
            if !seen.insert(rec.id()) {
                bail!(DataError {
                    message: format!("Duplicate sequence name {}", rec.id())
                });
            }
        }
        let len = records[0].seq().len();
        if let Some(rec) = records.iter().find(|rec| rec.seq().len() != len) {
            bail!(DataError {
                message: format!(
                    "Sequences are not aligned, {} has length {} instead of {}",
                    rec.id(),
                    rec.seq().len(),
                    len
                )
            });
        }
        let rows: Vec<Vec<u8>> = records
            .iter()
            .map(|rec| seq_type.encode_sequence(rec.seq()))
            .collect();
        let names = records.iter().map(|rec| rec.id().to_string()).collect();
        let mut alignment = Self::empty(names, seq_type);
        let num_sites = rows.first().map_or(0, |row| row.len());
        for site in 0..num_sites {
            alignment.push_site(rows.iter().map(|row| row[site]).collect());
        }
        debug!(
            "Compressed {} sites of {} taxa into {} patterns",
            alignment.num_sites(),
            alignment.num_taxa(),
            alignment.num_patterns()
        );
        Ok(alignment)
    }

    /// Adds `frequency` sites with the column `states`, merging it into an existing pattern
    /// when the column has been seen before. Returns the pattern index.
    pub fn add_pattern(&mut self, states: Vec<u8>, frequency: usize) -> usize {
        debug_assert_eq!(states.len(), self.names.len());
        if let Some(&idx) = self.pattern_index.get(&states) {
            self.patterns[idx].frequency += frequency;
            return idx;
        }
        let idx = self.patterns.len();
        self.pattern_index.insert(states.clone(), idx);
        self.patterns
            .push(Pattern::new(states, frequency, self.num_states()));
        idx
    }

    /// Appends one site.
    pub fn push_site(&mut self, states: Vec<u8>) {
        let idx = self.add_pattern(states, 1);
        self.site_pattern.push(idx);
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        self.names.iter().position(|n| n == name)
    }

    pub fn patterns(&self) -> &[Pattern] {
        &self.patterns
    }

    pub fn seq_type(&self) -> SeqType {
        self.seq_type
    }

    pub fn num_states(&self) -> usize {
        self.seq_type.num_states()
    }

    pub fn num_taxa(&self) -> usize {
        self.names.len()
    }

    pub fn num_patterns(&self) -> usize {
        self.patterns.len()
    }

    pub fn num_sites(&self) -> usize {
        self.site_pattern.len()
    }

    /// State of taxon `taxon` at site `site`.
    pub fn state(&self, taxon: usize, site: usize) -> u8 {
        self.patterns[self.site_pattern[site]].states[taxon]
    }

    /// Weighted count of mismatching sites and of sites where both taxa have a known state.
    pub(crate) fn pair_counts(&self, a: usize, b: usize) -> (f64, f64) {
        let num_states = self.num_states() as u8;
        self.patterns
            .iter()
            .filter(|p| p.states[a] < num_states && p.states[b] < num_states)
            .fold((0.0, 0.0), |(diff, total), p| {
                let freq = p.frequency as f64;
                if p.states[a] != p.states[b] {
                    (diff + freq, total + freq)
                } else {
                    (diff, total + freq)
                }
            })
    }

    /// Proportion of differing sites among those where both taxa are known.
    pub fn observed_distance(&self, a: usize, b: usize) -> f64 {
        let (diff, total) = self.pair_counts(a, b);
        if total == 0.0 {
            MAX_GENETIC_DIST
        } else {
            diff / total
        }
    }

    pub fn ml_distance(&self, a: usize, b: usize) -> f64 {
        corrected_distance(self.observed_distance(a, b), self.num_states())
    }

    /// Resamples the sites with replacement.
    pub fn bootstrap(&self, rng: &mut impl Rng) -> Alignment {
        let mut replicate = Alignment::empty(self.names.clone(), self.seq_type);
        let num_sites = self.num_sites();
        for _ in 0..num_sites {
            let site = rng.gen_range(0..num_sites);
            replicate.push_site(self.patterns[self.site_pattern[site]].states.clone());
        }
        replicate
    }
}
