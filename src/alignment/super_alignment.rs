use anyhow::bail;
use fixedbitset::FixedBitSet;
use hashbrown::HashMap;
use log::{info, warn};
use nalgebra::DMatrix;
use rand::Rng;

use crate::alignment::{corrected_distance, Alignment, MAX_GENETIC_DIST};
use crate::alphabets::SeqType;
use crate::errors::StructuralError;
use crate::Result;

/// How bootstrap replicates of a partitioned alignment are drawn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BootstrapMode {
    /// Sites are resampled within each partition.
    #[default]
    Site,
    /// Whole partitions are resampled with replacement.
    Gene,
    /// Partitions are resampled, then sites within each drawn partition.
    GeneSite,
}

/// Partitioned alignment. Taxa get a global id the first time any partition mentions them,
/// `taxa_index[global][partition]` holds the row of the taxon in that partition.
#[derive(Debug, Clone, Default)]
pub struct SuperAlignment {
    pub(crate) partitions: Vec<Alignment>,
    pub(crate) names: Vec<String>,
    pub(crate) taxa_index: Vec<Vec<Option<usize>>>,
    name_index: HashMap<String, usize>,
}

impl SuperAlignment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_partitions(partitions: Vec<Alignment>) -> Self {
        let mut alignment = Self::new();
        for partition in partitions {
            alignment.add_partition(partition);
        }
        alignment
    }

    /// Appends a partition and returns its index. State count mismatches between partitions
    /// are only reported when distances are computed.
    pub fn add_partition(&mut self, partition: Alignment) -> usize {
        self.partitions.push(partition);
        let p = self.partitions.len() - 1;
        self.link_partition(p);
        p
    }

    /// Recomputes the presence index column of partition `p`.
    pub fn link_partition(&mut self, p: usize) {
        let num_partitions = self.partitions.len();
        for row in self.taxa_index.iter_mut() {
            row.resize(num_partitions, None);
            row[p] = None;
        }
        for (local, name) in self.partitions[p].names.iter().enumerate() {
            let global = match self.name_index.get(name) {
                Some(&global) => global,
                None => {
                    let global = self.names.len();
                    self.names.push(name.clone());
                    self.name_index.insert(name.clone(), global);
                    self.taxa_index.push(vec![None; num_partitions]);
                    global
                }
            };
            self.taxa_index[global][p] = Some(local);
        }
    }

    pub fn partitions(&self) -> &[Alignment] {
        &self.partitions
    }

    pub fn partition(&self, p: usize) -> &Alignment {
        &self.partitions[p]
    }

    pub fn num_partitions(&self) -> usize {
        self.partitions.len()
    }

    pub fn names(&self) -> &[String] {
        &self.names
    }

    pub fn num_taxa(&self) -> usize {
        self.names.len()
    }

    pub fn taxon_index(&self, name: &str) -> Option<usize> {
        self.name_index.get(name).copied()
    }

    /// Row of global taxon `taxon` in partition `p`, `None` if the taxon is absent there.
    pub fn local_index(&self, taxon: usize, p: usize) -> Option<usize> {
        self.taxa_index[taxon][p]
    }

    /// Global taxa present in partition `p`.
    pub fn presence(&self, p: usize) -> FixedBitSet {
        let mut present = FixedBitSet::with_capacity(self.num_taxa());
        for (taxon, row) in self.taxa_index.iter().enumerate() {
            if row[p].is_some() {
                present.insert(taxon);
            }
        }
        present
    }

    /// Binary meta-alignment with one site per partition, state 1 where the taxon is present.
    pub fn presence_alignment(&self) -> Alignment {
        let mut presence = Alignment::empty(self.names.clone(), SeqType::Binary);
        for p in 0..self.num_partitions() {
            presence.push_site(
                self.taxa_index
                    .iter()
                    .map(|row| u8::from(row[p].is_some()))
                    .collect(),
            );
        }
        presence
    }

    pub fn num_sites(&self) -> usize {
        self.partitions.iter().map(|p| p.num_sites()).sum()
    }

    /// Pattern frequencies of all partitions, one after another.
    pub fn pattern_freqs(&self) -> Vec<usize> {
        self.partitions
            .iter()
            .flat_map(|p| p.patterns.iter().map(|pattern| pattern.frequency))
            .collect()
    }

    fn shared_partitions(&self, a: usize, b: usize) -> impl Iterator<Item = (usize, usize, usize)> + '_ {
        self.partitions
            .iter()
            .enumerate()
            .filter_map(move |(p, _)| match (self.taxa_index[a][p], self.taxa_index[b][p]) {
                (Some(la), Some(lb)) => Some((p, la, lb)),
                _ => None,
            })
    }

    /// Proportion of differing sites over the partitions that contain both taxa.
    /// Returns `MAX_GENETIC_DIST` if the taxa share no data.
    pub fn observed_distance(&self, a: usize, b: usize) -> f64 {
        let (diff, total) = self
            .shared_partitions(a, b)
            .map(|(p, la, lb)| self.partitions[p].pair_counts(la, lb))
            .fold((0.0, 0.0), |(d, t), (pd, pt)| (d + pd, t + pt));
        if total == 0.0 {
            MAX_GENETIC_DIST
        } else {
            diff / total
        }
    }

    /// Corrected distance over the shared partitions.
    ///
    /// # Errors
    /// Fails with a `StructuralError` if the shared partitions disagree on the number of states.
    pub fn ml_distance(&self, a: usize, b: usize) -> Result<f64> {
        let mut num_states = None;
        for (p, _, _) in self.shared_partitions(a, b) {
            let states = self.partitions[p].num_states();
            match num_states {
                None => num_states = Some(states),
                Some(expected) if expected != states => bail!(StructuralError::new(
                    "pairwise distance",
                    format!(
                        "taxa {} and {} share partitions with {} and {} states",
                        self.names[a], self.names[b], expected, states
                    )
                )),
                Some(_) => {}
            }
        }
        match num_states {
            Some(states) => Ok(corrected_distance(self.observed_distance(a, b), states)),
            None => Ok(MAX_GENETIC_DIST),
        }
    }

    /// Fraction of taxon by site cells that are absent because a taxon is missing from a partition.
    pub fn missing_data_fraction(&self) -> f64 {
        let total_sites = self.num_sites();
        if total_sites == 0 || self.num_taxa() == 0 {
            return 0.0;
        }
        let present: usize = self
            .partitions
            .iter()
            .map(|p| p.num_taxa() * p.num_sites())
            .sum();
        1.0 - present as f64 / (self.num_taxa() * total_sites) as f64
    }

    /// Symmetric matrix of corrected distances over all global taxa.
    pub fn distance_matrix(&self) -> Result<DMatrix<f64>> {
        let n = self.num_taxa();
        let mut distances = DMatrix::zeros(n, n);
        let mut saturated = 0;
        for i in 0..n {
            for j in (i + 1)..n {
                let dist = self.ml_distance(i, j)?;
                if dist >= MAX_GENETIC_DIST {
                    saturated += 1;
                }
                distances[(i, j)] = dist;
                distances[(j, i)] = dist;
            }
        }
        if saturated > 0 {
            warn!("{saturated} taxon pair(s) got the maximum distance {MAX_GENETIC_DIST}");
        }
        Ok(distances)
    }

    /// Joins the given partitions into one alignment over the union of their taxa.
    /// Taxa missing from a partition get the unknown state on its sites.
    ///
    /// # Errors
    /// Fails if the partitions differ in the number of states.
    pub fn concatenate(&self, ids: &[usize]) -> Result<Alignment> {
        let Some(&first) = ids.first() else {
            bail!("No partitions given for concatenation");
        };
        let seq_type = self.partitions[first].seq_type;
        if let Some(&p) = ids
            .iter()
            .find(|&&p| self.partitions[p].num_states() != seq_type.num_states())
        {
            bail!(
                "Cannot concatenate partitions {first} and {p}: {} vs {} states",
                seq_type.num_states(),
                self.partitions[p].num_states()
            );
        }
        let taxa: Vec<usize> = (0..self.num_taxa())
            .filter(|&t| ids.iter().any(|&p| self.taxa_index[t][p].is_some()))
            .collect();
        let names = taxa.iter().map(|&t| self.names[t].clone()).collect();
        let mut concatenated = Alignment::empty(names, seq_type);
        for &p in ids {
            let partition = &self.partitions[p];
            for &pattern in &partition.site_pattern {
                let states = &partition.patterns[pattern].states;
                concatenated.push_site(
                    taxa.iter()
                        .map(|&t| match self.taxa_index[t][p] {
                            Some(local) => states[local],
                            None => seq_type.unknown(),
                        })
                        .collect(),
                );
            }
        }
        Ok(concatenated)
    }

    /// Draws a bootstrap replicate. Also returns, for every partition of the replicate,
    /// the partition it was drawn from.
    pub fn bootstrap(&self, mode: BootstrapMode, rng: &mut impl Rng) -> (SuperAlignment, Vec<usize>) {
        let num_partitions = self.num_partitions();
        let sources: Vec<usize> = match mode {
            BootstrapMode::Site => (0..num_partitions).collect(),
            BootstrapMode::Gene | BootstrapMode::GeneSite => (0..num_partitions)
                .map(|_| rng.gen_range(0..num_partitions))
                .collect(),
        };
        let mut replicate = SuperAlignment::new();
        for &p in &sources {
            let partition = match mode {
                BootstrapMode::Gene => self.partitions[p].clone(),
                BootstrapMode::Site | BootstrapMode::GeneSite => self.partitions[p].bootstrap(rng),
            };
            replicate.add_partition(partition);
        }
        info!(
            "Drew {:?} bootstrap replicate from partitions {:?}",
            mode, sources
        );
        (replicate, sources)
    }
}
