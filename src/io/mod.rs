use std::error::Error;
use std::fmt;
use std::fs::{self, File};
use std::io::Write;
use std::path::Path;

use anyhow::bail;
use bio::io::fasta::{Reader, Record};
use log::info;

use crate::alignment::{Alignment, SuperAlignment};
use crate::alphabets::{sequence_type, SeqType, GAP, POSSIBLE_GAPS};
use crate::tree::{tree_parser, NewickFormat, Tree};
use crate::Result;

pub struct DataError {
    pub(crate) message: String,
}
impl fmt::Debug for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl fmt::Display for DataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}
impl Error for DataError {}

/// Reads sequences from a fasta file, returning a vector of fasta records.
/// All sequences are converted to uppercase and all gap symbols to `-`.
///
/// # Arguments
/// * `path` - Path to the fasta file.
pub fn read_sequences(path: &Path) -> Result<Vec<Record>> {
    info!("Reading sequences from file {}", path.display());
    let reader = Reader::from_file(path)?;
    let mut sequences = Vec::new();

    for result in reader.records() {
        let rec = result?;
        if let Err(e) = rec.check() {
            bail!(DataError {
                message: e.to_string()
            });
        }
        let seq: Vec<u8> = rec
            .seq()
            .to_ascii_uppercase()
            .iter()
            .map(|c| if POSSIBLE_GAPS.contains(c) { GAP } else { *c })
            .collect();
        sequences.push(Record::with_attrs(rec.id(), rec.desc(), &seq));
    }
    if sequences.is_empty() {
        bail!(DataError {
            message: String::from("No sequences found in file")
        });
    }

    info!("Read sequences successfully");
    Ok(sequences)
}

/// Reads one partition from an aligned fasta file. The sequence type is guessed from the
/// characters when not given.
pub fn read_alignment(path: &Path, seq_type: Option<SeqType>) -> Result<Alignment> {
    let sequences = read_sequences(path)?;
    let seq_type = seq_type.unwrap_or_else(|| sequence_type(&sequences));
    Alignment::from_records(&sequences, seq_type)
}

/// Reads every file as one partition of a partitioned alignment.
pub fn read_super_alignment(paths: &[&Path], seq_type: Option<SeqType>) -> Result<SuperAlignment> {
    let mut alignment = SuperAlignment::new();
    for path in paths {
        alignment.add_partition(read_alignment(path, seq_type)?);
    }
    Ok(alignment)
}

/// Reads newick trees from a file, returning a vector of trees.
///
/// Rooted trees are unrooted on read by suppressing the root node.
/// For example, "((A:1,B:2):1,(D:1,E:2):1);" becomes "((A:1,B:2):2,D:1,E:2);".
pub fn read_newick_from_file(path: &Path) -> Result<Vec<Tree>> {
    info!("Reading newick trees from file {}", path.display());
    let newick = fs::read_to_string(path)?;
    info!("Read file successfully");
    tree_parser::from_newick(&newick)
}

/// Writes newick trees to the given file path. Will return an error if the file already exists.
pub fn write_newick_to_file(trees: &[Tree], path: &Path, format: &NewickFormat) -> Result<()> {
    info!("Writing newick trees to file {}", path.display());
    if path.exists() {
        bail!(DataError {
            message: String::from("File already exists")
        });
    }
    let mut writer = File::create(path)?;
    for tree in trees {
        writer.write_all(tree.to_newick_with(format).as_bytes())?;
        writer.write_all(b"\n")?;
    }
    info!("Finished writing successfully");
    Ok(())
}

#[cfg(test)]
#[cfg_attr(coverage, coverage(off))]
mod tests;
