use std::fs::{self, File};
use std::io::{Read, Write};

use approx::assert_relative_eq;
use tempfile::tempdir;

use crate::alphabets::SeqType;
use crate::io::{
    read_alignment, read_newick_from_file, read_sequences, read_super_alignment,
    write_newick_to_file, DataError,
};
use crate::tree::NewickFormat;
use crate::tree;

#[test]
fn reading_fasta_normalises_case_and_gaps() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("seqs.fasta");
    let mut file = File::create(&path).unwrap();
    file.write_all(b">a\nacg.t\n>b\nAC?GT\n").unwrap();

    let sequences = read_sequences(&path).unwrap();
    assert_eq!(sequences.len(), 2);
    assert_eq!(sequences[0].seq(), b"ACG-T");
    assert_eq!(sequences[1].seq(), b"AC-GT");
}

#[test]
fn reading_empty_fasta() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("empty.fasta");
    File::create(&path).unwrap();
    let err = read_sequences(&path).unwrap_err();
    assert!(err.downcast_ref::<DataError>().is_some());
    assert!(err.to_string().contains("No sequences"));
}

#[test]
fn reading_nonexistent_fasta() {
    let dir = tempdir().unwrap();
    assert!(read_sequences(&dir.path().join("nonexistent.fasta")).is_err());
}

#[test]
fn reading_partitions() {
    let dir = tempdir().unwrap();
    let gene1 = dir.path().join("gene1.fasta");
    let gene2 = dir.path().join("gene2.fasta");
    fs::write(&gene1, ">A\nACGT\n>B\nACGA\n>C\nTCGA\n").unwrap();
    fs::write(&gene2, ">C\nAAAAAA\n>D\nAAAAAC\n").unwrap();

    let single = read_alignment(&gene1, None).unwrap();
    assert_eq!(single.seq_type(), SeqType::Dna);
    assert_eq!(single.num_sites(), 4);

    let aln = read_super_alignment(&[gene1.as_path(), gene2.as_path()], None).unwrap();
    assert_eq!(aln.num_partitions(), 2);
    assert_eq!(aln.num_taxa(), 4);
    assert_relative_eq!(aln.missing_data_fraction(), 1.0 - 18.0 / 40.0);
}

#[test]
fn newick_file_round_trip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trees.newick");
    let trees = vec![
        tree!("((A:1.0,B:2.0):1.5,C:4.0,D:0.5);"),
        tree!("(A:0.1,B:0.2,C:0.3);"),
    ];
    write_newick_to_file(&trees, &path, &NewickFormat::default()).unwrap();

    let mut content = String::new();
    File::open(&path)
        .unwrap()
        .read_to_string(&mut content)
        .unwrap();
    assert_eq!(content.lines().count(), 2);

    let read = read_newick_from_file(&path).unwrap();
    assert_eq!(read.len(), 2);
    for (orig, read) in trees.iter().zip(read.iter()) {
        assert_eq!(orig.to_newick(), read.to_newick());
        assert_relative_eq!(orig.height(), read.height());
    }
}

#[test]
fn writing_to_existing_file_fails() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("trees.newick");
    File::create(&path).unwrap();
    let trees = vec![tree!("(A,B,C);")];
    let err = write_newick_to_file(&trees, &path, &NewickFormat::default()).unwrap_err();
    assert!(err.to_string().contains("already exists"));
}
