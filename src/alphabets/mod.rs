use bio::io::fasta::Record;
use hashbrown::HashMap;
use lazy_static::lazy_static;

pub static NUCLEOTIDES: &[u8] = b"TCAG";
pub static AMB_NUCLEOTIDES: &[u8] = b"RYSWKMBDHVNZX";
pub static AMINOACIDS: &[u8] = b"ARNDCQEGHILKMFPSTWYV";
pub static AMB_AMINOACIDS: &[u8] = b"BJZX";
pub static BINARY: &[u8] = b"01";
pub static GAP: u8 = b'-';
pub static POSSIBLE_GAPS: &[u8] = b"-.?~";

static STOP_CODONS: [&[u8; 3]; 3] = [b"TAA", b"TAG", b"TGA"];

lazy_static! {
    static ref BINARY_INDEX: [u8; 256] = index_table(BINARY, BINARY.len() as u8);
    static ref DNA_INDEX: [u8; 256] = {
        let mut table = index_table(NUCLEOTIDES, NUCLEOTIDES.len() as u8);
        table[b'U' as usize] = table[b'T' as usize];
        table[b'u' as usize] = table[b'T' as usize];
        table
    };
    static ref PROTEIN_INDEX: [u8; 256] = index_table(AMINOACIDS, AMINOACIDS.len() as u8);
    static ref CODON_INDEX: HashMap<[u8; 3], u8> = {
        let mut index = HashMap::with_capacity(61);
        for &first in NUCLEOTIDES {
            for &second in NUCLEOTIDES {
                for &third in NUCLEOTIDES {
                    let codon = [first, second, third];
                    if !STOP_CODONS.contains(&&codon) {
                        let state = index.len() as u8;
                        index.insert(codon, state);
                    }
                }
            }
        }
        index
    };
}

fn index_table(symbols: &[u8], unknown: u8) -> [u8; 256] {
    let mut table = [unknown; 256];
    for (i, &c) in symbols.iter().enumerate() {
        table[c as usize] = i as u8;
        table[c.to_ascii_lowercase() as usize] = i as u8;
    }
    table
}

/// Kind of characters in an alignment. Fixes the number of observable states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SeqType {
    Binary,
    Dna,
    Protein,
    Codon,
}

impl SeqType {
    pub fn num_states(&self) -> usize {
        match self {
            SeqType::Binary => 2,
            SeqType::Dna => 4,
            SeqType::Protein => 20,
            SeqType::Codon => 61,
        }
    }

    /// State used for gaps, ambiguity codes and anything outside of the alphabet.
    pub fn unknown(&self) -> u8 {
        self.num_states() as u8
    }

    /// Number of characters in a sequence that make up one alignment site.
    pub fn site_width(&self) -> usize {
        match self {
            SeqType::Codon => 3,
            _ => 1,
        }
    }

    /// Encodes one site of a sequence, `chars` has to be `site_width` long.
    pub fn encode(&self, chars: &[u8]) -> u8 {
        match self {
            SeqType::Binary => BINARY_INDEX[chars[0] as usize],
            SeqType::Dna => DNA_INDEX[chars[0] as usize],
            SeqType::Protein => PROTEIN_INDEX[chars[0] as usize],
            SeqType::Codon => {
                let mut codon = [0u8; 3];
                for (c, &ch) in codon.iter_mut().zip(chars) {
                    *c = match ch.to_ascii_uppercase() {
                        b'U' => b'T',
                        ch => ch,
                    };
                }
                CODON_INDEX
                    .get(&codon)
                    .copied()
                    .unwrap_or(self.unknown())
            }
        }
    }

    /// Encodes a full sequence into states, one per site.
    pub fn encode_sequence(&self, seq: &[u8]) -> Vec<u8> {
        seq.chunks(self.site_width())
            .map(|site| {
                if site.len() < self.site_width() {
                    self.unknown()
                } else {
                    self.encode(site)
                }
            })
            .collect()
    }

    /// Character (or codon) for a known state, `None` for the unknown state.
    pub fn decode(&self, state: u8) -> Option<Vec<u8>> {
        if state >= self.unknown() {
            return None;
        }
        match self {
            SeqType::Binary => Some(vec![BINARY[state as usize]]),
            SeqType::Dna => Some(vec![NUCLEOTIDES[state as usize]]),
            SeqType::Protein => Some(vec![AMINOACIDS[state as usize]]),
            SeqType::Codon => CODON_INDEX
                .iter()
                .find(|(_, &s)| s == state)
                .map(|(codon, _)| codon.to_vec()),
        }
    }
}

fn is_gap(c: &u8) -> bool {
    POSSIBLE_GAPS.contains(c)
}

fn all_sites_in(sequences: &[Record], allowed: impl Fn(u8) -> bool) -> bool {
    sequences
        .iter()
        .all(|rec| rec.seq().iter().all(|c| is_gap(c) || allowed(c.to_ascii_uppercase())))
}

/// Guesses the sequence type from the characters used. Codon data is never guessed.
pub fn sequence_type(sequences: &[Record]) -> SeqType {
    if all_sites_in(sequences, |c| BINARY.contains(&c)) {
        SeqType::Binary
    } else if all_sites_in(sequences, |c| {
        NUCLEOTIDES.contains(&c) || AMB_NUCLEOTIDES.contains(&c) || c == b'U'
    }) {
        SeqType::Dna
    } else {
        SeqType::Protein
    }
}
