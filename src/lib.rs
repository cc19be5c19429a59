use anyhow::Error;

pub mod macros;

pub mod alignment;
pub mod alphabets;
pub mod bootstrap;
pub mod errors;
pub mod io;
pub mod likelihood;
pub mod optimisers;
pub mod parsimony;
pub mod supertree;
pub mod tree;

pub type Result<T> = std::result::Result<T, Error>;

#[allow(non_camel_case_types)]
type f64_h = ordered_float::OrderedFloat<f64>;

pub fn assert_float_relative_slice_eq(actual: &[f64], expected: &[f64], epsilon: f64) {
    use approx::relative_eq;
    assert_eq!(
        actual.len(),
        expected.len(),
        "Must have the same number of entries."
    );
    for (i, (&act, &exp)) in actual.iter().zip(expected.iter()).enumerate() {
        assert!(
            relative_eq!(act, exp, epsilon = epsilon),
            "Entries at position {} do not match, actual: {}, expected: {}",
            i,
            act,
            exp,
        );
    }
}
