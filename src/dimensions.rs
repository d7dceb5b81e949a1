//! The fixed set of personality dimensions carried by a fingerprint.
//!
//! Order matters: it is the order of the dimension bytes in the compact wire
//! format and the order in which ties are broken by the analyzer.

pub const DIMENSION_COUNT: usize = 12;

pub const DIMENSIONS: [&str; DIMENSION_COUNT] = [
    "exploration_eagerness",
    "community_orientation",
    "location_adventurousness",
    "authenticity_preference",
    "trust_network_reliance",
    "temporal_flexibility",
    "energy_preference",
    "novelty_seeking",
    "value_orientation",
    "crowd_tolerance",
    "social_preference",
    "overall_energy",
];

/// Position of a dimension in [`DIMENSIONS`].
pub fn index_of(name: &str) -> Option<usize> {
    DIMENSIONS.iter().position(|d| *d == name)
}

pub fn name_of(index: usize) -> Option<&'static str> {
    DIMENSIONS.get(index).copied()
}
