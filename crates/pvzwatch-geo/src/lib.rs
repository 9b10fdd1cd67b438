//! Text-based Moscow / Saint-Petersburg geo filter.
//!
//! Exclusion semantics: in Moscow mode a message is taken unless the text
//! carries an *unambiguous* SPb signal, and vice versa. Detection runs in
//! tiers (explicit city aliases, metro stations, street names) over token
//! n-grams of the normalized text; a collision at the metro tier falls
//! through to streets, a collision at the street tier yields no signal.

mod filter;
mod normalize;

pub use filter::{GeoFilter, Tier, MOSCOW, SPB};
pub use normalize::normalize;
