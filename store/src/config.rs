//! # Engine Constants
//!
//! The handful of numbers the storage engine cares about. They live here so
//! nobody has to go spelunking through the backend to find out why their
//! auto-increment store suddenly refuses to hand out keys.

/// Initial value of every auto-increment key generator.
pub const KEY_GENERATOR_START: u64 = 1;

/// Largest key a key generator may produce: 2^53, the largest integer an
/// IEEE-754 double represents exactly. Once the generator passes this value
/// further auto-increment inserts fail with a `ConstraintError`.
pub const KEY_GENERATOR_MAX: u64 = 1 << 53;

/// Name of the sled tree holding database snapshots.
pub const SNAPSHOT_TREE: &str = "snapshots";

/// Version tag written into every dump. Bump when the dump layout changes.
pub const DUMP_FORMAT_VERSION: u32 = 1;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generator_ceiling_is_exact_in_f64() {
        assert_eq!(KEY_GENERATOR_MAX as f64 as u64, KEY_GENERATOR_MAX);
        assert!(KEY_GENERATOR_START < KEY_GENERATOR_MAX);
    }
}
