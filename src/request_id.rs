use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use uuid::Uuid;

/// Generate a fresh stream id by hashing a v4 uuid down to 64 bits.
pub fn generate() -> u64 {
    from_uuid(&Uuid::new_v4())
}

/// Derive a stable 64-bit id from a uuid.
pub fn from_uuid(uuid: &Uuid) -> u64 {
    let mut hasher = DefaultHasher::new();
    uuid.to_string().hash(&mut hasher);
    hasher.finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_from_uuid_is_stable() {
        let uuid = Uuid::new_v4();
        assert_eq!(from_uuid(&uuid), from_uuid(&uuid));
    }

    #[test]
    fn test_generate_produces_distinct_ids() {
        let a = generate();
        let b = generate();
        assert_ne!(a, b);
    }
}
