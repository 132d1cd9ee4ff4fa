use std::io::Cursor;

use crate::models::Value;

const SEED: u32 = 0;
const MAX_HASH_VALUE: f64 = 4_294_967_296.0; // 2^32

/// MurmurHash3 x86 32-bit of `s`, seed 0.
pub fn get_hash(s: &str) -> u32 {
    // reading from an in-memory cursor cannot fail
    murmur3::murmur3_32(&mut Cursor::new(s.as_bytes()), SEED).unwrap_or_default()
}

/// Stable bucket in `[0, 100)` for an entity and a feature.
pub fn get_bucket(entity_id: &str, feature_id: &str) -> f64 {
    let hash = get_hash(&format!("{}:{}", entity_id, feature_id));
    hash as f64 / MAX_HASH_VALUE * 100.0
}

/// Whether the entity falls inside `percentage`. 100 passes without hashing.
pub fn in_rollout(entity_id: &str, feature_id: &str, percentage: u32) -> bool {
    percentage >= 100 || get_bucket(entity_id, feature_id) < percentage as f64
}

/// Numeric view of a value. Strings are parsed; other types have none.
pub fn get_numeric_value(v: &Value) -> Option<f64> {
    match v {
        Value::Numeric(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok(),
        Value::Boolean(_) => None,
        Value::Document(_) => None,
    }
}

pub fn get_string(v: &Value) -> String {
    v.to_string()
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_get_hash_reference_values() {
        assert_eq!(get_hash(""), 0);
        assert_eq!(get_hash("hello"), 0x248b_fa47);
        assert_eq!(
            get_hash("The quick brown fox jumps over the lazy dog"),
            0x2e4f_f723
        );
    }

    #[test]
    fn test_get_bucket_is_stable() {
        let first = get_bucket("pqvr", "defaultfeature");
        assert_eq!(first, get_bucket("pqvr", "defaultfeature"));
        assert!((0.0..100.0).contains(&first));

        let expected = get_hash("pqvr:defaultfeature") as f64 / MAX_HASH_VALUE * 100.0;
        assert_eq!(first, expected);
    }

    #[test]
    fn test_bucket_range() {
        for i in 0..500 {
            let bucket = get_bucket(&format!("entity-{}", i), "feature");
            assert!((0.0..100.0).contains(&bucket), "{} out of range", bucket);
        }
    }

    #[test]
    fn test_in_rollout_bounds() {
        for i in 0..100 {
            let entity = format!("entity-{}", i);
            assert!(in_rollout(&entity, "feature", 100));
            assert!(!in_rollout(&entity, "feature", 0));
        }
    }

    #[test]
    fn test_in_rollout_compares_bucket() {
        let bucket = get_bucket("pqvr", "defaultfeature");
        assert!((bucket - 78.104_344_150_051_47).abs() < 1e-9, "bucket {}", bucket);
        assert!(in_rollout("pqvr", "defaultfeature", 79));
        assert!(!in_rollout("pqvr", "defaultfeature", 78));
    }

    #[test]
    fn test_numeric_coercion() {
        assert_eq!(get_numeric_value(&Value::from("130")), Some(130.0));
        assert_eq!(get_numeric_value(&Value::from(12)), Some(12.0));
        assert_eq!(get_numeric_value(&Value::from("abc")), None);
        assert_eq!(get_numeric_value(&Value::from(true)), None);
    }
}
