//! Mapping between logical index file names and object keys.
//!
//! Layout under the directory root:
//!
//! ```text
//! data/<name>/<generation:020>-<upload id>  one immutable object per written file
//! manifests/<generation:020>.manifest       one object per published generation
//! write.lock                                lease sentinel
//! ```
//!
//! Generations are zero padded so lexical listing order is numeric order.

use crate::error::{DirectoryError, Result};

pub const DATA_PREFIX: &str = "data";
pub const MANIFEST_PREFIX: &str = "manifests";
pub const MANIFEST_SUFFIX: &str = ".manifest";
pub const LOCK_KEY: &str = "write.lock";

const MAX_NAME_LEN: usize = 255;

/// Checks that `name` can be used as a logical file name.
///
/// Names are restricted to ASCII letters, digits, `_`, `-` and `.`, which
/// covers what index engines generate (`_0.cfs`, `segments_2`, `write.lock`)
/// and never needs escaping in object keys.
pub fn validate_name(name: &str) -> Result<()> {
    let invalid = |reason: &str| {
        Err(DirectoryError::InvalidName {
            name: name.to_string(),
            reason: reason.to_string(),
        })
    };
    if name.is_empty() {
        return invalid("empty name");
    }
    if name.len() > MAX_NAME_LEN {
        return invalid("name too long");
    }
    if name.starts_with('.') {
        return invalid("name may not start with '.'");
    }
    if let Some(c) = name
        .chars()
        .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.')))
    {
        return invalid(&format!("unsupported character {:?}", c));
    }
    Ok(())
}

/// Prefix holding every uploaded version of `name`.
pub fn data_prefix(name: &str) -> String {
    format!("{}/{}", DATA_PREFIX, name)
}

/// Key of one uploaded version of `name`, written while building
/// `generation`. The upload id starts with the writer's lease id, so keys
/// from different writers never collide.
pub fn data_key(name: &str, generation: u64, upload_id: &str) -> String {
    format!("{}/{}/{:020}-{}", DATA_PREFIX, name, generation, upload_id)
}

/// Returns the logical name and generation a data key was written for.
pub fn parse_data_key(key: &str) -> Option<(&str, u64)> {
    let rest = key.strip_prefix(DATA_PREFIX)?.strip_prefix('/')?;
    let (name, version) = rest.split_once('/')?;
    let (generation, upload_id) = version.split_once('-')?;
    if upload_id.is_empty() || generation.len() != 20 {
        return None;
    }
    Some((name, generation.parse().ok()?))
}

pub fn manifest_key(generation: u64) -> String {
    format!("{}/{:020}{}", MANIFEST_PREFIX, generation, MANIFEST_SUFFIX)
}

pub fn parse_manifest_key(key: &str) -> Option<u64> {
    let file = key.strip_prefix(MANIFEST_PREFIX)?.strip_prefix('/')?;
    let generation = file.strip_suffix(MANIFEST_SUFFIX)?;
    if generation.len() != 20 || !generation.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    generation.parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_name() {
        for ok in ["_0.cfs", "segments_2", "write.lock", "_1_Lucene41_0.doc"] {
            assert!(validate_name(ok).is_ok(), "{ok}");
        }
        for bad in ["", ".", "..", ".hidden", "a/b", "a b", "x\n", "café"] {
            assert!(
                matches!(validate_name(bad), Err(DirectoryError::InvalidName { .. })),
                "{bad:?}"
            );
        }
        assert!(validate_name(&"a".repeat(256)).is_err());
    }

    #[test]
    fn test_data_keys() {
        let key = data_key("_0.cfs", 7, "k3x");
        assert_eq!(key, "data/_0.cfs/00000000000000000007-k3x");
        assert_eq!(parse_data_key(&key), Some(("_0.cfs", 7)));
        assert!(key.starts_with(&data_prefix("_0.cfs")));
        assert_eq!(parse_data_key("data/_0.cfs/7-k3x"), None);
        assert_eq!(parse_data_key("manifests/x"), None);
    }

    #[test]
    fn test_manifest_keys_sort_numerically() {
        let mut keys = vec![manifest_key(10), manifest_key(9), manifest_key(100)];
        keys.sort();
        let generations: Vec<u64> = keys.iter().filter_map(|k| parse_manifest_key(k)).collect();
        assert_eq!(generations, vec![9, 10, 100]);
        assert_eq!(parse_manifest_key("manifests/12.manifest"), None);
        assert_eq!(parse_manifest_key("manifests/0000000000000000001x.manifest"), None);
        assert_eq!(parse_manifest_key("data/00000000000000000001.manifest"), None);
    }
}
