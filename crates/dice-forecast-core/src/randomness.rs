use serde::{Deserialize, Serialize};

use crate::outcome::binary_entropy;

/// Bit-balance entropy above which a commitment hash is treated as random.
pub const MD5_RANDOM_ENTROPY: f64 = 0.95;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Md5Assessment {
    pub is_random: bool,
    pub entropy: Option<f64>,
    pub note: String,
}

/// Checks the bit balance of a round's MD5 commitment.
///
/// Missing or malformed hashes are reported as random; only a well-formed
/// 32-hex-digit digest is scored.
#[must_use]
#[allow(clippy::cast_precision_loss)]
pub fn assess_md5(hash: Option<&str>) -> Md5Assessment {
    let Some(raw) = hash else {
        return Md5Assessment {
            is_random: true,
            entropy: None,
            note: "no md5 commitment".to_string(),
        };
    };

    let bytes = match hex::decode(raw) {
        Ok(bytes) if bytes.len() == 16 => bytes,
        _ => {
            return Md5Assessment {
                is_random: true,
                entropy: None,
                note: "md5 commitment is malformed".to_string(),
            }
        }
    };

    let ones: u32 = bytes.iter().map(|byte| byte.count_ones()).sum();
    let entropy = binary_entropy(f64::from(ones) / 128.0);
    let is_random = entropy > MD5_RANDOM_ENTROPY;
    Md5Assessment {
        is_random,
        entropy: Some(entropy),
        note: if is_random {
            "md5 bits look balanced".to_string()
        } else {
            "md5 bits look skewed".to_string()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_hash_is_treated_as_random() {
        let assessment = assess_md5(None);
        assert!(assessment.is_random);
        assert!(assessment.entropy.is_none());
    }

    #[test]
    fn short_or_non_hex_hash_is_malformed() {
        assert!(assess_md5(Some("abc")).note.contains("malformed"));
        assert!(assess_md5(Some("zz0123456789abcdef0123456789abcd")).note.contains("malformed"));
    }

    #[test]
    fn balanced_digest_is_random() {
        let assessment = assess_md5(Some("a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5a5"));
        assert!(assessment.is_random);
        assert!(assessment.entropy.is_some_and(|value| (value - 1.0).abs() < 1e-12));
    }

    #[test]
    fn all_zero_digest_is_skewed() {
        let assessment = assess_md5(Some("00000000000000000000000000000000"));
        assert!(!assessment.is_random);
    }
}
