use opendsr_data::Value;
use rand::distr::Alphanumeric;
use rand::Rng;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A policy-defined transformation applied to targeted fields during
/// erasure.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "strategy", rename_all = "snake_case")]
pub enum MaskingStrategy {
    /// Replace the value with NULL.
    NullRewrite,
    /// Replace the value with a fixed string.
    StringRewrite { rewrite_value: String },
    /// Replace the value with a fresh random alphanumeric string.
    RandomStringRewrite { length: usize },
    /// Replace the value with the hex-encoded SHA-256 of its string
    /// form, optionally salted. Referential integrity across
    /// collections survives because equal inputs mask equally.
    HashRewrite {
        #[serde(default)]
        salt: Option<String>,
    },
}

impl MaskingStrategy {
    /// The masked replacement for `value`. Null inputs stay null:
    /// there is nothing left to erase and hashing them would
    /// manufacture data.
    pub fn mask(&self, value: &Value) -> Value {
        if value.is_null() {
            return Value::Null;
        }
        match self {
            MaskingStrategy::NullRewrite => Value::Null,
            MaskingStrategy::StringRewrite { rewrite_value } => {
                Value::Text(rewrite_value.clone())
            }
            MaskingStrategy::RandomStringRewrite { length } => {
                let masked: String = rand::rng()
                    .sample_iter(&Alphanumeric)
                    .take(*length)
                    .map(char::from)
                    .collect();
                Value::Text(masked)
            }
            MaskingStrategy::HashRewrite { salt } => {
                let mut hasher = Sha256::new();
                hasher.update(value.to_string().as_bytes());
                if let Some(salt) = salt {
                    hasher.update(salt.as_bytes());
                }
                Value::Text(hex::encode(hasher.finalize()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn null_rewrite_erases() {
        assert_eq!(
            MaskingStrategy::NullRewrite.mask(&Value::from("John Customer")),
            Value::Null
        );
    }

    #[test]
    fn string_rewrite_uses_fixed_value() {
        let strategy = MaskingStrategy::StringRewrite {
            rewrite_value: "MASKED".into(),
        };
        assert_eq!(strategy.mask(&Value::from("secret")), Value::from("MASKED"));
    }

    #[test]
    fn random_rewrite_respects_length() {
        let strategy = MaskingStrategy::RandomStringRewrite { length: 12 };
        let masked = strategy.mask(&Value::from("secret"));
        let text = masked.as_str().unwrap();
        assert_eq!(text.len(), 12);
        assert!(text.chars().all(|c| c.is_ascii_alphanumeric()));
    }

    #[test]
    fn hash_rewrite_is_stable_per_salt() {
        let salted = MaskingStrategy::HashRewrite {
            salt: Some("pepper".into()),
        };
        let a = salted.mask(&Value::from("c@x.com"));
        let b = salted.mask(&Value::from("c@x.com"));
        assert_eq!(a, b);

        let unsalted = MaskingStrategy::HashRewrite { salt: None };
        assert_ne!(a, unsalted.mask(&Value::from("c@x.com")));
    }

    #[test]
    fn null_values_stay_null() {
        let strategy = MaskingStrategy::HashRewrite { salt: None };
        assert_eq!(strategy.mask(&Value::Null), Value::Null);
    }
}
