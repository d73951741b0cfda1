use super::payment::UserId;
use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};

const CODE_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";
pub const CODE_LENGTH: usize = 16;

/// A redeemable code granting `months` of service.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActivationKey {
    pub code: String,
    pub months: u32,
    pub uses_left: u32,
    pub created_at: DateTime<Utc>,
    pub used_by: Option<UserId>,
    pub used_at: Option<DateTime<Utc>>,
}

impl ActivationKey {
    pub fn new(code: String, months: u32, uses_left: u32) -> Self {
        Self {
            code,
            months,
            uses_left,
            created_at: Utc::now(),
            used_by: None,
            used_at: None,
        }
    }

    /// Spends one use. Returns the granted months, or `None` once exhausted.
    pub fn consume(&mut self, user_id: UserId) -> Option<u32> {
        if self.uses_left == 0 {
            return None;
        }
        self.uses_left -= 1;
        self.used_by = Some(user_id);
        self.used_at = Some(Utc::now());
        Some(self.months)
    }
}

/// Random code of upper-case letters and digits.
pub fn generate_code() -> String {
    let mut rng = rand::thread_rng();
    (0..CODE_LENGTH)
        .map(|_| CODE_ALPHABET[rng.gen_range(0..CODE_ALPHABET.len())] as char)
        .collect()
}

/// Codes are typed by hand, so tolerate stray whitespace and lower case.
pub fn normalize_code(input: &str) -> String {
    input.trim().to_ascii_uppercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_generated_code_shape() {
        let code = generate_code();
        assert_eq!(code.len(), CODE_LENGTH);
        assert!(code.bytes().all(|b| CODE_ALPHABET.contains(&b)));
    }

    #[test]
    fn test_consume_until_exhausted() {
        let mut key = ActivationKey::new("ABC".to_string(), 6, 1);
        assert_eq!(key.consume(10), Some(6));
        assert_eq!(key.used_by, Some(10));
        assert_eq!(key.consume(11), None);
        assert_eq!(key.used_by, Some(10));
    }

    #[test]
    fn test_normalize_code() {
        assert_eq!(normalize_code("  ab12cd \n"), "AB12CD");
    }
}
