//! Identifier issuing.

use chrono::Utc;
use uuid::Uuid;

const BASE36: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

/// Issue an id of the form `<prefix>_<base36 epoch ms>_<6 base36 chars>`.
pub fn issue_id(prefix: &str) -> String {
    let millis = u64::try_from(Utc::now().timestamp_millis()).unwrap_or_default();
    format!("{prefix}_{}_{}", to_base36(millis), random_suffix())
}

fn to_base36(mut value: u64) -> String {
    if value == 0 {
        return "0".to_string();
    }
    let mut digits = Vec::new();
    while value > 0 {
        digits.push(BASE36[(value % 36) as usize]);
        value /= 36;
    }
    digits.reverse();
    String::from_utf8_lossy(&digits).into_owned()
}

fn random_suffix() -> String {
    Uuid::new_v4()
        .as_bytes()
        .iter()
        .take(6)
        .map(|b| BASE36[(*b as usize) % 36] as char)
        .collect()
}
