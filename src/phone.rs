//! Phone number helpers

use crate::error::{LinkError, Result};

const MIN_DIGITS: usize = 10;
const MAX_DIGITS: usize = 15;

/// Normalize a user-entered phone number to bare international digits
///
/// Formatting characters (`+`, spaces, `-`, `(`, `)`, `.`) are dropped. The
/// remainder must be 10–15 ASCII digits.
pub fn normalize(input: &str) -> Result<String> {
    let mut digits = String::with_capacity(input.len());
    for c in input.trim().chars() {
        match c {
            '0'..='9' => digits.push(c),
            '+' | ' ' | '-' | '(' | ')' | '.' => {}
            _ => return Err(LinkError::InvalidPhone(input.to_string())),
        }
    }

    if !(MIN_DIGITS..=MAX_DIGITS).contains(&digits.len()) {
        return Err(LinkError::InvalidPhone(input.to_string()));
    }

    Ok(digits)
}

/// Extract the phone part of a network identity
///
/// `15551234567:12@s.whatsapp.net` → `15551234567`
pub fn from_identity(identity: &str) -> String {
    let user = identity.split('@').next().unwrap_or(identity);
    let user = user.split(':').next().unwrap_or(user);
    normalize(user).unwrap_or_else(|_| user.to_string())
}

/// Mask all but the last four digits: `15551234567` → `***4567`
pub fn mask(phone: &str) -> String {
    let chars: Vec<char> = phone.chars().collect();
    if chars.is_empty() {
        return "unknown".to_string();
    }
    let tail: String = chars[chars.len().saturating_sub(4)..].iter().collect();
    format!("***{}", tail)
}

/// Replace every occurrence of `phone` in `text` with its masked form
pub fn redact(text: &str, phone: &str) -> String {
    if phone.is_empty() {
        return text.to_string();
    }
    text.replace(phone, &mask(phone))
}
