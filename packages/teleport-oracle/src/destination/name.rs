//! EOSIO account names
//!
//! Names are up to 12 characters from `.12345a-z`, with an optional 13th
//! character restricted to `.12345a-j`, packed base-32 into a u64.

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid account name `{name}`: {reason}")]
pub struct NameError {
    pub name: String,
    pub reason: &'static str,
}

fn char_value(c: u8) -> Option<u64> {
    match c {
        b'.' => Some(0),
        b'1'..=b'5' => Some((c - b'1') as u64 + 1),
        b'a'..=b'z' => Some((c - b'a') as u64 + 6),
        _ => None,
    }
}

/// Encode an account name into its 64-bit on-chain representation
pub fn encode_name(name: &str) -> Result<u64, NameError> {
    let err = |reason| NameError {
        name: name.to_string(),
        reason,
    };

    let bytes = name.as_bytes();
    if bytes.is_empty() {
        return Err(err("empty"));
    }
    if bytes.len() > 13 {
        return Err(err("longer than 13 characters"));
    }

    let mut value: u64 = 0;
    for (i, &c) in bytes.iter().enumerate() {
        let v = char_value(c).ok_or_else(|| err("characters must be a-z, 1-5 or '.'"))?;
        if i < 12 {
            value |= (v & 0x1f) << (64 - 5 * (i + 1));
        } else {
            if v > 0x0f {
                return Err(err("13th character must be a-j, 1-5 or '.'"));
            }
            value |= v;
        }
    }
    Ok(value)
}

/// Full check for names used as transfer recipients
pub fn validate_account(name: &str) -> Result<u64, NameError> {
    let value = encode_name(name)?;
    if name.ends_with('.') {
        return Err(NameError {
            name: name.to_string(),
            reason: "must not end with '.'",
        });
    }
    Ok(value)
}

/// Symbol code packed with its precision, as used in `asset`
pub fn encode_symbol(precision: u8, code: &str) -> Result<u64, NameError> {
    let err = |reason| NameError {
        name: code.to_string(),
        reason,
    };
    if code.is_empty() || code.len() > 7 {
        return Err(err("symbol must be 1-7 characters"));
    }
    let mut value = precision as u64;
    for (i, c) in code.bytes().enumerate() {
        if !c.is_ascii_uppercase() {
            return Err(err("symbol must be uppercase A-Z"));
        }
        value |= (c as u64) << (8 * (i + 1));
    }
    Ok(value)
}
