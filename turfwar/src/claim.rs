//! Land claims and nickname policy.
use std::fmt;
use std::net::Ipv4Addr;

/// Longest nickname we accept, in bytes.
pub const NICK_MAX: usize = 40;

/// Punctuation allowed in a nickname in addition to ASCII alphanumerics.
const NICK_PUNCT: &[u8] = b"@/:.^+!-_*";

/// True if the nickname is 1 to NICK_MAX bytes drawn from
/// `[A-Za-z0-9@/:.^+!_*-]`.
///
/// ```
/// use turfwar::claim::is_valid_nick;
///
/// assert!(is_valid_nick("Alice"));
/// assert!(is_valid_nick("j@x.com/+^!-_*:"));
/// assert!(!is_valid_nick(""));
/// assert!(!is_valid_nick("bad name!!"));
/// assert!(!is_valid_nick(&"a".repeat(41)));
/// ```
pub fn is_valid_nick(nick: &str) -> bool {
    let bytes = nick.as_bytes();

    if bytes.is_empty() || bytes.len() > NICK_MAX {
        return false;
    }

    bytes
        .iter()
        .all(|b| b.is_ascii_alphanumeric() || NICK_PUNCT.contains(b))
}

/// One player's request to own the land at an IPv4 address.
///
/// Created by a connection worker, consumed once by the persistence
/// worker, never modified in between.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    ip: Ipv4Addr,
    created: i64,
    nick: String,
}

impl Claim {
    /// Returns None if the nickname fails validation.
    pub fn new(ip: Ipv4Addr, created: i64, nick: &str) -> Option<Claim> {
        if !is_valid_nick(nick) {
            return None;
        }

        Some(Claim {
            ip,
            created,
            nick: nick.to_string(),
        })
    }

    pub fn ip(&self) -> Ipv4Addr {
        self.ip
    }

    /// Address as the integer used for the store's primary key.
    pub fn ip_number(&self) -> i64 {
        u32::from(self.ip) as i64
    }

    /// Epoch seconds.
    pub fn created(&self) -> i64 {
        self.created
    }

    pub fn nick(&self) -> &str {
        &self.nick
    }
}

impl fmt::Display for Claim {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} claimed by {}", self.ip, self.nick)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nick_length_bounds() {
        assert!(is_valid_nick("a"));
        assert!(is_valid_nick(&"z".repeat(NICK_MAX)));
        assert!(!is_valid_nick(&"z".repeat(NICK_MAX + 1)));
    }

    #[test]
    fn nick_rejects_disallowed_chars() {
        for bad in ["a b", "a\"b", "a<b", "a%b", "a#b", "a&b", "é", "a\0b", "a,b"] {
            assert!(!is_valid_nick(bad), "{bad:?} should be rejected");
        }
    }

    #[test]
    fn claim_requires_valid_nick() {
        let ip = Ipv4Addr::new(1, 2, 3, 4);
        assert!(Claim::new(ip, 1, "bad name!!").is_none());

        let claim = Claim::new(ip, 1670000000, "Alice").unwrap();
        assert_eq!(claim.ip_number(), 0x01020304);
        assert_eq!(claim.to_string(), "1.2.3.4 claimed by Alice");
    }
}
