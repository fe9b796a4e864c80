// ABOUTME: DNS label validation for deployment aliases.
// ABOUTME: An alias becomes the leftmost label of the deployment's public FQDN.

use std::fmt;
use thiserror::Error;

/// RFC 1035 limit on a single label.
const MAX_LABEL_LEN: usize = 63;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum DnsLabelError {
    #[error("alias cannot be empty")]
    Empty,

    #[error("alias is {0} characters long, a DNS label allows {MAX_LABEL_LEN}")]
    TooLong(usize),

    #[error("alias cannot start or end with '-'")]
    HyphenAtEdge,

    #[error("alias contains '{0}', only letters, digits and '-' are allowed")]
    InvalidChar(char),
}

/// A hostname label, stored lowercased since DNS ignores case.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DnsLabel(String);

impl DnsLabel {
    pub fn new(value: &str) -> Result<Self, DnsLabelError> {
        match value.len() {
            0 => return Err(DnsLabelError::Empty),
            len if len > MAX_LABEL_LEN => return Err(DnsLabelError::TooLong(len)),
            _ => {}
        }
        if let Some(c) = value.chars().find(|c| !c.is_ascii_alphanumeric() && *c != '-') {
            return Err(DnsLabelError::InvalidChar(c));
        }
        if value.starts_with('-') || value.ends_with('-') {
            return Err(DnsLabelError::HyphenAtEdge);
        }
        Ok(Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for DnsLabel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn accepts_short_aliases() {
        assert_eq!(DnsLabel::new("wp").unwrap().as_str(), "wp");
        assert!(DnsLabel::new("ted-talks").is_ok());
    }

    #[test]
    fn aliases_are_lowercased() {
        assert_eq!(DnsLabel::new("WikiFR").unwrap().as_str(), "wikifr");
    }

    #[test]
    fn rejects_underscores_and_hyphen_edges() {
        assert_eq!(DnsLabel::new("wiki_fr"), Err(DnsLabelError::InvalidChar('_')));
        assert_eq!(DnsLabel::new("-wp"), Err(DnsLabelError::HyphenAtEdge));
        assert_eq!(DnsLabel::new("wp-"), Err(DnsLabelError::HyphenAtEdge));
        assert_eq!(
            DnsLabel::new(&"a".repeat(64)),
            Err(DnsLabelError::TooLong(64))
        );
    }
}
