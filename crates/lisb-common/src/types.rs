//! Common types for LiSB

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Name of a filter in the chain.
///
/// The string form is used both in `disabled_filters` and as the stem of
/// the state file of stateful filters (`DKIMFilter.json`, ...).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum FilterName {
    #[serde(rename = "FromFilter")]
    From,
    #[serde(rename = "ToFilter")]
    To,
    #[serde(rename = "ReturnPathFilter")]
    ReturnPath,
    #[serde(rename = "DKIMFilter")]
    Dkim,
    #[serde(rename = "SPFFilter")]
    Spf,
    #[serde(rename = "XFilter")]
    XHeaders,
    #[serde(rename = "BlackListFilter")]
    BlackList,
    #[serde(rename = "AIFilter")]
    Ai,
}

impl FilterName {
    /// Every filter, in sequential evaluation order
    pub const ALL: [FilterName; 8] = [
        FilterName::BlackList,
        FilterName::From,
        FilterName::To,
        FilterName::ReturnPath,
        FilterName::Dkim,
        FilterName::Spf,
        FilterName::XHeaders,
        FilterName::Ai,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            FilterName::From => "FromFilter",
            FilterName::To => "ToFilter",
            FilterName::ReturnPath => "ReturnPathFilter",
            FilterName::Dkim => "DKIMFilter",
            FilterName::Spf => "SPFFilter",
            FilterName::XHeaders => "XFilter",
            FilterName::BlackList => "BlackListFilter",
            FilterName::Ai => "AIFilter",
        }
    }
}

impl fmt::Display for FilterName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FilterName {
    type Err = crate::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        FilterName::ALL
            .into_iter()
            .find(|name| name.as_str() == s)
            .ok_or_else(|| crate::Error::Config(format!("Unknown filter: {}", s)))
    }
}

/// Outcome of filtering one message
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Verdict {
    Ham,
    Spam,
}

impl Verdict {
    pub fn is_spam(&self) -> bool {
        matches!(self, Verdict::Spam)
    }
}

impl From<bool> for Verdict {
    fn from(is_spam: bool) -> Self {
        if is_spam {
            Verdict::Spam
        } else {
            Verdict::Ham
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Verdict::Ham => f.write_str("ham"),
            Verdict::Spam => f.write_str("spam"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_filter_name_round_trip() {
        for name in FilterName::ALL {
            assert_eq!(name.as_str().parse::<FilterName>().unwrap(), name);
        }
        assert!("NoSuchFilter".parse::<FilterName>().is_err());
    }

    #[test]
    fn test_filter_name_serde_uses_class_names() {
        let json = serde_json::to_string(&FilterName::Dkim).unwrap();
        assert_eq!(json, "\"DKIMFilter\"");
        let parsed: FilterName = serde_json::from_str("\"XFilter\"").unwrap();
        assert_eq!(parsed, FilterName::XHeaders);
    }

    #[test]
    fn test_verdict_from_bool() {
        assert_eq!(Verdict::from(true), Verdict::Spam);
        assert!(!Verdict::from(false).is_spam());
    }
}
