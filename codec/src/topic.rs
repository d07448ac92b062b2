// Copyright (c) 2020 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Apache-2.0 License that can be found
// in the LICENSE file.

use crate::error::DecodeError;

/// A concrete topic name, as carried by a PUBLISH packet. Never contains a wildcard.
#[derive(Clone, Debug, Eq, Hash, PartialEq)]
pub struct Topic(String);

impl Topic {
    /// # Errors
    /// Returns error if `s` is empty or contains a wildcard character.
    pub fn parse(s: &str) -> Result<Self, DecodeError> {
        if s.is_empty() || s.contains('+') || s.contains('#') {
            return Err(DecodeError::InvalidTopic);
        }
        Ok(Self(s.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

/// A topic filter, as carried by a SUBSCRIBE or UNSUBSCRIBE packet. May use the
/// single-level wildcard `+` and a trailing multi-level wildcard `#`.
#[derive(Clone, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct TopicFilter(String);

impl TopicFilter {
    /// # Errors
    /// Returns error if `s` is empty, a `#`/`+` does not occupy an entire level, or
    /// `#` appears anywhere but the last level.
    pub fn parse(s: &str) -> Result<Self, DecodeError> {
        if s.is_empty() {
            return Err(DecodeError::InvalidTopic);
        }
        let levels: Vec<&str> = s.split('/').collect();
        let last = levels.len() - 1;
        for (i, level) in levels.iter().enumerate() {
            if level.contains('#') && (*level != "#" || i != last) {
                return Err(DecodeError::InvalidTopic);
            }
            if level.contains('+') && *level != "+" {
                return Err(DecodeError::InvalidTopic);
            }
        }
        Ok(Self(s.to_string()))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether `topic` matches this filter under the MQTT 3.1.1 matching rules,
    /// including the restriction that `$`-prefixed topics are excluded from a
    /// leading wildcard level.
    #[must_use]
    pub fn is_match(&self, topic: &Topic) -> bool {
        let filter_levels: Vec<&str> = self.0.split('/').collect();
        let topic_levels: Vec<&str> = topic.0.split('/').collect();

        if topic_levels.first().is_some_and(|l| l.starts_with('$'))
            && filter_levels.first().is_some_and(|l| *l == "+" || *l == "#")
        {
            return false;
        }

        let mut fi = filter_levels.iter();
        let mut ti = topic_levels.iter();
        loop {
            match (fi.next(), ti.next()) {
                (Some(&"#"), _) => return true,
                (Some(&"+"), Some(_)) => {}
                (Some(f), Some(t)) => {
                    if f != t {
                        return false;
                    }
                }
                (Some(_), None) | (None, Some(_)) => return false,
                (None, None) => return true,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter(s: &str) -> TopicFilter {
        TopicFilter::parse(s).unwrap()
    }

    fn topic(s: &str) -> Topic {
        Topic::parse(s).unwrap()
    }

    #[test]
    fn exact_match() {
        assert!(filter("nas/cpu").is_match(&topic("nas/cpu")));
        assert!(!filter("nas/cpu").is_match(&topic("nas/memory")));
    }

    #[test]
    fn plus_wildcard_matches_single_level() {
        assert!(filter("nas/+/status").is_match(&topic("nas/disk0/status")));
        assert!(!filter("nas/+/status").is_match(&topic("nas/disk0/sub/status")));
    }

    #[test]
    fn hash_wildcard_matches_remaining_levels() {
        assert!(filter("nas/#").is_match(&topic("nas/cpu/usage")));
        assert!(filter("nas/#").is_match(&topic("nas")));
    }

    #[test]
    fn dollar_topics_excluded_from_leading_wildcard() {
        assert!(!filter("#").is_match(&topic("$SYS/uptime")));
        assert!(!filter("+/uptime").is_match(&topic("$SYS/uptime")));
        assert!(filter("$SYS/uptime").is_match(&topic("$SYS/uptime")));
    }

    #[test]
    fn rejects_malformed_filters() {
        assert!(TopicFilter::parse("nas/#/status").is_err());
        assert!(TopicFilter::parse("nas/a+b").is_err());
        assert!(TopicFilter::parse("").is_err());
    }
}
