// Copyright (c) 2021 Xu Shaohua <shaohua@biofan.org>. All rights reserved.
// Use of this source is governed by Affero General Public License that can be found
// in the LICENSE file.

use regex::Regex;

use crate::error::{Error, ErrorKind};

/// A declared, closed set of value transforms a `file`/`command`/`env` probe may
/// apply to its raw text before emitting it.
///
/// Never holds arbitrary executable configuration: a probe declares one of these
/// names in its configuration and an unrecognised name is rejected while the
/// configuration is loaded, not when the probe later runs.
#[derive(Debug, Clone)]
pub enum Transform {
    Identity,
    ParseInt,
    ParseFloat,
    ScaleByConstant(f64),
    Trim,
    RegexExtract(Regex),
}

impl Transform {
    /// # Errors
    /// Returns `ConfigError` if `s` does not name a transform in the declared set,
    /// or a `scale-by-constant`/`regex-extract` argument fails to parse.
    pub fn parse(s: &str) -> Result<Self, Error> {
        if let Some(factor) = s.strip_prefix("scale-by-constant:") {
            let factor: f64 = factor.parse().map_err(|_| config_error(s))?;
            return Ok(Self::ScaleByConstant(factor));
        }
        if let Some(pattern) = s.strip_prefix("regex-extract:") {
            let regex = Regex::new(pattern).map_err(|_| config_error(s))?;
            return Ok(Self::RegexExtract(regex));
        }
        match s {
            "identity" => Ok(Self::Identity),
            "parse-int" => Ok(Self::ParseInt),
            "parse-float" => Ok(Self::ParseFloat),
            "trim" => Ok(Self::Trim),
            _ => Err(config_error(s)),
        }
    }

    /// Apply this transform to a probe's raw text output.
    ///
    /// # Errors
    /// Returns `ProbeError` if the raw value cannot be interpreted by this
    /// transform (e.g. non-numeric text passed to `parse-int`).
    pub fn apply(&self, raw: &str) -> Result<serde_json::Value, Error> {
        let raw = raw.trim_end_matches(['\n', '\r']);
        match self {
            Self::Identity => Ok(serde_json::Value::String(raw.to_string())),
            Self::Trim => Ok(serde_json::Value::String(raw.trim().to_string())),
            Self::ParseInt => raw
                .trim()
                .parse::<i64>()
                .map(serde_json::Value::from)
                .map_err(|err| probe_error(&err.to_string())),
            Self::ParseFloat => raw
                .trim()
                .parse::<f64>()
                .map(|v| serde_json::Number::from_f64(v).map(serde_json::Value::Number))
                .map_err(|err| probe_error(&err.to_string()))?
                .ok_or_else(|| probe_error("value is not finite")),
            Self::ScaleByConstant(factor) => raw
                .trim()
                .parse::<f64>()
                .map_err(|err| probe_error(&err.to_string()))
                .and_then(|v| {
                    serde_json::Number::from_f64(v * factor)
                        .map(serde_json::Value::Number)
                        .ok_or_else(|| probe_error("scaled value is not finite"))
                }),
            Self::RegexExtract(regex) => regex
                .captures(raw)
                .and_then(|caps| caps.get(1).or_else(|| caps.get(0)))
                .map(|m| serde_json::Value::String(m.as_str().to_string()))
                .ok_or_else(|| probe_error("pattern did not match")),
        }
    }
}

fn config_error(name: &str) -> Error {
    Error::from_string(ErrorKind::ConfigError, format!("unsupported transform: {name}"))
}

fn probe_error(message: &str) -> Error {
    Error::from_string(ErrorKind::ProbeError, message.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_declared_names() {
        assert!(matches!(Transform::parse("identity").unwrap(), Transform::Identity));
        assert!(matches!(Transform::parse("parse-int").unwrap(), Transform::ParseInt));
        assert!(matches!(Transform::parse("trim").unwrap(), Transform::Trim));
    }

    #[test]
    fn rejects_unknown_name() {
        assert!(Transform::parse("eval").is_err());
    }

    #[test]
    fn scale_by_constant_applies_factor() {
        let t = Transform::parse("scale-by-constant:1000").unwrap();
        assert_eq!(t.apply("2.5").unwrap(), serde_json::json!(2500.0));
    }

    #[test]
    fn regex_extract_uses_first_capture_group() {
        let t = Transform::parse("regex-extract:temp=(\\d+)").unwrap();
        assert_eq!(t.apply("temp=42").unwrap(), serde_json::json!("42"));
    }

    #[test]
    fn parse_int_rejects_non_numeric_text() {
        let t = Transform::parse("parse-int").unwrap();
        assert!(t.apply("not-a-number").is_err());
    }
}
