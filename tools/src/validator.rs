//! Request validation and output sanitizing
//!
//! This is the only gate between client input and `execve`. Targets and
//! parameters that pass here end up as discrete argv entries, so the checks
//! only need to bound shape, not escape anything.

use regex::Regex;
use std::collections::HashMap;
use std::net::{Ipv4Addr, Ipv6Addr};

use crate::error::ValidationError;
use crate::types::{CommandRequest, Tool};

pub const MAX_TARGET_LEN: usize = 253;
pub const MAX_LABEL_LEN: usize = 63;
pub const MAX_OUTPUT_LEN: usize = 10_000;
pub const TRUNCATION_MARKER: &str = "\n... (output truncated)";

const DNS_RECORD_TYPES: [&str; 8] = ["A", "AAAA", "MX", "NS", "TXT", "SOA", "CNAME", "PTR"];

/// Compiled matchers, built once and shared.
pub struct Validator {
    hostname: Regex,
    ipv4: Regex,
    ipv6: Regex,
}

impl Validator {
    pub fn new() -> Self {
        Self {
            hostname: Regex::new(
                r"^([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9])(\.([a-zA-Z0-9]|[a-zA-Z0-9][a-zA-Z0-9\-]*[a-zA-Z0-9]))*$",
            )
            .expect("valid hostname regex"),
            ipv4: Regex::new(r"^(\d{1,3}\.){3}\d{1,3}$").expect("valid ipv4 regex"),
            // Full eight-group form or loopback only; compressed forms are refused.
            ipv6: Regex::new(r"^([0-9a-fA-F]{1,4}:){7}[0-9a-fA-F]{1,4}$|^::1$")
                .expect("valid ipv6 regex"),
        }
    }

    /// Check a decoded request and return the tool it names.
    pub fn validate_request(&self, request: &CommandRequest) -> Result<Tool, ValidationError> {
        self.validate_command(&request.tool, &request.target, &request.parameters)
    }

    pub fn validate_command(
        &self,
        tool: &str,
        target: &str,
        params: &HashMap<String, String>,
    ) -> Result<Tool, ValidationError> {
        let tool = Tool::from_name(tool)
            .ok_or_else(|| ValidationError::UnsupportedTool(tool.to_string()))?;
        self.validate_target(target)?;
        validate_params(tool, params)?;
        Ok(tool)
    }

    fn validate_target(&self, target: &str) -> Result<(), ValidationError> {
        let target = target.trim();
        if target.is_empty() {
            return Err(ValidationError::EmptyTarget);
        }
        if target.len() > MAX_TARGET_LEN {
            return Err(ValidationError::TargetTooLong);
        }

        if self.ipv4.is_match(target) {
            return target
                .parse::<Ipv4Addr>()
                .map(|_| ())
                .map_err(|_| ValidationError::InvalidIpv4);
        }

        if self.ipv6.is_match(target) {
            return target
                .parse::<Ipv6Addr>()
                .map(|_| ())
                .map_err(|_| ValidationError::InvalidIpv6);
        }

        if !self.hostname.is_match(target) {
            return Err(ValidationError::InvalidHostname);
        }
        if target.split('.').any(|label| label.len() > MAX_LABEL_LEN) {
            return Err(ValidationError::LabelTooLong);
        }

        Ok(())
    }
}

impl Default for Validator {
    fn default() -> Self {
        Self::new()
    }
}

fn validate_params(tool: Tool, params: &HashMap<String, String>) -> Result<(), ValidationError> {
    match tool {
        Tool::Ping => {
            if let Some(count) = params.get("count") {
                let n: i64 = count
                    .parse()
                    .map_err(|_| ValidationError::InvalidPingCount)?;
                if !(1..=10).contains(&n) {
                    return Err(ValidationError::PingCountOutOfRange);
                }
            }
        }
        Tool::Dig => {
            if let Some(record_type) = params.get("type") {
                let upper = record_type.to_ascii_uppercase();
                if !DNS_RECORD_TYPES.contains(&upper.as_str()) {
                    return Err(ValidationError::InvalidRecordType);
                }
            }
        }
        Tool::Traceroute => {
            if let Some(max_hops) = params.get("maxHops") {
                let n: i64 = max_hops
                    .parse()
                    .map_err(|_| ValidationError::InvalidMaxHops)?;
                if !(1..=30).contains(&n) {
                    return Err(ValidationError::MaxHopsOutOfRange);
                }
            }
        }
    }
    Ok(())
}

/// Keep newline, tab and printable ASCII; cap the length.
pub fn sanitize_output(text: &str) -> String {
    let mut sanitized: String = text
        .chars()
        .filter(|&c| c == '\n' || c == '\t' || (' '..='~').contains(&c))
        .collect();

    // Only ASCII survives the filter, so byte and char offsets agree.
    if sanitized.len() > MAX_OUTPUT_LEN {
        sanitized.truncate(MAX_OUTPUT_LEN);
        sanitized.push_str(TRUNCATION_MARKER);
    }
    sanitized
}

#[cfg(test)]
mod tests {
    use super::*;

    fn no_params() -> HashMap<String, String> {
        HashMap::new()
    }

    fn params(key: &str, value: &str) -> HashMap<String, String> {
        HashMap::from([(key.to_string(), value.to_string())])
    }

    #[test]
    fn test_supported_tools_accepted() {
        let v = Validator::new();
        for tool in ["ping", "dig", "traceroute"] {
            assert!(v.validate_command(tool, "example.com", &no_params()).is_ok());
        }
        assert_eq!(
            v.validate_command("dig", "example.com", &no_params()),
            Ok(Tool::Dig)
        );
    }

    #[test]
    fn test_unsupported_tools_rejected() {
        let v = Validator::new();
        for tool in ["nmap", "", "Ping", "ping; rm -rf /", "bash"] {
            assert_eq!(
                v.validate_command(tool, "example.com", &no_params()),
                Err(ValidationError::UnsupportedTool(tool.to_string()))
            );
        }
    }

    #[test]
    fn test_empty_target() {
        let v = Validator::new();
        assert_eq!(
            v.validate_command("ping", "", &no_params()),
            Err(ValidationError::EmptyTarget)
        );
        assert_eq!(
            v.validate_command("ping", "   \t", &no_params()),
            Err(ValidationError::EmptyTarget)
        );
    }

    #[test]
    fn test_target_too_long() {
        let v = Validator::new();
        let long = "a".repeat(254);
        let err = v.validate_command("ping", &long, &no_params()).unwrap_err();
        assert_eq!(err, ValidationError::TargetTooLong);
        assert!(err.to_string().contains("too long"));
    }

    #[test]
    fn test_ipv4_targets() {
        let v = Validator::new();
        assert!(v.validate_command("ping", "192.168.1.1", &no_params()).is_ok());
        assert!(v.validate_command("ping", " 8.8.8.8 ", &no_params()).is_ok());
        assert_eq!(
            v.validate_command("ping", "192.168.1.256", &no_params()),
            Err(ValidationError::InvalidIpv4)
        );
        assert_eq!(
            v.validate_command("ping", "999.1.1.1", &no_params()),
            Err(ValidationError::InvalidIpv4)
        );
    }

    #[test]
    fn test_ipv6_targets() {
        let v = Validator::new();
        assert!(v.validate_command("ping", "::1", &no_params()).is_ok());
        assert!(v
            .validate_command("ping", "2001:0db8:0000:0000:0000:ff00:0042:8329", &no_params())
            .is_ok());
    }

    #[test]
    fn test_compressed_ipv6_rejected() {
        // Strict matcher: only the full form and the loopback literal pass.
        let v = Validator::new();
        for target in ["2001:db8::1", "fe80::1", "::"] {
            assert_eq!(
                v.validate_command("ping", target, &no_params()),
                Err(ValidationError::InvalidHostname),
                "{target} should be rejected"
            );
        }
    }

    #[test]
    fn test_hostnames() {
        let v = Validator::new();
        for host in ["example.com", "a.b.c", "my-host", "localhost", "x1.example-site.org", "www.e-bay.com"] {
            assert!(v.validate_command("dig", host, &no_params()).is_ok(), "{host}");
        }
        for host in [
            "-bad.com",
            "bad-.com",
            "exa..mple.com",
            "example.com.",
            "host name",
            "example.com;reboot",
            "$(id)",
            "--help",
            "a_b.com",
        ] {
            assert_eq!(
                v.validate_command("dig", host, &no_params()),
                Err(ValidationError::InvalidHostname),
                "{host}"
            );
        }
    }

    #[test]
    fn test_label_too_long() {
        let v = Validator::new();
        let host = format!("{}.com", "a".repeat(64));
        assert_eq!(
            v.validate_command("ping", &host, &no_params()),
            Err(ValidationError::LabelTooLong)
        );
        let host = format!("{}.com", "a".repeat(63));
        assert!(v.validate_command("ping", &host, &no_params()).is_ok());
    }

    #[test]
    fn test_ping_count() {
        let v = Validator::new();
        assert!(v.validate_command("ping", "127.0.0.1", &params("count", "4")).is_ok());
        assert!(v.validate_command("ping", "127.0.0.1", &params("count", "1")).is_ok());
        assert!(v.validate_command("ping", "127.0.0.1", &params("count", "10")).is_ok());
        assert_eq!(
            v.validate_command("ping", "127.0.0.1", &params("count", "11")),
            Err(ValidationError::PingCountOutOfRange)
        );
        assert_eq!(
            v.validate_command("ping", "127.0.0.1", &params("count", "0")),
            Err(ValidationError::PingCountOutOfRange)
        );
        assert_eq!(
            v.validate_command("ping", "127.0.0.1", &params("count", "abc")),
            Err(ValidationError::InvalidPingCount)
        );
        assert_eq!(
            v.validate_command("ping", "127.0.0.1", &params("count", "")),
            Err(ValidationError::InvalidPingCount)
        );
    }

    #[test]
    fn test_dig_record_type() {
        let v = Validator::new();
        assert!(v.validate_command("dig", "example.com", &params("type", "AAAA")).is_ok());
        assert!(v.validate_command("dig", "example.com", &params("type", "mx")).is_ok());
        assert_eq!(
            v.validate_command("dig", "example.com", &params("type", "bogus")),
            Err(ValidationError::InvalidRecordType)
        );
    }

    #[test]
    fn test_traceroute_max_hops() {
        let v = Validator::new();
        assert!(v
            .validate_command("traceroute", "example.com", &params("maxHops", "30"))
            .is_ok());
        assert_eq!(
            v.validate_command("traceroute", "example.com", &params("maxHops", "31")),
            Err(ValidationError::MaxHopsOutOfRange)
        );
        assert_eq!(
            v.validate_command("traceroute", "example.com", &params("maxHops", "many")),
            Err(ValidationError::InvalidMaxHops)
        );
    }

    #[test]
    fn test_parameters_for_other_tools_ignored() {
        let v = Validator::new();
        // `count` means nothing to dig, so even a bad value passes.
        assert!(v.validate_command("dig", "example.com", &params("count", "999")).is_ok());
        assert!(v.validate_command("ping", "example.com", &params("type", "bogus")).is_ok());
    }

    #[test]
    fn test_sanitize_strips_control_chars() {
        let input = "line1\n\tindented\u{1b}[0m\r\u{0}end\u{7f}é";
        assert_eq!(sanitize_output(input), "line1\n\tindented[0mend");
    }

    #[test]
    fn test_sanitize_truncates() {
        let input = "x".repeat(10_050);
        let out = sanitize_output(&input);
        assert_eq!(out.len(), MAX_OUTPUT_LEN + TRUNCATION_MARKER.len());
        assert!(out.starts_with(&"x".repeat(MAX_OUTPUT_LEN)));
        assert!(out.ends_with(TRUNCATION_MARKER));
    }

    #[test]
    fn test_sanitize_short_text_untouched() {
        assert_eq!(sanitize_output("PING 127.0.0.1"), "PING 127.0.0.1");
        assert_eq!(sanitize_output(&"y".repeat(MAX_OUTPUT_LEN)).len(), MAX_OUTPUT_LEN);
    }
}
