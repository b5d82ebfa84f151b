//! APRS encoding: callsign/field validation, APRS-IS passcode, position reports.

use std::sync::OnceLock;

use regex::Regex;

use crate::{errors::Error, Result};

/// Maximum comment length of a position report without timestamp.
pub const MAX_COMMENT_LEN: usize = 43;

/// Highest valid SSID.
pub const MAX_SSID: u8 = 15;

// ============== Callsign ==============

fn callsign_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^[A-Z0-9]{1,3}[0-9][A-Z0-9]{0,3}[A-Z]$").expect("valid regex")
    })
}

/// Normalize and validate an amateur-radio callsign.
///
/// Portable prefixes/suffixes (`EA8/IU2FRL/P`) are stripped by keeping the longest
/// `/`-separated segment. The result is upper-cased.
pub fn validate_callsign(input: &str) -> Result<String> {
    let longest = input
        .trim()
        .split('/')
        .max_by_key(|s| s.len())
        .unwrap_or("")
        .to_ascii_uppercase();

    if callsign_re().is_match(&longest) {
        Ok(longest)
    } else {
        Err(Error::Validation(format!(
            "{longest:?} is not a valid callsign"
        )))
    }
}

// ============== Other user fields ==============

pub fn parse_ssid(input: &str) -> Result<u8> {
    let s = input.trim();
    match s.parse::<u8>() {
        Ok(v) if v <= MAX_SSID => Ok(v),
        _ => Err(Error::Validation(format!(
            "SSID must be a number between 0 and {MAX_SSID}, got {s:?}"
        ))),
    }
}

/// Validate a two-character APRS icon: symbol table id followed by symbol code.
pub fn parse_icon(input: &str) -> Result<String> {
    let s = input.trim();
    let chars: Vec<char> = s.chars().collect();
    let &[table, code] = chars.as_slice() else {
        return Err(Error::Validation(format!(
            "icon must be exactly 2 characters, got {s:?}"
        )));
    };

    let table_ok =
        matches!(table, '/' | '\\') || table.is_ascii_digit() || table.is_ascii_uppercase();
    if !table_ok {
        return Err(Error::Validation(format!(
            "icon table must be '/', '\\', a digit or an uppercase letter, got {table:?}"
        )));
    }
    if !code.is_ascii_graphic() {
        return Err(Error::Validation(format!(
            "icon symbol must be a printable ASCII character, got {code:?}"
        )));
    }

    Ok(s.to_string())
}

pub fn parse_interval(input: &str) -> Result<u64> {
    let s = input.trim();
    s.parse::<u64>().map_err(|_| {
        Error::Validation(format!(
            "interval must be a non-negative number of seconds, got {s:?}"
        ))
    })
}

pub fn validate_comment(input: &str) -> Result<String> {
    let s = input.trim();
    if s.is_empty() {
        return Err(Error::Validation("comment cannot be empty".to_string()));
    }
    if s.chars().any(|c| c.is_control()) {
        return Err(Error::Validation(
            "comment cannot contain control characters".to_string(),
        ));
    }
    let len = s.chars().count();
    if len > MAX_COMMENT_LEN {
        return Err(Error::Validation(format!(
            "comment is {len} characters long, the maximum is {MAX_COMMENT_LEN}"
        )));
    }
    Ok(s.to_string())
}

// ============== Passcode ==============

/// APRS-IS passcode for a callsign (SSID ignored).
pub fn passcode(callsign: &str) -> u16 {
    let base = callsign.split('-').next().unwrap_or("").to_ascii_uppercase();

    let mut hash: u16 = 0x73e2;
    let bytes = &base.as_bytes()[..base.len().min(10)];
    for pair in bytes.chunks(2) {
        hash ^= u16::from(pair[0]) << 8;
        if let Some(&b) = pair.get(1) {
            hash ^= u16::from(b);
        }
    }
    hash & 0x7fff
}

/// Login line sent right after the TCP connection is established.
///
/// `passcode = None` logs in read-only (`pass -1`).
pub fn login_line(callsign: &str, passcode: Option<u16>, software: &str, version: &str) -> String {
    let pass = passcode.map(i32::from).unwrap_or(-1);
    format!("user {callsign} pass {pass} vers {software} {version}")
}

// ============== Position reports ==============

/// `CALL-SSID` source address. The SSID is always written, `-0` included.
pub fn source_address(callsign: &str, ssid: u8) -> String {
    format!("{callsign}-{ssid}")
}

/// Encode decimal degrees as APRS `DDMM.mmH` / `DDDMM.mmH`.
pub fn encode_coordinates(latitude: f64, longitude: f64) -> Result<(String, String)> {
    if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
        return Err(Error::Validation(format!("latitude out of range: {latitude}")));
    }
    if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
        return Err(Error::Validation(format!(
            "longitude out of range: {longitude}"
        )));
    }

    let (lat_deg, lat_min) = degrees_minutes(latitude);
    let (lon_deg, lon_min) = degrees_minutes(longitude);
    let lat_dir = if latitude >= 0.0 { 'N' } else { 'S' };
    let lon_dir = if longitude >= 0.0 { 'E' } else { 'W' };

    Ok((
        format!("{lat_deg:02}{lat_min:05.2}{lat_dir}"),
        format!("{lon_deg:03}{lon_min:05.2}{lon_dir}"),
    ))
}

// Rounds to hundredths of a minute up front so 59.999' carries into the degree.
fn degrees_minutes(value: f64) -> (u32, f64) {
    let hundredths = (value.abs() * 6000.0).round() as u64;
    let deg = (hundredths / 6000) as u32;
    let min = (hundredths % 6000) as f64 / 100.0;
    (deg, min)
}

/// Inputs needed to build an uncompressed position report.
#[derive(Clone, Debug)]
pub struct PositionReport<'a> {
    pub callsign: &'a str,
    pub ssid: u8,
    pub icon: &'a str,
    pub comment: &'a str,
    pub latitude: f64,
    pub longitude: f64,
}

impl PositionReport<'_> {
    /// `CALL-SSID>APRS,TCPIP*:=LAT<table>LON<code>COMMENT`
    pub fn to_packet(&self) -> Result<String> {
        let (lat, lon) = encode_coordinates(self.latitude, self.longitude)?;
        let mut icon = self.icon.chars();
        let (Some(table), Some(code)) = (icon.next(), icon.next()) else {
            return Err(Error::Validation(format!(
                "icon must be exactly 2 characters, got {:?}",
                self.icon
            )));
        };

        Ok(format!(
            "{}>APRS,TCPIP*:={lat}{table}{lon}{code}{}",
            source_address(self.callsign, self.ssid),
            self.comment
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn passcode_matches_known_values() {
        assert_eq!(passcode("N0CALL"), 13023);
        assert_eq!(passcode("n0call"), 13023);
        assert_eq!(passcode("N0CALL-9"), 13023);
        assert_eq!(passcode("AA0BBB"), 16547);
    }

    #[test]
    fn formats_reference_packet() {
        let report = PositionReport {
            callsign: "AA0BBB",
            ssid: 9,
            icon: "/>",
            comment: "test",
            latitude: 45.0,
            longitude: 9.0,
        };
        assert_eq!(
            report.to_packet().unwrap(),
            "AA0BBB-9>APRS,TCPIP*:=4500.00N/00900.00E>test"
        );
    }

    #[test]
    fn encodes_southern_and_western_hemispheres() {
        let (lat, lon) = encode_coordinates(-33.8688, -70.6483).unwrap();
        assert_eq!(lat, "3352.13S");
        assert_eq!(lon, "07038.90W");
    }

    #[test]
    fn minute_rounding_carries_into_degrees() {
        let (lat, lon) = encode_coordinates(45.99999, 8.999999).unwrap();
        assert_eq!(lat, "4600.00N");
        assert_eq!(lon, "00900.00E");
    }

    #[test]
    fn rejects_out_of_range_coordinates() {
        assert!(encode_coordinates(91.0, 0.0).is_err());
        assert!(encode_coordinates(0.0, -180.5).is_err());
        assert!(encode_coordinates(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn source_always_carries_ssid() {
        assert_eq!(source_address("IU2FRL", 0), "IU2FRL-0");
        assert_eq!(source_address("IU2FRL", 15), "IU2FRL-15");
    }

    #[test]
    fn callsign_validation() {
        assert_eq!(validate_callsign("iu2frl").unwrap(), "IU2FRL");
        assert_eq!(validate_callsign("EA8/IU2FRL/P").unwrap(), "IU2FRL");
        assert_eq!(validate_callsign("W1AW").unwrap(), "W1AW");
        assert!(validate_callsign("HELLO").is_err());
        assert!(validate_callsign("IU2FRL-9").is_err());
        assert!(validate_callsign("").is_err());
    }

    #[test]
    fn field_validation() {
        assert_eq!(parse_ssid("9").unwrap(), 9);
        assert!(parse_ssid("16").is_err());
        assert!(parse_ssid("-1").is_err());

        assert_eq!(parse_icon("/>").unwrap(), "/>");
        assert_eq!(parse_icon("\\k").unwrap(), "\\k");
        assert!(parse_icon("/").is_err());
        assert!(parse_icon("a>").is_err());

        assert_eq!(parse_interval("120").unwrap(), 120);
        assert!(parse_interval("-5").is_err());
        assert!(parse_interval("soon").is_err());

        assert_eq!(validate_comment("  hello  ").unwrap(), "hello");
        assert!(validate_comment("   ").is_err());
        assert!(validate_comment("a\nIU2FRL>APRS:bad").is_err());
        assert!(validate_comment(&"x".repeat(MAX_COMMENT_LEN + 1)).is_err());
    }

    #[test]
    fn login_line_format() {
        assert_eq!(
            login_line("N0CALL", Some(13023), "aprsgate", "0.1.0"),
            "user N0CALL pass 13023 vers aprsgate 0.1.0"
        );
        assert_eq!(
            login_line("N0CALL", None, "aprsgate", "0.1.0"),
            "user N0CALL pass -1 vers aprsgate 0.1.0"
        );
    }
}
