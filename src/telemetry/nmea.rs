//! NMEA 0183 GGA / RMC sentence parsing.

use anyhow::{anyhow, bail, Context, Result};
use chrono::NaiveTime;

use super::FixQuality;

#[derive(Clone, Debug, PartialEq)]
pub enum NmeaSentence {
    Gga(GgaSentence),
    Rmc(RmcSentence),
}

#[derive(Clone, Debug, PartialEq)]
pub struct GgaSentence {
    pub time: Option<NaiveTime>,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub quality: FixQuality,
    pub satellites: u32,
    pub hdop: Option<f64>,
    pub altitude_m: Option<f64>,
}

#[derive(Clone, Debug, PartialEq)]
pub struct RmcSentence {
    pub time: Option<NaiveTime>,
    /// Status `A` (active).
    pub active: bool,
    pub latitude: Option<f64>,
    pub longitude: Option<f64>,
    pub speed_knots: Option<f64>,
    pub course_deg: Option<f64>,
}

const TALKERS: [&str; 3] = ["GP", "GN", "GL"];

/// Parse a GGA or RMC sentence. Other sentence types return `Ok(None)`.
///
/// The `*hh` checksum is required and validated.
pub fn parse_sentence(line: &str) -> Result<Option<NmeaSentence>> {
    let line = line.trim();
    let body = line
        .strip_prefix('$')
        .ok_or_else(|| anyhow!("nmea sentence must start with '$'"))?;
    let (data, checksum) = body
        .rsplit_once('*')
        .ok_or_else(|| anyhow!("nmea sentence missing checksum"))?;
    let expected =
        u8::from_str_radix(checksum.trim(), 16).context("nmea checksum is not hex")?;
    let actual = data.bytes().fold(0u8, |acc, b| acc ^ b);
    if actual != expected {
        bail!(
            "nmea checksum mismatch: computed {:02X}, sentence says {:02X}",
            actual,
            expected
        );
    }

    let fields: Vec<&str> = data.split(',').collect();
    let tag = fields[0];
    if tag.len() != 5 || !TALKERS.contains(&&tag[..2]) {
        return Ok(None);
    }
    match &tag[2..] {
        "GGA" => parse_gga(&fields).map(|s| Some(NmeaSentence::Gga(s))),
        "RMC" => parse_rmc(&fields).map(|s| Some(NmeaSentence::Rmc(s))),
        _ => Ok(None),
    }
}

fn parse_gga(fields: &[&str]) -> Result<GgaSentence> {
    if fields.len() < 10 {
        bail!("GGA sentence has {} fields; expected at least 10", fields.len());
    }
    let quality = match fields[6] {
        "" => FixQuality::NoFix,
        q => FixQuality::from_ordinal(q.parse::<u8>().context("GGA quality")?),
    };
    let satellites = match fields[7] {
        "" => 0,
        s => s.parse::<u32>().context("GGA satellite count")?,
    };
    Ok(GgaSentence {
        time: parse_time(fields[1])?,
        latitude: parse_coordinate(fields[2], fields[3], 2)?,
        longitude: parse_coordinate(fields[4], fields[5], 3)?,
        quality,
        satellites,
        hdop: parse_optional_f64(fields[8])?,
        altitude_m: parse_optional_f64(fields[9])?,
    })
}

fn parse_rmc(fields: &[&str]) -> Result<RmcSentence> {
    if fields.len() < 9 {
        bail!("RMC sentence has {} fields; expected at least 9", fields.len());
    }
    Ok(RmcSentence {
        time: parse_time(fields[1])?,
        active: fields[2] == "A",
        latitude: parse_coordinate(fields[3], fields[4], 2)?,
        longitude: parse_coordinate(fields[5], fields[6], 3)?,
        speed_knots: parse_optional_f64(fields[7])?,
        course_deg: parse_optional_f64(fields[8])?,
    })
}

fn parse_optional_f64(value: &str) -> Result<Option<f64>> {
    if value.is_empty() {
        return Ok(None);
    }
    Ok(Some(value.parse::<f64>().with_context(|| {
        format!("invalid numeric field '{}'", value)
    })?))
}

fn parse_time(value: &str) -> Result<Option<NaiveTime>> {
    if value.is_empty() {
        return Ok(None);
    }
    let hhmmss = value.split('.').next().unwrap_or(value);
    let time = NaiveTime::parse_from_str(hhmmss, "%H%M%S")
        .with_context(|| format!("invalid nmea time '{}'", value))?;
    Ok(Some(time))
}

/// `ddmm.mmmm` / `dddmm.mmmm` plus hemisphere into signed decimal degrees.
fn parse_coordinate(value: &str, hemisphere: &str, degree_digits: usize) -> Result<Option<f64>> {
    if value.is_empty() {
        return Ok(None);
    }
    if value.len() < degree_digits + 2 || !value.is_char_boundary(degree_digits) {
        bail!("coordinate '{}' too short", value);
    }
    let degrees: f64 = value[..degree_digits]
        .parse()
        .with_context(|| format!("invalid coordinate degrees '{}'", value))?;
    let minutes: f64 = value[degree_digits..]
        .parse()
        .with_context(|| format!("invalid coordinate minutes '{}'", value))?;
    if minutes >= 60.0 {
        bail!("coordinate minutes out of range in '{}'", value);
    }
    let decimal = degrees + minutes / 60.0;
    match hemisphere {
        "N" | "E" => Ok(Some(decimal)),
        "S" | "W" => Ok(Some(-decimal)),
        other => bail!("invalid hemisphere '{}'", other),
    }
}

/// Append `*hh` to a sentence body (without the leading `$`).
pub fn with_checksum(body: &str) -> String {
    let checksum = body.bytes().fold(0u8, |acc, b| acc ^ b);
    format!("${}*{:02X}", body, checksum)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_reference_gga() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*47";
        let Some(NmeaSentence::Gga(gga)) = parse_sentence(line).unwrap() else {
            panic!("expected GGA");
        };
        assert!((gga.latitude.unwrap() - 48.1173).abs() < 1e-4);
        assert!((gga.longitude.unwrap() - 11.516_666).abs() < 1e-4);
        assert_eq!(gga.quality, FixQuality::Gps);
        assert_eq!(gga.satellites, 8);
        assert_eq!(gga.altitude_m, Some(545.4));
    }

    #[test]
    fn parses_southern_western_rmc() {
        let line = with_checksum("GNRMC,081836,A,3751.65,S,14507.36,W,000.0,360.0,130998,011.3,E");
        let Some(NmeaSentence::Rmc(rmc)) = parse_sentence(&line).unwrap() else {
            panic!("expected RMC");
        };
        assert!(rmc.active);
        assert!(rmc.latitude.unwrap() < 0.0);
        assert!(rmc.longitude.unwrap() < -145.0);
    }

    #[test]
    fn rejects_bad_checksum() {
        let line = "$GPGGA,123519,4807.038,N,01131.000,E,1,08,0.9,545.4,M,46.9,M,,*48";
        assert!(parse_sentence(line).is_err());
    }

    #[test]
    fn ignores_other_sentences_and_talkers() {
        assert_eq!(parse_sentence(&with_checksum("GPGSV,3,1,11")).unwrap(), None);
        assert_eq!(
            parse_sentence(&with_checksum("BDGGA,,,,,,0,00,,,M,,M,,")).unwrap(),
            None
        );
    }

    #[test]
    fn empty_gga_is_no_fix() {
        let line = with_checksum("GPGGA,,,,,,0,00,,,M,,M,,");
        let Some(NmeaSentence::Gga(gga)) = parse_sentence(&line).unwrap() else {
            panic!("expected GGA");
        };
        assert_eq!(gga.quality, FixQuality::NoFix);
        assert_eq!(gga.latitude, None);
    }
}
