//! NMEA GGA sentence codec.
use chrono::{DateTime, NaiveTime, TimeZone, Utc};
use lazy_static::lazy_static;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{fmt::Write, str::FromStr};
use thiserror::Error;

use crate::ecef::{ecef_to_geodetic, geodetic_to_ecef};

#[derive(Error, Clone, Debug, PartialEq, Eq)]
/// Errors raised while building or reading a GGA sentence
pub enum NmeaError {
    /// A required field is absent
    #[error("Missing field: {0}")]
    MissingField(&'static str),
    /// A field could not be parsed
    #[error("Malformed field: {0}")]
    Malformed(&'static str),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// GeoJSON point, coordinates in `[longitude, latitude]` order
pub struct GeoPoint {
    /// Always `Point`
    #[serde(rename = "type")]
    pub kind: String,
    /// `[longitude, latitude]` in degrees
    pub coordinates: [f64; 2],
}

impl GeoPoint {
    fn new(lat: f64, lon: f64) -> Self {
        Self {
            kind: "Point".into(),
            coordinates: [lon, lat],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Degrees-decimal-minutes fields as they appear on the wire, e.g. `3723.1018333,N`
pub struct DmmPosition {
    /// Latitude with hemisphere
    pub latitude: String,
    /// Longitude with hemisphere
    pub longitude: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
/// Location of a GGA fix in the three representations the codec works with.
///
/// Encoding only reads [`GgaLocation::ecef`], so position updates flow through
/// the ECEF coordinates alone.
pub struct GgaLocation {
    /// Decimal degrees as a GeoJSON point
    pub geojson: GeoPoint,
    /// Wire representation
    pub dmm: DmmPosition,
    /// ECEF coordinates (m)
    pub ecef: [f64; 3],
}

impl GgaLocation {
    /// Build a location from an ECEF position (m).
    pub fn from_ecef(ecef: [f64; 3]) -> Self {
        let [lat, lon, _] = ecef_to_geodetic(ecef[0], ecef[1], ecef[2]);
        Self {
            geojson: GeoPoint::new(lat, lon),
            dmm: DmmPosition {
                latitude: lat_to_dmm(lat),
                longitude: lon_to_dmm(lon),
            },
            ecef,
        }
    }

    /// Build a location from wire DMM fields. The ECEF position lies on the
    /// ellipsoid surface.
    fn from_dmm(latitude: String, longitude: String) -> Result<Self, NmeaError> {
        let lat = dmm_to_decimal(&latitude).ok_or(NmeaError::Malformed("latitude"))?;
        let lon = dmm_to_decimal(&longitude).ok_or(NmeaError::Malformed("longitude"))?;
        Ok(Self {
            geojson: GeoPoint::new(lat, lon),
            dmm: DmmPosition {
                latitude,
                longitude,
            },
            ecef: geodetic_to_ecef(lat, lon, 0.0),
        })
    }

    /// Latitude in decimal degrees
    pub fn latitude(&self) -> f64 {
        self.geojson.coordinates[1]
    }

    /// Longitude in decimal degrees
    pub fn longitude(&self) -> f64 {
        self.geojson.coordinates[0]
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
/// A decoded or to-be-encoded GGA sentence.
///
/// When `valid` is false only `raw` is meaningful.
pub struct GgaSentence {
    /// Talker and sentence type, e.g. `GPGGA`
    pub kind: String,
    /// UTC time of the fix, on the date the sentence was decoded
    pub time: Option<DateTime<Utc>>,
    /// Position of the fix
    pub location: Option<GgaLocation>,
    /// Fix quality indicator (0 - 8)
    pub quality: Option<u8>,
    /// Number of satellites in use
    pub satellites: Option<u8>,
    /// Horizontal dilution of precision
    pub hdop: Option<f64>,
    /// Antenna altitude above mean sea level
    pub altitude: Option<f64>,
    /// Unit of `altitude`, `M` on the wire
    pub altitude_unit: Option<String>,
    /// Geoid height above the WGS84 ellipsoid
    pub geoidal_separation: Option<f64>,
    /// Unit of `geoidal_separation`
    pub geoidal_separation_unit: Option<String>,
    /// Seconds since the last differential update
    pub age: Option<f64>,
    /// Differential reference station ID (0000 - 1023)
    pub station_id: Option<u16>,
    /// Text the sentence was decoded from
    pub raw: String,
    /// Whether the checksum matched and every field could be read
    pub valid: bool,
}

impl GgaSentence {
    fn invalid(raw: &str) -> Self {
        Self {
            raw: raw.to_string(),
            ..Default::default()
        }
    }

    fn fill(&mut self, fields: &[&str]) -> Result<(), NmeaError> {
        if fields.len() < 13 {
            return Err(NmeaError::MissingField("geoidal separation unit"));
        }
        self.kind = fields[0].to_string();
        self.time = parse_time(fields[1])?;
        self.location = Some(GgaLocation::from_dmm(
            format!("{},{}", fields[2], fields[3]),
            format!("{},{}", fields[4], fields[5]),
        )?);
        self.quality = match optional::<u8>(fields[6], "quality")? {
            Some(q) if q > 8 => return Err(NmeaError::Malformed("quality")),
            q => q,
        };
        self.satellites = optional(fields[7], "satellites")?;
        self.hdop = optional(fields[8], "hdop")?;
        self.altitude = optional(fields[9], "altitude")?;
        self.altitude_unit = text(fields[10]);
        self.geoidal_separation = optional(fields[11], "geoidal separation")?;
        self.geoidal_separation_unit = text(fields[12]);
        // age and station id are taken by position whenever present and
        // non-empty, even when the sentence stops short of the station field
        if let Some(age) = fields.get(13) {
            self.age = optional(age, "age")?;
        }
        if let Some(id) = fields.get(14) {
            self.station_id = optional(id, "station id")?;
        }
        Ok(())
    }
}

/// Returns true if `text` looks like a GGA sentence: `$`, an optional two
/// letter talker, then `GGA`.
pub fn is_gga(text: &str) -> bool {
    let Some(rest) = text.strip_prefix('$') else {
        return false;
    };
    let rest = rest.as_bytes();
    if rest.starts_with(b"GGA") {
        return true;
    }
    rest.len() >= 5 && rest[..2].iter().all(u8::is_ascii_uppercase) && &rest[2..5] == b"GGA"
}

/// XOR of all bytes in `payload`, which excludes the leading `$` and the `*`
pub fn checksum(payload: &str) -> u8 {
    payload.as_bytes().iter().fold(0, |acc, &x| acc ^ x)
}

/// Returns the payload between `$` and `*` if the trailing checksum matches.
fn verified_payload(text: &str) -> Option<&str> {
    let body = text.trim_end().strip_prefix('$')?;
    let (payload, tail) = body.split_once('*')?;
    let cksum = u8::from_str_radix(tail.get(..2)?, 16).ok()?;
    (checksum(payload) == cksum).then_some(payload)
}

/// Decode an NMEA sentence. Only GGA sentences are understood; anything else
/// comes back with `valid == false`.
pub fn decode(text: &str) -> GgaSentence {
    if !is_gga(text) {
        return GgaSentence::invalid(text);
    }
    let mut gga = GgaSentence::invalid(text);
    let Some(payload) = verified_payload(text) else {
        return gga;
    };
    let fields = payload.split(',').collect::<Vec<_>>();
    match gga.fill(&fields) {
        Ok(()) => gga.valid = true,
        Err(e) => log::debug!("Discarding GGA sentence {text:?}: {e}"),
    }
    gga
}

/// Encode a sentence, with a freshly computed checksum.
///
/// Latitude and longitude are derived from `location.ecef`. Types that do not
/// end in `GGA` are not supported and encode to an empty string.
pub fn encode(gga: &GgaSentence) -> Result<String, NmeaError> {
    if !gga.kind.ends_with("GGA") {
        return Ok(String::new());
    }
    let loc = gga
        .location
        .as_ref()
        .ok_or(NmeaError::MissingField("location"))?;
    let [lat, lon, _] = ecef_to_geodetic(loc.ecef[0], loc.ecef[1], loc.ecef[2]);
    let time = gga.time.unwrap_or_else(Utc::now);

    let mut fields = vec![
        format!("${}", gga.kind),
        time.format("%H%M%S%.3f").to_string(),
        lat_to_dmm(lat),
        lon_to_dmm(lon),
        render(gga.quality),
        gga.satellites.map(|n| format!("{n:02}")).unwrap_or_default(),
        gga.hdop.map(|h| format!("{h:.3}")).unwrap_or_default(),
        render(gga.altitude),
        gga.altitude_unit.clone().unwrap_or_else(|| "M".into()),
        render(gga.geoidal_separation),
        gga.geoidal_separation_unit
            .clone()
            .unwrap_or_else(|| "M".into()),
    ];
    // the station id is positional, keep an empty age field in front of it
    if gga.age.is_some() || gga.station_id.is_some() {
        fields.push(gga.age.map(|a| format!("{a:.3}")).unwrap_or_default());
    }
    if let Some(id) = gga.station_id {
        fields.push(format!("{id:04}"));
    }

    let mut msg = fields.join(",");
    let cksum = checksum(&msg[1..]);
    let _ = write!(msg, "*{cksum:02X}");
    Ok(msg)
}

/// The sentence the position reporter uploads for an ECEF position.
pub fn position_report(ecef: [f64; 3], time: DateTime<Utc>) -> GgaSentence {
    GgaSentence {
        kind: "GPGGA".into(),
        time: Some(time),
        location: Some(GgaLocation::from_ecef(ecef)),
        quality: Some(1),
        satellites: Some(0),
        hdop: Some(0.0),
        altitude: Some(0.0),
        altitude_unit: Some("M".into()),
        geoidal_separation: Some(0.0),
        geoidal_separation_unit: Some("M".into()),
        age: Some(1.0),
        station_id: Some(1),
        raw: String::new(),
        valid: true,
    }
}

/// `ddmm.mmmm,H` or `dddmm.mmmm,H` to signed decimal degrees
fn dmm_to_decimal(inp: &str) -> Option<f64> {
    lazy_static! {
        static ref RE: Regex = Regex::new(r"^(?<deg>\d{2,3})(?<min>\d{2}\.\d+),(?<dir>[NSEW])$")
            .expect("Failed to compile regex");
    }
    let caps = RE.captures(inp)?;
    let deg = caps["deg"].parse::<f64>().ok()?;
    let min = caps["min"].parse::<f64>().ok()?;
    let dec = deg + min / 60.0;
    Some(match &caps["dir"] {
        "S" | "W" => -dec,
        _ => dec,
    })
}

fn lat_to_dmm(lat: f64) -> String {
    to_dmm(lat, 2, 'N', 'S')
}

fn lon_to_dmm(lon: f64) -> String {
    to_dmm(lon, 3, 'E', 'W')
}

fn to_dmm(value: f64, width: usize, pos: char, neg: char) -> String {
    let abs = value.abs();
    let mut deg = abs.trunc();
    let mut min = ((abs - deg) * 60.0 * 1e6).round() / 1e6;
    if min >= 60.0 {
        deg += 1.0;
        min -= 60.0;
    }
    let dir = if value < 0.0 { neg } else { pos };
    format!("{:0width$}{:09.6},{}", deg as u32, min, dir, width = width)
}

/// `hhmmss.sss` on today's UTC date
fn parse_time(inp: &str) -> Result<Option<DateTime<Utc>>, NmeaError> {
    if inp.is_empty() {
        return Ok(None);
    }
    let time = NaiveTime::parse_from_str(inp, "%H%M%S%.f")
        .map_err(|_| NmeaError::Malformed("time"))?;
    let today = Utc::now().date_naive();
    Ok(Some(Utc.from_utc_datetime(&today.and_time(time))))
}

fn optional<T: FromStr>(inp: &str, name: &'static str) -> Result<Option<T>, NmeaError> {
    if inp.is_empty() {
        return Ok(None);
    }
    inp.parse().map(Some).map_err(|_| NmeaError::Malformed(name))
}

fn text(inp: &str) -> Option<String> {
    (!inp.is_empty()).then(|| inp.to_string())
}

fn render<T: ToString>(value: Option<T>) -> String {
    value.map(|v| v.to_string()).unwrap_or_default()
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::Timelike;

    const SAMPLE: &str =
        "$GPGGA,053204.02,3723.1018333,N,12205.3972723,W,1,00,1.0,39.662,M,-33.027,M,0.0,*40";

    #[test]
    fn decode_sample() {
        let gga = decode(SAMPLE);
        assert!(gga.valid);
        assert_eq!(gga.kind, "GPGGA");
        assert_eq!(gga.quality, Some(1));
        assert_eq!(gga.satellites, Some(0));
        assert_eq!(gga.hdop, Some(1.0));
        assert_eq!(gga.altitude, Some(39.662));
        assert_eq!(gga.altitude_unit.as_deref(), Some("M"));
        assert_eq!(gga.geoidal_separation, Some(-33.027));
        assert_eq!(gga.age, Some(0.0));
        assert_eq!(gga.station_id, None);
        let time = gga.time.unwrap();
        assert_eq!((time.hour(), time.minute(), time.second()), (5, 32, 4));
        assert_eq!(time.nanosecond(), 20_000_000);
        let loc = gga.location.unwrap();
        assert!((loc.latitude() - 37.385030555).abs() < 1e-9);
        assert!((loc.longitude() - -122.089954538).abs() < 1e-9);
        assert_eq!(loc.dmm.latitude, "3723.1018333,N");
        assert_eq!(loc.dmm.longitude, "12205.3972723,W");
        assert_eq!(loc.geojson.kind, "Point");
    }

    #[test]
    fn decode_station_id() {
        let gga = decode(
            "$GNGGA,221515.00,4238.96342,N,07118.97943,W,2,12,1.04,36.7,M,-33.0,M,,0131*41\r\n",
        );
        assert!(gga.valid);
        assert_eq!(gga.quality, Some(2));
        assert_eq!(gga.satellites, Some(12));
        assert_eq!(gga.age, None);
        assert_eq!(gga.station_id, Some(131));
    }

    #[test]
    fn trailing_fields_by_position() {
        let base = "GPGGA,053204.02,3723.1018333,N,12205.3972723,W,1,00,1.0,39.662,M,-33.027,M";
        let sentence = |tail: &str| {
            let payload = format!("{base}{tail}");
            format!("${payload}*{:02X}", checksum(&payload))
        };

        let gga = decode(&sentence(""));
        assert!(gga.valid);
        assert_eq!((gga.age, gga.station_id), (None, None));

        let gga = decode(&sentence(",2.5"));
        assert!(gga.valid);
        assert_eq!((gga.age, gga.station_id), (Some(2.5), None));

        let gga = decode(&sentence(",,0131"));
        assert!(gga.valid);
        assert_eq!((gga.age, gga.station_id), (None, Some(131)));
    }

    #[test]
    fn tampered_sentence() {
        for (idx, ch) in SAMPLE.char_indices() {
            if idx == 0 || idx >= SAMPLE.find('*').unwrap() {
                continue;
            }
            let swap = if ch == '7' { '8' } else { '7' };
            let mut tampered = SAMPLE.to_string();
            tampered.replace_range(idx..idx + 1, &swap.to_string());
            let gga = decode(&tampered);
            assert!(!gga.valid, "{tampered}");
            assert_eq!(gga.location, None);
            assert_eq!(gga.quality, None);
            assert_eq!(gga.raw, tampered);
        }
    }

    #[test]
    fn dispatch() {
        assert!(is_gga(SAMPLE));
        assert!(is_gga("$GGA,"));
        assert!(is_gga("$GNGGA,"));
        assert!(!is_gga("GPGGA,"));
        assert!(!is_gga("$GPRMC,221515.00,A"));
        assert!(!is_gga("$GPGG"));
        let rmc = decode("$GNRMC,221515.00,A,4238.96342,N,07118.97943,W,0.046,,031024,,,D,V*0D");
        assert!(!rmc.valid);
        assert!(rmc.kind.is_empty());
    }

    #[test]
    fn malformed_field() {
        let payload = "GPGGA,053204.02,3723.1018333,N,12205.3972723,W,9,00,1.0,39.662,M,-33.027,M";
        let text = format!("${payload}*{:02X}", checksum(payload));
        let gga = decode(&text);
        assert!(!gga.valid);
    }

    #[test]
    fn dmm() {
        assert_eq!(lat_to_dmm(37.385030555), "3723.101833,N");
        assert_eq!(lon_to_dmm(-122.08995453833333), "12205.397272,W");
        assert_eq!(lat_to_dmm(-0.5), "0030.000000,S");
        assert_eq!(lon_to_dmm(7.25), "00715.000000,E");
        assert_eq!(lat_to_dmm(59.99999999999), "6000.000000,N");
        assert_eq!(dmm_to_decimal("4238.96342,S"), Some(-(42.0 + 38.96342 / 60.0)));
        assert_eq!(dmm_to_decimal("4238,N"), None);
    }

    #[test]
    fn encode_report() {
        let ecef = geodetic_to_ecef(37.385030555, -122.08995453833333, 0.0);
        let time = Utc.with_ymd_and_hms(2024, 10, 3, 5, 32, 4).unwrap()
            + chrono::Duration::milliseconds(20);
        let text = encode(&position_report(ecef, time)).unwrap();
        assert_eq!(
            text,
            "$GPGGA,053204.020,3723.101833,N,12205.397272,W,1,00,0.000,0,M,0,M,1.000,0001*51"
        );
        let gga = decode(&text);
        assert!(gga.valid);
        assert_eq!(gga.station_id, Some(1));
        assert_eq!(gga.age, Some(1.0));
    }

    #[test]
    fn round_trip() {
        let first = decode(SAMPLE);
        let mut current = first.clone();
        for _ in 0..3 {
            let text = encode(&current).unwrap();
            let next = decode(&text);
            assert!(next.valid, "{text}");
            assert_eq!(next.quality, first.quality);
            assert_eq!(next.satellites, first.satellites);
            let (a, b) = (next.location.as_ref().unwrap(), first.location.as_ref().unwrap());
            assert!((a.latitude() - b.latitude()).abs() < 1e-6);
            assert!((a.longitude() - b.longitude()).abs() < 1e-6);
            current = next;
        }
    }

    #[test]
    fn encode_unsupported() {
        let mut gga = decode(SAMPLE);
        gga.kind = "GPRMC".into();
        assert_eq!(encode(&gga), Ok(String::new()));
        gga.kind = "GPGGA".into();
        gga.location = None;
        assert_eq!(encode(&gga), Err(NmeaError::MissingField("location")));
    }

    #[test]
    fn serialize() {
        let gga = decode(SAMPLE);
        let json = serde_json::to_value(&gga).unwrap();
        assert_eq!(json["location"]["geojson"]["type"], "Point");
        assert_eq!(json["quality"], 1);
    }
}
