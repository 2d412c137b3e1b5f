//! Geographic coordinates and the LOC resource record used to carry them
//! between edge sites (§4.1).

use std::fmt;

use hickory_server::proto::rr::{rdata::NULL, Record, RecordType};
use serde::{Deserialize, Serialize};

/// RFC 1876 type code for the location record.
pub(crate) const LOC_RECORD_TYPE: u16 = 29;

const EARTH_RADIUS_METERS: f64 = 6_371_000.0;

/// Default RFC 1876 precision fields, since the engine never tracks them:
/// 1m size, 10000m horizontal precision, 10m vertical precision.
const DEFAULT_SIZE: u8 = 0x13;
const DEFAULT_HORIZ_PRE: u8 = 0x16;
const DEFAULT_VERT_PRE: u8 = 0x13;
const LATLON_BIAS: u32 = 1 << 31;
const ALTITUDE_BIAS: u32 = 10_000_000;

/// A geographic coordinate in decimal degrees.
#[derive(Clone, Copy, Debug, PartialEq, Deserialize, Serialize)]
pub(crate) struct Point {
    pub(crate) lat: f64,
    pub(crate) lon: f64,
}

impl Point {
    pub(crate) fn new(lat: f64, lon: f64) -> Self {
        Self { lat, lon }
    }

    /// Great-circle distance to `other`, in meters, via the haversine formula.
    pub(crate) fn distance(&self, other: &Point) -> f64 {
        let lat1 = self.lat.to_radians();
        let lat2 = other.lat.to_radians();
        let dlat = (other.lat - self.lat).to_radians();
        let dlon = (other.lon - self.lon).to_radians();

        let a = (dlat / 2.0).sin().powi(2)
            + lat1.cos() * lat2.cos() * (dlon / 2.0).sin().powi(2);
        let c = 2.0 * a.sqrt().asin();

        EARTH_RADIUS_METERS * c
    }
}

impl fmt::Display for Point {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({:.4}, {:.4})", self.lat, self.lon)
    }
}

fn encode_coord(degrees: f64) -> u32 {
    let milliarcseconds = degrees * 3_600_000.0;
    (milliarcseconds.round() as i64 + LATLON_BIAS as i64) as u32
}

fn decode_coord(value: u32) -> f64 {
    (value as i64 - LATLON_BIAS as i64) as f64 / 3_600_000.0
}

/// Packs `point` into the 16-byte RFC 1876 RDATA (sans the 2-byte RR header
/// fields already carried by [`Record`]).
fn pack(point: &Point) -> Vec<u8> {
    let mut buf = Vec::with_capacity(16);
    buf.push(0); // VERSION
    buf.push(DEFAULT_SIZE);
    buf.push(DEFAULT_HORIZ_PRE);
    buf.push(DEFAULT_VERT_PRE);
    buf.extend_from_slice(&encode_coord(point.lat).to_be_bytes());
    buf.extend_from_slice(&encode_coord(point.lon).to_be_bytes());
    buf.extend_from_slice(&ALTITUDE_BIAS.to_be_bytes());
    buf
}

fn unpack(rdata: &[u8]) -> Option<Point> {
    if rdata.len() < 16 {
        return None;
    }

    let lat = u32::from_be_bytes(rdata[4..8].try_into().ok()?);
    let lon = u32::from_be_bytes(rdata[8..12].try_into().ok()?);

    Some(Point::new(decode_coord(lat), decode_coord(lon)))
}

/// Builds a LOC record for `name` carrying `point`, RFC 3597-encoded as an
/// unknown-type record since the toolkit's typed `RData` has no LOC variant.
pub(crate) fn encode(name: hickory_server::proto::rr::Name, point: Point) -> Record {
    use hickory_server::proto::rr::RData;

    Record::from_rdata(
        name,
        0,
        RData::Unknown {
            code: RecordType::Unknown(LOC_RECORD_TYPE as u16),
            rdata: NULL::with(pack(&point)),
        },
    )
}

fn record_point(record: &Record) -> Option<Point> {
    use hickory_server::proto::rr::RData;

    match record.data() {
        Some(RData::Unknown { code, rdata }) if *code == RecordType::Unknown(LOC_RECORD_TYPE) => {
            unpack(rdata.anything())
        }
        _ => None,
    }
}

/// Scans `message`'s additional section for a LOC record, removing it and
/// returning its decoded point. Returns `(Point::default, false)` if absent.
pub(crate) fn extract_and_remove(
    message: &mut hickory_server::proto::op::Message,
) -> (Option<Point>, bool) {
    let additionals = message.take_additionals();
    let mut point = None;
    let mut remaining = Vec::with_capacity(additionals.len());

    for record in additionals {
        if point.is_none() {
            if let Some(p) = record_point(&record) {
                point = Some(p);
                continue;
            }
        }
        remaining.push(record);
    }

    let found = point.is_some();
    for record in remaining {
        message.add_additional(record);
    }
    (point, found)
}

/// Appends `record` to `message`'s additional section.
pub(crate) fn insert(message: &mut hickory_server::proto::op::Message, record: Record) {
    message.add_additional(record);
}

#[cfg(test)]
mod tests {
    use super::*;
    use hickory_server::proto::{op::Message, rr::Name};

    #[test]
    fn distance_is_symmetric_and_zero_for_same_point() {
        let a = Point::new(55.0, 13.0);
        let b = Point::new(40.0, -74.0);

        assert_eq!(a.distance(&a), 0.0);
        assert!((a.distance(&b) - b.distance(&a)).abs() < 1e-6);
    }

    #[test]
    fn distance_obeys_triangle_inequality() {
        let a = Point::new(55.0, 13.0);
        let b = Point::new(0.0, 0.0);
        let c = Point::new(60.0, 15.0);

        assert!(a.distance(&c) <= a.distance(&b) + b.distance(&c) + 1e-6);
    }

    #[test]
    fn round_trip_through_message() {
        let name = Name::from_ascii("stockholm.geo.").unwrap();
        let point = Point::new(59.3293, 18.0686);
        let record = encode(name, point);

        let mut message = Message::new();
        insert(&mut message, record);

        let (decoded, found) = extract_and_remove(&mut message);
        assert!(found);
        let decoded = decoded.unwrap();
        assert!((decoded.lat - point.lat).abs() < 1e-3);
        assert!((decoded.lon - point.lon).abs() < 1e-3);
        assert!(message.additionals().is_empty());
    }

    #[test]
    fn extract_is_noop_without_marker() {
        let mut message = Message::new();
        let (point, found) = extract_and_remove(&mut message);
        assert!(!found);
        assert!(point.is_none());
    }
}
