use lazy_static::lazy_static;
use regex::Regex;
use serde::Serialize;

use crate::err::Error;
use crate::models::Classroom;

pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

lazy_static! {
    static ref LAT_LNG: Regex = Regex::new(r"(-?\d+\.\d+)\s*,\s*(-?\d+\.\d+)").unwrap();
    static ref RADIUS: Regex = Regex::new(r"(?:^|[^\d.])(\d+)\s*m\b").unwrap();
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Point {
    pub lat: f64,
    pub lng: f64,
}

impl Point {
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }
}

/// Great-circle distance in metres.
pub fn haversine_m(a: Point, b: Point) -> f64 {
    let phi1 = a.lat.to_radians();
    let phi2 = b.lat.to_radians();
    let d_phi = (b.lat - a.lat).to_radians();
    let d_lambda = (b.lng - a.lng).to_radians();

    let h = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * h.sqrt().atan2((1.0 - h).sqrt());
    EARTH_RADIUS_M * c
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct Geofence {
    pub center: Point,
    pub radius_m: f64,
}

impl Geofence {
    pub fn distance_m(&self, point: Point) -> f64 {
        haversine_m(self.center, point)
    }

    pub fn contains(&self, point: Point) -> bool {
        self.distance_m(point) <= self.radius_m
    }
}

/// Reads `"<lat>, <lng>"` and an optional `"<N>m"` radius out of free venue text.
pub fn parse_venue(venue: &str, default_radius_m: f64) -> Option<Geofence> {
    let caps = LAT_LNG.captures(venue)?;
    let lat: f64 = caps[1].parse().ok()?;
    let lng: f64 = caps[2].parse().ok()?;
    let lowered = venue.to_lowercase();
    let radius_m = RADIUS
        .captures(&lowered)
        .and_then(|c| c[1].parse::<f64>().ok())
        .unwrap_or(default_radius_m);
    Some(Geofence {
        center: Point::new(lat, lng),
        radius_m,
    })
}

/// Explicit coordinates win; the venue text fills in whatever is missing.
pub fn classroom_geofence(classroom: &Classroom, default_radius_m: f64) -> Option<Geofence> {
    let parsed = parse_venue(&classroom.venue, default_radius_m);
    let center = match (classroom.venue_lat, classroom.venue_lng) {
        (Some(lat), Some(lng)) => Point::new(lat, lng),
        _ => parsed?.center,
    };
    let radius_m = classroom
        .geofence_radius_m
        .or_else(|| parsed.map(|g| g.radius_m))
        .unwrap_or(default_radius_m);
    if radius_m <= 0.0 {
        return None;
    }
    Some(Geofence { center, radius_m })
}

pub fn parse_location(
    latitude: Option<&str>,
    longitude: Option<&str>,
) -> Result<Option<Point>, Error> {
    let latitude = latitude.map(str::trim).filter(|s| !s.is_empty());
    let longitude = longitude.map(str::trim).filter(|s| !s.is_empty());
    match (latitude, longitude) {
        (Some(lat), Some(lng)) => {
            let lat: f64 = lat
                .parse()
                .map_err(|_| Error::invalid(format!("`latitude` is not a number: {}", lat)))?;
            let lng: f64 = lng
                .parse()
                .map_err(|_| Error::invalid(format!("`longitude` is not a number: {}", lng)))?;
            if !(-90.0..=90.0).contains(&lat) || !(-180.0..=180.0).contains(&lng) {
                return Err(Error::invalid("Coordinates out of range"));
            }
            Ok(Some(Point::new(lat, lng)))
        }
        _ => Ok(None),
    }
}

/// Gate for self-marking: no fence means no check, a fence without a
/// client location is refused.
pub fn check_location(fence: Option<Geofence>, location: Option<Point>) -> Result<(), Error> {
    let fence = match fence {
        Some(fence) => fence,
        None => return Ok(()),
    };
    let location = location.ok_or_else(|| Error::LocationRequired {
        message: "Location required to mark attendance for this classroom".to_string(),
    })?;
    let distance_m = fence.distance_m(location);
    if distance_m > fence.radius_m {
        return Err(Error::OutsideGeofence {
            message: "You are outside the classroom geofence".to_string(),
            distance_m,
            radius_m: fence.radius_m,
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    const DELHI: Point = Point {
        lat: 28.6139,
        lng: 77.2090,
    };
    const MUMBAI: Point = Point {
        lat: 19.0760,
        lng: 72.8777,
    };

    #[test]
    fn zero_at_identical_points() {
        assert_eq!(haversine_m(DELHI, DELHI), 0.0);
        assert_eq!(haversine_m(MUMBAI, MUMBAI), 0.0);
    }

    #[test]
    fn symmetric() {
        let there = haversine_m(DELHI, MUMBAI);
        let back = haversine_m(MUMBAI, DELHI);
        assert!((there - back).abs() < 1e-6);
        // roughly 1150 km
        assert!((1_140_000.0..1_160_000.0).contains(&there));
    }

    #[test]
    fn one_degree_of_latitude() {
        let d = haversine_m(Point::new(0.0, 0.0), Point::new(1.0, 0.0));
        assert!((d - 111_195.0).abs() < 10.0);
    }

    #[test]
    fn fence_boundary() {
        let fence = Geofence {
            center: DELHI,
            radius_m: 100.0,
        };
        assert!(fence.contains(DELHI));
        // ~55 m north
        assert!(fence.contains(Point::new(28.6144, 77.2090)));
        // ~1.1 km north
        assert!(!fence.contains(Point::new(28.6239, 77.2090)));
    }

    #[test]
    fn venue_text_parsing() {
        let fence = parse_venue("Lab 3, 28.6139, 77.2090 within 200m", 150.0).unwrap();
        assert_eq!(fence.center, DELHI);
        assert_eq!(fence.radius_m, 200.0);

        let fence = parse_venue("28.6139,77.2090 Main hall", 150.0).unwrap();
        assert_eq!(fence.radius_m, 150.0);

        assert!(parse_venue("Room 12", 150.0).is_none());
    }

    #[test]
    fn location_parsing() {
        assert_eq!(parse_location(None, Some("1.0")).unwrap(), None);
        assert_eq!(parse_location(Some(""), Some("")).unwrap(), None);
        assert_eq!(
            parse_location(Some("28.6139"), Some(" 77.2090")).unwrap(),
            Some(DELHI)
        );
        assert!(parse_location(Some("north"), Some("1.0")).is_err());
        assert!(parse_location(Some("91.0"), Some("1.0")).is_err());
    }

    #[test]
    fn location_gate() {
        let fence = Geofence {
            center: DELHI,
            radius_m: 150.0,
        };
        assert!(check_location(None, None).is_ok());
        assert!(matches!(
            check_location(Some(fence), None),
            Err(Error::LocationRequired { .. })
        ));
        assert!(check_location(Some(fence), Some(DELHI)).is_ok());
        assert!(matches!(
            check_location(Some(fence), Some(MUMBAI)),
            Err(Error::OutsideGeofence { .. })
        ));
    }
}
