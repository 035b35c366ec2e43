use std::cmp::Ordering;

use crate::firestore::error::{invalid_argument, FirestoreResult};

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GeoPoint {
    latitude: f64,
    longitude: f64,
}

impl GeoPoint {
    pub fn new(latitude: f64, longitude: f64) -> FirestoreResult<Self> {
        if !latitude.is_finite() || !(-90.0..=90.0).contains(&latitude) {
            return Err(invalid_argument(format!(
                "Latitude must be a number between -90 and 90, but was: {latitude}"
            )));
        }
        if !longitude.is_finite() || !(-180.0..=180.0).contains(&longitude) {
            return Err(invalid_argument(format!(
                "Longitude must be a number between -180 and 180, but was: {longitude}"
            )));
        }
        Ok(Self {
            latitude,
            longitude,
        })
    }

    pub fn latitude(&self) -> f64 {
        self.latitude
    }

    pub fn longitude(&self) -> f64 {
        self.longitude
    }

    /// Orders by latitude, then longitude.
    pub fn compare(&self, other: &GeoPoint) -> Ordering {
        let latitude = self.latitude.partial_cmp(&other.latitude);
        let longitude = self.longitude.partial_cmp(&other.longitude);
        latitude
            .unwrap_or(Ordering::Equal)
            .then(longitude.unwrap_or(Ordering::Equal))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn valid_coordinates() {
        let point = GeoPoint::new(10.0, 20.0).unwrap();
        assert_eq!(point.latitude(), 10.0);
        assert_eq!(point.longitude(), 20.0);
    }

    #[test]
    fn invalid_latitude() {
        let err = GeoPoint::new(100.0, 0.0).unwrap_err();
        assert_eq!(err.code_str(), "firestore/invalid-argument");
        assert!(GeoPoint::new(f64::NAN, 0.0).is_err());
    }

    #[test]
    fn compares_latitude_first() {
        let a = GeoPoint::new(1.0, 50.0).unwrap();
        let b = GeoPoint::new(2.0, 0.0).unwrap();
        assert_eq!(a.compare(&b), Ordering::Less);
    }
}
