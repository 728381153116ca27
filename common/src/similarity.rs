//! Duplicate suppression for incoming alarms.
//!
//! An alarm that looks like (perceptual hash) *and* sits next to (haversine
//! distance) an alarm an operator already dismissed is stored as
//! auto-dismissed instead of pending.  The gate is run by the alarm sink
//! before it accepts an alarm; the pipeline only computes the hash.

use std::fmt;
use std::str::FromStr;

use image::imageops::FilterType;
use image::RgbImage;
use serde::{Deserialize, Serialize};

use crate::detection::{AlarmRecord, AlarmStatus};

/// Mean Earth radius in metres.
pub const EARTH_RADIUS_M: f64 = 6_371_000.0;

/// 64-bit difference hash of an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageHash(pub u64);

impl ImageHash {
    /// dHash: grayscale, shrink to 9×8, one bit per horizontally adjacent
    /// pair, set when the left pixel is brighter.
    pub fn of(img: &RgbImage) -> Self {
        let gray = image::imageops::grayscale(img);
        let small = image::imageops::resize(&gray, 9, 8, FilterType::Triangle);
        let mut bits = 0u64;
        for y in 0..8 {
            for x in 0..8 {
                let left = small.get_pixel(x, y).0[0];
                let right = small.get_pixel(x + 1, y).0[0];
                bits <<= 1;
                if left > right {
                    bits |= 1;
                }
            }
        }
        ImageHash(bits)
    }

    /// Number of differing bits.
    pub fn distance(&self, other: &ImageHash) -> u32 {
        (self.0 ^ other.0).count_ones()
    }

    pub fn to_hex(&self) -> String {
        format!("{:016x}", self.0)
    }
}

impl fmt::Display for ImageHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl FromStr for ImageHash {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        u64::from_str_radix(s.trim(), 16).map(ImageHash)
    }
}

/// Great-circle distance in metres between two `(lat, lon)` points given in
/// degrees.
pub fn haversine_m(lat1: f64, lon1: f64, lat2: f64, lon2: f64) -> f64 {
    let phi1 = lat1.to_radians();
    let phi2 = lat2.to_radians();
    let d_phi = (lat2 - lat1).to_radians();
    let d_lambda = (lon2 - lon1).to_radians();
    let a = (d_phi / 2.0).sin().powi(2) + phi1.cos() * phi2.cos() * (d_lambda / 2.0).sin().powi(2);
    let c = 2.0 * a.sqrt().atan2((1.0 - a).sqrt());
    EARTH_RADIUS_M * c
}

/// Thresholds for the duplicate check.  Both must be undercut.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct SimilarityGate {
    pub max_hash_distance: u32,
    pub max_distance_m: f64,
}

impl Default for SimilarityGate {
    fn default() -> Self {
        Self {
            max_hash_distance: 18,
            max_distance_m: 50.0,
        }
    }
}

/// Location and fingerprint of an alarm being compared.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AlarmFingerprint {
    pub hash: ImageHash,
    pub latitude: f64,
    pub longitude: f64,
}

impl SimilarityGate {
    /// Whether `a` duplicates `b`: hash distance and geographic distance are
    /// both strictly below their thresholds.
    pub fn is_duplicate(&self, a: &AlarmFingerprint, b: &AlarmFingerprint) -> bool {
        if a.hash.distance(&b.hash) >= self.max_hash_distance {
            return false;
        }
        haversine_m(a.latitude, a.longitude, b.latitude, b.longitude) < self.max_distance_m
    }

    /// Initial status for a new alarm given the stored alarms.  Only records
    /// with status `Dismissed` are compared; records whose hash cannot be
    /// parsed are skipped.
    pub fn classify<'a, I>(&self, new: &AlarmFingerprint, stored: I) -> AlarmStatus
    where
        I: IntoIterator<Item = &'a AlarmRecord>,
    {
        let duplicate = stored
            .into_iter()
            .filter(|r| r.status == AlarmStatus::Dismissed)
            .filter_map(|r| {
                let hash = r.image_hash.parse::<ImageHash>().ok()?;
                Some(AlarmFingerprint {
                    hash,
                    latitude: r.latitude,
                    longitude: r.longitude,
                })
            })
            .any(|old| self.is_duplicate(new, &old));

        if duplicate {
            AlarmStatus::AutoDismissed
        } else {
            AlarmStatus::Pending
        }
    }
}
