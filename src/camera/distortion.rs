//! The closed set of supported lens distortion families.
//!
//! [`Distortion`] dispatches the shared contract (`distort`, `undistort`, and
//! the two Jacobians used by the solver) to the active variant. The serialized
//! form is a tagged record
//!
//! ```yaml
//! type: PlumbBob
//! coefficients: [k1, k2, p1, p2, k3]
//! ```
//!
//! Coefficients are always written as a list. On load they are also accepted
//! as a map keyed by coefficient name (`{k1: .., k2: ..}`).

use crate::camera::{CameraModelError, FishEye, PlumbBob};
use nalgebra::{Matrix2, Matrix2xX, Point2};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

const PLUMB_BOB_NAMES: [&str; 5] = ["k1", "k2", "p1", "p2", "k3"];
const FISHEYE_NAMES: [&str; 4] = ["k1", "k2", "k3", "k4"];

/// Selects which distortion family a calibration fits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum DistortionKind {
    #[default]
    PlumbBob,
    FishEye,
}

impl DistortionKind {
    pub fn num_coefficients(self) -> usize {
        match self {
            DistortionKind::PlumbBob => PlumbBob::NUM_COEFFICIENTS,
            DistortionKind::FishEye => FishEye::NUM_COEFFICIENTS,
        }
    }

    /// Coefficient names in storage order.
    pub fn coefficient_names(self) -> &'static [&'static str] {
        match self {
            DistortionKind::PlumbBob => &PLUMB_BOB_NAMES,
            DistortionKind::FishEye => &FISHEYE_NAMES,
        }
    }
}

impl fmt::Display for DistortionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DistortionKind::PlumbBob => write!(f, "PlumbBob"),
            DistortionKind::FishEye => write!(f, "FishEye"),
        }
    }
}

impl FromStr for DistortionKind {
    type Err = CameraModelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().replace(['_', '-'], "").as_str() {
            "plumbbob" | "radtan" => Ok(DistortionKind::PlumbBob),
            "fisheye" | "kannalabrandt" => Ok(DistortionKind::FishEye),
            other => Err(CameraModelError::InvalidParams(format!(
                "Unknown distortion type: {other}"
            ))),
        }
    }
}

/// Lens distortion coefficients, exactly one family active.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(try_from = "DistortionRecord", into = "DistortionRecord")]
pub enum Distortion {
    PlumbBob(PlumbBob),
    FishEye(FishEye),
}

impl Default for Distortion {
    fn default() -> Self {
        Distortion::zero(DistortionKind::default())
    }
}

impl Distortion {
    /// All-zero coefficients of the given family (the identity warp).
    pub fn zero(kind: DistortionKind) -> Self {
        match kind {
            DistortionKind::PlumbBob => Distortion::PlumbBob(PlumbBob::default()),
            DistortionKind::FishEye => Distortion::FishEye(FishEye::default()),
        }
    }

    pub fn kind(&self) -> DistortionKind {
        match self {
            Distortion::PlumbBob(_) => DistortionKind::PlumbBob,
            Distortion::FishEye(_) => DistortionKind::FishEye,
        }
    }

    pub fn num_coefficients(&self) -> usize {
        self.kind().num_coefficients()
    }

    pub fn is_zero(&self) -> bool {
        self.coefficients().iter().all(|c| *c == 0.0)
    }

    pub fn coefficients(&self) -> Vec<f64> {
        match self {
            Distortion::PlumbBob(d) => d.coefficients().to_vec(),
            Distortion::FishEye(d) => d.coefficients().to_vec(),
        }
    }

    pub fn from_coefficients(
        kind: DistortionKind,
        coefficients: &[f64],
    ) -> Result<Self, CameraModelError> {
        let expected = kind.num_coefficients();
        if coefficients.len() != expected {
            return Err(CameraModelError::InvalidParams(format!(
                "{kind} expects {expected} distortion coefficients, found {}",
                coefficients.len()
            )));
        }
        Ok(match kind {
            DistortionKind::PlumbBob => {
                let mut c = [0.0; 5];
                c.copy_from_slice(coefficients);
                Distortion::PlumbBob(PlumbBob::from_coefficients(&c))
            }
            DistortionKind::FishEye => {
                let mut c = [0.0; 4];
                c.copy_from_slice(coefficients);
                Distortion::FishEye(FishEye::from_coefficients(&c))
            }
        })
    }

    /// Maps an ideal normalized point to its distorted normalized position.
    #[inline]
    pub fn distort(&self, point: &Point2<f64>) -> Point2<f64> {
        match self {
            Distortion::PlumbBob(d) => d.distort(point),
            Distortion::FishEye(d) => d.distort(point),
        }
    }

    /// Inverse of [`Distortion::distort`]. NaN coordinates mean the point has
    /// no preimage under this model.
    #[inline]
    pub fn undistort(&self, point: &Point2<f64>) -> Point2<f64> {
        match self {
            Distortion::PlumbBob(d) => d.undistort(point),
            Distortion::FishEye(d) => d.undistort(point),
        }
    }

    pub fn point_jacobian(&self, point: &Point2<f64>) -> Matrix2<f64> {
        match self {
            Distortion::PlumbBob(d) => d.point_jacobian(point),
            Distortion::FishEye(d) => d.point_jacobian(point),
        }
    }

    /// 2 x `num_coefficients()` Jacobian of the distorted point with respect to
    /// the coefficients, columns in [`Distortion::coefficients`] order.
    pub fn coefficient_jacobian(&self, point: &Point2<f64>) -> Matrix2xX<f64> {
        match self {
            Distortion::PlumbBob(d) => {
                Matrix2xX::from_column_slice(d.coefficient_jacobian(point).as_slice())
            }
            Distortion::FishEye(d) => {
                Matrix2xX::from_column_slice(d.coefficient_jacobian(point).as_slice())
            }
        }
    }
}

#[derive(Serialize, Deserialize)]
#[serde(untagged)]
enum CoefficientList {
    List(Vec<f64>),
    Named(BTreeMap<String, f64>),
}

#[derive(Serialize, Deserialize)]
struct DistortionRecord {
    #[serde(rename = "type")]
    kind: DistortionKind,
    coefficients: CoefficientList,
}

impl From<Distortion> for DistortionRecord {
    fn from(distortion: Distortion) -> Self {
        DistortionRecord {
            kind: distortion.kind(),
            coefficients: CoefficientList::List(distortion.coefficients()),
        }
    }
}

impl TryFrom<DistortionRecord> for Distortion {
    type Error = CameraModelError;

    fn try_from(record: DistortionRecord) -> Result<Self, Self::Error> {
        let values = match record.coefficients {
            CoefficientList::List(values) => values,
            CoefficientList::Named(mut named) => {
                let names = record.kind.coefficient_names();
                let values: Vec<f64> = names
                    .iter()
                    .map(|name| named.remove(*name).unwrap_or(0.0))
                    .collect();
                if let Some(unknown) = named.keys().next() {
                    return Err(CameraModelError::InvalidParams(format!(
                        "Unknown {} coefficient: {unknown}",
                        record.kind
                    )));
                }
                values
            }
        };
        Distortion::from_coefficients(record.kind, &values)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_from_coefficients_checks_length() {
        assert!(Distortion::from_coefficients(DistortionKind::PlumbBob, &[0.1; 4]).is_err());
        assert!(Distortion::from_coefficients(DistortionKind::FishEye, &[0.1; 5]).is_err());

        let d = Distortion::from_coefficients(DistortionKind::FishEye, &[0.1, 0.2, 0.3, 0.4])
            .unwrap();
        assert_eq!(d.kind(), DistortionKind::FishEye);
        assert_eq!(d.coefficients(), vec![0.1, 0.2, 0.3, 0.4]);
    }

    #[test]
    fn test_zero_is_identity() {
        for kind in [DistortionKind::PlumbBob, DistortionKind::FishEye] {
            let d = Distortion::zero(kind);
            assert!(d.is_zero());
            let p = Point2::new(0.3, -0.1);
            assert_relative_eq!(d.distort(&p), p, epsilon = 1e-15);
            assert_relative_eq!(d.undistort(&p), p, epsilon = 1e-12);
        }
    }

    #[test]
    fn test_coefficient_jacobian_shape() {
        let p = Point2::new(0.2, 0.1);
        let plumb = Distortion::zero(DistortionKind::PlumbBob);
        let fish = Distortion::zero(DistortionKind::FishEye);
        assert_eq!(plumb.coefficient_jacobian(&p).ncols(), 5);
        assert_eq!(fish.coefficient_jacobian(&p).ncols(), 4);
        assert_relative_eq!(plumb.coefficient_jacobian(&p)[(0, 3)], 0.13, epsilon = 1e-12);
    }

    #[test]
    fn test_serde_list_and_named() {
        let d = Distortion::PlumbBob(PlumbBob::new(0.1, 0.1, 0.2, 0.1, 0.0));
        let yaml = serde_yaml::to_string(&d).unwrap();
        assert!(yaml.contains("type: PlumbBob"));
        let back: Distortion = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(back, d);

        let named = "type: FishEye\ncoefficients:\n  k1: 0.5\n  k3: -0.25\n";
        let parsed: Distortion = serde_yaml::from_str(named).unwrap();
        assert_eq!(parsed, Distortion::FishEye(FishEye::new(0.5, 0.0, -0.25, 0.0)));

        let unknown = "type: FishEye\ncoefficients:\n  p1: 0.5\n";
        assert!(serde_yaml::from_str::<Distortion>(unknown).is_err());
    }

    #[test]
    fn test_kind_from_str() {
        assert_eq!("plumb_bob".parse::<DistortionKind>().unwrap(), DistortionKind::PlumbBob);
        assert_eq!("FishEye".parse::<DistortionKind>().unwrap(), DistortionKind::FishEye);
        assert_eq!("kannala_brandt".parse::<DistortionKind>().unwrap(), DistortionKind::FishEye);
        assert!("ucm".parse::<DistortionKind>().is_err());
    }
}
