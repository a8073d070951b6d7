//! Calibration artifact exchange.
//!
//! The artifact is the durable output of a calibration:
//!
//! ```yaml
//! projection:
//!   fx: 1244.62
//!   fy: 930.99
//!   cx: 2016.0
//!   cy: 1508.0
//!   s: 0.0
//! distortion:
//!   type: PlumbBob
//!   coefficients: [0.1, 0.1, 0.2, 0.1, 0.0]
//! ```
//!
//! It round-trips through YAML and JSON. Camera files in the `cam0` layout
//! (`intrinsics`, `distortion`, `camera_model`, `resolution`) can be imported
//! with [`CalibrationArtifact::import_cam0`].

use crate::camera::{
    validation, CameraModel, CameraModelError, Distortion, DistortionKind, Intrinsics, Resolution,
};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use yaml_rust::{Yaml, YamlLoader};

/// Pinhole block of the artifact. `s` is the skew term.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Projection {
    pub fx: f64,
    pub fy: f64,
    pub cx: f64,
    pub cy: f64,
    #[serde(default)]
    pub s: f64,
}

impl From<Intrinsics> for Projection {
    fn from(k: Intrinsics) -> Self {
        Self {
            fx: k.fx,
            fy: k.fy,
            cx: k.cx,
            cy: k.cy,
            s: k.skew,
        }
    }
}

impl From<Projection> for Intrinsics {
    fn from(p: Projection) -> Self {
        Intrinsics::new(p.fx, p.fy, p.cx, p.cy, p.s)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CalibrationArtifact {
    pub projection: Projection,
    pub distortion: Distortion,
}

impl From<&CameraModel> for CalibrationArtifact {
    fn from(model: &CameraModel) -> Self {
        Self {
            projection: model.intrinsics.into(),
            distortion: model.distortion,
        }
    }
}

impl CalibrationArtifact {
    pub fn new(intrinsics: Intrinsics, distortion: Distortion) -> Self {
        Self {
            projection: intrinsics.into(),
            distortion,
        }
    }

    pub fn intrinsics(&self) -> Intrinsics {
        self.projection.into()
    }

    /// Validated camera model described by this artifact.
    pub fn to_camera_model(&self) -> Result<CameraModel, CameraModelError> {
        let model = CameraModel::new(self.intrinsics(), self.distortion);
        model.validate_params()?;
        Ok(model)
    }

    pub fn to_yaml_string(&self) -> Result<String, CameraModelError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn from_yaml_str(contents: &str) -> Result<Self, CameraModelError> {
        let artifact: Self = serde_yaml::from_str(contents)?;
        artifact.to_camera_model()?;
        Ok(artifact)
    }

    pub fn to_json_string(&self) -> Result<String, CameraModelError> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    pub fn from_json_str(contents: &str) -> Result<Self, CameraModelError> {
        let artifact: Self = serde_json::from_str(contents)?;
        artifact.to_camera_model()?;
        Ok(artifact)
    }

    /// Writes the artifact, choosing JSON for `.json` paths and YAML otherwise.
    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<(), CameraModelError> {
        let path = path.as_ref();
        let contents = if is_json(path) {
            self.to_json_string()?
        } else {
            self.to_yaml_string()?
        };
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, contents)?;
        info!("Saved calibration artifact to {}", path.display());
        Ok(())
    }

    /// Reads an artifact, choosing JSON for `.json` paths and YAML otherwise.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, CameraModelError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        if is_json(path) {
            Self::from_json_str(&contents)
        } else {
            Self::from_yaml_str(&contents)
        }
    }

    /// Imports a `cam0` camera file. Returns the artifact and the image
    /// resolution stored alongside it.
    pub fn import_cam0<P: AsRef<Path>>(path: P) -> Result<(Self, Resolution), CameraModelError> {
        let contents = fs::read_to_string(path)?;
        Self::from_cam0_str(&contents)
    }

    pub fn from_cam0_str(contents: &str) -> Result<(Self, Resolution), CameraModelError> {
        let docs = YamlLoader::load_from_str(contents)?;
        let doc = docs.first().ok_or_else(|| {
            CameraModelError::InvalidParams("Empty YAML document".to_string())
        })?;
        let cam = &doc["cam0"];

        let intrinsics_yaml = cam["intrinsics"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid intrinsics".to_string()))?;
        if intrinsics_yaml.len() < 4 {
            return Err(CameraModelError::InvalidParams(format!(
                "Expected 4 intrinsics, found {}",
                intrinsics_yaml.len()
            )));
        }
        let value = |idx: usize, name: &str| {
            yaml_number(&intrinsics_yaml[idx])
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}")))
        };
        let intrinsics = Intrinsics::new(
            value(0, "fx")?,
            value(1, "fy")?,
            value(2, "cx")?,
            value(3, "cy")?,
            0.0,
        );
        validation::validate_intrinsics(&intrinsics)?;

        let resolution_yaml = cam["resolution"]
            .as_vec()
            .ok_or_else(|| CameraModelError::InvalidParams("Invalid resolution".to_string()))?;
        let dimension = |idx: usize, name: &str| {
            resolution_yaml
                .get(idx)
                .and_then(Yaml::as_i64)
                .filter(|v| *v > 0)
                .map(|v| v as u32)
                .ok_or_else(|| CameraModelError::InvalidParams(format!("Invalid {name}")))
        };
        let resolution = Resolution::new(dimension(0, "width")?, dimension(1, "height")?);

        let kind = match cam["camera_model"].as_str().unwrap_or("pinhole") {
            "pinhole" | "rad_tan" | "radtan" | "plumb_bob" => DistortionKind::PlumbBob,
            "kannala_brandt" | "fisheye" | "equidistant" => DistortionKind::FishEye,
            other => {
                return Err(CameraModelError::InvalidParams(format!(
                    "Unsupported camera_model: {other}"
                )))
            }
        };

        let distortion = match cam["distortion"].as_vec() {
            None => Distortion::zero(kind),
            Some(node) => {
                let mut coefficients = node
                    .iter()
                    .map(|c| {
                        yaml_number(c).ok_or_else(|| {
                            CameraModelError::InvalidParams(
                                "Invalid distortion coefficient".to_string(),
                            )
                        })
                    })
                    .collect::<Result<Vec<f64>, _>>()?;
                // rad_tan files commonly omit k3
                if kind == DistortionKind::PlumbBob && coefficients.len() == 4 {
                    coefficients.push(0.0);
                }
                Distortion::from_coefficients(kind, &coefficients)?
            }
        };

        let artifact = Self::new(intrinsics, distortion);
        artifact.to_camera_model()?;
        Ok((artifact, resolution))
    }
}

fn is_json(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .is_some_and(|e| e.eq_ignore_ascii_case("json"))
}

fn yaml_number(node: &Yaml) -> Option<f64> {
    node.as_f64().or_else(|| node.as_i64().map(|v| v as f64))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::camera::{FishEye, PlumbBob};

    fn sample() -> CalibrationArtifact {
        CalibrationArtifact::new(
            Intrinsics::new(1244.62, 930.99, 2016.0, 1508.0, 0.0),
            Distortion::PlumbBob(PlumbBob::new(0.1, 0.1, 0.2, 0.1, 0.0)),
        )
    }

    #[test]
    fn test_yaml_roundtrip() {
        let artifact = sample();
        let yaml = artifact.to_yaml_string().unwrap();
        assert!(yaml.contains("projection:"));
        assert!(yaml.contains("type: PlumbBob"));
        let back = CalibrationArtifact::from_yaml_str(&yaml).unwrap();
        assert_eq!(back, artifact);
    }

    #[test]
    fn test_json_roundtrip() {
        let artifact = CalibrationArtifact::new(
            Intrinsics::new(300.0, 301.0, 320.0, 240.0, 0.5),
            Distortion::FishEye(FishEye::new(-0.01, 0.04, -0.04, 0.01)),
        );
        let json = artifact.to_json_string().unwrap();
        let back = CalibrationArtifact::from_json_str(&json).unwrap();
        assert_eq!(back, artifact);
    }

    #[test]
    fn test_named_coefficients_are_accepted() {
        let yaml = "projection: {fx: 1244.62, fy: 930.99, cx: 2016.0, cy: 1508.0}\n\
                    distortion:\n  type: PlumbBob\n  coefficients: {k1: 0.1, k2: 0.1, p1: 0.2, p2: 0.1, k3: 0.0}\n";
        let artifact = CalibrationArtifact::from_yaml_str(yaml).unwrap();
        assert_eq!(artifact, sample());
    }

    #[test]
    fn test_invalid_projection_is_rejected() {
        let yaml = "projection: {fx: -1.0, fy: 930.99, cx: 2016.0, cy: 1508.0, s: 0.0}\n\
                    distortion: {type: FishEye, coefficients: [0.0, 0.0, 0.0, 0.0]}\n";
        assert!(CalibrationArtifact::from_yaml_str(yaml).is_err());
    }

    #[test]
    fn test_save_and_load_file() {
        let dir = std::env::temp_dir().join("lenscal_artifact_test");
        let artifact = sample();
        for name in ["camera.yaml", "camera.json"] {
            let path = dir.join(name);
            artifact.save(&path).unwrap();
            let back = CalibrationArtifact::load(&path).unwrap();
            assert_eq!(back, artifact);
        }
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn test_import_cam0() {
        let yaml = r#"
cam0:
  camera_model: rad_tan
  intrinsics: [461.629, 460.152, 362.680, 246.049]
  distortion: [-0.27695497, 0.06712482, 0.00087538, 0.00011556]
  rostopic: /cam0/image_raw
  resolution: [752, 480]
"#;
        let (artifact, resolution) = CalibrationArtifact::from_cam0_str(yaml).unwrap();
        assert_eq!(resolution, Resolution::new(752, 480));
        assert_eq!(artifact.distortion.kind(), DistortionKind::PlumbBob);
        assert_eq!(artifact.distortion.coefficients()[4], 0.0);
        assert_eq!(artifact.projection.fx, 461.629);

        let fisheye = r#"
cam0:
  camera_model: kannala_brandt
  intrinsics: [190.97, 190.97, 254.93, 256.89]
  distortion: [0.0034, 0.0007, -0.0020, 0.0002]
  resolution: [512, 512]
"#;
        let (artifact, _) = CalibrationArtifact::from_cam0_str(fisheye).unwrap();
        assert_eq!(artifact.distortion.kind(), DistortionKind::FishEye);

        let unsupported = "cam0:\n  camera_model: ucm\n  intrinsics: [1, 1, 0, 0]\n  resolution: [2, 2]\n";
        assert!(CalibrationArtifact::from_cam0_str(unsupported).is_err());
    }
}
