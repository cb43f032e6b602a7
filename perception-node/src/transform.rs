use std::fs;
use std::path::Path;

use nalgebra::{Matrix4, Vector3, Vector4};
use tof_common::Point2D;
use tracing::info;

use crate::error::{PerceptionError, Result};

const METERS_TO_MM: f32 = 1000.0;

/// Rigid transform from the sensor frame (meters) into the robot's planar
/// LDS frame (millimeters).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CoordinateTransformer {
    matrix: Matrix4<f32>,
}

impl CoordinateTransformer {
    pub fn from_matrix(matrix: Matrix4<f32>) -> Self {
        Self { matrix }
    }

    /// Reads 16 whitespace-separated floats, row-major.
    pub fn load(path: &Path) -> Result<Self> {
        let fail = |reason: String| PerceptionError::TransformLoadError {
            path: path.to_path_buf(),
            reason,
        };

        let text = fs::read_to_string(path).map_err(|e| fail(e.to_string()))?;
        let values = text
            .split_whitespace()
            .map(|token| match token.parse::<f32>() {
                Ok(v) if v.is_finite() => Ok(v),
                _ => Err(fail(format!("invalid element '{}'", token))),
            })
            .collect::<Result<Vec<f32>>>()?;

        if values.len() != 16 {
            return Err(fail(format!("expected 16 elements, found {}", values.len())));
        }

        let matrix = Matrix4::from_row_slice(&values);
        info!("Loaded ToF to LDS transform from {}:{}", path.display(), matrix);
        Ok(Self { matrix })
    }

    pub fn matrix(&self) -> &Matrix4<f32> {
        &self.matrix
    }

    pub fn inverse(&self) -> Option<Self> {
        self.matrix.try_inverse().map(Self::from_matrix)
    }

    /// Full transformed point in millimeters.
    pub fn to_robot_frame(&self, x: f32, y: f32, z: f32) -> Vector3<f32> {
        let p = self.matrix
            * Vector4::new(x * METERS_TO_MM, y * METERS_TO_MM, z * METERS_TO_MM, 1.0);
        Vector3::new(p.x, p.y, p.z)
    }

    /// Planar robot-frame position; z is dropped and x/y truncate toward zero.
    pub fn transform(&self, x: f32, y: f32, z: f32) -> Point2D {
        let p = self.to_robot_frame(x, y, z);
        Point2D::new(p.x as i32, p.y as i32)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use std::io::Write;
    use tempfile::NamedTempFile;

    fn write_matrix(contents: &str) -> NamedTempFile {
        let mut file = NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    fn translation(tx: f32, ty: f32, tz: f32) -> Matrix4<f32> {
        Matrix4::new_translation(&Vector3::new(tx, ty, tz))
    }

    #[test]
    fn test_identity_origin() {
        let t = CoordinateTransformer::from_matrix(Matrix4::identity());
        assert_eq!(t.transform(0.0, 0.0, 0.0), Point2D::new(0, 0));
        assert_eq!(t.transform(0.25, -0.5, 3.0), Point2D::new(250, -500));
    }

    #[test]
    fn test_translation_in_millimeters() {
        let t = CoordinateTransformer::from_matrix(translation(120.0, -45.0, 300.0));
        assert_eq!(t.transform(0.0, 0.0, 0.0), Point2D::new(120, -45));
        assert_eq!(t.transform(0.5, 0.25, 2.0), Point2D::new(620, 205));
    }

    #[test]
    fn test_inverse_round_trip() {
        let rotation = nalgebra::Rotation3::from_euler_angles(0.1, -0.3, 1.2);
        let matrix = translation(50.0, 20.0, -10.0) * rotation.to_homogeneous();
        let forward = CoordinateTransformer::from_matrix(matrix);
        let inverse = forward.inverse().unwrap();

        let p = forward.to_robot_frame(0.3, -0.2, 1.1);
        let back = inverse.to_robot_frame(p.x / 1000.0, p.y / 1000.0, p.z / 1000.0);
        assert_relative_eq!(back, Vector3::new(300.0, -200.0, 1100.0), epsilon = 1e-2);
    }

    #[test]
    fn test_load_row_major_file() {
        let file = write_matrix("1\n0\n0\n12.5\n0\n1\n0\n-3\n0\n0\n1\n0\n0\n0\n0\n1\n");
        let t = CoordinateTransformer::load(file.path()).unwrap();
        assert_relative_eq!(t.matrix()[(0, 3)], 12.5);
        assert_relative_eq!(t.matrix()[(1, 3)], -3.0);
        assert_eq!(t.transform(0.0, 0.0, 0.0), Point2D::new(12, -3));
    }

    #[test]
    fn test_load_rejects_bad_files() {
        let short = write_matrix("1 0 0 0\n0 1 0 0\n0 0 1 0\n");
        let long = write_matrix(&"1\n".repeat(17));
        let garbage = write_matrix(&format!("{}abc\n", "1\n".repeat(15)));

        for file in [&short, &long, &garbage] {
            let err = CoordinateTransformer::load(file.path()).unwrap_err();
            assert!(matches!(err, PerceptionError::TransformLoadError { .. }));
            assert!(err.is_fatal());
        }

        let missing = CoordinateTransformer::load(Path::new("/nonexistent/tof.conf"));
        assert!(matches!(missing, Err(PerceptionError::TransformLoadError { .. })));
    }
}
