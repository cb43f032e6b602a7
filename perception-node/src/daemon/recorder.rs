use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use chrono::Utc;
use image::GrayImage;
use tracing::{info, warn};

use crate::camera::Frame;
use crate::error::{PerceptionError, Result};

const GRAY_DIR: &str = "gray-img";
const CLOUD_DIR: &str = "dense-pc";

/// Writes every processed frame to disk: the grayscale image as PNG and the
/// dense point cloud as ASCII PLY, under one session directory per run.
pub struct FrameRecorder {
    session_dir: PathBuf,
    frames_written: u64,
}

impl FrameRecorder {
    /// Empties `data_root` and creates a fresh UTC-stamped session directory.
    pub fn create(data_root: &Path) -> Result<Self> {
        if data_root.exists() {
            for entry in fs::read_dir(data_root)? {
                let path = entry?.path();
                if path.is_dir() {
                    fs::remove_dir_all(&path)?;
                } else {
                    fs::remove_file(&path)?;
                }
            }
        }

        let session = Utc::now().format("%Y-%m-%d_%H-%M-%S").to_string();
        let session_dir = data_root.join(session);
        fs::create_dir_all(session_dir.join(GRAY_DIR))?;
        fs::create_dir_all(session_dir.join(CLOUD_DIR))?;
        info!("Recording frames to {}", session_dir.display());

        Ok(Self {
            session_dir,
            frames_written: 0,
        })
    }

    pub fn session_dir(&self) -> &Path {
        &self.session_dir
    }

    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Failures are logged and the frame is skipped.
    pub fn record(&mut self, frame: &Frame) {
        let name = format!("{:06}_{}", self.frames_written, frame.sensor_timestamp);
        let gray_path = self.session_dir.join(GRAY_DIR).join(format!("{}.png", name));
        let cloud_path = self.session_dir.join(CLOUD_DIR).join(format!("{}.ply", name));

        let result = write_gray(frame, &gray_path).and_then(|_| write_ply(frame, &cloud_path));
        match result {
            Ok(()) => self.frames_written += 1,
            Err(e) => warn!("Failed to record frame {}: {}", name, e),
        }
    }
}

fn write_gray(frame: &Frame, path: &Path) -> Result<()> {
    let pixels = frame.gray.iter().copied().collect();
    let image = GrayImage::from_raw(frame.width() as u32, frame.height() as u32, pixels)
        .ok_or_else(|| PerceptionError::ImageError("gray buffer size mismatch".to_string()))?;
    image.save(path)?;
    Ok(())
}

fn write_ply(frame: &Frame, path: &Path) -> Result<()> {
    let mut out = BufWriter::new(File::create(path)?);
    writeln!(out, "ply")?;
    writeln!(out, "format ascii 1.0")?;
    writeln!(out, "element vertex {}", frame.z.len())?;
    writeln!(out, "property float x")?;
    writeln!(out, "property float y")?;
    writeln!(out, "property float z")?;
    writeln!(out, "end_header")?;
    for ((x, y), z) in frame.x.iter().zip(frame.y.iter()).zip(frame.z.iter()) {
        writeln!(out, "{} {} {}", x, y, z)?;
    }
    out.flush()?;
    Ok(())
}
