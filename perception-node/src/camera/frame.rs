use image::{Rgb, RgbImage};
use ndarray::Array2;

use super::DepthData;
use crate::config::ConversionConfig;

/// Depth code used for pixels without a usable measurement.
const INVALID_DEPTH: u8 = 0;

/// One sensor acquisition after conversion. Arrays are indexed `[row, col]`.
#[derive(Debug, Clone)]
pub struct Frame {
    pub x: Array2<f32>,
    pub y: Array2<f32>,
    pub z: Array2<f32>,
    /// Euclidean distance from the sensor, 0 where the point was clipped.
    pub distance: Array2<f32>,
    /// Scaled noise image used to separate objects inside a box.
    pub gray: Array2<u8>,
    /// False-colored depth image fed to the detector.
    pub color: RgbImage,
    /// Sensor clock, milliseconds.
    pub sensor_timestamp: u64,
    /// Host monotonic clock, milliseconds.
    pub host_timestamp_ms: f64,
}

impl Frame {
    pub fn width(&self) -> usize {
        self.z.ncols()
    }

    pub fn height(&self) -> usize {
        self.z.nrows()
    }
}

/// Converts raw driver output into [`Frame`]s of a fixed resolution.
#[derive(Debug, Clone)]
pub struct FrameConverter {
    width: usize,
    height: usize,
    config: ConversionConfig,
    atan_norm: f32,
}

impl FrameConverter {
    pub fn new(width: usize, height: usize, config: ConversionConfig) -> Self {
        Self {
            width,
            height,
            config,
            atan_norm: 255.0 / std::f32::consts::FRAC_PI_2,
        }
    }

    pub fn dimensions(&self) -> (usize, usize) {
        (self.width, self.height)
    }

    /// Returns `None` when the data does not match the sensor resolution.
    pub fn convert(&self, data: &DepthData) -> Option<Frame> {
        let (width, height) = (self.width, self.height);
        if data.width != width || data.height != height || data.points.len() != width * height {
            return None;
        }

        let mut x = Array2::<f32>::zeros((height, width));
        let mut y = Array2::<f32>::zeros((height, width));
        let mut z = Array2::<f32>::zeros((height, width));
        let mut distance = Array2::<f32>::zeros((height, width));
        let mut gray = Array2::<u8>::zeros((height, width));
        let mut color = RgbImage::new(width as u32, height as u32);

        for (idx, point) in data.points.iter().enumerate() {
            let row = idx / width;
            let col = idx % width;

            x[[row, col]] = point.x;
            y[[row, col]] = point.y;
            z[[row, col]] = point.z;

            let depth_code = if point.z > self.config.clip_distance_max || point.z < 1e-6 {
                INVALID_DEPTH
            } else {
                let dist = (point.x * point.x + point.y * point.y + point.z * point.z).sqrt();
                distance[[row, col]] = dist;
                self.depth_code(dist, point.gray_value as f32)
            };

            // Saturating cast: zero noise maps to 255.
            gray[[row, col]] = (255.0 / (self.config.noise_scale * point.noise)) as u8;
            color.put_pixel(col as u32, row as u32, Rgb(jet_color(depth_code)));
        }

        Some(Frame {
            x,
            y,
            z,
            distance,
            gray,
            color,
            sensor_timestamp: data.timestamp / 1000,
            host_timestamp_ms: monotonic_ms(),
        })
    }

    /// Depth normalized by the returned intensity, compressed with atan into 1..=255.
    fn depth_code(&self, distance: f32, gray_value: f32) -> u8 {
        let depth_norm = distance / self.config.depth_normal;
        let gray_norm = gray_value / self.config.gray_normal;
        let ratio = if gray_norm < 1e-6 {
            depth_norm.atan()
        } else {
            (depth_norm / gray_norm).atan()
        };
        let code = (self.atan_norm * ratio) as u8;
        if code < 1 {
            INVALID_DEPTH
        } else {
            code
        }
    }
}

/// Jet colormap: dark blue, blue, cyan, yellow, red, dark red.
pub fn jet_color(code: u8) -> [u8; 3] {
    let i = code as i32;
    let clamp = |v: i32| v.clamp(0, 255) as u8;
    match i {
        0..=31 => [0, 0, clamp(131 + 4 * i)],
        32..=95 => [0, clamp(4 * (i - 32) + 3), 255],
        96..=159 => {
            let k = i - 96;
            [clamp(3 + 4 * k), 255, clamp(251 - 4 * k)]
        }
        160..=223 => {
            let k = i - 160;
            [255, clamp(251 - 4 * k), 0]
        }
        _ => {
            let k = i - 224;
            [clamp(251 - 4 * k), 0, 0]
        }
    }
}

/// CLOCK_MONOTONIC in milliseconds.
pub fn monotonic_ms() -> f64 {
    let mut ts = libc::timespec {
        tv_sec: 0,
        tv_nsec: 0,
    };
    // SAFETY: `ts` is a valid, writable timespec for the duration of the call.
    let rc = unsafe { libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts) };
    if rc != 0 {
        return 0.0;
    }
    ts.tv_sec as f64 * 1000.0 + ts.tv_nsec as f64 / 1_000_000.0
}
