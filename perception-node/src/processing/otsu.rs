use ndarray::ArrayView2;

/// Pixels at this value carry no information (zero noise) and are left out
/// of the histogram.
const SATURATED: u8 = u8::MAX;

/// Otsu binarization threshold over `image`; pixels strictly above it are
/// foreground.
///
/// When several thresholds reach the maximum between-class variance, the
/// midpoint of that plateau is returned. An image with no unsaturated
/// pixels yields 0; an image with a single level `v` yields `v - 1` so
/// every pixel stays foreground.
pub fn otsu_threshold(image: ArrayView2<'_, u8>) -> u8 {
    let mut histogram = [0u64; 256];
    for &value in image.iter() {
        if value != SATURATED {
            histogram[value as usize] += 1;
        }
    }

    let total: u64 = histogram.iter().sum();
    if total == 0 {
        return 0;
    }

    let levels: Vec<usize> = (0..256).filter(|&v| histogram[v] > 0).collect();
    if levels.len() == 1 {
        return (levels[0] as u8).saturating_sub(1);
    }

    let total = total as f64;
    let sum_all: f64 = histogram
        .iter()
        .enumerate()
        .map(|(v, &n)| v as f64 * n as f64)
        .sum();

    let mut best = -1.0f64;
    let mut first_best = 0usize;
    let mut last_best = 0usize;
    let mut weight_bg = 0.0f64;
    let mut sum_bg = 0.0f64;

    for t in 0..255usize {
        weight_bg += histogram[t] as f64;
        sum_bg += t as f64 * histogram[t] as f64;
        let weight_fg = total - weight_bg;
        if weight_bg == 0.0 || weight_fg == 0.0 {
            continue;
        }

        let mean_bg = sum_bg / weight_bg;
        let mean_fg = (sum_all - sum_bg) / weight_fg;
        let variance = weight_bg * weight_fg * (mean_bg - mean_fg).powi(2);

        let tolerance = best.abs() * 1e-12;
        if variance > best + tolerance {
            best = variance;
            first_best = t;
            last_best = t;
        } else if (variance - best).abs() <= tolerance {
            last_best = t;
        }
    }

    ((first_best + last_best) / 2) as u8
}

#[cfg(test)]
mod tests {
    use super::*;
    use ndarray::Array2;

    #[test]
    fn test_two_clusters_split_between() {
        let mut image = Array2::<u8>::from_elem((10, 10), 10);
        image.slice_mut(ndarray::s![2..5, 2..5]).fill(200);

        let threshold = otsu_threshold(image.view());
        assert!(threshold > 10 && threshold < 200, "threshold {}", threshold);
        assert_eq!(threshold, 104);
    }

    #[test]
    fn test_saturated_pixels_are_ignored() {
        let mut image = Array2::<u8>::from_elem((4, 4), 20);
        image.slice_mut(ndarray::s![0..2, ..]).fill(60);
        image[[3, 3]] = 255;
        let threshold = otsu_threshold(image.view());
        assert!(threshold >= 20 && threshold < 60);
    }

    #[test]
    fn test_degenerate_images() {
        assert_eq!(otsu_threshold(Array2::<u8>::from_elem((3, 3), 255).view()), 0);
        assert_eq!(otsu_threshold(Array2::<u8>::from_elem((3, 3), 90).view()), 89);
        assert_eq!(otsu_threshold(Array2::<u8>::zeros((0, 0)).view()), 0);
    }

    #[test]
    fn test_three_levels_prefers_larger_gap() {
        let mut image = Array2::<u8>::from_elem((10, 10), 0);
        image.slice_mut(ndarray::s![0..5, ..]).fill(10);
        image.slice_mut(ndarray::s![9..10, ..]).fill(250);
        let threshold = otsu_threshold(image.view());
        assert!(threshold >= 10 && threshold < 250);
    }
}
