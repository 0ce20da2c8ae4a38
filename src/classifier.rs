use image::imageops::{self, FilterType};
use image::GrayImage;

use crate::calibration::Roi;
use crate::reference::{ReferenceSet, TapState};

/// 5-tap binomial kernel, the fixed kernel of a 5x5 Gaussian with automatic sigma.
const BLUR_KERNEL: [u32; 5] = [1, 4, 6, 4, 1];
const BLUR_RADIUS: u32 = 2;

/// Smooths a grayscale frame with a separable 5x5 Gaussian.
///
/// Borders are mirrored without repeating the edge pixel (`dcb|abcd|cba`).
pub fn gaussian_blur_5x5(img: &GrayImage) -> GrayImage {
    let (width, height) = img.dimensions();
    if width == 0 || height == 0 {
        return img.clone();
    }
    let (w, h) = (width as usize, height as usize);
    let src = img.as_raw();

    // horizontal pass, sums stay below 16 * 255
    let mut horizontal = vec![0u16; w * h];
    for y in 0..h {
        let row = &src[y * w..(y + 1) * w];
        for x in 0..w {
            let mut acc = 0u32;
            for (k, weight) in BLUR_KERNEL.iter().enumerate() {
                let sx = reflect_101(x as i64 + k as i64 - 2, w as i64);
                acc += row[sx] as u32 * weight;
            }
            horizontal[y * w + x] = acc as u16;
        }
    }

    let mut out = GrayImage::new(width, height);
    let dst: &mut [u8] = &mut out;
    for y in 0..h {
        for x in 0..w {
            let mut acc = 0u32;
            for (k, weight) in BLUR_KERNEL.iter().enumerate() {
                let sy = reflect_101(y as i64 + k as i64 - 2, h as i64);
                acc += horizontal[sy * w + x] as u32 * weight;
            }
            dst[y * w + x] = ((acc + 128) >> 8) as u8;
        }
    }
    out
}

fn reflect_101(mut i: i64, n: i64) -> usize {
    if n == 1 {
        return 0;
    }
    while i < 0 || i >= n {
        if i < 0 {
            i = -i;
        }
        if i >= n {
            i = 2 * (n - 1) - i;
        }
    }
    i as usize
}

/// Mean absolute difference between two equally sized images.
pub fn mean_abs_diff(a: &GrayImage, b: &GrayImage) -> f64 {
    debug_assert_eq!(a.dimensions(), b.dimensions());
    let pixels = a.as_raw().len();
    if pixels == 0 {
        return 0.0;
    }
    let sum: u64 = a
        .as_raw()
        .iter()
        .zip(b.as_raw().iter())
        .map(|(&p, &q)| (p as i32 - q as i32).unsigned_abs() as u64)
        .sum();
    sum as f64 / pixels as f64
}

/// Best-matching state for a crop, with its score.
///
/// References are resized to the crop, never the other way round; a
/// reference that cannot be resized (zero area) is skipped. Scores are
/// compared with strict `<`, so on an exact tie the state evaluated first
/// wins. Returns `None` when no reference could be compared.
pub fn best_match(crop: &GrayImage, references: &ReferenceSet) -> Option<(TapState, f64)> {
    let (crop_w, crop_h) = crop.dimensions();
    if crop_w == 0 || crop_h == 0 {
        return None;
    }
    let mut best: Option<(TapState, f64)> = None;

    for (state, reference) in references.iter() {
        let score = if reference.dimensions() == (crop_w, crop_h) {
            mean_abs_diff(crop, reference)
        } else {
            if reference.width() == 0 || reference.height() == 0 {
                continue;
            }
            let resized = imageops::resize(reference, crop_w, crop_h, FilterType::Triangle);
            mean_abs_diff(crop, &resized)
        };

        match best {
            Some((_, best_score)) if score >= best_score => {}
            _ => best = Some((state, score)),
        }
    }

    best
}

/// The `roi` crop of `gaussian_blur_5x5(frame)`, computed by blurring only
/// the region plus a margin of the kernel radius.
///
/// `None` when the region leaves the frame or has no area.
pub fn blurred_crop(frame: &GrayImage, roi: &Roi) -> Option<GrayImage> {
    if !roi.fits_within(frame.width(), frame.height()) || roi.width == 0 || roi.height == 0 {
        return None;
    }
    let (x, y, w, h) = (roi.x as u32, roi.y as u32, roi.width as u32, roi.height as u32);

    // margin pixels see mirrored borders and are discarded; at the frame
    // edge the region border is the frame border, so the mirror matches
    let x0 = x.saturating_sub(BLUR_RADIUS);
    let y0 = y.saturating_sub(BLUR_RADIUS);
    let x1 = (x + w + BLUR_RADIUS).min(frame.width());
    let y1 = (y + h + BLUR_RADIUS).min(frame.height());

    let region = imageops::crop_imm(frame, x0, y0, x1 - x0, y1 - y0).to_image();
    let blurred = gaussian_blur_5x5(&region);
    Some(imageops::crop_imm(&blurred, x - x0, y - y0, w, h).to_image())
}

/// Classifies the region `roi` of a grayscale frame, blurring it first.
///
/// Regions that leave the frame or have no area classify as `Closed`.
pub fn classify(frame: &GrayImage, roi: &Roi, references: &ReferenceSet) -> TapState {
    blurred_crop(frame, roi)
        .and_then(|crop| best_match(&crop, references))
        .map(|(state, _)| state)
        .unwrap_or(TapState::Closed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Luma};

    fn flat(w: u32, h: u32, v: u8) -> GrayImage {
        ImageBuffer::from_pixel(w, h, Luma([v]))
    }

    fn gradient(w: u32, h: u32) -> GrayImage {
        ImageBuffer::from_fn(w, h, |x, y| Luma([(x * 7 + y * 3) as u8]))
    }

    fn refs() -> ReferenceSet {
        ReferenceSet::new(flat(6, 4, 20), flat(6, 4, 200), gradient(6, 4))
    }

    #[test]
    fn test_exact_template_scores_zero() {
        let references = refs();
        for (state, template) in references.iter() {
            let (best, score) = best_match(template, &references).unwrap();
            assert_eq!(best, state);
            assert_eq!(score, 0.0);
        }
    }

    #[test]
    fn test_classify_crop_inside_frame() {
        let mut frame = flat(20, 10, 0);
        imageops::replace(&mut frame, &flat(6, 4, 200), 5, 3);
        let roi = Roi::new(5, 3, 6, 4);
        assert_eq!(classify(&frame, &roi, &refs()), TapState::Pouring);
    }

    #[test]
    fn test_out_of_frame_roi_is_closed() {
        assert!(blurred_crop(&flat(20, 10, 1), &Roi::new(15, 7, 6, 4)).is_none());
        let frame = flat(20, 10, 200);
        let references = refs();
        assert_eq!(classify(&frame, &Roi::new(16, 0, 6, 4), &references), TapState::Closed);
        assert_eq!(classify(&frame, &Roi::new(-1, 0, 6, 4), &references), TapState::Closed);
        assert_eq!(classify(&frame, &Roi::new(0, 0, 0, 4), &references), TapState::Closed);
    }

    #[test]
    fn test_tie_goes_to_first_state() {
        // closed and pouring templates are identical
        let references = ReferenceSet::new(flat(4, 4, 50), flat(4, 4, 50), flat(4, 4, 250));
        let (state, _) = best_match(&flat(4, 4, 60), &references).unwrap();
        assert_eq!(state, TapState::Closed);

        let references = ReferenceSet::new(flat(4, 4, 250), flat(4, 4, 50), flat(4, 4, 50));
        let (state, _) = best_match(&flat(4, 4, 60), &references).unwrap();
        assert_eq!(state, TapState::Pouring);
    }

    #[test]
    fn test_reference_is_resized_to_crop() {
        let references = ReferenceSet::new(flat(60, 40, 20), flat(3, 2, 200), flat(12, 8, 120));
        let (state, score) = best_match(&flat(6, 4, 200), &references).unwrap();
        assert_eq!(state, TapState::Pouring);
        assert_eq!(score, 0.0);
    }

    #[test]
    fn test_empty_reference_is_skipped() {
        let references = ReferenceSet::new(GrayImage::new(0, 0), flat(6, 4, 90), GrayImage::new(0, 0));
        let (state, _) = best_match(&flat(6, 4, 10), &references).unwrap();
        assert_eq!(state, TapState::Pouring);

        let none = ReferenceSet::new(GrayImage::new(0, 0), GrayImage::new(0, 0), GrayImage::new(0, 0));
        assert!(best_match(&flat(6, 4, 10), &none).is_none());
        let frame = flat(10, 10, 10);
        assert_eq!(classify(&frame, &Roi::new(0, 0, 6, 4), &none), TapState::Closed);
    }

    #[test]
    fn test_score_is_monotonic_in_divergence() {
        let template = gradient(6, 4);
        let mut crop = template.clone();
        let mut last = mean_abs_diff(&crop, &template);
        for step in 1..=20u8 {
            let base = template.get_pixel(2, 1)[0];
            crop.put_pixel(2, 1, Luma([base.saturating_add(step * 5)]));
            let score = mean_abs_diff(&crop, &template);
            assert!(score >= last, "score dropped at step {}", step);
            last = score;
        }
        assert!(last > 0.0);
    }

    #[test]
    fn test_blur_keeps_flat_images() {
        let img = flat(9, 7, 77);
        assert_eq!(gaussian_blur_5x5(&img), img);
        let tiny = flat(1, 1, 5);
        assert_eq!(gaussian_blur_5x5(&tiny), tiny);
    }

    #[test]
    fn test_blur_spreads_a_point() {
        let mut img = flat(9, 9, 0);
        img.put_pixel(4, 4, Luma([255]));
        let blurred = gaussian_blur_5x5(&img);
        // centre weight is 36/256
        assert_eq!(blurred.get_pixel(4, 4)[0], ((255 * 36 + 128) >> 8) as u8);
        assert_eq!(blurred.get_pixel(0, 0)[0], 0);
        assert!(blurred.get_pixel(3, 4)[0] > blurred.get_pixel(2, 4)[0]);
    }

    #[test]
    fn test_blurred_crop_matches_full_frame_blur() {
        let frame: GrayImage = ImageBuffer::from_fn(23, 17, |x, y| {
            Luma([((x * 37 + y * 91 + x * y * 13) % 251) as u8])
        });
        let full = gaussian_blur_5x5(&frame);

        for roi in [
            Roi::new(5, 4, 7, 6),
            Roi::new(0, 0, 4, 3),
            Roi::new(1, 1, 3, 3),
            Roi::new(19, 13, 4, 4),
            Roi::new(0, 0, 23, 17),
            Roi::new(22, 0, 1, 17),
        ] {
            let expected = imageops::crop_imm(
                &full,
                roi.x as u32,
                roi.y as u32,
                roi.width as u32,
                roi.height as u32,
            )
            .to_image();
            assert_eq!(blurred_crop(&frame, &roi).unwrap(), expected, "{:?}", roi);
        }
    }

    #[test]
    fn test_reflect_101() {
        assert_eq!(reflect_101(-1, 5), 1);
        assert_eq!(reflect_101(-2, 5), 2);
        assert_eq!(reflect_101(5, 5), 3);
        assert_eq!(reflect_101(6, 5), 2);
        assert_eq!(reflect_101(-2, 2), 0);
    }
}
