#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Resolution {
    pub width: u32,
    pub height: u32,
}

impl Resolution {
    pub const fn new(width: u32, height: u32) -> Self {
        Self { width, height }
    }

    pub fn aspect_ratio(self) -> f64 {
        self.width as f64 / self.height as f64
    }

    pub fn transposed(self) -> Self {
        Self {
            width: self.height,
            height: self.width,
        }
    }

    /// Size of the latent grid the diffusion model works on (one cell per 8x8 pixels).
    pub fn latent_size(self) -> (usize, usize) {
        ((self.width / LATENT_DOWNSCALE) as usize, (self.height / LATENT_DOWNSCALE) as usize)
    }
}

pub const LATENT_DOWNSCALE: u32 = 8;

/// Output sizes SDXL renders cleanly, ordered from tallest to widest.
pub const ALLOWED_RESOLUTIONS: [Resolution; 40] = [
    Resolution::new(512, 2048),
    Resolution::new(512, 1984),
    Resolution::new(512, 1920),
    Resolution::new(512, 1856),
    Resolution::new(576, 1792),
    Resolution::new(576, 1728),
    Resolution::new(576, 1664),
    Resolution::new(640, 1600),
    Resolution::new(640, 1536),
    Resolution::new(704, 1472),
    Resolution::new(704, 1408),
    Resolution::new(704, 1344),
    Resolution::new(768, 1344),
    Resolution::new(768, 1280),
    Resolution::new(832, 1216),
    Resolution::new(832, 1152),
    Resolution::new(896, 1152),
    Resolution::new(896, 1088),
    Resolution::new(960, 1088),
    Resolution::new(960, 1024),
    Resolution::new(1024, 1024),
    Resolution::new(1024, 960),
    Resolution::new(1088, 960),
    Resolution::new(1088, 896),
    Resolution::new(1152, 896),
    Resolution::new(1152, 832),
    Resolution::new(1216, 832),
    Resolution::new(1280, 768),
    Resolution::new(1344, 768),
    Resolution::new(1408, 704),
    Resolution::new(1472, 704),
    Resolution::new(1536, 640),
    Resolution::new(1600, 640),
    Resolution::new(1664, 576),
    Resolution::new(1728, 576),
    Resolution::new(1792, 576),
    Resolution::new(1856, 512),
    Resolution::new(1920, 512),
    Resolution::new(1984, 512),
    Resolution::new(2048, 512),
];

/// Snap an arbitrary image size to the allowed resolution with the closest aspect ratio.
///
/// Both `width` and `height` must be positive; callers validate this before snapping.
/// When two entries are equally close the earlier one in [`ALLOWED_RESOLUTIONS`] wins.
pub fn resolve_resolution(width: u32, height: u32) -> Resolution {
    debug_assert!(width > 0 && height > 0, "resolution snapping needs positive dimensions");
    let requested = width as f64 / height as f64;

    let mut best = ALLOWED_RESOLUTIONS[0];
    let mut best_diff = (best.aspect_ratio() - requested).abs();
    for candidate in ALLOWED_RESOLUTIONS.iter().skip(1) {
        let diff = (candidate.aspect_ratio() - requested).abs();
        if diff < best_diff {
            best = *candidate;
            best_diff = diff;
        }
    }
    best
}

pub fn is_allowed(resolution: Resolution) -> bool {
    ALLOWED_RESOLUTIONS.contains(&resolution)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn catalog_is_closed_under_transposition() {
        for entry in ALLOWED_RESOLUTIONS {
            assert!(is_allowed(entry.transposed()), "missing transpose of {:?}", entry);
        }
    }

    #[test]
    fn catalog_sides_are_latent_aligned() {
        for entry in ALLOWED_RESOLUTIONS {
            assert_eq!(entry.width % 64, 0);
            assert_eq!(entry.height % 64, 0);
        }
    }

    #[test]
    fn square_input_maps_to_square_output() {
        assert_eq!(resolve_resolution(1024, 1024), Resolution::new(1024, 1024));
        assert_eq!(resolve_resolution(300, 300), Resolution::new(1024, 1024));
    }

    #[test]
    fn extremes_map_to_themselves() {
        assert_eq!(resolve_resolution(2048, 512), Resolution::new(2048, 512));
        assert_eq!(resolve_resolution(512, 2048), Resolution::new(512, 2048));
    }

    #[test]
    fn ratios_beyond_the_catalog_clamp_to_extremes() {
        assert_eq!(resolve_resolution(10_000, 10), Resolution::new(2048, 512));
        assert_eq!(resolve_resolution(10, 10_000), Resolution::new(512, 2048));
    }

    #[test]
    fn common_photo_sizes() {
        assert_eq!(resolve_resolution(1920, 1080), Resolution::new(1344, 768));
        assert_eq!(resolve_resolution(1080, 1920), Resolution::new(768, 1344));
        assert_eq!(resolve_resolution(640, 480), Resolution::new(1152, 896));
    }

    #[test]
    fn catalog_entries_and_transposes_resolve_exactly() {
        for entry in ALLOWED_RESOLUTIONS {
            assert_eq!(resolve_resolution(entry.width, entry.height), entry);
            assert_eq!(resolve_resolution(entry.height, entry.width), entry.transposed());
        }
    }

    #[test]
    fn catalog_is_ordered_by_increasing_ratio() {
        for pair in ALLOWED_RESOLUTIONS.windows(2) {
            assert!(pair[0].aspect_ratio() < pair[1].aspect_ratio());
        }
    }

    #[test]
    fn result_depends_only_on_ratio() {
        for (w, h) in [(3u32, 2u32), (7, 5), (1, 3), (16, 9), (5, 4)] {
            let base = resolve_resolution(w, h);
            for k in [2u32, 10, 64, 333] {
                assert_eq!(resolve_resolution(w * k, h * k), base);
            }
        }
    }

    #[test]
    fn every_result_is_in_catalog() {
        for w in (1..=4096).step_by(97) {
            for h in (1..=4096).step_by(89) {
                assert!(is_allowed(resolve_resolution(w, h)));
            }
        }
    }

    #[test]
    fn latent_size_divides_by_eight() {
        assert_eq!(Resolution::new(1344, 768).latent_size(), (168, 96));
    }
}
