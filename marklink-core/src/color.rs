use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use tracing::{debug, warn};

use crate::config::ColorConfig;
use crate::marks::{CssColor, Rgba};

const REF_X: f64 = 95.047;
const REF_Y: f64 = 100.0;
const REF_Z: f64 = 108.883;
const LAB_EPSILON: f64 = 0.008856;
const LAB_KAPPA: f64 = 7.787;
const GAMUT_TOLERANCE: f64 = 1e-6;
/// Probe points per axis when deciding whether a grid cell touches sRGB.
const GAMUT_PROBES: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Theme {
    Light,
    #[default]
    Dark,
}

impl Theme {
    pub fn from_dark_mode(is_dark: bool) -> Self {
        if is_dark {
            Theme::Dark
        } else {
            Theme::Light
        }
    }

    pub fn is_dark(&self) -> bool {
        matches!(self, Theme::Dark)
    }
}

/// A CIELAB coordinate (D65).
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lab {
    pub l: f64,
    pub a: f64,
    pub b: f64,
}

impl Lab {
    pub fn new(l: f64, a: f64, b: f64) -> Self {
        Self { l, a, b }
    }

    pub fn from_rgb(rgb: [u8; 3]) -> Self {
        let [x, y, z] = srgb_to_xyz(rgb);
        xyz_to_lab(x, y, z)
    }

    /// Nearest displayable sRGB triple; out-of-gamut channels are clamped.
    pub fn to_rgb(&self) -> [u8; 3] {
        self.to_linear_rgb().map(|c| {
            let encoded = if c > 0.0031308 {
                1.055 * c.powf(1.0 / 2.4) - 0.055
            } else {
                12.92 * c
            };
            (encoded.clamp(0.0, 1.0) * 255.0).round() as u8
        })
    }

    /// Whether the colour is displayable without clamping.
    pub fn in_gamut(&self) -> bool {
        self.to_linear_rgb()
            .iter()
            .all(|c| (-GAMUT_TOLERANCE..=1.0 + GAMUT_TOLERANCE).contains(c))
    }

    fn to_linear_rgb(self) -> [f64; 3] {
        let [x, y, z] = lab_to_xyz(self);
        let (x, y, z) = (x / 100.0, y / 100.0, z / 100.0);
        [
            x * 3.2406 + y * -1.5372 + z * -0.4986,
            x * -0.9689 + y * 1.8758 + z * 0.0415,
            x * 0.0557 + y * -0.2040 + z * 1.0570,
        ]
    }
}

fn srgb_to_xyz(rgb: [u8; 3]) -> [f64; 3] {
    let linear = rgb.map(|channel| {
        let c = f64::from(channel) / 255.0;
        if c > 0.04045 {
            ((c + 0.055) / 1.055).powf(2.4)
        } else {
            c / 12.92
        }
    });
    let [r, g, b] = linear;
    [
        (r * 0.4124 + g * 0.3576 + b * 0.1805) * 100.0,
        (r * 0.2126 + g * 0.7152 + b * 0.0722) * 100.0,
        (r * 0.0193 + g * 0.1192 + b * 0.9505) * 100.0,
    ]
}

fn xyz_to_lab(x: f64, y: f64, z: f64) -> Lab {
    let f = |t: f64| {
        if t > LAB_EPSILON {
            t.cbrt()
        } else {
            LAB_KAPPA * t + 16.0 / 116.0
        }
    };
    let fx = f(x / REF_X);
    let fy = f(y / REF_Y);
    let fz = f(z / REF_Z);
    Lab {
        l: 116.0 * fy - 16.0,
        a: 500.0 * (fx - fy),
        b: 200.0 * (fy - fz),
    }
}

fn lab_to_xyz(lab: Lab) -> [f64; 3] {
    let fy = (lab.l + 16.0) / 116.0;
    let fx = lab.a / 500.0 + fy;
    let fz = fy - lab.b / 200.0;
    let inverse = |t: f64| {
        let cubed = t.powi(3);
        if cubed > LAB_EPSILON {
            cubed
        } else {
            (t - 16.0 / 116.0) / LAB_KAPPA
        }
    };
    [inverse(fx) * REF_X, inverse(fy) * REF_Y, inverse(fz) * REF_Z]
}

/// CIE94 colour difference (graphic arts weights), `reference` first.
pub fn delta_e94(reference: Lab, sample: Lab) -> f64 {
    const K1: f64 = 0.045;
    const K2: f64 = 0.015;

    let dl = reference.l - sample.l;
    let da = reference.a - sample.a;
    let db = reference.b - sample.b;
    let c1 = reference.a.hypot(reference.b);
    let c2 = sample.a.hypot(sample.b);
    let dc = c1 - c2;
    let dh = (da * da + db * db - dc * dc).max(0.0).sqrt();
    let sc = 1.0 + K1 * c1;
    let sh = 1.0 + K2 * c1;
    (dl.powi(2) + (dc / sc).powi(2) + (dh / sh).powi(2)).sqrt()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GridCell {
    pub l: usize,
    pub a: usize,
    pub b: usize,
}

impl GridCell {
    /// Cell of `lab` on an `n`-per-axis grid over L∈[0,100], a,b∈[-128,128).
    pub fn containing(lab: Lab, n: usize) -> Self {
        let max = n.saturating_sub(1) as f64;
        let n = n as f64;
        let index = |value: f64| value.floor().clamp(0.0, max) as usize;
        Self {
            l: index(lab.l / 100.0 * n),
            a: index((lab.a + 128.0) / 256.0 * n),
            b: index((lab.b + 128.0) / 256.0 * n),
        }
    }

    /// The point at fractional offsets `t` (each in `[0, 1]`) inside the cell.
    fn point(&self, n: usize, t: [f64; 3]) -> Lab {
        let n = n as f64;
        Lab::new(
            (self.l as f64 + t[0]) * 100.0 / n,
            (self.a as f64 + t[1]) * 256.0 / n - 128.0,
            (self.b as f64 + t[2]) * 256.0 / n - 128.0,
        )
    }

    fn touches_gamut(&self, n: usize) -> bool {
        let step = 1.0 / (GAMUT_PROBES - 1) as f64;
        (0..GAMUT_PROBES.pow(3)).any(|probe| {
            let t = [
                (probe / (GAMUT_PROBES * GAMUT_PROBES)) as f64 * step,
                ((probe / GAMUT_PROBES) % GAMUT_PROBES) as f64 * step,
                (probe % GAMUT_PROBES) as f64 * step,
            ];
            self.point(n, t).in_gamut()
        })
    }
}

/// A colour handed out by the registry: the displayed sRGB triple and its
/// perceptual coordinate.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AllocatedColor {
    pub lab: Lab,
    pub rgb: [u8; 3],
}

impl AllocatedColor {
    pub fn css(&self, theme: Theme, config: &ColorConfig) -> CssColor {
        CssColor::from_rgba(Rgba {
            r: self.rgb[0],
            g: self.rgb[1],
            b: self.rgb[2],
            alpha: config.alpha_for(theme),
        })
    }
}

/// Occupancy grid plus history of every emitted perceptual coordinate.
///
/// Each allocation walks the displayable cells from least to most occupied.
/// Inside a cell it draws up to `max_attempts` samples, dropping those outside
/// sRGB and those within `min_delta_e` of an earlier colour. Only when every
/// cell is exhausted is the most distant candidate accepted.
pub struct ColorRegistry {
    config: ColorConfig,
    occupancy: Vec<u32>,
    /// Indices of cells that intersect the sRGB gamut.
    displayable: Vec<usize>,
    used: Vec<Lab>,
    fallbacks: usize,
    rng: StdRng,
}

impl ColorRegistry {
    pub fn new(config: ColorConfig) -> Self {
        let rng = match config.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let grid_size = config.grid_size.max(1);
        let displayable = (0..grid_size.pow(3))
            .filter(|index| cell_at(*index, grid_size).touches_gamut(grid_size))
            .collect();
        Self {
            occupancy: vec![0; grid_size.pow(3)],
            displayable,
            used: Vec::new(),
            fallbacks: 0,
            rng,
            config: ColorConfig {
                grid_size,
                ..config
            },
        }
    }

    pub fn config(&self) -> &ColorConfig {
        &self.config
    }

    pub fn allocate(&mut self, key: &str, theme: Theme) -> CssColor {
        let color = self.allocate_color();
        let css = color.css(theme, &self.config);
        debug!(key, color = %css, "allocated highlight color");
        css
    }

    pub fn allocate_color(&mut self) -> AllocatedColor {
        let attempts = self.config.max_attempts.max(1);
        let mut best: Option<(GridCell, AllocatedColor, f64)> = None;

        for cell in self.cells_by_occupancy() {
            for _ in 0..attempts {
                let Some(candidate) = self.sample_in_cell(cell) else {
                    continue;
                };
                let distance = self.min_distance(candidate.lab);
                if distance >= self.config.min_delta_e {
                    self.record(cell, candidate);
                    return candidate;
                }
                if best.map_or(true, |(_, _, best_distance)| distance > best_distance) {
                    best = Some((cell, candidate, distance));
                }
            }
        }

        let (cell, candidate, distance) = match best {
            Some(best) => best,
            None => {
                // nothing displayable was drawn; fall back to mid grey
                let lab = Lab::new(50.0, 0.0, 0.0);
                let rgb = lab.to_rgb();
                let candidate = AllocatedColor {
                    lab: Lab::from_rgb(rgb),
                    rgb,
                };
                let cell = GridCell::containing(candidate.lab, self.config.grid_size);
                (cell, candidate, self.min_distance(candidate.lab))
            }
        };
        warn!(
            distance,
            threshold = self.config.min_delta_e,
            "no collision-free color found, accepting closest candidate"
        );
        self.fallbacks += 1;
        self.record(cell, candidate);
        candidate
    }

    /// Registers a colour that is already on screen, e.g. from a restored
    /// document, so later allocations keep their distance from it. Returns
    /// false when the colour was known.
    pub fn adopt(&mut self, rgb: [u8; 3]) -> bool {
        let lab = Lab::from_rgb(rgb);
        if self.used.contains(&lab) {
            return false;
        }
        let cell = GridCell::containing(lab, self.config.grid_size);
        self.record(cell, AllocatedColor { lab, rgb });
        true
    }

    pub fn clear(&mut self) {
        self.occupancy.iter_mut().for_each(|count| *count = 0);
        self.used.clear();
        self.fallbacks = 0;
        debug!("color registry cleared");
    }

    pub fn occupancy(&self, cell: GridCell) -> u32 {
        self.occupancy
            .get(self.cell_index(cell))
            .copied()
            .unwrap_or_default()
    }

    pub fn used_coordinates(&self) -> &[Lab] {
        &self.used
    }

    pub fn allocations(&self) -> usize {
        self.used.len()
    }

    /// Allocations that settled for the most distant candidate.
    pub fn fallbacks(&self) -> usize {
        self.fallbacks
    }

    fn cell_index(&self, cell: GridCell) -> usize {
        let n = self.config.grid_size;
        cell.l * n * n + cell.a * n + cell.b
    }

    /// Displayable cells, least occupied first; ties in random order.
    fn cells_by_occupancy(&mut self) -> Vec<GridCell> {
        let mut order = self.displayable.clone();
        order.shuffle(&mut self.rng);
        order.sort_by_key(|index| self.occupancy[*index]);
        let n = self.config.grid_size;
        order.into_iter().map(|index| cell_at(index, n)).collect()
    }

    /// A uniform sample inside `cell`, or `None` when it falls outside sRGB.
    fn sample_in_cell(&mut self, cell: GridCell) -> Option<AllocatedColor> {
        let t = [self.rng.gen(), self.rng.gen(), self.rng.gen()];
        let lab = cell.point(self.config.grid_size, t);
        if !lab.in_gamut() {
            return None;
        }
        let rgb = lab.to_rgb();
        Some(AllocatedColor {
            lab: Lab::from_rgb(rgb),
            rgb,
        })
    }

    fn min_distance(&self, lab: Lab) -> f64 {
        self.used
            .iter()
            .map(|existing| delta_e94(*existing, lab))
            .fold(f64::INFINITY, f64::min)
    }

    fn record(&mut self, cell: GridCell, color: AllocatedColor) {
        let index = self.cell_index(cell);
        if let Some(count) = self.occupancy.get_mut(index) {
            *count += 1;
        }
        self.used.push(color.lab);
    }
}

fn cell_at(index: usize, n: usize) -> GridCell {
    GridCell {
        l: index / (n * n),
        a: (index / n) % n,
        b: index % n,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn seeded(seed: u64) -> ColorConfig {
        ColorConfig {
            seed: Some(seed),
            ..ColorConfig::default()
        }
    }

    #[test]
    fn lab_conversion_hits_reference_points() {
        let white = Lab::from_rgb([255, 255, 255]);
        assert!((white.l - 100.0).abs() < 0.1);
        assert!(white.a.abs() < 0.5 && white.b.abs() < 0.5);
        let black = Lab::from_rgb([0, 0, 0]);
        assert!(black.l.abs() < 0.1);
        assert_eq!(Lab::new(100.0, 0.0, 0.0).to_rgb(), [255, 255, 255]);
    }

    #[test]
    fn rgb_round_trips_through_lab() {
        for rgb in [[200, 30, 90], [60, 120, 200], [128, 128, 128]] {
            assert_eq!(Lab::from_rgb(rgb).to_rgb(), rgb);
        }
    }

    #[test]
    fn delta_e94_is_zero_for_identical_colors() {
        let lab = Lab::new(50.0, 20.0, -30.0);
        assert_eq!(delta_e94(lab, lab), 0.0);
        assert!(delta_e94(lab, Lab::new(55.0, 20.0, -30.0)) > 4.9);
    }

    #[test]
    fn grid_cell_maps_extremes_into_range() {
        let cell = GridCell::containing(Lab::new(100.0, 127.9, -128.0), 10);
        assert_eq!(cell, GridCell { l: 9, a: 9, b: 0 });
    }

    #[test]
    fn allocations_fill_least_occupied_cells_first() {
        let mut registry = ColorRegistry::new(ColorConfig {
            grid_size: 2,
            min_delta_e: 0.0,
            max_attempts: 500,
            ..seeded(7)
        });
        assert_eq!(registry.displayable.len(), 8);
        for _ in 0..8 {
            registry.allocate_color();
        }
        for l in 0..2 {
            for a in 0..2 {
                for b in 0..2 {
                    assert_eq!(registry.occupancy(GridCell { l, a, b }), 1);
                }
            }
        }
        registry.allocate_color();
        assert_eq!(registry.occupancy.iter().sum::<u32>(), 9);
        assert_eq!(registry.occupancy.iter().copied().max(), Some(2));
    }

    #[test]
    fn distinct_keys_get_perceptually_distinct_colors() {
        for seed in [1, 2, 3, 42] {
            let mut registry = ColorRegistry::new(seeded(seed));
            let threshold = registry.config().min_delta_e;
            for index in 0..100 {
                registry.allocate(&format!("term-{index}"), Theme::Dark);
            }
            assert_eq!(registry.allocations(), 100);
            assert_eq!(registry.fallbacks(), 0, "seed {seed}");
            let used = registry.used_coordinates();
            for (i, earlier) in used.iter().enumerate() {
                for later in &used[i + 1..] {
                    let distance = delta_e94(*earlier, *later);
                    assert!(distance >= threshold, "seed {seed}: {distance}");
                }
            }
        }
    }

    #[test]
    fn out_of_gamut_cells_are_never_sampled() {
        let registry = ColorRegistry::new(seeded(5));
        let n = registry.config().grid_size;
        // saturated green at L=5 cannot be displayed
        let dark_green = GridCell::containing(Lab::new(5.0, -120.0, 120.0), n);
        let index = registry.cell_index(dark_green);
        assert!(!registry.displayable.contains(&index));
        assert!(registry.displayable.len() < n.pow(3));
        assert!(!Lab::new(5.0, -120.0, 120.0).in_gamut());
        assert!(Lab::new(50.0, 0.0, 0.0).in_gamut());
    }

    #[test]
    fn adopted_colors_are_avoided_and_counted_once() {
        let mut registry = ColorRegistry::new(seeded(11));
        assert!(registry.adopt([200, 30, 90]));
        assert!(!registry.adopt([200, 30, 90]));
        assert_eq!(registry.allocations(), 1);
        let adopted = registry.used_coordinates()[0];
        let fresh = registry.allocate_color();
        assert!(delta_e94(adopted, fresh.lab) >= registry.config().min_delta_e);
    }

    #[test]
    fn exhausted_retries_still_return_a_color() {
        let mut registry = ColorRegistry::new(ColorConfig {
            min_delta_e: 10_000.0,
            max_attempts: 3,
            ..seeded(1)
        });
        registry.allocate_color();
        let second = registry.allocate("second", Theme::Light);
        assert!(second.to_rgba().is_some());
        assert_eq!(registry.allocations(), 2);
        assert_eq!(registry.fallbacks(), 1);
    }

    #[test]
    fn theme_controls_translucency() {
        let mut registry = ColorRegistry::new(seeded(3));
        let color = registry.allocate_color();
        let config = ColorConfig::default();
        let dark = color.css(Theme::Dark, &config).to_rgba().unwrap();
        let light = color.css(Theme::Light, &config).to_rgba().unwrap();
        assert!((dark.alpha - 0.4).abs() < f32::EPSILON);
        assert!((light.alpha - 0.35).abs() < f32::EPSILON);
        assert_eq!((dark.r, dark.g, dark.b), (light.r, light.g, light.b));
    }

    #[test]
    fn clear_returns_the_full_gamut() {
        let mut registry = ColorRegistry::new(seeded(9));
        for _ in 0..5 {
            registry.allocate_color();
        }
        registry.clear();
        assert_eq!(registry.allocations(), 0);
        assert!(registry.occupancy.iter().all(|count| *count == 0));
    }
}
