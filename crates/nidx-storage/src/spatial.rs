//! Space-filling curve used to order spatial keys.

use nidx_common::{Crs, CurveSettings, Point};

/// Maps points to a single ordered scalar and back.
///
/// Points close in space should map to nearby scalars, and every point
/// inside an axis-aligned box must map between the scalars of the box's
/// lower and upper corners.
pub trait SpaceFillingCurve: Send + Sync {
    /// Derives the curve value of a point.
    fn derive(&self, point: &Point) -> u64;

    /// Returns the center of the cell addressed by `value`.
    fn center_of(&self, crs: Crs, value: u64) -> Point;
}

/// Z-order (Morton) curve over a fixed extent per coordinate system.
#[derive(Debug, Clone)]
pub struct ZOrderCurve {
    settings: CurveSettings,
}

impl Default for ZOrderCurve {
    fn default() -> Self {
        Self::new(CurveSettings::default())
    }
}

impl ZOrderCurve {
    /// Creates a curve with the given settings.
    pub fn new(settings: CurveSettings) -> Self {
        Self { settings }
    }

    fn bits_per_dimension(&self, crs: Crs) -> u32 {
        (self.settings.max_bits / crs.dimension() as u32).clamp(1, 63 / crs.dimension() as u32)
    }

    /// Lower and upper bound of each axis.
    fn extent(&self, crs: Crs, axis: usize) -> (f64, f64) {
        let e = self.settings.cartesian_extent;
        match (crs.is_geographic(), axis) {
            (true, 0) => (-180.0, 180.0),
            (true, 1) => (-90.0, 90.0),
            _ => (-e, e),
        }
    }

    fn cells(&self, crs: Crs) -> u64 {
        1u64 << self.bits_per_dimension(crs)
    }

    /// Maps a coordinate to its cell index on one axis, clamping to the extent.
    fn cell_of(&self, crs: Crs, axis: usize, coordinate: f64) -> u64 {
        let (min, max) = self.extent(crs, axis);
        let cells = self.cells(crs);
        if coordinate.is_nan() || coordinate <= min {
            return 0;
        }
        if coordinate >= max {
            return cells - 1;
        }
        let normalized = (coordinate - min) / (max - min);
        ((normalized * cells as f64) as u64).min(cells - 1)
    }
}

impl SpaceFillingCurve for ZOrderCurve {
    fn derive(&self, point: &Point) -> u64 {
        let crs = point.crs();
        let bits = self.bits_per_dimension(crs);
        let dims = crs.dimension();
        let cells: Vec<u64> = point
            .coordinates()
            .iter()
            .enumerate()
            .map(|(axis, c)| self.cell_of(crs, axis, *c))
            .collect();

        let mut value = 0u64;
        for bit in (0..bits).rev() {
            for cell in &cells {
                value = (value << 1) | ((cell >> bit) & 1);
            }
        }
        debug_assert!(bits as usize * dims <= 64);
        value
    }

    fn center_of(&self, crs: Crs, value: u64) -> Point {
        let bits = self.bits_per_dimension(crs);
        let dims = crs.dimension();
        let mut cells = vec![0u64; dims];
        let total = bits as usize * dims;
        for i in 0..total {
            let bit = (value >> (total - 1 - i)) & 1;
            let axis = i % dims;
            cells[axis] = (cells[axis] << 1) | bit;
        }

        let coords: Vec<f64> = cells
            .iter()
            .enumerate()
            .map(|(axis, cell)| {
                let (min, max) = self.extent(crs, axis);
                let width = (max - min) / self.cells(crs) as f64;
                min + (*cell as f64 + 0.5) * width
            })
            .collect();
        Point::new(crs, &coords).unwrap_or_else(|_| Point::cartesian(coords[0], coords[1]))
    }
}
