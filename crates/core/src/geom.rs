#![forbid(unsafe_code)]

//! Geometry primitives in project (world) units: points, axis-aligned boxes,
//! and the grid-cell math used by the node-cache invalidation sweep.

#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Point3 {
    pub x: f64,
    pub y: f64,
    pub z: f64,
}

impl Point3 {
    pub fn new(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z }
    }

    pub fn distance(self, other: Point3) -> f64 {
        let dx = self.x - other.x;
        let dy = self.y - other.y;
        let dz = self.z - other.z;
        (dx * dx + dy * dy + dz * dz).sqrt()
    }
}

/// Axis-aligned bounding box. `min` is component-wise <= `max`.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct Aabb {
    min: Point3,
    max: Point3,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum AabbError {
    Inverted,
    NotFinite,
}

impl AabbError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::Inverted => "bounding box min must not exceed max",
            Self::NotFinite => "bounding box coordinates must be finite",
        }
    }
}

impl Aabb {
    pub fn try_new(min: Point3, max: Point3) -> Result<Self, AabbError> {
        for v in [min.x, min.y, min.z, max.x, max.y, max.z] {
            if !v.is_finite() {
                return Err(AabbError::NotFinite);
            }
        }
        if min.x > max.x || min.y > max.y || min.z > max.z {
            return Err(AabbError::Inverted);
        }
        Ok(Self { min, max })
    }

    /// Smallest box covering both endpoints of a segment.
    pub fn of_segment(a: Point3, b: Point3) -> Self {
        Self {
            min: Point3::new(a.x.min(b.x), a.y.min(b.y), a.z.min(b.z)),
            max: Point3::new(a.x.max(b.x), a.y.max(b.y), a.z.max(b.z)),
        }
    }

    pub fn of_point(p: Point3) -> Self {
        Self { min: p, max: p }
    }

    pub fn min(&self) -> Point3 {
        self.min
    }

    pub fn max(&self) -> Point3 {
        self.max
    }

    pub fn contains(&self, p: Point3) -> bool {
        p.x >= self.min.x
            && p.x <= self.max.x
            && p.y >= self.min.y
            && p.y <= self.max.y
            && p.z >= self.min.z
            && p.z <= self.max.z
    }

    pub fn intersects(&self, other: &Aabb) -> bool {
        self.min.x <= other.max.x
            && self.max.x >= other.min.x
            && self.min.y <= other.max.y
            && self.max.y >= other.min.y
            && self.min.z <= other.max.z
            && self.max.z >= other.min.z
    }

    pub fn union(&self, other: &Aabb) -> Self {
        Self {
            min: Point3::new(
                self.min.x.min(other.min.x),
                self.min.y.min(other.min.y),
                self.min.z.min(other.min.z),
            ),
            max: Point3::new(
                self.max.x.max(other.max.x),
                self.max.y.max(other.max.y),
                self.max.z.max(other.max.z),
            ),
        }
    }
}

/// Integer index of one cache cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct CellIndex {
    pub x: i64,
    pub y: i64,
    pub z: i64,
}

/// Cell dimensions of a node grid cache.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct GridSpec {
    cell_width: f64,
    cell_height: f64,
    cell_depth: f64,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum GridSpecError {
    NonPositiveCell,
}

impl GridSpecError {
    pub fn message(&self) -> &'static str {
        match self {
            Self::NonPositiveCell => "grid cell dimensions must be positive",
        }
    }
}

impl GridSpec {
    pub fn try_new(cell_width: f64, cell_height: f64, cell_depth: f64) -> Result<Self, GridSpecError> {
        for dim in [cell_width, cell_height, cell_depth] {
            if !dim.is_finite() || dim <= 0.0 {
                return Err(GridSpecError::NonPositiveCell);
            }
        }
        Ok(Self {
            cell_width,
            cell_height,
            cell_depth,
        })
    }

    pub fn cell_width(&self) -> f64 {
        self.cell_width
    }

    pub fn cell_height(&self) -> f64 {
        self.cell_height
    }

    pub fn cell_depth(&self) -> f64 {
        self.cell_depth
    }

    pub fn cell_of(&self, p: Point3) -> CellIndex {
        CellIndex {
            x: (p.x / self.cell_width).floor() as i64,
            y: (p.y / self.cell_height).floor() as i64,
            z: (p.z / self.cell_depth).floor() as i64,
        }
    }

    /// World-space bounds of one cell.
    pub fn cell_bounds(&self, cell: CellIndex) -> Aabb {
        let min = Point3::new(
            cell.x as f64 * self.cell_width,
            cell.y as f64 * self.cell_height,
            cell.z as f64 * self.cell_depth,
        );
        let max = Point3::new(
            min.x + self.cell_width,
            min.y + self.cell_height,
            min.z + self.cell_depth,
        );
        Aabb::of_segment(min, max)
    }

    /// Every cell whose bounds intersect the box, in row-major order.
    pub fn cells_in_box(&self, bounds: &Aabb) -> Vec<CellIndex> {
        let lo = self.cell_of(bounds.min());
        let hi = self.cell_of(bounds.max());
        let mut out = Vec::new();
        for z in lo.z..=hi.z {
            for y in lo.y..=hi.y {
                for x in lo.x..=hi.x {
                    out.push(CellIndex { x, y, z });
                }
            }
        }
        out
    }

    /// Cells a line segment passes through, found by sweeping over the grid
    /// planes the segment crosses. A degenerate segment touches one cell.
    pub fn cells_for_segment(&self, a: Point3, b: Point3) -> Vec<CellIndex> {
        let mut crossings = vec![0.0f64, 1.0];
        collect_axis_crossings(a.x, b.x, self.cell_width, &mut crossings);
        collect_axis_crossings(a.y, b.y, self.cell_height, &mut crossings);
        collect_axis_crossings(a.z, b.z, self.cell_depth, &mut crossings);
        crossings.sort_by(|p, q| p.partial_cmp(q).unwrap_or(std::cmp::Ordering::Equal));
        crossings.dedup();

        let mut out: Vec<CellIndex> = Vec::new();
        for pair in crossings.windows(2) {
            let t = (pair[0] + pair[1]) / 2.0;
            let p = Point3::new(
                a.x + (b.x - a.x) * t,
                a.y + (b.y - a.y) * t,
                a.z + (b.z - a.z) * t,
            );
            let cell = self.cell_of(p);
            if out.last() != Some(&cell) {
                out.push(cell);
            }
        }
        if out.is_empty() {
            out.push(self.cell_of(a));
        }
        out
    }
}

fn collect_axis_crossings(a: f64, b: f64, dim: f64, out: &mut Vec<f64>) {
    if a == b {
        return;
    }
    let (lo, hi) = if a < b { (a, b) } else { (b, a) };
    let mut k = (lo / dim).ceil();
    // Planes strictly inside the segment's extent on this axis.
    if k * dim <= lo {
        k += 1.0;
    }
    while k * dim < hi {
        let t = (k * dim - a) / (b - a);
        if t > 0.0 && t < 1.0 {
            out.push(t);
        }
        k += 1.0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn grid(w: f64, h: f64, d: f64) -> GridSpec {
        GridSpec::try_new(w, h, d).expect("grid dims are positive")
    }

    #[test]
    fn distance_is_euclidean() {
        let a = Point3::new(0.0, 0.0, 0.0);
        let b = Point3::new(3.0, 4.0, 12.0);
        assert!((a.distance(b) - 13.0).abs() < 1e-12);
    }

    #[test]
    fn aabb_rejects_inverted_and_non_finite() {
        let a = Point3::new(1.0, 0.0, 0.0);
        let b = Point3::new(0.0, 1.0, 1.0);
        assert_eq!(Aabb::try_new(a, b), Err(AabbError::Inverted));
        let nan = Point3::new(f64::NAN, 0.0, 0.0);
        assert_eq!(Aabb::try_new(nan, b), Err(AabbError::NotFinite));
    }

    #[test]
    fn aabb_overlap() {
        let a = Aabb::try_new(Point3::new(0.0, 0.0, 0.0), Point3::new(2.0, 2.0, 2.0)).unwrap();
        let b = Aabb::try_new(Point3::new(1.0, 1.0, 1.0), Point3::new(3.0, 3.0, 3.0)).unwrap();
        let c = Aabb::try_new(Point3::new(5.0, 5.0, 5.0), Point3::new(6.0, 6.0, 6.0)).unwrap();
        assert!(a.intersects(&b));
        assert!(!a.intersects(&c));
    }

    #[test]
    fn point_touches_exactly_one_cell() {
        let g = grid(10.0, 10.0, 10.0);
        let cells = g.cells_for_segment(Point3::new(3.0, 4.0, 5.0), Point3::new(3.0, 4.0, 5.0));
        assert_eq!(cells, vec![CellIndex { x: 0, y: 0, z: 0 }]);
    }

    #[test]
    fn segment_sweep_covers_crossed_cells() {
        let g = grid(10.0, 10.0, 10.0);
        // Crosses x=10 and x=20 while staying in the first y/z cells.
        let cells = g.cells_for_segment(Point3::new(5.0, 5.0, 5.0), Point3::new(25.0, 5.0, 5.0));
        assert_eq!(
            cells,
            vec![
                CellIndex { x: 0, y: 0, z: 0 },
                CellIndex { x: 1, y: 0, z: 0 },
                CellIndex { x: 2, y: 0, z: 0 },
            ]
        );
    }

    #[test]
    fn diagonal_sweep_is_contiguous() {
        let g = grid(10.0, 10.0, 10.0);
        let cells = g.cells_for_segment(Point3::new(1.0, 1.0, 1.0), Point3::new(19.0, 19.0, 1.0));
        assert_eq!(cells.first(), Some(&CellIndex { x: 0, y: 0, z: 0 }));
        assert_eq!(cells.last(), Some(&CellIndex { x: 1, y: 1, z: 0 }));
        // Every step moves to an adjacent cell.
        for pair in cells.windows(2) {
            let dx = (pair[1].x - pair[0].x).abs();
            let dy = (pair[1].y - pair[0].y).abs();
            let dz = (pair[1].z - pair[0].z).abs();
            assert!(dx + dy + dz >= 1 && dx <= 1 && dy <= 1 && dz <= 1);
        }
    }

    #[test]
    fn negative_coordinates_floor_correctly() {
        let g = grid(10.0, 10.0, 10.0);
        let cell = g.cell_of(Point3::new(-0.5, -10.0, -10.5));
        assert_eq!(cell, CellIndex { x: -1, y: -1, z: -2 });
    }

    #[test]
    fn cells_in_box_row_major() {
        let g = grid(10.0, 10.0, 10.0);
        let bounds =
            Aabb::try_new(Point3::new(5.0, 5.0, 5.0), Point3::new(15.0, 5.0, 5.0)).unwrap();
        assert_eq!(
            g.cells_in_box(&bounds),
            vec![CellIndex { x: 0, y: 0, z: 0 }, CellIndex { x: 1, y: 0, z: 0 }]
        );
    }
}
