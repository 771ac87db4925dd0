/// Planar spatial predicates for in-process filtering
///
/// Shapes are decomposed into points, lines and polygons; predicates are
/// answered from segment intersection tests and point location after an
/// envelope pre-check. Boundaries follow the simple-features rules: an open
/// linestring's boundary is its two end points, a polygon's boundary is its
/// rings, points have no boundary.

use super::geometry::{Coord, Geometry, Shape};

const EPSILON: f64 = 1e-12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
enum Location {
    Exterior,
    Boundary,
    Interior,
}

/// Borrowed components of a shape
struct Parts<'a> {
    points: Vec<Coord>,
    lines: Vec<&'a [Coord]>,
    polygons: Vec<&'a [Vec<Coord>]>,
}

impl<'a> Parts<'a> {
    fn of(shape: &'a Shape) -> Self {
        let mut parts = Self { points: Vec::new(), lines: Vec::new(), polygons: Vec::new() };
        parts.collect(shape);
        parts
    }

    fn collect(&mut self, shape: &'a Shape) {
        match shape {
            Shape::Point(c) => self.points.push(*c),
            Shape::MultiPoint(cs) => self.points.extend(cs.iter().copied()),
            Shape::LineString(cs) => self.push_line(cs),
            Shape::MultiLineString(lines) => {
                for line in lines {
                    self.push_line(line);
                }
            }
            Shape::Polygon(rings) => self.push_polygon(rings),
            Shape::MultiPolygon(polygons) => {
                for rings in polygons {
                    self.push_polygon(rings);
                }
            }
            Shape::GeometryCollection(shapes) => {
                for shape in shapes {
                    self.collect(shape);
                }
            }
        }
    }

    fn push_line(&mut self, cs: &'a [Coord]) {
        match cs {
            [] => {}
            [single] => self.points.push(*single),
            _ => self.lines.push(cs),
        }
    }

    fn push_polygon(&mut self, rings: &'a [Vec<Coord>]) {
        if rings.first().is_some_and(|shell| shell.len() >= 3) {
            self.polygons.push(rings);
        }
    }

    /// Topological dimension; `None` for an empty shape
    fn dimension(&self) -> Option<u8> {
        if !self.polygons.is_empty() {
            Some(2)
        } else if !self.lines.is_empty() {
            Some(1)
        } else if !self.points.is_empty() {
            Some(0)
        } else {
            None
        }
    }

    fn segments(&self) -> Vec<(Coord, Coord)> {
        let mut out: Vec<(Coord, Coord)> = self.lines.iter().flat_map(|l| line_segments(l)).collect();
        for rings in &self.polygons {
            out.extend(rings.iter().flat_map(|r| ring_segments(r)));
        }
        out
    }

    /// Segments plus every point as a zero-length segment
    fn distance_segments(&self) -> Vec<(Coord, Coord)> {
        let mut out = self.segments();
        out.extend(self.points.iter().map(|p| (*p, *p)));
        out
    }

    fn ring_vertices(&self) -> impl Iterator<Item = Coord> + '_ {
        self.polygons.iter().flat_map(|rings| rings.iter().flatten().copied())
    }

    /// Vertices, segment midpoints and one interior point per polygon
    fn samples(&self) -> Vec<Coord> {
        let mut out = self.points.clone();
        for line in &self.lines {
            out.extend(line.iter().copied());
            out.extend(line_segments(line).map(midpoint));
        }
        for rings in &self.polygons {
            for ring in rings.iter() {
                out.extend(ring.iter().copied());
                out.extend(ring_segments(ring).map(midpoint));
            }
            out.extend(interior_point(rings));
        }
        out
    }

    fn locate(&self, p: Coord) -> Location {
        let mut best = Location::Exterior;
        if self.points.iter().any(|q| same(*q, p)) {
            return Location::Interior;
        }
        for line in &self.lines {
            best = best.max(locate_on_line(line, p));
        }
        for rings in &self.polygons {
            best = best.max(locate_in_polygon(rings, p));
        }
        best
    }
}

fn same(a: Coord, b: Coord) -> bool {
    (a.x - b.x).abs() <= EPSILON && (a.y - b.y).abs() <= EPSILON
}

fn midpoint((a, b): (Coord, Coord)) -> Coord {
    Coord::xy((a.x + b.x) / 2.0, (a.y + b.y) / 2.0)
}

fn line_segments(line: &[Coord]) -> impl Iterator<Item = (Coord, Coord)> + '_ {
    line.windows(2).map(|w| (w[0], w[1]))
}

/// Ring edges, closing the ring when the last vertex does not repeat the first
fn ring_segments(ring: &[Coord]) -> impl Iterator<Item = (Coord, Coord)> + '_ {
    let closing = match (ring.first(), ring.last()) {
        (Some(first), Some(last)) if ring.len() > 1 && !same(*first, *last) => Some((*last, *first)),
        _ => None,
    };
    line_segments(ring).chain(closing)
}

fn orientation(start: Coord, end: Coord, p: Coord) -> i8 {
    let cross = (end.x - start.x) * (p.y - start.y) - (end.y - start.y) * (p.x - start.x);
    if cross > EPSILON {
        1
    } else if cross < -EPSILON {
        -1
    } else {
        0
    }
}

fn on_segment(start: Coord, end: Coord, p: Coord) -> bool {
    orientation(start, end, p) == 0
        && p.x >= start.x.min(end.x) - EPSILON
        && p.x <= start.x.max(end.x) + EPSILON
        && p.y >= start.y.min(end.y) - EPSILON
        && p.y <= start.y.max(end.y) + EPSILON
}

fn segments_intersect((a1, a2): (Coord, Coord), (b1, b2): (Coord, Coord)) -> bool {
    let o1 = orientation(a1, a2, b1);
    let o2 = orientation(a1, a2, b2);
    let o3 = orientation(b1, b2, a1);
    let o4 = orientation(b1, b2, a2);
    (o1 != o2 && o3 != o4)
        || on_segment(a1, a2, b1)
        || on_segment(a1, a2, b2)
        || on_segment(b1, b2, a1)
        || on_segment(b1, b2, a2)
}

/// Segments cross at a single point interior to both
fn crosses_properly((a1, a2): (Coord, Coord), (b1, b2): (Coord, Coord)) -> bool {
    orientation(a1, a2, b1) * orientation(a1, a2, b2) < 0 && orientation(b1, b2, a1) * orientation(b1, b2, a2) < 0
}

/// Collinear segments sharing more than a single point
fn overlap_collinear((a1, a2): (Coord, Coord), (b1, b2): (Coord, Coord)) -> bool {
    if orientation(a1, a2, b1) != 0 || orientation(a1, a2, b2) != 0 {
        return false;
    }
    let (dx, dy) = (a2.x - a1.x, a2.y - a1.y);
    let len2 = dx * dx + dy * dy;
    if len2 <= 0.0 {
        return false;
    }
    let t = |p: Coord| ((p.x - a1.x) * dx + (p.y - a1.y) * dy) / len2;
    let (t1, t2) = (t(b1), t(b2));
    t1.max(t2).min(1.0) - t1.min(t2).max(0.0) > EPSILON
}

fn point_segment_distance(p: Coord, (a, b): (Coord, Coord)) -> f64 {
    let (dx, dy) = (b.x - a.x, b.y - a.y);
    let len2 = dx * dx + dy * dy;
    let t = if len2 <= 0.0 {
        0.0
    } else {
        (((p.x - a.x) * dx + (p.y - a.y) * dy) / len2).clamp(0.0, 1.0)
    };
    (a.x + t * dx - p.x).hypot(a.y + t * dy - p.y)
}

fn segment_distance(s: (Coord, Coord), t: (Coord, Coord)) -> f64 {
    if segments_intersect(s, t) {
        return 0.0;
    }
    point_segment_distance(s.0, t)
        .min(point_segment_distance(s.1, t))
        .min(point_segment_distance(t.0, s))
        .min(point_segment_distance(t.1, s))
}

fn locate_on_line(line: &[Coord], p: Coord) -> Location {
    if let (Some(first), Some(last)) = (line.first(), line.last()) {
        if !same(*first, *last) && (same(*first, p) || same(*last, p)) {
            return Location::Boundary;
        }
    }
    if line_segments(line).any(|(a, b)| on_segment(a, b, p)) {
        Location::Interior
    } else {
        Location::Exterior
    }
}

fn locate_in_ring(ring: &[Coord], p: Coord) -> Location {
    let mut inside = false;
    for (a, b) in ring_segments(ring) {
        if on_segment(a, b, p) {
            return Location::Boundary;
        }
        if (a.y > p.y) != (b.y > p.y) {
            let x = (b.x - a.x) * (p.y - a.y) / (b.y - a.y) + a.x;
            if p.x < x {
                inside = !inside;
            }
        }
    }
    if inside { Location::Interior } else { Location::Exterior }
}

fn locate_in_polygon(rings: &[Vec<Coord>], p: Coord) -> Location {
    let Some((shell, holes)) = rings.split_first() else {
        return Location::Exterior;
    };
    match locate_in_ring(shell, p) {
        Location::Interior => {}
        other => return other,
    }
    for hole in holes {
        match locate_in_ring(hole, p) {
            Location::Interior => return Location::Exterior,
            Location::Boundary => return Location::Boundary,
            Location::Exterior => {}
        }
    }
    Location::Interior
}

/// A point strictly inside the polygon: the midpoint of the widest span cut
/// by a horizontal scan line that passes between vertex heights.
fn interior_point(rings: &[Vec<Coord>]) -> Option<Coord> {
    let mut ys: Vec<f64> = rings.iter().flatten().map(|c| c.y).collect();
    ys.sort_by(f64::total_cmp);
    ys.dedup_by(|a, b| (*a - *b).abs() <= EPSILON);
    let centre = (ys.first()? + ys.last()?) / 2.0;
    let y = ys
        .windows(2)
        .map(|w| (w[0] + w[1]) / 2.0)
        .min_by(|a, b| (a - centre).abs().total_cmp(&(b - centre).abs()))?;
    let mut xs: Vec<f64> = rings
        .iter()
        .flat_map(|r| ring_segments(r))
        .filter(|(a, b)| (a.y > y) != (b.y > y))
        .map(|(a, b)| (b.x - a.x) * (y - a.y) / (b.y - a.y) + a.x)
        .collect();
    xs.sort_by(f64::total_cmp);
    xs.chunks_exact(2)
        .max_by(|p, q| (p[1] - p[0]).total_cmp(&(q[1] - q[0])))
        .map(|span| Coord::xy((span[0] + span[1]) / 2.0, y))
}

fn any_segment_pair(a: &Parts<'_>, b: &Parts<'_>, test: fn((Coord, Coord), (Coord, Coord)) -> bool) -> bool {
    let theirs = b.segments();
    a.segments().iter().any(|s| theirs.iter().any(|t| test(*s, *t)))
}

fn intersects(a: &Parts<'_>, b: &Parts<'_>) -> bool {
    any_segment_pair(a, b, segments_intersect)
        || a.samples().into_iter().any(|s| b.locate(s) != Location::Exterior)
        || b.samples().into_iter().any(|s| a.locate(s) != Location::Exterior)
}

/// Every point of `a` lies in the interior or on the boundary of `b`
fn covered_by(a: &Parts<'_>, b: &Parts<'_>) -> bool {
    if a.samples().into_iter().any(|s| b.locate(s) == Location::Exterior) {
        return false;
    }
    if any_segment_pair(a, b, crosses_properly) {
        return false;
    }
    // A ring vertex of b inside a's area leaves part of b's exterior in a
    a.dimension() != Some(2) || b.ring_vertices().all(|v| a.locate(v) != Location::Interior)
}

fn interiors_intersect(a: &Parts<'_>, b: &Parts<'_>) -> bool {
    let both = |s: &Coord| a.locate(*s) == Location::Interior && b.locate(*s) == Location::Interior;
    any_segment_pair(a, b, crosses_properly) || a.samples().iter().any(both) || b.samples().iter().any(both)
}

impl Geometry {
    /// Shares at least one point with `other`
    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        self.envelope().intersects(&other.envelope())
            && intersects(&Parts::of(&self.shape), &Parts::of(&other.shape))
    }

    #[must_use]
    pub fn disjoint(&self, other: &Self) -> bool {
        !self.intersects(other)
    }

    /// Lies inside `other` with at least one point in its interior
    #[must_use]
    pub fn within(&self, other: &Self) -> bool {
        if !self.envelope().intersects(&other.envelope()) {
            return false;
        }
        let (a, b) = (Parts::of(&self.shape), Parts::of(&other.shape));
        let witness = a
            .samples()
            .into_iter()
            .any(|s| a.locate(s) == Location::Interior && b.locate(s) == Location::Interior);
        witness && covered_by(&a, &b)
    }

    #[must_use]
    pub fn contains(&self, other: &Self) -> bool {
        other.within(self)
    }

    /// Meets `other` only on boundaries
    #[must_use]
    pub fn touches(&self, other: &Self) -> bool {
        if !self.envelope().intersects(&other.envelope()) {
            return false;
        }
        let (a, b) = (Parts::of(&self.shape), Parts::of(&other.shape));
        intersects(&a, &b) && !interiors_intersect(&a, &b)
    }

    /// Interiors meet and each geometry leaves part of itself outside the
    /// other; lines cross lines at isolated points only.
    #[must_use]
    pub fn crosses(&self, other: &Self) -> bool {
        if !self.envelope().intersects(&other.envelope()) {
            return false;
        }
        let (a, b) = (Parts::of(&self.shape), Parts::of(&other.shape));
        let (Some(da), Some(db)) = (a.dimension(), b.dimension()) else {
            return false;
        };
        match da.cmp(&db) {
            std::cmp::Ordering::Less => interiors_intersect(&a, &b) && !covered_by(&a, &b),
            std::cmp::Ordering::Greater => interiors_intersect(&b, &a) && !covered_by(&b, &a),
            std::cmp::Ordering::Equal => {
                da == 1
                    && any_segment_pair(&a, &b, crosses_properly)
                    && !any_segment_pair(&a, &b, overlap_collinear)
            }
        }
    }

    /// Same dimension, interiors meet, neither covers the other
    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        if !self.envelope().intersects(&other.envelope()) {
            return false;
        }
        let (a, b) = (Parts::of(&self.shape), Parts::of(&other.shape));
        let (Some(da), Some(db)) = (a.dimension(), b.dimension()) else {
            return false;
        };
        let interiors = if da == 1 {
            any_segment_pair(&a, &b, overlap_collinear)
        } else {
            interiors_intersect(&a, &b)
        };
        da == db && interiors && !covered_by(&a, &b) && !covered_by(&b, &a)
    }

    /// Point-set equality, independent of vertex order or start point
    #[must_use]
    pub fn equals_topologically(&self, other: &Self) -> bool {
        if self.shape == other.shape {
            return true;
        }
        let (a, b) = (Parts::of(&self.shape), Parts::of(&other.shape));
        a.dimension().is_some()
            && a.dimension() == b.dimension()
            && covered_by(&a, &b)
            && covered_by(&b, &a)
    }

    /// Minimum planar distance; `None` when either geometry is empty
    #[must_use]
    pub fn distance(&self, other: &Self) -> Option<f64> {
        let (a, b) = (Parts::of(&self.shape), Parts::of(&other.shape));
        a.dimension()?;
        b.dimension()?;
        if self.envelope().intersects(&other.envelope()) && intersects(&a, &b) {
            return Some(0.0);
        }
        let theirs = b.distance_segments();
        a.distance_segments()
            .iter()
            .flat_map(|s| theirs.iter().map(move |t| segment_distance(*s, *t)))
            .min_by(f64::total_cmp)
    }
}
