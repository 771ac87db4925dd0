/// Geometry values exchanged with spatial backends
///
/// A WKT codec, envelopes, the SRID tag and a coordinate-dimension probe.
/// Planar predicates used by post-filters live in `topology`.

use super::error::StoreError;
use nom::{
    branch::alt,
    bytes::complete::tag_no_case,
    character::complete::{char, digit1, multispace0},
    combinator::{all_consuming, map, map_res, opt, recognize},
    multi::separated_list1,
    number::complete::double,
    sequence::{delimited, pair, preceded, terminated, tuple},
    IResult,
};
use serde::{Deserialize, Serialize};
use std::fmt::{self, Write};

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Coord {
    pub x: f64,
    pub y: f64,
    pub z: Option<f64>,
}

impl Coord {
    #[must_use]
    pub const fn xy(x: f64, y: f64) -> Self {
        Self { x, y, z: None }
    }

    #[must_use]
    pub const fn xyz(x: f64, y: f64, z: f64) -> Self {
        Self { x, y, z: Some(z) }
    }
}

/// Declared geometry type of an attribute or column
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GeometryKind {
    Geometry,
    Point,
    LineString,
    Polygon,
    MultiPoint,
    MultiLineString,
    MultiPolygon,
    GeometryCollection,
}

impl GeometryKind {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Geometry => "GEOMETRY",
            Self::Point => "POINT",
            Self::LineString => "LINESTRING",
            Self::Polygon => "POLYGON",
            Self::MultiPoint => "MULTIPOINT",
            Self::MultiLineString => "MULTILINESTRING",
            Self::MultiPolygon => "MULTIPOLYGON",
            Self::GeometryCollection => "GEOMETRYCOLLECTION",
        }
    }

    /// Resolves a native geometry type name (case-insensitive, `Z`/`M`
    /// suffixes ignored). Unknown names yield `None`.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        let upper = name.trim().to_uppercase();
        let base = upper
            .trim_end_matches("ZM")
            .trim_end_matches('Z')
            .trim_end_matches('M');
        match base {
            "GEOMETRY" => Some(Self::Geometry),
            "POINT" => Some(Self::Point),
            "LINESTRING" => Some(Self::LineString),
            "POLYGON" => Some(Self::Polygon),
            "MULTIPOINT" => Some(Self::MultiPoint),
            "MULTILINESTRING" => Some(Self::MultiLineString),
            "MULTIPOLYGON" => Some(Self::MultiPolygon),
            "GEOMETRYCOLLECTION" => Some(Self::GeometryCollection),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum Shape {
    Point(Coord),
    LineString(Vec<Coord>),
    Polygon(Vec<Vec<Coord>>),
    MultiPoint(Vec<Coord>),
    MultiLineString(Vec<Vec<Coord>>),
    MultiPolygon(Vec<Vec<Vec<Coord>>>),
    GeometryCollection(Vec<Shape>),
}

impl Shape {
    fn for_each_coord(&self, f: &mut dyn FnMut(&Coord)) {
        match self {
            Self::Point(c) => f(c),
            Self::LineString(cs) | Self::MultiPoint(cs) => cs.iter().for_each(f),
            Self::Polygon(rings) | Self::MultiLineString(rings) => {
                rings.iter().flatten().for_each(f);
            }
            Self::MultiPolygon(polys) => polys.iter().flatten().flatten().for_each(f),
            Self::GeometryCollection(parts) => {
                for part in parts {
                    part.for_each_coord(f);
                }
            }
        }
    }

    const fn kind(&self) -> GeometryKind {
        match self {
            Self::Point(_) => GeometryKind::Point,
            Self::LineString(_) => GeometryKind::LineString,
            Self::Polygon(_) => GeometryKind::Polygon,
            Self::MultiPoint(_) => GeometryKind::MultiPoint,
            Self::MultiLineString(_) => GeometryKind::MultiLineString,
            Self::MultiPolygon(_) => GeometryKind::MultiPolygon,
            Self::GeometryCollection(_) => GeometryKind::GeometryCollection,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Geometry {
    pub shape: Shape,
    /// Spatial reference id; `None` when the value carries no reference
    pub srid: Option<i32>,
}

impl Geometry {
    #[must_use]
    pub const fn new(shape: Shape) -> Self {
        Self { shape, srid: None }
    }

    #[must_use]
    pub const fn point(x: f64, y: f64) -> Self {
        Self::new(Shape::Point(Coord::xy(x, y)))
    }

    #[must_use]
    pub fn with_srid(mut self, srid: i32) -> Self {
        self.srid = Some(srid);
        self
    }

    #[must_use]
    pub const fn kind(&self) -> GeometryKind {
        self.shape.kind()
    }

    #[must_use]
    pub fn envelope(&self) -> Envelope {
        let mut env = Envelope::null();
        self.shape.for_each_coord(&mut |c: &Coord| env.expand_to_include(c));
        env.srid = self.srid;
        env
    }

    /// Coordinate dimension: 3 when any coordinate carries a z ordinate
    #[must_use]
    pub fn dimension(&self) -> u8 {
        let mut has_z = false;
        self.shape.for_each_coord(&mut |c: &Coord| has_z |= c.z.is_some());
        if has_z { 3 } else { 2 }
    }

    #[must_use]
    pub fn to_wkt(&self) -> String {
        let mut out = String::new();
        let three_d = self.dimension() == 3;
        write_shape(&self.shape, three_d, &mut out);
        out
    }

    /// Parses WKT, accepting an optional EWKT `SRID=n;` prefix.
    pub fn parse_wkt(text: &str) -> Result<Self, StoreError> {
        let (_, geometry) = all_consuming(delimited(multispace0, wkt, multispace0))(text)
            .map_err(|e| StoreError::Parse(format!("invalid WKT '{text}': {e}")))?;
        Ok(geometry)
    }

    /// Polygon covering an envelope, tagged with the envelope's SRID
    #[must_use]
    pub fn from_envelope(env: &Envelope) -> Self {
        let ring = vec![
            Coord::xy(env.min_x, env.min_y),
            Coord::xy(env.min_x, env.max_y),
            Coord::xy(env.max_x, env.max_y),
            Coord::xy(env.max_x, env.min_y),
            Coord::xy(env.min_x, env.min_y),
        ];
        Self {
            shape: Shape::Polygon(vec![ring]),
            srid: env.srid,
        }
    }
}

impl fmt::Display for Geometry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wkt())
    }
}

/// Axis-aligned bounding box. A "null" envelope (min > max) contains nothing.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
    pub srid: Option<i32>,
}

impl Envelope {
    #[must_use]
    pub const fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self { min_x, min_y, max_x, max_y, srid: None }
    }

    #[must_use]
    pub const fn null() -> Self {
        Self {
            min_x: f64::INFINITY,
            min_y: f64::INFINITY,
            max_x: f64::NEG_INFINITY,
            max_y: f64::NEG_INFINITY,
            srid: None,
        }
    }

    #[must_use]
    pub const fn with_srid(mut self, srid: Option<i32>) -> Self {
        self.srid = srid;
        self
    }

    #[must_use]
    pub fn is_null(&self) -> bool {
        self.min_x > self.max_x || self.min_y > self.max_y
    }

    pub fn expand_to_include(&mut self, c: &Coord) {
        self.min_x = self.min_x.min(c.x);
        self.min_y = self.min_y.min(c.y);
        self.max_x = self.max_x.max(c.x);
        self.max_y = self.max_y.max(c.y);
    }

    /// Grows this envelope to cover `other`; SRIDs are not reconciled here.
    pub fn merge(&mut self, other: &Self) {
        if other.is_null() {
            return;
        }
        if self.is_null() {
            let srid = self.srid.or(other.srid);
            *self = *other;
            self.srid = srid;
            return;
        }
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    #[must_use]
    pub fn intersects(&self, other: &Self) -> bool {
        !self.is_null()
            && !other.is_null()
            && self.min_x <= other.max_x
            && other.min_x <= self.max_x
            && self.min_y <= other.max_y
            && other.min_y <= self.max_y
    }
}

/// Reprojects envelopes between spatial reference systems. The engine never
/// does coordinate math itself; a store without a transform refuses to merge
/// envelopes of different SRIDs.
pub trait CoordinateTransform: Send + Sync {
    fn transform(&self, envelope: &Envelope, target_srid: i32) -> Result<Envelope, StoreError>;
}

fn write_coord(c: &Coord, three_d: bool, out: &mut String) {
    let _ = write!(out, "{} {}", c.x, c.y);
    if three_d {
        let _ = write!(out, " {}", c.z.unwrap_or(f64::NAN));
    }
}

fn write_coords(cs: &[Coord], three_d: bool, out: &mut String) {
    if cs.is_empty() {
        out.push_str("EMPTY");
        return;
    }
    out.push('(');
    for (i, c) in cs.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_coord(c, three_d, out);
    }
    out.push(')');
}

fn write_rings(rings: &[Vec<Coord>], three_d: bool, out: &mut String) {
    if rings.is_empty() {
        out.push_str("EMPTY");
        return;
    }
    out.push('(');
    for (i, ring) in rings.iter().enumerate() {
        if i > 0 {
            out.push_str(", ");
        }
        write_coords(ring, three_d, out);
    }
    out.push(')');
}

fn write_shape(shape: &Shape, three_d: bool, out: &mut String) {
    out.push_str(shape.kind().as_str());
    out.push_str(if three_d { " Z " } else { " " });
    match shape {
        Shape::Point(c) => {
            out.push('(');
            write_coord(c, three_d, out);
            out.push(')');
        }
        Shape::LineString(cs) | Shape::MultiPoint(cs) => write_coords(cs, three_d, out),
        Shape::Polygon(rings) | Shape::MultiLineString(rings) => write_rings(rings, three_d, out),
        Shape::MultiPolygon(polys) => {
            if polys.is_empty() {
                out.push_str("EMPTY");
                return;
            }
            out.push('(');
            for (i, poly) in polys.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_rings(poly, three_d, out);
            }
            out.push(')');
        }
        Shape::GeometryCollection(parts) => {
            if parts.is_empty() {
                out.push_str("EMPTY");
                return;
            }
            out.push('(');
            for (i, part) in parts.iter().enumerate() {
                if i > 0 {
                    out.push_str(", ");
                }
                write_shape(part, three_d, out);
            }
            out.push(')');
        }
    }
}

// WKT grammar

fn ws<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(multispace0, inner, multispace0)
}

fn srid_prefix(input: &str) -> IResult<&str, i32> {
    terminated(
        preceded(
            ws(tag_no_case("SRID=")),
            map_res(recognize(pair(opt(char('-')), digit1)), str::parse::<i32>),
        ),
        ws(char(';')),
    )(input)
}

fn coord(input: &str) -> IResult<&str, Coord> {
    map(
        tuple((ws(double), ws(double), opt(ws(double)))),
        |(x, y, z)| Coord { x, y, z },
    )(input)
}

fn empty<T>(input: &str) -> IResult<&str, Vec<T>> {
    map(ws(tag_no_case("EMPTY")), |_| Vec::new())(input)
}

fn parens<'a, F, O>(inner: F) -> impl FnMut(&'a str) -> IResult<&'a str, O>
where
    F: FnMut(&'a str) -> IResult<&'a str, O>,
{
    delimited(ws(char('(')), inner, ws(char(')')))
}

fn coord_list(input: &str) -> IResult<&str, Vec<Coord>> {
    alt((empty, parens(separated_list1(ws(char(',')), coord))))(input)
}

fn ring_list(input: &str) -> IResult<&str, Vec<Vec<Coord>>> {
    alt((empty, parens(separated_list1(ws(char(',')), coord_list))))(input)
}

fn multi_point_list(input: &str) -> IResult<&str, Vec<Coord>> {
    // Both MULTIPOINT ((1 2), (3 4)) and MULTIPOINT (1 2, 3 4) are in use
    alt((
        empty,
        parens(separated_list1(ws(char(',')), parens(coord))),
        parens(separated_list1(ws(char(',')), coord)),
    ))(input)
}

fn dimension_marker(input: &str) -> IResult<&str, Option<&str>> {
    opt(ws(alt((tag_no_case("ZM"), tag_no_case("Z"), tag_no_case("M")))))(input)
}

fn keyword<'a>(name: &'static str) -> impl FnMut(&'a str) -> IResult<&'a str, ()> {
    map(pair(ws(tag_no_case(name)), dimension_marker), |_| ())
}

/// WKT (or EWKT) geometry as a nom parser, for embedding in larger grammars
pub fn wkt(input: &str) -> IResult<&str, Geometry> {
    map(pair(opt(srid_prefix), shape), |(srid, shape)| Geometry { shape, srid })(input)
}

fn shape(input: &str) -> IResult<&str, Shape> {
    // Longer keywords first so MULTIPOINT is not read as POINT
    alt((
        map(
            preceded(
                keyword("GEOMETRYCOLLECTION"),
                alt((empty, parens(separated_list1(ws(char(',')), shape)))),
            ),
            Shape::GeometryCollection,
        ),
        map(
            preceded(
                keyword("MULTIPOLYGON"),
                alt((empty, parens(separated_list1(ws(char(',')), ring_list)))),
            ),
            Shape::MultiPolygon,
        ),
        map(preceded(keyword("MULTILINESTRING"), ring_list), Shape::MultiLineString),
        map(preceded(keyword("MULTIPOINT"), multi_point_list), Shape::MultiPoint),
        map(preceded(keyword("POLYGON"), ring_list), Shape::Polygon),
        map(preceded(keyword("LINESTRING"), coord_list), Shape::LineString),
        map(preceded(keyword("POINT"), parens(coord)), Shape::Point),
    ))(input)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_point() {
        let g = Geometry::parse_wkt("POINT (1 2)").unwrap();
        assert_eq!(g.shape, Shape::Point(Coord::xy(1.0, 2.0)));
        assert_eq!(g.srid, None);
        assert_eq!(g.dimension(), 2);
    }

    #[test]
    fn test_parse_ewkt_prefix() {
        let g = Geometry::parse_wkt("SRID=4326;POINT(10.5 -3)").unwrap();
        assert_eq!(g.srid, Some(4326));
        assert_eq!(g.to_wkt(), "POINT (10.5 -3)");
    }

    #[test]
    fn test_parse_polygon_and_envelope() {
        let g = Geometry::parse_wkt("POLYGON ((0 0, 0 4, 3 4, 3 0, 0 0))").unwrap();
        assert_eq!(g.kind(), GeometryKind::Polygon);
        let env = g.envelope();
        assert_eq!((env.min_x, env.min_y, env.max_x, env.max_y), (0.0, 0.0, 3.0, 4.0));
    }

    #[test]
    fn test_parse_multipoint_variants() {
        let a = Geometry::parse_wkt("MULTIPOINT ((1 2), (3 4))").unwrap();
        let b = Geometry::parse_wkt("MULTIPOINT (1 2, 3 4)").unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_three_dimensional_probe() {
        let g = Geometry::parse_wkt("LINESTRING Z (0 0 1, 1 1 2)").unwrap();
        assert_eq!(g.dimension(), 3);
        assert_eq!(g.to_wkt(), "LINESTRING Z (0 0 1, 1 1 2)");
    }

    #[test]
    fn test_collection_and_empty() {
        let g = Geometry::parse_wkt("GEOMETRYCOLLECTION (POINT (1 1), LINESTRING EMPTY)").unwrap();
        match &g.shape {
            Shape::GeometryCollection(parts) => assert_eq!(parts.len(), 2),
            other => panic!("unexpected shape {other:?}"),
        }
        assert!(Geometry::parse_wkt("POLYGON EMPTY").unwrap().envelope().is_null());
    }

    #[test]
    fn test_invalid_wkt() {
        assert!(matches!(Geometry::parse_wkt("POINT (1)"), Err(StoreError::Parse(_))));
        assert!(Geometry::parse_wkt("CIRCLE (1 2)").is_err());
    }

    #[test]
    fn test_envelope_merge_and_intersects() {
        let mut a = Envelope::new(0.0, 0.0, 1.0, 1.0);
        let b = Envelope::new(2.0, 2.0, 3.0, 3.0);
        assert!(!a.intersects(&b));
        a.merge(&b);
        assert_eq!(a, Envelope::new(0.0, 0.0, 3.0, 3.0));
        let mut n = Envelope::null();
        n.merge(&b);
        assert_eq!(n, b);
    }

    #[test]
    fn test_kind_from_name() {
        assert_eq!(GeometryKind::from_name("multipolygon"), Some(GeometryKind::MultiPolygon));
        assert_eq!(GeometryKind::from_name("POINTZ"), Some(GeometryKind::Point));
        assert_eq!(GeometryKind::from_name("varchar"), None);
    }
}
