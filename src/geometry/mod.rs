//! Geometry primitives: envelopes and opaque geometry blobs.
//!
//! The catalog treats geometry as an opaque WKT payload produced by the
//! underlying data access layer. The only geometric operation the core
//! performs itself is envelope arithmetic: merging, intersection tests,
//! and widening of degenerate extents.

/// Tolerance for "these two coordinates are the same" comparisons.
const COORD_EPSILON: f64 = 1e-9;

fn nearly_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < COORD_EPSILON
}

/// Axis-aligned bounding rectangle.
///
/// An *uninitialized* envelope is represented as `Option<Envelope>` at rest;
/// a constructed `Envelope` always has `min <= max` on both axes.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Envelope {
    pub min_x: f64,
    pub min_y: f64,
    pub max_x: f64,
    pub max_y: f64,
}

impl Envelope {
    /// Create an envelope from explicit bounds.
    ///
    /// Bounds are normalized so that `min <= max` on each axis.
    pub fn new(min_x: f64, min_y: f64, max_x: f64, max_y: f64) -> Self {
        Self {
            min_x: min_x.min(max_x),
            min_y: min_y.min(max_y),
            max_x: min_x.max(max_x),
            max_y: min_y.max(max_y),
        }
    }

    /// Degenerate envelope covering a single point.
    pub fn point(x: f64, y: f64) -> Self {
        Self {
            min_x: x,
            min_y: y,
            max_x: x,
            max_y: y,
        }
    }

    /// Grow this envelope to also cover `other`.
    pub fn merge(&mut self, other: &Envelope) {
        self.min_x = self.min_x.min(other.min_x);
        self.min_y = self.min_y.min(other.min_y);
        self.max_x = self.max_x.max(other.max_x);
        self.max_y = self.max_y.max(other.max_y);
    }

    /// Exact envelope intersection test, inclusive of shared edges.
    pub fn intersects(&self, other: &Envelope) -> bool {
        self.min_x <= other.max_x
            && self.max_x >= other.min_x
            && self.min_y <= other.max_y
            && self.max_y >= other.min_y
    }

    /// Whether the X axis has collapsed to a single coordinate.
    pub fn is_degenerate_x(&self) -> bool {
        nearly_equal(self.min_x, self.max_x)
    }

    /// Whether the Y axis has collapsed to a single coordinate.
    pub fn is_degenerate_y(&self) -> bool {
        nearly_equal(self.min_y, self.max_y)
    }

    /// Widen any degenerate axis by one unit on each side.
    ///
    /// Downstream spatial queries assume a non-degenerate extent; a layer
    /// whose features all share one X (or Y) coordinate would otherwise
    /// produce a zero-area envelope.
    pub fn expand_degenerate(&mut self) {
        if self.is_degenerate_x() {
            self.min_x -= 1.0;
            self.max_x += 1.0;
        }
        if self.is_degenerate_y() {
            self.min_y -= 1.0;
            self.max_y += 1.0;
        }
    }
}

/// Opaque geometry: WKT text plus its precomputed envelope.
///
/// The core never interprets the WKT beyond extracting coordinate bounds;
/// everything else is the data access layer's business.
#[derive(Debug, Clone, PartialEq)]
pub struct Geometry {
    wkt: String,
    envelope: Envelope,
}

impl Geometry {
    /// Wrap a WKT payload with a known envelope.
    pub fn with_envelope(wkt: impl Into<String>, envelope: Envelope) -> Self {
        Self {
            wkt: wkt.into(),
            envelope,
        }
    }

    /// Point geometry at the given coordinates.
    pub fn point(x: f64, y: f64) -> Self {
        Self {
            wkt: format!("POINT ({} {})", x, y),
            envelope: Envelope::point(x, y),
        }
    }

    /// Parse a WKT payload, computing its envelope from the coordinate list.
    ///
    /// This is a bounds scan, not a full WKT parser: every numeric token is
    /// collected and consecutive tokens are paired as (x, y). Returns `None`
    /// when the text contains no complete coordinate pair.
    pub fn from_wkt(wkt: &str) -> Option<Self> {
        let mut envelope: Option<Envelope> = None;
        let mut pending_x: Option<f64> = None;

        for token in wkt
            .split(|c: char| !(c.is_ascii_digit() || c == '.' || c == '-' || c == '+' || c == 'e' || c == 'E'))
            .filter(|t| !t.is_empty())
        {
            let Ok(value) = token.parse::<f64>() else {
                continue;
            };
            match pending_x.take() {
                Some(x) => {
                    let pt = Envelope::point(x, value);
                    match envelope.as_mut() {
                        Some(env) => env.merge(&pt),
                        None => envelope = Some(pt),
                    }
                }
                None => pending_x = Some(value),
            }
        }

        envelope.map(|envelope| Self {
            wkt: wkt.to_string(),
            envelope,
        })
    }

    /// The WKT payload.
    pub fn wkt(&self) -> &str {
        &self.wkt
    }

    /// The precomputed envelope.
    pub fn envelope(&self) -> Envelope {
        self.envelope
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_envelope_new_normalizes_bounds() {
        let env = Envelope::new(2.0, 3.0, 1.0, -1.0);
        assert_eq!(env.min_x, 1.0);
        assert_eq!(env.max_x, 2.0);
        assert_eq!(env.min_y, -1.0);
        assert_eq!(env.max_y, 3.0);
    }

    #[test]
    fn test_envelope_merge_grows_bounds() {
        let mut env = Envelope::point(0.0, 0.0);
        env.merge(&Envelope::point(2.0, -3.0));
        assert_eq!(env, Envelope::new(0.0, -3.0, 2.0, 0.0));
    }

    #[test]
    fn test_envelope_intersects_overlapping() {
        let a = Envelope::new(0.0, 0.0, 2.0, 2.0);
        let b = Envelope::new(1.0, 1.0, 3.0, 3.0);
        assert!(a.intersects(&b));
        assert!(b.intersects(&a));
    }

    #[test]
    fn test_envelope_intersects_shared_edge() {
        let a = Envelope::new(0.0, 0.0, 1.0, 1.0);
        let b = Envelope::new(1.0, 0.0, 2.0, 1.0);
        assert!(a.intersects(&b));
    }

    #[test]
    fn test_envelope_disjoint() {
        let a = Envelope::new(0.0, 0.0, 1.0, 1.0);
        let b = Envelope::new(5.0, 5.0, 6.0, 6.0);
        assert!(!a.intersects(&b));
    }

    #[test]
    fn test_expand_degenerate_x_only() {
        let mut env = Envelope::new(3.0, 0.0, 3.0, 10.0);
        env.expand_degenerate();
        assert_eq!(env.min_x, 2.0);
        assert_eq!(env.max_x, 4.0);
        assert_eq!(env.min_y, 0.0);
        assert_eq!(env.max_y, 10.0);
    }

    #[test]
    fn test_expand_degenerate_point() {
        let mut env = Envelope::point(1.0, 1.0);
        env.expand_degenerate();
        assert_eq!(env, Envelope::new(0.0, 0.0, 2.0, 2.0));
    }

    #[test]
    fn test_expand_non_degenerate_is_noop() {
        let mut env = Envelope::new(0.0, 0.0, 2.0, 2.0);
        env.expand_degenerate();
        assert_eq!(env, Envelope::new(0.0, 0.0, 2.0, 2.0));
    }

    #[test]
    fn test_geometry_point() {
        let geom = Geometry::point(1.5, -2.5);
        assert_eq!(geom.wkt(), "POINT (1.5 -2.5)");
        assert_eq!(geom.envelope(), Envelope::point(1.5, -2.5));
    }

    #[test]
    fn test_from_wkt_point() {
        let geom = Geometry::from_wkt("POINT (10 20)").expect("valid point");
        assert_eq!(geom.envelope(), Envelope::point(10.0, 20.0));
    }

    #[test]
    fn test_from_wkt_linestring_envelope() {
        let geom = Geometry::from_wkt("LINESTRING (0 0, 4 1, 2 -3)").expect("valid linestring");
        assert_eq!(geom.envelope(), Envelope::new(0.0, -3.0, 4.0, 1.0));
    }

    #[test]
    fn test_from_wkt_polygon_envelope() {
        let geom =
            Geometry::from_wkt("POLYGON ((0 0, 10 0, 10 10, 0 10, 0 0))").expect("valid polygon");
        assert_eq!(geom.envelope(), Envelope::new(0.0, 0.0, 10.0, 10.0));
    }

    #[test]
    fn test_from_wkt_garbage_returns_none() {
        assert!(Geometry::from_wkt("not a geometry").is_none());
        assert!(Geometry::from_wkt("").is_none());
    }

    #[test]
    fn test_from_wkt_negative_and_decimal_coords() {
        let geom = Geometry::from_wkt("POINT (-1.25 3.75)").expect("valid point");
        assert_eq!(geom.envelope(), Envelope::point(-1.25, 3.75));
    }
}
