//! Feature records: typed attribute values plus optional geometry.

use crate::geometry::{Envelope, Geometry};
use chrono::{NaiveDate, NaiveDateTime, NaiveTime};

/// Feature identifier: a stable 64-bit key within one store.
///
/// Negative values mean "not assigned"; providers either supply stable FIDs
/// or the cache synthesizes sequential ones during a scan.
pub type Fid = i64;

/// Sentinel FID carried by records that were never found.
pub const FID_NONE: Fid = -1;

/// One typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Int(i64),
    Real(f64),
    Str(String),
    Date(NaiveDate),
    Time(NaiveTime),
    DateTime(NaiveDateTime),
    IntList(Vec<i64>),
    RealList(Vec<f64>),
    StrList(Vec<String>),
}

/// How raw attribute bytes are decoded into text by the data access layer.
///
/// The cache never decodes lazily: changing the encoding invalidates the
/// cached mapping and forces a full re-scan.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Encoding {
    #[default]
    Utf8,
    Latin1,
}

/// One record in a vector data source.
///
/// Records are owned by value: the cache holds its own copy and callers get
/// clones. A record can be *not ok* — the sentinel returned by lookups for
/// an identifier the store does not have.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRecord {
    fid: Fid,
    fields: Vec<FieldValue>,
    geometry: Option<Geometry>,
    style: Option<String>,
    ok: bool,
}

impl FeatureRecord {
    /// Create a valid record with the given identifier.
    pub fn new(fid: Fid) -> Self {
        Self {
            fid,
            fields: Vec::new(),
            geometry: None,
            style: None,
            ok: true,
        }
    }

    /// The sentinel record returned for missing identifiers.
    pub fn not_found() -> Self {
        Self {
            fid: FID_NONE,
            fields: Vec::new(),
            geometry: None,
            style: None,
            ok: false,
        }
    }

    /// Append a field value (builder style).
    pub fn with_field(mut self, value: FieldValue) -> Self {
        self.fields.push(value);
        self
    }

    /// Attach a geometry (builder style).
    pub fn with_geometry(mut self, geometry: Geometry) -> Self {
        self.geometry = Some(geometry);
        self
    }

    /// Attach a style string (builder style).
    pub fn with_style(mut self, style: impl Into<String>) -> Self {
        self.style = Some(style.into());
        self
    }

    /// Whether this is a live record (false for the not-found sentinel).
    pub fn is_ok(&self) -> bool {
        self.ok
    }

    pub fn fid(&self) -> Fid {
        self.fid
    }

    /// Overwrite the identifier; used when the cache synthesizes FIDs and
    /// when a remote store assigns one on create.
    pub fn set_fid(&mut self, fid: Fid) {
        self.fid = fid;
    }

    pub fn fields(&self) -> &[FieldValue] {
        &self.fields
    }

    pub fn field(&self, index: usize) -> Option<&FieldValue> {
        self.fields.get(index)
    }

    pub fn geometry(&self) -> Option<&Geometry> {
        self.geometry.as_ref()
    }

    pub fn style(&self) -> Option<&str> {
        self.style.as_deref()
    }

    /// Envelope of the record's geometry, if it has one.
    pub fn envelope(&self) -> Option<Envelope> {
        self.geometry.as_ref().map(|g| g.envelope())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_builder() {
        let record = FeatureRecord::new(7)
            .with_field(FieldValue::Int(42))
            .with_field(FieldValue::Str("road".to_string()))
            .with_geometry(Geometry::point(1.0, 2.0))
            .with_style("highway");

        assert!(record.is_ok());
        assert_eq!(record.fid(), 7);
        assert_eq!(record.fields().len(), 2);
        assert_eq!(record.field(0), Some(&FieldValue::Int(42)));
        assert_eq!(record.style(), Some("highway"));
        assert_eq!(record.envelope(), Some(Envelope::point(1.0, 2.0)));
    }

    #[test]
    fn test_not_found_sentinel() {
        let record = FeatureRecord::not_found();
        assert!(!record.is_ok());
        assert_eq!(record.fid(), FID_NONE);
        assert!(record.geometry().is_none());
    }

    #[test]
    fn test_record_without_geometry_has_no_envelope() {
        let record = FeatureRecord::new(1).with_field(FieldValue::Null);
        assert_eq!(record.envelope(), None);
    }

    #[test]
    fn test_set_fid() {
        let mut record = FeatureRecord::new(FID_NONE);
        record.set_fid(3);
        assert_eq!(record.fid(), 3);
    }

    #[test]
    fn test_encoding_default_is_utf8() {
        assert_eq!(Encoding::default(), Encoding::Utf8);
    }
}
