//! Typed attribute values and the per-collection attribute schema.
//!
//! Features store their attributes positionally: the value at index `i`
//! belongs to `schema.fields[i]`. Name lookups go through
//! [`Schema::index_of`] once per collection instead of once per feature.

use std::fmt;

use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};

/// The declared type of an attribute column.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    Display,
    EnumString,
    AsRefStr,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FieldType {
    /// `true` / `false`.
    Bool,
    /// Whole numbers.
    Integer,
    /// Floating-point numbers.
    Float,
    /// Free text.
    Text,
    /// Calendar dates (no time of day).
    Date,
    /// Every value seen so far was null, so the type is not yet known.
    Unknown,
}

impl FieldType {
    /// Returns `true` if columns of type `self` and `other` can be stored
    /// in the same schema slot.
    ///
    /// [`FieldType::Unknown`] is compatible with everything, and integers
    /// widen to floats.
    #[must_use]
    pub fn is_compatible_with(self, other: Self) -> bool {
        self == other
            || self == Self::Unknown
            || other == Self::Unknown
            || matches!(
                (self, other),
                (Self::Integer, Self::Float) | (Self::Float, Self::Integer)
            )
    }

    /// Returns the more specific of two compatible types.
    #[must_use]
    pub fn refine(self, other: Self) -> Self {
        match (self, other) {
            (Self::Unknown, t) | (t, Self::Unknown) => t,
            (Self::Integer, Self::Float) | (Self::Float, Self::Integer) => Self::Float,
            (t, _) => t,
        }
    }
}

/// A single attribute value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum AttributeValue {
    /// Missing value.
    Null,
    /// Boolean value.
    Bool(bool),
    /// Integer value.
    Integer(i64),
    /// Floating-point value.
    Float(f64),
    /// Text value.
    Text(String),
    /// Calendar date.
    Date(NaiveDate),
}

impl AttributeValue {
    /// Returns the [`FieldType`] this value belongs to.
    #[must_use]
    pub const fn field_type(&self) -> FieldType {
        match self {
            Self::Null => FieldType::Unknown,
            Self::Bool(_) => FieldType::Bool,
            Self::Integer(_) => FieldType::Integer,
            Self::Float(_) => FieldType::Float,
            Self::Text(_) => FieldType::Text,
            Self::Date(_) => FieldType::Date,
        }
    }

    /// Returns `true` for [`AttributeValue::Null`].
    #[must_use]
    pub const fn is_null(&self) -> bool {
        matches!(self, Self::Null)
    }

    /// Returns the value as `f64` when it is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub const fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Returns the text content of a [`AttributeValue::Text`].
    #[must_use]
    pub fn as_str(&self) -> Option<&str> {
        match self {
            Self::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Returns the date of a [`AttributeValue::Date`].
    #[must_use]
    pub const fn as_date(&self) -> Option<NaiveDate> {
        match self {
            Self::Date(d) => Some(*d),
            _ => None,
        }
    }

    /// Parses the date forms feature services emit for date columns.
    ///
    /// Accepts `2021-08-01`, `2021-08-01Z` and full timestamps such as
    /// `2021-08-01T00:00:00Z` or `2021-08-01 13:45:00` (time is dropped).
    #[must_use]
    pub fn parse_date(raw: &str) -> Option<NaiveDate> {
        let trimmed = raw.trim();
        if trimmed.len() < 10 || !trimmed.is_char_boundary(10) {
            return None;
        }
        let (date_part, rest) = trimmed.split_at(10);
        if !(rest.is_empty()
            || rest == "Z"
            || rest.starts_with('T')
            || rest.starts_with(' ')
            || rest.starts_with('+'))
        {
            return None;
        }
        NaiveDate::parse_from_str(date_part, "%Y-%m-%d").ok()
    }
}

impl fmt::Display for AttributeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Null => Ok(()),
            Self::Bool(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::Text(s) => f.write_str(s),
            Self::Date(d) => write!(f, "{}", d.format("%Y-%m-%d")),
        }
    }
}

/// A named, typed attribute column.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    /// Column name as reported by the service.
    pub name: String,
    /// Column type.
    pub field_type: FieldType,
}

impl FieldDef {
    /// Creates a new field definition.
    #[must_use]
    pub fn new(name: impl Into<String>, field_type: FieldType) -> Self {
        Self {
            name: name.into(),
            field_type,
        }
    }
}

/// Why two schemas cannot be aligned.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchemaMismatch {
    /// A field of the base schema is absent from the other schema.
    MissingField(String),
    /// The other schema has a field the base schema does not.
    ExtraField(String),
    /// Both schemas have the field but with incompatible types.
    TypeConflict {
        /// Field name.
        field: String,
        /// Type in the base schema.
        expected: FieldType,
        /// Type in the other schema.
        found: FieldType,
    },
}

impl fmt::Display for SchemaMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MissingField(name) => write!(f, "field \"{name}\" is missing"),
            Self::ExtraField(name) => write!(f, "unexpected field \"{name}\""),
            Self::TypeConflict {
                field,
                expected,
                found,
            } => write!(f, "field \"{field}\" is {found}, expected {expected}"),
        }
    }
}

impl std::error::Error for SchemaMismatch {}

/// Ordered list of attribute columns shared by every feature of a
/// collection.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Schema {
    /// Column definitions, in storage order.
    pub fields: Vec<FieldDef>,
}

impl Schema {
    /// Creates a schema from column definitions.
    #[must_use]
    pub const fn new(fields: Vec<FieldDef>) -> Self {
        Self { fields }
    }

    /// Number of columns.
    #[must_use]
    pub fn len(&self) -> usize {
        self.fields.len()
    }

    /// Returns `true` if the schema has no columns.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    /// Returns the storage index of the named column.
    #[must_use]
    pub fn index_of(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    /// Returns the named column definition.
    #[must_use]
    pub fn field(&self, name: &str) -> Option<&FieldDef> {
        self.fields.iter().find(|f| f.name == name)
    }

    /// Iterates over column names in storage order.
    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.name.as_str())
    }

    /// Computes how to read a row stored under `other` in this schema's
    /// column order.
    ///
    /// The returned vector holds, for each column of `self`, the index of
    /// the same column in `other`. Both schemas must contain exactly the
    /// same column names with compatible types.
    ///
    /// # Errors
    ///
    /// Returns the first [`SchemaMismatch`] found.
    pub fn align(&self, other: &Self) -> Result<Vec<usize>, SchemaMismatch> {
        let mut mapping = Vec::with_capacity(self.fields.len());
        for field in &self.fields {
            let idx = other
                .index_of(&field.name)
                .ok_or_else(|| SchemaMismatch::MissingField(field.name.clone()))?;
            let found = other.fields[idx].field_type;
            if !field.field_type.is_compatible_with(found) {
                return Err(SchemaMismatch::TypeConflict {
                    field: field.name.clone(),
                    expected: field.field_type,
                    found,
                });
            }
            mapping.push(idx);
        }
        if let Some(extra) = other.fields.iter().find(|f| self.index_of(&f.name).is_none()) {
            return Err(SchemaMismatch::ExtraField(extra.name.clone()));
        }
        Ok(mapping)
    }

    /// Refines [`FieldType::Unknown`] (and integer → float widening) using
    /// the types of an aligned schema.
    pub fn refine_from(&mut self, other: &Self, mapping: &[usize]) {
        for (field, &idx) in self.fields.iter_mut().zip(mapping) {
            field.field_type = field.field_type.refine(other.fields[idx].field_type);
        }
    }

    /// Returns a schema holding every column of `self` followed by the
    /// columns of `other` that `self` lacks.
    ///
    /// # Errors
    ///
    /// Returns [`SchemaMismatch::TypeConflict`] if a shared column has
    /// incompatible types.
    pub fn union(&self, other: &Self) -> Result<Self, SchemaMismatch> {
        let mut merged = self.clone();
        for field in &other.fields {
            match merged.fields.iter_mut().find(|f| f.name == field.name) {
                Some(existing) => {
                    if !existing.field_type.is_compatible_with(field.field_type) {
                        return Err(SchemaMismatch::TypeConflict {
                            field: field.name.clone(),
                            expected: existing.field_type,
                            found: field.field_type,
                        });
                    }
                    existing.field_type = existing.field_type.refine(field.field_type);
                }
                None => merged.fields.push(field.clone()),
            }
        }
        Ok(merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schema(fields: &[(&str, FieldType)]) -> Schema {
        Schema::new(
            fields
                .iter()
                .map(|(name, ty)| FieldDef::new(*name, *ty))
                .collect(),
        )
    }

    #[test]
    fn parses_service_date_forms() {
        let expected = NaiveDate::from_ymd_opt(2021, 8, 1);
        assert_eq!(AttributeValue::parse_date("2021-08-01"), expected);
        assert_eq!(AttributeValue::parse_date("2021-08-01Z"), expected);
        assert_eq!(AttributeValue::parse_date("2021-08-01T10:00:00Z"), expected);
        assert_eq!(AttributeValue::parse_date("2021-08-01 10:00:00"), expected);
        assert_eq!(AttributeValue::parse_date("2021-08-01abc"), None);
        assert_eq!(AttributeValue::parse_date("cerrado"), None);
    }

    #[test]
    fn align_reorders_by_name() {
        let base = schema(&[("a", FieldType::Text), ("b", FieldType::Integer)]);
        let other = schema(&[("b", FieldType::Integer), ("a", FieldType::Text)]);
        assert_eq!(base.align(&other), Ok(vec![1, 0]));
    }

    #[test]
    fn align_rejects_missing_and_extra_fields() {
        let base = schema(&[("a", FieldType::Text), ("b", FieldType::Integer)]);
        let missing = schema(&[("a", FieldType::Text)]);
        assert_eq!(
            base.align(&missing),
            Err(SchemaMismatch::MissingField("b".to_string()))
        );

        let extra = schema(&[
            ("a", FieldType::Text),
            ("b", FieldType::Integer),
            ("c", FieldType::Bool),
        ]);
        assert_eq!(
            base.align(&extra),
            Err(SchemaMismatch::ExtraField("c".to_string()))
        );
    }

    #[test]
    fn unknown_is_compatible_and_refined() {
        let mut base = schema(&[("a", FieldType::Unknown), ("n", FieldType::Integer)]);
        let other = schema(&[("a", FieldType::Date), ("n", FieldType::Float)]);
        let mapping = base.align(&other).unwrap();
        base.refine_from(&other, &mapping);
        assert_eq!(base.fields[0].field_type, FieldType::Date);
        assert_eq!(base.fields[1].field_type, FieldType::Float);
    }

    #[test]
    fn type_conflict_is_reported() {
        let base = schema(&[("a", FieldType::Text)]);
        let other = schema(&[("a", FieldType::Date)]);
        assert!(matches!(
            base.align(&other),
            Err(SchemaMismatch::TypeConflict { .. })
        ));
    }

    #[test]
    fn union_appends_missing_columns() {
        let a = schema(&[("a", FieldType::Text)]);
        let b = schema(&[("b", FieldType::Integer), ("a", FieldType::Unknown)]);
        let merged = a.union(&b).unwrap();
        assert_eq!(merged.names().collect::<Vec<_>>(), vec!["a", "b"]);
    }
}
