// Copyright Materialize, Inc. and contributors. All rights reserved.
//
// Use of this software is governed by the Business Source License
// included in the LICENSE file.
//
// As of the Change Date specified in that file, in accordance with
// the Business Source License, use of this software will be governed
// by the Apache License, Version 2.0.

//! Translation of declarative column specs into DDL.
//!
//! A [`ColumnSpec`] is the caller's description of the non-id columns of a
//! watched table. It only exists to make `create_if_missing` convenient;
//! the synchronization engine itself never inspects column types.

use std::fmt;
use std::str::FromStr;

use crate::error::Error;

/// The closed set of field types a column spec may use.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    /// Arbitrary text.
    String,
    /// A double-precision float.
    Number,
    /// A 32-bit integer.
    Integer,
    /// A boolean.
    Boolean,
    /// A timestamp with time zone.
    Date,
    /// A reference to another row's id.
    Id,
}

impl FieldType {
    /// The SQL type used for columns of this field type.
    pub fn sql_type(&self) -> &'static str {
        match self {
            FieldType::String => "text",
            FieldType::Number => "double precision",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Date => "timestamp with time zone",
            FieldType::Id => "bigint",
        }
    }
}

impl FromStr for FieldType {
    type Err = Error;

    fn from_str(s: &str) -> Result<FieldType, Error> {
        match s {
            "string" => Ok(FieldType::String),
            "number" => Ok(FieldType::Number),
            "integer" => Ok(FieldType::Integer),
            "boolean" => Ok(FieldType::Boolean),
            "date" => Ok(FieldType::Date),
            "id" => Ok(FieldType::Id),
            other => Err(Error::config(format!(
                "unsupported field type {other:?}; expected one of \
                 string, number, integer, boolean, date, id"
            ))),
        }
    }
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::String => "string",
            FieldType::Number => "number",
            FieldType::Integer => "integer",
            FieldType::Boolean => "boolean",
            FieldType::Date => "date",
            FieldType::Id => "id",
        };
        f.write_str(name)
    }
}

/// An ordered field-name → [`FieldType`] map describing the non-id
/// columns of a table.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ColumnSpec {
    columns: Vec<(String, FieldType)>,
}

impl ColumnSpec {
    /// Creates an empty column spec.
    pub fn new() -> ColumnSpec {
        ColumnSpec::default()
    }

    /// Adds a column. Field names must be safe SQL identifiers since they
    /// are interpolated into DDL.
    pub fn field(mut self, name: &str, ty: FieldType) -> Result<ColumnSpec, Error> {
        if !is_safe_identifier(name) {
            return Err(Error::config(format!(
                "field name {name:?} is not a safe SQL identifier"
            )));
        }
        if name == "id" {
            return Err(Error::config(
                "the id column is implicit and cannot be respecified",
            ));
        }
        self.columns.push((name.to_owned(), ty));
        Ok(self)
    }

    /// Parses a spec from `name: type` pairs in textual form, e.g.
    /// `[("age", "integer"), ("name", "string")]`. Unknown type names are
    /// a configuration error.
    pub fn parse<'a, I>(pairs: I) -> Result<ColumnSpec, Error>
    where
        I: IntoIterator<Item = (&'a str, &'a str)>,
    {
        let mut spec = ColumnSpec::new();
        for (name, ty) in pairs {
            spec = spec.field(name, ty.parse()?)?;
        }
        Ok(spec)
    }

    /// Whether the spec names any columns.
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// Renders the column-definition list for a `CREATE TABLE` body,
    /// excluding the implicit id column.
    pub fn to_column_defs(&self) -> String {
        let defs: Vec<String> = self
            .columns
            .iter()
            .map(|(name, ty)| format!("{} {}", name, ty.sql_type()))
            .collect();
        defs.join(", ")
    }
}

/// Reports whether `name` can be interpolated into SQL without quoting.
///
/// Deliberately strict: lowercase identifiers only, the form Postgres
/// folds unquoted identifiers to anyway. The change-feed trigger builds
/// channel names by string concatenation on `TG_TABLE_NAME`, so quoted or
/// mixed-case table names would break notification routing.
pub(crate) fn is_safe_identifier(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_lowercase() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '_')
}
