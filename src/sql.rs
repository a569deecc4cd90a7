//! Identifier handling
//!
//! Every user-supplied identifier that ends up in SQL text goes through this module.
//! Catalog lookups bind identifiers as `$n` parameters instead; DDL cannot take parameters,
//! so it gets quoted identifiers built here and nowhere else.

use crate::error::GuardError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fmt;

/// PostgreSQL's NAMEDATALEN - 1
pub const MAX_IDENTIFIER_BYTES: usize = 63;

/// A validated SQL identifier
///
/// Any text is accepted as long as it could name a real object: non-empty, no NUL bytes and
/// within the identifier length limit. The value is opaque; it is never interpreted.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Ident(String);

impl Ident {
    pub fn new(name: impl Into<String>) -> Result<Self, GuardError> {
        let name = name.into();
        if name.is_empty() {
            return Err(GuardError::InvalidIdentifier("identifier is empty".to_string()));
        }
        if name.contains('\0') {
            return Err(GuardError::InvalidIdentifier(
                "identifier contains a NUL byte".to_string(),
            ));
        }
        if name.len() > MAX_IDENTIFIER_BYTES {
            return Err(GuardError::InvalidIdentifier(format!(
                "identifier exceeds {} bytes",
                MAX_IDENTIFIER_BYTES
            )));
        }
        Ok(Self(name))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Double-quoted form safe to splice into DDL
    pub fn quoted(&self) -> String {
        quote_ident(&self.0)
    }
}

impl TryFrom<String> for Ident {
    type Error = GuardError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Ident::new(value)
    }
}

impl From<Ident> for String {
    fn from(ident: Ident) -> Self {
        ident.0
    }
}

impl fmt::Display for Ident {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Schema-qualified table reference
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct TableRef {
    pub schema: Ident,
    pub name: Ident,
}

impl TableRef {
    pub fn new(schema: &str, name: &str) -> Result<Self, GuardError> {
        Ok(Self {
            schema: Ident::new(schema)?,
            name: Ident::new(name)?,
        })
    }

    /// Parse `schema.table` or bare `table` (defaults to `default_schema`)
    pub fn parse(path: &str, default_schema: &str) -> Result<Self, GuardError> {
        match path.split_once('.') {
            Some((schema, name)) => Self::new(schema, name),
            None => Self::new(default_schema, path),
        }
    }

    /// Same table name in another schema
    pub fn in_schema(&self, schema: &Ident) -> Self {
        Self {
            schema: schema.clone(),
            name: self.name.clone(),
        }
    }

    /// Same schema, different table name
    pub fn renamed(&self, name: &Ident) -> Self {
        Self {
            schema: self.schema.clone(),
            name: name.clone(),
        }
    }

    pub fn quoted(&self) -> String {
        format!("{}.{}", self.schema.quoted(), self.name.quoted())
    }

    pub fn key(&self) -> String {
        format!("{}.{}", self.schema, self.name)
    }
}

impl fmt::Display for TableRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.schema, self.name)
    }
}

/// Quote an identifier for PostgreSQL, doubling embedded quotes
pub fn quote_ident(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

/// Quote a comma-separated column list
pub fn quote_column_list<S: AsRef<str>>(columns: &[S]) -> String {
    columns
        .iter()
        .map(|c| quote_ident(c.as_ref()))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Deterministic, collision-resistant name for a side table created by a run
///
/// The hash covers every input so two runs against the same target never share a name.
pub fn side_table_name(prefix: &str, table: &TableRef, target: &str, run_id: &str) -> Ident {
    let mut hasher = Sha256::new();
    hasher.update(table.schema.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(table.name.as_str().as_bytes());
    hasher.update([0u8]);
    hasher.update(target.as_bytes());
    hasher.update([0u8]);
    hasher.update(run_id.as_bytes());
    let digest = format!("{:x}", hasher.finalize());
    let hash12 = &digest[..12];

    // prefix + '_' + '_' + hash12 must fit in the identifier limit
    let budget = MAX_IDENTIFIER_BYTES - prefix.len() - hash12.len() - 2;
    let mut stem: String = table
        .name
        .as_str()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect();
    stem.truncate(budget);

    Ident(format!("{}_{}_{}", prefix, stem, hash12))
}
