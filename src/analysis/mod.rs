//! Dependency discovery
//!
//! - `dependency`: every object referencing a column or table, with an impact level
//! - `foreign_key`: delete-action and live-row impact of incoming foreign keys
//! - `references`: best-effort identifier scanning for bodies the catalog does not track

pub mod dependency;
pub mod foreign_key;
pub mod references;

pub use dependency::{
    Dependency, DependencyAnalyzer, DependencyDetail, DependencyKind, DependencyReport,
    Detection, FkDirection, MAX_VIEW_DEPTH,
};
pub use foreign_key::{FkImpact, FkImpactReport, ForeignKeyImpactAnalyzer};
