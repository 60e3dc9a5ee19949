//! Shared types, errors, and configuration for the native index.
//!
//! This crate provides definitions used by every index component: the error
//! type, population and arena configuration, page format constants, and the
//! value domain that index keys encode.

pub mod config;
pub mod error;
pub mod page;
pub mod types;
pub mod value;

pub use config::{ArenaConfig, CurveSettings, PopulationConfig};
pub use error::{run_all, FaultKind, IndexError, Result};
pub use page::{FormatVersion, PageHeader, PageNum, PageType, MAX_ENTRY_SIZE, NO_PAGE, PAGE_SIZE};
pub use types::ValueGroup;
pub use value::{
    compare_values, ArrayValue, Crs, Date, Duration, LocalDateTime, LocalTime, Point, Value,
    ZonedDateTime, ZonedTime,
};
