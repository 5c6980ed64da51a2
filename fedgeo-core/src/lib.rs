//! Shared vocabulary for the fedgeo workspace: records held by silos, the
//! spatial predicates the coordinator evaluates, and loaders for the plain
//! text record, query and address files the binaries consume.
//!
//! # Quickstart
//! ```
//! use fedgeo_core::{Circle, Record};
//!
//! let circle = Circle::new(0.0, 0.0, 7.0);
//! assert!(circle.contains_record(&Record::new(0, 0.0, 0.0)));
//! assert!(!circle.contains_record(&Record::new(1, 10.0, 10.0)));
//! assert!(Record::dummy(-1.0e8, -1.0e8).is_dummy());
//! ```

pub mod geometry;
pub mod input;
pub mod types;

pub use geometry::{distance, squared_distance, Point};
pub use input::{load_addresses, load_queries, load_records, InputError};
pub use types::{
    BucketId, Circle, QueryKind, QueryShape, Record, Rectangle, SiloId, SpatialQuery, DUMMY_ID,
    RECORD_WIRE_BYTES,
};
