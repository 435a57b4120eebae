pub mod check;
pub mod probe;

pub use check::{JsonField, ResponseCheck, TrimmedOk};
pub use probe::{HealthProbe, HttpProbe};
