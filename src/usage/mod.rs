pub mod event;
pub mod validation;

pub use event::{Measure, UsageEvent, UNKNOWN_CONSUMER};
pub use validation::{
    validate, validate_shape, validate_timing, ValidationContext, ValidationMode,
};
