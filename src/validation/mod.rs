pub mod compare;
pub mod params;
pub mod plausibility;
pub mod result;

pub use params::{ParameterValidator, ValidationResult};
pub use result::{ResultExpectation, ResultValidation, ResultValidator};
