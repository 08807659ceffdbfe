pub mod document;
pub mod meter;
pub mod month_key;
pub mod seed;

pub use document::MeterDocument;
pub use meter::{Meter, Reading};
pub use month_key::{MonthKey, MonthKeyError};
