pub mod files;
pub mod params;
pub mod progress;

pub use files::default_output;
pub use params::{parse_params, parse_variant};
