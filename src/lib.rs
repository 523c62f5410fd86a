pub mod burn_ext;
pub mod dataset;
pub mod image_data;
pub mod inference;
pub mod model;
pub mod parse_config;
pub mod training;
pub mod utils;
