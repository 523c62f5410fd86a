pub mod activation;
pub mod cond_norm;
pub mod utils;
