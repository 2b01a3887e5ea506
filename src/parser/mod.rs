pub mod line_map;
pub mod types;
pub mod yaml;
