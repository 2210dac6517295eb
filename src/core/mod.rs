pub mod languages;
pub mod problem;
pub mod utils;
pub mod verdict;
