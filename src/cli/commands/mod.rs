pub mod assistant;
pub mod read;
pub mod write;
