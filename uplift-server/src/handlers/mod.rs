pub mod objects;
pub mod ops;
pub mod uploads;
