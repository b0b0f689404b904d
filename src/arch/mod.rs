pub mod bounds;
pub mod mem;
