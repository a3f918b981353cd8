pub mod backend;
pub mod tail;
