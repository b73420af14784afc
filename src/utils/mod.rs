pub mod lazy_rw_lock;
pub mod parallel;

pub use parallel::{partition, Delivery, ParallelMapper};
