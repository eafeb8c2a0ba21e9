pub mod error;
pub mod rte;
