pub mod eal;
pub mod lcore;
