pub mod aggregate;
pub mod chunking;
pub mod scheduler;
