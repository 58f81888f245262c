pub mod correlation;
pub mod handle;
pub mod protocol;
pub(crate) mod unit;
