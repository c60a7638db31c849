pub mod alerter;
pub mod exchange;
pub mod persistence;
