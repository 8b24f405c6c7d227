pub mod calendar;
pub mod color;
pub mod command;
pub mod config;
pub mod limits;
pub mod model;
pub mod notify;
pub mod observability;
pub mod persist;
pub mod schedule;
pub mod wire;
