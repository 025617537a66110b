//! Repositories

pub mod credits;
