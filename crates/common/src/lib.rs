// coview-common: shared types and utilities for the coview workspace

pub mod protocol;
pub mod reconcile;
pub mod types;
