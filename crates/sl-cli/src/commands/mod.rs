//! Command implementations

pub(crate) mod common;
pub(crate) mod order;
pub(crate) mod run;
pub(crate) mod state;
