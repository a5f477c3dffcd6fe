// parley-common: shared types and wire protocol for the Parley workspace

pub mod protocol;
pub mod types;
