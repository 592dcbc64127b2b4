//! Volume/index layer: XML codec (C5) and generation manager (C6).
pub mod manager;
pub mod xml;
