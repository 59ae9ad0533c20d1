//! Working-Dir Lock Registry (§4.4).

pub mod registry;
