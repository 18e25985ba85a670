//! # Resource Sample Library
//!
//! A blog and todo-list API assembled from the resource framework. Exposed
//! as a library so the end-to-end tests can drive the same wiring as the
//! demo binary.

pub mod definitions;
pub mod lifecycle;
pub mod model;
