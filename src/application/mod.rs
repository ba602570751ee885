//! Collaborator contracts consumed by the cache.

pub mod repos;
