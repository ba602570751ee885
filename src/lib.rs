//! Published-content snapshot cache.
//!
//! Readers pin an immutable generation of the document or media tree and
//! never block writers. Trees are seeded from a local fast-restart store or
//! the primary content source, kept current by cache refreshers, and kept in
//! step across a farm of servers by the server messenger.
//!
//! `cache::CacheContext` is the entry point: build it from `config::Settings`
//! and the external collaborators, then `start` it.

pub mod application;
pub mod cache;
pub mod config;
pub mod domain;
pub mod infra;
