//! Storage backend implementations.
//!
//! Each backend module provides a concrete type that implements
//! [`crate::CsiIdentity`] and [`crate::CsiController`].

pub mod ics;
