//! hycache shared library.
//!
//! A two-tier filesystem: every call is served from a fast tier, and structural changes are
//! replayed onto a slow tier in the background.

/// Errors of filesystem calls and their errno mapping.
pub mod error;
/// The operation adapter and its FUSE front-end.
pub mod fs;
/// Host filesystem primitives behind the [`io::TierIo`] seam.
pub mod io;
/// Deferred mirroring of fast-tier changes onto the slow tier.
pub mod mirror;
/// Virtual paths and their resolution onto the two tiers.
pub mod tier;
/// Persistent queue of promotion and demotion candidates.
pub mod tiering;
