//! # Thumbnailer
//!
//! Both halves of the isolated thumbnailing protocol: the framing codec,
//! the child-side probe/thumbnail logic run by `cutethumb`, and the parent
//! that spawns the child and classifies its result.

pub mod child;
#[cfg(feature = "documents")]
pub mod document;
pub mod framing;
pub mod probe;
pub mod process;
#[cfg(feature = "video")]
pub mod video;

pub use child::ChildOptions;
pub use process::ProcessThumbnailer;
