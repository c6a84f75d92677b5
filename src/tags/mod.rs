//! ctags index parsing and definition lookup.
//!
//! - **index**: parses a tags file into [`TagIndex`] (pseudo-tags filtered,
//!   line numbers told apart from search patterns)
//! - **resolve**: turns a [`Tag`] plus file text into a 0-based line

pub mod index;
pub mod resolve;

pub use index::{PatternKind, Tag, TagIndex, TagIndexError};
pub use resolve::resolve;
