//! Unistore search: an in-memory resource index kept current from the backend's
//! watch stream, with a flat search view over it.

#![forbid(unsafe_code)]

pub mod document;
mod index;
mod source;
mod view;

pub use document::{Applied, DocSet, IndexDocument};
pub use index::{parse_scopes, IndexOptions, IndexState, ResourceIndex};
pub use source::ResourceSource;
pub use view::{SearchDebugInfo, SearchHit, SearchRequest, SearchResponse, SearchView};
