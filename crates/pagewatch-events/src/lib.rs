//! Shared data model for the pagewatch mutation tracer.
//!
//! This crate defines the types that cross component boundaries: the
//! registration-side [`PageDescriptor`] with its tracking options, and the
//! event types that flow through the capture pipeline — the minimal
//! [`FastPathEvent`] built at fault time and the [`EnrichedEvent`] produced
//! by the enrichment stage (post-image, byte deltas, symbol information).
//!
//! Events serialize to JSON for text-interface sinks: addresses as hex
//! strings, byte payloads as base64, event ids as `"evt-<n>"`.
//!
//! ```
//! use pagewatch_events::{compute_deltas, Delta};
//!
//! let pre = [0u8; 8];
//! let mut post = [0u8; 8];
//! post[3] = 0xff;
//! post[4] = 0xfe;
//!
//! let deltas = compute_deltas(&pre, &post, post.len());
//! assert_eq!(deltas, vec![Delta { offset: 3, old: vec![0, 0], new: vec![0xff, 0xfe] }]);
//! ```

pub mod descriptor;
pub mod event;

pub use descriptor::{next_variable_id, MutationDepth, PageDescriptor, TrackFlags};
pub use event::{apply_deltas, compute_deltas, Delta, EnrichedEvent, FastPathEvent};
