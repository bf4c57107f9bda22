// Tandem - coordination primitives for services sharing one Redis
//
// This library lets several processes share state, take lease locks,
// hand out work through queues and broadcast events, all namespaced on
// a single store.

// Re-export the coordinator
pub use tandem_core::*;

// Re-export the building blocks
pub use tandem_lock;
pub use tandem_store;

// Prelude for common imports
pub mod prelude {
    pub use tandem_core::prelude::*;
}
