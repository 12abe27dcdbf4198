//! Dispatch module - extension registry and frame routing.
//!
//! Provides:
//! - [`Extension`] - static event and error tables an extension declares
//! - [`DispatchTableBuilder`] / [`DispatchTable`] - merged tables keyed by wire code
//! - [`Deliver`] - where events and out-of-band errors go

mod pending;
mod router;
mod table;

pub(crate) use router::{Dispatcher, RoutingState};
pub use router::{Deliver, SEQUENCE_WINDOW};
pub use table::{
    DispatchTable, DispatchTableBuilder, Entry, ErrorSpec, EventSpec, Extension, ExtensionInfo,
    ExtensionTables, MessageDecoder,
};
