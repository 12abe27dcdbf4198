//! Extension modules.
//!
//! Each module defines one extension's requests, replies, events and
//! errors, implements [`Extension`](crate::dispatch::Extension) for its
//! façade, and adds async methods that send through a
//! [`Connection`](crate::Connection).

pub mod damage;
pub mod xc_misc;
