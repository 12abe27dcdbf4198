//! # xwire
//!
//! Async codec and dispatch layer for X11 protocol extensions.
//!
//! An extension is described once: its request structs, the replies they
//! decode to, and tables of the events and errors it can produce. The
//! shared [`Connection`] assigns sequence numbers, hands back [`Cookie`]s
//! for replies, and routes every incoming frame either to the cookie
//! waiting for it or, through the merged dispatch table, to the event and
//! error streams.
//!
//! ## Architecture
//!
//! - **Codec** (`protocol`): fixed-width integers in the negotiated byte
//!   order, padding, lists, and the 32-byte frame format
//! - **Messages** (`message`): request encoders and reply/event/error
//!   decoders
//! - **Dispatch** (`dispatch`): per-extension tables rebased onto the codes
//!   the server assigned
//! - **Connection**: writer task, read loop and pending cookies
//!
//! ## Example
//!
//! ```ignore
//! use xwire::ext::damage::Damage;
//! use xwire::Connection;
//!
//! #[tokio::main]
//! async fn main() -> xwire::Result<()> {
//!     let conn = Connection::builder().extension::<Damage>().connect().await?;
//!     let damage = Damage::new(&conn)?;
//!     let version = damage.query_version(1, 1).await?.reply().await?;
//!     println!("DAMAGE {}.{}", version.major_version, version.minor_version);
//!     Ok(())
//! }
//! ```

pub mod cookie;
pub mod dispatch;
pub mod error;
pub mod event;
pub mod ext;
pub mod message;
pub mod protocol;
pub mod transport;
pub mod writer;

mod connection;
mod id;

pub use connection::{Connection, ConnectionBuilder};
pub use cookie::{Cookie, VoidCookie};
pub use dispatch::SEQUENCE_WINDOW;
pub use error::{Result, WireError, XwireError};
pub use event::{Event, ProtocolError};
pub use id::IdAllocator;
