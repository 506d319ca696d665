#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! A lock-free, dynamically growable hash table.
//!
//! The table is built for hot paths where many threads insert, delete,
//! search, and iterate concurrently without ever taking a mutex. It combines
//! a wait-free segmented bucket directory, a hazard-pointer registry with
//! deferred batch reclamation, a lock-free free-list allocator, and a
//! split-ordered list that lets the bucket count double without rehashing a
//! single element.
//!
//! Every operation runs inside an accessor session obtained from
//! [`LfHash::pin`]. The session owns one pin record; the exclusive borrow it
//! demands is what keeps hazard bookkeeping sound without runtime checks.
//!
//! ```
//! use lfhash::{Insertion, LfHash, Removal, TableConfig};
//!
//! #[derive(Clone, Copy)]
//! #[repr(C)]
//! struct Pair {
//!     key: u64,
//!     val: u64,
//! }
//!
//! fn pair_key(pair: &Pair) -> &[u8] {
//!     let ptr = (&pair.key as *const u64).cast::<u8>();
//!     // SAFETY: a u64 is eight readable bytes.
//!     unsafe { std::slice::from_raw_parts(ptr, 8) }
//! }
//!
//! fn hash(key: &[u8]) -> u64 {
//!     let mut bytes = [0u8; 8];
//!     bytes.copy_from_slice(key);
//!     u64::from_le_bytes(bytes).wrapping_mul(0x9E37_79B9_7F4A_7C15)
//! }
//!
//! fn eq(a: &[u8], b: &[u8]) -> bool {
//!     a == b
//! }
//!
//! # fn main() -> Result<(), lfhash::Error> {
//! let table = LfHash::new(TableConfig::new(true, pair_key, hash, eq));
//! let mut pins = table.pin()?;
//!
//! assert_eq!(table.insert(&mut pins, &Pair { key: 1, val: 4 })?, Insertion::Inserted);
//! assert_eq!(table.insert(&mut pins, &Pair { key: 1, val: 5 })?, Insertion::Duplicate);
//!
//! let found = table.get(&mut pins, &1u64.to_le_bytes())?.expect("just inserted");
//! assert_eq!(found.val, 4);
//! drop(found);
//!
//! assert_eq!(table.remove(&mut pins, &1u64.to_le_bytes())?, Removal::Removed);
//! assert_eq!(table.remove(&mut pins, &1u64.to_le_bytes())?, Removal::NotFound);
//! # Ok(())
//! # }
//! ```
//!
//! A bounded MPMC ring buffer, the simpler companion primitive, lives in
//! [`mpmc`].

mod alloc;
mod dynarray;
mod error;
mod list;
mod map;
pub mod mpmc;
mod pin;

pub use error::Error;
pub use map::{EntryGuard, Insertion, Iteration, LfHash, Pins, Removal, TableConfig};
