//! # Environments, handles and kernel objects
//!
//! An environment ([`Env`]) is the unit of isolation: one user address
//! space, one handle namespace ([`KHandleTable`]) and the threads running
//! in it. Kernel objects ([`KObject`]) are reference counted and reachable
//! only through handles carrying [`Rights`].
//!
//! ```text
//!  Env ─┬─ VmemTree      declared ranges   (RwLock, writers revoke)
//!       ├─ commit Nbhm   page → frame      (lock-free, faults add)
//!       ├─ AddressSpace  hardware tables   (CAS per entry)
//!       └─ KHandleTable  handle → KObject  (lock-free, EBR retired)
//! ```
//!
//! Every lock-free structure here is read under an epoch
//! [`Guard`](kernel_nbhm::ebr::Guard) from the kernel's collector.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(unsafe_code)]

extern crate alloc;

mod env;
mod handle_table;
mod mailbox;
mod object;
mod rights;
mod vmem_tree;

#[cfg(test)]
mod test_support;

pub use env::{Env, EnvError, FaultError};
pub use handle_table::{Handle, HandleError, KHandleTable, SLOTS_PER_ENTRY};
pub use mailbox::{ANY_RECEIVER, MAILBOX_BYTES, Mailbox, MailboxError, Message};
pub use object::{EnvId, KObject, Vmo};
pub use rights::Rights;
pub use vmem_tree::{PageDesc, VmemFlags, VmemTree};
