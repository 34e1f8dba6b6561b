//! `kernos-middleware` – The Event Publisher
//!
//! Carries supervision events from the core to whoever is listening, without
//! caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – [`EventBus`], the shared publisher that fans events out to
//!   every attached [`EventSink`].
//! - [`journal`] – [`EventJournal`]: the append-only JSON-lines sink that
//!   backs `kernos watch`, and [`JournalReader`] for following it.

pub mod bus;
pub mod journal;

pub use bus::{EventBus, EventSink, MemorySink};
pub use journal::{EventJournal, JournalReader};
