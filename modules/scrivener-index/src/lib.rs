pub mod store;

pub use store::{IndexStore, NewReference, UpsertOutcome};
