pub mod key_router;
pub mod replica;

pub use key_router::{KeyRouter, hash_index, rolling_hash};
pub use replica::{Operation, ReplicaSelector, Target};
