//! Chain state: block index, UTXO ledger, chain selection and block production.

pub mod checkpoints;
pub mod connect;
pub mod filemeta;
pub mod flatfiles;
pub mod import;
pub mod index;
pub mod mempool;
pub mod minter;
pub mod notify;
pub mod orphans;
pub mod state;
pub mod undo;
pub mod utxo;
pub mod validation;
pub mod verify;

pub use notify::{ChainEvent, ChainListener};
pub use state::{
    Acceptance, AcceptanceResult, ChainState, ChainStateConfig, ChainStateError, Rejection,
};
pub use validation::RejectKind;
