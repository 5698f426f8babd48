pub mod pool;

pub use pool::{tx_id, TxId, TxPool, TxPoolConfig, TxPoolError};
