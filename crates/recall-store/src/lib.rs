//! recall-store - durable signature storage.

pub mod cipher;
pub mod sqlite;

pub use cipher::{CipherError, EmbeddingCipher};
pub use sqlite::SqliteSignatureStore;
