//! Rotating credential pool for completion services
//!
//! Holds the caller's credentials in load order, hands out the current one,
//! and skips credentials marked failed. When every credential has failed the
//! pool clears its failure set and starts over from the first one: failures
//! are assumed to be time-limited quota windows, not permanent revocations.
//!
//! Credential lifecycle:
//! 1. `CredentialPool::load` pulls rows for one owner from a `CredentialSource`
//! 2. Empty, header-like and disabled rows are dropped, duplicates collapsed
//! 3. Workers read `get_current()` before each completion call
//! 4. The retrying invoker rotates via `CredentialRotator` on quota or empty results
//! 5. Exhausting the pool resets it (no terminal failure state)

pub mod error;
pub mod pool;
pub mod source;

pub use error::{Error, Result};
pub use pool::{Credential, CredentialPool, PoolStatus, SourceStatus};
pub use source::{CredentialRow, CredentialSource, JsonFileSource, RestTableSource, filter_rows};
