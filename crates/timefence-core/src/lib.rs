//! # timefence-core
//!
//! Tamper-resistant timekeeper for a block-window enforcement daemon.
//!
//! A block window is a time-bounded restriction on a user account: while
//! `remaining() > 0`, the surrounding daemon suppresses a configured set
//! of shells and administrative tools. This crate is the part that must
//! be correct for the whole system to have value:
//!
//! - **Debit accounting**: the remaining budget is debited against a
//!   monotonic clock, so administrative wall-clock changes cannot shorten
//!   the window.
//! - **Encrypted persistence**: state survives process death in a single
//!   AES-256-GCM blob that detects any bit-flip or truncation.
//! - **Startup handshake**: monotonic and wall elapsed times are
//!   cross-checked on every start; a discrepancy beyond tolerance locks
//!   the window.
//! - **Fail-secure locking**: on any doubt (corrupt blob, wrong
//!   passphrase, clock jump) debits freeze and budget changes are
//!   refused until the state file is externally removed.
//!
//! The OS-specific process blocking, the supervisor that relaunches the
//! daemon, and the installation CLI are separate adapters; they observe
//! `remaining`/`is_tampered` and subscribe to the event surface.
//!
//! ## Example
//!
//! ```rust,no_run
//! use secrecy::SecretString;
//! use timefence_core::keeper::{Keeper, KeeperConfig};
//!
//! # fn main() -> Result<(), timefence_core::keeper::KeeperError> {
//! let config = KeeperConfig::new("/var/lib/timefence/state.bin");
//! let passphrase = SecretString::from("from-secret-store".to_string());
//!
//! let keeper = Keeper::new(config, &passphrase)?;
//! keeper.on_tamper_detected(Box::new(|event| {
//!     eprintln!("window locked: {event:?}");
//! }));
//! keeper.initialize(3_600_000)?; // one hour
//!
//! if keeper.remaining() > 0 {
//!     // tell the blocking adapter to keep enforcing
//! }
//! keeper.dispose();
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod cipher;
pub mod clock;
pub mod events;
pub mod keeper;
pub mod state;
pub mod store;

/// Prelude module for convenient imports.
pub mod prelude {
    pub use crate::cipher::PassphraseCipher;
    pub use crate::clock::{ClockSource, SystemClock};
    pub use crate::events::{HeartbeatSaved, TamperDetected};
    pub use crate::keeper::{Keeper, KeeperConfig, KeeperError};
    pub use crate::store::{FileStore, StateStore};
}

/// Re-export commonly used types at the crate root.
pub use keeper::{Keeper, KeeperConfig, KeeperError};
pub use state::State;
