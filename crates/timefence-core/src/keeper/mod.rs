//! The block-window state machine.
//!
//! The keeper owns the persisted [`State`], debits the remaining budget
//! against monotonic elapsed time, and refuses to keep counting when
//! integrity is in doubt. It is the policy brain of the daemon; the
//! process-blocking adapters only read `remaining`/`is_tampered` and call
//! the operations here.
//!
//! # Startup handshake
//!
//! On load of a prior state the keeper compares two independently derived
//! elapsed times: the monotonic delta (which an operator cannot move, but
//! which resets across reboots) and the wall-clock delta (which tracks
//! administrative time changes). After an ordinary restart the two agree
//! within tolerance; after a reboot the monotonic delta collapses to zero
//! and the wall delta reflects real downtime, which a benign reboot keeps
//! small. A wall clock pushed forward by hours, or pulled backwards at
//! all, produces a discrepancy far beyond tolerance and locks the window.
//!
//! # States
//!
//! ```text
//!         ┌──── initialize (no prior file) ─────► FRESH ───┐
//!   (pre-init) ─ initialize (bad blob) ─────────► LOCKED ──┤
//!         └──── initialize (good blob, no jump) ► RUNNING ─┤
//!               initialize (good blob, jump) ───► LOCKED   │
//!                                                          │
//!   FRESH/RUNNING ── set_budget / debit ──► FRESH/RUNNING  │
//!   LOCKED ── set_budget ──► error, remains LOCKED         │
//!   LOCKED ── debit ──► no-op, remains LOCKED              │
//!   any ── dispose ──► terminal (final persist) ◄──────────┘
//! ```
//!
//! LOCKED is sticky for the lifetime of the state file; only external
//! deletion of the file returns the system to FRESH.

// Mutex poisoning indicates a panic in another thread, which is
// unrecoverable.
#![allow(clippy::missing_panics_doc)]

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::Duration;

use secrecy::SecretString;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::cipher::{CipherError, PassphraseCipher};
use crate::clock::{ClockError, ClockSource, SystemClock, WALL_TICKS_PER_MS};
use crate::events::{
    EventSubscribers, HeartbeatCallback, HeartbeatSaved, TamperCallback, TamperDetected,
};
use crate::state::{CodecError, State, decode_state, encode_state};
use crate::store::{FileStore, StateStore, StoreError};

// =============================================================================
// Constants
// =============================================================================

/// Default maximum permitted discrepancy between wall and monotonic
/// elapsed time across a restart.
pub const DEFAULT_TOLERANCE: Duration = Duration::from_secs(30);

/// Smallest accepted tolerance; anything tighter trips on ordinary NTP
/// step corrections after a reboot.
pub const MIN_TOLERANCE: Duration = Duration::from_secs(5);

/// Largest accepted tolerance; anything looser stops catching short
/// forward pushes of the wall clock.
pub const MAX_TOLERANCE: Duration = Duration::from_secs(60);

/// Default heartbeat period. The worst-case accounting loss after an
/// abrupt kill is bounded by this period.
pub const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(10);

/// Smallest accepted heartbeat period.
pub const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(1);

/// Largest accepted heartbeat period.
pub const MAX_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(60);

/// Slice at which the heartbeat thread polls its stop flag, so `dispose`
/// never waits a full heartbeat period.
const STOP_POLL_SLICE: Duration = Duration::from_millis(100);

// =============================================================================
// Error Types
// =============================================================================

/// Errors surfaced by keeper operations.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum KeeperError {
    /// A configuration value is outside its accepted range.
    #[error("invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// An operation was called before `initialize`.
    #[error("keeper has not been initialized")]
    NotInitialized,

    /// `initialize` was called a second time on the same instance.
    #[error("keeper is already initialized")]
    AlreadyInitialized,

    /// `set_budget` was called while the window is locked.
    #[error("budget change refused while tampered")]
    RefusedWhileTampered,

    /// The state store is unavailable. Persist failures are retried on
    /// the next heartbeat; the in-memory state stays authoritative.
    #[error("state store unavailable: {0}")]
    StoreUnavailable(#[from] StoreError),

    /// No monotonic clock could be constructed. Fatal: the daemon must
    /// not run with a single clock.
    #[error("clock source unavailable: {0}")]
    ClockUnavailable(#[from] ClockError),
}

/// Internal persist pipeline failure: encode, encrypt, or write.
#[derive(Debug, Error)]
enum PersistError {
    #[error(transparent)]
    Codec(#[from] CodecError),

    #[error("state encryption failed: {0}")]
    Cipher(#[from] CipherError),

    #[error(transparent)]
    Store(#[from] StoreError),
}

// =============================================================================
// KeeperConfig
// =============================================================================

/// Configuration for a [`Keeper`].
#[derive(Debug, Clone)]
pub struct KeeperConfig {
    /// Path of the encrypted state file.
    pub state_path: PathBuf,

    /// Maximum permitted wall/monotonic discrepancy across a restart.
    pub tolerance: Duration,

    /// Period of the debit-and-persist heartbeat.
    pub heartbeat_interval: Duration,
}

impl KeeperConfig {
    /// Creates a configuration with default tolerance and heartbeat
    /// period.
    #[must_use]
    pub fn new(state_path: impl Into<PathBuf>) -> Self {
        Self {
            state_path: state_path.into(),
            tolerance: DEFAULT_TOLERANCE,
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
        }
    }

    /// Sets the handshake tolerance.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::InvalidConfiguration`] if the tolerance is
    /// outside `[MIN_TOLERANCE, MAX_TOLERANCE]`.
    pub fn with_tolerance(mut self, tolerance: Duration) -> Result<Self, KeeperError> {
        if !(MIN_TOLERANCE..=MAX_TOLERANCE).contains(&tolerance) {
            return Err(KeeperError::InvalidConfiguration(format!(
                "tolerance {tolerance:?} outside [{MIN_TOLERANCE:?}, {MAX_TOLERANCE:?}]"
            )));
        }
        self.tolerance = tolerance;
        Ok(self)
    }

    /// Sets the heartbeat period.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::InvalidConfiguration`] if the period is
    /// outside `[MIN_HEARTBEAT_INTERVAL, MAX_HEARTBEAT_INTERVAL]`.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Result<Self, KeeperError> {
        if !(MIN_HEARTBEAT_INTERVAL..=MAX_HEARTBEAT_INTERVAL).contains(&interval) {
            return Err(KeeperError::InvalidConfiguration(format!(
                "heartbeat interval {interval:?} outside \
                 [{MIN_HEARTBEAT_INTERVAL:?}, {MAX_HEARTBEAT_INTERVAL:?}]"
            )));
        }
        self.heartbeat_interval = interval;
        Ok(self)
    }

    fn tolerance_ms(&self) -> u64 {
        u64::try_from(self.tolerance.as_millis()).unwrap_or(u64::MAX)
    }
}

// =============================================================================
// Handshake
// =============================================================================

/// Cross-checks the two clocks against a prior state and applies the
/// tamper policy.
///
/// Returns the updated state and, when the locked state was entered, the
/// event to emit. Clock stamps are not refreshed here; the subsequent
/// persist does that.
fn run_handshake(
    prior: State,
    mono_now: i64,
    wall_now: i64,
    frequency: u64,
    tolerance_ms: u64,
) -> (State, Option<TamperDetected>) {
    // A previously locked file stays locked; the event already fired when
    // the lock was first entered, and remaining must not move.
    if prior.tampered {
        return (prior, None);
    }

    let mono_delta = i128::from(mono_now) - i128::from(prior.last_mono_ticks);
    let mono_elapsed_ms =
        u64::try_from((mono_delta * 1000 / i128::from(frequency)).max(0)).unwrap_or(u64::MAX);

    let wall_elapsed_ms = (wall_now - prior.last_wall_ticks) / WALL_TICKS_PER_MS;

    let discrepancy_ms = u64::try_from(
        (i128::from(wall_elapsed_ms) - i128::from(mono_elapsed_ms)).unsigned_abs(),
    )
    .unwrap_or(u64::MAX);

    let mut state = prior;
    if discrepancy_ms > tolerance_ms {
        state.tampered = true;
        let event = TamperDetected::clock_jump(mono_elapsed_ms, wall_elapsed_ms, discrepancy_ms);
        (state, Some(event))
    } else {
        state.remaining_ms = state.remaining_ms.saturating_sub(mono_elapsed_ms);
        (state, None)
    }
}

// =============================================================================
// Keeper
// =============================================================================

/// In-memory session: the owned state plus the monotonic anchor the next
/// debit measures from.
struct Session {
    state: State,
    anchor_ticks: i64,
}

/// Shared interior: everything the heartbeat thread needs.
struct KeeperInner {
    config: KeeperConfig,
    clock: Box<dyn ClockSource>,
    cipher: PassphraseCipher,
    store: Box<dyn StateStore>,
    session: Mutex<Option<Session>>,
    subscribers: Mutex<EventSubscribers>,
}

impl KeeperInner {
    /// Debits monotonic elapsed time since the session anchor. No-op when
    /// locked.
    fn debit_session(&self, session: &mut Session) {
        if session.state.tampered {
            return;
        }

        let now = self.clock.mono_now();
        let frequency = i128::from(self.clock.mono_frequency());
        let delta = (i128::from(now) - i128::from(session.anchor_ticks)).max(0);
        let elapsed_ms = u64::try_from(delta * 1000 / frequency).unwrap_or(u64::MAX);
        if elapsed_ms == 0 {
            return;
        }

        session.state.remaining_ms = session.state.remaining_ms.saturating_sub(elapsed_ms);
        // Advance the anchor by whole consumed ticks so sub-millisecond
        // remainders carry over to the next debit.
        let consumed_ticks = i128::from(elapsed_ms) * frequency / 1000;
        session.anchor_ticks = session
            .anchor_ticks
            .saturating_add(i64::try_from(consumed_ticks).unwrap_or(i64::MAX));
    }

    /// Refreshes the clock stamps, bumps the persist counter, and writes
    /// the encrypted blob.
    fn persist_session(&self, session: &mut Session) -> Result<(), PersistError> {
        session.state.last_mono_ticks = self.clock.mono_now();
        session.state.last_wall_ticks = self.clock.wall_now();
        session.state.mono_frequency = self.clock.mono_frequency();
        session.state.heartbeat_count += 1;

        let plaintext = encode_state(&session.state)?;
        let blob = self.cipher.encrypt(&plaintext)?;
        self.store.save(&blob)?;
        Ok(())
    }

    /// One heartbeat: debit, persist, notify. Failures are logged and
    /// never propagate; the in-memory state stays authoritative until a
    /// later persist succeeds.
    fn heartbeat_tick(&self) {
        let event = {
            let mut guard = self.session.lock().unwrap();
            let Some(session) = guard.as_mut() else {
                return;
            };
            self.debit_session(session);
            match self.persist_session(session) {
                Ok(()) => Some(HeartbeatSaved {
                    remaining_ms: session.state.remaining_ms,
                    heartbeat_count: session.state.heartbeat_count,
                }),
                Err(e) => {
                    warn!(error = %e, "heartbeat persist failed; retrying on next tick");
                    None
                },
            }
        };

        if let Some(event) = event {
            debug!(
                remaining_ms = event.remaining_ms,
                heartbeat_count = event.heartbeat_count,
                "heartbeat saved"
            );
            self.subscribers.lock().unwrap().notify_heartbeat(&event);
        }
    }

    fn decrypt_and_decode(&self, blob: &[u8]) -> Result<State, String> {
        let plaintext = self.cipher.decrypt(blob).map_err(|e| e.to_string())?;
        decode_state(&plaintext).map_err(|e| e.to_string())
    }
}

/// Handle of the running heartbeat thread.
struct HeartbeatHandle {
    stop: Arc<AtomicBool>,
    handle: JoinHandle<()>,
}

/// The tamper-resistant block-window keeper.
///
/// Construct with [`Keeper::new`] (production collaborators) or
/// [`Keeper::with_parts`] (injected seams), register event callbacks,
/// then call [`Keeper::initialize`] exactly once. The heartbeat starts
/// after a successful `initialize` and stops on [`Keeper::dispose`] or
/// drop.
pub struct Keeper {
    inner: Arc<KeeperInner>,
    heartbeat: Mutex<Option<HeartbeatHandle>>,
    disposed: AtomicBool,
}

impl Keeper {
    /// Creates a keeper over the production collaborators: the system
    /// clock, a passphrase-derived cipher, and a file store at the
    /// configured path.
    ///
    /// The passphrase is borrowed for key derivation only and is never
    /// persisted.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::ClockUnavailable`] if the host lacks a
    /// monotonic clock.
    pub fn new(config: KeeperConfig, passphrase: &SecretString) -> Result<Self, KeeperError> {
        let clock = SystemClock::new()?;
        let cipher = PassphraseCipher::new(passphrase);
        let store = FileStore::new(&config.state_path);
        Ok(Self::with_parts(
            config,
            Box::new(clock),
            cipher,
            Box::new(store),
        ))
    }

    /// Creates a keeper over injected collaborators. The seam used by
    /// every test that scripts the clock or the store.
    #[must_use]
    pub fn with_parts(
        config: KeeperConfig,
        clock: Box<dyn ClockSource>,
        cipher: PassphraseCipher,
        store: Box<dyn StateStore>,
    ) -> Self {
        Self {
            inner: Arc::new(KeeperInner {
                config,
                clock,
                cipher,
                store,
                session: Mutex::new(None),
                subscribers: Mutex::new(EventSubscribers::default()),
            }),
            heartbeat: Mutex::new(None),
            disposed: AtomicBool::new(false),
        }
    }

    /// Registers a callback for lock entry. Register before
    /// `initialize`; do not subscribe from inside a callback.
    pub fn on_tamper_detected(&self, callback: TamperCallback) {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .subscribe_tamper(callback);
    }

    /// Registers a callback for successful heartbeat persists.
    pub fn on_heartbeat_saved(&self, callback: HeartbeatCallback) {
        self.inner
            .subscribers
            .lock()
            .unwrap()
            .subscribe_heartbeat(callback);
    }

    /// Loads or creates the persisted state, runs the clock handshake,
    /// persists the result, and starts the heartbeat.
    ///
    /// `initial_budget_ms` is adopted only when no readable prior state
    /// exists: as the fresh budget when the file is absent, or as the
    /// locked fallback budget when a prior blob fails decryption or
    /// parsing. Callers typically pass a punitive maximum so that
    /// deleting the state file is never a shortcut.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::AlreadyInitialized`] on a second call.
    /// Store and persist failures are logged and retried by the
    /// heartbeat, not surfaced here.
    pub fn initialize(&self, initial_budget_ms: u64) -> Result<(), KeeperError> {
        let tamper_event = {
            let mut guard = self.inner.session.lock().unwrap();
            if guard.is_some() {
                return Err(KeeperError::AlreadyInitialized);
            }

            let mono_now = self.inner.clock.mono_now();
            let wall_now = self.inner.clock.wall_now();
            let frequency = self.inner.clock.mono_frequency();

            let (state, tamper_event) = match self.inner.store.load() {
                Err(StoreError::NotFound) => {
                    info!(
                        initial_budget_ms,
                        "no prior state file; starting fresh block window"
                    );
                    (
                        State::fresh(initial_budget_ms, mono_now, wall_now, frequency),
                        None,
                    )
                },
                Err(e @ StoreError::Io(_)) => {
                    warn!(error = %e, "prior state file unreadable; entering locked state");
                    (
                        State::locked(initial_budget_ms, mono_now, wall_now, frequency),
                        Some(TamperDetected::corruption(format!(
                            "state file unreadable: {e}"
                        ))),
                    )
                },
                Ok(blob) => match self.inner.decrypt_and_decode(&blob) {
                    Err(cause) => {
                        warn!(error = %cause, "prior state rejected; entering locked state");
                        (
                            State::locked(initial_budget_ms, mono_now, wall_now, frequency),
                            Some(TamperDetected::corruption(cause)),
                        )
                    },
                    Ok(prior) => {
                        let tolerance_ms = self.inner.config.tolerance_ms();
                        let (state, event) =
                            run_handshake(prior, mono_now, wall_now, frequency, tolerance_ms);
                        if let Some(event) = &event {
                            info!(
                                mono_elapsed_ms = event.mono_elapsed_ms,
                                wall_elapsed_ms = event.wall_elapsed_ms,
                                discrepancy_ms = event.discrepancy_ms,
                                "clock discrepancy exceeds tolerance; entering locked state"
                            );
                        }
                        (state, event)
                    },
                },
            };

            let mut session = Session {
                state,
                anchor_ticks: mono_now,
            };
            if let Err(e) = self.inner.persist_session(&mut session) {
                warn!(error = %e, "initial persist failed; retrying on next heartbeat");
            }
            *guard = Some(session);
            tamper_event
        };

        if let Some(event) = &tamper_event {
            self.inner.subscribers.lock().unwrap().notify_tamper(event);
        }

        self.start_heartbeat();
        Ok(())
    }

    /// Replaces the remaining budget and persists.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::RefusedWhileTampered`] in the locked state
    /// and [`KeeperError::NotInitialized`] before `initialize`.
    pub fn set_budget(&self, new_ms: u64) -> Result<(), KeeperError> {
        let mut guard = self.inner.session.lock().unwrap();
        let session = guard.as_mut().ok_or(KeeperError::NotInitialized)?;
        if session.state.tampered {
            return Err(KeeperError::RefusedWhileTampered);
        }

        session.state.remaining_ms = new_ms;
        if let Err(e) = self.inner.persist_session(session) {
            warn!(error = %e, "budget persist failed; retrying on next heartbeat");
        }
        Ok(())
    }

    /// Debits monotonic elapsed time since the last debit. No-op in the
    /// locked state. Called implicitly by the heartbeat and by
    /// `dispose`.
    ///
    /// # Errors
    ///
    /// Returns [`KeeperError::NotInitialized`] before `initialize`.
    pub fn debit(&self) -> Result<(), KeeperError> {
        let mut guard = self.inner.session.lock().unwrap();
        let session = guard.as_mut().ok_or(KeeperError::NotInitialized)?;
        self.inner.debit_session(session);
        Ok(())
    }

    /// Milliseconds still owed on the block window. Zero before
    /// `initialize`.
    #[must_use]
    pub fn remaining(&self) -> u64 {
        self.inner
            .session
            .lock()
            .unwrap()
            .as_ref()
            .map_or(0, |s| s.state.remaining_ms)
    }

    /// Whether the window is locked. False before `initialize`.
    #[must_use]
    pub fn is_tampered(&self) -> bool {
        self.inner
            .session
            .lock()
            .unwrap()
            .as_ref()
            .is_some_and(|s| s.state.tampered)
    }

    /// Stops the heartbeat, runs a final debit and persist, and leaves
    /// the keeper inert. Idempotent; also invoked on drop.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }

        if let Some(heartbeat) = self.heartbeat.lock().unwrap().take() {
            heartbeat.stop.store(true, Ordering::Release);
            let _ = heartbeat.handle.join();
        }

        let mut guard = self.inner.session.lock().unwrap();
        if let Some(session) = guard.as_mut() {
            self.inner.debit_session(session);
            if let Err(e) = self.inner.persist_session(session) {
                warn!(error = %e, "final persist failed; last debit not recorded");
            }
        }
    }

    fn start_heartbeat(&self) {
        let mut guard = self.heartbeat.lock().unwrap();
        if guard.is_some() {
            return;
        }

        let stop = Arc::new(AtomicBool::new(false));
        let stop_bg = Arc::clone(&stop);
        let inner = Arc::clone(&self.inner);
        let interval = self.inner.config.heartbeat_interval;

        let spawned = std::thread::Builder::new()
            .name("timefence-heartbeat".to_string())
            .spawn(move || {
                while !stop_bg.load(Ordering::Acquire) {
                    let mut waited = Duration::ZERO;
                    while waited < interval {
                        if stop_bg.load(Ordering::Acquire) {
                            return;
                        }
                        let slice = STOP_POLL_SLICE.min(interval - waited);
                        std::thread::sleep(slice);
                        waited += slice;
                    }
                    inner.heartbeat_tick();
                }
            });

        match spawned {
            Ok(handle) => *guard = Some(HeartbeatHandle { stop, handle }),
            Err(e) => warn!(error = %e, "failed to spawn heartbeat thread"),
        }
    }
}

impl Drop for Keeper {
    fn drop(&mut self) {
        self.dispose();
    }
}

impl std::fmt::Debug for Keeper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Keeper")
            .field("config", &self.inner.config)
            .field("disposed", &self.disposed.load(Ordering::Relaxed))
            .finish_non_exhaustive()
    }
}

// =============================================================================
// Tests
// =============================================================================
