//! # Authentication State Machine
//!
//! ```text
//! Uninitialized --> Registering --> Bound            (warm reset)
//!               \
//!                -> Authenticating --> Bound         (boot)
//!                        |     \
//!                        |      -> Locked --> RecoveryPrompt
//!                        +--(ESC)-----------> RecoveryPrompt
//!                                               |         \
//!                                  clear + warm reset    shutdown
//! ```
//!
//! The machine only holds transitions. Byte-level work is delegated to
//! [`NvStore`], [`identity`] and [`recovery`]; the operator, the USB bus
//! and power control are reached through their traits.

use log::{debug, error, info, warn};

use crate::config::{Config, Policy};
use crate::console::{self, Console, Key};
use crate::error::{Error, Result};
use crate::identity::{self, DeviceIdentity};
use crate::nv::{CombinedRecord, NvStore, SerialRecord};
use crate::platform::Platform;
use crate::recovery::{self, RECOVERY_CODE_LEN};
use crate::tpm::{Tpm, Transport};
use crate::usb::{self, UsbBus};

/// Protocol states
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Uninitialized,
    Registering,
    Bound,
    Authenticating,
    Locked,
    RecoveryPrompt,
}

/// How [`Authenticator::run`] handed control back
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// Token authenticated, continue the normal boot
    Boot,
    /// Binding changed, the platform was asked to warm reset
    WarmReset,
}

enum Step {
    Next(AuthState),
    Done(Outcome),
}

enum Scan {
    Matched,
    HashMismatch,
    NoMatch,
}

/// Registration, authentication and recovery driver
pub struct Authenticator<T: Transport, B: UsbBus, C: Console, P: Platform> {
    tpm: Tpm<T>,
    store: NvStore,
    policy: Policy,
    bus: B,
    console: C,
    platform: P,
    state: AuthState,
    mismatches: u32,
    history: Vec<AuthState>,
}

impl<T: Transport, B: UsbBus, C: Console, P: Platform> Authenticator<T, B, C, P> {
    pub fn new(config: &Config, transport: T, bus: B, console: C, platform: P) -> Result<Self> {
        config.validate()?;
        let tpm = Tpm::with_limits(
            transport,
            config.transport.max_buffer,
            config.transport.response_capacity,
        );
        Ok(Self {
            tpm,
            store: NvStore::new(config.layout())?,
            policy: config.policy.clone(),
            bus,
            console,
            platform,
            state: AuthState::Uninitialized,
            mismatches: 0,
            history: vec![AuthState::Uninitialized],
        })
    }

    pub fn state(&self) -> AuthState {
        self.state
    }

    /// States entered during the last run, starting with `Uninitialized`
    pub fn history(&self) -> &[AuthState] {
        &self.history
    }

    /// Consecutive hash mismatches against serial-matching devices
    pub fn mismatch_count(&self) -> u32 {
        self.mismatches
    }

    pub fn tpm(&self) -> &Tpm<T> {
        &self.tpm
    }

    pub fn tpm_mut(&mut self) -> &mut Tpm<T> {
        &mut self.tpm
    }

    pub fn store(&self) -> &NvStore {
        &self.store
    }

    pub fn console(&self) -> &C {
        &self.console
    }

    pub fn platform(&self) -> &P {
        &self.platform
    }

    fn transition(&mut self, next: AuthState) {
        debug!("state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.history.push(next);
    }

    /// Print on a terminal path where the power action must still happen
    fn notify(&mut self, text: &str) {
        if let Err(e) = self.console.print(text) {
            warn!("console unavailable: {}", e);
        }
    }

    /// Drive the machine until it boots, resets or shuts down
    pub fn run(&mut self) -> Result<Outcome> {
        self.state = AuthState::Uninitialized;
        self.history = vec![AuthState::Uninitialized];
        self.mismatches = 0;

        loop {
            let step = match self.state {
                AuthState::Uninitialized => Step::Next(self.detect_state()),
                AuthState::Registering => self.registering()?,
                AuthState::Authenticating => self.authenticating()?,
                AuthState::Locked => {
                    warn!("USB key locked out, entering recovery");
                    Step::Next(AuthState::RecoveryPrompt)
                }
                AuthState::RecoveryPrompt => self.recovery_prompt()?,
                AuthState::Bound => Step::Done(Outcome::Boot),
            };
            match step {
                Step::Next(next) => self.transition(next),
                Step::Done(outcome) => return Ok(outcome),
            }
        }
    }

    /// Starting state from the stored records
    pub fn detect_state(&mut self) -> AuthState {
        match self.store.read_combined(&mut self.tpm) {
            Ok(record) if record.is_bound() => match self.store.read_serial(&mut self.tpm) {
                Ok(serial) => {
                    info!("TPM check - serial {:?}, flag 1 (authentication mode)", serial.as_str());
                    AuthState::Authenticating
                }
                Err(e) => {
                    warn!("bound but Serial Record unreadable ({}), registration mode", e);
                    AuthState::Registering
                }
            },
            Ok(record) => {
                info!("TPM check - flag {} (registration mode)", record.flag);
                AuthState::Registering
            }
            Err(e) => {
                info!("Combined Record unavailable ({}), registration mode", e);
                AuthState::Registering
            }
        }
    }

    /// Describe every enumerated device; devices that fail are skipped
    fn scan_devices(&mut self) -> Result<Vec<DeviceIdentity>> {
        let handles = self.bus.enumerate()?;
        let mut found = Vec::with_capacity(handles.len());
        for handle in handles {
            match usb::describe(&mut self.bus, &mut self.platform, handle, self.policy.descriptor_retry()) {
                Ok(identity) => found.push(identity),
                Err(e) => warn!("skipping USB device {:?}: {}", handle, e),
            }
        }
        if found.is_empty() {
            return Err(Error::DeviceNotFound);
        }
        Ok(found)
    }

    // ------------------------------------------------------------------------
    // Registering
    // ------------------------------------------------------------------------

    fn registering(&mut self) -> Result<Step> {
        let mut attempts = 0u32;
        loop {
            attempts += 1;
            let err = match self.register_once() {
                Ok(()) => break,
                Err(e) => e,
            };
            if matches!(err, Error::Console(_)) || err.is_transport() {
                return Err(err);
            }
            if matches!(err, Error::DeviceNotFound) {
                info!("no USB devices found, waiting");
                self.console.print("No USB devices found. Insert the USB key to register.\n")?;
            } else {
                error!("registration failed: {}", err);
                self.console.print(&format!("Registration failed: {}\n", err))?;
            }
            let limit = self.policy.registration_attempts;
            if limit != 0 && attempts >= limit {
                error!("giving up registration after {} attempts", attempts);
                return Err(err);
            }
            self.platform.stall(self.policy.registration_retry());
        }

        self.transition(AuthState::Bound);
        self.console.print("\nPress ENTER to reboot the system _\n")?;
        console::wait_for_enter(&mut self.console)?;
        self.console.print("Rebooting the system now...\n")?;
        self.platform.stall(self.policy.reset_delay());
        self.platform.warm_reset();
        Ok(Step::Done(Outcome::WarmReset))
    }

    fn register_once(&mut self) -> Result<()> {
        self.store.provision(&mut self.tpm)?;

        let devices = self.scan_devices()?;
        let shown = devices.len().min(9);
        self.console.print("\nAvailable USB Devices:\n")?;
        for (i, device) in devices.iter().take(shown).enumerate() {
            self.console.print(&format!(
                "[{}] VID: {:04X}\n    PID: {:04X}\n    Serial: {}\n",
                i + 1,
                device.vid,
                device.pid,
                device.serial()
            ))?;
        }
        self.console.print(&format!("Select a device to register (1-{}): ", shown))?;
        let choice = console::select_device(&mut self.console, shown)?
            .ok_or(Error::InvalidInput("invalid device selection"))?;
        let device = &devices[choice];
        info!("registering {}", device);
        self.console.print(&format!("Registering {}\n", device))?;

        let usb_hash = identity::fingerprint(&mut self.tpm, device)?;
        debug!("usb hash {:x}", usb_hash);
        self.store.write_serial(&mut self.tpm, device.serial_bytes())?;

        let code = recovery::generate(&mut self.tpm)?;
        self.console.print(&format!(
            "\n==============================================\n\
             Recovery code: {}\n\
             Store it safely. It will not be shown again.\n\
             ==============================================\n",
            code.display()
        ))?;
        let recovery_hash = recovery::hash_code(&mut self.tpm, code.display())?;

        self.store.write_combined(&mut self.tpm, 1, &usb_hash, &recovery_hash)?;

        // Re-read both records before trusting the binding
        let serial = self.store.read_serial(&mut self.tpm)?;
        if serial.serial() != device.serial_bytes() {
            return Err(Error::VerifyFailed("serial record"));
        }
        let combined = self.store.read_combined(&mut self.tpm)?;
        if !combined.is_bound()
            || !combined.usb_hash.ct_eq(&usb_hash)
            || !combined.recovery_hash.ct_eq(&recovery_hash)
        {
            return Err(Error::VerifyFailed("combined record"));
        }

        info!("USB key registered");
        self.console.print("\nUSB key registered successfully.\n")?;
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Authenticating
    // ------------------------------------------------------------------------

    fn authenticating(&mut self) -> Result<Step> {
        self.console
            .print("Insert the registered USB key. Press ESC to enter recovery mode.\n")?;
        loop {
            match self.scan_once() {
                Ok(Scan::Matched) => {
                    self.mismatches = 0;
                    info!("USB key authenticated");
                    self.console.print("USB key verified. Continuing boot.\n")?;
                    self.transition(AuthState::Bound);
                    return Ok(Step::Done(Outcome::Boot));
                }
                Ok(Scan::HashMismatch) => {
                    self.mismatches += 1;
                    let limit = self.policy.max_hash_mismatches;
                    warn!("USB key hash mismatch ({}/{})", self.mismatches, limit);
                    self.console.print(&format!(
                        "USB key verification failed ({}/{}).\n",
                        self.mismatches, limit
                    ))?;
                    if self.mismatches >= limit {
                        self.console.print("Too many failed attempts. Entering recovery mode.\n")?;
                        return Ok(Step::Next(AuthState::Locked));
                    }
                    self.platform.stall(self.policy.mismatch_delay());
                    continue;
                }
                Ok(Scan::NoMatch) => debug!("registered USB key not present"),
                Err(Error::DeviceNotFound) => debug!("no USB devices present"),
                Err(e @ Error::Console(_)) => return Err(e),
                Err(e) if e.is_transport() => {
                    error!("security module unreachable: {}", e);
                    return Err(e);
                }
                Err(e) => {
                    error!("authentication scan failed: {}", e);
                    self.console.print(&format!("Authentication error: {}\n", e))?;
                }
            }

            if let Some(Key::Escape) = self.console.poll_key()? {
                info!("recovery requested by operator");
                return Ok(Step::Next(AuthState::RecoveryPrompt));
            }
            self.platform.stall(self.policy.scan_interval());
        }
    }

    /// One pass over the attached devices
    fn scan_once(&mut self) -> Result<Scan> {
        let stored = self.store.read_serial(&mut self.tpm)?;
        for device in self.scan_devices()? {
            if device.serial_bytes() != stored.serial() {
                continue;
            }
            debug!("serial match on {}", device);
            let candidate = identity::fingerprint(&mut self.tpm, &device)?;
            let record = self.store.read_combined(&mut self.tpm)?;
            return Ok(if candidate.ct_eq(&record.usb_hash) {
                Scan::Matched
            } else {
                Scan::HashMismatch
            });
        }
        Ok(Scan::NoMatch)
    }

    // ------------------------------------------------------------------------
    // Recovery
    // ------------------------------------------------------------------------

    fn recovery_prompt(&mut self) -> Result<Step> {
        self.console.print("\nInitializing the recovery mode...\n")?;
        let stored = match self.store.read_combined(&mut self.tpm) {
            Ok(record) => record,
            Err(e) => {
                error!("failed to load stored recovery hash: {}", e);
                self.console
                    .print("Failed to load stored recovery hash. Recovery unavailable.\n")?;
                return Err(e);
            }
        };

        let limit = self.policy.max_recovery_attempts;
        for attempt in 1..=limit {
            self.console.print(&format!(
                "Enter your recovery code (XXXX-XXXX-XXXX-XXXX-XXXX) [{}/{}]: ",
                attempt, limit
            ))?;
            let entered = match console::read_code_line(&mut self.console, RECOVERY_CODE_LEN) {
                Ok(line) => line,
                Err(e) => {
                    warn!("failed to read recovery code: {}", e);
                    self.notify("\nFailed to read input.\n");
                    continue;
                }
            };

            let left = limit - attempt;
            let digest = match recovery::hash_code(&mut self.tpm, &entered) {
                Ok(digest) => digest,
                Err(e) => {
                    warn!("failed to hash recovery code: {}", e);
                    self.notify(&format!(
                        "Failed to verify recovery code. Attempts remaining: {}\n",
                        left
                    ));
                    continue;
                }
            };
            if digest.ct_eq(&stored.recovery_hash) {
                return self.unbind();
            }

            warn!("invalid recovery code, {} attempts remaining", left);
            self.console
                .print(&format!("Invalid recovery code. Attempts remaining: {}\n", left))?;
        }

        error!("recovery attempts exhausted, shutting down");
        self.notify("No attempts remaining. System will shut down.\n");
        self.platform.stall(self.policy.shutdown_delay());
        self.platform.shutdown();
        Err(Error::SecurityViolation)
    }

    /// Clear the binding and reset
    fn unbind(&mut self) -> Result<Step> {
        info!("recovery code verified, clearing binding");
        self.console
            .print("Recovery code verified successfully.\nUnregistering the USB device...\n")?;

        self.store.write_serial_record(&mut self.tpm, &SerialRecord::sentinel())?;
        let cleared = CombinedRecord::cleared();
        self.store
            .write_combined(&mut self.tpm, cleared.flag, &cleared.usb_hash, &cleared.recovery_hash)?;
        self.mismatches = 0;

        self.notify("USB key binding cleared.\nPress ENTER to reboot the system _\n");
        if let Err(e) = console::wait_for_enter(&mut self.console) {
            warn!("no confirmation ({}), rebooting anyway", e);
        }
        self.notify("Rebooting the system now...\n");
        self.platform.stall(self.policy.reset_delay());
        self.platform.warm_reset();
        Ok(Step::Done(Outcome::WarmReset))
    }
}
