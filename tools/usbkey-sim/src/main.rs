//! USB Key Simulator
//!
//! Drives the TPM-bound USB key logic on the host: the module is a
//! software simulator whose NV contents persist in a TOML state file, USB
//! devices are given on the command line and operator input comes from a
//! key script.
//!
//! # Usage
//!
//! ```bash
//! # First boot: register the only attached device (press 1)
//! usbkey-sim boot 0781:5567:4C530001231018117092 --keys '1\n'
//!
//! # Later boot with the same device attached
//! usbkey-sim boot 0781:5567:4C530001231018117092
//!
//! # Lost device: press Escape, type the recovery code, confirm
//! usbkey-sim boot --keys '\eABCD-EFGH-JKMN-PQRS-TUVW\n\n' --idle-polls 1
//!
//! # Inspect the protected indices
//! usbkey-sim status
//!
//! # Drop both indices
//! usbkey-sim undefine all
//!
//! # Print the default configuration
//! usbkey-sim config > usbkey.toml
//! ```

mod state;

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use colored::Colorize;
use log::{info, warn};

use tpm_usbkey::config::Config;
use tpm_usbkey::nv::{NvSlot, NvStore};
use tpm_usbkey::sim::{ScriptedConsole, SimBus, SimDevice, SimPlatform, SimulatedTpm};
use tpm_usbkey::{Authenticator, Error, Outcome, Tpm};

use state::StateFile;

/// USB Key Simulator
///
/// Run the USB key binding flow against a simulated TPM
#[derive(Parser)]
#[command(name = "usbkey-sim")]
#[command(author = "Prasanna Gautam")]
#[command(version = "0.1.0")]
#[command(about = "Run the TPM-bound USB key flow against a simulated module")]
#[command(propagate_version = true)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Simulator state file (created if missing)
    #[arg(short, long, global = true, default_value = "usbkey-state.toml")]
    state: PathBuf,

    /// Configuration file (defaults apply when omitted)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one boot: authenticate, register or recover
    Boot {
        /// Attached devices as VID:PID[:SERIAL] (hex VID and PID)
        #[arg(value_parser = parse_device)]
        devices: Vec<SimDevice>,

        /// Operator key script: \n Enter, \e Escape, \b Backspace
        #[arg(short, long, default_value = "")]
        keys: String,

        /// Registration tries before giving up (0 retries forever)
        #[arg(long, default_value_t = 3)]
        registration_attempts: u32,

        /// Scan cycles to wait for input once the key script runs out
        #[arg(long, default_value_t = 0)]
        idle_polls: usize,
    },

    /// Show the protected indices and their decoded records
    Status,

    /// Remove protected indices from the module
    Undefine {
        /// Which index to remove
        #[arg(value_enum)]
        slot: SlotChoice,
    },

    /// Print the effective configuration as TOML
    Config,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum SlotChoice {
    Serial,
    Combined,
    All,
}

fn parse_device(text: &str) -> std::result::Result<SimDevice, String> {
    text.parse::<SimDevice>().map_err(|e| e.to_string())
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let filter = if cli.verbose { "debug" } else { "info" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(filter)).init();

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Boot {
            devices,
            keys,
            registration_attempts,
            idle_polls,
        } => {
            let mut config = config;
            config.policy.registration_attempts = registration_attempts;
            handle_boot(&cli.state, &config, devices, &keys, idle_polls)
        }
        Commands::Status => handle_status(&cli.state, &config),
        Commands::Undefine { slot } => handle_undefine(&cli.state, &config, slot),
        Commands::Config => {
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> Result<Config> {
    match path {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load configuration {}", path.display())),
        None => Ok(Config::default()),
    }
}

fn simulator(state: &StateFile, config: &Config) -> SimulatedTpm {
    SimulatedTpm::from_state(state.tpm.clone()).with_max_buffer(config.transport.max_buffer)
}

/// Driver over `sim` using the configured transport limits
fn module<'a>(sim: &'a mut SimulatedTpm, config: &Config) -> Tpm<&'a mut SimulatedTpm> {
    Tpm::with_limits(sim, config.transport.max_buffer, config.transport.response_capacity)
}

fn handle_boot(
    state_path: &Path,
    config: &Config,
    devices: Vec<SimDevice>,
    keys: &str,
    idle_polls: usize,
) -> Result<()> {
    let mut state = StateFile::load_or_default(state_path)?;
    let mut sim = simulator(&state, config);
    let mut bus = SimBus::new(devices);
    let mut console = ScriptedConsole::from_script(keys).with_idle_polls(idle_polls);
    let mut platform = SimPlatform::default();

    let (outcome, history) = {
        let mut auth = Authenticator::new(config, &mut sim, &mut bus, &mut console, &mut platform)?;
        let outcome = auth.run();
        (outcome, auth.history().to_vec())
    };

    state.tpm = sim.state().clone();
    state.save(state_path)?;

    println!("{}", "=".repeat(60));
    println!("{}", "Console".cyan().bold());
    println!("{}", "=".repeat(60));
    print!("{}", console.output());
    if !console.output().ends_with('\n') {
        println!();
    }
    println!("{}", "=".repeat(60));

    let path: Vec<String> = history.iter().map(|s| format!("{:?}", s)).collect();
    println!("{} {}", "States:".white().bold(), path.join(" -> "));
    println!(
        "{} {:?} ({} resets, {} shutdowns)",
        "Simulated delay:".white().bold(),
        platform.total_stalled(),
        platform.resets(),
        platform.shutdowns()
    );

    match outcome {
        Ok(Outcome::Boot) => {
            println!("{} USB key verified, continuing boot", "[OK]".green().bold());
            Ok(())
        }
        Ok(Outcome::WarmReset) => {
            println!("{} Binding updated, warm reset requested", "[RESET]".yellow().bold());
            Ok(())
        }
        Err(Error::SecurityViolation) => {
            eprintln!("{} Recovery attempts exhausted, system shut down", "[SHUTDOWN]".red().bold());
            std::process::exit(2);
        }
        Err(Error::Console(reason)) => {
            warn!("Stopped waiting for input: {}", reason);
            println!(
                "{} Key script ran out before the flow finished",
                "[STOPPED]".yellow().bold()
            );
            Ok(())
        }
        Err(err) => Err(err).context("Boot flow failed"),
    }
}

fn handle_status(state_path: &Path, config: &Config) -> Result<()> {
    let state = StateFile::load_or_default(state_path)?;
    let mut sim = simulator(&state, config);
    let store = NvStore::new(config.layout())?;
    let layout = *store.layout();
    let mut tpm = module(&mut sim, config);

    let manufacturer = tpm.test_connection().context("Module did not respond")?;
    let vendor: String = manufacturer
        .to_be_bytes()
        .iter()
        .map(|&b| if b.is_ascii_graphic() { b as char } else { ' ' })
        .collect();

    println!("{}", "=".repeat(70));
    println!("{}", "Simulated Module Status".cyan().bold());
    println!("{}", "=".repeat(70));
    println!("  Manufacturer: 0x{:08X} ({})", manufacturer, vendor.trim_end());
    println!("  State file: {}", state_path.display());

    print_slot(&mut tpm, &store, "Serial Record", &layout.serial)?;
    if store.is_defined(&mut tpm, layout.serial.index)? {
        match store.read_serial(&mut tpm) {
            Ok(record) if record.is_sentinel() => {
                println!("    Serial: {} {}", record.as_str(), "(cleared)".dimmed())
            }
            Ok(record) => println!("    Serial: {}", record.as_str()),
            Err(err) => println!("    {} {}", "Unreadable:".red(), err),
        }
    }

    print_slot(&mut tpm, &store, "Combined Record", &layout.combined)?;
    if store.is_defined(&mut tpm, layout.combined.index)? {
        match store.read_combined(&mut tpm) {
            Ok(record) => {
                let flag = if record.is_bound() {
                    "bound".green()
                } else {
                    "unbound".yellow()
                };
                println!("    Flag: {} ({})", record.flag, flag);
                println!("    Device digest:   {:x}", record.usb_hash);
                println!("    Recovery digest: {:x}", record.recovery_hash);
            }
            Err(err) => println!("    {} {}", "Unreadable:".red(), err),
        }
    }

    println!("\n{}", "=".repeat(70));
    Ok(())
}

fn print_slot(tpm: &mut Tpm<&mut SimulatedTpm>, store: &NvStore, name: &str, slot: &NvSlot) -> Result<()> {
    println!("\n{} 0x{:08X}", format!("{}:", name).white().bold(), slot.index);
    if !store.is_defined(tpm, slot.index)? {
        println!("    {}", "[not defined]".dimmed());
        return Ok(());
    }
    let public = tpm.nv_read_public(slot.index)?;
    println!(
        "    {} size {} bytes, attributes 0x{:08X}",
        "[defined]".green(),
        public.data_size,
        public.attributes
    );
    Ok(())
}

fn handle_undefine(state_path: &Path, config: &Config, slot: SlotChoice) -> Result<()> {
    let mut state = StateFile::load_or_default(state_path)?;
    let mut sim = simulator(&state, config);
    let store = NvStore::new(config.layout())?;

    {
        let mut tpm = module(&mut sim, config);
        if matches!(slot, SlotChoice::Serial | SlotChoice::All) {
            undefine_one(&mut tpm, &store, SlotChoice::Serial)?;
        }
        if matches!(slot, SlotChoice::Combined | SlotChoice::All) {
            undefine_one(&mut tpm, &store, SlotChoice::Combined)?;
        }
    }

    state.tpm = sim.into_state();
    state.save(state_path)
}

fn undefine_one(tpm: &mut Tpm<&mut SimulatedTpm>, store: &NvStore, slot: SlotChoice) -> Result<()> {
    let (name, index) = match slot {
        SlotChoice::Serial => ("Serial", store.layout().serial.index),
        _ => ("Combined", store.layout().combined.index),
    };
    if !store.is_defined(tpm, index)? {
        println!("{} {} index 0x{:08X} was not defined", "[SKIP]".dimmed(), name, index);
        return Ok(());
    }

    let removed = match slot {
        SlotChoice::Serial => store.undefine_serial_slot(tpm),
        _ => store.undefine_combined_slot(tpm),
    };
    removed.with_context(|| format!("Failed to undefine 0x{:08X}", index))?;
    info!("Undefined NV index 0x{:08X}", index);
    println!("{} {} index 0x{:08X} removed", "[OK]".green().bold(), name, index);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_parses_boot() {
        let cli = Cli::try_parse_from([
            "usbkey-sim",
            "boot",
            "0781:5567:ABC",
            "046d:c52b",
            "--keys",
            "1\\n",
            "--idle-polls",
            "2",
        ])
        .unwrap();

        match cli.command {
            Commands::Boot {
                devices,
                keys,
                registration_attempts,
                idle_polls,
            } => {
                assert_eq!(devices.len(), 2);
                assert_eq!(devices[0].vid, 0x0781);
                assert_eq!(devices[0].serial.as_deref(), Some("ABC"));
                assert_eq!(devices[1].serial, None);
                assert_eq!(keys, "1\\n");
                assert_eq!(registration_attempts, 3);
                assert_eq!(idle_polls, 2);
            }
            _ => panic!("expected boot"),
        }
    }

    #[test]
    fn test_cli_rejects_bad_device() {
        assert!(Cli::try_parse_from(["usbkey-sim", "boot", "xyz"]).is_err());
    }

    #[test]
    fn test_cli_undefine_choice() {
        let cli = Cli::try_parse_from(["usbkey-sim", "undefine", "all", "--state", "x.toml"]).unwrap();
        assert!(matches!(cli.command, Commands::Undefine { slot: SlotChoice::All }));
        assert_eq!(cli.state, PathBuf::from("x.toml"));
    }

    #[test]
    fn test_module_uses_configured_limits() {
        let mut config = Config::default();
        config.transport.max_buffer = 256;
        let mut sim = simulator(&StateFile::default(), &config);
        assert_eq!(module(&mut sim, &config).max_buffer(), 256);
    }

    #[test]
    fn test_boot_persists_binding_then_undefine_clears_it() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tpm.toml");
        let config = Config::default();
        let device: SimDevice = "0781:5567:4C530001231018117092".parse().unwrap();

        handle_boot(&path, &config, vec![device.clone()], "1\\n", 0).unwrap();

        let state = StateFile::load_or_default(&path).unwrap();
        assert_eq!(state.tpm.spaces.len(), 2);
        let mut sim = simulator(&state, &config);
        let store = NvStore::new(config.layout()).unwrap();
        let combined = store.read_combined(&mut Tpm::new(&mut sim)).unwrap();
        assert!(combined.is_bound());

        // Second boot authenticates from the persisted state
        handle_boot(&path, &config, vec![device], "", 0).unwrap();

        handle_undefine(&path, &config, SlotChoice::All).unwrap();
        let state = StateFile::load_or_default(&path).unwrap();
        assert!(state.tpm.spaces.is_empty());
    }
}
