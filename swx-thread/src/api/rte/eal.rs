// Runtime environment (EAL) bring-up.
//
// The argument vector follows the rte_eal_init conventions so the same
// command line can later be handed to the packet-processing engine.

use std::sync::atomic::{AtomicBool, Ordering};

use tracing::{debug, info};

use crate::api::error::{Errno, Error, Result};
use crate::api::rte::lcore::{self, Lcore};

/// Set while an [`Eal`] guard is alive.
static EAL_INITIALIZED: AtomicBool = AtomicBool::new(false);

/// Assembles an EAL argument vector.
///
/// Options are emitted in the order they were added, after the program name.
///
/// # Example
/// ```no_run
/// use swx_thread::api::rte::eal::EalBuilder;
///
/// fn main() -> swx_thread::Result<()> {
///     let _eal = EalBuilder::new()
///         .program_name("dummy")
///         .memory_channels(4)
///         .core_mask("3")
///         .init()?;
///     Ok(())
/// }
/// ```
#[derive(Debug, Clone)]
pub struct EalBuilder {
    program_name: String,
    args: Vec<String>,
}

impl Default for EalBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl EalBuilder {
    /// Start from the current executable name.
    pub fn new() -> Self {
        let program_name = std::env::args()
            .next()
            .unwrap_or_else(|| "swx-app".to_string());
        Self {
            program_name,
            args: Vec::new(),
        }
    }

    pub fn program_name(mut self, name: impl Into<String>) -> Self {
        self.program_name = name.into();
        self
    }

    fn flag(mut self, flag: &str, value: String) -> Self {
        self.args.push(flag.to_string());
        self.args.push(value);
        self
    }

    /// `-c <mask>`: hex core mask, with or without `0x`.
    pub fn core_mask(self, mask: impl Into<String>) -> Self {
        self.flag("-c", mask.into())
    }

    /// `-l <list>`: ranges and single ids, e.g. `0-3,6`.
    pub fn core_list(self, list: impl Into<String>) -> Self {
        self.flag("-l", list.into())
    }

    /// `-n <channels>`
    pub fn memory_channels(self, n: u32) -> Self {
        self.flag("-n", n.to_string())
    }

    /// `--main-lcore <id>`
    pub fn main_lcore(self, id: u32) -> Self {
        self.flag("--main-lcore", id.to_string())
    }

    /// Append a raw argument, e.g. a long option the engine consumes.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// The full argument vector, program name first.
    pub fn to_args(&self) -> Vec<String> {
        std::iter::once(self.program_name.clone())
            .chain(self.args.iter().cloned())
            .collect()
    }

    /// Bring up the EAL; see [`Eal::init`].
    pub fn init(self) -> Result<Eal> {
        let args = self.to_args();
        info!(?args, "Initializing EAL");
        Eal::init(args)
    }
}

/// Parsed EAL command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EalConfig {
    /// Program name (argv[0]).
    pub program_name: String,
    /// All lcores in the core set, sorted.
    pub cores: Vec<u32>,
    /// Main (control-plane) lcore.
    pub main_lcore: u32,
    /// Memory channels, handed to the engine untouched.
    pub memory_channels: Option<u32>,
    /// Long options the engine consumes.
    pub passthrough: Vec<String>,
    /// Number of arguments consumed, including argv[0] and a trailing `--`.
    pub parsed_args: usize,
}

fn invalid(reason: String) -> Error {
    Error::init(Errno::EINVAL, reason)
}

impl EalConfig {
    /// Parse an EAL argument vector.
    pub fn parse<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let args: Vec<String> = args.into_iter().map(|s| s.as_ref().to_string()).collect();
        let mut it = args.iter();
        let program_name = it
            .next()
            .cloned()
            .ok_or_else(|| invalid("missing program name".to_string()))?;

        let mut parsed_args = 1;
        let mut cores: Option<Vec<u32>> = None;
        let mut main_lcore = None;
        let mut memory_channels = None;
        let mut passthrough = Vec::new();

        while let Some(arg) = it.next() {
            parsed_args += 1;
            let mut value = |opt: &str| {
                parsed_args += 1;
                it.next()
                    .cloned()
                    .ok_or_else(|| invalid(format!("option {opt} requires a value")))
            };

            match arg.as_str() {
                "--" => break,
                "-c" | "-l" => {
                    let raw = value(arg)?;
                    if cores.is_some() {
                        return Err(invalid("core set given more than once".to_string()));
                    }
                    let parsed = if arg == "-c" {
                        lcore::parse_core_mask(&raw)
                    } else {
                        lcore::parse_core_list(&raw)
                    };
                    cores = Some(parsed.ok_or_else(|| invalid(format!("invalid core set {raw:?}")))?);
                }
                "-n" => {
                    let raw = value(arg)?;
                    let n = raw
                        .parse::<u32>()
                        .map_err(|_| invalid(format!("invalid memory channels {raw:?}")))?;
                    memory_channels = Some(n);
                }
                "--main-lcore" => {
                    let raw = value(arg)?;
                    let id = raw
                        .parse::<u32>()
                        .map_err(|_| invalid(format!("invalid main lcore {raw:?}")))?;
                    main_lcore = Some(id);
                }
                long if long.starts_with("--") => passthrough.push(long.to_string()),
                other => return Err(invalid(format!("unknown option {other:?}"))),
            }
        }

        let cores = cores.unwrap_or_else(lcore::available_cores);
        let Some(&first) = cores.first() else {
            return Err(invalid("empty core set".to_string()));
        };
        let main_lcore = main_lcore.unwrap_or(first);
        if !cores.contains(&main_lcore) {
            return Err(invalid(format!("main lcore {main_lcore} not in core set")));
        }

        Ok(Self {
            program_name,
            cores,
            main_lcore,
            memory_channels,
            passthrough,
            parsed_args,
        })
    }

    /// Iterate over all lcores (including main).
    pub fn lcores(&self) -> impl Iterator<Item = Lcore> + '_ {
        self.cores.iter().map(|&id| {
            if id == self.main_lcore {
                Lcore::main(id)
            } else {
                Lcore::worker(id)
            }
        })
    }

    /// Iterate over worker lcores (excluding main).
    pub fn workers(&self) -> impl Iterator<Item = Lcore> + '_ {
        self.lcores().filter(|l| !l.is_main())
    }
}

/// RAII guard for the EAL environment.
///
/// Only one guard can exist per process. Dropping it releases the
/// environment so it can be initialized again.
#[derive(Debug)]
pub struct Eal {
    config: EalConfig,
}

impl Eal {
    /// Parse `args` (program name first) and claim the process-wide EAL.
    ///
    /// # Errors
    /// Returns `RuntimeInitFailure` if the arguments are invalid or if EAL is
    /// already initialized.
    pub fn init<I, S>(args: I) -> Result<Self>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        if EAL_INITIALIZED.swap(true, Ordering::SeqCst) {
            return Err(Error::init(Errno::EALREADY, "EAL already initialized"));
        }

        let config = match EalConfig::parse(args) {
            Ok(config) => config,
            Err(e) => {
                // Nothing was brought up; a later init may succeed.
                EAL_INITIALIZED.store(false, Ordering::SeqCst);
                return Err(e);
            }
        };

        info!(
            main_lcore = config.main_lcore,
            cores = ?config.cores,
            memory_channels = ?config.memory_channels,
            parsed_args = config.parsed_args,
            "EAL initialized"
        );
        Ok(Eal { config })
    }

    /// Whether an [`Eal`] guard is alive in this process.
    pub fn is_initialized() -> bool {
        EAL_INITIALIZED.load(Ordering::SeqCst)
    }

    pub fn config(&self) -> &EalConfig {
        &self.config
    }

    /// The control-plane lcore.
    pub fn main_lcore(&self) -> Lcore {
        Lcore::main(self.config.main_lcore)
    }

    /// Iterate over worker lcores (excluding main).
    pub fn workers(&self) -> impl Iterator<Item = Lcore> + '_ {
        self.config.workers()
    }
}

impl Drop for Eal {
    fn drop(&mut self) {
        debug!("Releasing EAL");
        EAL_INITIALIZED.store(false, Ordering::SeqCst);
    }
}
