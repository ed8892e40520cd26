use std::path::PathBuf;

use clap::{crate_description, crate_name, crate_version, Arg, Command};
use remoteprocess::Pid;

/// Where to find the target: a live process to attach to, or a saved core
/// file to read (optionally with an explicit executable path when the
/// core's own record of it can't be trusted).
#[derive(Debug, Clone, PartialEq)]
pub enum Target {
    Remote { pid: Pid },
    Core { corefile: String, executable: Option<String> },
}

/// Options on how to collect one sample from a python process or core file
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    pub target: Target,

    /// Whether or not we should stop the python process when taking the
    /// sample. Setting this to false reduces the performance impact on the
    /// target process, but can lead to incorrect results like partial stack
    /// traces or a higher sampling error rate. Core files are always read
    /// non-blocking since there is no live process to pause.
    pub blocking: LockingStrategy,

    /// Whether (and how) to collect native (C/C++/Cython) frames alongside
    /// the Python call stack.
    pub native_mode: NativeMode,

    /// Run every interpreter-locating strategy instead of stopping at the
    /// first hit, and log when they disagree.
    pub exhaustive: bool,

    /// Skip the subprocess `--version` fallback for version detection (set
    /// when inspecting our own process, where spawning a subprocess to ask
    /// would deadlock).
    pub self_attach: bool,

    /// Extra directories to search for a core file's recorded modules when
    /// their on-disk paths no longer exist.
    pub lib_search_path: Vec<PathBuf>,
    /// Root directory to join with a module's basename as a last-resort
    /// search path for core file module resolution.
    pub lib_search_root: Option<PathBuf>,

    pub dump_json: bool,
    pub dump_locals: u64,
    pub full_filenames: bool,
    pub lineno: LineNo,

    pub no_color: bool,
    pub verbosity: u8,
}

#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LockingStrategy {
    NonBlocking,
    Lock,
}

/// Whether to collect native frames at all, and if so, where `Other`
/// (non-eval) native frames land relative to the Python frames around
/// them. `--native`/`--native-all` both splice native frames in at the
/// position they were unwound; `--native-last` defers them to the tail of
/// each thread's stack instead.
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum NativeMode {
    Off,
    Interleaved,
    NativeLast,
}

impl NativeMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, NativeMode::Off)
    }
}

#[derive(Debug, Clone, Eq, PartialEq, Copy)]
pub enum LineNo {
    NoLine,
    LastInstruction,
}

impl Default for Config {
    /// Initializes a new Config object with default parameters
    fn default() -> Config {
        Config {
            target: Target::Remote { pid: 0 },
            blocking: LockingStrategy::Lock,
            native_mode: NativeMode::Off,
            exhaustive: false,
            self_attach: false,
            lib_search_path: Vec::new(),
            lib_search_root: None,
            dump_json: false,
            dump_locals: 0,
            full_filenames: false,
            lineno: LineNo::LastInstruction,
            no_color: false,
            verbosity: 0,
        }
    }
}

impl Config {
    /// Uses clap to set config options from commandline arguments
    pub fn from_commandline() -> Config {
        let args: Vec<String> = std::env::args().collect();
        Config::from_args(&args).unwrap_or_else(|e| e.exit())
    }

    pub fn from_args(args: &[String]) -> clap::Result<Config> {
        let locals = Arg::new("locals")
            .short('l')
            .long("locals")
            .multiple_occurrences(true)
            .help("Show local variables for each frame. Passing multiple times (-ll) increases verbosity");

        let json = Arg::new("json").short('j').long("json").help("Format output as JSON");

        let full_filenames = Arg::new("full_filenames").long("full-filenames").help(
            "Show full Python filenames, instead of shortening to show only the package part",
        );

        let native = Arg::new("native")
            .short('n')
            .long("native")
            .help("Also collect native (C/C++/Cython) frames and interleave them with the Python call stack");

        let native_all = Arg::new("native_all")
            .long("native-all")
            .help("Same as --native; kept as a separate flag for scripts that spell it out explicitly");

        let native_last = Arg::new("native_last")
            .long("native-last")
            .help("Also collect native frames, but defer every non-eval native frame to the tail of each thread's stack instead of interleaving it");

        let exhaustive = Arg::new("exhaustive").long("exhaustive").help(
            "Run every interpreter-locating strategy instead of stopping at the first hit, and log when they disagree",
        );

        let self_attach = Arg::new("self_attach")
            .long("self")
            .hide(true)
            .help("Skip the subprocess --version fallback for version detection");

        let lib_search_path = Arg::new("lib_search_path")
            .long("lib-search-path")
            .value_name("dir")
            .multiple_occurrences(true)
            .takes_value(true)
            .help("Additional directory to search for a module recorded in a core file when its on-disk path no longer exists");

        let lib_search_root = Arg::new("lib_search_root")
            .long("lib-search-root")
            .value_name("dir")
            .takes_value(true)
            .help("Root directory to join with a module's basename as a last-resort search path for core file module resolution");

        let nolineno = Arg::new("nolineno")
            .long("nolineno")
            .help("Show the first line of each function instead of the current line");

        let remote = Command::new("remote")
            .about("Attaches to a running process and dumps its Python call stacks")
            .arg(
                Arg::new("pid")
                    .value_name("pid")
                    .help("PID of the process to inspect")
                    .required(true)
                    .takes_value(true),
            )
            .arg(
                Arg::new("no_block")
                    .long("no-block")
                    .help("Don't pause the target process while sampling"),
            )
            .arg(locals.clone())
            .arg(json.clone())
            .arg(full_filenames.clone())
            .arg(native.clone())
            .arg(native_all.clone())
            .arg(native_last.clone())
            .group(clap::ArgGroup::new("native_flags").args(&["native", "native_all", "native_last"]).multiple(false))
            .arg(exhaustive.clone())
            .arg(self_attach.clone())
            .arg(nolineno.clone());

        let core = Command::new("core")
            .about("Reads Python call stacks out of a saved core dump")
            .arg(
                Arg::new("corefile")
                    .value_name("corefile")
                    .help("Path to the core file (may be gzip-compressed)")
                    .required(true)
                    .takes_value(true),
            )
            .arg(
                Arg::new("executable")
                    .value_name("executable")
                    .help("Path to the python executable, when the core's own record of it can't be trusted")
                    .takes_value(true),
            )
            .arg(locals.clone())
            .arg(json.clone())
            .arg(full_filenames.clone())
            .arg(native.clone())
            .arg(native_all.clone())
            .arg(native_last.clone())
            .group(clap::ArgGroup::new("native_flags_core").args(&["native", "native_all", "native_last"]).multiple(false))
            .arg(exhaustive.clone())
            .arg(self_attach.clone())
            .arg(lib_search_path.clone())
            .arg(lib_search_root.clone())
            .arg(nolineno.clone());

        let app = Command::new(crate_name!())
            .version(crate_version!())
            .about(crate_description!())
            .subcommand_required(true)
            .infer_subcommands(true)
            .arg_required_else_help(true)
            .arg(Arg::new("no_color").long("no-color").global(true).help("Disable colored output"))
            .arg(
                Arg::new("verbose")
                    .short('v')
                    .long("verbose")
                    .global(true)
                    .multiple_occurrences(true)
                    .help("Increase logging verbosity (-v, -vv)"),
            )
            .subcommand(remote)
            .subcommand(core);

        let matches = app.try_get_matches_from(args)?;
        info!("Command line args: {:?}", matches);

        let mut config = Config::default();
        config.no_color = matches.is_present("no_color");
        config.verbosity = matches.occurrences_of("verbose") as u8;

        let (subcommand, sub) = matches.subcommand().unwrap();
        match subcommand {
            "remote" => {
                let pid: Pid = sub.value_of_t("pid")?;
                config.target = Target::Remote { pid };
                config.blocking = if sub.occurrences_of("no_block") > 0 {
                    LockingStrategy::NonBlocking
                } else {
                    LockingStrategy::Lock
                };
            }
            "core" => {
                let corefile = sub.value_of("corefile").unwrap().to_owned();
                let executable = sub.value_of("executable").map(|s| s.to_owned());
                config.target = Target::Core { corefile, executable };
                config.blocking = LockingStrategy::NonBlocking;
                config.lib_search_path = sub
                    .values_of("lib_search_path")
                    .map(|vs| vs.map(PathBuf::from).collect())
                    .unwrap_or_default();
                config.lib_search_root = sub.value_of("lib_search_root").map(PathBuf::from);
            }
            other => unreachable!("unknown subcommand {other}"),
        }

        config.dump_locals = sub.occurrences_of("locals");
        config.dump_json = sub.occurrences_of("json") > 0;
        config.full_filenames = sub.occurrences_of("full_filenames") > 0;
        config.native_mode = if sub.occurrences_of("native_last") > 0 {
            NativeMode::NativeLast
        } else if sub.occurrences_of("native") > 0 || sub.occurrences_of("native_all") > 0 {
            NativeMode::Interleaved
        } else {
            NativeMode::Off
        };
        config.exhaustive = sub.occurrences_of("exhaustive") > 0;
        config.self_attach = sub.occurrences_of("self_attach") > 0;
        config.lineno = if sub.occurrences_of("nolineno") > 0 { LineNo::NoLine } else { LineNo::LastInstruction };

        Ok(config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn get_config(cmd: &str) -> clap::Result<Config> {
        let args: Vec<String> = cmd.split_whitespace().map(|x| x.to_owned()).collect();
        Config::from_args(&args)
    }

    #[test]
    fn test_remote_defaults_to_blocking() {
        let config = get_config("py-stackprobe remote 1234").unwrap();
        assert_eq!(config.blocking, LockingStrategy::Lock);
        match config.target {
            Target::Remote { pid } => assert_eq!(pid, 1234),
            _ => panic!("expected a remote target"),
        }
    }

    #[test]
    fn test_remote_no_block_flag() {
        let config = get_config("py-stackprobe remote --no-block 1234").unwrap();
        assert_eq!(config.blocking, LockingStrategy::NonBlocking);
    }

    #[test]
    fn test_remote_native_flag_is_interleaved() {
        let config = get_config("py-stackprobe remote --native 1234").unwrap();
        assert_eq!(config.native_mode, NativeMode::Interleaved);
    }

    #[test]
    fn test_remote_native_all_flag_is_interleaved() {
        let config = get_config("py-stackprobe remote --native-all 1234").unwrap();
        assert_eq!(config.native_mode, NativeMode::Interleaved);
    }

    #[test]
    fn test_remote_native_last_flag() {
        let config = get_config("py-stackprobe remote --native-last 1234").unwrap();
        assert_eq!(config.native_mode, NativeMode::NativeLast);
    }

    #[test]
    fn test_remote_native_flags_are_mutually_exclusive() {
        assert_eq!(
            get_config("py-stackprobe remote --native --native-last 1234").unwrap_err().kind,
            clap::ErrorKind::ArgumentConflict
        );
    }

    #[test]
    fn test_remote_defaults_native_off() {
        let config = get_config("py-stackprobe remote 1234").unwrap();
        assert_eq!(config.native_mode, NativeMode::Off);
    }

    #[test]
    fn test_remote_missing_pid_is_an_error() {
        assert_eq!(
            get_config("py-stackprobe remote").unwrap_err().kind,
            clap::ErrorKind::MissingRequiredArgument
        );
    }

    #[test]
    fn test_core_with_executable_and_search_paths() {
        let config = get_config(
            "py-stackprobe core /tmp/core.1234 /usr/bin/python3.10 --lib-search-path /opt/lib --lib-search-path /opt/lib2",
        )
        .unwrap();
        match config.target {
            Target::Core { corefile, executable } => {
                assert_eq!(corefile, "/tmp/core.1234");
                assert_eq!(executable.as_deref(), Some("/usr/bin/python3.10"));
            }
            _ => panic!("expected a core target"),
        }
        assert_eq!(config.lib_search_path.len(), 2);
        assert_eq!(config.blocking, LockingStrategy::NonBlocking);
    }

    #[test]
    fn test_locals_verbosity_counts_occurrences() {
        let config = get_config("py-stackprobe remote -ll 1234").unwrap();
        assert_eq!(config.dump_locals, 2);
    }

    #[test]
    fn test_unrecognized_subcommand_is_an_error() {
        assert_eq!(
            get_config("py-stackprobe dude").unwrap_err().kind,
            clap::ErrorKind::UnrecognizedSubcommand
        );
    }
}
