#[macro_use]
extern crate anyhow;
#[macro_use]
extern crate log;

use std::path::PathBuf;

use anyhow::Error;

use py_stackprobe::config::{Config, Target};
use py_stackprobe::{dump, engine};

#[cfg(unix)]
fn permission_denied(err: &Error) -> bool {
    err.chain().any(|cause| {
        if let Some(ioerror) = cause.downcast_ref::<std::io::Error>() {
            ioerror.kind() == std::io::ErrorKind::PermissionDenied
        } else if let Some(remoteprocess::Error::IOError(ioerror)) = cause.downcast_ref::<remoteprocess::Error>() {
            ioerror.kind() == std::io::ErrorKind::PermissionDenied
        } else {
            false
        }
    })
}

/// Decompresses a gzip-suffixed core file to a temp path so `engine::inspect_core`
/// always sees a plain, mmap'able file; returns the path to read (either the
/// original, or the decompressed temp copy which must outlive the inspection).
fn maybe_decompress(path: &str) -> Result<(PathBuf, Option<tempfile::NamedTempFile>), Error> {
    if !path.ends_with(".gz") {
        return Ok((PathBuf::from(path), None));
    }
    let mut decoder = flate2::read::GzDecoder::new(std::fs::File::open(path)?);
    let mut tmp = tempfile::NamedTempFile::new()?;
    std::io::copy(&mut decoder, tmp.as_file_mut())?;
    let tmp_path = tmp.path().to_path_buf();
    Ok((tmp_path, Some(tmp)))
}

fn stackprobe_main() -> Result<(), Error> {
    let config = Config::from_commandline();

    #[cfg(target_os = "macos")]
    {
        if unsafe { libc::geteuid() } != 0 {
            eprintln!("This program requires root on OSX.");
            eprintln!("Try running again with elevated permissions by going 'sudo !!'");
            std::process::exit(1)
        }
    }

    let traces = match &config.target {
        Target::Remote { pid } => engine::inspect_live(*pid, &config)?,
        Target::Core { corefile, executable } => {
            let (path, _guard) = maybe_decompress(corefile)?;
            let hint = executable.as_ref().map(PathBuf::from);
            engine::inspect_core(&path, hint.as_deref(), &config)?
        }
    };

    dump::print_traces(&traces, &config)
}

fn main() {
    let mut builder = env_logger::builder();
    builder.format_timestamp_nanos();
    let level = match std::env::args().any(|a| a == "-vv") {
        true => log::LevelFilter::Trace,
        false if std::env::args().any(|a| a == "-v") => log::LevelFilter::Debug,
        false => log::LevelFilter::Info,
    };
    builder.filter_level(level);
    let _ = builder.try_init();

    if console::colors_enabled() && std::env::args().any(|a| a == "--no-color") {
        console::set_colors_enabled(false);
    }

    if let Err(err) = stackprobe_main() {
        #[cfg(unix)]
        {
            if permission_denied(&err) {
                if unsafe { libc::geteuid() } != 0 {
                    eprintln!("Permission Denied: Try running again with elevated permissions by going 'sudo env \"PATH=$PATH\" !!'");
                    std::process::exit(1);
                }

                #[cfg(target_os = "linux")]
                if let Ok(cgroups) = std::fs::read_to_string("/proc/self/cgroup") {
                    if cgroups.contains("/docker/") {
                        eprintln!("Permission Denied");
                        eprintln!(
                            "\nIt looks like you are running in a docker container. Please make sure \
                            you started your container with the SYS_PTRACE capability."
                        );
                        std::process::exit(1);
                    }
                }
            }
        }

        let exit_code = err
            .downcast_ref::<py_stackprobe::errors::EngineError>()
            .map(|e| e.exit_code())
            .unwrap_or(1);

        eprintln!("Error: {}", err);
        for (i, suberror) in err.chain().enumerate() {
            if i > 0 {
                eprintln!("Reason: {}", suberror);
            }
        }
        std::process::exit(exit_code);
    }
}
